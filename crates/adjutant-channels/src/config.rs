use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Usernames (with or without `@`) or numeric ids allowed to talk to the
    /// agent. `*` allows everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Secret stamped onto events this adapter produces; the ingest layer
    /// verifies it byte-exact.
    #[serde(default)]
    pub shared_secret: String,
}

/// Match a sender against the allow list. Comparison ignores a leading `@`.
pub fn is_user_allowed(candidate: &str, allowed: &[String]) -> bool {
    let normalized = candidate.trim_start_matches('@');
    allowed.iter().any(|entry| {
        let entry = entry.trim_start_matches('@');
        entry == "*" || entry == normalized
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_with_or_without_at_prefix() {
        let allowed = vec!["@owner".to_string(), "12345".to_string()];
        assert!(is_user_allowed("owner", &allowed));
        assert!(is_user_allowed("@owner", &allowed));
        assert!(is_user_allowed("12345", &allowed));
        assert!(!is_user_allowed("stranger", &allowed));
    }

    #[test]
    fn wildcard_allows_everyone() {
        let allowed = vec!["*".to_string()];
        assert!(is_user_allowed("anyone", &allowed));
    }
}
