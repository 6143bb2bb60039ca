use adjutant_types::Event;

/// Verify the shared secret an inbound event carries. The comparison is
/// byte-exact; an event with a missing or mismatched signature must be
/// dropped before any other processing.
pub fn verify_event_signature(event: &Event, expected_secret: &str) -> bool {
    if expected_secret.is_empty() {
        // Adapter runs in trusted mode (e.g. events originate from our own
        // outbound long-poll); nothing to compare.
        return true;
    }
    match event.signature.as_deref() {
        Some(signature) => signature.as_bytes() == expected_secret.as_bytes(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_types::{ChatInfo, EventKind};

    fn event(signature: Option<&str>) -> Event {
        Event {
            kind: EventKind::Message,
            platform: "telegram".to_string(),
            chat: ChatInfo {
                id: "42".to_string(),
                chat_type: "private".to_string(),
                title: None,
            },
            author: None,
            message: None,
            callback: None,
            signature: signature.map(ToString::to_string),
            raw: None,
        }
    }

    #[test]
    fn matching_secret_passes() {
        assert!(verify_event_signature(&event(Some("s3cret")), "s3cret"));
    }

    #[test]
    fn missing_or_wrong_secret_fails() {
        assert!(!verify_event_signature(&event(None), "s3cret"));
        assert!(!verify_event_signature(&event(Some("other")), "s3cret"));
    }

    #[test]
    fn empty_expected_secret_trusts_adapter() {
        assert!(verify_event_signature(&event(None), ""));
    }
}
