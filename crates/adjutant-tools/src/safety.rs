//! Auto-approval predicates for gated tools.
//!
//! A gated call runs immediately only when its input is provably harmless:
//! read-only shell verbs, GET requests, and paths that stay inside the
//! allowed roots. Paths are canonicalized lexically (`..` resolved) before
//! any check. Everything else goes to the owner for confirmation.

use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde_json::Value;

use crate::SafetyTier;

/// Verdict for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Safe tier, or a gated call that passed the auto-approval predicate.
    RunNow,
    /// Gated call that needs owner confirmation.
    NeedsApproval,
    /// Forbidden tier; never executes.
    Forbidden,
}

/// Configurable parts of the predicate.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    /// Extra denylist patterns on top of the built-in ones.
    pub deny_patterns: Vec<String>,
    /// Roots filesystem paths must resolve into. Empty means any path needs
    /// approval.
    pub allowed_roots: Vec<PathBuf>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            deny_patterns: Vec::new(),
            allowed_roots: vec![PathBuf::from(".")],
        }
    }
}

const BUILTIN_DENY: &[&str] = &["rm -rf", "dd if=", "mkfs", "shutdown", "reboot"];

const READ_ONLY_VERBS: &[&str] = &[
    "ls", "cat", "head", "tail", "grep", "rg", "find", "ps", "df", "du", "free", "uptime",
    "whoami", "date", "echo", "pwd", "stat", "which", "uname", "wc", "env",
];

const SENSITIVE_PATHS: &[&str] = &[
    "/etc/shadow",
    "/etc/sudoers",
    "/etc/passwd",
    ".ssh",
    ".gnupg",
    ".aws",
    "id_rsa",
    "id_ed25519",
];

pub struct SafetyGate {
    deny_regexes: Vec<Regex>,
    allowed_roots: Vec<PathBuf>,
}

impl SafetyGate {
    pub fn new(policy: SafetyPolicy) -> Self {
        let deny_regexes = policy
            .deny_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("ignoring invalid deny pattern `{pattern}`: {e}");
                    None
                }
            })
            .collect();
        Self {
            deny_regexes,
            allowed_roots: policy.allowed_roots,
        }
    }

    /// Evaluate one call. The tier decides the branch; only gated calls reach
    /// the predicate.
    pub fn evaluate(&self, tier: SafetyTier, args: &Value) -> GateDecision {
        match tier {
            SafetyTier::Safe => GateDecision::RunNow,
            SafetyTier::Forbidden => GateDecision::Forbidden,
            SafetyTier::Gated => {
                if self.auto_approve(args) {
                    GateDecision::RunNow
                } else {
                    GateDecision::NeedsApproval
                }
            }
        }
    }

    /// The predicate: every recognized risky facet of the input must pass.
    /// Inputs with no recognized facet are never auto-approved.
    fn auto_approve(&self, args: &Value) -> bool {
        let mut checked_any = false;

        if let Some(command) = args.get("command").and_then(|v| v.as_str()) {
            checked_any = true;
            if !self.command_is_read_only(command) {
                return false;
            }
        }
        if let Some(path) = args.get("path").and_then(|v| v.as_str()) {
            checked_any = true;
            if !self.path_is_allowed(path) {
                return false;
            }
        }
        if args.get("url").is_some() {
            checked_any = true;
            let method = args
                .get("method")
                .and_then(|v| v.as_str())
                .unwrap_or("GET");
            if !method.eq_ignore_ascii_case("get") {
                return false;
            }
        }

        checked_any
    }

    fn command_is_read_only(&self, command: &str) -> bool {
        if BUILTIN_DENY.iter().any(|needle| command.contains(needle)) {
            return false;
        }
        if self.deny_regexes.iter().any(|re| re.is_match(command)) {
            return false;
        }
        // Output redirection writes to the filesystem.
        if command.contains('>') {
            return false;
        }
        // Every pipeline segment must start with a read-only verb.
        command
            .split(|c| c == '|' || c == ';')
            .flat_map(|segment| segment.split("&&"))
            .all(|segment| {
                match segment.split_whitespace().next() {
                    Some(verb) => READ_ONLY_VERBS.contains(&verb),
                    None => true, // empty segment from trailing separator
                }
            })
    }

    fn path_is_allowed(&self, path: &str) -> bool {
        let normalized = normalize_path(Path::new(path));
        // A `..` surviving normalization means the path escapes its root.
        if normalized
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return false;
        }
        let as_text = normalized.to_string_lossy();
        if SENSITIVE_PATHS
            .iter()
            .any(|sensitive| as_text.contains(sensitive))
        {
            return false;
        }
        self.allowed_roots.iter().any(|root| {
            let root = normalize_path(root);
            if root.as_os_str().is_empty() {
                // `.` root: any relative path that stayed inside.
                !normalized.is_absolute()
            } else {
                normalized.starts_with(&root)
            }
        })
    }
}

/// Lexical canonicalization: resolve `.` and `..` without touching the
/// filesystem, so checks also work for paths that do not exist yet. A `..`
/// that would escape the path root keeps the path relative and marks it as
/// escaping (it will not match any allowed root).
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else {
                    out.push("..");
                }
            }
            other => {
                out.push(other);
                if matches!(other, Component::Normal(_)) {
                    depth += 1;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate() -> SafetyGate {
        SafetyGate::new(SafetyPolicy::default())
    }

    #[test]
    fn safe_tier_always_runs() {
        assert_eq!(
            gate().evaluate(SafetyTier::Safe, &json!({"command": "rm -rf /"})),
            GateDecision::RunNow
        );
    }

    #[test]
    fn forbidden_tier_never_runs() {
        assert_eq!(
            gate().evaluate(SafetyTier::Forbidden, &json!({})),
            GateDecision::Forbidden
        );
    }

    #[test]
    fn read_only_command_auto_approves() {
        let decision = gate().evaluate(SafetyTier::Gated, &json!({"command": "df -h | grep sda"}));
        assert_eq!(decision, GateDecision::RunNow);
    }

    #[test]
    fn destructive_command_needs_approval() {
        for command in ["rm -rf /tmp/x", "dd if=/dev/zero of=/dev/sda", "shutdown now"] {
            let decision = gate().evaluate(SafetyTier::Gated, &json!({ "command": command }));
            assert_eq!(decision, GateDecision::NeedsApproval, "{command}");
        }
    }

    #[test]
    fn redirection_needs_approval() {
        let decision =
            gate().evaluate(SafetyTier::Gated, &json!({"command": "cat a.log > b.log"}));
        assert_eq!(decision, GateDecision::NeedsApproval);
    }

    #[test]
    fn custom_deny_pattern_applies() {
        let gate = SafetyGate::new(SafetyPolicy {
            deny_patterns: vec!["curl .*--data".to_string()],
            ..SafetyPolicy::default()
        });
        // `curl` is not a read-only verb anyway; check the regex path via a
        // read-only verb carrying the pattern.
        let decision = gate.evaluate(
            SafetyTier::Gated,
            &json!({"command": "echo curl http://x --data y"}),
        );
        assert_eq!(decision, GateDecision::NeedsApproval);
    }

    #[test]
    fn get_requests_auto_approve_others_do_not() {
        assert_eq!(
            gate().evaluate(SafetyTier::Gated, &json!({"url": "https://example.com"})),
            GateDecision::RunNow
        );
        assert_eq!(
            gate().evaluate(
                SafetyTier::Gated,
                &json!({"url": "https://example.com", "method": "POST"})
            ),
            GateDecision::NeedsApproval
        );
    }

    #[test]
    fn traversal_out_of_root_needs_approval() {
        let decision = gate().evaluate(
            SafetyTier::Gated,
            &json!({"path": "workspace/../../etc/passwd"}),
        );
        assert_eq!(decision, GateDecision::NeedsApproval);
    }

    #[test]
    fn sensitive_path_needs_approval_even_inside_root() {
        let decision = gate().evaluate(SafetyTier::Gated, &json!({"path": "./.ssh/config"}));
        assert_eq!(decision, GateDecision::NeedsApproval);
    }

    #[test]
    fn path_inside_allowed_root_auto_approves() {
        let decision = gate().evaluate(SafetyTier::Gated, &json!({"path": "./notes/today.md"}));
        assert_eq!(decision, GateDecision::RunNow);
    }

    #[test]
    fn unrecognized_input_shape_needs_approval() {
        let decision = gate().evaluate(SafetyTier::Gated, &json!({"target": "prod"}));
        assert_eq!(decision, GateDecision::NeedsApproval);
    }
}
