//! Classification of agent failures from their output text.

use std::sync::LazyLock;

use regex::Regex;

static SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)session[-_]?id[:\s]+([0-9a-f][0-9a-f-]{5,})")
        .expect("session id regex should be valid")
});

/// Substrings (lowercase) that indicate the primary credential cannot be used.
const AUTH_FAILURE_SIGNATURES: &[&str] = &[
    "unauthorized",
    "authentication",
    "invalid api key",
    "billing",
    "quota",
    "credit balance",
    "payment required",
    "subscription",
    "login required",
    "please run /login",
    "not logged in",
];

/// Substrings (lowercase) that indicate a transient rate limit.
const RATE_LIMIT_SIGNATURES: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "overloaded",
    "429",
    "529",
];

fn contains_any(text: &str, needles: &[&'static str]) -> Option<&'static str> {
    let lower = text.to_lowercase();
    needles.iter().find(|needle| lower.contains(**needle)).copied()
}

/// The auth/billing signature found in `text`, if any.
pub fn auth_failure_signature(text: &str) -> Option<&'static str> {
    contains_any(text, AUTH_FAILURE_SIGNATURES)
}

/// The rate-limit signature found in `text`, if any.
pub fn rate_limit_signature(text: &str) -> Option<&'static str> {
    contains_any(text, RATE_LIMIT_SIGNATURES)
}

/// Extract a session id from text such as `session_id: 3f2a-…`.
pub fn extract_session_id(text: &str) -> Option<String> {
    SESSION_ID_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_signatures_match_case_insensitively() {
        assert_eq!(
            auth_failure_signature("Billing issue detected"),
            Some("billing")
        );
        assert_eq!(
            auth_failure_signature("Error: Invalid API key provided"),
            Some("invalid api key")
        );
        assert_eq!(
            auth_failure_signature("Please run /login first"),
            Some("please run /login")
        );
        assert_eq!(auth_failure_signature("segmentation fault"), None);
    }

    #[test]
    fn rate_limit_signatures() {
        assert_eq!(
            rate_limit_signature("API Error: 429 Too Many Requests"),
            Some("too many requests")
        );
        assert_eq!(rate_limit_signature("Overloaded"), Some("overloaded"));
        assert_eq!(rate_limit_signature("all good"), None);
    }

    #[test]
    fn session_id_variants() {
        assert_eq!(
            extract_session_id("Session-ID: 4f1c9e2a-0b7d-4c1e-9a55-1d2e3f4a5b6c"),
            Some("4f1c9e2a-0b7d-4c1e-9a55-1d2e3f4a5b6c".to_string())
        );
        assert_eq!(
            extract_session_id("resume with session-id abc123def"),
            Some("abc123def".to_string())
        );
        assert_eq!(
            extract_session_id("session_id:deadbeef"),
            Some("deadbeef".to_string())
        );
        assert_eq!(extract_session_id("no session here"), None);
    }
}
