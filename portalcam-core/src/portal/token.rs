//! Correlation tokens and the broker object paths derived from them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const TOKEN_PREFIX: &str = "portalcam";
const REQUEST_ROOT: &str = "/org/freedesktop/portal/desktop/request";
const SESSION_ROOT: &str = "/org/freedesktop/portal/desktop/session";

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Issues process-unique handle tokens.
///
/// Tokens combine the wall-clock second with a process-wide counter, so
/// two requests never share one even within the same second.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenGenerator;

impl TokenGenerator {
    pub fn next(&self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{TOKEN_PREFIX}_{secs}_{n}")
    }
}

/// Bus unique name as it appears in object paths: `:1.42` → `1_42`.
pub fn sanitize_sender(unique_name: &str) -> String {
    unique_name.trim_start_matches(':').replace('.', "_")
}

/// Object path of the request object the broker creates for `token`.
pub fn request_path(unique_name: &str, token: &str) -> String {
    format!("{REQUEST_ROOT}/{}/{token}", sanitize_sender(unique_name))
}

/// Object path of the session the broker creates for `session_token`.
pub fn session_path(unique_name: &str, session_token: &str) -> String {
    format!("{SESSION_ROOT}/{}/{session_token}", sanitize_sender(unique_name))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn tokens_are_unique() {
        let tokens = TokenGenerator;
        let seen: HashSet<String> = (0..1000).map(|_| tokens.next()).collect();
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn token_shape() {
        let token = TokenGenerator.next();
        let parts: Vec<&str> = token.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "portalcam");
        assert!(parts[1].parse::<u64>().is_ok());
        assert!(parts[2].parse::<u32>().is_ok());
    }

    #[test]
    fn sender_is_sanitized() {
        assert_eq!(sanitize_sender(":1.42"), "1_42");
        assert_eq!(sanitize_sender("1.7.3"), "1_7_3");
    }

    #[test]
    fn derived_paths() {
        assert_eq!(
            request_path(":1.42", "portalcam_1_0"),
            "/org/freedesktop/portal/desktop/request/1_42/portalcam_1_0"
        );
        assert_eq!(
            session_path(":1.42", "portalcam_1_1"),
            "/org/freedesktop/portal/desktop/session/1_42/portalcam_1_1"
        );
    }
}
