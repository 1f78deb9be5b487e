//! Error redaction and stack sanitizing.
//!
//! Errors raised by host-side proxy actions are handed back to untrusted
//! script code. Before that happens connection details, file paths and
//! credentials are stripped, keeping the part a script author can act on.
//! Script stacks surfaced to the caller are trimmed of engine-internal frames.

use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s'")\]}>]+"#).unwrap());

static IP_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?").unwrap());

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run|boot|snap|nix)(/[\w.\-]+)+").unwrap()
});

static WINDOWS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]:\\[\w.\\\-]+").unwrap());

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|api_key\s*=\s*\S+|token\s*=\s*\S+|password\s*=\s*\S+|secret\s*=\s*\S+)",
    )
    .unwrap()
});

static JWT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").unwrap());

static PEM_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-----BEGIN[A-Z\s]+PRIVATE KEY-----[\s\S]*?-----END[A-Z\s]+PRIVATE KEY-----")
        .unwrap()
});

static HOST_STACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(at\s+.+|Caused by:.*|\.{3}\s*\d+\s*more)$").unwrap()
});

/// Engine-internal script names. Stack frames mentioning these are dropped.
const INTERNAL_FRAME_MARKERS: &[&str] = &["[hookline:", "ext:", "node:internal"];

/// Redact an error from a proxy action before the script sees it.
pub fn redact_error_for_script(action: &str, error: &str) -> String {
    format!(
        "proxy action '{}' failed: {}",
        action,
        redact_error_message(error)
    )
}

/// Strip credentials, URLs, addresses, paths and host stack frames.
pub fn redact_error_message(error: &str) -> String {
    let mut msg = error.to_string();

    msg = PEM_KEY_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = JWT_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = URL_RE.replace_all(&msg, "[url]").to_string();
    msg = IP_PORT_RE.replace_all(&msg, "[addr]").to_string();
    msg = WINDOWS_PATH_RE.replace_all(&msg, "[path]").to_string();
    msg = UNIX_PATH_RE.replace_all(&msg, "[path]").to_string();
    msg = HOST_STACK_RE.replace_all(&msg, "").to_string();

    let lines: Vec<&str> = msg.lines().filter(|l| !l.trim().is_empty()).collect();
    lines.join("\n")
}

/// Remove engine-internal frames from a script stack.
///
/// Returns `None` when nothing but internal frames (or nothing at all) remains.
pub fn sanitize_stack(stack: &str) -> Option<String> {
    let lines: Vec<&str> = stack
        .lines()
        .filter(|line| {
            !INTERNAL_FRAME_MARKERS
                .iter()
                .any(|marker| line.contains(marker))
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Strip the `Uncaught ` prefix V8 adds to exceptions escaping a script.
pub fn strip_uncaught(message: &str) -> &str {
    message
        .strip_prefix("Uncaught (in promise) ")
        .or_else(|| message.strip_prefix("Uncaught "))
        .unwrap_or(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_error_names_the_action() {
        let msg = redact_error_for_script("documentStore.collection.find", "unknown collection");
        assert_eq!(
            msg,
            "proxy action 'documentStore.collection.find' failed: unknown collection"
        );
    }

    #[test]
    fn redacts_urls_and_addresses() {
        let msg = redact_error_message("connect to http://db.internal:5432/x failed, 10.0.0.4:27017");
        assert!(!msg.contains("db.internal"));
        assert!(!msg.contains("10.0.0.4"));
        assert!(msg.contains("[url]"));
        assert!(msg.contains("[addr]"));
    }

    #[test]
    fn redacts_paths_and_credentials() {
        let msg = redact_error_message("open /home/app/secrets.json with password=hunter2");
        assert!(!msg.contains("/home/app"));
        assert!(!msg.contains("hunter2"));
    }

    #[test]
    fn keeps_plain_messages() {
        assert_eq!(
            redact_error_message("Template must contain content, name or shortid"),
            "Template must contain content, name or shortid"
        );
    }

    #[test]
    fn sanitize_drops_internal_frames() {
        let stack = "Error: boom\n    at beforeRender (script.js:3:11)\n    at invoke ([hookline:bootstrap]:120:9)\n    at ext:core/01_core.js:1:1";
        let clean = sanitize_stack(stack).unwrap();
        assert!(clean.contains("script.js:3:11"));
        assert!(!clean.contains("[hookline:bootstrap]"));
        assert!(!clean.contains("ext:core"));
    }

    #[test]
    fn sanitize_of_only_internal_frames_is_none() {
        assert!(sanitize_stack("    at x ([hookline:trigger]:1:1)").is_none());
    }

    #[test]
    fn strips_uncaught_prefixes() {
        assert_eq!(strip_uncaught("Uncaught Error: x"), "Error: x");
        assert_eq!(strip_uncaught("Uncaught (in promise) Error: x"), "Error: x");
        assert_eq!(strip_uncaught("Error: x"), "Error: x");
    }
}
