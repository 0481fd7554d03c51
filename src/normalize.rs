//! Telemetry normalization.
//!
//! Pure functions applied to raw request material before it is persisted:
//! URL canonicalization, user-agent sanitization, parameter digests, cookie
//! redaction, and auth-key fingerprinting. Everything here is deterministic
//! and idempotent so replayed events normalize to identical rows.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// User-agent strings are truncated to this many bytes after escaping.
const MAX_USER_AGENT_BYTES: usize = 512;

/// Parameter values longer than this are pre-hashed inside the digest.
const MAX_PARAM_VALUE_BYTES: usize = 100;

/// Cookie names matching this pattern have their values redacted.
static SENSITIVE_COOKIE_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)((?:session|token|auth|jwt|csrf|sess|password)[^=;]*)=([^;]*)")
        .expect("sensitive cookie pattern is valid")
});

/// Canonicalize a request path for consistent logging.
///
/// Collapses duplicate slashes, strips the trailing slash unless the path is
/// the root, and drops the query string for idempotent methods. The function
/// is a projection: `normalize_url(normalize_url(u, m), m) == normalize_url(u, m)`.
pub fn normalize_url(url: &str, method: &str) -> String {
    let mut url = url.to_string();

    // Query strings on idempotent methods carry no billing signal and often
    // carry secrets; drop them before anything else.
    if matches!(method.to_ascii_uppercase().as_str(), "GET" | "HEAD" | "OPTIONS") {
        if let Some(idx) = url.find('?') {
            url.truncate(idx);
        }
    }

    // Collapse runs of slashes to a single separator.
    let mut collapsed = String::with_capacity(url.len());
    let mut prev_slash = false;
    for c in url.chars() {
        if c == '/' {
            if !prev_slash {
                collapsed.push(c);
            }
            prev_slash = true;
        } else {
            collapsed.push(c);
            prev_slash = false;
        }
    }

    // Strip trailing slash unless the whole path is the root.
    if collapsed.len() > 1 && collapsed.ends_with('/') {
        collapsed.pop();
    }

    collapsed
}

/// HTML-entity-escape a user agent and truncate to 512 bytes.
pub fn sanitize_user_agent(user_agent: &str) -> String {
    let mut sanitized = user_agent
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;");

    if sanitized.len() > MAX_USER_AGENT_BYTES {
        let mut cut = MAX_USER_AGENT_BYTES;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
    }

    sanitized
}

/// Digest of request parameters for anomaly correlation.
///
/// Keys are sorted for a deterministic representation; string values longer
/// than 100 bytes are replaced by an 8-byte hash stub before the final
/// digest. Returns 16 bytes of SHA-256, hex encoded, or an empty string for
/// empty input.
pub fn param_digest(params: &BTreeMap<String, serde_json::Value>) -> String {
    if params.is_empty() {
        return String::new();
    }

    let mut material = String::new();
    for (key, value) in params {
        material.push_str(key);
        material.push('=');
        match value {
            serde_json::Value::String(s) if s.len() > MAX_PARAM_VALUE_BYTES => {
                let hash = Sha256::digest(s.as_bytes());
                material.push_str(&hex::encode(&hash[..8]));
            }
            serde_json::Value::String(s) => material.push_str(s),
            other => material.push_str(&other.to_string()),
        }
        material.push(';');
    }

    let hash = Sha256::digest(material.as_bytes());
    hex::encode(&hash[..16])
}

/// Redact values of sensitive cookies while preserving structure.
pub fn sanitize_cookies(cookies: &str) -> String {
    if cookies.is_empty() {
        return String::new();
    }
    SENSITIVE_COOKIE_RE
        .replace_all(cookies, "$1=***")
        .into_owned()
}

/// 16-byte SHA-256 prefix of the auth key, hex encoded. Empty in, empty out.
pub fn auth_key_fingerprint(auth_key: &str) -> String {
    if auth_key.is_empty() {
        return String::new();
    }
    let hash = Sha256::digest(auth_key.as_bytes());
    hex::encode(&hash[..16])
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("/v1//chat/completions/", "POST", "/v1/chat/completions")]
    #[case("/v1/models?key=secret", "GET", "/v1/models")]
    #[case("/v1/models?key=secret", "POST", "/v1/models?key=secret")]
    #[case("/", "GET", "/")]
    #[case("///", "GET", "/")]
    #[case("", "GET", "")]
    fn url_normalization(#[case] url: &str, #[case] method: &str, #[case] expected: &str) {
        assert_eq!(normalize_url(url, method), expected);
    }

    #[rstest]
    #[case("/v1//a///b/", "GET")]
    #[case("/v1/models?x=1&y=2", "GET")]
    #[case("/deep//path//", "POST")]
    fn url_normalization_is_idempotent(#[case] url: &str, #[case] method: &str) {
        let once = normalize_url(url, method);
        assert_eq!(normalize_url(&once, method), once);
    }

    #[test]
    fn user_agent_escapes_and_truncates() {
        let ua = sanitize_user_agent("Mozilla <script>alert('x')</script>");
        assert!(!ua.contains('<'));
        assert!(!ua.contains('\''));
        assert!(ua.contains("&lt;script&gt;"));

        let long = "a".repeat(1000);
        assert_eq!(sanitize_user_agent(&long).len(), 512);

        // Truncation never splits a multi-byte character.
        let multibyte = "é".repeat(400);
        let out = sanitize_user_agent(&multibyte);
        assert!(out.len() <= 512);
        assert!(out.is_char_boundary(out.len()));
    }

    #[test]
    fn param_digest_is_order_independent_and_stable() {
        let mut a = BTreeMap::new();
        a.insert("model".to_string(), serde_json::json!("gpt-x"));
        a.insert("stream".to_string(), serde_json::json!(true));

        let mut b = BTreeMap::new();
        b.insert("stream".to_string(), serde_json::json!(true));
        b.insert("model".to_string(), serde_json::json!("gpt-x"));

        let da = param_digest(&a);
        assert_eq!(da, param_digest(&b));
        assert_eq!(da.len(), 32);
        assert_eq!(param_digest(&BTreeMap::new()), "");
    }

    #[test]
    fn param_digest_prehashes_long_values() {
        let mut short = BTreeMap::new();
        short.insert("prompt".to_string(), serde_json::json!("x".repeat(100)));
        let mut long = BTreeMap::new();
        long.insert("prompt".to_string(), serde_json::json!("x".repeat(101)));
        // Both still digest, and to different values.
        assert_ne!(param_digest(&short), param_digest(&long));
    }

    #[rstest]
    #[case("session_id=abc123; theme=dark", "session_id=***; theme=dark")]
    #[case("AUTH-TOKEN=xyz", "AUTH-TOKEN=***")]
    #[case("jwt=a.b.c; csrf_token=q", "jwt=***; csrf_token=***")]
    #[case("theme=dark; lang=en", "theme=dark; lang=en")]
    #[case("", "")]
    fn cookie_redaction(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_cookies(input), expected);
    }

    #[test]
    fn auth_fingerprint_is_stable_prefix() {
        let fp = auth_key_fingerprint("sk-test-key");
        assert_eq!(fp.len(), 32);
        assert_eq!(fp, auth_key_fingerprint("sk-test-key"));
        assert_ne!(fp, auth_key_fingerprint("sk-other-key"));
        assert_eq!(auth_key_fingerprint(""), "");
    }
}
