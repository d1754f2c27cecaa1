use regex::Regex;

use crate::AutopsyError;

pub const REDACTED: &str = "[REDACTED]";
pub const EMAIL_PLACEHOLDER: &str = "[EMAIL]";
pub const IP_PLACEHOLDER: &str = "[IP]";
pub const TRUNCATION_MARKER: &str = "... [TRUNCATED]";

const MAX_PASSES: usize = 4;

/// Replaces credential assignments, e-mail addresses, and IPv4 addresses with
/// fixed placeholders before query text is stored or shown.
#[derive(Debug, Clone)]
pub struct Redactor {
    assignment: Regex,
    email: Regex,
    ipv4: Regex,
}

impl Redactor {
    /// # Errors
    /// Returns [`AutopsyError::Configuration`] if a built-in pattern fails to compile.
    pub fn new() -> Result<Self, AutopsyError> {
        Ok(Self {
            assignment: compile(
                r#"(?i)(\w*(?:password|passwd|pwd|pass|token|api[_-]?key|secret|auth|session|nonce)\w*`?)\s*=\s*(?:'[^']*'|"[^"]*")"#,
            )?,
            email: compile(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")?,
            ipv4: compile(r"\b(?:\d{1,3}\.){3}\d{1,3}\b")?,
        })
    }

    /// Applies every pattern until the text stops changing.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let mut current = text.to_string();
        for _ in 0..MAX_PASSES {
            let next = self.redact_once(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// Redacts, then truncates to `max_chars` including the marker.
    #[must_use]
    pub fn sanitize(&self, text: &str, max_chars: usize) -> String {
        truncate(&self.redact(text), max_chars)
    }

    fn redact_once(&self, text: &str) -> String {
        let step = self
            .assignment
            .replace_all(text, format!("${{1}} = {REDACTED}").as_str());
        let step = self.email.replace_all(&step, EMAIL_PLACEHOLDER);
        self.ipv4.replace_all(&step, IP_PLACEHOLDER).into_owned()
    }
}

/// Cuts `text` so the result, marker included, is at most `max_chars` characters.
#[must_use]
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

fn compile(pattern: &str) -> Result<Regex, AutopsyError> {
    Regex::new(pattern)
        .map_err(|err| AutopsyError::Configuration(format!("invalid redaction pattern: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn redactor() -> Redactor {
        match Redactor::new() {
            Ok(value) => value,
            Err(err) => panic!("failed to build redactor: {err}"),
        }
    }

    #[test]
    fn credential_assignments_keep_their_key() {
        let out = redactor().redact(
            "UPDATE users SET user_pass = 'hunter2', api_key=\"abc\" WHERE session_token = 'x1'",
        );
        assert_eq!(
            out,
            "UPDATE users SET user_pass = [REDACTED], api_key = [REDACTED] WHERE session_token = [REDACTED]"
        );
    }

    #[test]
    fn nonce_and_backticked_columns_are_redacted() {
        let out = redactor().redact("SELECT * FROM t WHERE `nonce` = 'f00d' AND id = 3");
        assert_eq!(out, "SELECT * FROM t WHERE `nonce` = [REDACTED] AND id = 3");
    }

    #[test]
    fn emails_and_ipv4_addresses_are_replaced() {
        let out = redactor().redact(
            "INSERT INTO log VALUES ('jane.doe+shop@example.co.uk', '192.168.10.24')",
        );
        assert_eq!(out, "INSERT INTO log VALUES ('[EMAIL]', '[IP]')");
    }

    #[test]
    fn plain_sql_is_untouched() {
        let sql = "SELECT option_value FROM wp_options WHERE option_name = 'siteurl' LIMIT 1";
        assert_eq!(redactor().redact(sql), sql);
    }

    #[test]
    fn truncation_keeps_total_length_within_limit() {
        let long = "x".repeat(2000);
        let out = truncate(&long, 500);
        assert_eq!(out.chars().count(), 500);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(truncate(&out, 500), out);
    }

    #[test]
    fn truncation_respects_multibyte_characters() {
        let text = "é".repeat(100);
        let out = truncate(&text, 64);
        assert_eq!(out.chars().count(), 64);
    }

    fn fragment() -> impl Strategy<Value = String> {
        prop::sample::select(vec![
            "SELECT * FROM t WHERE ",
            "password = 'p@ss'",
            "token=\"abc\"",
            "auth_key = ''",
            "nonce='1.2.3.4'",
            "owner@example.org",
            "10.0.0.1",
            "1.2.",
            "@",
            "=",
            "'",
            "\"",
            " AND ",
            "42",
            ".",
            "secret",
        ])
        .prop_map(str::to_string)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(96))]

        #[test]
        fn prop_redaction_is_idempotent(parts in prop::collection::vec(fragment(), 0..12)) {
            let r = redactor();
            let text = parts.concat();
            let once = r.redact(&text);
            prop_assert_eq!(r.redact(&once), once);
        }

        #[test]
        fn prop_sanitize_never_exceeds_limit(text in ".{0,300}", limit in 64usize..200) {
            let out = redactor().sanitize(&text, limit);
            prop_assert!(out.chars().count() <= limit);
        }
    }
}
