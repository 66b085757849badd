// =============================================================================
// PII redaction — applied to user input and tool-result serializations
// =============================================================================

use std::sync::OnceLock;

use regex::Regex;

/// Replace email addresses and phone-like digit runs before text reaches the
/// model transcript or the event stream.
pub fn redact_pii(text: &str) -> String {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    static PHONE: OnceLock<Regex> = OnceLock::new();
    let email = EMAIL.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
    });
    let phone = PHONE
        .get_or_init(|| Regex::new(r"\b\+?\d[\d\-\s()]{9,}\d\b").expect("valid regex"));

    let redacted = email.replace_all(text, "[redacted_email]");
    phone.replace_all(&redacted, "[redacted_phone]").into_owned()
}
