// Clean manual and log text before it is embedded in a stage prompt.
// Removes invisible Unicode and control characters, and defuses anything
// that looks like one of the prompt's own section tags.

use std::sync::LazyLock;

use regex::Regex;

/// Section tags used by the stage prompts. Input text must never open or close one.
pub const SECTION_TAGS: &[&str] = &[
    "manual",
    "manual_rules",
    "log_evidence",
    "log_verdict",
    "code_context",
    "code_insight",
    "keyword_hints",
    "previous_response",
];

static SECTION_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    let names = SECTION_TAGS.join("|");
    Regex::new(&format!(r"(?i)<(/?\s*(?:{names})\b)")).expect("valid static regex")
});

/// Sanitize text for prompt embedding. Line structure is preserved so
/// evidence line numbers stay meaningful.
pub fn sanitize_for_prompt(raw: &str) -> String {
    neutralize_section_tags(&remove_invisible_chars(raw))
}

/// Remove zero-width, bidi-control and C0/C1 control characters.
/// Keeps `\n` and `\t`; `\r` is dropped so CRLF logs become LF.
pub fn remove_invisible_chars(text: &str) -> String {
    text.chars()
        .filter(|c| {
            if *c == '\n' || *c == '\t' {
                return true;
            }
            if matches!(
                *c,
                '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}'
            ) {
                return false;
            }
            !c.is_control()
        })
        .collect()
}

/// `<manual>` becomes `&lt;manual>`; other angle brackets (`LOCK -> UNLOCK`) are untouched.
pub fn neutralize_section_tags(text: &str) -> String {
    SECTION_TAG_RE.replace_all(text, "&lt;$1").into_owned()
}

/// Cut to at most `max_chars` characters on a char boundary, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (format!("{}\n…[TRUNCATED]", &text[..byte_idx]), true),
        None => (text.to_string(), false),
    }
}
