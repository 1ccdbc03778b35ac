use std::sync::OnceLock;

use regex::Regex;

pub const MAX_TEXT_CHARS: usize = 500;

fn disallowed_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[^\w\s\x{4e00}-\x{9fff}\-\(\)\[\]/]").expect("static pattern compiles")
    })
}

fn whitespace_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static pattern compiles"))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapses whitespace runs, trims, drops characters outside the allow-list and truncates
/// to [`MAX_TEXT_CHARS`] characters, in that order. Spaces that surrounded a dropped
/// symbol are kept.
pub fn clean_text(text: &str) -> String {
    let collapsed = whitespace_runs().replace_all(text, " ");
    let allowed = disallowed_chars().replace_all(collapsed.trim(), "");
    allowed.chars().take(MAX_TEXT_CHARS).collect()
}

/// Matching key: lower-cased, noise tokens replaced by spaces, whitespace collapsed.
/// Never shown to users.
pub fn normalize_name(name: &str, noise_tokens: &[String]) -> String {
    let mut normalized = name.to_lowercase();
    for token in noise_tokens.iter().filter(|t| !t.is_empty()) {
        normalized = normalized.replace(token.as_str(), " ");
    }
    collapse_whitespace(&normalized)
}
