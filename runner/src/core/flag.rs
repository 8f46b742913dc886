//! Success-token detection over decoded text.

use std::sync::LazyLock;

use regex::Regex;

/// Tags recognized in front of a `{...}` body, matched case-insensitively.
pub const FLAG_TAGS: [&str; 3] = ["flag", "ctf", "picoCTF"];

static FLAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    let tags = FLAG_TAGS
        .iter()
        .map(|tag| regex::escape(tag))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)(?:{tags})\{{[^}}\n]+\}}")).expect("flag pattern should compile")
});

/// Return the leftmost flag-shaped substring of `text`, as written.
pub fn find_flag(text: &str) -> Option<String> {
    FLAG_RE.find(text).map(|m| m.as_str().to_string())
}

/// Scan stdout before stderr; the first hit wins.
pub fn scan_streams(stdout: &str, stderr: &str) -> Option<String> {
    find_flag(stdout).or_else(|| find_flag(stderr))
}
