//! Title helpers: provider samples and the deterministic fallback.

/// Longest title the portal renders without wrapping.
pub const MAX_TITLE_CHARS: usize = 40;

/// Title used when there is no text to derive one from.
pub const UNTITLED: &str = "Untitled theme";

/// Deterministic title derived from the first sample text.
///
/// Collapses whitespace and truncates to [`MAX_TITLE_CHARS`] characters,
/// ending with `…` when anything was cut.
///
/// ```rust
/// use opinion_themes_core::title::fallback_title;
///
/// assert_eq!(fallback_title(&["  More   bike lanes ".to_string()]), "More bike lanes");
/// assert_eq!(fallback_title(&[]), "Untitled theme");
/// ```
pub fn fallback_title(sample_texts: &[String]) -> String {
    let first = sample_texts
        .iter()
        .map(|t| collapse_whitespace(t))
        .find(|t| !t.is_empty());

    match first {
        Some(text) => truncate_chars(&text, MAX_TITLE_CHARS),
        None => UNTITLED.to_string(),
    }
}

/// Clean a provider-generated title.
///
/// Strips surrounding quotes and trailing periods, keeps the first line,
/// and enforces [`MAX_TITLE_CHARS`]. Returns `None` when nothing usable
/// remains.
pub fn normalize_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .trim_start_matches(|c: char| c == '"' || c == '\'' || c == '“')
        .trim_end_matches(|c: char| c == '"' || c == '\'' || c == '”' || c == '.');
    let line = line.strip_prefix("Title:").unwrap_or(line);
    let cleaned = collapse_whitespace(line);
    if cleaned.is_empty() {
        return None;
    }
    Some(truncate_chars(&cleaned, MAX_TITLE_CHARS))
}

/// Texts sent to the provider for a cluster of `texts.len()` members.
///
/// Takes the first `max` texts (members are already oldest first).
pub fn sample_texts(texts: &[String], max: usize) -> Vec<String> {
    texts.iter().take(max.max(1)).cloned().collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}
