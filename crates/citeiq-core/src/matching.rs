use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Unescape the HTML entities that commonly leak into provider titles.
fn unescape_html(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
}

/// Transliterate Greek letters (NFKD doesn't convert these to ASCII).
fn transliterate_greek(text: &str) -> String {
    text.replace(['α', 'Α'], "alpha")
        .replace(['β', 'Β'], "beta")
        .replace(['γ', 'Γ'], "gamma")
        .replace(['δ', 'Δ'], "delta")
        .replace(['ε', 'Ε'], "epsilon")
        .replace(['θ', 'Θ'], "theta")
        .replace(['κ', 'Κ'], "kappa")
        .replace(['λ', 'Λ'], "lambda")
        .replace(['μ', 'Μ'], "mu")
        .replace(['π', 'Π'], "pi")
        .replace(['ρ', 'Ρ'], "rho")
        .replace(['σ', 'ς', 'Σ'], "sigma")
        .replace(['τ', 'Τ'], "tau")
        .replace(['φ', 'Φ'], "phi")
        .replace(['χ', 'Χ'], "chi")
        .replace(['ψ', 'Ψ'], "psi")
        .replace(['ω', 'Ω'], "omega")
}

/// Fold to lowercase ASCII words separated by single spaces.
///
/// Steps (order matters):
/// 1. Unescape HTML entities
/// 2. Transliterate Greek letters
/// 3. Unicode NFKD normalization (decomposes accents), strip to ASCII
/// 4. Lowercase, collapse every non-alphanumeric run into one space
pub fn normalize_words(text: &str) -> String {
    let text = unescape_html(text);
    let text = transliterate_greek(&text);
    let ascii: String = text.nfkd().filter(|c| c.is_ascii()).collect();
    NON_ALNUM
        .replace_all(&ascii.to_lowercase(), " ")
        .trim()
        .to_string()
}

/// Normalize title for comparison: lowercase alphanumeric only, no spaces.
pub fn normalize_title(title: &str) -> String {
    normalize_words(title).replace(' ', "")
}

/// Normalized word tokens of a text, as a set.
pub fn word_tokens(text: &str) -> BTreeSet<String> {
    normalize_words(text)
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Similarity of two titles in `[0, 1]` after normalization.
///
/// Two empty titles compare as identical; one empty title compares as
/// completely different.
pub fn title_similarity(title_a: &str, title_b: &str) -> f64 {
    let norm_a = normalize_title(title_a);
    let norm_b = normalize_title(title_b);
    match (norm_a.is_empty(), norm_b.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => rapidfuzz::fuzz::ratio(norm_a.chars(), norm_b.chars()),
    }
}

/// Comparison key for organization names: normalized words, with the
/// leading article dropped ("The University of X" == "University of X").
pub fn organization_key(name: &str) -> String {
    let words = normalize_words(name);
    words
        .strip_prefix("the ")
        .map(str::to_string)
        .unwrap_or(words)
}
