use once_cell::sync::Lazy;
use std::collections::HashSet;

use crate::matching::normalize_words;

/// Common surname prefixes (case-insensitive).
static SURNAME_PREFIXES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "van", "von", "de", "del", "della", "der", "den", "di", "da", "dos", "du", "al", "el",
        "la", "le", "ben", "ibn", "mac", "mc", "o", "st",
    ]
    .into_iter()
    .collect()
});

/// Name suffixes to strip.
static NAME_SUFFIXES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["jr", "sr", "ii", "iii", "iv", "v"].into_iter().collect());

fn is_suffix(part: &str) -> bool {
    NAME_SUFFIXES.contains(part.to_lowercase().trim_end_matches('.'))
}

fn is_surname_prefix(part: &str) -> bool {
    SURNAME_PREFIXES.contains(part.to_lowercase().trim_end_matches('.'))
}

/// Extract surname from name parts, handling multi-word surnames and suffixes.
fn get_surname_from_parts(parts: &[&str]) -> String {
    let mut end = parts.len();
    while end >= 2 && is_suffix(parts[end - 1]) {
        end -= 1;
    }
    let parts = &parts[..end];

    let Some(last) = parts.last() else {
        return String::new();
    };

    // Three-part surnames like "De La Cruz"
    if parts.len() >= 3 && is_surname_prefix(parts[parts.len() - 3]) {
        return parts[parts.len() - 3..].join(" ");
    }

    // Two-part surnames like "Van Bavel"
    if parts.len() >= 2 && is_surname_prefix(parts[parts.len() - 2]) {
        return parts[parts.len() - 2..].join(" ");
    }

    last.to_string()
}

/// Springer "Surname Initial" format: last part is 1-2 uppercase letters.
fn is_trailing_initial(part: &str) -> bool {
    let part = part.trim_end_matches('.');
    !part.is_empty() && part.len() <= 2 && part.chars().all(|c| c.is_uppercase())
}

/// Get the surname from an author name string, as lowercase ASCII words.
///
/// Handles "Surname, Given", "Given Surname", "Surname G" and multi-word
/// surnames with particles.
pub fn get_last_name(name: &str) -> String {
    let name = name.trim();

    // "Surname, Initials" format
    if let Some((surname, _)) = name.split_once(',') {
        return normalize_words(surname);
    }

    let parts: Vec<&str> = name.split_whitespace().collect();
    if parts.len() >= 2 && is_trailing_initial(parts[parts.len() - 1]) {
        return normalize_words(&parts[..parts.len() - 1].join(" "));
    }

    normalize_words(&get_surname_from_parts(&parts))
}

/// First initial of the given name, lowercase ASCII, if one can be found.
fn first_initial(name: &str) -> Option<char> {
    let name = name.trim();
    let given = if let Some((_, given)) = name.split_once(',') {
        given.trim()
    } else {
        let parts: Vec<&str> = name.split_whitespace().collect();
        if parts.len() >= 2 && is_trailing_initial(parts[parts.len() - 1]) {
            parts[parts.len() - 1]
        } else if parts.len() >= 2 {
            parts[0]
        } else {
            ""
        }
    };
    normalize_words(given).chars().next()
}

/// Normalize an author name to "initial surname" for identity comparison.
///
/// "Jane Q. Doe", "Doe, Jane" and "Doe J" all map to `"j doe"`. Names without
/// a recoverable given name map to the bare surname.
pub fn author_key(name: &str) -> String {
    let surname = get_last_name(name);
    if surname.is_empty() {
        return String::new();
    }
    match first_initial(name) {
        Some(initial) => format!("{initial} {surname}"),
        None => surname,
    }
}
