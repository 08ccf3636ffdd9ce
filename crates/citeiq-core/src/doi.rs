use once_cell::sync::Lazy;
use regex::Regex;

/// Full-string DOI shape: `10.` + 4-9 digit registrant + `/` + non-blank suffix.
static DOI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^10\.\d{4,9}/\S+$").unwrap());

/// Prefixes that wrap a DOI in citations and API payloads.
const DOI_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi.org/",
    "doi:",
];

/// Registrant prefixes that only ever identify preprints.
const PREPRINT_DOI_PREFIXES: &[&str] = &["10.48550/arxiv.", "10.31219/osf.io/", "10.21203/rs."];

/// Strip URL/`doi:` wrappers and trailing punctuation, then lowercase.
///
/// DOIs are case-insensitive, so every comparison and cache key goes through
/// this form.
pub fn normalize_doi(raw: &str) -> String {
    let mut doi = raw.trim();
    for prefix in DOI_PREFIXES {
        if doi
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        {
            doi = doi[prefix.len()..].trim_start();
            break;
        }
    }
    doi.trim_end_matches(['.', ',', ';'])
        .to_lowercase()
}

/// Whether an already-normalized DOI has the expected shape.
pub fn is_valid_doi(doi: &str) -> bool {
    DOI_RE.is_match(doi)
}

/// Normalize and validate in one step.
pub fn parse_doi(raw: &str) -> Option<String> {
    let doi = normalize_doi(raw);
    is_valid_doi(&doi).then_some(doi)
}

pub fn is_preprint_doi(doi: &str) -> bool {
    PREPRINT_DOI_PREFIXES.iter().any(|p| doi.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_wrappers() {
        assert_eq!(
            normalize_doi("https://doi.org/10.1109/EXAMPLE.2023"),
            "10.1109/example.2023"
        );
        assert_eq!(normalize_doi("DOI:10.1000/XYZ."), "10.1000/xyz");
        assert_eq!(normalize_doi("  10.1000/abc  "), "10.1000/abc");
    }

    #[test]
    fn validates_shape() {
        assert!(is_valid_doi("10.1109/example.2023"));
        assert!(is_valid_doi("10.48550/arxiv.2301.00001"));
        assert!(!is_valid_doi("10.12/too-short-registrant"));
        assert!(!is_valid_doi("11.1109/example"));
        assert!(!is_valid_doi("10.1109/"));
        assert!(!is_valid_doi("10.1109/has space"));
        assert!(!is_valid_doi(""));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(parse_doi("not-a-doi"), None);
        assert_eq!(
            parse_doi("doi:10.1145/3133956.3134093"),
            Some("10.1145/3133956.3134093".into())
        );
    }

    #[test]
    fn preprint_registrants() {
        assert!(is_preprint_doi("10.48550/arxiv.2301.00001"));
        assert!(!is_preprint_doi("10.1109/example.2023"));
    }
}
