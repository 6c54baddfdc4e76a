//! Charities input file handling.
//!
//! Lines of `Name|EIN|website`, UTF-8. EINs normalize to `XX-XXXXXXX`,
//! websites get a scheme when missing, and duplicates (by EIN) are dropped
//! keeping the first occurrence.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use tracing::warn;

use goodmeasure_core::normalize_ein;
use goodmeasure_pipeline::CharityInput;

pub fn normalize_website_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    url::Url::parse(&with_scheme).ok().map(|u| u.to_string())
}

pub fn parse_charities(content: &str) -> Result<Vec<CharityInput>> {
    let mut charities = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (line_number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, '|');
        let name = parts.next().unwrap_or("").trim();
        let raw_ein = parts.next().unwrap_or("").trim();
        let website = parts.next().unwrap_or("").trim();

        if name.is_empty() || raw_ein.is_empty() {
            bail!("line {}: expected Name|EIN|website, got {line:?}", line_number + 1);
        }
        let ein = normalize_ein(raw_ein)
            .with_context(|| format!("line {}: bad EIN", line_number + 1))?;

        if !seen.insert(ein.clone()) {
            warn!(ein, "duplicate EIN in charities file; keeping first");
            continue;
        }
        charities.push(CharityInput {
            name: name.to_string(),
            ein,
            website: normalize_website_url(website),
        });
    }
    Ok(charities)
}

pub fn load_charities_file(path: &str) -> Result<Vec<CharityInput>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading charities file {path}"))?;
    let charities = parse_charities(&content)?;
    if charities.is_empty() {
        bail!("charities file {path} contains no charities");
    }
    Ok(charities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipes_and_normalizes() {
        let content = "Example|12-3456789|https://example.org\nOther Org|987654321|other.org\n";
        let charities = parse_charities(content).unwrap();
        assert_eq!(charities.len(), 2);
        assert_eq!(charities[0].ein, "12-3456789");
        assert_eq!(charities[1].ein, "98-7654321");
        assert_eq!(charities[1].website.as_deref(), Some("https://other.org/"));
    }

    #[test]
    fn dedupes_by_ein_keeping_first() {
        let content = "First|12-3456789|a.org\nSecond|123456789|b.org\n";
        let charities = parse_charities(content).unwrap();
        assert_eq!(charities.len(), 1);
        assert_eq!(charities[0].name, "First");
    }

    #[test]
    fn blank_lines_and_comments_are_skipped() {
        let content = "# pilot list\n\nExample|12-3456789|\n";
        let charities = parse_charities(content).unwrap();
        assert_eq!(charities.len(), 1);
        assert!(charities[0].website.is_none());
    }

    #[test]
    fn bad_ein_is_an_error() {
        assert!(parse_charities("Example|12-34567|x.org\n").is_err());
    }

    #[test]
    fn website_normalization() {
        assert_eq!(
            normalize_website_url("example.org").as_deref(),
            Some("https://example.org/")
        );
        assert_eq!(
            normalize_website_url("http://example.org/").as_deref(),
            Some("http://example.org/")
        );
        assert_eq!(normalize_website_url("  "), None);
    }
}
