//! Deterministic regex extraction of factual fields.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use url::Url;

use goodmeasure_core::types::ExtractionResult;

static EIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:EIN|E\.I\.N\.|Tax\s+ID|Federal\s+Tax\s+ID|Tax\s+Identification\s+Number)[:\s#]*([0-9]{2}-?[0-9]{7})",
    )
    .expect("ein regex")
});

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}").expect("email regex"));

static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+1[\s.\-]?)?\(?[2-9][0-9]{2}\)?[\s.\-][0-9]{3}[\s.\-][0-9]{4}").expect("phone regex")
});

static SOCIAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"https?://(?:www\.)?(facebook\.com|twitter\.com|x\.com|instagram\.com|linkedin\.com|youtube\.com)/[A-Za-z0-9_@/.\-]+",
    )
    .expect("social regex")
});

static TAX_DEDUCTIBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(tax[\s\-]deductible|501\s*\(\s*c\s*\)\s*\(?\s*3\s*\)?)").expect("tax regex")
});

/// Uninteresting inbox prefixes that regularly appear in footers before the
/// real contact address.
const EMAIL_SPAM_PREFIXES: &[&str] = &["noreply@", "no-reply@", "donotreply@", "example@"];

pub fn extract_deterministic(html: &str, url: &str) -> Vec<ExtractionResult> {
    let mut results = Vec::new();

    if let Some(ein) = extract_ein(html) {
        results.push(ExtractionResult::new("ein", Value::String(ein), "regex-ein", 0.9, url));
    }
    if let Some(email) = extract_email(html) {
        results.push(ExtractionResult::new(
            "contact_email",
            Value::String(email),
            "regex-contact",
            0.85,
            url,
        ));
    }
    if let Some(phone) = PHONE_RE.find(html) {
        results.push(ExtractionResult::new(
            "contact_phone",
            Value::String(phone.as_str().trim().to_string()),
            "regex-contact",
            0.8,
            url,
        ));
    }

    let social = extract_social(html);
    if !social.is_empty() {
        results.push(ExtractionResult::new(
            "social_media",
            Value::Object(social),
            "regex-social",
            0.85,
            url,
        ));
    }

    if let Some(donate) = extract_donate_url(html, url) {
        results.push(ExtractionResult::new(
            "donate_url",
            Value::String(donate),
            "regex-donate",
            0.85,
            url,
        ));
    }

    if TAX_DEDUCTIBLE_RE.is_match(html) {
        results.push(ExtractionResult::new(
            "tax_deductible",
            Value::Bool(true),
            "regex-ein",
            0.8,
            url,
        ));
    }

    results
}

/// EIN requires a labelled mention; a bare `12-3456789` is too often a phone
/// fragment or an order number.
pub fn extract_ein(html: &str) -> Option<String> {
    let caps = EIN_RE.captures(html)?;
    let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 9 {
        Some(format!("{}-{}", &digits[..2], &digits[2..]))
    } else {
        None
    }
}

fn extract_email(html: &str) -> Option<String> {
    EMAIL_RE
        .find_iter(html)
        .map(|m| m.as_str().to_string())
        .find(|email| {
            let lower = email.to_lowercase();
            !EMAIL_SPAM_PREFIXES.iter().any(|p| lower.starts_with(p))
                // Image filenames regularly look like emails in srcset attrs.
                && !lower.ends_with(".png") && !lower.ends_with(".jpg") && !lower.ends_with(".webp")
        })
}

fn extract_social(html: &str) -> serde_json::Map<String, Value> {
    let mut social = serde_json::Map::new();
    for m in SOCIAL_RE.find_iter(html) {
        let link = m.as_str().trim_end_matches(['"', '\'', ')', ',']);
        if let Some(network) = crate::structured::social_network(link) {
            social
                .entry(network.to_string())
                .or_insert(Value::String(link.to_string()));
        }
    }
    social
}

/// First same-site anchor whose href or text says "donate"/"give".
fn extract_donate_url(html: &str, base_url: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    let document = Html::parse_document(html);
    let sel = Selector::parse("a[href]").ok()?;
    for el in document.select(&sel) {
        let href = el.value().attr("href")?.to_string();
        let text = el.text().collect::<String>().to_lowercase();
        let href_lower = href.to_lowercase();
        if href_lower.contains("donate")
            || href_lower.contains("/give")
            || text.trim() == "donate"
            || text.contains("donate now")
        {
            if let Ok(resolved) = base.join(&href) {
                if resolved.scheme() == "http" || resolved.scheme() == "https" {
                    return Some(resolved.to_string());
                }
            }
        }
    }
    None
}
