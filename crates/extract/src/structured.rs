//! Machine-readable structured data: JSON-LD, Open Graph, microdata.
//!
//! These are the highest-confidence sources for factual fields and cost no
//! LLM tokens, so they run on every page.

use scraper::{Html, Selector};
use serde_json::Value;

use goodmeasure_core::types::ExtractionResult;

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

/// All structured-data extractions for a page.
pub fn extract_structured(html: &str, url: &str) -> Vec<ExtractionResult> {
    let document = Html::parse_document(html);
    let mut results = Vec::new();
    results.extend(extract_json_ld(&document, url));
    results.extend(extract_opengraph(&document, url));
    results.extend(extract_microdata(&document, url));
    results
}

/// JSON-LD `<script>` blocks. Organization-typed objects (directly, in
/// `@graph`, or in a top-level array) yield typed fields.
fn extract_json_ld(document: &Html, url: &str) -> Vec<ExtractionResult> {
    let mut results = Vec::new();
    let Some(sel) = selector("script[type='application/ld+json']") else {
        return results;
    };
    for el in document.select(&sel) {
        let raw = el.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<Value>(raw.trim()) else {
            continue;
        };
        for obj in organization_objects(&value) {
            results.extend(fields_from_organization(obj, url));
        }
    }
    results
}

fn organization_objects(value: &Value) -> Vec<&Value> {
    let mut found = Vec::new();
    let mut stack = vec![value];
    while let Some(v) = stack.pop() {
        match v {
            Value::Array(items) => stack.extend(items.iter()),
            Value::Object(map) => {
                if let Some(graph) = map.get("@graph") {
                    stack.push(graph);
                }
                let is_org = map
                    .get("@type")
                    .map(|t| type_matches(t, &["Organization", "NGO", "NonProfit", "Charity"]))
                    .unwrap_or(false);
                if is_org {
                    found.push(v);
                }
            }
            _ => {}
        }
    }
    found
}

fn type_matches(t: &Value, names: &[&str]) -> bool {
    match t {
        Value::String(s) => names.iter().any(|n| s.contains(n)),
        Value::Array(items) => items
            .iter()
            .any(|i| i.as_str().map(|s| names.iter().any(|n| s.contains(n))).unwrap_or(false)),
        _ => false,
    }
}

fn fields_from_organization(obj: &Value, url: &str) -> Vec<ExtractionResult> {
    let mut results = Vec::new();
    let mut push = |field: &str, value: Value| {
        results.push(ExtractionResult::new(field, value, "json-ld", 1.0, url));
    };

    if let Some(name) = obj.get("name").and_then(Value::as_str) {
        push("name", Value::String(name.to_string()));
    }
    if let Some(email) = obj.get("email").and_then(Value::as_str) {
        push("contact_email", Value::String(email.trim_start_matches("mailto:").to_string()));
    }
    if let Some(phone) = obj.get("telephone").and_then(Value::as_str) {
        push("contact_phone", Value::String(phone.to_string()));
    }
    if let Some(logo) = logo_url(obj.get("logo")) {
        push("logo_url", Value::String(logo));
    }
    if let Some(site) = obj.get("url").and_then(Value::as_str) {
        push("url", Value::String(site.to_string()));
    }
    if let Some(founding) = obj.get("foundingDate").and_then(Value::as_str) {
        if let Some(year) = founding.get(..4).and_then(|y| y.parse::<i64>().ok()) {
            if (1600..=2100).contains(&year) {
                push("founded_year", Value::from(year));
            }
        }
    }
    if let Some(address) = obj.get("address") {
        if let Some(formatted) = format_postal_address(address) {
            push("address", Value::String(formatted));
        }
    }
    if let Some(Value::Array(same_as)) = obj.get("sameAs") {
        let mut social = serde_json::Map::new();
        for link in same_as.iter().filter_map(Value::as_str) {
            if let Some(network) = social_network(link) {
                social.entry(network.to_string()).or_insert(Value::String(link.to_string()));
            }
        }
        if !social.is_empty() {
            push("social_media", Value::Object(social));
        }
    }
    if let Some(description) = obj.get("description").and_then(Value::as_str) {
        push("mission", Value::String(description.to_string()));
    }
    results
}

fn logo_url(logo: Option<&Value>) -> Option<String> {
    match logo? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn format_postal_address(address: &Value) -> Option<String> {
    match address {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            let parts: Vec<&str> = ["streetAddress", "addressLocality", "addressRegion", "postalCode"]
                .iter()
                .filter_map(|k| map.get(*k).and_then(Value::as_str))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        _ => None,
    }
}

pub(crate) fn social_network(link: &str) -> Option<&'static str> {
    let lower = link.to_lowercase();
    if lower.contains("facebook.com") {
        Some("facebook")
    } else if lower.contains("twitter.com") || lower.contains("x.com") {
        Some("twitter")
    } else if lower.contains("instagram.com") {
        Some("instagram")
    } else if lower.contains("linkedin.com") {
        Some("linkedin")
    } else if lower.contains("youtube.com") {
        Some("youtube")
    } else {
        None
    }
}

/// Open Graph meta tags. Titles and images are useful fallbacks; the
/// description doubles as a tagline candidate.
fn extract_opengraph(document: &Html, url: &str) -> Vec<ExtractionResult> {
    let mut results = Vec::new();
    let Some(sel) = selector("meta[property^='og:']") else {
        return results;
    };
    for el in document.select(&sel) {
        let (Some(property), Some(content)) = (el.value().attr("property"), el.value().attr("content"))
        else {
            continue;
        };
        if content.trim().is_empty() {
            continue;
        }
        let (field, confidence) = match property {
            "og:site_name" => ("name", 0.9),
            "og:title" => ("name", 0.6),
            "og:description" => ("tagline", 0.7),
            "og:image" => ("logo_url", 0.6),
            "og:url" => ("url", 0.8),
            _ => continue,
        };
        results.push(ExtractionResult::new(
            field,
            Value::String(content.trim().to_string()),
            "opengraph",
            confidence,
            url,
        ));
    }
    results
}

/// Microdata `itemprop` attributes under an Organization `itemscope`.
fn extract_microdata(document: &Html, url: &str) -> Vec<ExtractionResult> {
    let mut results = Vec::new();
    let Some(scope_sel) = selector("[itemscope][itemtype*='Organization']") else {
        return results;
    };
    let Some(prop_sel) = selector("[itemprop]") else {
        return results;
    };
    for scope in document.select(&scope_sel) {
        for el in scope.select(&prop_sel) {
            let Some(prop) = el.value().attr("itemprop") else { continue };
            let content = el
                .value()
                .attr("content")
                .map(str::to_string)
                .unwrap_or_else(|| el.text().collect::<String>().trim().to_string());
            if content.is_empty() {
                continue;
            }
            let field = match prop {
                "name" => "name",
                "email" => "contact_email",
                "telephone" => "contact_phone",
                "address" => "address",
                "logo" => "logo_url",
                _ => continue,
            };
            results.push(ExtractionResult::new(
                field,
                Value::String(content),
                "microdata",
                0.9,
                url,
            ));
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_LD_PAGE: &str = r#"<html><head>
        <script type="application/ld+json">
        {
            "@context": "https://schema.org",
            "@type": "Organization",
            "name": "Example Relief",
            "email": "mailto:info@example.org",
            "telephone": "+1-555-010-0000",
            "foundingDate": "1994-06-01",
            "address": {
                "@type": "PostalAddress",
                "streetAddress": "1 Charity Way",
                "addressLocality": "Dearborn",
                "addressRegion": "MI",
                "postalCode": "48126"
            },
            "sameAs": ["https://facebook.com/examplerelief", "https://twitter.com/examplerelief"]
        }
        </script>
    </head><body></body></html>"#;

    #[test]
    fn json_ld_organization_fields() {
        let results = extract_structured(JSON_LD_PAGE, "https://example.org/");
        let get = |field: &str| {
            results
                .iter()
                .find(|r| r.field_name == field && r.extraction_source == "json-ld")
                .map(|r| r.field_value.clone())
        };
        assert_eq!(get("name").unwrap(), "Example Relief");
        assert_eq!(get("contact_email").unwrap(), "info@example.org");
        assert_eq!(get("founded_year").unwrap(), 1994);
        assert_eq!(
            get("address").unwrap(),
            "1 Charity Way, Dearborn, MI, 48126"
        );
        let social = get("social_media").unwrap();
        assert_eq!(social["facebook"], "https://facebook.com/examplerelief");
        assert_eq!(social["twitter"], "https://twitter.com/examplerelief");
    }

    #[test]
    fn json_ld_graph_array_is_searched() {
        let html = r#"<script type="application/ld+json">
            {"@graph": [{"@type": "WebSite"}, {"@type": "NGO", "name": "Graph Org"}]}
        </script>"#;
        let results = extract_structured(html, "https://example.org/");
        assert!(results.iter().any(|r| r.field_name == "name" && r.field_value == "Graph Org"));
    }

    #[test]
    fn malformed_json_ld_is_skipped() {
        let html = r#"<script type="application/ld+json">{not json}</script>"#;
        assert!(extract_structured(html, "https://example.org/").is_empty());
    }

    #[test]
    fn opengraph_fields() {
        let html = r#"<html><head>
            <meta property="og:site_name" content="Example Relief" />
            <meta property="og:description" content="Serving families since 1994" />
            <meta property="og:image" content="https://example.org/logo.png" />
        </head></html>"#;
        let results = extract_structured(html, "https://example.org/");
        assert!(results
            .iter()
            .any(|r| r.extraction_source == "opengraph" && r.field_name == "tagline"));
        assert!(results
            .iter()
            .any(|r| r.field_name == "logo_url" && r.field_value == "https://example.org/logo.png"));
    }

    #[test]
    fn microdata_inside_organization_scope() {
        let html = r#"<div itemscope itemtype="https://schema.org/Organization">
            <span itemprop="name">Micro Org</span>
            <a itemprop="email" href="mailto:hi@micro.org">hi@micro.org</a>
        </div>"#;
        let results = extract_structured(html, "https://example.org/");
        assert!(results
            .iter()
            .any(|r| r.extraction_source == "microdata" && r.field_name == "name" && r.field_value == "Micro Org"));
    }
}
