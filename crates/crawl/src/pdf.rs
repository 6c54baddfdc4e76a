//! PDF discovery and download.
//!
//! Finds PDF links on crawled pages, classifies them into document types,
//! extracts fiscal years, orders them by evaluation value, and downloads the
//! top few with the same bot-bypass fallback as page fetches. Files are
//! validated and content-hashed for dedup before they are kept.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use goodmeasure_core::types::DocumentType;

use crate::fetch::Fetcher;

#[derive(Debug, Clone)]
pub struct PdfLink {
    pub url: String,
    pub anchor_text: String,
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct ClassifiedPdf {
    pub link: PdfLink,
    pub document_type: DocumentType,
    pub fiscal_year: Option<i32>,
}

static DOCUMENT_PATTERNS: Lazy<Vec<(DocumentType, Vec<Regex>)>> = Lazy::new(|| {
    fn compile(patterns: &[&str]) -> Vec<Regex> {
        patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).expect("document pattern"))
            .collect()
    }
    vec![
        (
            DocumentType::Form990,
            compile(&[
                r"form\s*990", r"990\s+form", r"990[-_]?pf", r"tax\s+form", r"irs\s+form",
                r"tax\s+return", r"exempt\s+organization",
            ]),
        ),
        (
            DocumentType::AuditReport,
            compile(&[
                r"audit(?:ed)?\s+(?:financial\s+)?report", r"independent\s+audit",
                r"auditor'?s?\s+report", r"financial\s+audit", r"cpa\s+report",
            ]),
        ),
        (
            DocumentType::FinancialStatement,
            compile(&[
                r"financial\s+statement", r"financials?", r"audited?\s+statement",
                r"statement\s+of\s+financial", r"/financial", r"consolidated\s+financial",
            ]),
        ),
        (
            DocumentType::ImpactReport,
            compile(&[
                r"impact\s+report", r"outcome[s]?\s+report", r"results?\s+report",
                r"progress\s+report", r"/impact", r"metrics\s+report",
            ]),
        ),
        (
            DocumentType::EvaluationReport,
            compile(&[
                r"evaluation\s+report", r"program\s+evaluation", r"external\s+evaluation",
                r"third[- ]party\s+evaluation", r"monitoring\s+(?:and\s+)?evaluation",
                r"m&e\s+report",
            ]),
        ),
        (
            DocumentType::TheoryOfChange,
            compile(&[
                r"theory\s+of\s+change", r"logic\s+model", r"strategic\s+framework",
                r"program\s+theory",
            ]),
        ),
        (
            DocumentType::AnnualReport,
            compile(&[
                r"annual\s+report", r"yearly\s+report", r"annual[-_]report", r"/annual",
                r"year\s+in\s+review",
            ]),
        ),
        (
            DocumentType::ProgramReport,
            compile(&[
                r"program\s+report", r"project\s+report", r"activity\s+report",
                r"operational\s+report",
            ]),
        ),
        (
            DocumentType::StrategicPlan,
            compile(&[
                r"strategic\s+plan", r"strategy\s+document", r"multi[- ]year\s+plan",
                r"organizational\s+strategy",
            ]),
        ),
        (
            DocumentType::Governance,
            compile(&[
                r"governance\s+report", r"board\s+report", r"transparency\s+report",
                r"accountability\s+report",
            ]),
        ),
    ]
});

/// Clearly irrelevant documents are dropped before classification.
static EXCLUDED_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("confidential", r"\bconfidential\b"),
        ("confidential", r"\bprivileged\b"),
        ("confidential", r"attorney[.\s-]client"),
        ("third_party_agreements", r"settlement\s+agreement"),
        ("third_party_agreements", r"\bnda\b"),
        ("third_party_agreements", r"non[.\s-]disclosure"),
        ("third_party_agreements", r"\bcontract\b"),
    ]
    .iter()
    .map(|(kind, p)| (*kind, Regex::new(&format!("(?i){p}")).expect("exclusion pattern")))
    .collect()
});

static FISCAL_YEAR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?:FY|fiscal\s+year)\s*(\d{4})",
        r"(\d{4})\s*annual\s+report",
        r"(\d{4})\s*financial",
        r"(\d{4})[-_](\d{4})",
        r"year\s+ending?\s+.*?(\d{4})",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("fiscal year pattern"))
    .collect()
});

static PDF_ANCHOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bpdf\b").expect("pdf anchor"));

/// Scan a page for PDF links: `.pdf` URLs, anchor text mentioning PDF, or an
/// explicit `type="application/pdf"`.
pub fn identify_pdfs(html: &str, base_url: &str) -> Vec<PdfLink> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for el in document.select(&selector) {
        let Some(href) = el.value().attr("href") else { continue };
        let anchor_text = el.text().collect::<String>().trim().to_string();
        let href_lower = href.to_lowercase();

        let is_pdf = href_lower.ends_with(".pdf")
            || href_lower.contains(".pdf?")
            || PDF_ANCHOR_RE.is_match(&anchor_text)
            || el
                .value()
                .attr("type")
                .map(|t| t.eq_ignore_ascii_case("application/pdf"))
                .unwrap_or(false);
        if !is_pdf {
            continue;
        }
        let Ok(absolute) = base.join(href) else { continue };

        // Surrounding context helps classification when the anchor text is
        // just "Download".
        let context = el
            .parent()
            .and_then(scraper::ElementRef::wrap)
            .map(|parent| {
                let text = parent.text().collect::<String>();
                let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                trimmed.chars().take(200).collect()
            })
            .unwrap_or_default();

        links.push(PdfLink { url: absolute.to_string(), anchor_text, context });
    }
    if !links.is_empty() {
        debug!(base_url, count = links.len(), "PDF links found");
    }
    links
}

pub fn should_exclude(link: &PdfLink) -> Option<String> {
    let combined = format!("{} {} {}", link.anchor_text, link.context, link.url).to_lowercase();
    for (kind, re) in EXCLUDED_PATTERNS.iter() {
        if re.is_match(&combined) {
            return Some(format!("Excluded: {kind}"));
        }
    }
    None
}

pub fn classify_document_type(link: &PdfLink) -> DocumentType {
    let text = format!("{} {}", link.anchor_text, link.context);
    let path = Url::parse(&link.url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_default();
    for (doc_type, patterns) in DOCUMENT_PATTERNS.iter() {
        if patterns.iter().any(|re| re.is_match(&text) || re.is_match(&path)) {
            return *doc_type;
        }
    }
    DocumentType::Other
}

pub fn extract_fiscal_year(link: &PdfLink) -> Option<i32> {
    let text = format!("{} {}", link.anchor_text, link.context);
    for re in FISCAL_YEAR_PATTERNS.iter() {
        if let Some(caps) = re.captures(&text) {
            let group = caps.iter().skip(1).flatten().last()?;
            if let Ok(year) = group.as_str().parse::<i32>() {
                if (1990..=2100).contains(&year) {
                    return Some(year);
                }
            }
        }
    }
    None
}

/// Classify, filter, and order links by `(type_priority * 10) + age`, keeping
/// only documents from the last five fiscal years (undated documents pass),
/// then take the top `max_downloads`.
pub fn prioritize(links: Vec<PdfLink>, current_year: i32, max_downloads: usize) -> Vec<ClassifiedPdf> {
    let mut classified: Vec<(u32, ClassifiedPdf)> = Vec::new();
    for link in links {
        if let Some(reason) = should_exclude(&link) {
            debug!(url = %link.url, reason, "PDF excluded");
            continue;
        }
        let document_type = classify_document_type(&link);
        let fiscal_year = extract_fiscal_year(&link);
        if let Some(year) = fiscal_year {
            if current_year - year > 5 {
                continue;
            }
        }
        let age = fiscal_year.map(|y| (current_year - y).max(0) as u32).unwrap_or(0);
        let priority = document_type.priority() * 10 + age;
        classified.push((priority, ClassifiedPdf { link, document_type, fiscal_year }));
    }
    classified.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.link.url.cmp(&b.1.link.url)));
    classified
        .into_iter()
        .take(max_downloads)
        .map(|(_, c)| c)
        .collect()
}

#[derive(Debug)]
pub struct DownloadedPdf {
    pub classified: ClassifiedPdf,
    pub file_path: PathBuf,
    pub file_hash: String,
}

pub struct PdfDownloader {
    storage_dir: PathBuf,
}

impl PdfDownloader {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;
        Ok(Self { storage_dir })
    }

    /// `<pdf_dir>/<ein>/<fiscal_year>_<type>.pdf`, falling back to a hash
    /// suffix when the year is unknown.
    pub fn storage_path(
        &self,
        ein: &str,
        document_type: DocumentType,
        fiscal_year: Option<i32>,
        file_hash: &str,
    ) -> PathBuf {
        let dir = self.storage_dir.join(ein);
        let name = match fiscal_year {
            Some(year) => format!("{year}_{}.pdf", document_type.as_str()),
            None => format!("{}_{}.pdf", document_type.as_str(), &file_hash[..8.min(file_hash.len())]),
        };
        dir.join(name)
    }

    /// Download one classified PDF. Returns None (with a log line) on
    /// anything that is not a valid PDF body.
    pub async fn download(
        &self,
        fetcher: &Fetcher,
        ein: &str,
        classified: ClassifiedPdf,
    ) -> Option<DownloadedPdf> {
        let bytes = match fetcher.download_bytes(&classified.link.url).await {
            Ok(b) => b,
            Err(e) => {
                warn!(url = %classified.link.url, "PDF download failed: {e}");
                return None;
            }
        };
        if let Err(reason) = validate_pdf_bytes(&bytes) {
            warn!(url = %classified.link.url, reason, "discarding invalid PDF");
            return None;
        }
        let file_hash = hex::encode(Sha256::digest(&bytes));
        let path = self.storage_path(ein, classified.document_type, classified.fiscal_year, &file_hash);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("PDF dir create failed: {e}");
                return None;
            }
        }
        if let Err(e) = std::fs::write(&path, &bytes) {
            warn!(path = %path.display(), "PDF write failed: {e}");
            return None;
        }
        info!(url = %classified.link.url, path = %path.display(), "PDF downloaded");
        Some(DownloadedPdf { classified, file_path: path, file_hash })
    }
}

/// Non-empty, starts with `%PDF`, and is not an HTML error page.
pub fn validate_pdf_bytes(bytes: &[u8]) -> Result<(), &'static str> {
    if bytes.is_empty() {
        return Err("empty file");
    }
    if bytes.starts_with(b"%PDF") {
        return Ok(());
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]).to_lowercase();
    if head.contains("<!doctype") || head.contains("<html") {
        Err("HTML error page")
    } else {
        Err("missing %PDF header")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(url: &str, anchor: &str, context: &str) -> PdfLink {
        PdfLink { url: url.into(), anchor_text: anchor.into(), context: context.into() }
    }

    #[test]
    fn identifies_pdf_links_three_ways() {
        let html = r#"<html><body>
            <div><a href="/docs/annual-report-2024.pdf">Annual Report</a></div>
            <div><a href="/download?id=7" type="application/pdf">Financials</a></div>
            <div><a href="/files/report">Impact report (PDF)</a></div>
            <div><a href="/about/">About us</a></div>
        </body></html>"#;
        let links = identify_pdfs(html, "https://charity.org/");
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].url, "https://charity.org/docs/annual-report-2024.pdf");
    }

    #[test]
    fn classification_prefers_specific_types() {
        assert_eq!(
            classify_document_type(&link("https://c.org/990.pdf", "Form 990 2023", "")),
            DocumentType::Form990
        );
        assert_eq!(
            classify_document_type(&link("https://c.org/a.pdf", "Independent audit", "")),
            DocumentType::AuditReport
        );
        assert_eq!(
            classify_document_type(&link("https://c.org/x.pdf", "Annual Report 2024", "")),
            DocumentType::AnnualReport
        );
        assert_eq!(
            classify_document_type(&link("https://c.org/misc.pdf", "Brochure", "")),
            DocumentType::Other
        );
    }

    #[test]
    fn exclusion_filters_irrelevant_documents() {
        assert!(should_exclude(&link("https://c.org/nda.pdf", "Mutual NDA", "")).is_some());
        assert!(should_exclude(&link("https://c.org/x.pdf", "Settlement agreement", "")).is_some());
        assert!(should_exclude(&link("https://c.org/990.pdf", "Form 990", "")).is_none());
    }

    #[test]
    fn fiscal_year_extraction() {
        assert_eq!(extract_fiscal_year(&link("u", "FY 2023 audit", "")), Some(2023));
        assert_eq!(extract_fiscal_year(&link("u", "2022 Annual Report", "")), Some(2022));
        assert_eq!(extract_fiscal_year(&link("u", "Report 2021-2022", "")), Some(2022));
        assert_eq!(extract_fiscal_year(&link("u", "our brochure", "")), None);
        // Out-of-range years are ignored.
        assert_eq!(extract_fiscal_year(&link("u", "1905 annual report", "")), None);
    }

    #[test]
    fn prioritization_orders_by_type_then_age() {
        let links = vec![
            link("https://c.org/impact-2024.pdf", "Impact report 2024", ""),
            link("https://c.org/990-2023.pdf", "Form 990 FY 2023", ""),
            link("https://c.org/annual-2010.pdf", "2010 Annual Report", ""),
            link("https://c.org/990-2021.pdf", "Form 990 FY 2021", ""),
        ];
        let ordered = prioritize(links, 2026, 5);
        // 2010 dropped (older than 5 years); 990s first, newer first.
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].link.url, "https://c.org/990-2023.pdf");
        assert_eq!(ordered[1].link.url, "https://c.org/990-2021.pdf");
        assert_eq!(ordered[2].document_type, DocumentType::ImpactReport);
    }

    #[test]
    fn pdf_validation_rejects_html_and_empty() {
        assert!(validate_pdf_bytes(b"%PDF-1.7 ...").is_ok());
        assert!(validate_pdf_bytes(b"").is_err());
        assert_eq!(
            validate_pdf_bytes(b"<!DOCTYPE html><html>404</html>"),
            Err("HTML error page")
        );
    }
}
