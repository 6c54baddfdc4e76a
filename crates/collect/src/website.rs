//! Charity website collector.
//!
//! Wraps the site crawler, the extraction stack, and PDF discovery into one
//! source. The fetch/parse split exists for re-parsing (homepage only); the
//! full multi-page pipeline runs through `collect`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use goodmeasure_core::types::{
    ContentType, ExtractionResult, ExtractionStatus, FetchOutput, ParseOutput, PdfRecord,
    RawPayload, TransferStatus,
};
use goodmeasure_core::{normalize_ein, ein_matches};
use goodmeasure_crawl::pdf::{identify_pdfs, prioritize};
use goodmeasure_crawl::{CrawlState, Crawler, CrawlerCache, Fetcher, PdfDownloader};
use goodmeasure_extract::{
    extract_deterministic, extract_structured, merge_all, Form990Parser, WebsiteExtractor,
};
use goodmeasure_llm::GeminiClient;
use goodmeasure_store::Store;

use crate::{CollectOptions, CollectOutcome, Collector};

/// Pages handed to the LLM per crawl; extraction cost scales linearly.
const MAX_LLM_PAGES: usize = 10;

pub struct WebsiteCollector {
    crawler: Arc<Crawler>,
    fetcher: Arc<Fetcher>,
    cache: Arc<CrawlerCache>,
    pdf_downloader: PdfDownloader,
    extractor: Option<WebsiteExtractor>,
    llm: Option<GeminiClient>,
    store: Store,
    state_dir: PathBuf,
    max_pdf_downloads: usize,
}

impl WebsiteCollector {
    pub fn new(
        crawler: Arc<Crawler>,
        fetcher: Arc<Fetcher>,
        cache: Arc<CrawlerCache>,
        pdf_downloader: PdfDownloader,
        llm: Option<GeminiClient>,
        store: Store,
        max_pdf_downloads: usize,
    ) -> Self {
        let state_dir = cache.state_dir().to_path_buf();
        Self {
            crawler,
            fetcher,
            cache,
            pdf_downloader,
            extractor: llm.clone().map(WebsiteExtractor::new),
            llm,
            store,
            state_dir,
            max_pdf_downloads,
        }
    }

    /// Assemble the profile from merged extraction results, enforcing the
    /// EIN relationship rules.
    fn build_profile(
        website_url: &str,
        expected_ein: Option<&str>,
        merged: goodmeasure_extract::MergedData,
        crawl_stats: Value,
    ) -> Value {
        let mut profile = merged.merged;
        profile.insert("url".into(), json!(website_url));

        // An on-site EIN that differs from the requested charity is usually
        // a parent or fiscal sponsor; keep it, but not as the charity's own.
        if let Some(expected) = expected_ein {
            let site_ein = profile.get("ein").and_then(Value::as_str).map(str::to_string);
            match site_ein {
                Some(found) => {
                    if ein_matches(&found, expected) {
                        if let Ok(normalized) = normalize_ein(&found) {
                            profile.insert("ein".into(), json!(normalized));
                        }
                    } else {
                        profile.remove("ein");
                        if let Ok(normalized) = normalize_ein(&found) {
                            profile.insert("related_ein".into(), json!(normalized));
                        }
                    }
                }
                None => {}
            }
        } else if let Some(found) = profile.get("ein").and_then(Value::as_str).map(str::to_string) {
            match normalize_ein(&found) {
                Ok(normalized) => {
                    profile.insert("ein".into(), json!(normalized));
                }
                Err(_) => {
                    profile.remove("ein");
                }
            }
        }

        profile.insert("crawl_stats".into(), crawl_stats);
        profile.insert("data_sources".into(), Value::Object(merged.sources));
        Value::Object(profile)
    }

    async fn extract_pdf_documents(
        &self,
        ein: &str,
        pages: &[goodmeasure_crawl::CrawledPage],
    ) -> (Vec<Value>, f64) {
        if self.max_pdf_downloads == 0 {
            return (Vec::new(), 0.0);
        }
        let mut links = Vec::new();
        for page in pages {
            links.extend(identify_pdfs(&page.html, &page.final_url));
        }
        if links.is_empty() {
            return (Vec::new(), 0.0);
        }
        let current_year = Utc::now().year();
        let prioritized = prioritize(links, current_year, self.max_pdf_downloads);
        info!(ein, candidates = prioritized.len(), "downloading priority PDFs");

        let mut extracted_docs: Vec<Value> = Vec::new();
        let mut llm_cost = 0.0;
        for classified in prioritized {
            let source_url = classified.link.url.clone();
            let document_type = classified.document_type;
            let fiscal_year = classified.fiscal_year;

            let Some(downloaded) = self.pdf_downloader.download(&self.fetcher, ein, classified).await
            else {
                continue;
            };

            // Same bytes under a different URL: keep one copy.
            match self.store.pdf_hash_exists(ein, &downloaded.file_hash).await {
                Ok(true) => {
                    debug!(url = %source_url, "duplicate PDF (hash match); skipping store");
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!("PDF dedup check failed: {e}"),
            }

            let bytes = std::fs::read(&downloaded.file_path).unwrap_or_default();
            let (extracted_data, extraction_status, cost) =
                self.extract_one_pdf(document_type, &bytes).await;
            llm_cost += cost;

            let record = PdfRecord {
                charity_ein: ein.to_string(),
                source_url: source_url.clone(),
                document_type,
                fiscal_year,
                file_path: Some(downloaded.file_path.display().to_string()),
                file_hash: Some(downloaded.file_hash.clone()),
                download_status: TransferStatus::Completed,
                extraction_status,
                extracted_data: extracted_data.clone(),
            };
            if let Err(e) = self.store.upsert_pdf(&record).await {
                warn!("PDF record store failed: {e}");
            }
            if let Some(data) = extracted_data {
                extracted_docs.push(json!({
                    "source_url": source_url,
                    "document_type": document_type.as_str(),
                    "fiscal_year": fiscal_year,
                    "data": data,
                }));
            }
        }
        (extracted_docs, llm_cost)
    }

    /// Form 990s get the deterministic parser first; everything else (and
    /// 990s the parser rejects) falls back to the LLM when available.
    async fn extract_one_pdf(
        &self,
        document_type: goodmeasure_core::types::DocumentType,
        bytes: &[u8],
    ) -> (Option<Value>, ExtractionStatus, f64) {
        use goodmeasure_core::types::DocumentType;

        if document_type == DocumentType::Form990 {
            if let Some(data) = Form990Parser::parse_pdf_bytes(bytes) {
                let value = serde_json::to_value(&data).unwrap_or(Value::Null);
                return (Some(value), ExtractionStatus::Completed, 0.0);
            }
        }

        let Some(client) = &self.llm else {
            return (None, ExtractionStatus::Pending, 0.0);
        };
        let Some(text) = goodmeasure_extract::form990::extract_pdf_text(bytes) else {
            return (None, ExtractionStatus::Failed, 0.0);
        };
        let mut end = text.len().min(15_000);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let schema = json!({
            "type": "OBJECT",
            "properties": {
                "programs": {"type": "ARRAY", "nullable": true, "items": {"type": "STRING"}},
                "outcomes": {"type": "ARRAY", "nullable": true, "items": {"type": "STRING"}},
                "total_revenue": {"type": "NUMBER", "nullable": true},
                "total_expenses": {"type": "NUMBER", "nullable": true},
                "mission": {"type": "STRING", "nullable": true},
                "theory_of_change": {"type": "STRING", "nullable": true}
            }
        });
        let prompt = format!(
            "Extract programs, reported outcomes, financial totals, mission, and theory of \
             change from this {} document. Use null for anything not stated.\n\n{}",
            document_type.as_str(),
            &text[..end]
        );
        match client.generate_json(None, &prompt, schema).await {
            Ok((value, response)) => (Some(value), ExtractionStatus::Completed, response.cost_usd),
            Err(e) => {
                warn!("PDF LLM extraction failed: {e}");
                (None, ExtractionStatus::Failed, 0.0)
            }
        }
    }
}

#[async_trait]
impl Collector for WebsiteCollector {
    fn source_name(&self) -> &'static str {
        "website"
    }

    fn schema_key(&self) -> &'static str {
        "website_profile"
    }

    /// Homepage only; the multi-page pipeline lives in `collect`.
    async fn fetch(&self, _ein: &str, opts: &CollectOptions) -> FetchOutput {
        let Some(url) = opts.website_url.as_deref() else {
            return FetchOutput::err(ContentType::Html, "website URL required");
        };
        let result = self.fetcher.fetch(url, false).await;
        if !result.success {
            return FetchOutput::err(
                ContentType::Html,
                result.error.unwrap_or_else(|| "fetch failed".into()),
            );
        }
        let payload = RawPayload::new(
            json!({"final_url": result.final_url}),
            result.html.unwrap_or_default(),
        );
        FetchOutput::ok(payload.encode(), ContentType::Html)
    }

    /// Deterministic-only re-parse of a stored homepage payload.
    async fn parse(&self, raw: &str, ein: &str, opts: &CollectOptions) -> ParseOutput {
        let payload = RawPayload::decode(raw);
        let url = opts
            .website_url
            .clone()
            .or_else(|| {
                payload
                    .metadata
                    .get("final_url")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();
        if url.is_empty() {
            return ParseOutput::err("website URL unknown for re-parse");
        }

        let mut results: Vec<ExtractionResult> = Vec::new();
        results.extend(extract_structured(&payload.body, &url));
        results.extend(extract_deterministic(&payload.body, &url));
        let merged = merge_all(&results);
        let profile = Self::build_profile(
            &url,
            Some(ein),
            merged,
            json!({"pages_crawled": 1, "mode": "reparse"}),
        );
        ParseOutput::ok(json!({ "website_profile": profile }))
    }

    async fn collect(&self, ein: &str, opts: &CollectOptions) -> CollectOutcome {
        let Some(website_url) = opts.website_url.as_deref() else {
            return CollectOutcome::failure("website URL required");
        };
        info!(ein, website_url, "starting multi-page crawl");

        let mut state = CrawlState::load(&self.state_dir, website_url);
        let report = self.crawler.crawl(website_url).await;

        if report.pages.is_empty() {
            // Crawl state is written even for failed crawls.
            state.save(&self.state_dir);
            let error = report
                .failures
                .iter()
                .find(|(_, e)| e.starts_with("CAPTCHA_BLOCKED"))
                .map(|(_, e)| e.clone())
                .or_else(|| report.failures.first().map(|(_, e)| e.clone()))
                .unwrap_or_else(|| "No pages could be fetched".into());
            return CollectOutcome::failure(error);
        }

        // Deterministic extraction over every fetched page.
        let mut results: Vec<ExtractionResult> = Vec::new();
        for page in &report.pages {
            let before = results.len();
            results.extend(extract_structured(&page.html, &page.final_url));
            results.extend(extract_deterministic(&page.html, &page.final_url));
            let had_data = results.len() > before;
            let methods = vec!["structured".to_string(), "deterministic".to_string()];
            self.cache.update_had_data(&page.url, had_data, &methods, false, None);
            state.record_outcome(&page.url, had_data, false);
        }

        // LLM extraction over the highest-value pages, plus any cached page
        // whose stored extraction predates the current schema version.
        let mut llm_cost = 0.0;
        if let Some(extractor) = &self.extractor {
            let mut ranked: Vec<&goodmeasure_crawl::CrawledPage> = report.pages.iter().collect();
            ranked.sort_by(|a, b| b.score.raw_score.cmp(&a.score.raw_score));
            let mut pages_for_llm: Vec<(String, String)> = ranked
                .iter()
                .take(MAX_LLM_PAGES)
                .map(|p| (p.final_url.clone(), p.html.clone()))
                .collect();
            for page in ranked.iter().skip(MAX_LLM_PAGES) {
                let (outdated, reason) = self.cache.needs_llm_reprocessing(&page.url);
                if outdated {
                    debug!(url = %page.url, reason, "re-extracting under current schema");
                    pages_for_llm.push((page.final_url.clone(), page.html.clone()));
                }
            }
            let extraction = extractor.extract_pages(&pages_for_llm).await;
            llm_cost += extraction.cost_usd;
            for url in &extraction.js_needed {
                self.cache.update_had_data(
                    url,
                    false,
                    &["structured".into(), "deterministic".into(), "llm".into()],
                    true,
                    Some("content_too_short"),
                );
                state.record_outcome(url, false, true);
            }
            for (url, _) in &extraction.errors {
                state.record_outcome(url, false, false);
            }
            // Pages the LLM actually extracted from are upgraded in place.
            let extracted_urls: std::collections::HashSet<&str> =
                extraction.results.iter().map(|r| r.page_url.as_str()).collect();
            for url in extracted_urls {
                self.cache.update_had_data(
                    url,
                    true,
                    &["structured".into(), "deterministic".into(), "llm".into()],
                    false,
                    None,
                );
                state.record_outcome(url, true, false);
            }
            results.extend(extraction.results);
        }

        // PDF discovery and extraction.
        let (pdf_docs, pdf_cost) = self.extract_pdf_documents(ein, &report.pages).await;
        llm_cost += pdf_cost;

        // Per-page record of which fields it contributed.
        let mut fields_by_page: std::collections::HashMap<&str, Vec<String>> =
            std::collections::HashMap::new();
        for result in &results {
            fields_by_page
                .entry(result.page_url.as_str())
                .or_default()
                .push(result.field_name.clone());
        }
        for (url, mut fields) in fields_by_page {
            fields.sort();
            fields.dedup();
            self.cache.update_fields_extracted(url, &fields);
        }

        let merged = merge_all(&results);
        let crawl_stats = json!({
            "pages_crawled": report.pages.len(),
            "pages_scored": report.pages_scored,
            "sitemap_used": report.sitemap_used,
            "truncated_by_deadline": report.truncated_by_deadline,
            "fetch_failures": report.failures.len(),
            "pdf_documents": pdf_docs.len(),
        });
        let mut profile = Self::build_profile(website_url, Some(ein), merged, crawl_stats);
        if !pdf_docs.is_empty() {
            if let Value::Object(map) = &mut profile {
                map.insert("llm_extracted_pdfs".into(), Value::Array(pdf_docs));
            }
        }
        if llm_cost > 0.0 {
            if let Value::Object(map) = &mut profile {
                map.insert("llm_cost_usd".into(), json!(llm_cost));
            }
        }

        state.save(&self.state_dir);

        let homepage_html = report
            .pages
            .iter()
            .find(|p| p.score.page_type == goodmeasure_core::types::PageType::Homepage)
            .or_else(|| report.pages.first())
            .map(|p| p.html.clone())
            .unwrap_or_default();
        let page_urls: Vec<&str> = report.pages.iter().map(|p| p.url.as_str()).collect();
        let raw = RawPayload::new(
            json!({
                "pages": page_urls,
                "sitemap_used": report.sitemap_used,
                "final_url": report.pages.first().map(|p| p.final_url.clone()),
            }),
            homepage_html,
        );

        CollectOutcome {
            success: true,
            raw: Some(raw.encode()),
            parsed: Some(json!({ "website_profile": profile })),
            error: None,
            cost_usd: llm_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goodmeasure_extract::MergedData;
    use serde_json::json;

    fn merged_with_ein(ein: &str) -> MergedData {
        let mut merged = MergedData::default();
        merged.merged.insert("ein".into(), json!(ein));
        merged.merged.insert("mission".into(), json!("Help people"));
        merged.sources.insert("ein".into(), json!("regex-ein"));
        merged
    }

    #[test]
    fn matching_site_ein_is_normalized() {
        let profile = WebsiteCollector::build_profile(
            "https://example.org",
            Some("95-4453134"),
            merged_with_ein("954453134"),
            json!({}),
        );
        assert_eq!(profile["ein"], "95-4453134");
        assert!(profile.get("related_ein").is_none());
    }

    #[test]
    fn mismatched_site_ein_becomes_related() {
        let profile = WebsiteCollector::build_profile(
            "https://example.org",
            Some("95-4453134"),
            merged_with_ein("30-0298794"),
            json!({}),
        );
        assert!(profile.get("ein").is_none());
        assert_eq!(profile["related_ein"], "30-0298794");
    }

    #[test]
    fn provenance_map_is_carried() {
        let profile = WebsiteCollector::build_profile(
            "https://example.org",
            Some("95-4453134"),
            merged_with_ein("95-4453134"),
            json!({}),
        );
        assert_eq!(profile["data_sources"]["ein"], "regex-ein");
        assert_eq!(profile["url"], "https://example.org");
    }
}
