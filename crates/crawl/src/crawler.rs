//! Per-site crawler.
//!
//! Sitemap mode discovers and scores URLs up front, then fetches the selected
//! set concurrently. When no sitemap exists the crawler falls back to
//! breadth-first link following. Both modes share the page budget, the
//! in-flight semaphore, and a wall-clock deadline that cancels outstanding
//! fetches and returns partial results.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::fetch::Fetcher;
use crate::robots::RobotsChecker;
use crate::score::{PageClassifier, PageScore};
use crate::sitemap::SitemapDiscovery;

/// Crawler-trap URL shapes that are never worth the budget.
static SKIP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"/calendar/",
        r"/events/\d{4}/",
        r"/blog/page/\d+",
        r"/page/\d+",
        r"/archive/",
        r"/\d{4}/\d{2}/",
        r"\?.*page=",
        r"/search",
        r"/tag/",
        r"/category/",
        r"/wp-admin/",
        r"/login",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("skip pattern"))
    .collect()
});

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub max_pages: usize,
    pub max_depth: u32,
    pub timeout_total: Duration,
    pub max_concurrency: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_pages: 50,
            max_depth: 3,
            timeout_total: Duration::from_secs(90),
            max_concurrency: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawledPage {
    pub url: String,
    pub final_url: String,
    pub html: String,
    pub score: PageScore,
}

#[derive(Debug, Default)]
pub struct CrawlReport {
    pub pages: Vec<CrawledPage>,
    pub failures: Vec<(String, String)>,
    pub sitemap_used: bool,
    pub pages_scored: usize,
    pub truncated_by_deadline: bool,
}

pub struct Crawler {
    fetcher: Arc<Fetcher>,
    sitemap: SitemapDiscovery,
    robots: RobotsChecker,
    classifier: PageClassifier,
    config: CrawlerConfig,
}

impl Crawler {
    pub fn new(fetcher: Arc<Fetcher>, user_agent: &str, config: CrawlerConfig) -> Self {
        Self {
            fetcher,
            sitemap: SitemapDiscovery::new(user_agent),
            robots: RobotsChecker::new(user_agent),
            classifier: PageClassifier::new(),
            config,
        }
    }

    pub fn classifier(&self) -> &PageClassifier {
        &self.classifier
    }

    pub async fn crawl(&self, origin: &str) -> CrawlReport {
        let deadline = Instant::now() + self.config.timeout_total;
        let mut report = CrawlReport::default();

        let sitemap_urls = self.sitemap.discover(origin).await;
        if !sitemap_urls.is_empty() {
            report.sitemap_used = true;
            self.crawl_sitemap(origin, sitemap_urls, deadline, &mut report).await;
        } else {
            info!(origin, "no sitemap; falling back to link-following");
            self.crawl_bfs(origin, deadline, &mut report).await;
        }
        info!(
            origin,
            pages = report.pages.len(),
            failures = report.failures.len(),
            sitemap = report.sitemap_used,
            truncated = report.truncated_by_deadline,
            "crawl finished"
        );
        report
    }

    async fn crawl_sitemap(
        &self,
        origin: &str,
        sitemap_urls: Vec<String>,
        deadline: Instant,
        report: &mut CrawlReport,
    ) {
        let mut candidates: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for url in sitemap_urls {
            let Some(normalized) = normalize_url(&url) else { continue };
            if !is_same_root_domain(origin, &normalized) || should_skip_url(&normalized) {
                continue;
            }
            if seen.insert(normalized.clone()) {
                candidates.push(normalized);
            }
        }

        // Always consider the homepage even when the sitemap omits it.
        if let Some(home) = normalize_url(origin) {
            if seen.insert(home.clone()) {
                candidates.push(home);
            }
        }

        let mut allowed = Vec::new();
        for url in candidates {
            if self.robots.can_fetch(&url).await {
                allowed.push(url);
            }
        }
        report.pages_scored = allowed.len();

        let scores: Vec<PageScore> = allowed
            .iter()
            .map(|u| self.classifier.score_url(u, None))
            .collect();
        let selected = self.classifier.select_top_pages(scores, self.config.max_pages);
        debug!(origin, selected = selected.len(), "sitemap selection done");

        self.fetch_batch(selected, deadline, report).await;
    }

    async fn crawl_bfs(&self, origin: &str, deadline: Instant, report: &mut CrawlReport) {
        let Some(start) = normalize_url(origin) else {
            report.failures.push((origin.to_string(), "invalid origin URL".into()));
            return;
        };

        let mut visited: HashSet<String> = HashSet::new();
        let mut level: Vec<String> = vec![start];
        let mut depth = 0u32;

        while !level.is_empty() && depth <= self.config.max_depth {
            if report.pages.len() >= self.config.max_pages || Instant::now() >= deadline {
                report.truncated_by_deadline = Instant::now() >= deadline;
                break;
            }

            let budget = self.config.max_pages - report.pages.len();
            let mut batch: Vec<PageScore> = Vec::new();
            for url in level.drain(..) {
                if batch.len() >= budget {
                    break;
                }
                if !visited.insert(url.clone()) {
                    continue;
                }
                if !self.robots.can_fetch(&url).await {
                    continue;
                }
                batch.push(self.classifier.score_url(&url, None));
            }
            report.pages_scored += batch.len();

            let before = report.pages.len();
            self.fetch_batch(batch, deadline, report).await;
            if report.truncated_by_deadline {
                break;
            }

            // Collect next level from the pages fetched this round.
            let mut next: Vec<String> = Vec::new();
            let mut next_seen: HashSet<String> = HashSet::new();
            for page in &report.pages[before..] {
                for link in extract_links(&page.html, &page.final_url) {
                    let Some(normalized) = normalize_url(&link) else { continue };
                    if visited.contains(&normalized)
                        || !is_same_root_domain(origin, &normalized)
                        || should_skip_url(&normalized)
                    {
                        continue;
                    }
                    if next_seen.insert(normalized.clone()) {
                        next.push(normalized);
                    }
                }
            }
            level = next;
            depth += 1;
        }
    }

    /// Fetch a scored batch under the semaphore and the shared deadline.
    /// Pages fetched before the deadline land in the report; the rest are
    /// cancelled.
    async fn fetch_batch(&self, batch: Vec<PageScore>, deadline: Instant, report: &mut CrawlReport) {
        if batch.is_empty() {
            return;
        }
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut set: JoinSet<(PageScore, crate::fetch::FetchResult)> = JoinSet::new();

        for score in batch {
            let permit_source = Arc::clone(&semaphore);
            let fetcher = Arc::clone(&self.fetcher);
            set.spawn(async move {
                let _permit = permit_source.acquire_owned().await.expect("semaphore");
                let result = fetcher.fetch(&score.url, false).await;
                (score, result)
            });
        }

        loop {
            tokio::select! {
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((score, result)) => {
                            if result.success {
                                let html = result.html.unwrap_or_default();
                                let boosted = self.classifier.apply_content_boost(&score, &html);
                                report.pages.push(CrawledPage {
                                    url: score.url.clone(),
                                    final_url: result.final_url.unwrap_or_else(|| score.url.clone()),
                                    html,
                                    score: boosted,
                                });
                            } else {
                                let error = result.error.unwrap_or_else(|| "unknown".into());
                                warn!(url = %score.url, error, "page fetch failed");
                                report.failures.push((score.url.clone(), error));
                            }
                        }
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => warn!("fetch task panicked: {e}"),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("crawl deadline reached; cancelling in-flight fetches");
                    set.abort_all();
                    report.truncated_by_deadline = true;
                    while set.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }
}

/// Normalize for dedup: lowercase scheme/host, drop fragments, strip
/// trailing slash from non-root paths.
pub fn normalize_url(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.set_fragment(None);
    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') && parsed.query().is_none() {
        parsed.set_path(path.trim_end_matches('/'));
    }
    Some(parsed.to_string())
}

/// Same registrable domain, subdomain-aware: `blog.charity.org` counts as
/// `charity.org`.
pub fn is_same_root_domain(a: &str, b: &str) -> bool {
    fn root(host: &str) -> String {
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() >= 2 {
            labels[labels.len() - 2..].join(".")
        } else {
            host.to_string()
        }
    }
    let host_a = Url::parse(a).ok().and_then(|u| u.host_str().map(str::to_lowercase));
    let host_b = Url::parse(b).ok().and_then(|u| u.host_str().map(str::to_lowercase));
    match (host_a, host_b) {
        (Some(ha), Some(hb)) => root(&ha) == root(&hb),
        _ => false,
    }
}

pub fn should_skip_url(url: &str) -> bool {
    SKIP_PATTERNS.iter().any(|re| re.is_match(url))
}

/// Same-document `<a href>` targets, resolved against the page URL.
pub fn extract_links(html: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            if href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with("data:")
                || href.starts_with('#')
            {
                return None;
            }
            base.join(href).ok().map(|u| u.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_dedupes_equivalent_urls() {
        assert_eq!(
            normalize_url("https://Charity.org/About/#team").unwrap(),
            "https://charity.org/About"
        );
        assert_eq!(normalize_url("https://charity.org/").unwrap(), "https://charity.org/");
        assert!(normalize_url("mailto:info@charity.org").is_none());
    }

    #[test]
    fn subdomains_share_a_root_domain() {
        assert!(is_same_root_domain("https://charity.org/", "https://blog.charity.org/post"));
        assert!(!is_same_root_domain("https://charity.org/", "https://othersite.org/"));
    }

    #[test]
    fn trap_patterns_are_skipped() {
        assert!(should_skip_url("https://c.org/blog/page/3"));
        assert!(should_skip_url("https://c.org/2024/05/archive-post"));
        assert!(should_skip_url("https://c.org/events/2025/gala"));
        assert!(should_skip_url("https://c.org/?s=x&page=2"));
        assert!(!should_skip_url("https://c.org/programs/"));
    }

    #[test]
    fn link_extraction_resolves_and_filters() {
        let html = r##"<html><body>
            <a href="/about/">About</a>
            <a href="https://charity.org/donate">Donate</a>
            <a href="mailto:info@charity.org">Email</a>
            <a href="#section">Jump</a>
            <a href="javascript:void(0)">JS</a>
        </body></html>"##;
        let links = extract_links(html, "https://charity.org/");
        assert_eq!(
            links,
            vec!["https://charity.org/about/", "https://charity.org/donate"]
        );
    }
}
