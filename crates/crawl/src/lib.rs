pub mod cache;
pub mod crawler;
pub mod fetch;
pub mod pdf;
pub mod ratelimit;
pub mod robots;
pub mod score;
pub mod sitemap;

pub use cache::{CachePut, CloudflareProfiles, CrawlState, CrawlerCache, HtmlCacheEntry};
pub use crawler::{CrawledPage, CrawlReport, Crawler, CrawlerConfig};
pub use fetch::{is_bot_challenge_html, FetchResult, Fetcher, IMPERSONATION_PROFILES};
pub use pdf::{ClassifiedPdf, DownloadedPdf, PdfDownloader, PdfLink};
pub use ratelimit::RateLimiter;
pub use robots::{RobotsChecker, RobotsRules};
pub use score::{llm_page_type, PageClassifier, PageScore};
pub use sitemap::{parse_sitemap, SitemapContent, SitemapDiscovery};
