//! Fetcher behavior against a scripted HTTP server: conditional GET, the
//! bounded 304 retry, and the bot-bypass profile fallback with per-host
//! learning.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use goodmeasure_crawl::cache::{CachePut, CloudflareProfiles, CrawlerCache};
use goodmeasure_crawl::fetch::{Fetcher, IMPERSONATION_PROFILES};
use goodmeasure_crawl::ratelimit::RateLimiter;

fn fetcher(dir: &TempDir) -> (Fetcher, Arc<CrawlerCache>, Arc<CloudflareProfiles>) {
    let cache = Arc::new(CrawlerCache::new(dir.path(), 30).unwrap());
    let profiles = Arc::new(CloudflareProfiles::load(cache.state_dir()));
    let limiter = Arc::new(RateLimiter::new());
    let fetcher = Fetcher::new(
        Arc::clone(&cache),
        Arc::clone(&profiles),
        limiter,
        "GoodMeasureBot/1.0",
        Duration::from_secs(10),
        Duration::ZERO,
    );
    (fetcher, cache, profiles)
}

#[tokio::test]
async fn fresh_fetch_populates_cache() {
    let dir = TempDir::new().unwrap();
    let (fetcher, cache, _) = fetcher(&dir);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/about"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html>About us</html>")
                .insert_header("ETag", "\"v1\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/about", server.uri());
    let result = fetcher.fetch(&url, false).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.html.as_deref(), Some("<html>About us</html>"));

    let entry = cache.get(&url).unwrap();
    assert_eq!(entry.etag.as_deref(), Some("\"v1\""));

    // Second fetch is served from cache; the mock's expect(1) verifies no
    // second request went out.
    let again = fetcher.fetch(&url, false).await;
    assert!(again.success);
}

#[tokio::test]
async fn forced_fetch_sends_conditional_headers_and_304_serves_cache() {
    let dir = TempDir::new().unwrap();
    let (fetcher, cache, _) = fetcher(&dir);
    let server = MockServer::start().await;

    let url = format!("{}/page", server.uri());
    cache.put(
        &url,
        CachePut {
            html: "<html>cached body</html>",
            final_url: &url,
            etag: Some("\"v7\"".into()),
            ..Default::default()
        },
    );

    Mock::given(method("GET"))
        .and(path("/page"))
        .and(header("If-None-Match", "\"v7\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let result = fetcher.fetch(&url, true).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.html.as_deref(), Some("<html>cached body</html>"));
}

#[tokio::test]
async fn bare_304_triggers_exactly_one_forced_retry() {
    let dir = TempDir::new().unwrap();
    let (fetcher, _cache, _) = fetcher(&dir);
    let server = MockServer::start().await;

    // First answer is a (bogus) 304 with no cache entry on our side; the
    // fetcher must retry exactly once with force and then stop.
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(304))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>real</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/flaky", server.uri());
    let result = fetcher.fetch(&url, false).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.html.as_deref(), Some("<html>real</html>"));
}

#[tokio::test]
async fn blocked_host_learns_working_profile() {
    let dir = TempDir::new().unwrap();
    let (fetcher, _cache, profiles) = fetcher(&dir);
    let server = MockServer::start().await;
    let safari_ua = IMPERSONATION_PROFILES[0].user_agent;

    // The Safari profile gets through; anything else sees a challenge.
    Mock::given(method("GET"))
        .and(path("/protected"))
        .and(header("User-Agent", safari_ua))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>report data</html>"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .respond_with(
            ResponseTemplate::new(403).set_body_string("<div class=\"cf-chl-widget\"></div>"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/protected", server.uri());
    let result = fetcher.fetch(&url, false).await;
    assert!(result.success, "{:?}", result.error);

    // The working profile is learned for the host and persisted.
    let host = url::Url::parse(&url).unwrap().host_str().unwrap().to_string();
    assert_eq!(profiles.get(&host).as_deref(), Some("safari15_5"));
    let persisted =
        std::fs::read_to_string(dir.path().join("state/cloudflare_profiles.json")).unwrap();
    assert!(persisted.contains("safari15_5"));
}

#[tokio::test]
async fn learned_host_skips_plain_get() {
    let dir = TempDir::new().unwrap();
    let (fetcher, _cache, profiles) = fetcher(&dir);
    let server = MockServer::start().await;
    let safari_ua = IMPERSONATION_PROFILES[0].user_agent;

    let host = url::Url::parse(&server.uri()).unwrap().host_str().unwrap().to_string();
    profiles.set(&host, "safari15_5");

    // Only the Safari profile mock exists: a plain GET would 404 and fail the
    // fetch, so success proves the learned profile was used first.
    Mock::given(method("GET"))
        .and(path("/second-page"))
        .and(header("User-Agent", safari_ua))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>second</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/second-page", server.uri());
    let result = fetcher.fetch(&url, false).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.html.as_deref(), Some("<html>second</html>"));
}

#[tokio::test]
async fn challenge_with_200_is_reported_as_captcha_blocked() {
    let dir = TempDir::new().unwrap();
    let (fetcher, _cache, _) = fetcher(&dir);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/challenge"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<title>Just a moment...</title><p>checking your browser, cloudflare</p>",
        ))
        .mount(&server)
        .await;

    let url = format!("{}/challenge", server.uri());
    let result = fetcher.fetch(&url, false).await;
    assert!(!result.success);
    assert!(result.error.unwrap().starts_with("CAPTCHA_BLOCKED"));
}

#[tokio::test]
async fn all_profiles_failing_reports_original_status() {
    let dir = TempDir::new().unwrap();
    let (fetcher, _cache, _) = fetcher(&dir);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/wall"))
        .respond_with(ResponseTemplate::new(403).set_body_string("cf-chl- blocked"))
        .mount(&server)
        .await;

    let url = format!("{}/wall", server.uri());
    let result = fetcher.fetch(&url, false).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("HTTP 403 (even with impersonation)"));
}
