//! Single-URL fetcher.
//!
//! Order of business per fetch: response cache, conditional GET with stored
//! validators, plain GET, and finally an ordered list of browser
//! impersonation profiles for hosts behind bot protection. The first profile
//! that works is learned per host and tried first on later requests.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CachePut, CloudflareProfiles, CrawlerCache};
use crate::ratelimit::RateLimiter;

/// Browser impersonation presets, tried in order. Some sites block Chrome
/// but allow Safari, so the list leads with Safari.
#[derive(Debug, Clone, Copy)]
pub struct BrowserProfile {
    pub name: &'static str,
    pub user_agent: &'static str,
    pub accept: &'static str,
    pub accept_language: &'static str,
    pub sec_ch_ua: Option<&'static str>,
}

pub const IMPERSONATION_PROFILES: &[BrowserProfile] = &[
    BrowserProfile {
        name: "safari15_5",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                     (KHTML, like Gecko) Version/15.5 Safari/605.1.15",
        accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        accept_language: "en-US,en;q=0.9",
        sec_ch_ua: None,
    },
    BrowserProfile {
        name: "chrome120",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        accept: "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        accept_language: "en-US,en;q=0.9",
        sec_ch_ua: Some("\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\""),
    },
    BrowserProfile {
        name: "edge101",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/101.0.4951.64 Safari/537.36 Edg/101.0.1210.47",
        accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        accept_language: "en-US,en;q=0.9",
        sec_ch_ua: Some("\" Not A;Brand\";v=\"99\", \"Chromium\";v=\"101\", \"Microsoft Edge\";v=\"101\""),
    },
];

pub fn profile_by_name(name: &str) -> Option<&'static BrowserProfile> {
    IMPERSONATION_PROFILES.iter().find(|p| p.name == name)
}

const PROFILE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Detect anti-bot challenge pages, which sometimes arrive with HTTP 200.
pub fn is_bot_challenge_html(html: &str) -> bool {
    if html.is_empty() {
        return false;
    }
    let mut end = html.len().min(20_000);
    while !html.is_char_boundary(end) {
        end -= 1;
    }
    let body = html[..end].to_lowercase();
    let strong = ["/cdn-cgi/challenge-platform/", "__cf$cv$params", "cf-chl-"];
    if strong.iter().any(|m| body.contains(m)) {
        return true;
    }
    body.contains("just a moment") && body.contains("cloudflare")
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub success: bool,
    pub html: Option<String>,
    pub final_url: Option<String>,
    pub error: Option<String>,
}

impl FetchResult {
    fn ok(html: String, final_url: String) -> Self {
        Self { success: true, html: Some(html), final_url: Some(final_url), error: None }
    }

    fn err(error: impl Into<String>) -> Self {
        Self { success: false, html: None, final_url: None, error: Some(error.into()) }
    }
}

pub struct Fetcher {
    http: reqwest::Client,
    cache: Arc<CrawlerCache>,
    profiles: Arc<CloudflareProfiles>,
    limiter: Arc<RateLimiter>,
    site_delay: Duration,
    timeout_seconds: u64,
    user_agent: String,
}

impl Fetcher {
    pub fn new(
        cache: Arc<CrawlerCache>,
        profiles: Arc<CloudflareProfiles>,
        limiter: Arc<RateLimiter>,
        user_agent: impl Into<String>,
        request_timeout: Duration,
        site_delay: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .gzip(true)
            .build()
            .expect("reqwest client");
        Self {
            http,
            cache,
            profiles,
            limiter,
            site_delay,
            timeout_seconds: request_timeout.as_secs(),
            user_agent: user_agent.into(),
        }
    }

    pub fn cache(&self) -> &CrawlerCache {
        &self.cache
    }

    /// Fetch a page. A `304` with no usable cache entry retries exactly once
    /// with `force = true`; the loop bounds that recursion.
    pub async fn fetch(&self, url: &str, force: bool) -> FetchResult {
        let mut force = force;
        for depth in 0..2 {
            if !force {
                let (should, reason) = self.cache.should_refetch(url, false);
                if !should {
                    if let Some(cached) = self.cache.get(url) {
                        if is_bot_challenge_html(&cached.html) {
                            debug!(url, "ignoring cached challenge page; refetching");
                        } else {
                            debug!(url, reason, "cache hit");
                            return FetchResult::ok(cached.html, cached.final_url);
                        }
                    }
                }
            }

            match self.fetch_network(url, force).await {
                NetworkOutcome::Done(result) => return result,
                NetworkOutcome::NotModifiedWithoutEntry => {
                    debug!(url, depth, "304 without cache entry; forcing refetch");
                    force = true;
                }
            }
        }
        FetchResult::err("304 loop: no cache entry after forced refetch")
    }

    async fn fetch_network(&self, url: &str, force: bool) -> NetworkOutcome {
        let host = match Url::parse(url) {
            Ok(parsed) => parsed.host_str().unwrap_or("").to_string(),
            Err(e) => return NetworkOutcome::Done(FetchResult::err(format!("invalid URL: {e}"))),
        };

        self.limiter.wait(&host, self.site_delay).await;

        let (last_modified, etag) = self.cache.http_headers(url);

        // Hosts already known to need a bypass skip the plain GET entirely.
        if let Some(profile_name) = self.profiles.get(&host) {
            if let Some(profile) = profile_by_name(&profile_name) {
                return NetworkOutcome::Done(
                    self.fetch_with_learned_profile(url, profile, last_modified, etag).await,
                );
            }
        }

        let mut request = self.http.get(url).header("User-Agent", &self.user_agent);
        if let Some(lm) = &last_modified {
            request = request.header("If-Modified-Since", lm);
        }
        if let Some(tag) = &etag {
            request = request.header("If-None-Match", tag);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return NetworkOutcome::Done(self.transport_error(e)),
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        match status {
            200 => {
                let (resp_lm, resp_etag) = response_validators(response.headers());
                let text = match response.text().await {
                    Ok(t) => t,
                    Err(e) => return NetworkOutcome::Done(FetchResult::err(format!("body read failed: {e}"))),
                };
                if is_bot_challenge_html(&text) {
                    return NetworkOutcome::Done(FetchResult::err(
                        "CAPTCHA_BLOCKED: challenge page (HTTP 200)",
                    ));
                }
                if !force && !self.cache.has_content_changed(url, &text) {
                    debug!(url, "content unchanged (hash match)");
                    return NetworkOutcome::Done(FetchResult::ok(text, final_url));
                }
                self.cache.put(
                    url,
                    CachePut {
                        html: &text,
                        final_url: &final_url,
                        last_modified: resp_lm,
                        etag: resp_etag,
                        ..Default::default()
                    },
                );
                NetworkOutcome::Done(FetchResult::ok(text, final_url))
            }
            304 => match self.cache.get(url) {
                Some(cached) => {
                    debug!(url, "304 Not Modified");
                    NetworkOutcome::Done(FetchResult::ok(cached.html, cached.final_url))
                }
                None => NetworkOutcome::NotModifiedWithoutEntry,
            },
            403 | 202 | 503 => {
                debug!(url, status, "bot protection suspected; trying impersonation profiles");
                NetworkOutcome::Done(self.fetch_with_profile_fallback(url, &host, status).await)
            }
            other => NetworkOutcome::Done(FetchResult::err(format!("HTTP {other}"))),
        }
    }

    /// Known-bypass host: single attempt with the learned profile.
    async fn fetch_with_learned_profile(
        &self,
        url: &str,
        profile: &BrowserProfile,
        last_modified: Option<String>,
        etag: Option<String>,
    ) -> FetchResult {
        let mut request = self.http.get(url).headers(profile_headers(profile));
        if let Some(lm) = &last_modified {
            request = request.header("If-Modified-Since", lm);
        }
        if let Some(tag) = &etag {
            request = request.header("If-None-Match", tag);
        }
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return self.transport_error(e),
        };
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        match status {
            200 => {
                let (resp_lm, resp_etag) = response_validators(response.headers());
                let text = match response.text().await {
                    Ok(t) => t,
                    Err(e) => return FetchResult::err(format!("body read failed: {e}")),
                };
                if is_bot_challenge_html(&text) {
                    return FetchResult::err("CAPTCHA_BLOCKED: challenge page (HTTP 200)");
                }
                self.cache.put(
                    url,
                    CachePut {
                        html: &text,
                        final_url: &final_url,
                        last_modified: resp_lm,
                        etag: resp_etag,
                        ..Default::default()
                    },
                );
                FetchResult::ok(text, final_url)
            }
            304 => match self.cache.get(url) {
                Some(cached) => FetchResult::ok(cached.html, cached.final_url),
                None => FetchResult::err("HTTP 304 without cache entry"),
            },
            other => FetchResult::err(format!("HTTP {other}")),
        }
    }

    /// Ordered profile fallback after a blocked plain GET. The first profile
    /// that returns a real 200 is persisted for the host.
    async fn fetch_with_profile_fallback(
        &self,
        url: &str,
        host: &str,
        original_status: u16,
    ) -> FetchResult {
        for (i, profile) in IMPERSONATION_PROFILES.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(PROFILE_RETRY_DELAY).await;
            }
            debug!(url, profile = profile.name, "attempting impersonation");
            let response = match self.http.get(url).headers(profile_headers(profile)).send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(url, profile = profile.name, "profile attempt failed: {e}");
                    continue;
                }
            };
            if response.status().as_u16() != 200 {
                debug!(url, profile = profile.name, status = response.status().as_u16(), "profile rejected");
                continue;
            }
            let final_url = response.url().to_string();
            let (resp_lm, resp_etag) = response_validators(response.headers());
            let text = match response.text().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if is_bot_challenge_html(&text) {
                debug!(url, profile = profile.name, "profile returned challenge HTML");
                continue;
            }
            debug!(host, profile = profile.name, "impersonation bypass learned for host");
            self.profiles.set(host, profile.name);
            self.cache.put(
                url,
                CachePut {
                    html: &text,
                    final_url: &final_url,
                    last_modified: resp_lm,
                    etag: resp_etag,
                    ..Default::default()
                },
            );
            return FetchResult::ok(text, final_url);
        }
        warn!(url, original_status, "all impersonation profiles failed");
        FetchResult::err(format!("HTTP {original_status} (even with impersonation)"))
    }

    /// Binary download with the same bypass discipline, used for PDFs. No
    /// caching; callers validate and store the bytes themselves.
    pub async fn download_bytes(&self, url: &str) -> Result<Vec<u8>, String> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();
        self.limiter.wait(&host, self.site_delay).await;

        // Learned-bypass hosts skip the plain GET.
        let attempt_profiles: Vec<Option<&BrowserProfile>> = match self.profiles.get(&host) {
            Some(name) => vec![profile_by_name(&name)],
            None => vec![None],
        };

        let mut last_error = String::new();
        let mut blocked = false;
        for profile in attempt_profiles {
            match self.send_binary(url, profile).await {
                Ok(Some(bytes)) => return Ok(bytes),
                Ok(None) => {
                    blocked = true;
                    break;
                }
                Err(e) => last_error = e,
            }
        }
        if blocked {
            for profile in IMPERSONATION_PROFILES {
                tokio::time::sleep(PROFILE_RETRY_DELAY).await;
                match self.send_binary(url, Some(profile)).await {
                    Ok(Some(bytes)) => {
                        self.profiles.set(&host, profile.name);
                        return Ok(bytes);
                    }
                    Ok(None) => continue,
                    Err(e) => last_error = e,
                }
            }
            return Err("blocked (even with impersonation)".to_string());
        }
        Err(last_error)
    }

    /// Ok(Some(bytes)) on success, Ok(None) when blocked (worth a profile
    /// retry), Err for everything else.
    async fn send_binary(
        &self,
        url: &str,
        profile: Option<&BrowserProfile>,
    ) -> Result<Option<Vec<u8>>, String> {
        let request = match profile {
            Some(p) => self.http.get(url).headers(profile_headers(p)),
            None => self.http.get(url).header("User-Agent", &self.user_agent),
        };
        let response = request.send().await.map_err(|e| format!("Request failed: {e}"))?;
        match response.status().as_u16() {
            200 => Ok(Some(
                response
                    .bytes()
                    .await
                    .map_err(|e| format!("body read failed: {e}"))?
                    .to_vec(),
            )),
            403 | 202 | 503 => Ok(None),
            other => Err(format!("HTTP {other}")),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> FetchResult {
        if e.is_timeout() {
            FetchResult::err(format!("Request timeout after {}s", self.timeout_seconds))
        } else {
            FetchResult::err(format!("Request failed: {e}"))
        }
    }
}

enum NetworkOutcome {
    Done(FetchResult),
    NotModifiedWithoutEntry,
}

fn profile_headers(profile: &BrowserProfile) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("User-Agent", HeaderValue::from_static(profile.user_agent));
    headers.insert("Accept", HeaderValue::from_static(profile.accept));
    headers.insert("Accept-Language", HeaderValue::from_static(profile.accept_language));
    if let Some(ch_ua) = profile.sec_ch_ua {
        headers.insert("Sec-CH-UA", HeaderValue::from_static(ch_ua));
        headers.insert("Sec-CH-UA-Mobile", HeaderValue::from_static("?0"));
        headers.insert("Sec-CH-UA-Platform", HeaderValue::from_static("\"Windows\""));
    }
    headers
}

fn response_validators(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let lm = headers
        .get("Last-Modified")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let etag = headers
        .get("ETag")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    (lm, etag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_markers_are_detected() {
        assert!(is_bot_challenge_html("<script src=\"/cdn-cgi/challenge-platform/x.js\"></script>"));
        assert!(is_bot_challenge_html("window.__CF$cv$params = {}"));
        assert!(is_bot_challenge_html("<div class=\"cf-chl-widget\"></div>"));
        assert!(is_bot_challenge_html(
            "<title>Just a moment...</title> protected by Cloudflare"
        ));
    }

    #[test]
    fn ordinary_pages_are_not_challenges() {
        assert!(!is_bot_challenge_html("<html><body>Welcome to our charity</body></html>"));
        assert!(!is_bot_challenge_html(""));
        // "just a moment" alone is not enough without the vendor marker.
        assert!(!is_bot_challenge_html("just a moment while we load your donation page"));
    }

    #[test]
    fn profile_order_leads_with_safari() {
        assert_eq!(IMPERSONATION_PROFILES[0].name, "safari15_5");
        assert_eq!(IMPERSONATION_PROFILES.len(), 3);
        assert!(profile_by_name("chrome120").is_some());
        assert!(profile_by_name("nope").is_none());
    }
}
