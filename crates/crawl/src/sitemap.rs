//! Sitemap discovery.
//!
//! Fetching and parsing are split so the parser stays pure. Sitemap indexes
//! are followed one level deep; gzip payloads are transparently decompressed.
//! Malformed XML yields an empty URL list, never an error to the caller.

use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

const SITEMAP_PATHS: &[&str] = &["/sitemap.xml", "/sitemap_index.xml", "/sitemap-index.xml"];

#[derive(Debug, Default, Clone)]
pub struct SitemapContent {
    /// Page URLs from a regular sitemap.
    pub urls: Vec<String>,
    /// Nested sitemap URLs from a sitemap index.
    pub nested: Vec<String>,
}

impl SitemapContent {
    pub fn is_index(&self) -> bool {
        !self.nested.is_empty()
    }
}

/// Parse sitemap XML without requiring the sitemaps.org namespace. `<loc>`
/// under `<sitemap>` is a nested sitemap, `<loc>` under `<url>` (or anywhere
/// else) is a page URL.
pub fn parse_sitemap(bytes: &[u8]) -> SitemapContent {
    let bytes = maybe_gunzip(bytes);
    let mut reader = Reader::from_reader(bytes.as_slice());
    reader.config_mut().trim_text(true);

    let mut content = SitemapContent::default();
    let mut in_sitemap_element = false;
    let mut in_loc = false;
    let mut depth = 0i32;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                depth += 1;
                match e.name().local_name().as_ref() {
                    b"sitemap" => in_sitemap_element = true,
                    b"url" => in_sitemap_element = false,
                    b"loc" => in_loc = true,
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                depth -= 1;
                match e.name().local_name().as_ref() {
                    b"sitemap" => in_sitemap_element = false,
                    b"loc" => in_loc = false,
                    _ => {}
                }
            }
            Ok(Event::Text(t)) if in_loc => {
                if let Ok(text) = t.unescape() {
                    let loc = text.trim().to_string();
                    if !loc.is_empty() {
                        if in_sitemap_element {
                            content.nested.push(loc);
                        } else {
                            content.urls.push(loc);
                        }
                    }
                }
            }
            Ok(Event::Eof) => {
                // Truncated documents (unclosed elements) are malformed.
                if depth != 0 {
                    debug!("sitemap truncated at depth {depth}");
                    return SitemapContent::default();
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("sitemap parse error: {e}");
                return SitemapContent::default();
            }
        }
        buf.clear();
    }
    content
}

/// Decompress when the payload looks gzipped; otherwise pass through.
fn maybe_gunzip(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_ok() {
            return out;
        }
    }
    bytes.to_vec()
}

pub struct SitemapDiscovery {
    http: reqwest::Client,
}

impl SitemapDiscovery {
    pub fn new(user_agent: &str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .build()
            .expect("reqwest client");
        Self { http }
    }

    /// Try the well-known sitemap locations under `origin` and flatten the
    /// first one that yields URLs. Index files are followed one level.
    pub async fn discover(&self, origin: &str) -> Vec<String> {
        let base = origin.trim_end_matches('/');
        for path in SITEMAP_PATHS {
            let sitemap_url = format!("{base}{path}");
            let Some(bytes) = self.fetch_bytes(&sitemap_url).await else {
                continue;
            };
            let content = parse_sitemap(&bytes);
            if content.is_index() {
                let mut all = Vec::new();
                for nested_url in &content.nested {
                    if let Some(nested_bytes) = self.fetch_bytes(nested_url).await {
                        all.extend(parse_sitemap(&nested_bytes).urls);
                    }
                }
                if !all.is_empty() {
                    debug!(origin, count = all.len(), "sitemap index flattened");
                    return all;
                }
            } else if !content.urls.is_empty() {
                debug!(origin, count = content.urls.len(), path, "sitemap found");
                return content.urls;
            }
        }
        Vec::new()
    }

    async fn fetch_bytes(&self, url: &str) -> Option<Vec<u8>> {
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.bytes().await.ok().map(|b| b.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const PLAIN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://charity.org/</loc></url>
  <url><loc>https://charity.org/about/</loc><lastmod>2026-01-01</lastmod></url>
</urlset>"#;

    const NO_NAMESPACE: &str = r#"<urlset>
  <url><loc>https://charity.org/donate/</loc></url>
</urlset>"#;

    const INDEX: &str = r#"<?xml version="1.0"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://charity.org/sitemap-pages.xml.gz</loc></sitemap>
  <sitemap><loc>https://charity.org/sitemap-posts.xml.gz</loc></sitemap>
</sitemapindex>"#;

    fn gzip(data: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn parses_regular_sitemap() {
        let content = parse_sitemap(PLAIN.as_bytes());
        assert_eq!(
            content.urls,
            vec!["https://charity.org/", "https://charity.org/about/"]
        );
        assert!(!content.is_index());
    }

    #[test]
    fn namespace_is_not_required() {
        let content = parse_sitemap(NO_NAMESPACE.as_bytes());
        assert_eq!(content.urls, vec!["https://charity.org/donate/"]);
    }

    #[test]
    fn index_yields_nested_sitemaps() {
        let content = parse_sitemap(INDEX.as_bytes());
        assert!(content.is_index());
        assert_eq!(content.nested.len(), 2);
        assert!(content.urls.is_empty());
    }

    #[test]
    fn gzipped_sitemap_is_decompressed() {
        let content = parse_sitemap(&gzip(PLAIN));
        assert_eq!(content.urls.len(), 2);
    }

    #[test]
    fn malformed_xml_returns_empty() {
        let content = parse_sitemap(b"<urlset><url><loc>https://x.org/</unclosed");
        assert!(content.urls.is_empty());
        assert!(content.nested.is_empty());
    }

    #[test]
    fn non_xml_returns_empty() {
        let content = parse_sitemap(b"<!DOCTYPE html><html><body>404</body></html>");
        assert!(content.urls.is_empty());
    }
}
