//! Sitemap discovery against a scripted server: index flattening with
//! gzipped children, fallback paths, and graceful handling of malformed XML.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use goodmeasure_crawl::SitemapDiscovery;

fn gzip(data: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

fn urlset(urls: &[&str]) -> String {
    let entries: String = urls
        .iter()
        .map(|u| format!("<url><loc>{u}</loc></url>"))
        .collect();
    format!(
        "<?xml version=\"1.0\"?><urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">{entries}</urlset>"
    )
}

#[tokio::test]
async fn index_with_gzipped_children_returns_the_union() {
    let server = MockServer::start().await;
    let index = format!(
        "<?xml version=\"1.0\"?><sitemapindex><sitemap><loc>{0}/sitemap-pages.xml.gz</loc></sitemap><sitemap><loc>{0}/sitemap-posts.xml.gz</loc></sitemap></sitemapindex>",
        server.uri()
    );

    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(index))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sitemap-pages.xml.gz"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(gzip(&urlset(&["https://c.org/", "https://c.org/about/"]))),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sitemap-posts.xml.gz"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(gzip(&urlset(&["https://c.org/donate/"]))),
        )
        .mount(&server)
        .await;

    let discovery = SitemapDiscovery::new("GoodMeasureBot/1.0");
    let urls = discovery.discover(&server.uri()).await;
    assert_eq!(
        urls,
        vec!["https://c.org/", "https://c.org/about/", "https://c.org/donate/"]
    );
}

#[tokio::test]
async fn alternate_index_paths_are_tried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sitemap_index.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(urlset(&["https://c.org/impact/"])))
        .mount(&server)
        .await;

    let discovery = SitemapDiscovery::new("GoodMeasureBot/1.0");
    let urls = discovery.discover(&server.uri()).await;
    assert_eq!(urls, vec!["https://c.org/impact/"]);
}

#[tokio::test]
async fn malformed_sitemap_yields_empty_without_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<urlset><url><loc>https://c"))
        .mount(&server)
        .await;
    // The other well-known paths 404.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let discovery = SitemapDiscovery::new("GoodMeasureBot/1.0");
    assert!(discovery.discover(&server.uri()).await.is_empty());
}
