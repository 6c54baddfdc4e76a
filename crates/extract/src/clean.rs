//! HTML-to-text cleaning for LLM input.
//!
//! Two passes: a precision pass that only reads obvious content containers,
//! and a relaxed pass over the whole body when that comes back empty. Pages
//! that still clean to under 100 characters are flagged as needing JS
//! rendering and skipped.

use scraper::{Html, Selector};

pub const MIN_CONTENT_CHARS: usize = 100;

const PRECISION_CONTAINERS: &[&str] = &["main", "article", "[role='main']", "#content", ".content"];

const TEXT_ELEMENTS: &str = "h1, h2, h3, h4, h5, h6, p, li, td, th, blockquote, figcaption, dt, dd";

#[derive(Debug, PartialEq)]
pub enum Cleaned {
    Text(String),
    /// Too little text to work with; the page almost certainly renders its
    /// content with JavaScript.
    NeedsJs,
}

pub fn clean_for_llm(html: &str) -> Cleaned {
    let document = Html::parse_document(html);

    if let Some(text) = precision_pass(&document) {
        if text.len() >= MIN_CONTENT_CHARS {
            return Cleaned::Text(text);
        }
    }
    let relaxed = relaxed_pass(&document);
    if relaxed.len() >= MIN_CONTENT_CHARS {
        Cleaned::Text(relaxed)
    } else {
        Cleaned::NeedsJs
    }
}

/// Text elements inside recognized content containers only.
fn precision_pass(document: &Html) -> Option<String> {
    let text_sel = Selector::parse(TEXT_ELEMENTS).ok()?;
    for container in PRECISION_CONTAINERS {
        let Ok(container_sel) = Selector::parse(container) else {
            continue;
        };
        let mut chunks: Vec<String> = Vec::new();
        for scope in document.select(&container_sel) {
            for el in scope.select(&text_sel) {
                push_text(&mut chunks, el);
            }
        }
        if !chunks.is_empty() {
            return Some(chunks.join("\n"));
        }
    }
    None
}

/// Text elements anywhere in the body. Selecting by element type rather than
/// walking all text nodes keeps script and style content out.
fn relaxed_pass(document: &Html) -> String {
    let Ok(text_sel) = Selector::parse(TEXT_ELEMENTS) else {
        return String::new();
    };
    let mut chunks: Vec<String> = Vec::new();
    for el in document.select(&text_sel) {
        push_text(&mut chunks, el);
    }
    chunks.join("\n")
}

fn push_text(chunks: &mut Vec<String>, el: scraper::ElementRef<'_>) {
    let text = el
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if !text.is_empty() {
        // Nested matches (a <p> inside a <li>) produce duplicate chunks.
        if chunks.last().map(|prev| prev.contains(&text)).unwrap_or(false) {
            return;
        }
        chunks.push(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_pass_prefers_main_content() {
        let html = r#"<html><body>
            <nav><p>Home About Donate Contact and lots of other navigation text goes here</p></nav>
            <main>
                <h1>Our Mission</h1>
                <p>We provide food, shelter, and education to families in need across the region,
                serving more than twelve thousand households every year through local partners.</p>
            </main>
        </body></html>"#;
        match clean_for_llm(html) {
            Cleaned::Text(text) => {
                assert!(text.contains("Our Mission"));
                assert!(text.contains("food, shelter, and education"));
                assert!(!text.contains("navigation text"));
            }
            Cleaned::NeedsJs => panic!("expected text"),
        }
    }

    #[test]
    fn relaxed_pass_kicks_in_without_containers() {
        let html = r#"<html><body>
            <div><p>We are a community organization serving thousands of meals every single week.</p>
            <p>Founded in 1994 by volunteers from the neighborhood mosque and local partners.</p></div>
        </body></html>"#;
        match clean_for_llm(html) {
            Cleaned::Text(text) => assert!(text.contains("thousands of meals")),
            Cleaned::NeedsJs => panic!("expected text"),
        }
    }

    #[test]
    fn script_content_is_excluded() {
        let html = r#"<html><body>
            <script>var config = {key: "value", tracking: "abcdefghijklmnopqrstuvwxyz0123456789"};</script>
            <p>Short.</p>
        </body></html>"#;
        assert_eq!(clean_for_llm(html), Cleaned::NeedsJs);
    }

    #[test]
    fn empty_page_needs_js() {
        assert_eq!(clean_for_llm("<html><body><div id=\"root\"></div></body></html>"), Cleaned::NeedsJs);
    }
}
