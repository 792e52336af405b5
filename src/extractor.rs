//! Readable-article extraction from raw HTML
//!
//! The pipeline only needs "HTML in, article out"; everything else about
//! readability is behind the [`Extractor`] trait so hosts can plug in their
//! own implementation.

use std::sync::Arc;

use htmd::HtmlToMarkdown;
use scraper::{Html, Selector};
use tracing::debug;

use crate::error::Error;

/// A readable article distilled from one page.
#[derive(Debug, Clone)]
pub struct Article {
    pub title: String,
    pub byline: Option<String>,
    pub excerpt: Option<String>,
    pub site_name: Option<String>,
    pub markdown: String,
}

/// Extracts a readable article from raw HTML.
pub trait Extractor: Send + Sync {
    /// Returns [`Error::ExtractionFailed`] when the page holds no article.
    fn extract(&self, html: &str, base_url: &str) -> Result<Article, Error>;
}

/// Default extractor: scraper for metadata, htmd for the body markdown.
///
/// Prefers the `<article>`/`<main>` subtree when one carries enough text,
/// falling back to converting the whole document.
pub struct HtmdExtractor {
    converter: Arc<HtmlToMarkdown>,
}

impl Clone for HtmdExtractor {
    fn clone(&self) -> Self {
        Self {
            converter: Arc::clone(&self.converter),
        }
    }
}

impl HtmdExtractor {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe",
                "svg", "form", "button",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }
}

impl Default for HtmdExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimum text length for a content subtree to stand in for the document.
const MIN_CONTENT_CHARS: usize = 250;

impl Extractor for HtmdExtractor {
    fn extract(&self, html: &str, base_url: &str) -> Result<Article, Error> {
        let doc = Html::parse_document(html);

        let title = select_text(&doc, "title")
            .or_else(|| select_attr(&doc, "meta[property='og:title']", "content"))
            .or_else(|| select_text(&doc, "h1"))
            .unwrap_or_else(|| base_url.to_string());

        let byline = select_attr(&doc, "meta[name='author']", "content")
            .or_else(|| select_text(&doc, "[rel='author']"));

        let excerpt = select_attr(&doc, "meta[name='description']", "content")
            .or_else(|| select_attr(&doc, "meta[property='og:description']", "content"));

        let site_name = select_attr(&doc, "meta[property='og:site_name']", "content");

        let source = main_content(&doc).unwrap_or_else(|| html.to_string());
        let markdown = self
            .converter
            .convert(&source)
            .map_err(|e| Error::ExtractionFailed(format!("{}: {}", base_url, e)))?;
        let markdown = markdown.trim().to_string();

        if markdown.is_empty() {
            return Err(Error::ExtractionFailed(base_url.to_string()));
        }

        debug!(chars = markdown.len(), "extracted article body");
        Ok(Article {
            title,
            byline,
            excerpt,
            site_name,
            markdown,
        })
    }
}

/// Pick the first content landmark with enough text to be the article.
fn main_content(doc: &Html) -> Option<String> {
    for sel_str in ["article", "main", "[role='main']"] {
        let Ok(sel) = Selector::parse(sel_str) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            let text_len: usize = el.text().map(|t| t.trim().len()).sum();
            if text_len >= MIN_CONTENT_CHARS {
                return Some(el.html());
            }
        }
    }
    None
}

fn select_text(doc: &Html, sel: &str) -> Option<String> {
    let selector = Selector::parse(sel).ok()?;
    doc.select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn select_attr(doc: &Html, sel: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(sel).ok()?;
    doc.select(&selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_extract_basic_page() {
        let html = r#"
            <html>
            <head>
                <title>Test Page</title>
                <meta name="description" content="A page about testing.">
                <meta property="og:site_name" content="Example Docs">
            </head>
            <body>
                <h1>Main Title</h1>
                <p>Some content here that is long enough to matter.</p>
            </body>
            </html>
        "#;
        let article = HtmdExtractor::new()
            .extract(html, "https://test.com")
            .unwrap();
        assert_eq!(article.title, "Test Page");
        assert_eq!(article.excerpt.as_deref(), Some("A page about testing."));
        assert_eq!(article.site_name.as_deref(), Some("Example Docs"));
        assert!(article.markdown.contains("Main Title"));
        assert!(article.markdown.contains("content here"));
    }

    #[test]
    fn test_prefers_article_element() {
        let filler = "This sentence pads the article body out. ".repeat(10);
        let html = format!(
            "<html><body>\
             <div class=\"sidebar\">unrelated navigation text</div>\
             <article><p>{}</p></article>\
             </body></html>",
            filler
        );
        let article = HtmdExtractor::new()
            .extract(&html, "https://test.com")
            .unwrap();
        assert!(article.markdown.contains("pads the article body"));
        assert!(!article.markdown.contains("unrelated navigation"));
    }

    #[test]
    fn test_empty_page_is_extraction_failure() {
        let html = "<html><head><script>var x;</script></head><body></body></html>";
        let err = HtmdExtractor::new()
            .extract(html, "https://empty.example")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
    }

    #[test]
    fn test_title_falls_back_to_url() {
        let html = "<html><body><p>Body text without any title tags at all.</p></body></html>";
        let article = HtmdExtractor::new()
            .extract(html, "https://no-title.example/x")
            .unwrap();
        assert_eq!(article.title, "https://no-title.example/x");
    }

    #[test]
    fn test_byline_from_meta() {
        let html = r#"
            <html><head><title>T</title><meta name="author" content="Ada L."></head>
            <body><p>Content body.</p></body></html>
        "#;
        let article = HtmdExtractor::new()
            .extract(html, "https://test.com")
            .unwrap();
        assert_eq!(article.byline.as_deref(), Some("Ada L."));
    }
}
