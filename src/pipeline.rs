//! Quality-gated fetch pipeline
//!
//! Plain HTTP first, headless browser second. The scorer decides: a clearly
//! good simple fetch skips the expensive renderer entirely, a marginal one
//! keeps the simple result around as a floor to beat, and an unusable one
//! makes the renderer mandatory.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{BrowserManager, WaitStrategy};
use crate::error::{Error, ErrorKind};
use crate::extractor::{Article, Extractor, HtmdExtractor};
use crate::quality::{self, QualityVerdict};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const QUALITY_SUGGESTION: &str =
    "The page may be behind a login wall or may not be suited to article extraction.";
const ENGINE_SUGGESTION: &str =
    "Install Chrome or Chromium to enable the browser fallback renderer.";

/// Why the pipeline escalated to the browser renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    Forced,
    NetworkError,
    ExtractionFailed,
    QualityMarginal,
    QualityTooLow,
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FallbackReason::Forced => "forced",
            FallbackReason::NetworkError => "network_error",
            FallbackReason::ExtractionFailed => "extraction_failed",
            FallbackReason::QualityMarginal => "quality_marginal",
            FallbackReason::QualityTooLow => "quality_too_low",
        };
        f.write_str(s)
    }
}

/// Pipeline tuning knobs.
///
/// `min_score` is the hard floor below which nothing is accepted;
/// `fallback_threshold` is the bar a simple fetch must clear to skip the
/// renderer. `min_score` must stay below `fallback_threshold`.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub min_score: u8,
    pub fallback_threshold: u8,
    pub force_fallback: bool,
    pub wait: WaitStrategy,
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            min_score: 60,
            fallback_threshold: 80,
            force_fallback: false,
            wait: WaitStrategy::default(),
            timeout: Duration::from_millis(30_000),
        }
    }
}

/// Terminal result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub success: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(skip_serializing)]
    pub markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<QualityVerdict>,
    pub used_fallback_renderer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl FetchOutcome {
    fn accepted(
        url: &str,
        article: Article,
        verdict: QualityVerdict,
        used_fallback_renderer: bool,
        fallback_reason: Option<FallbackReason>,
    ) -> Self {
        Self {
            success: true,
            url: url.to_string(),
            title: Some(article.title),
            byline: article.byline,
            excerpt: article.excerpt,
            site_name: article.site_name,
            markdown: Some(article.markdown),
            verdict: Some(verdict),
            used_fallback_renderer,
            fallback_reason,
            error: None,
            error_kind: None,
            suggestion: None,
        }
    }

    fn failed(
        url: &str,
        error: &Error,
        fallback_reason: Option<FallbackReason>,
        used_fallback_renderer: bool,
    ) -> Self {
        let (verdict, suggestion) = match error {
            Error::QualityRejected {
                verdict,
                suggestion,
            } => (Some(verdict.clone()), Some(suggestion.clone())),
            Error::EngineUnavailable(_) => (None, Some(ENGINE_SUGGESTION.to_string())),
            _ => (None, None),
        };
        Self {
            success: false,
            url: url.to_string(),
            title: None,
            byline: None,
            excerpt: None,
            site_name: None,
            markdown: None,
            verdict,
            used_fallback_renderer,
            fallback_reason,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            suggestion,
        }
    }
}

/// The fetch orchestrator. Cheap to clone via its parts; hosts usually keep
/// one per process next to the [`BrowserManager`] it shares.
pub struct FetchPipeline<E = HtmdExtractor> {
    http: Client,
    extractor: E,
    browser: BrowserManager,
}

impl FetchPipeline<HtmdExtractor> {
    pub fn new(browser: BrowserManager) -> Result<Self, Error> {
        Self::with_extractor(HtmdExtractor::new(), browser)
    }
}

impl<E: Extractor> FetchPipeline<E> {
    pub fn with_extractor(extractor: E, browser: BrowserManager) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            extractor,
            browser,
        })
    }

    pub fn browser(&self) -> &BrowserManager {
        &self.browser
    }

    /// Run the full quality-gated fetch for one URL.
    pub async fn fetch(&self, url: &str, opts: &FetchOptions) -> FetchOutcome {
        debug_assert!(opts.min_score < opts.fallback_threshold);

        if let Err(e) = validate_url(url) {
            return FetchOutcome::failed(url, &e, None, false);
        }

        if opts.force_fallback {
            return self
                .fallback_fetch(url, opts, FallbackReason::Forced, None)
                .await;
        }

        let html = match self.simple_fetch(url).await {
            Ok(html) => html,
            Err(e) => {
                info!("simple fetch failed, escalating to renderer: {}", e);
                return self
                    .fallback_fetch(url, opts, FallbackReason::NetworkError, None)
                    .await;
            }
        };

        let article = match self.extractor.extract(&html, url) {
            Ok(article) => article,
            Err(e) => {
                info!("extraction failed on simple fetch, escalating: {}", e);
                return self
                    .fallback_fetch(url, opts, FallbackReason::ExtractionFailed, None)
                    .await;
            }
        };

        let verdict = quality::score(&article.markdown, Some(html.len()));
        debug!(score = verdict.score, url, "simple fetch scored");

        if verdict.score >= opts.fallback_threshold {
            return FetchOutcome::accepted(url, article, verdict, false, None);
        }
        if verdict.score >= opts.min_score {
            // Good enough to keep as a floor, not good enough to stop
            self.fallback_fetch(
                url,
                opts,
                FallbackReason::QualityMarginal,
                Some((article, verdict)),
            )
            .await
        } else {
            self.fallback_fetch(url, opts, FallbackReason::QualityTooLow, None)
                .await
        }
    }

    async fn simple_fetch(&self, url: &str) -> Result<String, Error> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        // Non-2xx pages still carry a body; the scorer judges what came back
        response
            .text()
            .await
            .map_err(|e| Error::Network(format!("failed to read response body: {}", e)))
    }

    async fn fallback_fetch(
        &self,
        url: &str,
        opts: &FetchOptions,
        reason: FallbackReason,
        remembered: Option<(Article, QualityVerdict)>,
    ) -> FetchOutcome {
        info!(%reason, url, "fetching with browser renderer");

        let rendered = match self.render(url, opts).await {
            Ok(html) => html,
            Err(e) => {
                if let Some((article, verdict)) = remembered {
                    warn!("renderer failed, keeping marginal simple result: {}", e);
                    return FetchOutcome::accepted(url, article, verdict, false, Some(reason));
                }
                let used_renderer = !matches!(e, Error::EngineUnavailable(_));
                return FetchOutcome::failed(url, &e, Some(reason), used_renderer);
            }
        };

        let article = match self.extractor.extract(&rendered, url) {
            Ok(article) => article,
            Err(e) => {
                if let Some((article, verdict)) = remembered {
                    warn!("extraction failed on rendered HTML, keeping simple result");
                    return FetchOutcome::accepted(url, article, verdict, false, Some(reason));
                }
                return FetchOutcome::failed(url, &e, Some(reason), true);
            }
        };

        let verdict = quality::score(&article.markdown, Some(rendered.len()));
        debug!(score = verdict.score, url, "rendered fetch scored");

        reconcile(url, reason, article, verdict, remembered, opts.min_score)
    }

    /// Acquire, navigate, release. The lease is handed back on every path so
    /// a timeout can never wedge a pending engine shutdown.
    async fn render(&self, url: &str, opts: &FetchOptions) -> Result<String, Error> {
        let mut lease = self.browser.acquire().await?;
        let result = lease.navigate(url, opts.wait, opts.timeout).await;
        lease.release().await;
        result
    }
}

/// Decide the terminal outcome once the renderer result is scored.
fn reconcile(
    url: &str,
    reason: FallbackReason,
    article: Article,
    verdict: QualityVerdict,
    remembered: Option<(Article, QualityVerdict)>,
    min_score: u8,
) -> FetchOutcome {
    if reason == FallbackReason::QualityMarginal {
        if let Some((simple_article, simple_verdict)) = remembered {
            // The renderer has to strictly beat the simple fetch to be
            // worth keeping; ties go to the cheaper result.
            return if verdict.score > simple_verdict.score {
                FetchOutcome::accepted(url, article, verdict, true, Some(reason))
            } else {
                FetchOutcome::accepted(url, simple_article, simple_verdict, false, Some(reason))
            };
        }
    }

    if verdict.score >= min_score {
        FetchOutcome::accepted(url, article, verdict, true, Some(reason))
    } else {
        let error = Error::QualityRejected {
            verdict,
            suggestion: QUALITY_SUGGESTION.to_string(),
        };
        FetchOutcome::failed(url, &error, Some(reason), true)
    }
}

fn validate_url(raw: &str) -> Result<Url, Error> {
    let parsed = Url::parse(raw).map_err(|e| Error::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(Error::InvalidUrl {
            url: raw.to_string(),
            reason: format!("scheme '{}' is not supported (only http/https)", scheme),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn article_with(markdown: &str) -> Article {
        Article {
            title: "T".to_string(),
            byline: None,
            excerpt: None,
            site_name: None,
            markdown: markdown.to_string(),
        }
    }

    fn verdict_with(score: u8) -> QualityVerdict {
        QualityVerdict {
            score,
            issues: vec![],
            warnings: vec![],
        }
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/page").is_ok());
        assert!(validate_url("http://example.com").is_ok());

        let err = validate_url("ftp://example.com").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUrl);
        let err = validate_url("not a url at all").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUrl);
    }

    #[test]
    fn test_reconcile_marginal_ties_go_to_simple() {
        // Simple scored 70, renderer managed 65: keep the simple result
        let outcome = reconcile(
            "https://x",
            FallbackReason::QualityMarginal,
            article_with("fallback body"),
            verdict_with(65),
            Some((article_with("simple body"), verdict_with(70))),
            60,
        );
        assert!(outcome.success);
        assert!(!outcome.used_fallback_renderer);
        assert_eq!(outcome.markdown.as_deref(), Some("simple body"));
        assert_eq!(outcome.verdict.unwrap().score, 70);

        // Equal scores are not strictly greater: simple still wins
        let outcome = reconcile(
            "https://x",
            FallbackReason::QualityMarginal,
            article_with("fallback body"),
            verdict_with(70),
            Some((article_with("simple body"), verdict_with(70))),
            60,
        );
        assert!(!outcome.used_fallback_renderer);
    }

    #[test]
    fn test_reconcile_marginal_better_fallback_wins() {
        let outcome = reconcile(
            "https://x",
            FallbackReason::QualityMarginal,
            article_with("fallback body"),
            verdict_with(90),
            Some((article_with("simple body"), verdict_with(70))),
            60,
        );
        assert!(outcome.success);
        assert!(outcome.used_fallback_renderer);
        assert_eq!(outcome.markdown.as_deref(), Some("fallback body"));
        assert_eq!(outcome.fallback_reason, Some(FallbackReason::QualityMarginal));
    }

    #[test]
    fn test_reconcile_too_low_rejects_bad_fallback() {
        // Simple scored 40 (below min 60), renderer scored 10: hard failure
        let outcome = reconcile(
            "https://x",
            FallbackReason::QualityTooLow,
            article_with("fallback body"),
            verdict_with(10),
            None,
            60,
        );
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::QualityRejected));
        assert_eq!(outcome.verdict.unwrap().score, 10);
        assert!(outcome.suggestion.unwrap().contains("login wall"));
    }

    #[test]
    fn test_reconcile_accepts_adequate_fallback() {
        let outcome = reconcile(
            "https://x",
            FallbackReason::NetworkError,
            article_with("fallback body"),
            verdict_with(61),
            None,
            60,
        );
        assert!(outcome.success);
        assert!(outcome.used_fallback_renderer);
        assert_eq!(outcome.fallback_reason, Some(FallbackReason::NetworkError));
    }

    #[tokio::test]
    async fn test_invalid_scheme_fails_before_any_network() {
        let pipeline = FetchPipeline::new(BrowserManager::new()).unwrap();
        let outcome = pipeline
            .fetch("file:///etc/passwd", &FetchOptions::default())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidUrl));
        assert!(!outcome.used_fallback_renderer);
    }

    #[tokio::test]
    async fn test_good_simple_fetch_skips_renderer() {
        let server = MockServer::start().await;
        let para = "The committee published its findings on Tuesday, noting \
                    steady progress across all working groups. "
            .repeat(60);
        let html = format!(
            "<html><head><title>Findings</title></head><body><article><p>{}</p></article></body></html>",
            para
        );
        Mock::given(method("GET"))
            .and(path("/report"))
            .respond_with(ResponseTemplate::new(200).set_body_string(html))
            .mount(&server)
            .await;

        let pipeline = FetchPipeline::new(BrowserManager::new()).unwrap();
        let opts = FetchOptions {
            fallback_threshold: 85,
            ..FetchOptions::default()
        };
        let outcome = pipeline
            .fetch(&format!("{}/report", server.uri()), &opts)
            .await;

        assert!(outcome.success, "error: {:?}", outcome.error);
        assert!(!outcome.used_fallback_renderer);
        assert!(outcome.fallback_reason.is_none());
        assert_eq!(outcome.title.as_deref(), Some("Findings"));
        assert!(outcome.verdict.unwrap().score >= 85);
    }
}
