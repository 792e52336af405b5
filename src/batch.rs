//! Batch fetching of a stored reference's outbound links
//!
//! Links run through the full pipeline in fixed windows of five: a window's
//! fetches all run concurrently, and the next window starts only after the
//! previous one has fully settled. One bad link never aborts its siblings.

use futures::future::join_all;
use serde::Serialize;
use tracing::info;

use crate::error::Error;
use crate::extractor::Extractor;
use crate::pipeline::{FetchOptions, FetchPipeline};
use crate::store::{ExtractedLink, ReferenceStore};

const WINDOW_SIZE: usize = 5;

/// Per-URL outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    /// Fetched and stored for the first time.
    New,
    /// Fetched fine, but the URL was already in the store.
    Cached,
    /// Pipeline or save failure.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkFetchOutcome {
    pub url: String,
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkFetchSummary {
    pub new: usize,
    pub cached: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkFetchReport {
    pub results: Vec<LinkFetchOutcome>,
    pub summary: LinkFetchSummary,
}

/// Fetch every outbound link of a stored reference and stash the results.
///
/// Only a failure to read the source reference fails the batch itself; a
/// reference without links yields an empty report. The shared browser
/// engine is asked to shut down exactly once, after the last window.
pub async fn fetch_links<E: Extractor>(
    store: &ReferenceStore,
    pipeline: &FetchPipeline<E>,
    ref_id: &str,
    opts: &FetchOptions,
    refetch: bool,
) -> Result<LinkFetchReport, Error> {
    let links = store.extract_links(ref_id).await?;
    info!(count = links.len(), ref_id, "fetching outbound links");

    let mut results = Vec::with_capacity(links.len());
    for window in links.chunks(WINDOW_SIZE) {
        let fetches: Vec<_> = window
            .iter()
            .map(|link| fetch_one(store, pipeline, link, opts, refetch))
            .collect();
        results.extend(join_all(fetches).await);
    }

    pipeline.browser().request_shutdown().await;

    let summary = tally(&results);
    info!(
        new = summary.new,
        cached = summary.cached,
        failed = summary.failed,
        "link fetch complete"
    );
    Ok(LinkFetchReport { results, summary })
}

async fn fetch_one<E: Extractor>(
    store: &ReferenceStore,
    pipeline: &FetchPipeline<E>,
    link: &ExtractedLink,
    opts: &FetchOptions,
    refetch: bool,
) -> LinkFetchOutcome {
    let outcome = pipeline.fetch(&link.href, opts).await;
    if !outcome.success {
        return LinkFetchOutcome {
            url: link.href.clone(),
            status: LinkStatus::Failed,
            ref_id: None,
            error: outcome.error,
        };
    }

    let title = outcome.title.unwrap_or_else(|| link.text.clone());
    let markdown = outcome.markdown.unwrap_or_default();

    match store.save(&title, &link.href, &markdown, None, refetch).await {
        Ok(saved) if saved.already_exists => LinkFetchOutcome {
            url: link.href.clone(),
            status: LinkStatus::Cached,
            ref_id: Some(saved.ref_id),
            error: None,
        },
        Ok(saved) => LinkFetchOutcome {
            url: link.href.clone(),
            status: LinkStatus::New,
            ref_id: Some(saved.ref_id),
            error: None,
        },
        Err(e) => LinkFetchOutcome {
            url: link.href.clone(),
            status: LinkStatus::Failed,
            ref_id: None,
            error: Some(e.to_string()),
        },
    }
}

fn tally(results: &[LinkFetchOutcome]) -> LinkFetchSummary {
    let mut summary = LinkFetchSummary::default();
    for result in results {
        match result.status {
            LinkStatus::New => summary.new += 1,
            LinkStatus::Cached => summary.cached += 1,
            LinkStatus::Failed => summary.failed += 1,
        }
    }
    summary
}
