//! refstash: quality-gated web fetching into a markdown reference store
//!
//! Fetches a URL over plain HTTP, extracts the readable article, scores the
//! markdown, and escalates to a shared headless-Chrome renderer when the
//! simple result is not good enough. Accepted results are deduplicated and
//! persisted as frontmatter-headed markdown files that can later be
//! promoted, deleted, or mined for outbound links to fetch in batch.

pub mod batch;
pub mod browser;
pub mod error;
pub mod extractor;
pub mod pipeline;
pub mod quality;
pub mod store;

pub use batch::{fetch_links, LinkFetchOutcome, LinkFetchReport, LinkFetchSummary, LinkStatus};
pub use browser::{BrowserLease, BrowserManager, WaitStrategy};
pub use error::{Error, ErrorKind};
pub use extractor::{Article, Extractor, HtmdExtractor};
pub use pipeline::{FallbackReason, FetchOptions, FetchOutcome, FetchPipeline};
pub use quality::{score, QualityVerdict};
pub use store::{ExtractedLink, RefStatus, Reference, ReferenceStore, SaveResult};
