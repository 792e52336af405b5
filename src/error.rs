//! Shared error type for the fetch pipeline and reference store

use thiserror::Error;

use crate::quality::QualityVerdict;

/// Stable machine-readable discriminant, used in JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidUrl,
    NetworkError,
    ExtractionFailed,
    QualityRejected,
    EngineUnavailable,
    FallbackFetchFailed,
    NotFound,
    IoError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidUrl => "invalid_url",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ExtractionFailed => "extraction_failed",
            ErrorKind::QualityRejected => "quality_rejected",
            ErrorKind::EngineUnavailable => "engine_unavailable",
            ErrorKind::FallbackFetchFailed => "fallback_fetch_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::IoError => "io_error",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the library.
///
/// Network and extraction failures on the plain-HTTP path are recovered
/// internally by escalating to the browser renderer; only hard validation
/// failures, double-path failures, and store errors reach the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// URL failed validation before any network call.
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Plain HTTP transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// No readable article could be extracted from the HTML.
    #[error("no article content found at {0}")]
    ExtractionFailed(String),

    /// Both fetch paths produced content below the acceptance threshold.
    #[error("content quality too low (score {})", .verdict.score)]
    QualityRejected {
        verdict: QualityVerdict,
        suggestion: String,
    },

    /// The browser engine could not be started.
    #[error("browser engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Navigation or rendering in the browser fallback failed.
    #[error("fallback fetch failed: {0}")]
    FallbackFetchFailed(String),

    /// Store lookup missed.
    #[error("reference not found: {0}")]
    NotFound(String),

    /// Store read/write failure.
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            Error::Network(_) => ErrorKind::NetworkError,
            Error::ExtractionFailed(_) => ErrorKind::ExtractionFailed,
            Error::QualityRejected { .. } => ErrorKind::QualityRejected,
            Error::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            Error::FallbackFetchFailed(_) => ErrorKind::FallbackFetchFailed,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Io { .. } => ErrorKind::IoError,
        }
    }

    /// Wrap an io::Error with the path it occurred on.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
