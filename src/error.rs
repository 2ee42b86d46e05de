//! Error types for the pagescribe library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`ScribeError`]: **Fatal**: the run cannot start or cannot continue
//!   (missing input directory, provider not configured, unreachable backend,
//!   a resumable batch that had to halt). Returned as `Err(ScribeError)` from
//!   the top-level entry points.
//!
//! * [`PageError`]: **Non-fatal**: a single page failed. Stored inside
//!   [`crate::output::PageReport`] so the operator sees exactly which page
//!   failed and why. Whether the failure halts the batch is a mode policy
//!   decided by the orchestrator, not by the error itself.
//!
//! * [`BackendError`]: the failure of one call to a
//!   [`crate::backend::TranscriptionService`]. Callers fold it into a
//!   [`PageError`] (or into a component sentinel) with page context attached.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pagescribe library.
#[derive(Debug, Error)]
pub enum ScribeError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The page image directory does not exist.
    #[error("Input directory not found: '{path}'\nCheck the path exists and contains page images.")]
    InputDirNotFound { path: PathBuf },

    /// The page image directory exists but could not be listed.
    #[error("Failed to read input directory '{path}': {source}")]
    InputDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The JSON config file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The JSON config file is not valid.
    #[error("Config file '{path}' is not valid JSON: {detail}")]
    ConfigFileInvalid { path: PathBuf, detail: String },

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Backend errors ────────────────────────────────────────────────────
    /// The startup connectivity check against the backend failed.
    #[error("Backend '{provider}' could not be reached: {detail}")]
    BackendUnreachable { provider: String, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create an output or cache directory.
    #[error("Failed to prepare directory '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Batch errors ──────────────────────────────────────────────────────
    /// A resumable batch stopped at a failed page.
    ///
    /// Returned by [`crate::output::RunSummary::into_result`] when the caller
    /// wants to treat a halted batch as an error.
    #[error("Batch halted at '{page}' after {committed} committed pages: {reason}")]
    BatchHalted {
        page: String,
        committed: usize,
        reason: String,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single call to a transcription backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The provider returned an error.
    #[error("API error: {0}")]
    Api(String),

    /// The call exceeded `api_timeout_secs`.
    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The provider answered with nothing usable.
    #[error("empty response")]
    EmptyResponse,
}

/// Error classes from the operator-facing taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Missing or undecodable input file.
    Input,
    /// Transcription call failed or timed out.
    Backend,
    /// Structured output could not be parsed.
    Parse,
    /// Output, cache or state could not be written.
    Io,
}

/// A non-fatal error for a single page.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum PageError {
    /// The page image is missing or cannot be decoded.
    #[error("{page}: input error: {detail}")]
    Input { page: String, detail: String },

    /// A whole-page transcription or analysis call failed.
    #[error("{page}: backend call failed: {detail}")]
    Backend { page: String, detail: String },

    /// The structural analysis payload could not be parsed.
    #[error("{page}: analysis failed: {detail}")]
    AnalysisFailed {
        page: String,
        detail: String,
        raw: Option<String>,
    },

    /// The reading order could not be determined.
    #[error("{page}: reassembly failed: {detail}")]
    ReassemblyFailed {
        page: String,
        detail: String,
        raw: Option<String>,
    },

    /// The page's Markdown or figure output could not be written.
    #[error("{page}: failed to write output: {detail}")]
    OutputWrite { page: String, detail: String },

    /// The document state could not be persisted after the page.
    #[error("{page}: failed to persist document state: {detail}")]
    StatePersist { page: String, detail: String },
}

impl PageError {
    /// The page identifier this error belongs to.
    pub fn page(&self) -> &str {
        match self {
            PageError::Input { page, .. }
            | PageError::Backend { page, .. }
            | PageError::AnalysisFailed { page, .. }
            | PageError::ReassemblyFailed { page, .. }
            | PageError::OutputWrite { page, .. }
            | PageError::StatePersist { page, .. } => page,
        }
    }

    /// Map the error onto the operator-facing taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            PageError::Input { .. } => ErrorClass::Input,
            PageError::Backend { .. } => ErrorClass::Backend,
            PageError::AnalysisFailed { .. } | PageError::ReassemblyFailed { .. } => {
                ErrorClass::Parse
            }
            PageError::OutputWrite { .. } | PageError::StatePersist { .. } => ErrorClass::Io,
        }
    }

    pub(crate) fn backend(page: &str, err: &BackendError) -> Self {
        PageError::Backend {
            page: page.to_string(),
            detail: err.to_string(),
        }
    }
}
