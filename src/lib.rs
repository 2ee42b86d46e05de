//! # pagescribe
//!
//! Turn an ordered directory of scanned book-page images into structured
//! Markdown, one file per page, using Vision Language Models.
//!
//! ## Why this crate?
//!
//! A vision model sees one page at a time, but a book's structure spans
//! pages: section 2.3 started three pages ago, and the figure on the left
//! belongs after the paragraph on the right. pagescribe carries a heading
//! context from page to page, caches every structural analysis so re-runs are
//! free, and can split a page into typed regions, transcribe each one, and let
//! a reasoning call put them back in reading order.
//!
//! ## Pipeline Overview
//!
//! ```text
//! imgs/page-001.jpg … page-NNN.jpg
//!  │
//!  ├─ 1. Discover  sorted page list, resume after the last committed page
//!  ├─ 2. Context   heading path from earlier pages → prompt
//!  ├─ 3. Transcribe
//!  │     basic:      one whole-page call
//!  │     structured: layout (cached) → per-region OCR / figure crops
//!  │                 → semantic reassembly
//!  ├─ 4. Polish    deterministic Markdown cleanup
//!  └─ 5. Commit    output/<stem>.md, heading stack + pointer → state.json
//! ```
//!
//! `refine` mode re-transcribes chosen pages with a cached structural
//! analysis as extra guidance, without touching the document state.
//! `translate` mode mirrors the committed Markdown into another language.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagescribe::{run, Mode, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .input_dir("imgs")
//!         .output_dir("output")
//!         .provider_name("ollama")
//!         .model("qwen2.5vl:7b")
//!         .build()?;
//!     let summary = run(config, Mode::Basic).await?.into_result()?;
//!     eprintln!("{} pages committed", summary.committed());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pagescribe` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pagescribe = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod state;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{InferenceBackend, ResponseFormat, TranscriptionRequest, TranscriptionService};
pub use cache::AnalysisCache;
pub use config::{BackendKind, PipelineConfig, PipelineConfigBuilder};
pub use error::{BackendError, ErrorClass, PageError, ScribeError};
pub use model::{BoundingBox, Component, ComponentType, PageAnalysis, PageImage, ReadingDirection};
pub use orchestrator::{run, Mode, Orchestrator};
pub use output::{PageReport, PageStatus, RunSummary};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use state::{DocumentState, HeadingNode, HeadingStack};
