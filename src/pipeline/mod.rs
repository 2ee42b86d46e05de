//! Pipeline stages for page-image-to-Markdown transcription.
//!
//! Each submodule implements one step. The orchestrator sequences them; no
//! stage touches the document state.
//!
//! ## Data Flow
//!
//! ```text
//!                       ┌──────────────── structured mode ────────────────┐
//! input ──▶ encode ──▶ segment ──▶ transcribe ──▶ reassemble ──▶ postprocess
//! (decode)  (base64)   (layout)    (per region)   (reading order)  (cleanup)
//!             │                                                      ▲
//!             └──────────── basic / refine: one whole-page call ─────┘
//! ```
//!
//! 1. [`input`]: list page images in order and decode them on the
//!    blocking pool
//! 2. [`encode`]: crop regions, PNG-encode and base64-wrap for requests
//! 3. [`segment`]: layout analysis into typed, validated components,
//!    backed by the layout cache
//! 4. [`transcribe`]: figure export and per-component OCR with sentinels
//! 5. [`reassemble`]: semantic reading order from one text-only call
//! 6. [`extract`]: pull JSON out of free-form replies
//! 7. [`postprocess`]: deterministic Markdown cleanup rules

pub mod encode;
pub mod extract;
pub mod input;
pub mod postprocess;
pub mod reassemble;
pub mod segment;
pub mod transcribe;
