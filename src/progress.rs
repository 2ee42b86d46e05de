//! Progress-callback trait for per-page run events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the orchestrator works through the page list. The CLI uses it
//! to drive an `indicatif` progress bar; library callers can forward events
//! wherever they like.
//!
//! # Example
//!
//! ```rust
//! use pagescribe::{PipelineConfig, RunProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     committed: AtomicUsize,
//! }
//!
//! impl RunProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page: &str, position: usize, total: usize, markdown_len: usize) {
//!         self.committed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{page} ({position}/{total}) done, {markdown_len} bytes");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { committed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the orchestrator as it processes each page.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `position` is 1-based within the pages scheduled
/// for this run; `total` is the number scheduled.
pub trait RunProgressCallback: Send + Sync {
    /// Called once the page list for this run is known.
    fn on_run_start(&self, mode: &str, total: usize) {
        let _ = (mode, total);
    }

    /// Called before any backend call is made for a page.
    fn on_page_start(&self, page: &str, position: usize, total: usize) {
        let _ = (page, position, total);
    }

    /// Called when a page's Markdown has been written.
    fn on_page_complete(&self, page: &str, position: usize, total: usize, markdown_len: usize) {
        let _ = (page, position, total, markdown_len);
    }

    /// Called when a page failed or was skipped.
    fn on_page_error(&self, page: &str, position: usize, total: usize, error: &str) {
        let _ = (page, position, total, error);
    }

    /// Called once after the run ends, including halted runs.
    fn on_run_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl RunProgressCallback for TrackingCallback {
        fn on_page_start(&self, _page: &str, _position: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page: &str, _p: usize, _t: usize, _len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page: &str, _p: usize, _t: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start("basic", 3);
        cb.on_page_start("page-001.jpg", 1, 3);
        cb.on_page_complete("page-001.jpg", 1, 3, 42);
        cb.on_page_error("page-002.jpg", 2, 3, "timeout");
        cb.on_run_complete(3, 1);
    }

    #[test]
    fn arc_dyn_callback_receives_events() {
        let tracker = Arc::new(TrackingCallback::default());
        let cb: ProgressCallback = tracker.clone();
        cb.on_page_start("a.jpg", 1, 2);
        cb.on_page_complete("a.jpg", 1, 2, 10);
        cb.on_page_start("b.jpg", 2, 2);
        cb.on_page_error("b.jpg", 2, 2, "bad");
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }
}
