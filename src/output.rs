//! Run reports returned by the orchestrator.

use crate::error::{PageError, ScribeError};
use serde::{Deserialize, Serialize};

/// Final state of one page in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Markdown written (and, in resumable modes, state persisted).
    Committed,
    /// Page left out; the batch carried on.
    Skipped,
    /// Page failed. In resumable modes this halts the batch.
    Failed,
}

/// Outcome of one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageReport {
    pub page: String,
    pub status: PageStatus,
    /// Byte length of the written Markdown (0 unless committed).
    pub markdown_len: usize,
    /// Whether the structural analysis came from the cache.
    pub analysis_cached: bool,
    /// Components whose transcription fell back to the failure sentinel.
    pub failed_components: Vec<String>,
    /// Component ids the reassembly step left out.
    pub omitted_components: Vec<String>,
    /// Ids returned by the reassembly step that match no component.
    pub unknown_ids: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<PageError>,
}

impl PageReport {
    pub(crate) fn committed(page: &str, markdown_len: usize, duration_ms: u64) -> Self {
        Self {
            page: page.to_string(),
            status: PageStatus::Committed,
            markdown_len,
            analysis_cached: false,
            failed_components: Vec::new(),
            omitted_components: Vec::new(),
            unknown_ids: Vec::new(),
            duration_ms,
            error: None,
        }
    }

    pub(crate) fn unsuccessful(status: PageStatus, error: PageError, duration_ms: u64) -> Self {
        Self {
            page: error.page().to_string(),
            status,
            markdown_len: 0,
            analysis_cached: false,
            failed_components: Vec::new(),
            omitted_components: Vec::new(),
            unknown_ids: Vec::new(),
            duration_ms,
            error: Some(error),
        }
    }
}

/// Summary of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// `basic`, `structured` or `refine`.
    pub mode: String,
    /// Pages scheduled for this run (after resumption).
    pub scheduled: usize,
    /// Reports for every page that was attempted, in processing order.
    pub pages: Vec<PageReport>,
    /// True when a resumable batch stopped early at a failed page.
    pub halted: bool,
    pub duration_ms: u64,
}

impl RunSummary {
    pub(crate) fn new(mode: &str, scheduled: usize) -> Self {
        Self {
            mode: mode.to_string(),
            scheduled,
            pages: Vec::new(),
            halted: false,
            duration_ms: 0,
        }
    }

    pub fn committed(&self) -> usize {
        self.count(PageStatus::Committed)
    }

    pub fn skipped(&self) -> usize {
        self.count(PageStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(PageStatus::Failed)
    }

    /// The page that halted the batch, if any.
    pub fn halted_at(&self) -> Option<&PageReport> {
        if self.halted {
            self.pages.iter().rev().find(|p| p.status == PageStatus::Failed)
        } else {
            None
        }
    }

    /// Convert a halted run into [`ScribeError::BatchHalted`].
    pub fn into_result(self) -> Result<Self, ScribeError> {
        if let Some(report) = self.halted_at() {
            return Err(ScribeError::BatchHalted {
                page: report.page.clone(),
                committed: self.committed(),
                reason: report
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(self)
    }

    fn count(&self, status: PageStatus) -> usize {
        self.pages.iter().filter(|p| p.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halted_summary_becomes_error() {
        let mut s = RunSummary::new("basic", 3);
        s.pages.push(PageReport::committed("page-001.jpg", 120, 5));
        s.pages.push(PageReport::unsuccessful(
            PageStatus::Failed,
            PageError::Backend {
                page: "page-002.jpg".into(),
                detail: "timeout".into(),
            },
            7,
        ));
        s.halted = true;

        assert_eq!(s.committed(), 1);
        assert_eq!(s.failed(), 1);
        assert_eq!(s.halted_at().map(|p| p.page.as_str()), Some("page-002.jpg"));
        let err = s.into_result().unwrap_err();
        assert!(err.to_string().contains("page-002.jpg"));
    }

    #[test]
    fn clean_summary_passes_through() {
        let mut s = RunSummary::new("refine", 1);
        s.pages.push(PageReport::committed("page-009.jpg", 10, 1));
        let s = s.into_result().unwrap();
        assert_eq!(s.committed(), 1);
        assert!(s.halted_at().is_none());
    }
}
