//! Content-addressed analysis cache.
//!
//! Two entry kinds live side by side in `cache_dir`, keyed by page stem:
//!
//! | Kind        | File                 | Schema                                         |
//! |-------------|----------------------|------------------------------------------------|
//! | observation | `<stem>.json`        | `{"analysis_text": "..."}`                     |
//! | layout      | `<stem>_layout.json` | `{"language": "...", "components": [{"type", "box", "content"?}]}` |
//! | structured  | `<stem>_structured.json` | transcribed [`PageAnalysis`]: `{"page", "language", "reading_direction", "components": [{"id", "type", "box", "content"}]}` |
//!
//! A present, parseable entry is authoritative: callers skip the backend call
//! entirely. Entries are written through [`crate::fsutil::write_atomic`], so a
//! reader never sees a half-written file; a torn or foreign file is treated as
//! a miss and overwritten on the next successful analysis.
//!
//! The structured entry is the per-component transcription that feeds
//! reassembly. It is rewritten on every transcription of the page.

use crate::fsutil::write_atomic;
use crate::model::PageAnalysis;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Observation entry: free-form structural notes used by refine mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationEntry {
    pub analysis_text: String,
}

/// Layout entry: the raw segmentation payload, before box validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutPayload {
    #[serde(default = "unknown_language")]
    pub language: String,
    pub components: Vec<RawComponent>,
}

fn unknown_language() -> String {
    "unknown".to_string()
}

/// One component exactly as the backend described it.
///
/// `box` stays an untyped JSON value so a single malformed box is dropped at
/// validation time instead of failing the whole payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawComponent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "box", default)]
    pub bbox: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl RawComponent {
    /// The box as numbers, or `None` when it is not a list of numbers.
    pub fn coords(&self) -> Option<Vec<f64>> {
        self.bbox
            .as_array()?
            .iter()
            .map(|v| v.as_f64())
            .collect()
    }
}

impl LayoutPayload {
    /// Render the layout as analysis text for refine mode.
    pub fn summary(&self) -> String {
        let components: Vec<_> = self
            .components
            .iter()
            .map(|c| serde_json::json!({ "type": c.kind, "box": c.bbox }))
            .collect();
        let summary = serde_json::json!({
            "language": self.language,
            "component_count": self.components.len(),
            "components": components,
        });
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    }
}

/// Analysis cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct AnalysisCache {
    dir: PathBuf,
}

impl AnalysisCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn observation_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.json"))
    }

    pub fn layout_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}_layout.json"))
    }

    pub fn structured_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}_structured.json"))
    }

    pub async fn observation(&self, stem: &str) -> Option<String> {
        read_entry::<ObservationEntry>(&self.observation_path(stem))
            .await
            .map(|e| e.analysis_text)
    }

    pub async fn store_observation(&self, stem: &str, analysis_text: &str) -> io::Result<()> {
        let entry = ObservationEntry {
            analysis_text: analysis_text.to_string(),
        };
        write_entry(&self.observation_path(stem), &entry).await
    }

    pub async fn layout(&self, stem: &str) -> Option<LayoutPayload> {
        read_entry::<LayoutPayload>(&self.layout_path(stem)).await
    }

    pub async fn store_layout(&self, stem: &str, payload: &LayoutPayload) -> io::Result<()> {
        write_entry(&self.layout_path(stem), payload).await
    }

    pub async fn structured(&self, stem: &str) -> Option<PageAnalysis> {
        read_entry::<PageAnalysis>(&self.structured_path(stem)).await
    }

    pub async fn store_structured(&self, stem: &str, analysis: &PageAnalysis) -> io::Result<()> {
        write_entry(&self.structured_path(stem), analysis).await
    }
}

async fn read_entry<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Cache entry {} unreadable ({}); treating as miss", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(entry) => {
            debug!("Cache hit: {}", path.display());
            Some(entry)
        }
        Err(e) => {
            warn!("Cache entry {} is corrupt ({}); treating as miss", path.display(), e);
            None
        }
    }
}

async fn write_entry<T: Serialize>(path: &Path, entry: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(entry).map_err(io::Error::other)?;
    write_atomic(path, json).await?;
    debug!("Cached analysis at {}", path.display());
    Ok(())
}
