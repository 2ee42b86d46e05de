//! Semantic reassembly: put a page's transcribed components in reading order.
//!
//! The order comes from one text-only call that sees every component's
//! content at once, so a sentence split across two boxes is rejoined even when
//! the boxes are far apart. Box coordinates are passed only as a hint. There is
//! no geometric fallback: when the reply is not a usable id list the page
//! fails and the operator decides.

use crate::backend::{TranscriptionRequest, TranscriptionService};
use crate::error::PageError;
use crate::model::{ComponentId, PageAnalysis};
use crate::pipeline::extract::parse_id_sequence;
use crate::prompts::{reassembly_prompt, REASSEMBLY_SYSTEM_PROMPT};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reading order for one page plus everything the reply got wrong.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reassembly {
    /// Ids in final document order.
    pub order: Vec<ComponentId>,
    /// Ids in the reply that match no component. Discarded.
    pub unknown: Vec<String>,
    /// Ids repeated in the reply. Only the first occurrence is kept.
    pub duplicates: Vec<ComponentId>,
    /// Known ids the reply left out.
    pub omitted: Vec<ComponentId>,
    /// Contents of `order` joined with blank lines.
    pub markdown: String,
}

pub struct ReassemblyEngine {
    service: Arc<dyn TranscriptionService>,
    temperature: f32,
    append_omitted: bool,
}

impl ReassemblyEngine {
    pub fn new(service: Arc<dyn TranscriptionService>, temperature: f32, append_omitted: bool) -> Self {
        Self {
            service,
            temperature,
            append_omitted,
        }
    }

    pub async fn reassemble(&self, analysis: &PageAnalysis) -> Result<Reassembly, PageError> {
        if analysis.components.is_empty() {
            warn!("{}: no components to reassemble; page will be empty", analysis.page);
            return Ok(Reassembly::default());
        }
        if analysis.components.len() == 1 {
            debug!("{}: single component; nothing to order", analysis.page);
            let ids = vec![analysis.components[0].id.clone()];
            return Ok(reconcile(analysis, ids, self.append_omitted));
        }

        let components_json = serde_json::to_string_pretty(&analysis.components)
            .map_err(|e| failed(analysis, format!("cannot serialise components: {e}"), None))?;
        let prompt = reassembly_prompt(
            &analysis.language,
            analysis.reading_direction.tag(),
            &components_json,
        );
        let request = TranscriptionRequest::text(prompt)
            .system(REASSEMBLY_SYSTEM_PROMPT)
            .json()
            .temperature(self.temperature);

        let raw = self
            .service
            .transcribe(request)
            .await
            .map_err(|e| failed(analysis, format!("reassembly call failed: {e}"), None))?;

        let ids = parse_id_sequence(&raw).map_err(|detail| {
            error!("{}: reassembly reply unusable ({}). Raw reply:\n{}", analysis.page, detail, raw);
            failed(analysis, detail, Some(raw.clone()))
        })?;

        let result = reconcile(analysis, ids, self.append_omitted);
        info!(
            "{}: reading order {}",
            analysis.page,
            result.order.join(" → ")
        );
        Ok(result)
    }
}

fn failed(analysis: &PageAnalysis, detail: String, raw: Option<String>) -> PageError {
    PageError::ReassemblyFailed {
        page: analysis.page.clone(),
        detail,
        raw,
    }
}

/// Apply the reply's id sequence to the page's components.
///
/// Unknown and repeated ids are discarded. Components the reply left out are
/// dropped, or appended in id order when `append_omitted` is set.
pub fn reconcile(analysis: &PageAnalysis, ids: Vec<String>, append_omitted: bool) -> Reassembly {
    let mut seen = HashSet::new();
    let mut out = Reassembly::default();

    for id in ids {
        if analysis.component(&id).is_none() {
            warn!("{}: reassembly returned unknown id '{}'; ignoring", analysis.page, id);
            out.unknown.push(id);
        } else if !seen.insert(id.clone()) {
            warn!("{}: reassembly repeated id '{}'; keeping first", analysis.page, id);
            out.duplicates.push(id);
        } else {
            out.order.push(id);
        }
    }

    let mut omitted: Vec<ComponentId> = analysis
        .components
        .iter()
        .filter(|c| !seen.contains(&c.id))
        .map(|c| c.id.clone())
        .collect();
    omitted.sort();
    if !omitted.is_empty() {
        if append_omitted {
            warn!(
                "{}: reassembly omitted {}; appending at the end",
                analysis.page,
                omitted.join(", ")
            );
            out.order.extend(omitted.iter().cloned());
        } else {
            warn!(
                "{}: reassembly omitted {}; their content is dropped",
                analysis.page,
                omitted.join(", ")
            );
        }
    }
    out.omitted = omitted;

    out.markdown = out
        .order
        .iter()
        .filter_map(|id| analysis.component(id))
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out
}
