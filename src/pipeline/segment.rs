//! Layout segmentation: one page → typed, bounded components.
//!
//! The layout cache is consulted first; a hit means no backend call at all.
//! On a miss the backend is asked for the layout in strict JSON, and the raw
//! payload is cached only once it parses. Box validation runs after the cache
//! read, so a cached payload is re-validated against the page every time.

use crate::backend::{TranscriptionRequest, TranscriptionService};
use crate::cache::{AnalysisCache, LayoutPayload};
use crate::error::PageError;
use crate::model::{
    component_id, BoundingBox, Component, ComponentId, ComponentType, PageAnalysis, PageImage,
    ReadingDirection,
};
use crate::pipeline::{encode::encode_page, extract::parse_layout};
use crate::prompts::LAYOUT_ANALYSIS_PROMPT;
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of segmenting one page.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub analysis: PageAnalysis,
    /// True when the layout came from the cache.
    pub cached: bool,
    /// Components dropped because their box failed validation.
    pub dropped: Vec<ComponentId>,
}

pub struct LayoutSegmenter {
    service: Arc<dyn TranscriptionService>,
    cache: AnalysisCache,
}

impl LayoutSegmenter {
    pub fn new(service: Arc<dyn TranscriptionService>, cache: AnalysisCache) -> Self {
        Self { service, cache }
    }

    /// Segment `page`, whose decoded pixels are `image`.
    ///
    /// Backend failures map to [`PageError::Backend`]; an unparseable
    /// payload maps to [`PageError::AnalysisFailed`] carrying the raw reply.
    pub async fn segment(
        &self,
        page: &PageImage,
        image: &DynamicImage,
    ) -> Result<Segmentation, PageError> {
        let stem = page.stem();
        let (payload, cached) = match self.cache.layout(stem).await {
            Some(payload) => {
                info!("{}: layout cache hit", page.id);
                (payload, true)
            }
            None => (self.request_layout(page, image).await?, false),
        };

        let (analysis, dropped) =
            build_analysis(&page.id, &payload, image.width(), image.height());
        info!(
            "{}: {} components ({} dropped), language '{}', direction {}",
            page.id,
            analysis.components.len(),
            dropped.len(),
            analysis.language,
            analysis.reading_direction.tag()
        );
        Ok(Segmentation {
            analysis,
            cached,
            dropped,
        })
    }

    async fn request_layout(
        &self,
        page: &PageImage,
        image: &DynamicImage,
    ) -> Result<LayoutPayload, PageError> {
        let encoded = encode_page(image).map_err(|e| PageError::Input {
            page: page.id.clone(),
            detail: format!("cannot encode page: {e}"),
        })?;
        let request = TranscriptionRequest::with_image(LAYOUT_ANALYSIS_PROMPT, encoded).json();
        let raw = self
            .service
            .transcribe(request)
            .await
            .map_err(|e| PageError::backend(&page.id, &e))?;

        let payload = parse_layout(&raw).map_err(|detail| {
            error!("{}: layout analysis unparseable ({}). Raw reply:\n{}", page.id, detail, raw);
            PageError::AnalysisFailed {
                page: page.id.clone(),
                detail,
                raw: Some(raw.clone()),
            }
        })?;

        if let Err(e) = self.cache.store_layout(page.stem(), &payload).await {
            warn!("{}: could not cache layout ({}); continuing", page.id, e);
        }
        Ok(payload)
    }
}

/// Turn a raw layout payload into a validated [`PageAnalysis`].
///
/// Ids come from each component's 1-based position in the payload, so they
/// are identical whether the payload is fresh or cached. Returns the ids of
/// dropped components alongside.
pub fn build_analysis(
    page: &str,
    payload: &LayoutPayload,
    width: u32,
    height: u32,
) -> (PageAnalysis, Vec<ComponentId>) {
    let mut components = Vec::with_capacity(payload.components.len());
    let mut dropped = Vec::new();

    for (idx, raw) in payload.components.iter().enumerate() {
        let id = component_id(idx + 1);
        let kind = ComponentType::parse(&raw.kind).unwrap_or_else(|| {
            warn!("{page}: {id} has unknown type '{}'; treating as text_block", raw.kind);
            ComponentType::TextBlock
        });
        let Some(coords) = raw.coords() else {
            warn!("{page}: dropping {id}: box is not a list of numbers ({})", raw.bbox);
            dropped.push(id);
            continue;
        };
        let bbox = match BoundingBox::validate(&coords, width, height) {
            Ok(b) => b,
            Err(reason) => {
                warn!("{page}: dropping {id} with box {coords:?}: {reason}");
                dropped.push(id);
                continue;
            }
        };
        debug!("{page}: {id} {kind} {:?}", bbox.to_array());
        components.push(Component {
            id,
            kind,
            bbox,
            content: String::new(),
        });
    }

    let analysis = PageAnalysis {
        page: page.to_string(),
        reading_direction: ReadingDirection::for_language(&payload.language),
        language: payload.language.clone(),
        components,
    };
    (analysis, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> LayoutPayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn invalid_boxes_are_dropped_and_ids_stay_positional() {
        let p = payload(
            r#"{"language": "english", "components": [
                {"type": "header", "box": [0, 0, 100, 20]},
                {"type": "text_block", "box": [10, 10, 5, 20]},
                {"type": "figure", "box": [10, 10, 20, 30]},
                {"type": "caption", "box": [0, 0, 10]},
                {"type": "footer", "box": [0, 190, 100, 201]}
            ]}"#,
        );
        let (analysis, dropped) = build_analysis("page-003.jpg", &p, 100, 200);
        let ids: Vec<_> = analysis.components.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["comp_01", "comp_03"]);
        assert_eq!(dropped, ["comp_02", "comp_04", "comp_05"]);
        assert_eq!(analysis.components[1].kind, ComponentType::Figure);
    }

    #[test]
    fn unknown_type_becomes_text_block() {
        let p = payload(r#"{"components": [{"type": "sidebar", "box": [0, 0, 5, 5]}]}"#);
        let (analysis, dropped) = build_analysis("p.png", &p, 10, 10);
        assert!(dropped.is_empty());
        assert_eq!(analysis.components[0].kind, ComponentType::TextBlock);
        assert_eq!(analysis.language, "unknown");
        assert_eq!(analysis.reading_direction, ReadingDirection::LeftToRightTopToBottom);
    }

    #[test]
    fn layout_text_is_not_taken_as_content() {
        let p = payload(
            r#"{"language": "Japanese", "components": [
                {"type": "text_block", "box": [0, 0, 5, 5], "content": "縦書き"}
            ]}"#,
        );
        let (analysis, _) = build_analysis("p.png", &p, 10, 10);
        assert_eq!(analysis.reading_direction, ReadingDirection::TopToBottomRightToLeft);
        assert!(analysis.components[0].content.is_empty());
    }
}
