//! Per-component transcription.
//!
//! Figures are cropped and written as PNGs next to the page Markdown; every
//! other component is cropped and transcribed on its own. A component that
//! fails gets a sentinel instead of content and its siblings carry on, so one
//! bad region never costs the whole page.

use crate::backend::{TranscriptionRequest, TranscriptionService};
use crate::config::PipelineConfig;
use crate::fsutil::write_atomic;
use crate::model::{Component, ComponentId, ComponentType, PageAnalysis, PageImage};
use crate::pipeline::encode::{crop, encode_page, png_bytes};
use crate::prompts::COMPONENT_OCR_PROMPT;
use image::DynamicImage;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Content of a text component whose transcription failed.
pub const OCR_FAILED: &str = "[OCR FAILED]";

/// Content of a figure whose crop could not be written.
pub const FIGURE_EXPORT_FAILED: &str = "[FIGURE EXPORT FAILED]";

pub struct ComponentTranscriber {
    service: Arc<dyn TranscriptionService>,
    config: PipelineConfig,
    delay: Duration,
}

impl ComponentTranscriber {
    pub fn new(service: Arc<dyn TranscriptionService>, config: &PipelineConfig) -> Self {
        Self {
            service,
            config: config.clone(),
            delay: Duration::from_millis(config.component_delay_ms),
        }
    }

    /// Fill in `content` for every component of `analysis`.
    ///
    /// Returns the ids that ended up with a failure sentinel.
    pub async fn transcribe_page(
        &self,
        page: &PageImage,
        image: &DynamicImage,
        analysis: &mut PageAnalysis,
    ) -> Vec<ComponentId> {
        let total = analysis.components.len();
        let mut failed = Vec::new();

        for (i, component) in analysis.components.iter_mut().enumerate() {
            debug!("{}: {} ({}/{}) {}", page.id, component.id, i + 1, total, component.kind);
            let ok = match component.kind {
                ComponentType::Figure => self.export_figure(page, image, component).await,
                _ => self.transcribe_component(page, image, component).await,
            };
            if !ok {
                failed.push(component.id.clone());
            }
        }

        if failed.is_empty() {
            info!("{}: transcribed {} components", page.id, total);
        } else {
            warn!(
                "{}: {} of {} components failed: {}",
                page.id,
                failed.len(),
                total,
                failed.join(", ")
            );
        }
        failed
    }

    /// Persist the figure crop and point `content` at it.
    async fn export_figure(
        &self,
        page: &PageImage,
        image: &DynamicImage,
        component: &mut Component,
    ) -> bool {
        let link = self.config.figure_link(page.stem(), &component.id);
        let path = self.config.figure_path(page.stem(), &component.id);
        let written = match png_bytes(&crop(image, &component.bbox)) {
            Ok(bytes) => write_atomic(&path, bytes).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match written {
            Ok(()) => {
                debug!("{}: figure {} saved to {}", page.id, component.id, path.display());
                component.content = format!("![figure {}]({})", component.id, link);
                true
            }
            Err(e) => {
                warn!("{}: figure {} export failed: {}", page.id, component.id, e);
                component.content = FIGURE_EXPORT_FAILED.to_string();
                false
            }
        }
    }

    async fn transcribe_component(
        &self,
        page: &PageImage,
        image: &DynamicImage,
        component: &mut Component,
    ) -> bool {
        let encoded = match encode_page(&crop(image, &component.bbox)) {
            Ok(data) => data,
            Err(e) => {
                warn!("{}: cannot encode {}: {}", page.id, component.id, e);
                component.content = OCR_FAILED.to_string();
                return false;
            }
        };

        let result = self
            .service
            .transcribe(TranscriptionRequest::with_image(COMPONENT_OCR_PROMPT, encoded))
            .await;
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        match result {
            Ok(text) if !text.trim().is_empty() => {
                component.content = text.trim().to_string();
                true
            }
            Ok(_) => {
                warn!("{}: {} transcribed to nothing", page.id, component.id);
                component.content = OCR_FAILED.to_string();
                false
            }
            Err(e) => {
                warn!("{}: {} transcription failed: {}", page.id, component.id, e);
                component.content = OCR_FAILED.to_string();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::model::{BoundingBox, ReadingDirection};
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every call whose number is in `fail_on` (1-based).
    struct Ocr {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    #[async_trait]
    impl TranscriptionService for Ocr {
        fn name(&self) -> String {
            "ocr".into()
        }

        async fn transcribe(&self, request: TranscriptionRequest) -> Result<String, BackendError> {
            assert!(request.image.is_some());
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&n) {
                Err(BackendError::Api("overloaded".into()))
            } else {
                Ok(format!("  text {n}\n"))
            }
        }
    }

    fn component(id: &str, kind: ComponentType, coords: [f64; 4]) -> Component {
        Component {
            id: id.into(),
            kind,
            bbox: BoundingBox::validate(&coords, 60, 40).unwrap(),
            content: String::new(),
        }
    }

    fn setup(dir: &std::path::Path) -> (PageImage, DynamicImage, PipelineConfig) {
        let config = PipelineConfig::builder()
            .output_dir(dir)
            .component_delay_ms(0)
            .build()
            .unwrap();
        let page = PageImage {
            id: "page-003.jpg".into(),
            path: dir.join("page-003.jpg"),
            position: 0,
        };
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(60, 40, Rgb([200, 200, 200])));
        (page, image, config)
    }

    #[tokio::test]
    async fn figure_is_persisted_and_linked() {
        let dir = tempfile::tempdir().unwrap();
        let (page, image, config) = setup(dir.path());
        let ocr = Arc::new(Ocr { calls: AtomicUsize::new(0), fail_on: vec![] });
        let transcriber = ComponentTranscriber::new(ocr.clone(), &config);

        let mut analysis = PageAnalysis {
            page: page.id.clone(),
            language: "english".into(),
            reading_direction: ReadingDirection::LeftToRightTopToBottom,
            components: vec![
                component("comp_01", ComponentType::TextBlock, [0.0, 0.0, 60.0, 10.0]),
                component("comp_02", ComponentType::Figure, [10.0, 10.0, 40.0, 30.0]),
            ],
        };
        let failed = transcriber.transcribe_page(&page, &image, &mut analysis).await;

        assert!(failed.is_empty());
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
        assert_eq!(analysis.components[0].content, "text 1");
        assert_eq!(
            analysis.components[1].content,
            "![figure comp_02](figures/page-003/comp_02.png)"
        );
        let crop = image::open(dir.path().join("figures/page-003/comp_02.png")).unwrap();
        assert_eq!((crop.width(), crop.height()), (30, 20));
    }

    #[tokio::test]
    async fn existing_content_is_replaced_by_crop_transcription() {
        let dir = tempfile::tempdir().unwrap();
        let (page, image, config) = setup(dir.path());
        let ocr = Arc::new(Ocr { calls: AtomicUsize::new(0), fail_on: vec![] });
        let transcriber = ComponentTranscriber::new(ocr.clone(), &config);

        let mut guessed = component("comp_01", ComponentType::TextBlock, [0.0, 0.0, 60.0, 20.0]);
        guessed.content = "layout guess".into();
        let mut analysis = PageAnalysis {
            page: page.id.clone(),
            language: "english".into(),
            reading_direction: ReadingDirection::LeftToRightTopToBottom,
            components: vec![
                guessed,
                component("comp_02", ComponentType::Caption, [0.0, 20.0, 60.0, 40.0]),
            ],
        };
        transcriber.transcribe_page(&page, &image, &mut analysis).await;

        assert_eq!(ocr.calls.load(Ordering::SeqCst), 2);
        assert_eq!(analysis.components[0].content, "text 1");
    }

    #[tokio::test]
    async fn failed_component_gets_sentinel_and_siblings_continue() {
        let dir = tempfile::tempdir().unwrap();
        let (page, image, config) = setup(dir.path());
        let ocr = Arc::new(Ocr { calls: AtomicUsize::new(0), fail_on: vec![2] });
        let transcriber = ComponentTranscriber::new(ocr, &config);

        let mut analysis = PageAnalysis {
            page: page.id.clone(),
            language: "english".into(),
            reading_direction: ReadingDirection::LeftToRightTopToBottom,
            components: vec![
                component("comp_01", ComponentType::Header, [0.0, 0.0, 60.0, 5.0]),
                component("comp_02", ComponentType::FormulaBlock, [0.0, 5.0, 60.0, 20.0]),
                component("comp_03", ComponentType::TextBlock, [0.0, 20.0, 60.0, 40.0]),
            ],
        };
        let failed = transcriber.transcribe_page(&page, &image, &mut analysis).await;

        assert_eq!(failed, ["comp_02"]);
        assert_eq!(analysis.components[1].content, OCR_FAILED);
        assert_eq!(analysis.components[2].content, "text 3");
    }
}
