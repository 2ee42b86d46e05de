//! Run orchestration: page scheduling, mode policy and state commits.
//!
//! ## Modes
//!
//! | Mode         | Pages                      | Per page                                  | On failure                       |
//! |--------------|----------------------------|-------------------------------------------|----------------------------------|
//! | `basic`      | after `last_processed_page`| one whole-page call                       | input error skips, others halt   |
//! | `structured` | after `last_processed_page`| segment → transcribe → reassemble         | input/analysis skip, others halt |
//! | `refine`     | the named targets          | cached analysis + guided whole-page call  | reported, next target proceeds   |
//! | `translate`  | every `*.md` in `output_dir`| one text-only call per file              | reported, next file proceeds     |
//!
//! The two resumable modes commit a page by writing its Markdown, feeding its
//! headings to the [`DocumentState`] and persisting the state. Refine mode
//! reads the heading context but never changes it. Translate mode mirrors the
//! committed Markdown into [`PipelineConfig::translation_output_dir`] and
//! never reads or writes the state.

use crate::backend::{ensure_reachable, InferenceBackend, TranscriptionRequest, TranscriptionService};
use crate::cache::AnalysisCache;
use crate::config::PipelineConfig;
use crate::error::{PageError, ScribeError};
use crate::fsutil::write_atomic;
use crate::model::{ComponentType, PageAnalysis, PageImage};
use crate::output::{PageReport, PageStatus, RunSummary};
use crate::pipeline::encode::encode_page;
use crate::pipeline::input::{discover_markdown, discover_pages, load_page};
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::reassemble::ReassemblyEngine;
use crate::pipeline::segment::LayoutSegmenter;
use crate::pipeline::transcribe::{ComponentTranscriber, FIGURE_EXPORT_FAILED, OCR_FAILED};
use crate::prompts::{
    analysis_prompt, basic_prompt, refined_prompt, translation_system_prompt, DEFAULT_SYSTEM_PROMPT,
};
use crate::state::DocumentState;
use image::DynamicImage;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What a run does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Whole-page transcription, resumable.
    Basic,
    /// Segment, transcribe components, reassemble. Resumable.
    Structured,
    /// Two-pass re-transcription of the named pages (ids or stems).
    Refine(Vec<String>),
    /// Translate the committed Markdown into another language.
    Translate { target_language: String },
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Basic => "basic",
            Mode::Structured => "structured",
            Mode::Refine(_) => "refine",
            Mode::Translate { .. } => "translate",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run `mode` end to end: validate input, build and check the backend, then
/// process pages.
///
/// Returns `Ok` for halted batches too; see [`RunSummary::halted`] and
/// [`RunSummary::into_result`].
///
/// # Errors
/// - [`ScribeError::InputDirNotFound`] before any backend work (for
///   `translate`, when `output_dir` is missing)
/// - [`ScribeError::ProviderNotConfigured`] when no provider can be built
/// - [`ScribeError::BackendUnreachable`] when the startup ping fails
pub async fn run(config: PipelineConfig, mode: Mode) -> Result<RunSummary, ScribeError> {
    let source = match mode {
        Mode::Translate { .. } => &config.output_dir,
        _ => &config.input_dir,
    };
    if !source.is_dir() {
        return Err(ScribeError::InputDirNotFound {
            path: source.clone(),
        });
    }

    let backend = InferenceBackend::from_config(&config)?;
    let reassembler = InferenceBackend::reassembler_from_config(&config, &backend)?;
    if config.check_backend {
        match mode {
            Mode::Translate { .. } => ensure_reachable(&reassembler).await?,
            Mode::Structured if config.reassembly_model.is_some() => {
                ensure_reachable(&backend).await?;
                ensure_reachable(&reassembler).await?;
            }
            _ => ensure_reachable(&backend).await?,
        }
    }

    let mut orchestrator =
        Orchestrator::new(config, Arc::new(backend), Arc::new(reassembler)).await?;
    orchestrator.run(&mode).await
}

/// Everything a committed page contributes to its report.
#[derive(Debug, Default)]
struct PageWork {
    markdown: String,
    analysis_cached: bool,
    failed_components: Vec<String>,
    omitted_components: Vec<String>,
    unknown_ids: Vec<String>,
}

/// Owns the document state and drives the pipeline stages over the pages.
pub struct Orchestrator {
    config: PipelineConfig,
    service: Arc<dyn TranscriptionService>,
    text_service: Arc<dyn TranscriptionService>,
    cache: AnalysisCache,
    state: DocumentState,
    segmenter: LayoutSegmenter,
    transcriber: ComponentTranscriber,
    reassembler: ReassemblyEngine,
}

impl Orchestrator {
    /// Prepare output and cache directories and load the document state.
    ///
    /// `reassembler` serves the text-only calls (ordering and translation);
    /// pass `service` again when one model does both.
    pub async fn new(
        config: PipelineConfig,
        service: Arc<dyn TranscriptionService>,
        reassembler: Arc<dyn TranscriptionService>,
    ) -> Result<Self, ScribeError> {
        for dir in [&config.output_dir, &config.cache_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ScribeError::OutputWriteFailed {
                    path: dir.clone(),
                    source,
                })?;
        }

        let cache = AnalysisCache::new(&config.cache_dir);
        let state = DocumentState::load(config.state_path()).await;
        Ok(Self {
            segmenter: LayoutSegmenter::new(Arc::clone(&service), cache.clone()),
            transcriber: ComponentTranscriber::new(Arc::clone(&service), &config),
            text_service: Arc::clone(&reassembler),
            reassembler: ReassemblyEngine::new(
                reassembler,
                config.reassembly_temperature,
                config.append_omitted_components,
            ),
            config,
            service,
            cache,
            state,
        })
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub async fn run(&mut self, mode: &Mode) -> Result<RunSummary, ScribeError> {
        let summary = match mode {
            Mode::Translate { target_language } => {
                info!("Starting translate run into {} with {}", target_language, self.text_service.name());
                self.run_translate(target_language).await?
            }
            _ => {
                let pages = discover_pages(&self.config).await?;
                info!(
                    "Starting {} run over {} pages with {}",
                    mode,
                    pages.len(),
                    self.service.name()
                );
                match mode {
                    Mode::Refine(targets) => self.run_refine(&pages, targets).await,
                    _ => self.run_resumable(mode, &pages).await,
                }
            }
        };
        info!(
            "{} run finished in {}ms: {} committed, {} skipped, {} failed{}",
            mode,
            summary.duration_ms,
            summary.committed(),
            summary.skipped(),
            summary.failed(),
            if summary.halted { " (halted)" } else { "" }
        );
        Ok(summary)
    }

    // ── Resumable modes ──────────────────────────────────────────────────

    async fn run_resumable(&mut self, mode: &Mode, pages: &[PageImage]) -> RunSummary {
        let run_start = Instant::now();
        let ids: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
        let start = self.state.resume_index(&ids);
        let scheduled = &pages[start.min(pages.len())..];
        if start > 0 {
            info!(
                "Resuming after '{}': {} of {} pages remaining",
                self.state.last_processed_page().unwrap_or_default(),
                scheduled.len(),
                pages.len()
            );
        }

        let total = scheduled.len();
        let mut summary = RunSummary::new(mode.name(), total);
        self.notify(|cb| cb.on_run_start(mode.name(), total));

        for (i, page) in scheduled.iter().enumerate() {
            let position = i + 1;
            let page_start = Instant::now();
            self.notify(|cb| cb.on_page_start(&page.id, position, total));
            info!("[{}/{}] {}", position, total, page.id);

            let outcome = match load_page(page).await {
                Ok(image) => match mode {
                    Mode::Structured => self.structured_page(page, &image).await,
                    _ => self.basic_page(page, &image).await,
                },
                Err(e) => Err(e),
            };
            let outcome = match outcome {
                Ok(work) => self.commit(page, &work.markdown).await.map(|()| work),
                Err(e) => Err(e),
            };
            let elapsed = page_start.elapsed().as_millis() as u64;

            match outcome {
                Ok(work) => {
                    self.notify(|cb| cb.on_page_complete(&page.id, position, total, work.markdown.len()));
                    summary.pages.push(report_for(page, work, elapsed));
                }
                Err(e) => {
                    self.notify(|cb| cb.on_page_error(&page.id, position, total, &e.to_string()));
                    if skips_page(&e) {
                        warn!("Skipping {}: {}", page.id, e);
                        summary
                            .pages
                            .push(PageReport::unsuccessful(PageStatus::Skipped, e, elapsed));
                    } else {
                        error!("Halting batch at {}: {}", page.id, e);
                        summary
                            .pages
                            .push(PageReport::unsuccessful(PageStatus::Failed, e, elapsed));
                        summary.halted = true;
                        break;
                    }
                }
            }
        }

        summary.duration_ms = run_start.elapsed().as_millis() as u64;
        self.notify(|cb| cb.on_run_complete(total, summary.committed()));
        summary
    }

    async fn basic_page(&self, page: &PageImage, image: &DynamicImage) -> Result<PageWork, PageError> {
        let prompt = basic_prompt(&self.state.context_prompt());
        let raw = self.whole_page_call(page, image, prompt).await?;
        Ok(PageWork {
            markdown: clean_markdown(&raw),
            ..PageWork::default()
        })
    }

    async fn structured_page(
        &self,
        page: &PageImage,
        image: &DynamicImage,
    ) -> Result<PageWork, PageError> {
        let (analysis, analysis_cached, failed_components) =
            match self.reusable_transcription(page).await {
                Some(analysis) => (analysis, true, Vec::new()),
                None => {
                    let mut segmentation = self.segmenter.segment(page, image).await?;
                    let failed = self
                        .transcriber
                        .transcribe_page(page, image, &mut segmentation.analysis)
                        .await;
                    if let Err(e) = self
                        .cache
                        .store_structured(page.stem(), &segmentation.analysis)
                        .await
                    {
                        warn!("{}: could not store transcribed components ({}); continuing", page.id, e);
                    }
                    (segmentation.analysis, segmentation.cached, failed)
                }
            };

        let reassembly = self.reassembler.reassemble(&analysis).await?;
        Ok(PageWork {
            markdown: clean_markdown(&reassembly.markdown),
            analysis_cached,
            failed_components,
            omitted_components: reassembly.omitted,
            unknown_ids: reassembly.unknown,
        })
    }

    /// A stored component transcription of `page` that can feed reassembly
    /// again: every component transcribed and every figure crop on disk.
    async fn reusable_transcription(&self, page: &PageImage) -> Option<PageAnalysis> {
        let analysis = self.cache.structured(page.stem()).await?;
        let complete = analysis.page == page.id
            && analysis.components.iter().all(|c| match c.kind {
                ComponentType::Figure => {
                    c.content != FIGURE_EXPORT_FAILED
                        && self.config.figure_path(page.stem(), &c.id).is_file()
                }
                _ => c.content != OCR_FAILED && !c.content.trim().is_empty(),
            });
        if complete {
            info!("{}: reusing stored component transcription", page.id);
            Some(analysis)
        } else {
            debug!("{}: stored component transcription is incomplete; redoing", page.id);
            None
        }
    }

    /// Write the page's Markdown, then advance and persist the state.
    async fn commit(&mut self, page: &PageImage, markdown: &str) -> Result<(), PageError> {
        let path = self.config.markdown_path(page.stem());
        write_atomic(&path, markdown)
            .await
            .map_err(|e| output_error(page, &path, e))?;
        debug!("Wrote {} ({} bytes)", path.display(), markdown.len());

        self.state.apply_markdown(markdown);
        self.state.mark_processed(&page.id);
        self.state.save().await.map_err(|e| PageError::StatePersist {
            page: page.id.clone(),
            detail: format!("{}: {e}", self.state.path().display()),
        })
    }

    // ── Refine mode ──────────────────────────────────────────────────────

    async fn run_refine(&mut self, pages: &[PageImage], targets: &[String]) -> RunSummary {
        let run_start = Instant::now();
        let total = targets.len();
        let mut summary = RunSummary::new("refine", total);
        self.notify(|cb| cb.on_run_start("refine", total));

        for (i, target) in targets.iter().enumerate() {
            let position = i + 1;
            let page_start = Instant::now();
            self.notify(|cb| cb.on_page_start(target, position, total));
            info!("[{}/{}] refining {}", position, total, target);

            let outcome = match find_page(pages, target) {
                Some(page) => self.refine_page(page).await,
                None => Err(PageError::Input {
                    page: target.clone(),
                    detail: format!("no such page in {}", self.config.input_dir.display()),
                }),
            };
            let elapsed = page_start.elapsed().as_millis() as u64;

            match outcome {
                Ok((page, work)) => {
                    self.notify(|cb| cb.on_page_complete(&page.id, position, total, work.markdown.len()));
                    summary.pages.push(report_for(page, work, elapsed));
                }
                Err(e) => {
                    warn!("Refine of {} failed: {}", target, e);
                    self.notify(|cb| cb.on_page_error(target, position, total, &e.to_string()));
                    summary
                        .pages
                        .push(PageReport::unsuccessful(PageStatus::Failed, e, elapsed));
                }
            }
        }

        summary.duration_ms = run_start.elapsed().as_millis() as u64;
        self.notify(|cb| cb.on_run_complete(total, summary.committed()));
        summary
    }

    async fn refine_page<'p>(&self, page: &'p PageImage) -> Result<(&'p PageImage, PageWork), PageError> {
        let image = load_page(page).await?;
        let context = self.state.context_prompt();
        let (analysis_text, analysis_cached) = self.observation(page, &image, &context).await?;

        let raw = self
            .whole_page_call(page, &image, refined_prompt(&context, &analysis_text))
            .await?;
        let markdown = clean_markdown(&raw);

        let path = self.config.markdown_path(page.stem());
        write_atomic(&path, markdown.as_str())
            .await
            .map_err(|e| output_error(page, &path, e))?;
        info!("{}: refined transcription written to {}", page.id, path.display());

        Ok((
            page,
            PageWork {
                markdown,
                analysis_cached,
                ..PageWork::default()
            },
        ))
    }

    /// The page's observation analysis: cached text, a summary of a cached
    /// layout, or a fresh backend call whose reply is then cached.
    async fn observation(
        &self,
        page: &PageImage,
        image: &DynamicImage,
        context: &str,
    ) -> Result<(String, bool), PageError> {
        let stem = page.stem();
        if let Some(text) = self.cache.observation(stem).await {
            info!("{}: analysis cache hit", page.id);
            return Ok((text, true));
        }
        if let Some(layout) = self.cache.layout(stem).await {
            info!("{}: summarising cached layout as analysis", page.id);
            return Ok((layout.summary(), true));
        }

        info!("{}: analysing page structure", page.id);
        let encoded = encode(page, image)?;
        let request = TranscriptionRequest::with_image(analysis_prompt(context), encoded)
            .system(self.system_prompt())
            .json();
        let text = self
            .service
            .transcribe(request)
            .await
            .map_err(|e| PageError::backend(&page.id, &e))?;

        if let Err(e) = self.cache.store_observation(stem, &text).await {
            warn!("{}: could not cache analysis ({}); continuing", page.id, e);
        }
        Ok((text, false))
    }

    // ── Translate mode ───────────────────────────────────────────────────

    async fn run_translate(&self, target_language: &str) -> Result<RunSummary, ScribeError> {
        let run_start = Instant::now();
        let source = &self.config.output_dir;
        let dest = self.config.translation_output_dir();
        let files = discover_markdown(source, &dest)
            .await
            .map_err(|e| ScribeError::InputDirUnreadable {
                path: source.clone(),
                source: e,
            })?;
        if files.is_empty() {
            warn!("No Markdown files to translate in {}", source.display());
        }

        let total = files.len();
        let mut summary = RunSummary::new("translate", total);
        self.notify(|cb| cb.on_run_start("translate", total));

        for (i, relative) in files.iter().enumerate() {
            let position = i + 1;
            let id = relative.to_string_lossy().into_owned();
            let file_start = Instant::now();
            self.notify(|cb| cb.on_page_start(&id, position, total));
            info!("[{}/{}] translating {}", position, total, id);

            let outcome = self
                .translate_file(&id, &source.join(relative), &dest.join(relative), target_language)
                .await;
            let elapsed = file_start.elapsed().as_millis() as u64;

            match outcome {
                Ok(Some(len)) => {
                    self.notify(|cb| cb.on_page_complete(&id, position, total, len));
                    summary.pages.push(PageReport::committed(&id, len, elapsed));
                }
                Ok(None) => {
                    info!("{}: empty, nothing to translate", id);
                    let e = PageError::Input {
                        page: id.clone(),
                        detail: "empty Markdown file".into(),
                    };
                    self.notify(|cb| cb.on_page_error(&id, position, total, &e.to_string()));
                    summary
                        .pages
                        .push(PageReport::unsuccessful(PageStatus::Skipped, e, elapsed));
                }
                Err(e) => {
                    warn!("Translation of {} failed: {}", id, e);
                    self.notify(|cb| cb.on_page_error(&id, position, total, &e.to_string()));
                    summary
                        .pages
                        .push(PageReport::unsuccessful(PageStatus::Failed, e, elapsed));
                }
            }
        }

        summary.duration_ms = run_start.elapsed().as_millis() as u64;
        self.notify(|cb| cb.on_run_complete(total, summary.committed()));
        Ok(summary)
    }

    /// Translate one file. `None` when it holds no text.
    async fn translate_file(
        &self,
        id: &str,
        src: &Path,
        dest: &Path,
        target_language: &str,
    ) -> Result<Option<usize>, PageError> {
        let text = tokio::fs::read_to_string(src)
            .await
            .map_err(|e| PageError::Input {
                page: id.to_string(),
                detail: format!("{}: {e}", src.display()),
            })?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        let request = TranscriptionRequest::text(text)
            .system(translation_system_prompt(target_language))
            .temperature(self.config.temperature);
        let raw = self
            .text_service
            .transcribe(request)
            .await
            .map_err(|e| PageError::backend(id, &e))?;
        let translated = clean_markdown(&raw);

        write_atomic(dest, translated.as_str())
            .await
            .map_err(|e| PageError::OutputWrite {
                page: id.to_string(),
                detail: format!("{}: {e}", dest.display()),
            })?;
        debug!("Wrote {} ({} bytes)", dest.display(), translated.len());
        Ok(Some(translated.len()))
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    async fn whole_page_call(
        &self,
        page: &PageImage,
        image: &DynamicImage,
        prompt: String,
    ) -> Result<String, PageError> {
        let encoded = encode(page, image)?;
        let request = TranscriptionRequest::with_image(prompt, encoded).system(self.system_prompt());
        self.service
            .transcribe(request)
            .await
            .map_err(|e| PageError::backend(&page.id, &e))
    }

    fn system_prompt(&self) -> &str {
        self.config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    fn notify(&self, event: impl FnOnce(&dyn crate::progress::RunProgressCallback)) {
        if let Some(ref cb) = self.config.progress_callback {
            event(cb.as_ref());
        }
    }
}

/// Failures that skip a page without halting a resumable batch.
fn skips_page(e: &PageError) -> bool {
    matches!(e, PageError::Input { .. } | PageError::AnalysisFailed { .. })
}

fn find_page<'p>(pages: &'p [PageImage], target: &str) -> Option<&'p PageImage> {
    pages
        .iter()
        .find(|p| p.id == target)
        .or_else(|| pages.iter().find(|p| p.stem() == target))
}

fn encode(page: &PageImage, image: &DynamicImage) -> Result<edgequake_llm::ImageData, PageError> {
    encode_page(image).map_err(|e| PageError::Input {
        page: page.id.clone(),
        detail: format!("cannot encode page: {e}"),
    })
}

fn output_error(page: &PageImage, path: &Path, e: std::io::Error) -> PageError {
    PageError::OutputWrite {
        page: page.id.clone(),
        detail: format!("{}: {e}", path.display()),
    }
}

fn report_for(page: &PageImage, work: PageWork, duration_ms: u64) -> PageReport {
    let mut report = PageReport::committed(&page.id, work.markdown.len(), duration_ms);
    report.analysis_cached = work.analysis_cached;
    report.failed_components = work.failed_components;
    report.omitted_components = work.omitted_components;
    report.unknown_ids = work.unknown_ids;
    report
}
