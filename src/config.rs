//! Configuration types for a transcription run.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`] or loaded from a JSON config file with
//! [`PipelineConfigBuilder::from_file`]. Command-line flags are applied on top
//! of the file through the same builder, so there is exactly one place where
//! defaults and validation live.
//!
//! # Config file format
//! ```json
//! {
//!   "directories": { "input": "imgs", "output": "output", "cache": "cache" },
//!   "active_provider": "ollama",
//!   "providers": {
//!     "ollama":     { "model": "qwen2.5vl:7b", "reassembly_model": "qwen2:72b",
//!                     "base_url": "http://gpu-box:11434" },
//!     "openrouter": { "model": "google/gemini-2.5-flash", "api_key": "sk-or-..." }
//!   },
//!   "temperature": 0.1,
//!   "state_file_name": "state.json"
//! }
//! ```

use crate::error::ScribeError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration for a transcription run.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory holding the page images. Default: `imgs`.
    pub input_dir: PathBuf,

    /// Directory receiving one Markdown file per page, the figure crops and
    /// the document state file. Default: `output`.
    pub output_dir: PathBuf,

    /// Directory holding the analysis cache. Default: `cache`.
    pub cache_dir: PathBuf,

    /// Sub-directory of `output_dir` for figure crops. Default: `figures`.
    ///
    /// Kept relative so figure links in the Markdown stay valid when the
    /// output directory is moved as a whole.
    pub figures_subdir: String,

    /// File name of the document state inside `output_dir`. Default: `state.json`.
    pub state_file_name: String,

    /// Image file extensions recognised as pages (case-insensitive).
    pub image_extensions: Vec<String>,

    /// Backend variant. If None, derived from `provider_name`.
    pub backend: Option<BackendKind>,

    /// LLM provider name (e.g. "ollama", "openrouter", "openai").
    /// If None along with `provider`, the provider is auto-detected.
    pub provider_name: Option<String>,

    /// Model identifier for page and component transcription.
    pub model: Option<String>,

    /// Model used for semantic reassembly. If None, the transcription model
    /// is reused.
    pub reassembly_model: Option<String>,

    /// API key for `provider_name`. If None, the provider's environment
    /// variable is read (`OPENROUTER_API_KEY`, `OPENAI_API_KEY`, …).
    pub api_key: Option<String>,

    /// Endpoint for `provider_name` (Ollama host, OpenAI-compatible base URL).
    pub base_url: Option<String>,

    /// Per-provider sections from the config file, keyed by provider name.
    ///
    /// [`PipelineConfigBuilder::select_provider`] reads the section of the
    /// provider it switches to.
    pub providers: HashMap<String, ProviderSettings>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for transcription. Default: 0.1.
    pub temperature: f32,

    /// Sampling temperature for reassembly. Default: 0.0.
    ///
    /// The reading order should be a deterministic function of the contents.
    pub reassembly_temperature: f32,

    /// Maximum tokens the LLM may generate per call. Default: 4096.
    pub max_tokens: usize,

    /// Retry attempts on a failed backend call. Default: 0.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds; 0 disables the timeout. Default: 300.
    ///
    /// Local vision models on CPU routinely need minutes for a dense page.
    pub api_timeout_secs: u64,

    /// Pause after every per-component backend call, in milliseconds. Default: 500.
    pub component_delay_ms: u64,

    /// Append components the reassembly step left out, in id order. Default: false.
    pub append_omitted_components: bool,

    /// Ping the backend before any page work. Default: true.
    pub check_backend: bool,

    /// Custom system prompt. If None, uses the built-in archivist prompt.
    pub system_prompt: Option<String>,

    /// Destination of translated Markdown. If None, a sibling of
    /// `output_dir` named `<output_dir>_translated`.
    pub translation_dir: Option<PathBuf>,

    /// Receives per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("imgs"),
            output_dir: PathBuf::from("output"),
            cache_dir: PathBuf::from("cache"),
            figures_subdir: "figures".to_string(),
            state_file_name: "state.json".to_string(),
            image_extensions: vec!["jpg".into(), "jpeg".into(), "png".into()],
            backend: None,
            provider_name: None,
            model: None,
            reassembly_model: None,
            api_key: None,
            base_url: None,
            providers: HashMap::new(),
            provider: None,
            temperature: 0.1,
            reassembly_temperature: 0.0,
            max_tokens: 4096,
            max_retries: 0,
            retry_backoff_ms: 500,
            api_timeout_secs: 300,
            component_delay_ms: 500,
            append_omitted_components: false,
            check_backend: true,
            system_prompt: None,
            translation_dir: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("input_dir", &self.input_dir)
            .field("output_dir", &self.output_dir)
            .field("cache_dir", &self.cache_dir)
            .field("backend", &self.backend)
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("reassembly_model", &self.reassembly_model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("component_delay_ms", &self.component_delay_ms)
            .field("append_omitted_components", &self.append_omitted_components)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.output_dir.join(&self.state_file_name)
    }

    pub fn markdown_path(&self, page_stem: &str) -> PathBuf {
        self.output_dir.join(format!("{page_stem}.md"))
    }

    /// Figure crop location relative to `output_dir`, as used in Markdown links.
    pub fn figure_link(&self, page_stem: &str, component_id: &str) -> String {
        format!("{}/{page_stem}/{component_id}.png", self.figures_subdir)
    }

    pub fn figure_path(&self, page_stem: &str, component_id: &str) -> PathBuf {
        self.output_dir.join(self.figure_link(page_stem, component_id))
    }

    /// Where translate mode writes, mirroring the layout of `output_dir`.
    pub fn translation_output_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.translation_dir {
            return dir.clone();
        }
        let name = self
            .output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        self.output_dir.with_file_name(format!("{name}_translated"))
    }

    /// Whether `file_name` has one of the configured page extensions.
    pub fn is_page_image(&self, file_name: &str) -> bool {
        Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.image_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Start from a JSON config file; unset fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScribeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| {
            ScribeError::ConfigFileUnreadable {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let file: ConfigFile =
            serde_json::from_str(&text).map_err(|e| ScribeError::ConfigFileInvalid {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        Ok(file.apply(PipelineConfig::builder()))
    }

    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.input_dir = dir.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn figures_subdir(mut self, name: impl Into<String>) -> Self {
        self.config.figures_subdir = name.into();
        self
    }

    pub fn state_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.state_file_name = name.into();
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = Some(kind);
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn reassembly_model(mut self, model: impl Into<String>) -> Self {
        self.config.reassembly_model = Some(model.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    pub fn providers(mut self, providers: HashMap<String, ProviderSettings>) -> Self {
        self.config.providers = providers;
        self
    }

    /// Switch to provider `name` and take its model, reassembly model,
    /// backend kind and credentials from its section in
    /// [`PipelineConfig::providers`].
    ///
    /// Settings of the previously selected provider are cleared, so a model
    /// name never leaks across providers. Call [`Self::model`] afterwards to
    /// override the section.
    pub fn select_provider(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        let section = self.config.providers.get(&name).cloned().unwrap_or_default();
        self.config.model = section.model;
        self.config.reassembly_model = section.reassembly_model;
        self.config.backend = section.kind;
        self.config.api_key = section.api_key;
        self.config.base_url = section.base_url;
        self.config.provider_name = Some(name);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn reassembly_temperature(mut self, t: f32) -> Self {
        self.config.reassembly_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn component_delay_ms(mut self, ms: u64) -> Self {
        self.config.component_delay_ms = ms;
        self
    }

    pub fn append_omitted_components(mut self, v: bool) -> Self {
        self.config.append_omitted_components = v;
        self
    }

    pub fn check_backend(mut self, v: bool) -> Self {
        self.config.check_backend = v;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn translation_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.translation_dir = Some(dir.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ScribeError> {
        let c = &self.config;
        if c.max_tokens == 0 {
            return Err(ScribeError::InvalidConfig(
                "max_tokens must be ≥ 1".into(),
            ));
        }
        if c.image_extensions.is_empty() {
            return Err(ScribeError::InvalidConfig(
                "at least one image extension is required".into(),
            ));
        }
        if c.state_file_name.trim().is_empty() || c.state_file_name.contains(['/', '\\']) {
            return Err(ScribeError::InvalidConfig(format!(
                "state_file_name must be a plain file name, got '{}'",
                c.state_file_name
            )));
        }
        if c.figures_subdir.trim().is_empty() || Path::new(&c.figures_subdir).is_absolute() {
            return Err(ScribeError::InvalidConfig(format!(
                "figures_subdir must be a relative directory name, got '{}'",
                c.figures_subdir
            )));
        }
        if let Some(name) = &c.provider_name {
            if name.trim().is_empty() {
                return Err(ScribeError::InvalidConfig(
                    "provider name must not be empty".into(),
                ));
            }
        }
        if c.translation_output_dir() == c.output_dir {
            return Err(ScribeError::InvalidConfig(
                "translation_dir must differ from the output directory".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// The two inference backend variants.
///
/// Chosen once when the backend is constructed; nothing deeper in the
/// pipeline branches on provider names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A model served on this machine or LAN (Ollama, LM Studio).
    Local,
    /// A remote API (OpenRouter, OpenAI, Anthropic, Gemini, …).
    Hosted,
}

impl BackendKind {
    /// Infer the variant from a provider name.
    pub fn for_provider(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "ollama" | "lmstudio" | "lm_studio" | "lm-studio" | "local" => Self::Local,
            _ => Self::Hosted,
        }
    }
}

// ── Config file ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    directories: DirectoriesSection,
    active_provider: Option<String>,
    #[serde(default)]
    providers: HashMap<String, ProviderSettings>,
    temperature: Option<f32>,
    state_file_name: Option<String>,
    figures_subdir: Option<String>,
    max_tokens: Option<usize>,
    max_retries: Option<u32>,
    translation_dir: Option<PathBuf>,
    api_timeout_secs: Option<u64>,
    component_delay_ms: Option<u64>,
    append_omitted_components: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoriesSection {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    cache: Option<PathBuf>,
}

/// One entry of the config file's `providers` map.
#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    pub model: Option<String>,
    pub reassembly_model: Option<String>,
    pub kind: Option<BackendKind>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("model", &self.model)
            .field("reassembly_model", &self.reassembly_model)
            .field("kind", &self.kind)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ConfigFile {
    fn apply(self, mut b: PipelineConfigBuilder) -> PipelineConfigBuilder {
        if let Some(d) = self.directories.input {
            b = b.input_dir(d);
        }
        if let Some(d) = self.directories.output {
            b = b.output_dir(d);
        }
        if let Some(d) = self.directories.cache {
            b = b.cache_dir(d);
        }
        b = b.providers(self.providers);
        if let Some(name) = self.active_provider {
            b = b.select_provider(name);
        }
        if let Some(d) = self.translation_dir {
            b = b.translation_dir(d);
        }
        if let Some(t) = self.temperature {
            b = b.temperature(t);
        }
        if let Some(n) = self.state_file_name {
            b = b.state_file_name(n);
        }
        if let Some(n) = self.figures_subdir {
            b = b.figures_subdir(n);
        }
        if let Some(n) = self.max_tokens {
            b = b.max_tokens(n);
        }
        if let Some(n) = self.max_retries {
            b = b.max_retries(n);
        }
        if let Some(n) = self.api_timeout_secs {
            b = b.api_timeout_secs(n);
        }
        if let Some(n) = self.component_delay_ms {
            b = b.component_delay_ms(n);
        }
        if let Some(v) = self.append_omitted_components {
            b = b.append_omitted_components(v);
        }
        b
    }
}
