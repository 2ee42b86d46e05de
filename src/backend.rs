//! The transcription capability and its two backend variants.
//!
//! Everything in the pipeline talks to a [`TranscriptionService`]: a
//! stateless request/response seam mapping (prompt, optional image) to text.
//! The production implementation is [`InferenceBackend`], whose variant is
//! chosen exactly once from configuration in [`InferenceBackend::from_config`].
//! Tests substitute a scripted service.
//!
//! ## Retry Strategy
//!
//! No automatic retry by default (`max_retries = 0`): a failed call is a
//! page-level failure the orchestrator reports. When retries are enabled the
//! wait doubles after each attempt (`retry_backoff_ms * 2^attempt`).

use crate::config::{BackendKind, PipelineConfig};
use crate::error::{BackendError, ScribeError};
use crate::prompts::PING_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{
    AnthropicProvider, ChatMessage, CompletionOptions, ImageData, LLMProvider, LMStudioProvider,
    OllamaProvider, OpenAIProvider, OpenRouterProvider, ProviderFactory,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Default model when a provider is named but no model is configured.
const DEFAULT_LOCAL_MODEL: &str = "qwen2.5vl:7b";
const DEFAULT_HOSTED_MODEL: &str = "gpt-4.1-nano";

const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
const DEFAULT_LMSTUDIO_HOST: &str = "http://localhost:1234";

/// Output shape requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Free-form text (Markdown).
    Text,
    /// A single JSON value. Backends that support a strict JSON mode enable
    /// it. Replies may still arrive wrapped in prose or fences.
    Json,
}

/// One call to the transcription capability.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub image: Option<ImageData>,
    pub format: ResponseFormat,
    /// Overrides the backend's default sampling temperature.
    pub temperature: Option<f32>,
}

impl TranscriptionRequest {
    /// A text request about an image.
    pub fn with_image(prompt: impl Into<String>, image: ImageData) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            image: Some(image),
            format: ResponseFormat::Text,
            temperature: None,
        }
    }

    /// A text-only request.
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            image: None,
            format: ResponseFormat::Text,
            temperature: None,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn json(mut self) -> Self {
        self.format = ResponseFormat::Json;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }
}

/// Stateless request/response transcription capability.
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> String;

    /// Run one request. Returns the raw text of the response.
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<String, BackendError>;

    /// Cheap connectivity check used before a run starts.
    async fn ping(&self) -> Result<(), BackendError> {
        self.transcribe(TranscriptionRequest::text(PING_PROMPT))
            .await
            .map(|_| ())
    }
}

/// Call settings shared by both backend variants.
#[derive(Debug, Clone)]
struct CallSettings {
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
    api_timeout_secs: u64,
}

/// An `edgequake-llm` provider plus the settings used to call it.
#[derive(Clone)]
pub struct ProviderBackend {
    provider: Arc<dyn LLMProvider>,
    settings: CallSettings,
}

/// The closed set of inference backends.
#[derive(Clone)]
pub enum InferenceBackend {
    /// Model served locally (Ollama, LM Studio).
    Local(ProviderBackend),
    /// Remote API (OpenRouter, OpenAI, Anthropic, Gemini, …).
    Hosted(ProviderBackend),
}

impl InferenceBackend {
    /// Build the transcription backend from configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ScribeError> {
        let (kind, provider) = resolve_provider(config, config.model.as_deref())?;
        Ok(Self::assemble(kind, provider, config, config.temperature))
    }

    /// Build the reassembly backend. Reuses `transcription` unless a separate
    /// `reassembly_model` is configured.
    pub fn reassembler_from_config(
        config: &PipelineConfig,
        transcription: &InferenceBackend,
    ) -> Result<Self, ScribeError> {
        match config.reassembly_model.as_deref() {
            Some(model) => {
                let (kind, provider) = resolve_provider(config, Some(model))?;
                Ok(Self::assemble(
                    kind,
                    provider,
                    config,
                    config.reassembly_temperature,
                ))
            }
            None => Ok(transcription.clone()),
        }
    }

    fn assemble(
        kind: BackendKind,
        provider: Arc<dyn LLMProvider>,
        config: &PipelineConfig,
        temperature: f32,
    ) -> Self {
        let inner = ProviderBackend {
            provider,
            settings: CallSettings {
                temperature,
                max_tokens: config.max_tokens,
                max_retries: config.max_retries,
                retry_backoff_ms: config.retry_backoff_ms,
                api_timeout_secs: config.api_timeout_secs,
            },
        };
        match kind {
            BackendKind::Local => Self::Local(inner),
            BackendKind::Hosted => Self::Hosted(inner),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Local(_) => BackendKind::Local,
            Self::Hosted(_) => BackendKind::Hosted,
        }
    }

    fn inner(&self) -> &ProviderBackend {
        match self {
            Self::Local(b) | Self::Hosted(b) => b,
        }
    }

    /// `response_format` value for strict JSON output.
    ///
    /// Ollama's OpenAI-compatible endpoint and the hosted chat-completions
    /// APIs both accept `json_object`. Anthropic has no JSON mode, so the
    /// request is sent as plain text and the reply is extracted.
    fn json_mode(&self) -> Option<String> {
        match self {
            Self::Local(_) => Some("json_object".to_string()),
            Self::Hosted(b) if b.provider.name().eq_ignore_ascii_case("anthropic") => None,
            Self::Hosted(_) => Some("json_object".to_string()),
        }
    }
}

#[async_trait]
impl TranscriptionService for InferenceBackend {
    fn name(&self) -> String {
        let b = self.inner();
        let variant = match self {
            Self::Local(_) => "local",
            Self::Hosted(_) => "hosted",
        };
        format!("{}/{} ({variant})", b.provider.name(), b.provider.model())
    }

    async fn transcribe(&self, request: TranscriptionRequest) -> Result<String, BackendError> {
        let response_format = match request.format {
            ResponseFormat::Json => self.json_mode(),
            ResponseFormat::Text => None,
        };
        self.inner().call(&request, response_format).await
    }
}

impl ProviderBackend {
    /// Send the request, retrying per the configured policy.
    async fn call(
        &self,
        request: &TranscriptionRequest,
        response_format: Option<String>,
    ) -> Result<String, BackendError> {
        let messages = build_messages(request);
        let options = CompletionOptions {
            temperature: Some(request.temperature.unwrap_or(self.settings.temperature)),
            max_tokens: Some(self.settings.max_tokens),
            response_format,
            ..Default::default()
        };

        let mut last_err = BackendError::EmptyResponse;
        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let backoff = self.settings.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "retry {}/{} after {}ms",
                    attempt, self.settings.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            let start = Instant::now();
            match self.chat_once(&messages, &options).await {
                Ok(text) => {
                    debug!("backend answered in {:?} ({} chars)", start.elapsed(), text.len());
                    return Ok(text);
                }
                Err(e) => {
                    warn!("backend call attempt {} failed: {}", attempt + 1, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, BackendError> {
        let call = self.provider.chat(messages, Some(options));
        let response = if self.settings.api_timeout_secs > 0 {
            timeout(Duration::from_secs(self.settings.api_timeout_secs), call)
                .await
                .map_err(|_| BackendError::Timeout {
                    secs: self.settings.api_timeout_secs,
                })?
        } else {
            call.await
        };
        let response = response.map_err(|e| BackendError::Api(e.to_string()))?;
        if response.content.trim().is_empty() {
            return Err(BackendError::EmptyResponse);
        }
        Ok(response.content)
    }
}

/// Lay out the chat messages for one request.
///
/// The image rides on the user turn together with the instruction text.
fn build_messages(request: &TranscriptionRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &request.system {
        messages.push(ChatMessage::system(system.as_str()));
    }
    match &request.image {
        Some(image) => messages.push(ChatMessage::user_with_images(
            request.prompt.as_str(),
            vec![image.clone()],
        )),
        None => messages.push(ChatMessage::user(request.prompt.as_str())),
    }
    messages
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`). With
///    `api_key`/`base_url` configured the provider is built from them (see
///    [`provider_with_endpoint`]); otherwise through
///    [`ProviderFactory::create_llm_provider`], which reads the matching API
///    key or host variable (`OPENROUTER_API_KEY`, `OLLAMA_HOST`, …).
/// 3. **Environment pair** (`PAGESCRIBE_PROVIDER` + `PAGESCRIBE_MODEL`).
/// 4. **Full auto-detection** (`ProviderFactory::from_env`).
///
/// The backend variant comes from `config.backend` when set, otherwise from
/// the provider name.
fn resolve_provider(
    config: &PipelineConfig,
    model: Option<&str>,
) -> Result<(BackendKind, Arc<dyn LLMProvider>), ScribeError> {
    if let Some(ref provider) = config.provider {
        let kind = config
            .backend
            .unwrap_or_else(|| BackendKind::for_provider(provider.name()));
        return Ok((kind, Arc::clone(provider)));
    }

    if let Some(ref name) = config.provider_name {
        let kind = config.backend.unwrap_or_else(|| BackendKind::for_provider(name));
        let model = model.unwrap_or(match kind {
            BackendKind::Local => DEFAULT_LOCAL_MODEL,
            BackendKind::Hosted => DEFAULT_HOSTED_MODEL,
        });
        if config.api_key.is_some() || config.base_url.is_some() {
            let provider = provider_with_endpoint(
                name,
                model,
                config.api_key.as_deref(),
                config.base_url.as_deref(),
            )?;
            return Ok((kind, provider));
        }
        return Ok((kind, create_provider(name, model)?));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("PAGESCRIBE_PROVIDER"),
        std::env::var("PAGESCRIBE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            let kind = config.backend.unwrap_or_else(|| BackendKind::for_provider(&prov));
            let model = model.unwrap_or(&env_model);
            return Ok((kind, create_provider(&prov, model)?));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ScribeError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set --provider ollama (with OLLAMA_HOST) or an API key such as OPENROUTER_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;
    let kind = config
        .backend
        .unwrap_or_else(|| BackendKind::for_provider(llm_provider.name()));
    info!("Auto-detected provider '{}'", llm_provider.name());
    Ok((kind, llm_provider))
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ScribeError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ScribeError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Build provider `name` from an explicit API key and/or endpoint.
///
/// A missing key falls back to the provider's usual environment variable; a
/// missing endpoint to its default.
fn provider_with_endpoint(
    name: &str,
    model: &str,
    api_key: Option<&str>,
    base_url: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, ScribeError> {
    let not_configured = |hint: String| ScribeError::ProviderNotConfigured {
        provider: name.to_string(),
        hint,
    };
    let key = |var: &str| {
        api_key
            .map(str::to_string)
            .or_else(|| std::env::var(var).ok())
            .ok_or_else(|| {
                not_configured(format!(
                    "Set \"api_key\" for '{name}' in the config file or {var}."
                ))
            })
    };
    let host = |var: &str, default: &str| {
        base_url
            .map(str::to_string)
            .or_else(|| std::env::var(var).ok())
            .unwrap_or_else(|| default.to_string())
    };

    let provider: Arc<dyn LLMProvider> = match name.trim().to_ascii_lowercase().as_str() {
        "ollama" => Arc::new(
            OllamaProvider::builder()
                .host(host("OLLAMA_HOST", DEFAULT_OLLAMA_HOST))
                .model(model)
                .build()
                .map_err(|e| not_configured(e.to_string()))?,
        ),
        "lmstudio" | "lm_studio" | "lm-studio" => Arc::new(
            LMStudioProvider::builder()
                .host(host("LMSTUDIO_HOST", DEFAULT_LMSTUDIO_HOST))
                .model(model)
                .build()
                .map_err(|e| not_configured(e.to_string()))?,
        ),
        "openrouter" => {
            let mut p = OpenRouterProvider::new(key("OPENROUTER_API_KEY")?).with_model(model);
            if let Some(url) = base_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
        "openai" => {
            let api_key = key("OPENAI_API_KEY")?;
            let p = match base_url {
                Some(url) => OpenAIProvider::compatible(api_key, url),
                None => OpenAIProvider::new(api_key),
            };
            Arc::new(p.with_model(model))
        }
        "anthropic" => {
            let mut p = AnthropicProvider::new(key("ANTHROPIC_API_KEY")?).with_model(model);
            if let Some(url) = base_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
        other => {
            return Err(not_configured(format!(
                "\"api_key\"/\"base_url\" are not supported for '{other}'; \
                remove them and use the provider's environment variables."
            )))
        }
    };
    debug!("Built provider '{}' from configured endpoint", name);
    Ok(provider)
}

/// Fail fast when the backend cannot be reached at startup.
pub async fn ensure_reachable(service: &dyn TranscriptionService) -> Result<(), ScribeError> {
    info!("Checking backend {}", service.name());
    service
        .ping()
        .await
        .map_err(|e| ScribeError::BackendUnreachable {
            provider: service.name(),
            detail: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builders() {
        let r = TranscriptionRequest::text("order these")
            .system("editor")
            .json()
            .temperature(0.0);
        assert_eq!(r.format, ResponseFormat::Json);
        assert_eq!(r.system.as_deref(), Some("editor"));
        assert_eq!(r.temperature, Some(0.0));
        assert!(r.image.is_none());
    }

    #[test]
    fn messages_carry_system_and_image() {
        let image = ImageData::new("aGVsbG8=".to_string(), "image/png");
        let r = TranscriptionRequest::with_image("transcribe", image).system("archivist");
        let messages = build_messages(&r);
        assert_eq!(messages.len(), 2);

        let bare = build_messages(&TranscriptionRequest::text("hi"));
        assert_eq!(bare.len(), 1);
    }

    struct Unreachable;

    #[async_trait]
    impl TranscriptionService for Unreachable {
        fn name(&self) -> String {
            "unreachable".into()
        }

        async fn transcribe(&self, _request: TranscriptionRequest) -> Result<String, BackendError> {
            Err(BackendError::Api("connection refused".into()))
        }
    }

    #[test]
    fn configured_endpoint_builds_named_provider() {
        let config = PipelineConfig::builder()
            .provider_name("ollama")
            .model("llava:13b")
            .base_url("http://gpu-box:11434")
            .build()
            .unwrap();
        let backend = InferenceBackend::from_config(&config).unwrap();
        assert_eq!(backend.kind(), BackendKind::Local);
        assert!(backend.name().contains("llava:13b"), "got: {}", backend.name());

        let keyed = PipelineConfig::builder()
            .provider_name("openrouter")
            .model("vision-large")
            .api_key("sk-or-test")
            .build()
            .unwrap();
        let backend = InferenceBackend::from_config(&keyed).unwrap();
        assert_eq!(backend.kind(), BackendKind::Hosted);
        assert!(backend.name().contains("vision-large"));
    }

    #[test]
    fn endpoint_for_unsupported_provider_is_rejected() {
        let config = PipelineConfig::builder()
            .provider_name("gemini")
            .base_url("http://proxy")
            .build()
            .unwrap();
        let err = InferenceBackend::from_config(&config).err().unwrap();
        assert!(matches!(err, ScribeError::ProviderNotConfigured { .. }));
    }

    #[tokio::test]
    async fn unreachable_backend_is_fatal_at_startup() {
        let err = ensure_reachable(&Unreachable).await.unwrap_err();
        assert!(matches!(err, ScribeError::BackendUnreachable { .. }));
        assert!(err.to_string().contains("connection refused"));
    }
}
