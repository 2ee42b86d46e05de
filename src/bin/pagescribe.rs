//! CLI binary for pagescribe.
//!
//! A thin shim over the library crate: the JSON config file (if any) is
//! loaded first, command-line flags are applied on top, then one run.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pagescribe::{
    run, Mode, PipelineConfig, PipelineConfigBuilder, ProgressCallback, RunProgressCallback,
    RunSummary,
};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar at the bottom, one log line per page above it.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Start of the page in flight; pages are processed one at a time.
    page_started: Mutex<Option<Instant>>,
}

impl CliProgressCallback {
    /// Spinner until `on_run_start` tells us how many pages are scheduled.
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Checking backend…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            page_started: Mutex::new(None),
        })
    }

    fn activate_bar(&self, mode: &str, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix(mode.to_string());
        self.bar.reset_eta();
    }

    fn page_elapsed_secs(&self) -> f64 {
        self.page_started
            .lock()
            .ok()
            .and_then(|mut started| started.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, mode: &str, total: usize) {
        self.activate_bar(mode, total);
        let what = if total == 0 {
            "Nothing to do: every page is already committed".to_string()
        } else {
            format!("Starting {mode} run over {total} pages…")
        };
        self.bar.println(format!("{} {}", cyan("◆"), bold(&what)));
    }

    fn on_page_start(&self, page: &str, _position: usize, _total: usize) {
        if let Ok(mut started) = self.page_started.lock() {
            *started = Some(Instant::now());
        }
        self.bar.set_message(page.to_string());
    }

    fn on_page_complete(&self, page: &str, position: usize, total: usize, markdown_len: usize) {
        let secs = self.page_elapsed_secs();
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {:<16}  {:<8}  {}",
            green("✓"),
            position,
            total,
            page,
            dim(&format!("{markdown_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: &str, position: usize, total: usize, error: &str) {
        let secs = self.page_elapsed_secs();
        let msg = match error.char_indices().nth(79) {
            Some((cut, _)) => format!("{}\u{2026}", &error[..cut]),
            None => error.to_string(),
        };
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {:<16}  {}  {}",
            red("✗"),
            position,
            total,
            page,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total: usize, success_count: usize) {
        self.bar.finish_and_clear();
        let unsuccessful = total.saturating_sub(success_count);
        if unsuccessful == 0 {
            eprintln!(
                "{} {} pages committed",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages committed",
                yellow("⚠"),
                bold(&success_count.to_string()),
                total,
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Transcribe imgs/ into output/, resuming where the last run stopped
  pagescribe

  # Use a config file, then override the model
  pagescribe --config config.json --model qwen2.5vl:32b

  # Segment pages into regions and reassemble them semantically
  pagescribe --mode structured --reassembly-model qwen3:14b

  # Re-transcribe two difficult pages with a structural analysis pass
  pagescribe --refine page-042.jpg page-043.jpg

  # Translate the committed Markdown into output_translated/
  pagescribe --translate French

  # Machine-readable run report
  pagescribe --json > report.json

CONFIG FILE (JSON):
  {
    "directories": { "input": "imgs", "output": "output", "cache": "cache" },
    "active_provider": "ollama",
    "providers": {
      "ollama":     { "model": "qwen2.5vl:7b", "base_url": "http://gpu-box:11434" },
      "openrouter": { "model": "google/gemini-2.5-flash", "api_key": "sk-or-..." }
    },
    "temperature": 0.1,
    "state_file_name": "state.json"
  }

OUTPUT LAYOUT:
  output/<page>.md                    one Markdown file per page
  output/figures/<page>/comp_NN.png   figure crops (structured mode)
  output/state.json                   heading context + resume pointer
  cache/<page>.json                   structural analysis (refine mode)
  cache/<page>_layout.json            layout segmentation (structured mode)
  cache/<page>_structured.json        transcribed components (structured mode)
  output_translated/<page>.md         translations (--translate)

ENVIRONMENT VARIABLES:
  OLLAMA_HOST             Ollama endpoint (default http://localhost:11434)
  OPENROUTER_API_KEY      OpenRouter API key
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  PAGESCRIBE_PROVIDER     Provider when neither --provider nor the config names one
  PAGESCRIBE_MODEL        Model when neither --model nor the config names one
  RUST_LOG                Log filter, overrides --verbose/--quiet
"#;

/// Transcribe scanned book pages to structured Markdown using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pagescribe",
    version,
    about = "Transcribe scanned book pages to structured Markdown using Vision LLMs",
    long_about = "Transcribe an ordered directory of page images into one Markdown file per page. \
Heading context carries across pages, runs resume after the last committed page, and every \
structural analysis is cached so re-runs are free. Works with local models (Ollama, LM Studio) \
and hosted APIs (OpenRouter, OpenAI, Anthropic, Gemini).",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// JSON config file; flags below override its values.
    #[arg(short, long, env = "PAGESCRIBE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of page images.
    #[arg(short, long, env = "PAGESCRIBE_INPUT")]
    input: Option<PathBuf>,

    /// Directory for Markdown, figures and the state file.
    #[arg(short, long, env = "PAGESCRIBE_OUTPUT")]
    output: Option<PathBuf>,

    /// Directory for the analysis cache.
    #[arg(long, env = "PAGESCRIBE_CACHE")]
    cache: Option<PathBuf>,

    /// Resumable mode.
    #[arg(long, value_enum, default_value = "basic")]
    mode: ModeArg,

    /// Refine these pages (file names or stems) instead of running a batch.
    #[arg(long, num_args = 1.., value_name = "PAGE")]
    refine: Vec<String>,

    /// Translate the committed Markdown in the output directory into LANGUAGE.
    #[arg(long, value_name = "LANGUAGE", conflicts_with = "refine")]
    translate: Option<String>,

    /// Directory for translations. Defaults to a sibling `<output>_translated`.
    #[arg(long)]
    translation_dir: Option<PathBuf>,

    /// LLM provider: ollama, lmstudio, openrouter, openai, anthropic, gemini.
    #[arg(long)]
    provider: Option<String>,

    /// Vision model for page and component transcription.
    #[arg(long)]
    model: Option<String>,

    /// Model for semantic reassembly (structured mode). Defaults to --model.
    #[arg(long, env = "PAGESCRIBE_REASSEMBLY_MODEL")]
    reassembly_model: Option<String>,

    /// LLM temperature (0.0–2.0).
    #[arg(long)]
    temperature: Option<f32>,

    /// Max LLM output tokens per call.
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Retries per backend call.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-call timeout in seconds (0 = none).
    #[arg(long)]
    api_timeout: Option<u64>,

    /// Pause after each per-component call, in milliseconds.
    #[arg(long)]
    component_delay: Option<u64>,

    /// Keep components the reassembly step leaves out, appended at the end.
    #[arg(long)]
    append_omitted: bool,

    /// Skip the startup connectivity check.
    #[arg(long)]
    no_check: bool,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PAGESCRIBE_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PAGESCRIBE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAGESCRIBE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PAGESCRIBE_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Basic,
    Structured,
}

impl Cli {
    fn run_mode(&self) -> Mode {
        if let Some(ref language) = self.translate {
            return Mode::Translate {
                target_language: language.clone(),
            };
        }
        if !self.refine.is_empty() {
            return Mode::Refine(self.refine.clone());
        }
        match self.mode {
            ModeArg::Basic => Mode::Basic,
            ModeArg::Structured => Mode::Structured,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar gives the per-page feedback; library INFO logs would
    // tear it, so they are hidden unless --verbose asks for everything.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn RunProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;
    let mode = cli.run_mode();

    let summary = run(config, mode).await.context("Run failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&summary).context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&summary, show_progress);
    }

    summary.into_result()?;
    Ok(())
}

fn print_summary(summary: &RunSummary, show_progress: bool) {
    if !show_progress {
        eprintln!(
            "{} run: {}/{} pages committed in {}ms",
            summary.mode,
            summary.committed(),
            summary.scheduled,
            summary.duration_ms
        );
    }
    for report in &summary.pages {
        if !report.omitted_components.is_empty() {
            eprintln!(
                "   {} {}: reassembly dropped {}",
                yellow("!"),
                report.page,
                report.omitted_components.join(", ")
            );
        }
        if !report.failed_components.is_empty() {
            eprintln!(
                "   {} {}: no transcription for {}",
                yellow("!"),
                report.page,
                report.failed_components.join(", ")
            );
        }
    }
    if summary.skipped() > 0 {
        eprintln!("   {} pages skipped", summary.skipped());
    }
}

/// Load the config file (if any) and apply CLI flags on top.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = match cli.config {
        Some(ref path) => PipelineConfigBuilder::from_file(path)?,
        None => PipelineConfig::builder(),
    };

    if let Some(ref d) = cli.input {
        builder = builder.input_dir(d);
    }
    if let Some(ref d) = cli.output {
        builder = builder.output_dir(d);
    }
    if let Some(ref d) = cli.cache {
        builder = builder.cache_dir(d);
    }
    if let Some(ref d) = cli.translation_dir {
        builder = builder.translation_dir(d);
    }
    if let Some(ref p) = cli.provider {
        builder = builder.select_provider(p);
    }
    if let Some(ref m) = cli.model {
        builder = builder.model(m);
    }
    if let Some(ref m) = cli.reassembly_model {
        builder = builder.reassembly_model(m);
    }
    if let Some(t) = cli.temperature {
        builder = builder.temperature(t);
    }
    if let Some(n) = cli.max_tokens {
        builder = builder.max_tokens(n);
    }
    if let Some(n) = cli.max_retries {
        builder = builder.max_retries(n);
    }
    if let Some(s) = cli.api_timeout {
        builder = builder.api_timeout_secs(s);
    }
    if let Some(ms) = cli.component_delay {
        builder = builder.component_delay_ms(ms);
    }
    if cli.append_omitted {
        builder = builder.append_omitted_components(true);
    }
    if cli.no_check {
        builder = builder.check_backend(false);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    Ok(builder.build()?)
}
