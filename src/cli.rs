//! CLI parser
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::api::gemini::GeminiSettings;
use crate::config::{BatchConfig, Enhancement, RateLimitConfig, RetryConfig, TargetArea, TextStyle};
use crate::constants::{
    DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_BASE_DELAY_MS, DEFAULT_CONCURRENCY, DEFAULT_ENDPOINT,
    DEFAULT_JITTER, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, DEFAULT_MODEL,
    DEFAULT_NUM_VARIATIONS, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW_SECS,
    DEFAULT_REQUEST_TIMEOUT_SECS,
};

#[derive(Parser, Debug)]
#[command(name = "sceneforge")]
#[command(about = "Insert objects and text into photographs with a multimodal generation model")]
/// CLI Options
pub struct CliOptions {
    /// API key for the generation service.
    /// Env: GEMINI_API_KEY
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Model used for generation, analysis and detection.
    /// Env: SCENEFORGE_MODEL
    #[arg(long, default_value = DEFAULT_MODEL, env = "SCENEFORGE_MODEL")]
    pub model: String,

    /// API base URL.
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: Url,

    /// Enable debug logging. Env: SCENEFORGE_DEBUG
    #[arg(long, help = "Enable debug logging", env = "SCENEFORGE_DEBUG")]
    pub debug: bool,

    /// If set, every raw API response is written here as `debug_*.json`.
    #[arg(long)]
    pub debug_dir: Option<PathBuf>,

    /// Attempts per remote call, including the first.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[arg(long, default_value_t = DEFAULT_BASE_DELAY_MS)]
    pub base_delay_ms: u64,

    /// Cap on the exponential backoff.
    #[arg(long, default_value_t = DEFAULT_MAX_DELAY_MS)]
    pub max_delay_ms: u64,

    /// Random fraction of the backoff added on top, `0.0..=1.0`.
    #[arg(long, default_value_t = DEFAULT_JITTER)]
    pub jitter: f64,

    /// Requests allowed per rate limit window.
    #[arg(long, default_value_t = DEFAULT_RATE_LIMIT)]
    pub rate_limit: u32,

    /// Length of the rate limit window.
    #[arg(long, default_value_t = DEFAULT_RATE_WINDOW_SECS)]
    pub rate_window_secs: u64,

    /// Longest wait for a rate limit token before a call gives up.
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS)]
    pub acquire_timeout_secs: u64,

    /// HTTP timeout for a single request.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,

    #[command(subcommand)]
    /// What to do.
    pub command: Commands,
}

impl CliOptions {
    /// Retry settings from the global options.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }

    /// Rate limit settings from the global options.
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            capacity: self.rate_limit,
            window: Duration::from_secs(self.rate_window_secs),
        }
    }

    /// HTTP client settings from the global options.
    pub fn gemini_settings(&self) -> GeminiSettings {
        GeminiSettings {
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            endpoint: self.endpoint.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            debug_dir: self.debug_dir.clone(),
        }
    }
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Insert an object image into a scene.
    InsertObject(InsertObjectArgs),
    /// Render text onto a surface in a scene.
    InsertText(InsertTextArgs),
    /// Ask for placement recommendations for a scene.
    AnalyzeScene(AnalyzeSceneArgs),
    /// Generate variations for every scene in a directory.
    BatchProcess(BatchArgs),
}

/// `insert-object` arguments.
#[derive(Args, Debug, Clone)]
pub struct InsertObjectArgs {
    /// Scene image.
    pub scene: PathBuf,
    /// Object image.
    pub object: PathBuf,
    /// Where to write the result. The extension picks the format.
    pub output: PathBuf,
    /// Object type, eg `ball`. Detected from the object image when omitted.
    #[arg(long)]
    pub object_type: Option<String>,
    /// basic, realistic or photorealistic.
    #[arg(long, default_value = "realistic")]
    pub enhancement: Enhancement,
    /// Analyse the scene first and use the result as placement context.
    #[arg(long)]
    pub analyze_scene: bool,
}

/// `insert-text` arguments.
#[derive(Args, Debug, Clone)]
pub struct InsertTextArgs {
    /// Scene image.
    pub scene: PathBuf,
    /// Text to insert.
    pub text: String,
    /// Where to write the result. The extension picks the format.
    pub output: PathBuf,
    /// shirt, sign, banner, book, wall, ground, or any other surface name.
    #[arg(long, default_value = "shirt")]
    pub target_area: TargetArea,
    /// casual, formal, artistic, sporty or vintage.
    #[arg(long)]
    pub style: Option<TextStyle>,
    /// Analyse the scene first and use the result as placement context.
    #[arg(long)]
    pub analyze_scene: bool,
}

/// `analyze-scene` arguments.
#[derive(Args, Debug, Clone)]
pub struct AnalyzeSceneArgs {
    /// Image to analyse.
    pub image: PathBuf,
    /// Print the analysis as JSON.
    #[arg(long)]
    pub json: bool,
}

/// `batch-process` arguments.
#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Directory of scene images.
    pub input_dir: PathBuf,
    /// Directory for generated images, created when missing.
    pub output_dir: PathBuf,
    /// Directory of object images to insert.
    #[arg(long)]
    pub objects_dir: Option<PathBuf>,
    /// File with one text to insert per line.
    #[arg(long)]
    pub texts_file: Option<PathBuf>,
    /// Variations per scene and item.
    #[arg(long, default_value_t = DEFAULT_NUM_VARIATIONS)]
    pub num_variations: u32,
    /// Jobs in flight at once.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,
    /// basic, realistic or photorealistic.
    #[arg(long, default_value = "realistic")]
    pub enhancement: Enhancement,
    /// Surface for every text item.
    #[arg(long, default_value = "shirt")]
    pub target_area: TargetArea,
    /// Style for every text item.
    #[arg(long)]
    pub style: Option<TextStyle>,
    /// Ask the model for each object's type instead of using the file name.
    #[arg(long)]
    pub detect_object_types: bool,
    /// Analyse each scene once and use the result as placement context.
    #[arg(long)]
    pub analyze_scenes: bool,
    /// Fail jobs whose output file already exists instead of replacing it.
    #[arg(long)]
    pub no_overwrite: bool,
    /// Skip writing `batch_report.json`.
    #[arg(long)]
    pub no_report: bool,
}

impl BatchArgs {
    /// Orchestrator settings for this batch.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            concurrency: self.concurrency,
            analyze_scenes: self.analyze_scenes,
            overwrite: !self.no_overwrite,
        }
    }
}
