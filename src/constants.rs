//! Shared constants/defaults for things
//!

/// Default multimodal model used for generation and analysis.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image-preview";

/// Base URL of the Generative Language REST API.
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/";

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Scene and object image extensions picked up in batch mode.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Name of the machine readable report written next to batch outputs.
pub const BATCH_REPORT_FILENAME: &str = "batch_report.json";

/// Object type used when detection fails.
pub const FALLBACK_OBJECT_TYPE: &str = "object";

/// Default number of attempts per remote call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Default cap on the exponential backoff, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Default jitter fraction added to every backoff.
pub const DEFAULT_JITTER: f64 = 0.25;

/// Default tokens per rate limit window.
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// Default rate limit window, in seconds.
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 60;

/// Default bound on waiting for a rate limit token, in seconds.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 120;

/// Default per-request HTTP timeout, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default worker pool size.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default variations per (scene, item) pair in batch mode.
pub const DEFAULT_NUM_VARIATIONS: u32 = 3;
