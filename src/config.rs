//! Config handling

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::log::LevelFilter;

use crate::constants::{
    DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_BASE_DELAY_MS, DEFAULT_CONCURRENCY, DEFAULT_JITTER,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW_SECS,
};
use crate::error::GenerationError;

/// Sets up logging based on the debug flag
pub fn setup_logging(debug: bool) -> Result<(), Box<std::io::Error>> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut logger = simple_logger::SimpleLogger::new().with_level(level);
    if !debug {
        logger = logger
            .with_module_level("tracing", LevelFilter::Warn)
            .with_module_level("reqwest", LevelFilter::Warn)
            .with_module_level("rustls", LevelFilter::Info)
            .with_module_level("hyper_util", LevelFilter::Info)
            .with_module_level("h2", LevelFilter::Info);
    }
    logger.init().map_err(|err| {
        eprintln!("Failed to initialize logger: {}", err);
        Box::new(std::io::Error::other(err))
    })
}

/// Retry/backoff settings for remote calls.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per logical call, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every following attempt.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter, `0.0..=1.0`.
    pub jitter: f64,
    /// How long a single attempt may wait for a rate limit token.
    pub acquire_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter: DEFAULT_JITTER,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl RetryConfig {
    /// Rejects settings the retry loop can't honour.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.max_attempts == 0 {
            return Err(GenerationError::Config(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(GenerationError::Config(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(GenerationError::Config(
                "max delay must not be shorter than the base delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before attempt `attempt + 1`, given that `attempt` (1-based) just failed.
    /// `jitter_sample` is expected in `0.0..1.0`.
    pub fn backoff(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        delay + delay.mul_f64(self.jitter * jitter_sample.clamp(0.0, 1.0))
    }
}

/// Token bucket settings shared by every call to the remote service.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Tokens available per window.
    pub capacity: u32,
    /// Rolling window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RATE_LIMIT,
            window: Duration::from_secs(DEFAULT_RATE_WINDOW_SECS),
        }
    }
}

impl RateLimitConfig {
    /// Capacity and window must both be non-zero.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.capacity == 0 {
            return Err(GenerationError::Config(
                "rate limit capacity must be at least 1".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(GenerationError::Config(
                "rate limit window must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Orchestrator settings.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchConfig {
    /// Worker pool size.
    pub concurrency: usize,
    /// Run a scene analysis once per scene and attach it to that scene's prompts.
    pub analyze_scenes: bool,
    /// Allow replacing existing output files.
    pub overwrite: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            analyze_scenes: false,
            overwrite: true,
        }
    }
}

impl BatchConfig {
    /// Concurrency must be at least one worker.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.concurrency == 0 {
            return Err(GenerationError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Realism level requested for object insertion.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Enhancement {
    /// Natural placement and basic lighting.
    Basic,
    /// Lighting, shadows and perspective correction.
    #[default]
    Realistic,
    /// Full lighting analysis and seamless blending.
    Photorealistic,
}

impl FromStr for Enhancement {
    type Err = GenerationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "realistic" => Ok(Self::Realistic),
            "photorealistic" => Ok(Self::Photorealistic),
            other => Err(GenerationError::Config(format!(
                "unknown enhancement level '{other}' (expected basic, realistic or photorealistic)"
            ))),
        }
    }
}

/// Typography style for text insertion.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TextStyle {
    /// Handwritten, relaxed.
    Casual,
    /// Clean, professional.
    Formal,
    /// Stylized.
    Artistic,
    /// Bold athletic lettering.
    Sporty,
    /// Retro, aged.
    Vintage,
}

impl FromStr for TextStyle {
    type Err = GenerationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "casual" => Ok(Self::Casual),
            "formal" => Ok(Self::Formal),
            "artistic" => Ok(Self::Artistic),
            "sporty" => Ok(Self::Sporty),
            "vintage" => Ok(Self::Vintage),
            other => Err(GenerationError::Config(format!(
                "unknown text style '{other}' (expected casual, formal, artistic, sporty or vintage)"
            ))),
        }
    }
}

/// Surface that inserted text should be placed on.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetArea {
    /// Front of a piece of clothing.
    #[default]
    Shirt,
    /// Sign surfaces.
    Sign,
    /// Banners or posters.
    Banner,
    /// Book covers and pages.
    Book,
    /// Walls.
    Wall,
    /// Pavement or floor.
    Ground,
    /// Any other named surface.
    Custom(String),
}

impl TargetArea {
    /// Name as it appears in prompts.
    pub fn name(&self) -> &str {
        match self {
            Self::Shirt => "shirt",
            Self::Sign => "sign",
            Self::Banner => "banner",
            Self::Book => "book",
            Self::Wall => "wall",
            Self::Ground => "ground",
            Self::Custom(name) => name,
        }
    }
}

impl FromStr for TargetArea {
    type Err = GenerationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "" => Err(GenerationError::Config(
                "target area must not be empty".to_string(),
            )),
            "shirt" => Ok(Self::Shirt),
            "sign" => Ok(Self::Sign),
            "banner" => Ok(Self::Banner),
            "book" => Ok(Self::Book),
            "wall" => Ok(Self::Wall),
            "ground" => Ok(Self::Ground),
            _ => Ok(Self::Custom(value)),
        }
    }
}

/// Per-batch generation knobs, fixed for every job the scheduler emits.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GenerationOptions {
    /// Realism level for object insertion.
    pub enhancement: Enhancement,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff(1, 0.9), Duration::from_millis(100));
        assert_eq!(config.backoff(2, 0.9), Duration::from_millis(200));
        assert_eq!(config.backoff(3, 0.9), Duration::from_millis(350));
        assert_eq!(config.backoff(40, 0.9), Duration::from_millis(350));
    }

    #[test]
    fn backoff_jitter_is_a_fraction_of_the_delay() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            jitter: 0.5,
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff(1, 0.0), Duration::from_millis(1000));
        assert_eq!(config.backoff(1, 1.0), Duration::from_millis(1500));
        assert_eq!(config.backoff(2, 0.5), Duration::from_millis(2500));
    }

    #[test]
    fn retry_config_rejects_zero_attempts() {
        let config = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(matches!(config.validate(), Err(GenerationError::Config(_))));
        assert!(RetryConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_known_and_custom_areas() {
        assert_eq!("Sign".parse::<TargetArea>(), Ok(TargetArea::Sign));
        assert_eq!(
            " mug ".parse::<TargetArea>(),
            Ok(TargetArea::Custom("mug".to_string()))
        );
        assert!("  ".parse::<TargetArea>().is_err());
    }

    #[test]
    fn unknown_style_is_a_config_error() {
        assert_eq!("vintage".parse::<TextStyle>(), Ok(TextStyle::Vintage));
        assert!(matches!(
            "gothic".parse::<TextStyle>(),
            Err(GenerationError::Config(_))
        ));
        assert!(matches!(
            "ultra".parse::<Enhancement>(),
            Err(GenerationError::Config(_))
        ));
    }
}
