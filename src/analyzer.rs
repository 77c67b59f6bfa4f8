//! Single-image requests: structured scene analysis and object type detection.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::api::ResponseError;
use crate::api::gemini::parse_text_response;
use crate::constants::FALLBACK_OBJECT_TYPE;
use crate::error::GenerationError;
use crate::prompt::{LoadedImage, analysis_request, detection_request};
use crate::retry::RetryingClient;

/// A region of the image that suits an insertion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlacementZone {
    /// Short name, eg `table top`.
    pub label: String,
    /// Where it is in the image.
    pub region: String,
    /// Kinds of content that fit there.
    #[serde(default)]
    pub suitable_for: Vec<String>,
}

/// Placement recommendation for one scene.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneAnalysis {
    /// What the image shows.
    #[serde(default)]
    pub description: String,
    /// Recommended placement zones.
    pub zones: Vec<PlacementZone>,
    /// Objects that could be added.
    #[serde(default)]
    pub object_opportunities: Vec<String>,
    /// Surfaces that could carry text.
    #[serde(default)]
    pub text_opportunities: Vec<String>,
    /// How lighting affects realism.
    #[serde(default)]
    pub lighting_notes: String,
    /// Expected difficulties.
    #[serde(default)]
    pub challenges: Vec<String>,
    /// Model confidence, `0.0..=1.0`.
    pub confidence: f64,
}

impl SceneAnalysis {
    /// Human readable rendering for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "SCENE DESCRIPTION:\n  {}", self.description);
        let _ = writeln!(out, "\nOPTIMAL PLACEMENT ZONES:");
        for zone in &self.zones {
            let _ = writeln!(
                out,
                "  - {} ({}): {}",
                zone.label,
                zone.region,
                zone.suitable_for.join(", ")
            );
        }
        render_list(&mut out, "OBJECT INSERTION OPPORTUNITIES", &self.object_opportunities);
        render_list(&mut out, "TEXT INSERTION OPPORTUNITIES", &self.text_opportunities);
        let _ = writeln!(out, "\nLIGHTING CONSIDERATIONS:\n  {}", self.lighting_notes);
        render_list(&mut out, "CHALLENGES", &self.challenges);
        let _ = writeln!(out, "\nCONFIDENCE: {:.2}", self.confidence);
        out
    }
}

fn render_list(out: &mut String, title: &str, entries: &[String]) {
    let _ = writeln!(out, "\n{title}:");
    for entry in entries {
        let _ = writeln!(out, "  - {entry}");
    }
}

/// Strips a Markdown code fence, if the model wrapped its JSON in one.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parses an analysis response body.
pub fn parse_analysis(body: &[u8]) -> Result<SceneAnalysis, ResponseError> {
    let text = parse_text_response(body)?;
    let analysis: SceneAnalysis = serde_json::from_str(strip_code_fence(&text))
        .map_err(|err| ResponseError::Malformed(format!("analysis is not valid JSON: {err}")))?;
    if !(0.0..=1.0).contains(&analysis.confidence) {
        return Err(ResponseError::Malformed(format!(
            "confidence {} is outside 0..=1",
            analysis.confidence
        )));
    }
    Ok(analysis)
}

/// Parses an object detection response into a lowercase 1-2 word name.
pub fn parse_object_type(body: &[u8]) -> Result<String, ResponseError> {
    let text = parse_text_response(body)?;
    let first_line = text.lines().map(str::trim).find(|line| !line.is_empty());
    let name = first_line
        .map(|line| {
            line.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
                .split_whitespace()
                .take(2)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ResponseError::Malformed("no object name in response".to_string()))?;
    Ok(name)
}

/// Runs analysis and detection requests through the shared retrying client.
#[derive(Clone, Debug)]
pub struct SceneAnalyzer {
    client: Arc<RetryingClient>,
}

impl SceneAnalyzer {
    /// Uses the given client, and therefore its rate limiter.
    pub fn new(client: Arc<RetryingClient>) -> Self {
        Self { client }
    }

    /// Loads an image and analyses it.
    #[instrument(skip(self))]
    pub async fn analyze(&self, path: &Path) -> Result<SceneAnalysis, GenerationError> {
        let image = LoadedImage::load(path).await?;
        self.analyze_image(&image).await
    }

    /// Analyses an already loaded image. Unparseable output after all attempts
    /// becomes [`GenerationError::AnalysisParse`].
    pub async fn analyze_image(
        &self,
        image: &LoadedImage,
    ) -> Result<SceneAnalysis, GenerationError> {
        let request = analysis_request(image);
        match self.client.call(&request, parse_analysis).await {
            Ok(success) => {
                info!(
                    "Scene analysis finished in {:?} ({} attempt(s), {} zone(s))",
                    success.latency,
                    success.attempts,
                    success.value.zones.len()
                );
                Ok(success.value)
            }
            Err(failure) => Err(match failure.error {
                GenerationError::MalformedResponse(msg) => GenerationError::AnalysisParse(msg),
                other => other,
            }),
        }
    }

    /// Names the main object in an image, falling back to `object` on any failure.
    #[instrument(skip(self))]
    pub async fn detect_object_type(&self, path: &Path) -> String {
        let image = match LoadedImage::load(path).await {
            Ok(image) => image,
            Err(err) => {
                warn!("Object detection failed: {}", err);
                return FALLBACK_OBJECT_TYPE.to_string();
            }
        };
        match self
            .client
            .call(&detection_request(&image), parse_object_type)
            .await
        {
            Ok(success) => {
                info!("Detected object type: {}", success.value);
                success.value
            }
            Err(failure) => {
                warn!("Object detection failed: {}", failure.error);
                FALLBACK_OBJECT_TYPE.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::api::{ApiError, GenerationApi};
    use crate::config::{RateLimitConfig, RetryConfig};
    use crate::limiter::RateLimiter;
    use crate::prompt::GenerationRequest;

    /// Always answers with the same text part.
    struct TextApi {
        text: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationApi for TextApi {
        async fn invoke(&self, _request: &GenerationRequest) -> Result<Vec<u8>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(text_body(self.text))
        }
    }

    fn analyzer(api: Arc<TextApi>) -> SceneAnalyzer {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            capacity: 10,
            window: Duration::from_secs(60),
        }));
        let client = RetryingClient::new(
            api,
            limiter,
            RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                ..RetryConfig::default()
            },
        )
        .expect("client");
        SceneAnalyzer::new(Arc::new(client))
    }

    fn image() -> LoadedImage {
        LoadedImage {
            mime_type: "image/png".to_string(),
            data: vec![1, 2, 3].into(),
        }
    }

    fn text_body(text: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "candidates": [{"content": {"parts": [{"text": text}]}}]
        }))
        .expect("serialize")
    }

    #[test]
    fn parses_fenced_analysis() {
        let body = text_body(
            "```json\n{\"description\": \"a kitchen\", \"zones\": [{\"label\": \"counter\", \"region\": \"center\", \"suitable_for\": [\"phone\"]}], \"lighting_notes\": \"soft\", \"confidence\": 0.7}\n```",
        );
        let analysis = parse_analysis(&body).expect("analysis");
        assert_eq!(analysis.description, "a kitchen");
        assert_eq!(analysis.zones[0].label, "counter");
        assert!(analysis.challenges.is_empty());
        assert!((analysis.confidence - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_prose_and_out_of_range_confidence() {
        assert!(matches!(
            parse_analysis(&text_body("The scene shows a kitchen.")),
            Err(ResponseError::Malformed(_))
        ));
        assert!(matches!(
            parse_analysis(&text_body("{\"zones\": [], \"confidence\": 7}")),
            Err(ResponseError::Malformed(_))
        ));
    }

    #[test]
    fn object_type_is_first_line_lowercased() {
        assert_eq!(
            parse_object_type(&text_body("Baseball Cap.\nIt is red")).expect("type"),
            "baseball cap"
        );
        assert_eq!(
            parse_object_type(&text_body("\n  \"Phone\"  ")).expect("type"),
            "phone"
        );
        assert!(parse_object_type(&text_body("...")).is_err());
    }

    #[test]
    fn render_includes_sections() {
        let analysis = SceneAnalysis {
            description: "a street".to_string(),
            zones: Vec::new(),
            object_opportunities: vec!["a bike by the wall".to_string()],
            text_opportunities: Vec::new(),
            lighting_notes: "overcast".to_string(),
            challenges: Vec::new(),
            confidence: 0.5,
        };
        let rendered = analysis.render();
        assert!(rendered.contains("OBJECT INSERTION OPPORTUNITIES:\n  - a bike by the wall"));
        assert!(rendered.contains("CONFIDENCE: 0.50"));
    }

    #[tokio::test]
    async fn unparseable_analysis_becomes_analysis_parse_after_two_attempts() {
        let api = Arc::new(TextApi {
            text: "not json",
            calls: AtomicUsize::new(0),
        });
        let result = analyzer(Arc::clone(&api)).analyze_image(&image()).await;

        assert!(matches!(result, Err(GenerationError::AnalysisParse(_))));
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unparseable_object_name_falls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("thing.png");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).expect("write");
        let api = Arc::new(TextApi {
            text: "...",
            calls: AtomicUsize::new(0),
        });

        let detected = analyzer(Arc::clone(&api)).detect_object_type(&path).await;
        assert_eq!(detected, FALLBACK_OBJECT_TYPE);
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }
}
