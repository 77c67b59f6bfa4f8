//! Gemini `generateContent` over HTTPS, plus parsing of its response bodies.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{ApiError, GeneratedImage, GenerationApi, ResponseError};
use crate::constants::API_KEY_HEADER;
use crate::error::GenerationError;
use crate::prompt::{GenerationRequest, RequestPart, ResponseModality};

/// Finish reasons that mean the service refused to produce content.
const REFUSAL_FINISH_REASONS: [&str; 6] = [
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "RECITATION",
];

// -----------------------------
// Wire types
// -----------------------------

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Debug)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum WirePart<'a> {
    Text {
        text: &'a str,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, alias = "prompt_feedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default, alias = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "inline_data")]
    inline_data: Option<InlineBlob>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineBlob {
    #[serde(default, alias = "mime_type")]
    mime_type: Option<String>,
    data: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default, alias = "block_reason")]
    block_reason: Option<String>,
}

fn encode_request(request: &GenerationRequest) -> GenerateContentRequest<'_> {
    let parts = request
        .parts
        .iter()
        .map(|part| match part {
            RequestPart::Text(text) => WirePart::Text { text },
            RequestPart::Image(image) => WirePart::Inline {
                inline_data: InlineData {
                    mime_type: &image.mime_type,
                    data: general_purpose::STANDARD.encode(&image.data),
                },
            },
        })
        .collect();
    let generation_config = match request.modality {
        ResponseModality::Image => Some(GenerationConfig {
            response_modalities: Some(vec!["TEXT", "IMAGE"]),
            response_mime_type: None,
        }),
        ResponseModality::Json => Some(GenerationConfig {
            response_modalities: None,
            response_mime_type: Some("application/json"),
        }),
        ResponseModality::Text => None,
    };
    GenerateContentRequest {
        contents: vec![Content {
            role: "user",
            parts,
        }],
        generation_config,
    }
}

// -----------------------------
// Response parsing
// -----------------------------

fn parse_envelope(body: &[u8]) -> Result<GenerateContentResponse, ResponseError> {
    let parsed: GenerateContentResponse = serde_json::from_slice(body)
        .map_err(|err| ResponseError::Malformed(format!("invalid JSON: {err}")))?;
    if let Some(reason) = parsed
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.as_deref())
    {
        return Err(ResponseError::Rejected(format!("prompt blocked: {reason}")));
    }
    Ok(parsed)
}

fn refusal(candidates: &[Candidate]) -> Option<ResponseError> {
    candidates
        .iter()
        .filter_map(|candidate| candidate.finish_reason.as_deref())
        .find(|reason| REFUSAL_FINISH_REASONS.contains(reason))
        .map(|reason| ResponseError::Rejected(format!("generation stopped: {reason}")))
}

fn collect_text(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
}

/// Extracts the first inline image of a response.
pub fn parse_image_response(body: &[u8]) -> Result<GeneratedImage, ResponseError> {
    let parsed = parse_envelope(body)?;
    let inline = parsed
        .candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .find_map(|part| part.inline_data.as_ref().filter(|blob| !blob.data.is_empty()));

    let Some(inline) = inline else {
        if let Some(rejected) = refusal(&parsed.candidates) {
            return Err(rejected);
        }
        return Err(ResponseError::Malformed(
            "no image generated in response".to_string(),
        ));
    };

    let bytes = general_purpose::STANDARD
        .decode(inline.data.as_bytes())
        .map_err(|err| ResponseError::Malformed(format!("image base64 decode failed: {err}")))?;
    let commentary = collect_text(&parsed.candidates);
    if !commentary.trim().is_empty() {
        debug!("Model commentary: {}", commentary.trim());
    }

    Ok(GeneratedImage {
        bytes,
        mime_type: inline.mime_type.clone(),
        commentary: Some(commentary).filter(|text| !text.trim().is_empty()),
    })
}

/// Concatenates the text parts of a response.
pub fn parse_text_response(body: &[u8]) -> Result<String, ResponseError> {
    let parsed = parse_envelope(body)?;
    let text = collect_text(&parsed.candidates);
    if text.trim().is_empty() {
        if let Some(rejected) = refusal(&parsed.candidates) {
            return Err(rejected);
        }
        return Err(ResponseError::Malformed(
            "no text in response".to_string(),
        ));
    }
    Ok(text)
}

// -----------------------------
// HTTP client
// -----------------------------

/// Settings for [`GeminiClient`].
#[derive(Clone, Debug)]
pub struct GeminiSettings {
    /// API key sent with every request.
    pub api_key: String,
    /// Model name, eg `gemini-2.5-flash-image-preview`.
    pub model: String,
    /// API base, ending in a slash.
    pub endpoint: Url,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// If set, raw response bodies are written here.
    pub debug_dir: Option<PathBuf>,
}

/// [`GenerationApi`] backed by the Gemini REST API.
#[derive(Debug)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    url: Url,
    debug_dir: Option<PathBuf>,
}

impl GeminiClient {
    /// Builds the HTTP client and resolves the model URL.
    pub fn new(settings: GeminiSettings) -> Result<Self, GenerationError> {
        if settings.api_key.trim().is_empty() {
            return Err(GenerationError::Config(
                "an API key is required (set GEMINI_API_KEY)".to_string(),
            ));
        }
        let url = settings
            .endpoint
            .join(&format!("models/{}:generateContent", settings.model))
            .map_err(|err| GenerationError::Config(format!("invalid endpoint: {err}")))?;
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| GenerationError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            api_key: settings.api_key,
            url,
            debug_dir: settings.debug_dir,
        })
    }

    async fn write_api_response(&self, prefix: &str, bytes: &[u8]) {
        static API_RESPONSE_SEQ: AtomicUsize = AtomicUsize::new(0);
        let Some(dir) = self.debug_dir.as_ref() else {
            return;
        };
        let seq = API_RESPONSE_SEQ.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let filename = dir.join(format!("debug_{prefix}_{ts}_{seq}.json"));
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            warn!("Failed to create {}: {}", dir.display(), err);
            return;
        }
        match tokio::fs::write(&filename, bytes).await {
            Ok(()) => debug!("Response saved to {}", filename.display()),
            Err(err) => warn!("Failed to write {}: {}", filename.display(), err),
        }
    }
}

#[async_trait]
impl GenerationApi for GeminiClient {
    async fn invoke(&self, request: &GenerationRequest) -> Result<Vec<u8>, ApiError> {
        let body = encode_request(request);
        let resp = self
            .http
            .post(self.url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ApiError::Timeout(err.to_string())
                } else {
                    ApiError::Network(err.to_string())
                }
            })?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|err| {
            if err.is_timeout() {
                ApiError::Timeout(err.to_string())
            } else {
                ApiError::Network(format!("failed reading response body: {err}"))
            }
        })?;
        self.write_api_response(request.modality.label(), &bytes)
            .await;

        if status.as_u16() == 429 {
            return Err(ApiError::RateLimited(
                String::from_utf8_lossy(&bytes).to_string(),
            ));
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
            });
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::prompt::LoadedImage;

    fn body(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).expect("serialize")
    }

    #[test]
    fn request_encodes_text_and_inline_images() {
        let request = GenerationRequest {
            parts: vec![
                RequestPart::Text("insert a ball".to_string()),
                RequestPart::Image(LoadedImage {
                    mime_type: "image/png".to_string(),
                    data: vec![1, 2, 3].into(),
                }),
            ],
            modality: ResponseModality::Image,
        };
        let encoded = serde_json::to_value(encode_request(&request)).expect("encode");
        assert_eq!(
            encoded,
            json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        {"text": "insert a ball"},
                        {"inlineData": {"mimeType": "image/png", "data": "AQID"}}
                    ]
                }],
                "generationConfig": {"responseModalities": ["TEXT", "IMAGE"]}
            })
        );
    }

    #[test]
    fn analysis_requests_ask_for_json() {
        let request = GenerationRequest {
            parts: vec![RequestPart::Text("analyse".to_string())],
            modality: ResponseModality::Json,
        };
        let encoded = serde_json::to_value(encode_request(&request)).expect("encode");
        assert_eq!(
            encoded["generationConfig"],
            json!({"responseMimeType": "application/json"})
        );
    }

    #[test]
    fn extracts_inline_image_in_either_casing() {
        let camel = body(json!({
            "candidates": [{"content": {"parts": [
                {"text": "Here you go"},
                {"inlineData": {"mimeType": "image/png", "data": "AQID"}}
            ]}}]
        }));
        let image = parse_image_response(&camel).expect("image");
        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert_eq!(image.mime_type.as_deref(), Some("image/png"));
        assert_eq!(image.commentary.as_deref(), Some("Here you go"));

        let snake = body(json!({
            "candidates": [{"content": {"parts": [
                {"inline_data": {"mime_type": "image/jpeg", "data": "AQID"}}
            ]}}]
        }));
        assert_eq!(parse_image_response(&snake).expect("image").bytes, vec![1, 2, 3]);
    }

    #[test]
    fn missing_image_is_malformed_and_safety_stop_is_rejected() {
        let text_only = body(json!({
            "candidates": [{"content": {"parts": [{"text": "I can't"}]}, "finishReason": "STOP"}]
        }));
        assert!(matches!(
            parse_image_response(&text_only),
            Err(ResponseError::Malformed(_))
        ));

        let blocked = body(json!({
            "candidates": [{"finishReason": "IMAGE_SAFETY"}]
        }));
        assert!(matches!(
            parse_image_response(&blocked),
            Err(ResponseError::Rejected(_))
        ));

        let prompt_blocked = body(json!({"promptFeedback": {"blockReason": "SAFETY"}}));
        assert!(matches!(
            parse_text_response(&prompt_blocked),
            Err(ResponseError::Rejected(_))
        ));

        assert!(matches!(
            parse_image_response(b"<html>oops</html>"),
            Err(ResponseError::Malformed(_))
        ));
    }

    #[test]
    fn joins_text_parts() {
        let reply = body(json!({
            "candidates": [{"content": {"parts": [{"text": "base"}, {"text": "ball\n"}]}}]
        }));
        assert_eq!(parse_text_response(&reply).expect("text"), "baseball\n");
    }

    #[test]
    fn rejects_blank_api_key() {
        let settings = GeminiSettings {
            api_key: "  ".to_string(),
            model: "m".to_string(),
            endpoint: Url::parse(crate::constants::DEFAULT_ENDPOINT).expect("url"),
            request_timeout: Duration::from_secs(1),
            debug_dir: None,
        };
        assert!(matches!(
            GeminiClient::new(settings),
            Err(GenerationError::Config(_))
        ));
    }
}
