//! Prompt construction: turns a job plus optional scene context into a request payload.

use std::path::Path;
use std::sync::Arc;

use image::ImageFormat;

use crate::analyzer::SceneAnalysis;
use crate::config::{Enhancement, TargetArea, TextStyle};
use crate::constants::FALLBACK_OBJECT_TYPE;
use crate::error::GenerationError;
use crate::scheduler::{InsertableItem, VariationSpec};

/// What the remote call is expected to return.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseModality {
    /// A generated image, possibly with commentary.
    Image,
    /// A JSON document in the text part.
    Json,
    /// Plain text.
    Text,
}

impl ResponseModality {
    /// Short label used in logs and debug dumps.
    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

/// Image bytes read into memory once and shared between attempts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadedImage {
    /// MIME type sent alongside the bytes.
    pub mime_type: String,
    /// Encoded image.
    pub data: Arc<[u8]>,
}

impl LoadedImage {
    /// Wraps raw bytes, taking the MIME type from the path and falling back to sniffing.
    pub fn new(path: &Path, data: Vec<u8>) -> Result<Self, GenerationError> {
        let format = ImageFormat::from_path(path)
            .or_else(|_| image::guess_format(&data))
            .map_err(|err| {
                GenerationError::Config(format!("{} is not an image: {err}", path.display()))
            })?;
        Ok(Self {
            mime_type: format.to_mime_type().to_string(),
            data: data.into(),
        })
    }

    /// Reads an image from disk.
    pub async fn load(path: &Path) -> Result<Self, GenerationError> {
        let data = tokio::fs::read(path).await.map_err(|err| {
            GenerationError::Io(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::new(path, data)
    }
}

/// One element of a request payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestPart {
    /// Instruction text.
    Text(String),
    /// Inline image.
    Image(LoadedImage),
}

/// A fully assembled request. Built once per job and reused unchanged by every retry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GenerationRequest {
    /// Ordered payload parts.
    pub parts: Vec<RequestPart>,
    /// Expected response shape.
    pub modality: ResponseModality,
}

impl GenerationRequest {
    /// The instruction text, if the first part is text.
    pub fn prompt(&self) -> Option<&str> {
        match self.parts.first() {
            Some(RequestPart::Text(text)) => Some(text),
            _ => None,
        }
    }
}

/// Builds the request for one job. `object` must be present for object insertion jobs.
pub fn build_request(
    spec: &VariationSpec,
    scene: &LoadedImage,
    object: Option<&LoadedImage>,
    analysis: Option<&SceneAnalysis>,
) -> Result<GenerationRequest, GenerationError> {
    let mut parts = Vec::with_capacity(3);
    match spec.item.as_deref() {
        Some(InsertableItem::Object { path, object_type }) => {
            let object = object.ok_or_else(|| {
                GenerationError::Config(format!(
                    "object image {} was not loaded",
                    path.display()
                ))
            })?;
            let object_type = object_type.as_deref().unwrap_or(FALLBACK_OBJECT_TYPE);
            parts.push(RequestPart::Text(object_insertion_prompt(
                object_type,
                spec.options.enhancement,
                analysis,
            )));
            parts.push(RequestPart::Image(scene.clone()));
            parts.push(RequestPart::Image(object.clone()));
        }
        Some(InsertableItem::Text {
            text,
            target_area,
            style,
        }) => {
            parts.push(RequestPart::Text(text_insertion_prompt(
                text,
                target_area,
                *style,
                analysis,
            )));
            parts.push(RequestPart::Image(scene.clone()));
        }
        None => {
            parts.push(RequestPart::Text(scene_variation_prompt(
                spec.options.enhancement,
                analysis,
            )));
            parts.push(RequestPart::Image(scene.clone()));
        }
    }
    Ok(GenerationRequest {
        parts,
        modality: ResponseModality::Image,
    })
}

/// Request asking for a structured placement analysis of one image.
pub fn analysis_request(image: &LoadedImage) -> GenerationRequest {
    GenerationRequest {
        parts: vec![
            RequestPart::Text(analysis_prompt().to_string()),
            RequestPart::Image(image.clone()),
        ],
        modality: ResponseModality::Json,
    }
}

/// Request asking for a one or two word name of the object in the image.
pub fn detection_request(image: &LoadedImage) -> GenerationRequest {
    GenerationRequest {
        parts: vec![
            RequestPart::Text(detection_prompt().to_string()),
            RequestPart::Image(image.clone()),
        ],
        modality: ResponseModality::Text,
    }
}

fn enhancement_clause(level: Enhancement) -> &'static str {
    match level {
        Enhancement::Basic => "natural placement and basic lighting matching",
        Enhancement::Realistic => {
            "realistic lighting, shadows, perspective correction, and natural integration"
        }
        Enhancement::Photorealistic => {
            "photorealistic lighting analysis, accurate shadow casting, precise perspective transformation, color temperature matching, and seamless blending"
        }
    }
}

fn placement_rule(object_type: &str) -> &'static str {
    match object_type {
        "baseball" => "in hands, being thrown/caught, or positioned naturally in a sports context",
        "cap" => "properly fitted on a person's head with natural positioning",
        "glasses" => "correctly positioned on a person's face",
        "book" => "in hands, on surfaces, or in natural reading positions",
        "phone" => "in hands or natural usage positions",
        "ball" => "in hands, on ground, or in active play context",
        _ => "in the most semantically appropriate location",
    }
}

fn style_guidance(style: Option<TextStyle>) -> &'static str {
    match style {
        Some(TextStyle::Casual) => "casual, handwritten-style font with relaxed positioning",
        Some(TextStyle::Formal) => "clean, professional typography with precise alignment",
        Some(TextStyle::Artistic) => "creative, stylized text with artistic flair",
        Some(TextStyle::Sporty) => "bold, athletic-style lettering appropriate for sports context",
        Some(TextStyle::Vintage) => "retro-style typography with aged appearance",
        None => "natural, contextually appropriate styling",
    }
}

fn area_guidance(area: &TargetArea) -> String {
    match area {
        TargetArea::Shirt => {
            "on the chest/front area of clothing, following fabric contours and wrinkles".into()
        }
        TargetArea::Sign => {
            "on visible sign surfaces with appropriate perspective correction".into()
        }
        TargetArea::Banner => "on banner or poster surfaces with natural draping".into(),
        TargetArea::Book => "on book covers or visible pages".into(),
        TargetArea::Wall => "on wall surfaces with appropriate perspective".into(),
        TargetArea::Ground => "on ground surfaces like pavement or floor".into(),
        TargetArea::Custom(name) => format!("on the {name} surface"),
    }
}

fn analysis_section(analysis: Option<&SceneAnalysis>) -> String {
    let Some(analysis) = analysis else {
        return String::new();
    };
    let mut section = String::from("\n\nSCENE ANALYSIS (from a previous look at this image):\n");
    for zone in &analysis.zones {
        section.push_str(&format!(
            "- Zone '{}' at {}: suitable for {}\n",
            zone.label,
            zone.region,
            zone.suitable_for.join(", ")
        ));
    }
    if !analysis.lighting_notes.is_empty() {
        section.push_str(&format!("- Lighting: {}\n", analysis.lighting_notes));
    }
    section.push_str("Prefer the zones above when choosing placement.");
    section
}

/// Prompt for inserting an object of the given type.
pub fn object_insertion_prompt(
    object_type: &str,
    enhancement: Enhancement,
    analysis: Option<&SceneAnalysis>,
) -> String {
    format!(
        r#"Analyze the scene and seamlessly insert the {object_type} into the image.

REQUIREMENTS:
1. PLACEMENT: Position the {object_type} {placement}
2. REALISM: Apply {realism}
3. SCALING: Size the object appropriately for the scene scale and perspective
4. LIGHTING: Match ambient lighting, shadows, and reflections
5. INTEGRATION: Ensure the object looks naturally part of the original scene

TECHNICAL CONSIDERATIONS:
- Analyze depth and perspective to position correctly in 3D space
- Consider object occlusion and layering
- Maintain consistent lighting direction and intensity
- Apply appropriate surface reflections and material properties
- Ensure edge blending is seamless and natural{context}

Generate the final composite image with the {object_type} naturally integrated."#,
        placement = placement_rule(object_type),
        realism = enhancement_clause(enhancement),
        context = analysis_section(analysis),
    )
}

/// Prompt for rendering text onto a surface.
pub fn text_insertion_prompt(
    text: &str,
    area: &TargetArea,
    style: Option<TextStyle>,
    analysis: Option<&SceneAnalysis>,
) -> String {
    let area_name = area.name();
    format!(
        r#"Insert the text "{text}" naturally into the image on the {area_name}.

REQUIREMENTS:
1. PLACEMENT: Position text {placement}
2. TYPOGRAPHY: Use {typography}
3. PERSPECTIVE: Apply correct perspective transformation to match surface angle
4. INTEGRATION: Ensure text follows surface contours (wrinkles, curves, etc.)
5. VISIBILITY: Choose colors that provide good contrast and readability
6. REALISM: Make text appear as if originally part of the scene

TECHNICAL CONSIDERATIONS:
- Match lighting conditions (shadows, highlights on text)
- Apply surface material properties (fabric texture, reflections)
- Ensure text perspective matches viewing angle
- Consider text size appropriate for distance and context
- Apply subtle distortions for fabric/surface conformity{context}

Generate the image with "{text}" naturally integrated on the {area_name}."#,
        placement = area_guidance(area),
        typography = style_guidance(style),
        context = analysis_section(analysis),
    )
}

/// Prompt for item-less jobs: the model picks what to add.
pub fn scene_variation_prompt(
    enhancement: Enhancement,
    analysis: Option<&SceneAnalysis>,
) -> String {
    format!(
        r#"Analyze the scene and add one element that plausibly belongs in it, choosing the object or text yourself.

REQUIREMENTS:
1. PLACEMENT: Use the most semantically appropriate location in the scene
2. REALISM: Apply {realism}
3. INTEGRATION: The result must look like an unedited photograph of the same scene{context}

Generate the final image with the new element naturally integrated."#,
        realism = enhancement_clause(enhancement),
        context = analysis_section(analysis),
    )
}

/// Prompt for the structured scene analysis.
pub fn analysis_prompt() -> &'static str {
    r#"Analyze this image and provide detailed suggestions for synthetic data augmentation.

Respond with a single JSON object and nothing else, using exactly these fields:
{
  "description": "what is in the image and the overall context",
  "zones": [
    {"label": "short name", "region": "where in the image, e.g. 'lower left third' or pixel box", "suitable_for": ["object" or "text" kinds that fit there"]}
  ],
  "object_opportunities": ["objects that could be naturally added and where"],
  "text_opportunities": ["surfaces where text could be placed (shirts, signs, etc.)"],
  "lighting_notes": "how lighting affects insertion realism",
  "challenges": ["potential difficulties for synthetic insertion"],
  "confidence": 0.0
}

"confidence" is your confidence in the recommendations between 0.0 and 1.0.
Be specific about coordinates or regions where possible."#
}

/// Prompt used to name the main object in an image.
pub fn detection_prompt() -> &'static str {
    r#"Analyze this image and identify the main object. Provide a single, concise object name that best describes what you see.

Requirements:
- Return only the object name (e.g., "baseball", "cap", "phone", "book")
- Use simple, common terms
- Focus on the most prominent object in the image
- Keep it to 1-2 words maximum"#
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::analyzer::PlacementZone;
    use crate::config::GenerationOptions;
    use crate::scheduler::{Scene, Scheduler};

    fn png() -> LoadedImage {
        LoadedImage {
            mime_type: "image/png".to_string(),
            data: vec![1, 2, 3].into(),
        }
    }

    fn first_job(items: Vec<InsertableItem>) -> VariationSpec {
        let scheduler = Scheduler::new(
            vec![Scene::from_path("a.jpg").expect("scene")],
            items,
            1,
            GenerationOptions::default(),
        )
        .expect("scheduler");
        scheduler.jobs().next().expect("one job")
    }

    #[test]
    fn object_request_carries_scene_then_object() {
        let job = first_job(vec![InsertableItem::Object {
            path: PathBuf::from("ball.png"),
            object_type: Some("ball".to_string()),
        }]);
        let scene = LoadedImage {
            mime_type: "image/jpeg".to_string(),
            data: vec![9].into(),
        };
        let request = build_request(&job, &scene, Some(&png()), None).expect("request");

        assert_eq!(request.parts.len(), 3);
        assert_eq!(request.parts[1], RequestPart::Image(scene));
        assert_eq!(request.parts[2], RequestPart::Image(png()));
        let prompt = request.prompt().expect("prompt");
        assert!(prompt.contains("insert the ball"));
        assert!(prompt.contains("in hands, on ground, or in active play context"));
        assert_eq!(request.modality, ResponseModality::Image);
    }

    #[test]
    fn object_request_without_object_bytes_is_rejected() {
        let job = first_job(vec![InsertableItem::Object {
            path: PathBuf::from("ball.png"),
            object_type: None,
        }]);
        assert!(build_request(&job, &png(), None, None).is_err());
    }

    #[test]
    fn rebuilding_a_request_is_byte_identical() {
        let job = first_job(vec![InsertableItem::Text {
            text: "Team Alpha".to_string(),
            target_area: TargetArea::Sign,
            style: Some(TextStyle::Sporty),
        }]);
        let first = build_request(&job, &png(), None, None).expect("request");
        let second = build_request(&job, &png(), None, None).expect("request");
        assert_eq!(first, second);
        let prompt = first.prompt().expect("prompt");
        assert!(prompt.contains("Insert the text \"Team Alpha\""));
        assert!(prompt.contains("bold, athletic-style lettering"));
        assert!(prompt.contains("on visible sign surfaces"));
    }

    #[test]
    fn custom_area_and_unknown_object_fall_back() {
        let prompt = text_insertion_prompt("Hi", &TargetArea::Custom("mug".into()), None, None);
        assert!(prompt.contains("on the mug surface"));
        assert!(prompt.contains("natural, contextually appropriate styling"));

        let prompt = object_insertion_prompt("kite", Enhancement::Basic, None);
        assert!(prompt.contains("in the most semantically appropriate location"));
        assert!(prompt.contains("natural placement and basic lighting matching"));
    }

    #[test]
    fn analysis_context_is_appended() {
        let analysis = SceneAnalysis {
            description: "a park".to_string(),
            zones: vec![PlacementZone {
                label: "lawn".to_string(),
                region: "lower half".to_string(),
                suitable_for: vec!["ball".to_string()],
            }],
            object_opportunities: Vec::new(),
            text_opportunities: Vec::new(),
            lighting_notes: "late afternoon sun from the left".to_string(),
            challenges: Vec::new(),
            confidence: 0.8,
        };
        let prompt = scene_variation_prompt(Enhancement::Realistic, Some(&analysis));
        assert!(prompt.contains("Zone 'lawn' at lower half: suitable for ball"));
        assert!(prompt.contains("late afternoon sun"));
    }
}
