use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use sceneforge::api::{ApiError, GenerationApi};
use sceneforge::cli::{AnalyzeSceneArgs, BatchArgs, InsertTextArgs};
use sceneforge::commands::{analyze_scene, batch_process, insert_text};
use sceneforge::config::{Enhancement, RateLimitConfig, RetryConfig, TargetArea};
use sceneforge::constants::BATCH_REPORT_FILENAME;
use sceneforge::limiter::RateLimiter;
use sceneforge::prompt::{GenerationRequest, ResponseModality};
use sceneforge::retry::RetryingClient;

fn png() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([0, 128, 255, 255])))
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode");
    out.into_inner()
}

fn write_image(path: &Path, format: ImageFormat) {
    let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([10, 10, 10, 255])));
    let image = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(image.to_rgb8())
    } else {
        image
    };
    image.save_with_format(path, format).expect("write image");
}

/// Answers like the real service. The first `transient_failures` image
/// requests get a 503.
struct FakeService {
    transient_failures: usize,
    image_requests: AtomicUsize,
}

impl FakeService {
    fn new(transient_failures: usize) -> Arc<Self> {
        Arc::new(Self {
            transient_failures,
            image_requests: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl GenerationApi for FakeService {
    async fn invoke(&self, request: &GenerationRequest) -> Result<Vec<u8>, ApiError> {
        let body = match request.modality {
            ResponseModality::Image => {
                let seen = self.image_requests.fetch_add(1, Ordering::SeqCst);
                if seen < self.transient_failures {
                    return Err(ApiError::Status {
                        status: 503,
                        body: "overloaded".to_string(),
                    });
                }
                json!({"candidates": [{"content": {"parts": [
                    {"text": "Here is the edited image."},
                    {"inlineData": {
                        "mimeType": "image/png",
                        "data": general_purpose::STANDARD.encode(png())
                    }}
                ]}}]})
            }
            ResponseModality::Json => {
                let analysis = json!({
                    "description": "a quiet street",
                    "zones": [
                        {"label": "pavement", "region": "bottom third", "suitable_for": ["ball"]}
                    ],
                    "object_opportunities": ["a ball on the pavement"],
                    "text_opportunities": ["shop sign"],
                    "lighting_notes": "overcast",
                    "challenges": [],
                    "confidence": 0.75
                });
                json!({"candidates": [{"content": {"parts": [{"text": analysis.to_string()}]}}]})
            }
            ResponseModality::Text => {
                json!({"candidates": [{"content": {"parts": [{"text": "Ball"}]}}]})
            }
        };
        serde_json::to_vec(&body).map_err(|err| ApiError::Network(err.to_string()))
    }
}

fn client(api: Arc<FakeService>) -> Arc<RetryingClient> {
    let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
        capacity: 100,
        window: Duration::from_secs(60),
    }));
    Arc::new(
        RetryingClient::new(
            api,
            limiter,
            RetryConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryConfig::default()
            },
        )
        .expect("client"),
    )
}

fn batch_args(root: &Path) -> BatchArgs {
    BatchArgs {
        input_dir: root.join("scenes"),
        output_dir: root.join("out"),
        objects_dir: Some(root.join("objects")),
        texts_file: None,
        num_variations: 2,
        concurrency: 2,
        enhancement: Enhancement::Realistic,
        target_area: TargetArea::Shirt,
        style: None,
        detect_object_types: false,
        analyze_scenes: false,
        no_overwrite: false,
        no_report: false,
    }
}

fn setup(root: &Path) {
    std::fs::create_dir_all(root.join("scenes")).expect("scenes");
    std::fs::create_dir_all(root.join("objects")).expect("objects");
    write_image(&root.join("scenes").join("a.jpg"), ImageFormat::Jpeg);
    write_image(&root.join("objects").join("ball.png"), ImageFormat::Png);
}

#[tokio::test]
async fn batch_writes_named_outputs_and_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    setup(dir.path());
    let api = FakeService::new(0);

    let report = batch_process(
        client(Arc::clone(&api)),
        &batch_args(dir.path()),
        CancellationToken::new(),
    )
    .await
    .expect("batch");

    let summary = report.summary();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 2);
    for name in ["a_obj_0.jpg", "a_obj_1.jpg"] {
        let bytes = std::fs::read(dir.path().join("out").join(name)).expect("output");
        assert_eq!(image::guess_format(&bytes).expect("format"), ImageFormat::Jpeg);
    }

    let report_json: Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("out").join(BATCH_REPORT_FILENAME)).expect("report"),
    )
    .expect("json");
    assert_eq!(report_json["summary"]["succeeded"], 2);
    assert_eq!(report_json["jobs"].as_array().map(Vec::len), Some(2));
    assert_eq!(report_json["jobs"][0]["operation"], "object");
}

#[tokio::test]
async fn unwritable_report_still_returns_the_counts() {
    let dir = tempfile::tempdir().expect("tempdir");
    setup(dir.path());
    std::fs::create_dir_all(dir.path().join("out").join(BATCH_REPORT_FILENAME))
        .expect("block the report path");

    let report = batch_process(
        client(FakeService::new(0)),
        &batch_args(dir.path()),
        CancellationToken::new(),
    )
    .await
    .expect("batch result despite the report failure");

    let summary = report.summary();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 2);
    assert!(dir.path().join("out").join("a_obj_1.jpg").exists());
}

#[tokio::test]
async fn transient_errors_are_absorbed_by_retries() {
    let dir = tempfile::tempdir().expect("tempdir");
    setup(dir.path());
    let api = FakeService::new(2);
    let mut args = batch_args(dir.path());
    args.num_variations = 1;
    args.concurrency = 1;
    args.no_report = true;

    let report = batch_process(client(Arc::clone(&api)), &args, CancellationToken::new())
        .await
        .expect("batch");

    let result = report.results().next().expect("one result");
    assert!(result.is_success());
    assert_eq!(result.attempts, 3);
    assert_eq!(report.summary().retried, 1);
    assert!(!dir.path().join("out").join(BATCH_REPORT_FILENAME).exists());
}

#[tokio::test]
async fn batch_cancelled_before_start_dispatches_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    setup(dir.path());
    let api = FakeService::new(0);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = batch_process(client(Arc::clone(&api)), &batch_args(dir.path()), cancel)
        .await
        .expect("batch");

    assert_eq!(report.summary().cancelled, 2);
    assert_eq!(api.image_requests.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("out").join("a_obj_0.jpg").exists());
}

#[tokio::test]
async fn insert_text_writes_requested_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    setup(dir.path());
    let output = dir.path().join("result.png");
    let args = InsertTextArgs {
        scene: dir.path().join("scenes").join("a.jpg"),
        text: "Team Alpha".to_string(),
        output: output.clone(),
        target_area: TargetArea::Shirt,
        style: None,
        analyze_scene: true,
    };

    insert_text(client(FakeService::new(0)), &args)
        .await
        .expect("insert text");
    let bytes = std::fs::read(&output).expect("output");
    assert_eq!(image::guess_format(&bytes).expect("format"), ImageFormat::Png);
}

#[tokio::test]
async fn analyze_scene_renders_text_or_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    setup(dir.path());
    let image = dir.path().join("scenes").join("a.jpg");

    let rendered = analyze_scene(
        client(FakeService::new(0)),
        &AnalyzeSceneArgs {
            image: image.clone(),
            json: false,
        },
    )
    .await
    .expect("analysis");
    assert!(rendered.starts_with("SCENE ANALYSIS RESULTS"));
    assert!(rendered.contains("pavement (bottom third): ball"));

    let raw = analyze_scene(
        client(FakeService::new(0)),
        &AnalyzeSceneArgs { image, json: true },
    )
    .await
    .expect("analysis");
    let parsed: Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(parsed["confidence"], 0.75);
}
