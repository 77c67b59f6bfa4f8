//! Command implementations behind the CLI: input discovery and one function per subcommand.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::analyzer::{SceneAnalysis, SceneAnalyzer};
use crate::api::GeminiClient;
use crate::api::gemini::parse_image_response;
use crate::cli::{
    AnalyzeSceneArgs, BatchArgs, CliOptions, Commands, InsertObjectArgs, InsertTextArgs,
};
use crate::config::GenerationOptions;
use crate::constants::{FALLBACK_OBJECT_TYPE, IMAGE_EXTENSIONS};
use crate::error::{ErrorKind, GenerationError};
use crate::limiter::RateLimiter;
use crate::orchestrator::BatchOrchestrator;
use crate::output::{OutputWriter, save_image};
use crate::prompt::{LoadedImage, build_request};
use crate::report::BatchReport;
use crate::retry::RetryingClient;
use crate::scheduler::{InsertableItem, Scene, Scheduler};

/// Exit status for a batch where some jobs failed or were cancelled.
const EXIT_JOBS_FAILED: u8 = 1;
/// Exit status for invalid configuration or inputs.
const EXIT_CONFIG: u8 = 2;

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Image files directly inside `dir`, sorted by file name.
pub async fn list_images(dir: &Path) -> Result<Vec<PathBuf>, GenerationError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|err| {
        GenerationError::Config(format!("cannot read directory {}: {err}", dir.display()))
    })?;
    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && has_image_extension(&path) {
            images.push(path);
        }
    }
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(images)
}

/// Non-blank, trimmed lines of a texts file.
pub async fn read_texts(path: &Path) -> Result<Vec<String>, GenerationError> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|err| {
        GenerationError::Config(format!("cannot read texts file {}: {err}", path.display()))
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Object type taken from the file name, eg `ball.png` -> `ball`.
pub fn object_type_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.trim().to_lowercase())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| FALLBACK_OBJECT_TYPE.to_string())
}

/// Builds the scenes and items of a batch from its arguments. Objects come
/// before texts; with `detector` set each object type is asked for once.
pub async fn discover_batch(
    args: &BatchArgs,
    detector: Option<&SceneAnalyzer>,
) -> Result<(Vec<Scene>, Vec<InsertableItem>), GenerationError> {
    let scenes = list_images(&args.input_dir)
        .await?
        .into_iter()
        .map(Scene::from_path)
        .collect::<Result<Vec<_>, _>>()?;

    let mut items = Vec::new();
    if let Some(objects_dir) = &args.objects_dir {
        for path in list_images(objects_dir).await? {
            let object_type = match detector {
                Some(detector) => detector.detect_object_type(&path).await,
                None => object_type_from_path(&path),
            };
            items.push(InsertableItem::Object {
                path,
                object_type: Some(object_type),
            });
        }
    }
    if let Some(texts_file) = &args.texts_file {
        for text in read_texts(texts_file).await? {
            items.push(InsertableItem::Text {
                text,
                target_area: args.target_area.clone(),
                style: args.style,
            });
        }
    }
    info!(
        "Found {} scene(s) and {} item(s) to insert",
        scenes.len(),
        items.len()
    );
    Ok((scenes, items))
}

/// Wires the HTTP client, rate limiter and retry policy from the global options.
pub fn build_client(cli: &CliOptions) -> Result<Arc<RetryingClient>, GenerationError> {
    let rate_limit = cli.rate_limit_config();
    rate_limit.validate()?;
    let api = GeminiClient::new(cli.gemini_settings())?;
    let limiter = Arc::new(RateLimiter::new(&rate_limit));
    Ok(Arc::new(RetryingClient::new(
        Arc::new(api),
        limiter,
        cli.retry_config(),
    )?))
}

async fn optional_analysis(
    client: &Arc<RetryingClient>,
    scene: &LoadedImage,
    enabled: bool,
) -> Option<SceneAnalysis> {
    if !enabled {
        return None;
    }
    match SceneAnalyzer::new(Arc::clone(client))
        .analyze_image(scene)
        .await
    {
        Ok(analysis) => Some(analysis),
        Err(err) => {
            warn!("Scene analysis failed, continuing without it: {}", err);
            None
        }
    }
}

/// Runs one job with `num_variations = 1` and writes the result to `output`.
async fn generate_single(
    client: &Arc<RetryingClient>,
    scene: Scene,
    item: InsertableItem,
    options: GenerationOptions,
    analyze: bool,
    output: &Path,
) -> Result<()> {
    let scheduler = Scheduler::new(vec![scene], vec![item], 1, options)?;
    let job = scheduler
        .jobs()
        .next()
        .ok_or_else(|| anyhow!("no job was scheduled"))?;

    let scene_image = LoadedImage::load(job.scene.path()).await?;
    let object = match job.item.as_deref() {
        Some(InsertableItem::Object { path, .. }) => Some(LoadedImage::load(path).await?),
        _ => None,
    };
    let analysis = optional_analysis(client, &scene_image, analyze).await;
    let request = build_request(&job, &scene_image, object.as_ref(), analysis.as_ref())?;

    let success = client
        .call(&request, parse_image_response)
        .await
        .map_err(|failure| failure.error)
        .with_context(|| format!("Generation failed for {}", job.scene.path().display()))?;
    if let Some(commentary) = &success.value.commentary {
        info!("Model commentary: {}", commentary);
    }
    save_image(output, &success.value, true)
        .await
        .with_context(|| format!("Failed to save {}", output.display()))?;
    info!(
        "Generated {} in {:?} ({} attempt(s))",
        output.display(),
        success.latency,
        success.attempts
    );
    Ok(())
}

/// `insert-object`
pub async fn insert_object(client: Arc<RetryingClient>, args: &InsertObjectArgs) -> Result<()> {
    let scene = Scene::from_path(&args.scene)?;
    let object_type = match &args.object_type {
        Some(object_type) => object_type.clone(),
        None => {
            SceneAnalyzer::new(Arc::clone(&client))
                .detect_object_type(&args.object)
                .await
        }
    };
    info!("Inserting {} into {}", object_type, args.scene.display());
    let item = InsertableItem::Object {
        path: args.object.clone(),
        object_type: Some(object_type),
    };
    let options = GenerationOptions {
        enhancement: args.enhancement,
    };
    generate_single(&client, scene, item, options, args.analyze_scene, &args.output).await
}

/// `insert-text`
pub async fn insert_text(client: Arc<RetryingClient>, args: &InsertTextArgs) -> Result<()> {
    let scene = Scene::from_path(&args.scene)?;
    let item = InsertableItem::Text {
        text: args.text.clone(),
        target_area: args.target_area.clone(),
        style: args.style,
    };
    generate_single(
        &client,
        scene,
        item,
        GenerationOptions::default(),
        args.analyze_scene,
        &args.output,
    )
    .await
}

/// `analyze-scene`, returning what should be printed.
pub async fn analyze_scene(client: Arc<RetryingClient>, args: &AnalyzeSceneArgs) -> Result<String> {
    let analysis = SceneAnalyzer::new(client)
        .analyze(&args.image)
        .await
        .with_context(|| format!("Failed to analyse {}", args.image.display()))?;
    if args.json {
        return serde_json::to_string_pretty(&analysis).context("Failed to serialize analysis");
    }
    Ok(format!(
        "SCENE ANALYSIS RESULTS\n{}\n{}",
        "=".repeat(50),
        analysis.render()
    ))
}

/// `batch-process`: discovers inputs, runs every job and writes the report.
pub async fn batch_process(
    client: Arc<RetryingClient>,
    args: &BatchArgs,
    cancel: CancellationToken,
) -> Result<BatchReport> {
    let options = GenerationOptions {
        enhancement: args.enhancement,
    };
    let detector = args
        .detect_object_types
        .then(|| SceneAnalyzer::new(Arc::clone(&client)));
    let (scenes, items) = discover_batch(args, detector.as_ref()).await?;
    let scheduler = Scheduler::new(scenes, items, args.num_variations, options)?;

    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .map_err(GenerationError::from)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    let writer = OutputWriter::new(&args.output_dir, !args.no_overwrite);
    let orchestrator = BatchOrchestrator::new(client, writer.clone(), args.batch_config())?;

    let mut progress = orchestrator.subscribe();
    let progress_logger = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = *progress.borrow_and_update();
            if current.completed > 0 {
                info!("Progress: {}/{}", current.completed, current.total);
            }
        }
    });

    let report = orchestrator.run(&scheduler, cancel).await;
    progress_logger.abort();

    // Jobs have already run, so a report file failure is logged, not returned.
    if !args.no_report {
        match writer.write_report(&report).await {
            Ok(path) => info!("Batch report written to {}", path.display()),
            Err(err) => error!("Failed to write batch report: {}", err),
        }
    }
    Ok(report)
}

/// Exit status for an error returned by a command.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<GenerationError>() {
        Some(err) if err.kind() == ErrorKind::Config => ExitCode::from(EXIT_CONFIG),
        _ => ExitCode::FAILURE,
    }
}

/// Dispatches the parsed command line.
pub async fn run(cli: CliOptions, cancel: CancellationToken) -> Result<ExitCode> {
    let client = build_client(&cli)?;
    match &cli.command {
        Commands::InsertObject(args) => {
            insert_object(client, args).await?;
            println!("Generated image saved to: {}", args.output.display());
        }
        Commands::InsertText(args) => {
            insert_text(client, args).await?;
            println!("Generated image saved to: {}", args.output.display());
        }
        Commands::AnalyzeScene(args) => {
            println!("{}", analyze_scene(client, args).await?);
        }
        Commands::BatchProcess(args) => {
            let report = batch_process(client, args, cancel).await?;
            let summary = report.summary();
            println!("Batch processing completed: {summary}");
            println!("Results saved to: {}", args.output_dir.display());
            if summary.failed + summary.cancelled > 0 {
                return Ok(ExitCode::from(EXIT_JOBS_FAILED));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
