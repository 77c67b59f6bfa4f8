//! Fans scheduled jobs out over a fixed worker pool and collects one result per job.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::analyzer::{SceneAnalysis, SceneAnalyzer};
use crate::api::gemini::parse_image_response;
use crate::config::BatchConfig;
use crate::error::GenerationError;
use crate::output::OutputWriter;
use crate::prompt::{LoadedImage, build_request};
use crate::report::{BatchReport, GenerationResult};
use crate::retry::{CallFailure, RetryingClient};
use crate::scheduler::{InsertableItem, Jobs, Scheduler, VariationSpec};

/// Jobs finished so far out of the batch total. Only ever grows during a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchProgress {
    /// Jobs with a recorded result.
    pub completed: usize,
    /// Jobs in the batch.
    pub total: usize,
}

impl BatchProgress {
    /// True once every job has a result.
    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}

type CachedAnalysis = Arc<OnceCell<Option<Arc<SceneAnalysis>>>>;

/// Per-batch, per-scene analysis results. Each scene is analysed at most once.
#[derive(Default)]
struct AnalysisCache {
    scenes: Mutex<HashMap<usize, CachedAnalysis>>,
}

impl AnalysisCache {
    async fn get_or_analyze(
        &self,
        scene: usize,
        image: &LoadedImage,
        analyzer: &SceneAnalyzer,
    ) -> Option<Arc<SceneAnalysis>> {
        let cell = {
            let mut scenes = self.scenes.lock().await;
            Arc::clone(scenes.entry(scene).or_default())
        };
        cell.get_or_init(|| async {
            match analyzer.analyze_image(image).await {
                Ok(analysis) => Some(Arc::new(analysis)),
                Err(err) => {
                    warn!("Scene analysis failed, continuing without it: {}", err);
                    None
                }
            }
        })
        .await
        .clone()
    }
}

/// State shared by the workers of one run.
struct Worker {
    client: Arc<RetryingClient>,
    analyzer: SceneAnalyzer,
    writer: Arc<OutputWriter>,
    analyze_scenes: bool,
    cache: AnalysisCache,
    queue: Mutex<Jobs>,
    report: Mutex<BatchReport>,
    progress: Arc<watch::Sender<BatchProgress>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self: Arc<Self>) {
        loop {
            let job = {
                let mut queue = self.queue.lock().await;
                if self.cancel.is_cancelled() {
                    return;
                }
                queue.next()
            };
            let Some(job) = job else {
                return;
            };
            debug!("Dispatching job {}", job.key);
            let started = Instant::now();
            // A panicking job still gets exactly one result.
            let task = tokio::spawn({
                let worker = Arc::clone(&self);
                let job = job.clone();
                async move { worker.process(&job).await }
            });
            let result = match task.await {
                Ok(result) => result,
                Err(err) => {
                    error!("Job {} stopped unexpectedly: {}", job.key, err);
                    GenerationResult::failed(
                        &job,
                        GenerationError::Permanent(format!("job task failed: {err}")),
                        0,
                        started.elapsed(),
                    )
                }
            };
            self.complete(result).await;
        }
    }

    async fn complete(&self, result: GenerationResult) {
        self.report.lock().await.record(result);
        self.progress.send_modify(|progress| progress.completed += 1);
    }

    async fn process(&self, job: &VariationSpec) -> GenerationResult {
        let started = Instant::now();
        match self.generate(job).await {
            Ok((output, attempts)) => {
                info!("Job {} wrote {}", job.key, output.display());
                GenerationResult::succeeded(job, output, attempts, started.elapsed())
            }
            Err(failure) => {
                error!(
                    "Failed to process {} variation {}: {}",
                    job.scene.path().display(),
                    job.key.variation,
                    failure.error
                );
                GenerationResult::failed(
                    job,
                    failure.error,
                    failure.attempts,
                    started.elapsed(),
                )
            }
        }
    }

    async fn generate(
        &self,
        job: &VariationSpec,
    ) -> Result<(std::path::PathBuf, u32), CallFailure> {
        let local = |error: GenerationError| CallFailure {
            error,
            attempts: 0,
            latency: std::time::Duration::ZERO,
        };

        let scene = LoadedImage::load(job.scene.path()).await.map_err(local)?;
        let object = match job.item.as_deref() {
            Some(InsertableItem::Object { path, .. }) => {
                Some(LoadedImage::load(path).await.map_err(local)?)
            }
            _ => None,
        };
        let analysis = if self.analyze_scenes {
            self.cache
                .get_or_analyze(job.key.scene, &scene, &self.analyzer)
                .await
        } else {
            None
        };

        let request =
            build_request(job, &scene, object.as_ref(), analysis.as_deref()).map_err(local)?;
        let success = self.client.call(&request, parse_image_response).await?;
        let output = self
            .writer
            .write(job, &success.value)
            .await
            .map_err(|error| CallFailure {
                error,
                attempts: success.attempts,
                latency: success.latency,
            })?;
        Ok((output, success.attempts))
    }
}

/// Runs batches against one retrying client and output directory.
#[derive(Debug)]
pub struct BatchOrchestrator {
    client: Arc<RetryingClient>,
    writer: Arc<OutputWriter>,
    config: BatchConfig,
    progress: Arc<watch::Sender<BatchProgress>>,
}

impl BatchOrchestrator {
    /// Validates the batch config.
    pub fn new(
        client: Arc<RetryingClient>,
        writer: OutputWriter,
        config: BatchConfig,
    ) -> Result<Self, GenerationError> {
        config.validate()?;
        let (progress, _) = watch::channel(BatchProgress::default());
        Ok(Self {
            client,
            writer: Arc::new(writer),
            config,
            progress: Arc::new(progress),
        })
    }

    /// Progress of the current (or last) run.
    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.progress.subscribe()
    }

    /// Runs every job of `scheduler` and returns one result per job.
    ///
    /// Once `cancel` fires no further job is dispatched; jobs already running
    /// finish normally and the rest are reported as cancelled.
    #[instrument(skip_all, fields(jobs = scheduler.len(), concurrency = self.config.concurrency))]
    pub async fn run(&self, scheduler: &Scheduler, cancel: CancellationToken) -> BatchReport {
        let total = scheduler.len();
        self.progress.send_replace(BatchProgress {
            completed: 0,
            total,
        });
        info!(
            "Processing {} job(s) over {} scene(s) with {} worker(s)",
            total,
            scheduler.scenes().len(),
            self.config.concurrency
        );

        let worker = Arc::new(Worker {
            client: Arc::clone(&self.client),
            analyzer: SceneAnalyzer::new(Arc::clone(&self.client)),
            writer: Arc::clone(&self.writer),
            analyze_scenes: self.config.analyze_scenes,
            cache: AnalysisCache::default(),
            queue: Mutex::new(scheduler.jobs()),
            report: Mutex::new(BatchReport::start()),
            progress: Arc::clone(&self.progress),
            cancel,
        });

        let mut workers = JoinSet::new();
        for _ in 0..self.config.concurrency.min(total) {
            workers.spawn(Arc::clone(&worker).run());
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!("Batch worker stopped unexpectedly: {}", err);
            }
        }

        let undispatched: Vec<VariationSpec> = worker.queue.lock().await.by_ref().collect();
        if !undispatched.is_empty() {
            warn!(
                "Batch cancelled, {} job(s) not dispatched",
                undispatched.len()
            );
        }
        for job in &undispatched {
            worker.complete(GenerationResult::cancelled(job)).await;
        }

        let mut report = worker.report.lock().await.clone();
        if report.len() != total {
            error!("Batch recorded {} result(s) for {} job(s)", report.len(), total);
        }
        report.finish();
        info!("Batch processing completed: {}", report.summary());
        report
    }
}
