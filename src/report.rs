//! Per-job outcomes and the batch level aggregate.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::error::{ErrorKind, GenerationError};
use crate::scheduler::{Operation, VariationKey, VariationSpec};

/// How a job ended.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    /// Image written.
    Succeeded {
        /// Where it was written.
        output: PathBuf,
    },
    /// Terminal failure, including cancellation.
    Failed {
        /// What went wrong.
        error: GenerationError,
    },
}

/// Outcome of exactly one job.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationResult {
    /// Job identity.
    pub key: VariationKey,
    /// Scene the job edited.
    pub scene: PathBuf,
    /// Operation performed.
    pub operation: Operation,
    /// Remote invocations made.
    pub attempts: u32,
    /// Time spent on the job.
    pub latency: Duration,
    /// Success or failure.
    pub outcome: JobOutcome,
}

impl GenerationResult {
    /// A successful job.
    pub fn succeeded(
        spec: &VariationSpec,
        output: PathBuf,
        attempts: u32,
        latency: Duration,
    ) -> Self {
        Self::new(spec, attempts, latency, JobOutcome::Succeeded { output })
    }

    /// A terminally failed job.
    pub fn failed(
        spec: &VariationSpec,
        error: GenerationError,
        attempts: u32,
        latency: Duration,
    ) -> Self {
        Self::new(spec, attempts, latency, JobOutcome::Failed { error })
    }

    /// A job that was never dispatched.
    pub fn cancelled(spec: &VariationSpec) -> Self {
        Self::failed(spec, GenerationError::Cancelled, 0, Duration::ZERO)
    }

    fn new(spec: &VariationSpec, attempts: u32, latency: Duration, outcome: JobOutcome) -> Self {
        Self {
            key: spec.key,
            scene: spec.scene.path().to_path_buf(),
            operation: spec.operation(),
            attempts,
            latency,
            outcome,
        }
    }

    /// True for a written image.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded { .. })
    }

    /// Failure classification, if the job failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            JobOutcome::Succeeded { .. } => None,
            JobOutcome::Failed { error } => Some(error.kind()),
        }
    }

    fn entry(&self) -> JobEntry<'_> {
        let (status, output, error) = match &self.outcome {
            JobOutcome::Succeeded { output } => ("succeeded", Some(output), None),
            JobOutcome::Failed { error } if error.kind() == ErrorKind::Cancelled => {
                ("cancelled", None, Some(error))
            }
            JobOutcome::Failed { error } => ("failed", None, Some(error)),
        };
        JobEntry {
            key: self.key,
            scene: self.scene.display().to_string(),
            operation: self.operation,
            status,
            output: output.map(|path| path.display().to_string()),
            attempts: self.attempts,
            latency_ms: u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX),
            error_kind: error.map(GenerationError::kind),
            error: error.map(ToString::to_string),
        }
    }
}

/// One line of the `jobs` array in `batch_report.json`.
#[derive(Debug, Serialize)]
pub struct JobEntry<'a> {
    key: VariationKey,
    scene: String,
    operation: Operation,
    status: &'a str,
    output: Option<String>,
    attempts: u32,
    latency_ms: u64,
    error_kind: Option<ErrorKind>,
    error: Option<String>,
}

/// Batch totals.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BatchSummary {
    /// Jobs in the batch.
    pub total: usize,
    /// Jobs that wrote an image.
    pub succeeded: usize,
    /// Jobs that failed, not counting cancellations.
    pub failed: usize,
    /// Jobs never dispatched.
    pub cancelled: usize,
    /// Jobs that needed more than one attempt.
    pub retried: usize,
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} succeeded={} failed={} cancelled={} retried={}",
            self.total, self.succeeded, self.failed, self.cancelled, self.retried
        )
    }
}

/// Every job's result, keyed by job identity.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchReport {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    results: BTreeMap<VariationKey, GenerationResult>,
}

impl BatchReport {
    /// An empty report for a batch that started now.
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            results: BTreeMap::new(),
        }
    }

    /// Adds a result. A second result for the same key is dropped and logged.
    pub fn record(&mut self, result: GenerationResult) {
        let key = result.key;
        if self.results.contains_key(&key) {
            error!("Duplicate result for job {} ignored", key);
            return;
        }
        self.results.insert(key, result);
    }

    /// Stamps the finish time.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// Result for one job.
    pub fn get(&self, key: &VariationKey) -> Option<&GenerationResult> {
        self.results.get(key)
    }

    /// Results in key order.
    pub fn results(&self) -> impl Iterator<Item = &GenerationResult> {
        self.results.values()
    }

    /// Number of recorded results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Counts by outcome.
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            total: self.results.len(),
            ..BatchSummary::default()
        };
        for result in self.results.values() {
            match result.error_kind() {
                None => summary.succeeded += 1,
                Some(ErrorKind::Cancelled) => summary.cancelled += 1,
                Some(_) => summary.failed += 1,
            }
            if result.attempts > 1 {
                summary.retried += 1;
            }
        }
        summary
    }

    /// Machine readable form written as `batch_report.json`.
    pub fn file(&self) -> ReportFile<'_> {
        ReportFile {
            started_at: self.started_at.to_rfc3339(),
            finished_at: self.finished_at.to_rfc3339(),
            summary: self.summary(),
            jobs: self.results.values().map(GenerationResult::entry).collect(),
        }
    }
}

/// Serialized shape of `batch_report.json`.
#[derive(Debug, Serialize)]
pub struct ReportFile<'a> {
    started_at: String,
    finished_at: String,
    summary: BatchSummary,
    jobs: Vec<JobEntry<'a>>,
}
