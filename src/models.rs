use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

/// Pipeline position of a job. Stages run strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Extract,
    Normalize,
    Enrich,
    Fitment,
    Publish,
    Campaign,
    Done,
}

impl Stage {
    /// Every executable stage, in pipeline order.
    pub const PIPELINE: [Stage; 6] = [
        Stage::Extract,
        Stage::Normalize,
        Stage::Enrich,
        Stage::Fitment,
        Stage::Publish,
        Stage::Campaign,
    ];

    pub fn next(self) -> Stage {
        match self {
            Stage::Extract => Stage::Normalize,
            Stage::Normalize => Stage::Enrich,
            Stage::Enrich => Stage::Fitment,
            Stage::Fitment => Stage::Publish,
            Stage::Publish => Stage::Campaign,
            Stage::Campaign | Stage::Done => Stage::Done,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Normalize => "normalize",
            Stage::Enrich => "enrich",
            Stage::Fitment => "fitment",
            Stage::Publish => "publish",
            Stage::Campaign => "campaign",
            Stage::Done => "done",
        }
    }

    /// Stages that talk to rate-limited third parties and back off between attempts.
    pub fn calls_external_service(self) -> bool {
        matches!(self, Stage::Extract | Stage::Enrich | Stage::Publish)
    }

    /// Stages whose invocations are metered by the admission controller.
    pub fn is_metered(self) -> bool {
        matches!(self, Stage::Extract | Stage::Enrich)
    }

    /// A missing executor for an optional stage skips it instead of failing the job.
    pub fn is_optional(self) -> bool {
        matches!(self, Stage::Campaign)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of pipeline work for one tenant and one source artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub tenant: String,
    pub source_ref: String,
    pub stage: Stage,
    pub status: JobStatus,
    #[serde(default)]
    pub items: Vec<ProductRecord>,
    #[serde(default)]
    pub errors: Vec<JobError>,
    #[serde(default)]
    pub attempts: BTreeMap<Stage, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    #[serde(default)]
    pub awaiting_confirmation: bool,
    #[serde(default)]
    pub publish_confirmed: bool,
    #[serde(default)]
    pub reports: Vec<StageReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(tenant: impl Into<String>, source_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            tenant: tenant.into(),
            source_ref: source_ref.into(),
            stage: Stage::Extract,
            status: JobStatus::Pending,
            items: Vec::new(),
            errors: Vec::new(),
            attempts: BTreeMap::new(),
            failure: None,
            awaiting_confirmation: false,
            publish_confirmed: false,
            reports: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempt(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    pub fn bump_attempt(&mut self, stage: Stage) -> u32 {
        let counter = self.attempts.entry(stage).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// True when some item was dropped along the way.
    pub fn has_partial_drops(&self) -> bool {
        self.errors.iter().any(|entry| {
            matches!(
                entry.kind,
                ErrorKind::PerItem | ErrorKind::ValidationRejected
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PerItem,
    StageFatal,
    Timeout,
    ValidationRejected,
    ValidationCoerced,
    Cancelled,
}

/// Entry in the append-only job error log.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub attempt: u32,
    pub item_index: Option<usize>,
    pub sku: Option<String>,
    pub rule: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn new(stage: Stage, kind: ErrorKind, attempt: u32, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            attempt,
            item_index: None,
            sku: None,
            rule: None,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn for_item(mut self, index: usize, sku: Option<String>) -> Self {
        self.item_index = Some(index);
        self.sku = sku;
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RetriesExhausted,
    Timeout,
    Cancelled,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage: Stage,
    pub reason: FailureReason,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub attempt: u32,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(stage: Stage, attempt: u32, elapsed_ms: u128, output: Value) -> Self {
        Self {
            stage,
            attempt,
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

/// Price as produced upstream: a number, or raw text such as `"R$ 1.234,56"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceField {
    Amount(f64),
    Text(String),
}

/// The evolving record that stages enrich on its way to the storefront.
///
/// `validated` is only ever set by the validation gate; every other stage
/// output has it cleared by the orchestrator.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub sku: Option<String>,
    pub title: Option<String>,
    pub price: Option<PriceField>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compatibility: Vec<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub validated: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProductRecord {
    pub fn sku_label(&self) -> Option<String> {
        self.sku
            .as_deref()
            .map(str::trim)
            .filter(|sku| !sku.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub tenant: Option<String>,
    pub source_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub stage: Stage,
}

impl From<&Job> for JobAccepted {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            stage: job.stage,
        }
    }
}
