//! Stage executors: `(job context, prior items) -> (new items, per-item errors)`.
//!
//! Every input item either comes out the other side or is named in
//! `errors`. A `StageError` means the stage as a whole could not run and the
//! orchestrator decides whether to try again.

pub mod enrich;
pub mod extract;
pub mod fitment;
pub mod normalize;
pub mod publish;

use crate::{
    cancel::CancelToken,
    llm::LanguageModel,
    models::{ProductRecord, Stage},
    sink::PublishSink,
    tenants::TenantProfile,
};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use uuid::Uuid;

pub use enrich::EnrichExecutor;
pub use extract::{ExtractExecutor, SourceRef};
pub use fitment::FitmentExecutor;
pub use normalize::NormalizeExecutor;
pub use publish::PublishExecutor;

#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: Uuid,
    pub tenant: Arc<TenantProfile>,
    pub source_ref: String,
    pub stage: Stage,
    pub attempt: u32,
    pub cancel: CancelToken,
}

impl StageContext {
    /// Item-boundary cancellation check.
    pub fn checkpoint(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            let reason = self
                .cancel
                .reason()
                .unwrap_or_else(|| "cancelled".to_string());
            return Err(StageError::cancelled(self.stage, reason));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub index: usize,
    pub sku: Option<String>,
    pub reason: String,
}

impl ItemError {
    pub fn new(index: usize, item: &ProductRecord, reason: impl Into<String>) -> Self {
        Self {
            index,
            sku: item.sku_label(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageBatch {
    pub items: Vec<ProductRecord>,
    pub errors: Vec<ItemError>,
    /// Free-form summary recorded in the job's stage reports.
    pub report: Value,
}

impl StageBatch {
    pub fn new(items: Vec<ProductRecord>, errors: Vec<ItemError>, report: Value) -> Self {
        Self {
            items,
            errors,
            report,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    Fatal,
    Timeout,
    Cancelled,
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct StageError {
    stage: Stage,
    message: String,
    kind: StageErrorKind,
}

impl StageError {
    pub fn fatal(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: StageErrorKind::Fatal,
        }
    }

    pub fn timeout(stage: Stage, after: Duration) -> Self {
        Self {
            stage,
            message: format!("timed out after {}s", after.as_secs_f64()),
            kind: StageErrorKind::Timeout,
        }
    }

    pub fn cancelled(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            message: reason.into(),
            kind: StageErrorKind::Cancelled,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn kind(&self) -> StageErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Must be idempotent for the same context and input.
    async fn execute(
        &self,
        ctx: &StageContext,
        items: &[ProductRecord],
    ) -> Result<StageBatch, StageError>;
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<Stage, Arc<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five built-in executors. Campaign stays unregistered and is skipped.
    pub fn standard(llm: Arc<dyn LanguageModel>, sink: Arc<dyn PublishSink>) -> Self {
        Self::new()
            .register(Arc::new(ExtractExecutor::from_env(llm.clone())))
            .register(Arc::new(NormalizeExecutor))
            .register(Arc::new(EnrichExecutor::new(llm)))
            .register(Arc::new(FitmentExecutor))
            .register(Arc::new(PublishExecutor::new(sink)))
    }

    pub fn register(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(executor.stage(), executor);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }
}
