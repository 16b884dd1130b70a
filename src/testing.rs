//! Test doubles shared by the unit tests: contexts, a scripted executor and a fake model.

use crate::{
    cancel::CancelToken,
    llm::{LanguageModel, LlmError, LlmMessage, LlmResponse},
    models::{ProductRecord, Stage},
    stages::{ItemError, StageBatch, StageContext, StageError, StageExecutor},
    tenants::{TenantProfile, TenantRegistry},
};
use async_trait::async_trait;
use serde_json::json;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;
use uuid::Uuid;

pub fn context_for_tenant(stage: Stage, tenant: TenantProfile) -> StageContext {
    StageContext {
        job_id: Uuid::new_v4(),
        tenant: Arc::new(tenant),
        source_ref: "inline:[]".into(),
        stage,
        attempt: 1,
        cancel: CancelToken::new(),
    }
}

pub fn context(stage: Stage) -> StageContext {
    context_for_tenant(stage, TenantProfile::new("acme"))
}

pub fn context_with_source(stage: Stage, source_ref: &str) -> StageContext {
    StageContext {
        source_ref: source_ref.to_string(),
        ..context(stage)
    }
}

/// `acme` and `globex`, plus `careful`, which wants publish confirmation.
pub fn tenant_registry() -> TenantRegistry {
    let mut careful = TenantProfile::new("careful");
    careful.require_publish_confirmation = true;
    careful.api_keys.push("careful-key".into());
    let mut acme = TenantProfile::new("acme");
    acme.api_keys.push("acme-key".into());
    let mut globex = TenantProfile::new("globex");
    globex.api_keys.push("globex-key".into());
    TenantRegistry::with_tenants([acme, globex, careful]).expect("test tenants")
}

/// Well-formed supplier rows `SKU-0..n`.
pub fn catalog(n: usize) -> Vec<ProductRecord> {
    (0..n)
        .map(|i| ProductRecord {
            sku: Some(format!("SKU-{i}")),
            title: Some(format!("Produto número {i}")),
            price: Some(crate::models::PriceField::Amount(10.0 + i as f64)),
            ..Default::default()
        })
        .collect()
}

#[derive(Clone)]
pub struct FakeModel {
    reply: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl FakeModel {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn chat(&self, _function: &str, _messages: &[LlmMessage]) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Some(text) => Ok(LlmResponse {
                text: text.clone(),
                usage: None,
            }),
            None => Err(LlmError::Http("HTTP 503 Service Unavailable".into())),
        }
    }
}

/// What a scripted invocation does. Once the script runs out every call passes.
#[derive(Debug, Clone)]
pub enum Step {
    Pass,
    Fatal(&'static str),
    Sleep(Duration),
    WaitForCancel,
}

/// Pass-through executor driven by a script, counting invocations.
pub struct ScriptedExecutor {
    stage: Stage,
    steps: Mutex<VecDeque<Step>>,
    produce: Option<Vec<ProductRecord>>,
    drop_indices: Vec<usize>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: Notify,
}

impl ScriptedExecutor {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            steps: Mutex::new(VecDeque::new()),
            produce: None,
            drop_indices: Vec::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: Notify::new(),
        }
    }

    pub fn with_steps(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.lock().expect("steps").extend(steps);
        self
    }

    /// Ignore the input and emit these records instead.
    pub fn producing(mut self, items: Vec<ProductRecord>) -> Self {
        self.produce = Some(items);
        self
    }

    pub fn dropping(mut self, indices: &[usize]) -> Self {
        self.drop_indices = indices.to_vec();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    async fn perform(&self, ctx: &StageContext, items: &[ProductRecord]) -> Result<StageBatch, StageError> {
        let step = self
            .steps
            .lock()
            .expect("steps")
            .pop_front()
            .unwrap_or(Step::Pass);
        self.started.notify_one();
        match step {
            Step::Pass => {}
            Step::Fatal(message) => return Err(StageError::fatal(self.stage, message)),
            Step::Sleep(duration) => tokio::time::sleep(duration).await,
            Step::WaitForCancel => loop {
                ctx.checkpoint()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            },
        }

        let source = self.produce.as_deref().unwrap_or(items);
        let mut out = Vec::with_capacity(source.len());
        let mut errors = Vec::new();
        for (index, item) in source.iter().enumerate() {
            ctx.checkpoint()?;
            if self.drop_indices.contains(&index) {
                errors.push(ItemError::new(index, item, "scripted drop"));
            } else {
                out.push(item.clone());
            }
        }
        Ok(StageBatch::new(out, errors, json!({ "scripted": true })))
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        items: &[ProductRecord],
    ) -> Result<StageBatch, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.perform(ctx, items).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn scripted(stage: Stage) -> Arc<ScriptedExecutor> {
    Arc::new(ScriptedExecutor::new(stage))
}
