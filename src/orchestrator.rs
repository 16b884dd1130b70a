//! Job lifecycle: creation, stage sequencing, retry, cancellation.
//!
//! Only the orchestrator mutates a job. Every stage result is persisted
//! before the next stage starts, so a retry resumes at the recorded stage
//! and never repeats work that already succeeded.

use crate::{
    admission::{Admission, AdmissionConfig, AdmissionController, CallerClass},
    cancel::CancelToken,
    clock::{Clock, SystemClock},
    config::PipelineConfig,
    gate::gate_batch,
    models::{ErrorKind, FailureReason, Job, JobError, JobFailure, JobStatus, Stage, StageReport},
    stages::{ExecutorRegistry, SourceRef, StageBatch, StageContext, StageErrorKind, StageExecutor},
    store::{JobStore, StoreError},
    tenants::{TenantProfile, TenantRegistry},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Instant,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {job_id} is {status}; only FAILED jobs can be retried")]
    NotRetryable { job_id: Uuid, status: JobStatus },
    #[error("job {job_id} is {status} and cannot be cancelled")]
    NotCancellable { job_id: Uuid, status: JobStatus },
    #[error("job {0} is not waiting for publish confirmation")]
    NotAwaitingConfirmation(Uuid),
    #[error("job {job_id} is {status} and cannot be run")]
    NotRunnable { job_id: Uuid, status: JobStatus },
    #[error("job {0} is already running")]
    AlreadyRunning(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum StageRun {
    Completed {
        batch: StageBatch,
        attempt: u32,
        elapsed_ms: u128,
    },
    Failed(JobFailure),
}

/// Removes the job's cancel token when its run ends, however it ends.
struct RunGuard {
    running: Arc<StdMutex<HashMap<Uuid, CancelToken>>>,
    job_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        running.remove(&self.job_id);
    }
}

#[derive(Clone)]
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    executors: Arc<ExecutorRegistry>,
    tenants: TenantRegistry,
    admission: Arc<AdmissionController>,
    clock: Arc<dyn Clock>,
    config: Arc<PipelineConfig>,
    publish_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    running: Arc<StdMutex<HashMap<Uuid, CancelToken>>>,
    /// Serializes cancel, retry and confirm. Each holds a `running` claim
    /// while it rewrites the job, so `run` cannot start underneath it.
    lifecycle: Arc<Mutex<()>>,
}

impl JobOrchestrator {
    pub fn new(store: Arc<dyn JobStore>, executors: ExecutorRegistry, tenants: TenantRegistry) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store,
            executors: Arc::new(executors),
            tenants,
            admission: Arc::new(AdmissionController::new(
                AdmissionConfig::default(),
                clock.clone(),
            )),
            clock,
            config: Arc::new(PipelineConfig::default()),
            publish_locks: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(StdMutex::new(HashMap::new())),
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stage-class admission for metered stages. Share the HTTP layer's controller.
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn tenants(&self) -> &TenantRegistry {
        &self.tenants
    }

    pub async fn create(&self, tenant: &str, source_ref: &str) -> Result<Job, OrchestratorError> {
        if self.tenants.get(tenant).is_none() {
            return Err(OrchestratorError::InvalidInput(format!(
                "unknown tenant `{tenant}`"
            )));
        }
        SourceRef::parse(source_ref).map_err(OrchestratorError::InvalidInput)?;

        let job = Job::new(tenant, source_ref.trim());
        self.store.put(&job).await?;
        info!(
            target = "catalog.jobs",
            job_id = %job.job_id,
            tenant = %job.tenant,
            "job_created"
        );
        crate::metrics::job_transition(job.stage.as_str(), job.status.as_str());
        Ok(job)
    }

    /// Last committed snapshot; never waits for a running stage.
    pub async fn status(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(job_id))
    }

    pub async fn list_jobs(&self, tenant: &str) -> Result<Vec<Job>, OrchestratorError> {
        let mut jobs = self.store.list_by_tenant(tenant).await?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Puts a FAILED job back to PENDING at its recorded stage.
    pub async fn mark_for_retry(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        let _claim = self.register_run(job_id)?;
        let mut job = self.status(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(OrchestratorError::NotRetryable {
                job_id,
                status: job.status,
            });
        }
        job.status = JobStatus::Pending;
        job.failure = None;
        job.touch();
        self.store.put(&job).await?;
        info!(target = "catalog.jobs", job_id = %job_id, stage = %job.stage, "job_retry_requested");
        Ok(job)
    }

    pub async fn retry(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        self.mark_for_retry(job_id).await?;
        self.run(job_id).await
    }

    pub async fn mark_confirmed(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        let _claim = self.register_run(job_id)?;
        let mut job = self.status(job_id).await?;
        if !job.awaiting_confirmation || job.status != JobStatus::Pending {
            return Err(OrchestratorError::NotAwaitingConfirmation(job_id));
        }
        job.awaiting_confirmation = false;
        job.publish_confirmed = true;
        job.touch();
        self.store.put(&job).await?;
        info!(target = "catalog.jobs", job_id = %job_id, "publish_confirmed");
        Ok(job)
    }

    pub async fn confirm(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        self.mark_confirmed(job_id).await?;
        self.run(job_id).await
    }

    /// Running jobs stop at their next item boundary; pending jobs fail at once.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        // Only a real run can hold a claim while the lifecycle lock is ours.
        let _claim = match self.register_run(job_id) {
            Ok(claim) => claim,
            Err(OrchestratorError::AlreadyRunning(_)) => {
                let job = self.status(job_id).await?;
                if job.status.is_terminal() {
                    return Err(OrchestratorError::NotCancellable {
                        job_id,
                        status: job.status,
                    });
                }
                self.signal_running(job_id);
                info!(target = "catalog.jobs", job_id = %job_id, "cancel_signalled");
                return Ok(job);
            }
            Err(err) => return Err(err),
        };

        let mut job = self.status(job_id).await?;
        if job.status.is_terminal() {
            return Err(OrchestratorError::NotCancellable {
                job_id,
                status: job.status,
            });
        }
        let attempts = job.attempt(job.stage);
        job.errors.push(JobError::new(
            job.stage,
            ErrorKind::Cancelled,
            attempts,
            "cancelled before the job started",
        ));
        job.status = JobStatus::Failed;
        job.awaiting_confirmation = false;
        job.failure = Some(JobFailure {
            stage: job.stage,
            reason: FailureReason::Cancelled,
            message: "cancelled by request".into(),
            attempts,
        });
        job.touch();
        self.store.put(&job).await?;
        info!(target = "catalog.jobs", job_id = %job_id, stage = %job.stage, "job_cancelled");
        crate::metrics::job_transition(job.stage.as_str(), job.status.as_str());
        Ok(job)
    }

    fn signal_running(&self, job_id: Uuid) -> bool {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        match running.get(&job_id) {
            Some(token) => {
                token.cancel("cancelled by request");
                true
            }
            None => false,
        }
    }

    fn register_run(&self, job_id: Uuid) -> Result<(RunGuard, CancelToken), OrchestratorError> {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.contains_key(&job_id) {
            return Err(OrchestratorError::AlreadyRunning(job_id));
        }
        let token = CancelToken::new();
        running.insert(job_id, token.clone());
        Ok((
            RunGuard {
                running: self.running.clone(),
                job_id,
            },
            token,
        ))
    }

    /// Drives the job until it finishes, fails, or pauses for confirmation.
    pub async fn run(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let (_guard, token) = self.register_run(job_id)?;
        let mut job = self.status(job_id).await?;
        match job.status {
            JobStatus::Succeeded => return Ok(job),
            JobStatus::Failed => {
                return Err(OrchestratorError::NotRunnable {
                    job_id,
                    status: job.status,
                });
            }
            JobStatus::Pending | JobStatus::Running => {}
        }

        let Some(tenant) = self.tenants.get(&job.tenant) else {
            let message = format!("tenant `{}` is no longer configured", job.tenant);
            return self.fail(job, FailureReason::Fatal, message).await;
        };

        while job.stage != Stage::Done {
            let stage = job.stage;
            if token.is_cancelled() {
                let reason = token.reason().unwrap_or_else(|| "cancelled by request".into());
                return self.fail(job, FailureReason::Cancelled, reason).await;
            }

            if stage == Stage::Publish
                && tenant.require_publish_confirmation
                && !job.publish_confirmed
            {
                job.awaiting_confirmation = true;
                job.status = JobStatus::Pending;
                job.touch();
                self.store.put(&job).await?;
                info!(target = "catalog.jobs", job_id = %job_id, "awaiting_publish_confirmation");
                return Ok(job);
            }

            let Some(executor) = self.executors.get(stage) else {
                if stage.is_optional() {
                    info!(target = "catalog.jobs", job_id = %job_id, stage = %stage, "stage_skipped");
                    job.stage = stage.next();
                    if job.stage == Stage::Done {
                        job.status = JobStatus::Succeeded;
                    }
                    job.touch();
                    self.store.put(&job).await?;
                    continue;
                }
                let message = format!("no executor registered for {stage}");
                return self.fail(job, FailureReason::Fatal, message).await;
            };

            job.status = JobStatus::Running;
            job.touch();
            self.store.put(&job).await?;
            crate::metrics::job_transition(stage.as_str(), job.status.as_str());

            // One publisher per tenant, held from gating until the commit.
            let _publish_guard = if stage == Stage::Publish {
                let lock = self.publish_lock(&tenant.id).await;
                let guard = tokio::select! {
                    guard = lock.lock_owned() => guard,
                    _ = token.cancelled() => {
                        let reason = token.reason().unwrap_or_else(|| "cancelled by request".into());
                        return self.fail(job, FailureReason::Cancelled, reason).await;
                    }
                };
                self.apply_gate(&mut job).await?;
                Some(guard)
            } else {
                None
            };

            match self.run_stage(&mut job, stage, executor, &tenant, &token).await? {
                StageRun::Completed {
                    batch,
                    attempt,
                    elapsed_ms,
                } => self.commit(&mut job, stage, batch, attempt, elapsed_ms).await?,
                StageRun::Failed(failure) => {
                    let reason = failure.reason;
                    let message = failure.message.clone();
                    job.failure = Some(failure);
                    return self.fail(job, reason, message).await;
                }
            }
        }

        Ok(job)
    }

    async fn publish_lock(&self, tenant: &str) -> Arc<Mutex<()>> {
        self.publish_locks
            .lock()
            .await
            .entry(tenant.to_string())
            .or_default()
            .clone()
    }

    async fn apply_gate(&self, job: &mut Job) -> Result<(), OrchestratorError> {
        let attempt = job.attempt(Stage::Publish) + 1;
        let gated = gate_batch(&job.items, &self.config.gate);
        for (index, sku, rejection) in gated.rejected {
            job.errors.push(
                JobError::new(
                    Stage::Publish,
                    ErrorKind::ValidationRejected,
                    attempt,
                    rejection.detail,
                )
                .for_item(index, sku)
                .with_rule(rejection.rule.as_str()),
            );
        }
        for (index, sku, note) in gated.notes {
            job.errors.push(
                JobError::new(Stage::Publish, ErrorKind::ValidationCoerced, attempt, note.detail)
                    .for_item(index, sku)
                    .with_rule(note.rule.as_str()),
            );
        }
        info!(
            target = "catalog.gate",
            job_id = %job.job_id,
            accepted = gated.accepted.len(),
            "batch_gated"
        );
        job.items = gated.accepted;
        job.touch();
        self.store.put(job).await?;
        Ok(())
    }

    async fn run_stage(
        &self,
        job: &mut Job,
        stage: Stage,
        executor: Arc<dyn StageExecutor>,
        tenant: &Arc<TenantProfile>,
        token: &CancelToken,
    ) -> Result<StageRun, OrchestratorError> {
        let policy = self.config.policy(stage);
        let mut last = (FailureReason::RetriesExhausted, String::new());
        let mut attempt = job.attempt(stage);

        for try_no in 1..=policy.max_attempts {
            if try_no > 1 && stage.calls_external_service() {
                let delay = self.config.backoff.jittered(try_no - 1);
                info!(
                    target = "catalog.jobs",
                    job_id = %job.job_id,
                    stage = %stage,
                    delay_ms = delay.as_millis() as u64,
                    "stage_backoff"
                );
                tokio::select! {
                    _ = self.clock.sleep(delay) => {}
                    _ = token.cancelled() => return Ok(self.cancelled(stage, attempt, token)),
                }
            }
            if stage.is_metered() && !self.await_stage_admission(&tenant.id, token).await {
                return Ok(self.cancelled(stage, attempt, token));
            }
            if token.is_cancelled() {
                return Ok(self.cancelled(stage, attempt, token));
            }

            attempt = job.bump_attempt(stage);
            job.touch();
            self.store.put(job).await?;

            let ctx = StageContext {
                job_id: job.job_id,
                tenant: tenant.clone(),
                source_ref: job.source_ref.clone(),
                stage,
                attempt,
                cancel: token.clone(),
            };
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(policy.timeout, executor.execute(&ctx, &job.items)).await;
            let elapsed_ms = started.elapsed().as_millis();
            crate::metrics::stage_elapsed(stage.as_str(), elapsed_ms);

            let (kind, reason, message) = match outcome {
                Ok(Ok(batch)) => {
                    return Ok(StageRun::Completed {
                        batch,
                        attempt,
                        elapsed_ms,
                    });
                }
                Ok(Err(err)) if err.kind() == StageErrorKind::Cancelled => {
                    return Ok(self.cancelled(stage, attempt, token));
                }
                Ok(Err(err)) if err.kind() == StageErrorKind::Timeout => (
                    ErrorKind::Timeout,
                    FailureReason::Timeout,
                    err.detail().to_string(),
                ),
                Ok(Err(err)) => (
                    ErrorKind::StageFatal,
                    FailureReason::RetriesExhausted,
                    format!("{}: {}", err.stage(), err.detail()),
                ),
                Err(_) => (
                    ErrorKind::Timeout,
                    FailureReason::Timeout,
                    format!("timed out after {}ms", policy.timeout.as_millis()),
                ),
            };
            warn!(
                target = "catalog.jobs",
                job_id = %job.job_id,
                stage = %stage,
                attempt,
                try_no,
                error = %message,
                "stage_attempt_failed"
            );
            job.errors
                .push(JobError::new(stage, kind, attempt, message.clone()));
            last = (reason, message);
        }

        let (reason, message) = last;
        Ok(StageRun::Failed(JobFailure {
            stage,
            reason,
            message: format!(
                "{} attempt(s) failed, last error: {message}",
                policy.max_attempts
            ),
            attempts: attempt,
        }))
    }

    fn cancelled(&self, stage: Stage, attempt: u32, token: &CancelToken) -> StageRun {
        StageRun::Failed(JobFailure {
            stage,
            reason: FailureReason::Cancelled,
            message: token
                .reason()
                .unwrap_or_else(|| "cancelled by request".into()),
            attempts: attempt,
        })
    }

    /// Waits out stage-class throttling. Returns false if cancelled meanwhile.
    async fn await_stage_admission(&self, tenant: &str, token: &CancelToken) -> bool {
        loop {
            match self.admission.allow(CallerClass::Stage, tenant).await {
                Admission::Admitted { .. } => return true,
                Admission::Throttled { retry_after, .. } => {
                    info!(
                        target = "catalog.admission",
                        tenant,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "stage_throttled"
                    );
                    tokio::select! {
                        _ = self.clock.sleep(retry_after) => {}
                        _ = token.cancelled() => return false,
                    }
                }
            }
        }
    }

    async fn commit(
        &self,
        job: &mut Job,
        stage: Stage,
        batch: StageBatch,
        attempt: u32,
        elapsed_ms: u128,
    ) -> Result<(), OrchestratorError> {
        for item_error in &batch.errors {
            job.errors.push(
                JobError::new(stage, ErrorKind::PerItem, attempt, item_error.reason.clone())
                    .for_item(item_error.index, item_error.sku.clone()),
            );
        }
        let mut items = batch.items;
        if stage != Stage::Publish {
            for item in &mut items {
                item.validated = false;
            }
        }
        job.items = items;
        job.reports
            .push(StageReport::new(stage, attempt, elapsed_ms, batch.report));
        job.stage = stage.next();
        job.status = if job.stage == Stage::Done {
            JobStatus::Succeeded
        } else {
            JobStatus::Pending
        };
        job.touch();
        self.store.put(job).await?;
        info!(
            target = "catalog.jobs",
            job_id = %job.job_id,
            stage = %stage,
            attempt,
            items = job.items.len(),
            item_errors = batch.errors.len(),
            elapsed_ms = elapsed_ms as u64,
            "stage_committed"
        );
        if job.status == JobStatus::Succeeded {
            info!(
                target = "catalog.jobs",
                job_id = %job.job_id,
                tenant = %job.tenant,
                items = job.items.len(),
                partial = job.has_partial_drops(),
                "job_succeeded"
            );
        }
        crate::metrics::job_transition(job.stage.as_str(), job.status.as_str());
        Ok(())
    }

    async fn fail(
        &self,
        mut job: Job,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Result<Job, OrchestratorError> {
        let message = message.into();
        let stage = job.stage;
        let attempts = job.attempt(stage);
        if reason == FailureReason::Cancelled {
            job.errors
                .push(JobError::new(stage, ErrorKind::Cancelled, attempts, message.clone()));
        } else if reason == FailureReason::Fatal {
            job.errors
                .push(JobError::new(stage, ErrorKind::StageFatal, attempts, message.clone()));
        }
        if job.failure.is_none() {
            job.failure = Some(JobFailure {
                stage,
                reason,
                message: message.clone(),
                attempts,
            });
        }
        job.status = JobStatus::Failed;
        job.touch();
        self.store.put(&job).await?;
        warn!(
            target = "catalog.jobs",
            job_id = %job.job_id,
            stage = %stage,
            reason = ?reason,
            error = %message,
            "job_failed"
        );
        crate::metrics::job_transition(stage.as_str(), job.status.as_str());
        Ok(job)
    }
}
