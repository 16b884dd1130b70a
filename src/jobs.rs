use crate::{
    config::parse_env,
    orchestrator::{JobOrchestrator, OrchestratorError},
};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("job queue is not accepting work")]
pub struct QueueClosed;

/// Background runner: job ids go in, the orchestrator drives them to completion.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Uuid>,
}

impl JobQueue {
    pub fn spawn(orchestrator: JobOrchestrator) -> (Self, JoinHandle<()>) {
        Self::spawn_with(orchestrator, queue_capacity_from_env(), max_concurrent_from_env())
    }

    pub fn spawn_with(
        orchestrator: JobOrchestrator,
        capacity: usize,
        max_concurrent: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Uuid>(capacity.max(1));
        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));

        let handle = tokio::spawn(async move {
            while let Some(job_id) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match orchestrator.run(job_id).await {
                        Ok(job) => info!(
                            target = "catalog.jobs",
                            job_id = %job_id,
                            status = %job.status,
                            stage = %job.stage,
                            "job_run_finished"
                        ),
                        Err(OrchestratorError::AlreadyRunning(_)) => warn!(
                            target = "catalog.jobs",
                            job_id = %job_id,
                            "job_already_running"
                        ),
                        Err(err) => error!(
                            target = "catalog.jobs",
                            job_id = %job_id,
                            error = %err,
                            "job_run_error"
                        ),
                    }
                });
            }
        });

        (Self { tx }, handle)
    }

    pub async fn submit(&self, job_id: Uuid) -> Result<(), QueueClosed> {
        self.tx.send(job_id).await.map_err(|_| QueueClosed)
    }
}

fn queue_capacity_from_env() -> usize {
    parse_env::<usize>("QUEUE_CAPACITY").filter(|v| *v > 0).unwrap_or(64)
}

fn max_concurrent_from_env() -> usize {
    parse_env::<usize>("MAX_CONCURRENT_JOBS")
        .filter(|v| *v > 0)
        .unwrap_or(8)
}
