use crate::models::Job;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Backend(String),
    #[error("stored job is corrupt: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Durable job state. `put` replaces the whole job atomically.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;
    async fn put(&self, job: &Job) -> Result<(), StoreError>;
    async fn list_by_tenant(&self, tenant: &str) -> Result<Vec<Job>, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn list_by_tenant(&self, tenant: &str) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.tenant == tenant)
            .cloned()
            .collect())
    }
}

/// Jobs as JSON strings under `{prefix}:job:{id}`, plus a per-tenant id set.
#[derive(Clone)]
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
}

impl RedisJobStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            prefix: std::env::var("REDIS_PREFIX").unwrap_or_else(|_| "catalog".to_string()),
        }
    }

    fn job_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn tenant_key(&self, tenant: &str) -> String {
        format!("{}:tenant:{}:jobs", self.prefix, tenant)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(self.job_key(job_id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(|err| StoreError::Corrupt(err.to_string())))
            .transpose()
    }

    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        let json = serde_json::to_string(job).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(job.job_id), json)
            .ignore()
            .sadd(self.tenant_key(&job.tenant), job.job_id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_by_tenant(&self, tenant: &str) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.smembers(self.tenant_key(tenant)).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.job_key(id))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(|err| StoreError::Corrupt(err.to_string())))
            .collect()
    }
}
