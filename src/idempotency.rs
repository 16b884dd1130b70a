//! Idempotency-Key support for job creation: a repeated key within the TTL
//! returns the job created the first time instead of starting another one.

use crate::config::parse_env;
use redis::AsyncCommands;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub enum IdempotencyCache {
    Memory {
        entries: Arc<Mutex<HashMap<String, (Uuid, Instant)>>>,
        ttl: Duration,
    },
    Redis {
        client: redis::Client,
        prefix: String,
        ttl: Duration,
    },
}

impl IdempotencyCache {
    pub fn memory(ttl: Duration) -> Self {
        Self::Memory {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn redis(client: redis::Client, ttl: Duration) -> Self {
        let prefix = std::env::var("REDIS_PREFIX").unwrap_or_else(|_| "catalog".into());
        Self::Redis {
            client,
            prefix,
            ttl,
        }
    }

    pub fn ttl_from_env() -> Duration {
        Duration::from_secs(
            parse_env::<u64>("IDEMPOTENCY_TTL_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(24 * 60 * 60),
        )
    }

    fn scoped(tenant: &str, key: &str) -> String {
        format!("{tenant}:{}", key.trim())
    }

    /// Redis failures are logged and treated as a miss.
    pub async fn get(&self, tenant: &str, key: &str) -> Option<Uuid> {
        let scoped = Self::scoped(tenant, key);
        match self {
            Self::Memory { entries, ttl } => {
                let mut guard = entries.lock().await;
                let fresh = guard
                    .get(&scoped)
                    .filter(|(_, at)| at.elapsed() < *ttl)
                    .map(|(job_id, _)| *job_id);
                if fresh.is_none() {
                    guard.remove(&scoped);
                }
                fresh
            }
            Self::Redis { client, prefix, .. } => {
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(c) => c,
                    Err(err) => {
                        warn!(target = "catalog.idempotency", error = %err, "redis_unavailable");
                        return None;
                    }
                };
                let raw: Result<Option<String>, _> =
                    conn.get(format!("{prefix}:idem:{scoped}")).await;
                raw.ok()
                    .flatten()
                    .and_then(|value| Uuid::parse_str(&value).ok())
            }
        }
    }

    /// Binds the key to `job_id` unless a live entry already holds it.
    /// Returns the job that holds the key when this claim lost.
    /// Redis failures are logged and treated as a won claim.
    pub async fn claim(&self, tenant: &str, key: &str, job_id: Uuid) -> Option<Uuid> {
        let scoped = Self::scoped(tenant, key);
        match self {
            Self::Memory { entries, ttl } => {
                let mut guard = entries.lock().await;
                guard.retain(|_, (_, at)| at.elapsed() < *ttl);
                if let Some((holder, _)) = guard.get(&scoped) {
                    return Some(*holder).filter(|holder| *holder != job_id);
                }
                guard.insert(scoped, (job_id, Instant::now()));
                None
            }
            Self::Redis {
                client,
                prefix,
                ttl,
            } => {
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(c) => c,
                    Err(err) => {
                        warn!(target = "catalog.idempotency", error = %err, "redis_unavailable");
                        return None;
                    }
                };
                let redis_key = format!("{prefix}:idem:{scoped}");
                let set: Result<Option<String>, _> = redis::cmd("SET")
                    .arg(&redis_key)
                    .arg(job_id.to_string())
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn)
                    .await;
                match set {
                    Ok(Some(_)) => None,
                    Ok(None) => {
                        let holder: Result<Option<String>, _> = conn.get(&redis_key).await;
                        holder
                            .ok()
                            .flatten()
                            .and_then(|value| Uuid::parse_str(&value).ok())
                            .filter(|holder| *holder != job_id)
                    }
                    Err(err) => {
                        warn!(target = "catalog.idempotency", error = %err, "idempotency_write_failed");
                        None
                    }
                }
            }
        }
    }
}
