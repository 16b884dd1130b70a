use super::{ItemError, StageBatch, StageContext, StageError, StageExecutor};
use crate::{
    models::{ProductRecord, Stage},
    sink::{PublishSink, UpsertOutcome},
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Upserts gated records into the tenant's storefront.
pub struct PublishExecutor {
    sink: Arc<dyn PublishSink>,
}

impl PublishExecutor {
    pub fn new(sink: Arc<dyn PublishSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl StageExecutor for PublishExecutor {
    fn stage(&self) -> Stage {
        Stage::Publish
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        items: &[ProductRecord],
    ) -> Result<StageBatch, StageError> {
        let mut published = Vec::with_capacity(items.len());
        let mut errors = Vec::new();
        let (mut created, mut updated, mut rejected, mut refused) = (0usize, 0usize, 0usize, 0usize);

        for (index, item) in items.iter().enumerate() {
            ctx.checkpoint()?;
            if !item.validated {
                warn!(
                    target = "catalog.sink",
                    job_id = %ctx.job_id,
                    index,
                    sku = ?item.sku_label(),
                    "unvalidated_record_refused"
                );
                refused += 1;
                errors.push(ItemError::new(index, item, "not_validated"));
                continue;
            }

            let outcome = self
                .sink
                .upsert(&ctx.tenant, item)
                .await
                .map_err(|err| StageError::fatal(Stage::Publish, err.to_string()))?;
            crate::metrics::publish_outcome(outcome.as_str());
            match outcome {
                UpsertOutcome::Created => {
                    created += 1;
                    published.push(item.clone());
                }
                UpsertOutcome::Updated => {
                    updated += 1;
                    published.push(item.clone());
                }
                UpsertOutcome::Rejected(reason) => {
                    rejected += 1;
                    errors.push(ItemError::new(
                        index,
                        item,
                        format!("storefront_rejected: {reason}"),
                    ));
                }
            }
        }

        info!(
            target = "catalog.sink",
            job_id = %ctx.job_id,
            tenant = %ctx.tenant.id,
            created,
            updated,
            rejected,
            refused,
            "publish_complete"
        );
        let report = json!({
            "created": created,
            "updated": updated,
            "rejected": rejected,
            "refused": refused,
        });
        Ok(StageBatch::new(published, errors, report))
    }
}
