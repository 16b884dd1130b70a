use super::{StageBatch, StageContext, StageError, StageExecutor};
use crate::{
    llm::{LanguageModel, LlmMessage},
    models::{ProductRecord, Stage},
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

const DESCRIPTION_FUNCTION: &str = "catalog_enrich";

/// Writes missing descriptions. Gateway trouble degrades to a template; it is
/// never a per-item or stage failure.
pub struct EnrichExecutor {
    llm: Arc<dyn LanguageModel>,
}

impl EnrichExecutor {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }
}

fn prompt_for(record: &ProductRecord) -> String {
    json!({
        "instruction": "Write a short, factual storefront description in Portuguese. Plain HTML paragraphs and lists only.",
        "title": record.title,
        "brand": record.brand,
        "category": record.category,
        "compatibility": record.compatibility,
        "tags": record.tags,
    })
    .to_string()
}

fn fallback_description(record: &ProductRecord) -> String {
    let title = record.title.as_deref().unwrap_or("Produto");
    let mut out = format!("<p>{title}</p>");
    let facts: Vec<String> = [
        record.brand.as_ref().map(|b| format!("Marca: {b}")),
        record.category.as_ref().map(|c| format!("Categoria: {c}")),
        (!record.compatibility.is_empty())
            .then(|| format!("Aplicação: {}", record.compatibility.join(", "))),
    ]
    .into_iter()
    .flatten()
    .collect();
    if !facts.is_empty() {
        out.push_str("<ul>");
        for fact in facts {
            out.push_str(&format!("<li>{fact}</li>"));
        }
        out.push_str("</ul>");
    }
    out
}

#[async_trait]
impl StageExecutor for EnrichExecutor {
    fn stage(&self) -> Stage {
        Stage::Enrich
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        items: &[ProductRecord],
    ) -> Result<StageBatch, StageError> {
        let mut out = Vec::with_capacity(items.len());
        let mut generated = 0usize;
        let mut fallbacks = 0usize;
        // After one gateway failure the rest of the batch uses the template.
        let mut gateway_open = true;

        for item in items {
            ctx.checkpoint()?;
            let mut record = item.clone();
            let missing = record
                .description
                .as_deref()
                .is_none_or(|d| d.trim().is_empty());
            if missing {
                let answer = if gateway_open {
                    let messages = [LlmMessage::user(prompt_for(&record))];
                    match self.llm.chat(DESCRIPTION_FUNCTION, &messages).await {
                        Ok(response) if !response.text.trim().is_empty() => {
                            Some(response.text.trim().to_string())
                        }
                        Ok(_) => None,
                        Err(err) => {
                            warn!(
                                target = "catalog.llm",
                                job_id = %ctx.job_id,
                                error = %err,
                                "llm_description_fallback"
                            );
                            gateway_open = false;
                            None
                        }
                    }
                } else {
                    None
                };
                match answer {
                    Some(text) => {
                        generated += 1;
                        record.description = Some(text);
                    }
                    None => {
                        fallbacks += 1;
                        record.description = Some(fallback_description(&record));
                    }
                }
            }
            out.push(record);
        }

        let report = json!({ "generated": generated, "fallbacks": fallbacks, "gateway_open": gateway_open });
        Ok(StageBatch::new(out, Vec::new(), report))
    }
}
