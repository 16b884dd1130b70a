use super::{ItemError, StageBatch, StageContext, StageError, StageExecutor};
use crate::{
    http::{build_client, default_timeout},
    llm::{LanguageModel, LlmMessage, strip_markdown_fence},
    models::{ProductRecord, Stage},
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

const VISION_FUNCTION: &str = "catalog_extract";

const VISION_PROMPT: &str = r#"
You are a catalog extraction agent. The user message names a supplier catalog artifact.
Respond with a JSON array of product objects using the keys sku, title, price, currency,
description, category, brand, tags, compatibility and image. Copy values as printed; do
not invent prices. Output JSON only.
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Json,
    Pdf,
    Image,
    Spreadsheet,
}

impl ArtifactKind {
    fn from_path(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let extension = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "pdf" => ArtifactKind::Pdf,
            "png" | "jpg" | "jpeg" | "webp" | "gif" | "tif" | "tiff" => ArtifactKind::Image,
            "xlsx" | "xls" | "ods" | "csv" => ArtifactKind::Spreadsheet,
            _ => ArtifactKind::Json,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Json => "json",
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Image => "image",
            ArtifactKind::Spreadsheet => "spreadsheet",
        }
    }
}

/// Where a job's input artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Inline(String),
    Url { url: String, kind: ArtifactKind },
    File { path: PathBuf, kind: ArtifactKind },
}

impl SourceRef {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("source_ref is empty".into());
        }
        if let Some(body) = trimmed.strip_prefix("inline:") {
            return Ok(SourceRef::Inline(body.to_string()));
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            reqwest::Url::parse(trimmed).map_err(|err| format!("invalid url: {err}"))?;
            return Ok(SourceRef::Url {
                url: trimmed.to_string(),
                kind: ArtifactKind::from_path(trimmed),
            });
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        if let Some((scheme, _)) = path.split_once("://") {
            return Err(format!("unsupported source scheme `{scheme}`"));
        }
        Ok(SourceRef::File {
            path: PathBuf::from(path),
            kind: ArtifactKind::from_path(path),
        })
    }
}

pub struct ExtractExecutor {
    llm: Arc<dyn LanguageModel>,
    http: Client,
    max_records: usize,
}

impl ExtractExecutor {
    pub fn new(llm: Arc<dyn LanguageModel>, max_records: usize) -> Self {
        Self {
            llm,
            http: build_client(default_timeout()),
            max_records,
        }
    }

    pub fn from_env(llm: Arc<dyn LanguageModel>) -> Self {
        let max_records = crate::config::parse_env("EXTRACT_MAX_RECORDS")
            .filter(|v: &usize| *v > 0)
            .unwrap_or(5_000);
        Self::new(llm, max_records)
    }

    async fn load(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let source =
            SourceRef::parse(&ctx.source_ref).map_err(|err| StageError::fatal(Stage::Extract, err))?;
        let raw = match &source {
            SourceRef::Inline(body) => body.clone(),
            SourceRef::Url {
                kind: ArtifactKind::Json,
                url,
            } => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(fetch_error)?;
                if !response.status().is_success() {
                    return Err(StageError::fatal(
                        Stage::Extract,
                        format!("source answered HTTP {}", response.status()),
                    ));
                }
                response.text().await.map_err(fetch_error)?
            }
            SourceRef::File {
                kind: ArtifactKind::Json,
                path,
            } => tokio::fs::read_to_string(path).await.map_err(|err| {
                StageError::fatal(
                    Stage::Extract,
                    format!("cannot read {}: {err}", path.display()),
                )
            })?,
            SourceRef::Url { kind, .. } | SourceRef::File { kind, .. } => {
                self.vision(ctx, *kind).await?
            }
        };
        serde_json::from_str(raw.trim())
            .map_err(|err| StageError::fatal(Stage::Extract, format!("source is not json: {err}")))
    }

    async fn vision(&self, ctx: &StageContext, kind: ArtifactKind) -> Result<String, StageError> {
        let request = json!({
            "source_ref": ctx.source_ref,
            "artifact": kind.as_str(),
            "tenant": ctx.tenant.id,
        });
        let messages = [
            LlmMessage::system(VISION_PROMPT),
            LlmMessage::user(request.to_string()),
        ];
        let response = self
            .llm
            .chat(VISION_FUNCTION, &messages)
            .await
            .map_err(|err| StageError::fatal(Stage::Extract, format!("vision extraction: {err}")))?;
        Ok(strip_markdown_fence(&response.text))
    }
}

fn fetch_error(err: reqwest::Error) -> StageError {
    if err.is_timeout() {
        StageError::timeout(Stage::Extract, default_timeout())
    } else {
        StageError::fatal(Stage::Extract, err.to_string())
    }
}

/// Accepts `[...]`, `{"items": [...]}` or a single record object.
fn into_entries(value: Value) -> Result<Vec<Value>, StageError> {
    match value {
        Value::Array(entries) => Ok(entries),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(entries)) => Ok(entries),
            Some(_) => Err(StageError::fatal(Stage::Extract, "`items` is not an array")),
            None => Ok(vec![Value::Object(map)]),
        },
        _ => Err(StageError::fatal(
            Stage::Extract,
            "source must be a record array or object",
        )),
    }
}

#[async_trait]
impl StageExecutor for ExtractExecutor {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        _items: &[ProductRecord],
    ) -> Result<StageBatch, StageError> {
        let entries = into_entries(self.load(ctx).await?)?;
        if entries.len() > self.max_records {
            return Err(StageError::fatal(
                Stage::Extract,
                format!(
                    "source has {} records, limit is {}",
                    entries.len(),
                    self.max_records
                ),
            ));
        }

        let total = entries.len();
        let mut items = Vec::with_capacity(total);
        let mut errors = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            ctx.checkpoint()?;
            if !entry.is_object() {
                errors.push(ItemError {
                    index,
                    sku: None,
                    reason: "entry is not an object".into(),
                });
                continue;
            }
            let sku = entry
                .get("sku")
                .and_then(Value::as_str)
                .map(str::to_string);
            match serde_json::from_value::<ProductRecord>(entry) {
                Ok(mut record) => {
                    record.validated = false;
                    items.push(record);
                }
                Err(err) => {
                    warn!(target = "catalog.jobs", job_id = %ctx.job_id, index, error = %err, "extract_entry_malformed");
                    errors.push(ItemError {
                        index,
                        sku,
                        reason: format!("malformed record: {err}"),
                    });
                }
            }
        }

        info!(
            target = "catalog.jobs",
            job_id = %ctx.job_id,
            total,
            extracted = items.len(),
            "extract_complete"
        );
        let report = json!({ "total": total, "extracted": items.len(), "malformed": errors.len() });
        Ok(StageBatch::new(items, errors, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        stages::StageErrorKind,
        testing::{FakeModel, context_with_source},
    };

    fn executor(model: FakeModel) -> ExtractExecutor {
        ExtractExecutor::new(Arc::new(model), 100)
    }

    #[test]
    fn parses_source_kinds() {
        assert_eq!(
            SourceRef::parse("inline:[]").expect("inline"),
            SourceRef::Inline("[]".into())
        );
        assert!(matches!(
            SourceRef::parse("https://cdn.example.com/catalogo.PDF?sig=1").expect("url"),
            SourceRef::Url {
                kind: ArtifactKind::Pdf,
                ..
            }
        ));
        assert!(matches!(
            SourceRef::parse("/data/lista.xlsx").expect("file"),
            SourceRef::File {
                kind: ArtifactKind::Spreadsheet,
                ..
            }
        ));
        assert!(SourceRef::parse("   ").is_err());
        assert!(SourceRef::parse("ftp://example.com/a.json").is_err());
    }

    #[tokio::test]
    async fn malformed_entries_become_item_errors() {
        let ctx = context_with_source(
            Stage::Extract,
            r#"inline:[{"sku":"A1","title":"Filtro"},{"sku":"B2","tags":"not-a-list"},7,{"sku":"C3","title":"Vela"}]"#,
        );
        let batch = executor(FakeModel::failing())
            .execute(&ctx, &[])
            .await
            .expect("batch");
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.errors.len(), 2);
        assert_eq!(batch.errors[0].index, 1);
        assert_eq!(batch.errors[0].sku.as_deref(), Some("B2"));
        assert_eq!(batch.errors[1].index, 2);
        assert_eq!(batch.report["total"], 4);
    }

    #[tokio::test]
    async fn untrusted_validated_flag_is_cleared() {
        let ctx = context_with_source(
            Stage::Extract,
            r#"inline:{"items":[{"sku":"A1","title":"Filtro","validated":true}]}"#,
        );
        let batch = executor(FakeModel::failing())
            .execute(&ctx, &[])
            .await
            .expect("batch");
        assert!(!batch.items[0].validated);
    }

    #[tokio::test]
    async fn pdf_sources_go_through_the_vision_model() {
        let model = FakeModel::replying("```json\n[{\"sku\":\"P1\",\"title\":\"Pastilha\"}]\n```");
        let ctx = context_with_source(Stage::Extract, "https://cdn.example.com/catalogo.pdf");
        let extract = executor(model.clone());
        let batch = extract.execute(&ctx, &[]).await.expect("batch");
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].sku.as_deref(), Some("P1"));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn vision_failure_is_fatal_for_the_stage() {
        let ctx = context_with_source(Stage::Extract, "/tmp/catalogo.pdf");
        let err = executor(FakeModel::failing())
            .execute(&ctx, &[])
            .await
            .expect_err("fatal");
        assert_eq!(err.kind(), StageErrorKind::Fatal);
    }

    #[tokio::test]
    async fn oversized_sources_are_refused() {
        let body: Vec<Value> = (0..101).map(|i| json!({"sku": format!("S{i}")})).collect();
        let ctx = context_with_source(Stage::Extract, &format!("inline:{}", Value::Array(body)));
        let err = executor(FakeModel::failing())
            .execute(&ctx, &[])
            .await
            .expect_err("too many");
        assert!(err.detail().contains("limit is 100"));
    }
}
