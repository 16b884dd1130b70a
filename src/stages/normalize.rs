use super::{ItemError, StageBatch, StageContext, StageError, StageExecutor};
use crate::{
    gate::price::parse_price_text,
    models::{PriceField, ProductRecord, Stage},
};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

/// Applies tenant field mappings and light cleanup. Deterministic.
pub struct NormalizeExecutor;

#[async_trait]
impl StageExecutor for NormalizeExecutor {
    fn stage(&self) -> Stage {
        Stage::Normalize
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        items: &[ProductRecord],
    ) -> Result<StageBatch, StageError> {
        let mut out = Vec::with_capacity(items.len());
        let mut errors = Vec::new();
        let mut mapped_fields = 0usize;

        for (index, item) in items.iter().enumerate() {
            ctx.checkpoint()?;
            let mut record = item.clone();

            for (raw_name, field) in &ctx.tenant.field_mappings {
                if let Some(value) = record.extra.remove(raw_name) {
                    if apply_mapping(&mut record, field, value.clone()) {
                        mapped_fields += 1;
                    } else {
                        debug!(target = "catalog.jobs", field = %field, "unknown_field_mapping");
                        record.extra.insert(raw_name.clone(), value);
                    }
                }
            }

            record.sku = record
                .sku
                .as_deref()
                .map(|sku| sku.trim().to_ascii_uppercase())
                .filter(|sku| !sku.is_empty());
            record.title = record
                .title
                .as_deref()
                .map(collapse_whitespace)
                .filter(|title| !title.is_empty());
            if let Some(PriceField::Text(raw)) = &record.price
                && let Some(amount) = parse_price_text(raw)
            {
                record.price = Some(PriceField::Amount(amount));
            }
            if record.currency.is_none() {
                record.currency = Some(ctx.tenant.currency.clone());
            }
            if record.category.is_none() {
                record.category = ctx.tenant.default_category.clone();
            }

            if record.sku.is_none() {
                errors.push(ItemError::new(index, &record, "missing_sku"));
                continue;
            }
            if record.title.is_none() {
                errors.push(ItemError::new(index, &record, "missing_title"));
                continue;
            }
            out.push(record);
        }

        let report = json!({
            "normalized": out.len(),
            "dropped": errors.len(),
            "mapped_fields": mapped_fields,
        });
        Ok(StageBatch::new(out, errors, report))
    }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(entries) => entries.iter().filter_map(as_text).collect(),
        Value::String(s) => s
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Fills `field` from a raw supplier attribute unless it already has a value.
fn apply_mapping(record: &mut ProductRecord, field: &str, value: Value) -> bool {
    fn fill(slot: &mut Option<String>, value: &Value) {
        if slot.is_none() {
            *slot = as_text(value);
        }
    }
    match field {
        "sku" => fill(&mut record.sku, &value),
        "title" => fill(&mut record.title, &value),
        "description" => fill(&mut record.description, &value),
        "category" => fill(&mut record.category, &value),
        "brand" => fill(&mut record.brand, &value),
        "currency" => fill(&mut record.currency, &value),
        "image" => fill(&mut record.image, &value),
        "price" => {
            if record.price.is_none() {
                record.price = match value {
                    Value::Number(n) => n.as_f64().map(PriceField::Amount),
                    Value::String(s) => Some(PriceField::Text(s)),
                    _ => None,
                };
            }
        }
        "tags" => record.tags.extend(as_list(&value)),
        "compatibility" => record.compatibility.extend(as_list(&value)),
        _ => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context_for_tenant;
    use crate::tenants::TenantProfile;
    use std::collections::BTreeMap;

    fn supplier_row(extra: &[(&str, Value)]) -> ProductRecord {
        ProductRecord {
            extra: extra
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn maps_supplier_columns_into_record_fields() {
        let mut tenant = TenantProfile::new("autopecas-sul");
        tenant.field_mappings = [("codigo", "sku"), ("nome", "title"), ("preco", "price"), ("aplicacao", "compatibility")]
            .into_iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        tenant.default_category = Some("Freios".into());
        let ctx = context_for_tenant(Stage::Normalize, tenant);

        let items = vec![supplier_row(&[
            ("codigo", json!(" pf-12 ")),
            ("nome", json!("  Pastilha   de freio ")),
            ("preco", json!("R$ 89,90")),
            ("aplicacao", json!("Gol; Voyage")),
            ("cor", json!("preto")),
        ])];
        let batch = NormalizeExecutor.execute(&ctx, &items).await.expect("batch");
        let record = &batch.items[0];
        assert_eq!(record.sku.as_deref(), Some("PF-12"));
        assert_eq!(record.title.as_deref(), Some("Pastilha de freio"));
        assert_eq!(record.price, Some(PriceField::Amount(89.9)));
        assert_eq!(record.compatibility, vec!["Gol", "Voyage"]);
        assert_eq!(record.category.as_deref(), Some("Freios"));
        assert_eq!(record.currency.as_deref(), Some("BRL"));
        assert_eq!(record.extra.get("cor"), Some(&json!("preto")));
        assert_eq!(batch.report["mapped_fields"], 4);
    }

    #[tokio::test]
    async fn records_without_identity_are_item_errors() {
        let ctx = context_for_tenant(Stage::Normalize, TenantProfile::new("acme"));
        let items = vec![
            ProductRecord {
                sku: Some("a1".into()),
                title: Some("Filtro".into()),
                ..Default::default()
            },
            ProductRecord {
                sku: Some("   ".into()),
                title: Some("Filtro".into()),
                ..Default::default()
            },
            ProductRecord {
                sku: Some("b2".into()),
                ..Default::default()
            },
        ];
        let batch = NormalizeExecutor.execute(&ctx, &items).await.expect("batch");
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.errors.len(), 2);
        assert_eq!(batch.errors[0].reason, "missing_sku");
        assert_eq!(batch.errors[1].reason, "missing_title");
        assert_eq!(batch.errors[1].sku.as_deref(), Some("B2"));
    }

    #[tokio::test]
    async fn normalizing_twice_changes_nothing() {
        let ctx = context_for_tenant(Stage::Normalize, TenantProfile::new("acme"));
        let items = vec![ProductRecord {
            sku: Some(" x-1".into()),
            title: Some("Vela  de ignição".into()),
            price: Some(PriceField::Text("1.234,50".into())),
            ..Default::default()
        }];
        let once = NormalizeExecutor.execute(&ctx, &items).await.expect("once");
        let twice = NormalizeExecutor.execute(&ctx, &once.items).await.expect("twice");
        assert_eq!(once.items, twice.items);
    }
}
