use super::{StageBatch, StageContext, StageError, StageExecutor};
use crate::models::{ProductRecord, Stage};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

static YEAR_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b((?:19|20)\d{2})\s*(?:-|/|a|até|ate|to)\s*((?:19|20)\d{2})\b")
        .expect("year range pattern compiles")
});

static MARKUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]*>").expect("markup pattern compiles"));

/// Derives vehicle compatibility from the tenant's fitment vocabulary.
pub struct FitmentExecutor;

fn year_range(text: &str) -> Option<(u16, u16)> {
    let caps = YEAR_RANGE_RE.captures(text)?;
    let start: u16 = caps.get(1)?.as_str().parse().ok()?;
    let end: u16 = caps.get(2)?.as_str().parse().ok()?;
    (start <= end).then_some((start, end))
}

fn mentions(haystack: &str, term: &str) -> bool {
    let term = term.trim().to_lowercase();
    if term.is_empty() {
        return false;
    }
    let pattern = format!(r"\b{}\b", regex::escape(&term));
    Regex::new(&pattern).is_ok_and(|re| re.is_match(haystack))
}

#[async_trait]
impl StageExecutor for FitmentExecutor {
    fn stage(&self) -> Stage {
        Stage::Fitment
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        items: &[ProductRecord],
    ) -> Result<StageBatch, StageError> {
        let vocabulary = &ctx.tenant.fitment_vocabulary;
        let mut out = Vec::with_capacity(items.len());
        let mut matched = 0usize;

        for item in items {
            ctx.checkpoint()?;
            let mut record = item.clone();
            let text = format!(
                "{} {}",
                record.title.as_deref().unwrap_or(""),
                MARKUP_RE.replace_all(record.description.as_deref().unwrap_or(""), " ")
            );
            let lowered = text.to_lowercase();
            let years = year_range(&text);

            let before = record.compatibility.len();
            for vehicle in vocabulary {
                if !mentions(&lowered, vehicle) {
                    continue;
                }
                let entry = match years {
                    Some((start, end)) => format!("{} {start}-{end}", vehicle.trim()),
                    None => vehicle.trim().to_string(),
                };
                if !record
                    .compatibility
                    .iter()
                    .any(|existing| existing.eq_ignore_ascii_case(&entry))
                {
                    record.compatibility.push(entry);
                }
            }
            if record.compatibility.len() > before {
                matched += 1;
            }
            out.push(record);
        }

        Ok(StageBatch::new(
            out,
            Vec::new(),
            json!({ "matched": matched, "vocabulary": vocabulary.len() }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tenants::TenantProfile, testing::context_for_tenant};

    fn tenant() -> TenantProfile {
        let mut tenant = TenantProfile::new("autopecas-sul");
        tenant.fitment_vocabulary = vec!["Gol".into(), "Palio".into(), "Uno".into()];
        tenant
    }

    #[test]
    fn reads_year_ranges_in_either_language() {
        assert_eq!(year_range("Gol G5 2008 a 2012"), Some((2008, 2012)));
        assert_eq!(year_range("Palio 1996-2000"), Some((1996, 2000)));
        assert_eq!(year_range("Uno 2010/2005"), None);
        assert_eq!(year_range("sem ano"), None);
    }

    #[tokio::test]
    async fn tags_vehicles_with_year_ranges() {
        let ctx = context_for_tenant(Stage::Fitment, tenant());
        let items = vec![
            ProductRecord {
                sku: Some("A".into()),
                title: Some("Pastilha de freio Gol / Palio 2008 a 2012".into()),
                ..Default::default()
            },
            ProductRecord {
                sku: Some("B".into()),
                title: Some("Tapete universal".into()),
                description: Some("<p>Serve em qualquer carro, exceto Unoxx</p>".into()),
                ..Default::default()
            },
        ];
        let batch = FitmentExecutor.execute(&ctx, &items).await.expect("batch");
        assert_eq!(batch.items[0].compatibility, vec!["Gol 2008-2012", "Palio 2008-2012"]);
        assert!(batch.items[1].compatibility.is_empty());
        assert_eq!(batch.report["matched"], 1);

        let again = FitmentExecutor
            .execute(&ctx, &batch.items)
            .await
            .expect("again");
        assert_eq!(again.items, batch.items);
    }
}
