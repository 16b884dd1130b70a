//! Validation gate between untrusted upstream content and the storefront.
//!
//! `validate` is pure: it never touches the network and returns the same
//! record when fed its own output. The orchestrator runs every item through
//! [`gate_batch`] immediately before the publish stage.

pub mod html;
pub mod price;

use crate::models::{PriceField, ProductRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::{collections::BTreeSet, fmt};
use thiserror::Error;
use tracing::{info, warn};

static MARKUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("markup pattern compiles"));

pub const DEFAULT_ALLOWED_TAGS: &[&str] = &[
    "p", "br", "b", "strong", "i", "em", "u", "ul", "ol", "li", "h2", "h3", "h4", "table",
    "thead", "tbody", "tr", "th", "td", "span", "div", "a", "img",
];

#[derive(Debug, Clone)]
pub struct GateConfig {
    allowed_tags: BTreeSet<String>,
    pub min_title_len: usize,
    pub max_title_len: usize,
    pub max_sku_len: usize,
    pub max_description_len: usize,
    pub max_text_len: usize,
    pub max_tag_len: usize,
    pub max_tags: usize,
    pub min_price: f64,
    pub max_price: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            allowed_tags: normalize_tags(DEFAULT_ALLOWED_TAGS.iter().copied()),
            min_title_len: 3,
            max_title_len: 120,
            max_sku_len: 64,
            max_description_len: 20_000,
            max_text_len: 120,
            max_tag_len: 64,
            max_tags: 30,
            min_price: 0.01,
            max_price: 1_000_000.0,
        }
    }
}

impl GateConfig {
    /// Replaces the tag allow-list. Content-dropping elements such as
    /// `script` are never accepted, whatever the configuration says.
    pub fn with_allowed_tags<'a>(mut self, tags: impl IntoIterator<Item = &'a str>) -> Self {
        self.allowed_tags = normalize_tags(tags);
        self
    }

    pub fn allowed_tags(&self) -> &BTreeSet<String> {
        &self.allowed_tags
    }
}

fn normalize_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    tags.into_iter()
        .map(|tag| tag.trim().to_ascii_lowercase())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| !html::CONTENT_DROPPING_TAGS.contains(&tag.as_str()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRule {
    EmptyTitle,
    TitleTooShort,
    MissingSku,
    PriceUnparseable,
    PriceOutOfRange,
    ImageRejected,
}

impl GateRule {
    pub fn as_str(self) -> &'static str {
        match self {
            GateRule::EmptyTitle => "empty_title",
            GateRule::TitleTooShort => "title_too_short",
            GateRule::MissingSku => "missing_sku",
            GateRule::PriceUnparseable => "price_unparseable",
            GateRule::PriceOutOfRange => "price_out_of_range",
            GateRule::ImageRejected => "image_rejected",
        }
    }
}

impl fmt::Display for GateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecoverable problem: the record never reaches the storefront.
#[derive(Debug, Clone, Error)]
#[error("record rejected by `{rule}`: {detail}")]
pub struct Rejection {
    pub rule: GateRule,
    pub detail: String,
}

/// Recoverable problem: the field was coerced to a safe value.
#[derive(Debug, Clone, PartialEq)]
pub struct GateNote {
    pub rule: GateRule,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct Validated {
    pub record: ProductRecord,
    pub notes: Vec<GateNote>,
}

pub fn validate(record: &ProductRecord, config: &GateConfig) -> Result<Validated, Rejection> {
    let mut notes = Vec::new();

    let title = clean_text(record.title.as_deref().unwrap_or(""), config.max_title_len);
    if title.is_empty() {
        return Err(Rejection {
            rule: GateRule::EmptyTitle,
            detail: "title is empty after cleanup".into(),
        });
    }
    let title_len = title.chars().count();
    if title_len < config.min_title_len {
        return Err(Rejection {
            rule: GateRule::TitleTooShort,
            detail: format!(
                "title has {title_len} characters, minimum is {}",
                config.min_title_len
            ),
        });
    }

    let sku = clean_sku(record.sku.as_deref().unwrap_or(""), config.max_sku_len);
    if sku.is_empty() {
        return Err(Rejection {
            rule: GateRule::MissingSku,
            detail: "sku is empty after removing disallowed characters".into(),
        });
    }

    let price = match &record.price {
        None => None,
        Some(field) => match price::parse_price(field) {
            None => {
                notes.push(GateNote {
                    rule: GateRule::PriceUnparseable,
                    detail: format!("price {} is not a finite number", describe_price(field)),
                });
                None
            }
            Some(value) if value < config.min_price || value > config.max_price => {
                notes.push(GateNote {
                    rule: GateRule::PriceOutOfRange,
                    detail: format!(
                        "price {value} outside [{}, {}]",
                        config.min_price, config.max_price
                    ),
                });
                None
            }
            Some(value) => Some(PriceField::Amount(price::round_to_cents(value))),
        },
    };

    let image = match record.image.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(url) if is_http_url(url) => Some(url.to_string()),
        Some(url) => {
            notes.push(GateNote {
                rule: GateRule::ImageRejected,
                detail: format!("image reference `{}` is not an http(s) url", preview(url)),
            });
            None
        }
    };

    let description = record
        .description
        .as_deref()
        .map(|raw| html::sanitize_html(raw, &config.allowed_tags, config.max_description_len))
        .map(|clean| clean.trim().to_string())
        .filter(|clean| !clean.is_empty());

    let validated = ProductRecord {
        sku: Some(sku),
        title: Some(title),
        price,
        currency: record.currency.as_deref().and_then(clean_currency),
        description,
        category: optional_text(record.category.as_deref(), config.max_text_len),
        brand: optional_text(record.brand.as_deref(), config.max_text_len),
        tags: clean_list(&record.tags, config),
        compatibility: clean_list(&record.compatibility, config),
        image,
        validated: true,
        extra: Default::default(),
    };

    Ok(Validated {
        record: validated,
        notes,
    })
}

/// Outcome of gating a whole batch, keeping each item's original position.
#[derive(Debug, Default)]
pub struct GatedBatch {
    pub accepted: Vec<ProductRecord>,
    pub notes: Vec<(usize, Option<String>, GateNote)>,
    pub rejected: Vec<(usize, Option<String>, Rejection)>,
}

pub fn gate_batch(items: &[ProductRecord], config: &GateConfig) -> GatedBatch {
    let mut batch = GatedBatch::default();
    for (index, item) in items.iter().enumerate() {
        match validate(item, config) {
            Ok(validated) => {
                for note in validated.notes {
                    warn!(
                        target = "catalog.gate",
                        index,
                        sku = ?validated.record.sku,
                        rule = %note.rule,
                        detail = %note.detail,
                        "field_coerced"
                    );
                    batch
                        .notes
                        .push((index, validated.record.sku.clone(), note));
                }
                batch.accepted.push(validated.record);
            }
            Err(rejection) => {
                info!(
                    target = "catalog.gate",
                    index,
                    sku = ?item.sku_label(),
                    rule = %rejection.rule,
                    detail = %rejection.detail,
                    "record_rejected"
                );
                crate::metrics::gate_rejected(rejection.rule.as_str());
                batch.rejected.push((index, item.sku_label(), rejection));
            }
        }
    }
    batch
}

/// Plain-text cleanup: no markup, no control characters, single spaces.
fn clean_text(raw: &str, max_chars: usize) -> String {
    let without_markup = MARKUP_RE.replace_all(raw, " ");
    let filtered: String = without_markup
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .filter(|c| !matches!(c, '<' | '>'))
        .collect();
    let collapsed = filtered.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_chars).trim_end().to_string()
}

fn optional_text(raw: Option<&str>, max_chars: usize) -> Option<String> {
    raw.map(|value| clean_text(value, max_chars))
        .filter(|value| !value.is_empty())
}

fn clean_sku(raw: &str, max_chars: usize) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .take(max_chars)
        .collect()
}

fn clean_currency(raw: &str) -> Option<String> {
    let code: String = raw
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    (code.len() == 3).then_some(code)
}

fn clean_list(values: &[String], config: &GateConfig) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for value in values {
        if cleaned.len() >= config.max_tags {
            break;
        }
        let stripped: String = value
            .chars()
            .filter(|c| !matches!(c, '"' | '\'' | '<' | '>' | '`') && !c.is_control())
            .collect();
        let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        let entry = truncate_chars(&collapsed, config.max_tag_len)
            .trim_end()
            .to_string();
        if entry.is_empty()
            || cleaned
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(&entry))
        {
            continue;
        }
        cleaned.push(entry);
    }
    cleaned
}

fn is_http_url(value: &str) -> bool {
    if value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | '`'))
    {
        return false;
    }
    match reqwest::Url::parse(value) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((byte_end, _)) => &value[..byte_end],
        None => value,
    }
}

fn describe_price(field: &PriceField) -> String {
    match field {
        PriceField::Amount(value) => value.to_string(),
        PriceField::Text(raw) => format!("`{}`", preview(raw)),
    }
}

fn preview(value: &str) -> String {
    truncate_chars(value, 40).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(title: &str, sku: &str) -> ProductRecord {
        ProductRecord {
            sku: Some(sku.into()),
            title: Some(title.into()),
            ..Default::default()
        }
    }

    fn gate() -> GateConfig {
        GateConfig::default()
    }

    #[test]
    fn accepts_and_marks_a_clean_record() {
        let out = validate(&record("Filtro de óleo", "FO-100"), &gate()).expect("valid");
        assert!(out.record.validated);
        assert!(out.notes.is_empty());
        assert_eq!(out.record.title.as_deref(), Some("Filtro de óleo"));
    }

    #[test]
    fn rejects_empty_and_short_titles() {
        let empty = validate(&record(" \u{0007}\t<b></b> ", "A1"), &gate()).expect_err("empty");
        assert_eq!(empty.rule, GateRule::EmptyTitle);
        let short = validate(&record("ab", "A1"), &gate()).expect_err("short");
        assert_eq!(short.rule, GateRule::TitleTooShort);
        let missing = validate(
            &ProductRecord {
                sku: Some("A1".into()),
                ..Default::default()
            },
            &gate(),
        )
        .expect_err("missing");
        assert_eq!(missing.rule, GateRule::EmptyTitle);
    }

    #[test]
    fn cleans_and_truncates_title() {
        let long = format!("<h1>Pastilha</h1>\n\tde   freio {}", "x".repeat(300));
        let out = validate(&record(&long, "P-1"), &gate()).expect("valid");
        let title = out.record.title.expect("title");
        assert!(title.starts_with("Pastilha de freio x"));
        assert_eq!(title.chars().count(), 120);
    }

    #[test]
    fn strips_sku_to_safe_alphabet() {
        let out = validate(&record("Amortecedor", "  AB 12/<x>_9-Z;DROP "), &gate()).expect("valid");
        assert_eq!(out.record.sku.as_deref(), Some("AB12x_9-ZDROP"));
        let long = validate(&record("Amortecedor", &"A".repeat(200)), &gate()).expect("valid");
        assert_eq!(long.record.sku.map(|s| s.len()), Some(64));
        let none = validate(&record("Amortecedor", "///"), &gate()).expect_err("empty sku");
        assert_eq!(none.rule, GateRule::MissingSku);
    }

    #[test]
    fn price_bounds_coerce_to_unknown() {
        let mut negative = record("Correia dentada", "CD-1");
        negative.price = Some(PriceField::Amount(-5.0));
        let out = validate(&negative, &gate()).expect("still valid");
        assert_eq!(out.record.price, None);
        assert_eq!(out.notes[0].rule, GateRule::PriceOutOfRange);

        let mut huge = record("Correia dentada", "CD-1");
        huge.price = Some(PriceField::Text("999,999,999,999".into()));
        let out = validate(&huge, &gate()).expect("still valid");
        assert_eq!(out.record.price, None);
        assert_eq!(out.notes[0].rule, GateRule::PriceOutOfRange);

        let mut fine = record("Correia dentada", "CD-1");
        fine.price = Some(PriceField::Amount(15000.0));
        let out = validate(&fine, &gate()).expect("valid");
        assert_eq!(out.record.price, Some(PriceField::Amount(15000.0)));
        assert!(out.notes.is_empty());

        let mut text = record("Correia dentada", "CD-1");
        text.price = Some(PriceField::Text("sob consulta".into()));
        let out = validate(&text, &gate()).expect("valid");
        assert_eq!(out.record.price, None);
        assert_eq!(out.notes[0].rule, GateRule::PriceUnparseable);
    }

    #[test]
    fn price_text_with_extra_terms_is_unparseable() {
        for raw in ["12x de R$ 34,90", "10 - 20", "R$ 15,00 / un (cx 12)"] {
            let mut item = record("Disco de freio", "DF-1");
            item.price = Some(PriceField::Text(raw.into()));
            let out = validate(&item, &gate()).expect("valid");
            assert_eq!(out.record.price, None, "{raw}");
            assert_eq!(out.notes.len(), 1, "{raw}");
            assert_eq!(out.notes[0].rule, GateRule::PriceUnparseable, "{raw}");
        }

        let mut plain = record("Disco de freio", "DF-1");
        plain.price = Some(PriceField::Text("R$ 34,90".into()));
        let out = validate(&plain, &gate()).expect("valid");
        assert_eq!(out.record.price, Some(PriceField::Amount(34.9)));
        assert!(out.notes.is_empty());
    }

    #[test]
    fn description_loses_scripts_and_handlers() {
        let mut item = record("Bomba d'água", "BA-9");
        item.description = Some(
            r#"<p>Original</p><script>alert(1)</script><img src="https://x.test/a.png" onerror="alert(1)">"#
                .into(),
        );
        let out = validate(&item, &gate()).expect("valid");
        let description = out.record.description.expect("description");
        assert!(!description.contains("<script"));
        assert!(!description.contains("alert(1)"));
        assert!(!description.contains("onerror"));
        assert!(description.contains("<p>Original</p>"));
    }

    #[test]
    fn list_fields_are_cleaned_capped_and_deduplicated() {
        let mut item = record("Vela de ignição", "VI-2");
        item.tags = vec![
            "\"<Gol>\"".into(),
            "gol".into(),
            "  ".into(),
            "x".repeat(100),
        ];
        item.tags.extend((0..50).map(|i| format!("tag-{i}")));
        let out = validate(&item, &gate()).expect("valid");
        assert_eq!(out.record.tags[0], "Gol");
        assert_eq!(out.record.tags[1].len(), 64);
        assert_eq!(out.record.tags.len(), 30);
    }

    #[test]
    fn non_http_images_are_dropped_with_a_note() {
        let mut item = record("Retrovisor", "R-1");
        item.image = Some("javascript:alert(1)".into());
        let out = validate(&item, &gate()).expect("valid");
        assert_eq!(out.record.image, None);
        assert_eq!(out.notes[0].rule, GateRule::ImageRejected);
    }

    #[test]
    fn upstream_marker_and_raw_attributes_are_not_trusted() {
        let mut item: ProductRecord = serde_json::from_value(json!({
            "sku": "M-1",
            "title": "Motor de partida",
            "validated": true,
            "payload": "<script>x</script>",
        }))
        .expect("record");
        item.validated = true;
        let out = validate(&item, &gate()).expect("valid");
        assert!(out.record.extra.is_empty());
    }

    #[test]
    fn validation_is_a_projection() {
        let mut item = record("  <i>Kit</i> embreagem\u{0000} completo  ", " KE-1 / 2 ");
        item.price = Some(PriceField::Text("R$ 1.234,567".into()));
        item.currency = Some("brl".into());
        item.description = Some(r#"<div class="a" onclick="b">x<a href="javascript:y">z</a></div>"#.into());
        item.category = Some("<b>Transmissão</b>".into());
        item.tags = vec!["'a'".into(), "A".into(), "b".into()];
        item.image = Some("https://cdn.test/k.png".into());
        let once = validate(&item, &gate()).expect("valid").record;
        let twice = validate(&once, &gate()).expect("still valid");
        assert_eq!(twice.record, once);
        assert!(twice.notes.is_empty());
    }

    #[test]
    fn allow_list_cannot_readmit_script() {
        let config = GateConfig::default().with_allowed_tags(["p", "script"]);
        assert!(config.allowed_tags().contains("p"));
        assert!(!config.allowed_tags().contains("script"));
    }

    #[test]
    fn batch_keeps_positions_of_rejections() {
        let items = vec![
            record("Filtro de ar", "F-1"),
            record("", "F-2"),
            record("Filtro de cabine", ""),
        ];
        let batch = gate_batch(&items, &gate());
        assert_eq!(batch.accepted.len(), 1);
        let positions: Vec<usize> = batch.rejected.iter().map(|(i, _, _)| *i).collect();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(batch.rejected[0].1.as_deref(), Some("F-2"));
    }
}
