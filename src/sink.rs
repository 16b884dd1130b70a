use crate::{
    http::{build_client, default_timeout},
    models::{PriceField, ProductRecord},
    tenants::{StorefrontCredentials, TenantProfile},
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use urlencoding::encode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// The storefront refused this record; other records are unaffected.
    Rejected(String),
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Created => "created",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Rejected(_) => "rejected",
        }
    }
}

/// Transport-level failure: the whole publish attempt is unsafe to continue.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("storefront not configured for tenant `{0}`")]
    NotConfigured(String),
    #[error("storefront request failed: {0}")]
    Transport(String),
}

/// Idempotent upsert keyed by `(tenant, sku)`.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn upsert(
        &self,
        tenant: &TenantProfile,
        record: &ProductRecord,
    ) -> Result<UpsertOutcome, SinkError>;
}

#[derive(Clone, Default)]
pub struct InMemorySink {
    records: Arc<Mutex<HashMap<(String, String), ProductRecord>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, tenant: &str, sku: &str) -> Option<ProductRecord> {
        self.records
            .lock()
            .await
            .get(&(tenant.to_string(), sku.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl PublishSink for InMemorySink {
    async fn upsert(
        &self,
        tenant: &TenantProfile,
        record: &ProductRecord,
    ) -> Result<UpsertOutcome, SinkError> {
        let Some(sku) = record.sku_label() else {
            return Ok(UpsertOutcome::Rejected("missing sku".into()));
        };
        let previous = self
            .records
            .lock()
            .await
            .insert((tenant.id.clone(), sku), record.clone());
        Ok(if previous.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }
}

#[derive(Debug, Serialize)]
struct StorefrontProduct<'a> {
    sku: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    regular_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    currency: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    brand: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    tags: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    compatibility: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<&'a str>,
}

impl<'a> StorefrontProduct<'a> {
    fn from_record(sku: &'a str, tenant: &'a TenantProfile, record: &'a ProductRecord) -> Self {
        Self {
            sku,
            name: record.title.as_deref().unwrap_or(sku),
            regular_price: match &record.price {
                Some(PriceField::Amount(value)) => Some(format!("{value:.2}")),
                _ => None,
            },
            currency: record.currency.as_deref().or(Some(tenant.currency.as_str())),
            description: record.description.as_deref(),
            category: record
                .category
                .as_deref()
                .or(tenant.default_category.as_deref()),
            brand: record.brand.as_deref(),
            tags: &record.tags,
            compatibility: &record.compatibility,
            images: record.image.as_deref().into_iter().collect(),
        }
    }
}

/// REST storefront: `PUT {base_url}/products/{sku}` with the tenant's credentials.
pub struct HttpStorefrontSink {
    http: Client,
}

impl HttpStorefrontSink {
    pub fn new() -> Self {
        Self {
            http: build_client(default_timeout()),
        }
    }
}

#[async_trait]
impl PublishSink for HttpStorefrontSink {
    async fn upsert(
        &self,
        tenant: &TenantProfile,
        record: &ProductRecord,
    ) -> Result<UpsertOutcome, SinkError> {
        let credentials = tenant
            .storefront
            .as_ref()
            .ok_or_else(|| SinkError::NotConfigured(tenant.id.clone()))?;
        let Some(sku) = record.sku.as_deref() else {
            return Ok(UpsertOutcome::Rejected("missing sku".into()));
        };

        let url = format!(
            "{}/products/{}",
            credentials.base_url.trim_end_matches('/'),
            encode(sku)
        );
        let body = StorefrontProduct::from_record(sku, tenant, record);
        let mut request = self.http.put(url).json(&body);
        if let Some(header) = authorization(credentials) {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }

        let response = request
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;
        let status = response.status();
        debug!(target = "catalog.sink", tenant = %tenant.id, sku, %status, "storefront_upsert");

        match status {
            StatusCode::CREATED => Ok(UpsertOutcome::Created),
            s if s.is_success() => Ok(UpsertOutcome::Updated),
            s if s.is_client_error()
                && s != StatusCode::UNAUTHORIZED
                && s != StatusCode::FORBIDDEN
                && s != StatusCode::TOO_MANY_REQUESTS =>
            {
                let detail = response.text().await.unwrap_or_default();
                warn!(target = "catalog.sink", tenant = %tenant.id, sku, %status, "storefront_rejected");
                Ok(UpsertOutcome::Rejected(format!(
                    "HTTP {status}: {}",
                    detail.chars().take(200).collect::<String>()
                )))
            }
            s => Err(SinkError::Transport(format!("HTTP {s}"))),
        }
    }
}

fn authorization(credentials: &StorefrontCredentials) -> Option<String> {
    if let Some(token) = credentials.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(format!("Bearer {token}"));
    }
    match (
        credentials.consumer_key.as_deref(),
        credentials.consumer_secret.as_deref(),
    ) {
        (Some(key), Some(secret)) => Some(format!(
            "Basic {}",
            BASE64.encode(format!("{key}:{secret}"))
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sku: &str) -> ProductRecord {
        ProductRecord {
            sku: Some(sku.into()),
            title: Some("Filtro de ar".into()),
            validated: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_sink_upserts_by_tenant_and_sku() {
        let sink = InMemorySink::new();
        let acme = TenantProfile::new("acme");
        let globex = TenantProfile::new("globex");

        assert_eq!(
            sink.upsert(&acme, &record("F-1")).await.expect("upsert"),
            UpsertOutcome::Created
        );
        assert_eq!(
            sink.upsert(&acme, &record("F-1")).await.expect("upsert"),
            UpsertOutcome::Updated
        );
        assert_eq!(
            sink.upsert(&globex, &record("F-1")).await.expect("upsert"),
            UpsertOutcome::Created
        );
        assert_eq!(sink.len().await, 2);
    }

    #[test]
    fn prefers_bearer_then_basic_credentials() {
        let mut credentials = StorefrontCredentials {
            base_url: "https://loja.example.com".into(),
            token: Some("tkn".into()),
            consumer_key: Some("ck".into()),
            consumer_secret: Some("cs".into()),
        };
        assert_eq!(authorization(&credentials).as_deref(), Some("Bearer tkn"));
        credentials.token = None;
        assert_eq!(authorization(&credentials).as_deref(), Some("Basic Y2s6Y3M="));
    }

    #[tokio::test]
    async fn http_sink_requires_storefront_credentials() {
        let sink = HttpStorefrontSink::new();
        let err = sink
            .upsert(&TenantProfile::new("acme"), &record("F-1"))
            .await
            .expect_err("not configured");
        assert!(matches!(err, SinkError::NotConfigured(_)));
    }

    #[test]
    fn payload_falls_back_to_tenant_defaults() {
        let mut tenant = TenantProfile::new("acme");
        tenant.default_category = Some("Freios".into());
        let mut item = record("F 1");
        item.price = Some(PriceField::Amount(15000.0));
        let body = serde_json::to_value(StorefrontProduct::from_record("F 1", &tenant, &item))
            .expect("json");
        assert_eq!(body["regular_price"], "15000.00");
        assert_eq!(body["currency"], "BRL");
        assert_eq!(body["category"], "Freios");
        assert!(body.get("tags").is_none());
        assert_eq!(encode("F 1"), "F%201");
    }
}
