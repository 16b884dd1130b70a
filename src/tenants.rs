use serde::Deserialize;
use std::{collections::BTreeMap, collections::HashMap, fmt, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};

/// Per-tenant ("empresa") parameters shared by the generic executors.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantProfile {
    pub id: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Raw supplier attribute name -> record field (`title`, `price`, ...).
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,
    /// Vehicle or model names recognised by the fitment stage.
    #[serde(default)]
    pub fitment_vocabulary: Vec<String>,
    #[serde(default)]
    pub default_category: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub require_publish_confirmation: bool,
    #[serde(default)]
    pub storefront: Option<StorefrontCredentials>,
}

fn default_currency() -> String {
    "BRL".to_string()
}

impl TenantProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_keys: Vec::new(),
            field_mappings: BTreeMap::new(),
            fitment_vocabulary: Vec::new(),
            default_category: None,
            currency: default_currency(),
            require_publish_confirmation: false,
            storefront: None,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct StorefrontCredentials {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub consumer_key: Option<String>,
    #[serde(default)]
    pub consumer_secret: Option<String>,
}

impl fmt::Debug for StorefrontCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorefrontCredentials")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("consumer_key", &self.consumer_key.as_ref().map(|_| "***"))
            .field("consumer_secret", &self.consumer_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("failed to read tenants file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid tenants file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate tenant id `{0}`")]
    Duplicate(String),
    #[error("api key configured for more than one tenant")]
    SharedKey,
}

#[derive(Deserialize)]
struct TenantsFile {
    tenants: Vec<TenantProfile>,
}

/// Tenant lookup by id and by presented API key.
#[derive(Debug, Clone, Default)]
pub struct TenantRegistry {
    tenants: Arc<HashMap<String, Arc<TenantProfile>>>,
    keys: Arc<HashMap<String, KeyRecord>>,
}

#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub tenant: String,
    pub api_key_id: String,
}

impl TenantRegistry {
    pub fn with_tenants(
        profiles: impl IntoIterator<Item = TenantProfile>,
    ) -> Result<Self, TenantError> {
        let mut tenants = HashMap::new();
        let mut keys = HashMap::new();
        for profile in profiles {
            for (idx, key) in profile.api_keys.iter().enumerate() {
                let record = KeyRecord {
                    tenant: profile.id.clone(),
                    api_key_id: format!("{}-key-{:02}", profile.id, idx + 1),
                };
                if keys.insert(key.clone(), record).is_some() {
                    return Err(TenantError::SharedKey);
                }
            }
            let id = profile.id.clone();
            if tenants.insert(id.clone(), Arc::new(profile)).is_some() {
                return Err(TenantError::Duplicate(id));
            }
        }
        Ok(Self {
            tenants: Arc::new(tenants),
            keys: Arc::new(keys),
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, TenantError> {
        let file: TenantsFile = serde_yaml::from_str(raw)?;
        Self::with_tenants(file.tenants)
    }

    /// `TENANTS_FILE` (yaml) first, then `API_KEYS` (`tenant:key,...`), then a demo tenant.
    pub fn from_env() -> Result<Self, TenantError> {
        if let Ok(path) = std::env::var("TENANTS_FILE") {
            let raw = std::fs::read_to_string(&path).map_err(|source| TenantError::Io {
                path: path.clone(),
                source,
            })?;
            let registry = Self::from_yaml_str(&raw)?;
            info!(
                target = "catalog.api",
                tenant_count = registry.tenants.len(),
                path = %path,
                "loaded tenants from file"
            );
            return Ok(registry);
        }

        let raw = std::env::var("API_KEYS").unwrap_or_default();
        let mut profiles: BTreeMap<String, TenantProfile> = BTreeMap::new();
        for token in raw.split(',') {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut parts = trimmed.splitn(2, ':');
            let tenant = parts.next().map(str::trim).filter(|s| !s.is_empty());
            let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
            match (tenant, key) {
                (Some(tenant), Some(secret)) => profiles
                    .entry(tenant.to_string())
                    .or_insert_with(|| TenantProfile::new(tenant))
                    .api_keys
                    .push(secret.to_string()),
                _ => warn!(
                    target = "catalog.api",
                    "ignored malformed API_KEYS entry: {trimmed}"
                ),
            }
        }

        if profiles.is_empty() {
            warn!(
                target = "catalog.api",
                "no tenants configured; falling back to demo credentials"
            );
            let mut demo = TenantProfile::new("demo-empresa");
            demo.api_keys.push("demo-key".to_string());
            profiles.insert(demo.id.clone(), demo);
        }

        Self::with_tenants(profiles.into_values())
    }

    pub fn get(&self, tenant: &str) -> Option<Arc<TenantProfile>> {
        self.tenants.get(tenant).cloned()
    }

    pub fn authenticate(&self, presented: &str) -> Option<KeyRecord> {
        self.keys.get(presented).cloned()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }
}
