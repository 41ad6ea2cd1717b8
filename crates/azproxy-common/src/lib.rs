use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_API_BASE: &str = "/v1";
pub const DEFAULT_API_VERSION: &str = "2024-02-01";
pub const DEFAULT_MAX_BODY_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid endpoint {0:?}: expected an absolute http(s) url")]
    InvalidEndpoint(String),
    #[error("invalid model mapping entry {0:?}: expected model=deployment")]
    InvalidMappingEntry(String),
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > config file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Normalized OpenAI API base, e.g. `/v1`. Empty means the root.
    pub api_base: String,
    /// Azure OpenAI resource endpoint, without a trailing slash.
    pub endpoint: String,
    /// Fallback key used when the caller does not supply one.
    pub api_key: Option<String>,
    pub api_version: String,
    /// Client model name -> Azure deployment name.
    pub model_mapping: BTreeMap<String, String>,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub cors: bool,
    pub max_body_bytes: usize,
    pub connect_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
}

/// Optional layer used for merging global config.
///
/// Also the shape of the JSON config file, so every field is optional there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_base: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub api_version: Option<String>,
    pub model_mapping: Option<BTreeMap<String, String>>,
    pub proxy: Option<String>,
    pub cors: Option<bool>,
    pub max_body_bytes: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.api_base.is_some() {
            self.api_base = other.api_base;
        }
        if other.endpoint.is_some() {
            self.endpoint = other.endpoint;
        }
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.api_version.is_some() {
            self.api_version = other.api_version;
        }
        // Mappings merge per model instead of replacing the whole table.
        if let Some(entries) = other.model_mapping {
            self.model_mapping
                .get_or_insert_with(BTreeMap::new)
                .extend(entries);
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.cors.is_some() {
            self.cors = other.cors;
        }
        if other.max_body_bytes.is_some() {
            self.max_body_bytes = other.max_body_bytes;
        }
        if other.connect_timeout_secs.is_some() {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
        if other.stream_idle_timeout_secs.is_some() {
            self.stream_idle_timeout_secs = other.stream_idle_timeout_secs;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let endpoint = self
            .endpoint
            .ok_or(GlobalConfigError::MissingField("endpoint"))?;
        let model_mapping = self.model_mapping.unwrap_or_default();
        for (model, deployment) in &model_mapping {
            validate_mapping_entry(model, deployment)?;
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            api_base: normalize_api_base(self.api_base.as_deref().unwrap_or(DEFAULT_API_BASE)),
            endpoint: normalize_endpoint(&endpoint)?,
            api_key: self.api_key.filter(|key| !key.trim().is_empty()),
            api_version: self
                .api_version
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            model_mapping,
            proxy: self.proxy,
            cors: self.cors.unwrap_or(false),
            max_body_bytes: self.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            connect_timeout_secs: self
                .connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            stream_idle_timeout_secs: self
                .stream_idle_timeout_secs
                .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            api_base: Some(value.api_base),
            endpoint: Some(value.endpoint),
            api_key: value.api_key,
            api_version: Some(value.api_version),
            model_mapping: Some(value.model_mapping),
            proxy: value.proxy,
            cors: Some(value.cors),
            max_body_bytes: Some(value.max_body_bytes),
            connect_timeout_secs: Some(value.connect_timeout_secs),
            stream_idle_timeout_secs: Some(value.stream_idle_timeout_secs),
        }
    }
}

/// Normalizes an API base to `/segment[/segment...]` with no trailing slash.
/// `""` and `"/"` both mean the root and normalize to `""`.
pub fn normalize_api_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    format!("/{trimmed}")
}

fn normalize_endpoint(raw: &str) -> Result<String, GlobalConfigError> {
    let endpoint = raw.trim().trim_end_matches('/');
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(endpoint.to_string()),
        _ => Err(GlobalConfigError::InvalidEndpoint(raw.to_string())),
    }
}

/// Parses `model=deployment` pairs separated by commas, e.g.
/// `gpt-3.5-turbo=gpt-35-turbo,gpt-4=gpt4-prod`.
pub fn parse_model_mapping(raw: &str) -> Result<BTreeMap<String, String>, GlobalConfigError> {
    let mut mapping = BTreeMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((model, deployment)) = entry.split_once('=') else {
            return Err(GlobalConfigError::InvalidMappingEntry(entry.to_string()));
        };
        let (model, deployment) = (model.trim(), deployment.trim());
        validate_mapping_entry(model, deployment)
            .map_err(|_| GlobalConfigError::InvalidMappingEntry(entry.to_string()))?;
        mapping.insert(model.to_string(), deployment.to_string());
    }
    Ok(mapping)
}

fn validate_mapping_entry(model: &str, deployment: &str) -> Result<(), GlobalConfigError> {
    // Deployment names land in the outbound path verbatim.
    if model.is_empty() || deployment.is_empty() || deployment.contains(['/', '?', '#']) {
        return Err(GlobalConfigError::InvalidMappingEntry(format!(
            "{model}={deployment}"
        )));
    }
    Ok(())
}
