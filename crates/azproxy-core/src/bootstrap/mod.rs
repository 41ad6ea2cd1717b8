use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use azproxy_common::{GlobalConfig, GlobalConfigPatch, parse_model_mapping};

use crate::core::Core;
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "azproxy",
    version,
    about = "OpenAI-compatible reverse proxy for Azure OpenAI"
)]
pub struct CliArgs {
    /// JSON config file; flags and env vars override its fields.
    #[arg(long, env = "AZPROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind host.
    #[arg(long, env = "AZPROXY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "AZPROXY_PORT")]
    pub port: Option<String>,

    /// Path prefix of the OpenAI surface, e.g. `/v1`.
    #[arg(long, env = "AZPROXY_API_BASE")]
    pub api_base: Option<String>,

    /// Azure OpenAI resource endpoint, e.g. `https://my-res.openai.azure.com`.
    #[arg(long, env = "AZURE_OPENAI_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Fallback key used when the caller sends none.
    #[arg(long, env = "AZURE_OPENAI_API_KEY")]
    pub api_key: Option<String>,

    #[arg(long, env = "AZURE_OPENAI_API_VERSION")]
    pub api_version: Option<String>,

    /// `model=deployment` pairs, comma separated.
    #[arg(long, env = "AZURE_OPENAI_MODEL_MAPPER")]
    pub model_mapper: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "AZPROXY_PROXY")]
    pub proxy: Option<String>,

    /// Answer CORS preflights and allow any origin.
    #[arg(long, env = "AZPROXY_CORS")]
    pub cors: Option<String>,

    #[arg(long, env = "AZPROXY_MAX_BODY_BYTES")]
    pub max_body_bytes: Option<String>,

    #[arg(long, env = "AZPROXY_CONNECT_TIMEOUT_SECS")]
    pub connect_timeout_secs: Option<String>,

    /// Longest silence tolerated between two upstream body chunks.
    #[arg(long, env = "AZPROXY_STREAM_IDLE_TIMEOUT_SECS")]
    pub stream_idle_timeout_secs: Option<String>,
}

pub struct Bootstrap {
    pub config: GlobalConfig,
    pub core: Core,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let config = load_config(&args).await?;

    let client = WreqUpstreamClient::new(UpstreamClientConfig::from_global(&config))
        .context("build upstream client")?;
    let core = Core::from_config(&config, Arc::new(client)).context("register routes")?;

    Ok(Bootstrap { config, core })
}

/// Merges defaults < file < ENV < CLI. clap already resolves CLI over ENV
/// for each field, so the args become one patch laid over the file.
pub async fn load_config(args: &CliArgs) -> anyhow::Result<GlobalConfig> {
    let mut merged = match args.config.as_deref() {
        Some(path) => read_config_file(path).await?,
        None => GlobalConfigPatch::default(),
    };
    merged.overlay(cli_patch(args)?);
    merged
        .into_config()
        .context("finalize merged global config")
}

async fn read_config_file(path: &Path) -> anyhow::Result<GlobalConfigPatch> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read config file {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse config file {}", path.display()))
}

fn cli_patch(args: &CliArgs) -> anyhow::Result<GlobalConfigPatch> {
    let model_mapping = match sanitize_optional_env_value(args.model_mapper.clone()) {
        Some(raw) => Some(
            parse_model_mapping(&raw).context("invalid AZURE_OPENAI_MODEL_MAPPER value")?,
        ),
        None => None,
    };
    Ok(GlobalConfigPatch {
        host: sanitize_optional_env_value(args.host.clone()),
        port: parse_u16_env_value(args.port.clone(), "AZPROXY_PORT")?,
        api_base: sanitize_optional_env_value(args.api_base.clone()),
        endpoint: sanitize_optional_env_value(args.endpoint.clone()),
        api_key: sanitize_optional_env_value(args.api_key.clone()),
        api_version: sanitize_optional_env_value(args.api_version.clone()),
        model_mapping,
        proxy: sanitize_optional_env_value(args.proxy.clone()),
        cors: parse_bool_env_value(args.cors.clone(), "AZPROXY_CORS")?,
        max_body_bytes: parse_number_env_value(
            args.max_body_bytes.clone(),
            "AZPROXY_MAX_BODY_BYTES",
        )?,
        connect_timeout_secs: parse_number_env_value(
            args.connect_timeout_secs.clone(),
            "AZPROXY_CONNECT_TIMEOUT_SECS",
        )?,
        stream_idle_timeout_secs: parse_number_env_value(
            args.stream_idle_timeout_secs.clone(),
            "AZPROXY_STREAM_IDLE_TIMEOUT_SECS",
        )?,
    })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems may inject unresolved placeholders like `${VAR}`.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    parse_number_env_value(value, env_name)
}

fn parse_number_env_value<T>(value: Option<String>, env_name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<T>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}
