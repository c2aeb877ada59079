use std::{fmt::Debug, net::SocketAddr};

use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub env: String,
    pub instance_id: Option<String>,
    pub listen_addr: String,
    pub structured_logging: bool,
    /// Base URL of the origin store; object keys are resolved against it.
    pub origin_url: String,
    pub origin_connect_timeout_secs: u64,
    /// Object served for requests to `/`.
    pub index_object: Option<String>,
    pub primary_store: BlobStorageConfig,
    pub mirror: MirrorConfig,
    pub edge_cache: EdgeCacheConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            env: "local".to_string(),
            instance_id: None,
            listen_addr: "0.0.0.0:8787".to_string(),
            structured_logging: false,
            origin_url: "http://localhost:9000/".to_string(),
            origin_connect_timeout_secs: 10,
            index_object: None,
            primary_store: BlobStorageConfig::default(),
            mirror: MirrorConfig::default(),
            edge_cache: EdgeCacheConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Sizing of copy-on-read transfers into the primary store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Part boundaries are multiples of this; objects smaller than it are
    /// mirrored with a single write.
    pub chunk_alignment: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_parts: u64,
    /// Ceiling on simultaneous part transfers; keep it below the host's
    /// outbound connection limit.
    pub part_concurrency: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        MirrorConfig {
            chunk_alignment: 8 * MIB,
            min_chunk_size: 5 * MIB,
            max_chunk_size: 5 * GIB,
            max_parts: 5,
            part_concurrency: 5,
        }
    }
}

impl MirrorConfig {
    pub fn single_shot_threshold(&self) -> u64 {
        self.chunk_alignment
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeCacheConfig {
    pub enabled: bool,
    pub max_entry_bytes: u64,
    /// `cache-control` forced onto cached 200 responses.
    pub cache_control: String,
}

impl Default for EdgeCacheConfig {
    fn default() -> Self {
        EdgeCacheConfig {
            enabled: true,
            max_entry_bytes: 16 * MIB,
            cache_control: "public, max-age=0, must-revalidate".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    pub endpoint: Option<String>,
}

impl GatewayConfig {
    pub fn from_path(path: &str) -> Result<GatewayConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: GatewayConfig = Self::figment()
            .merge(Yaml::string(&config_str))
            .merge(Self::env_overrides())
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<GatewayConfig> {
        let config: GatewayConfig = Self::figment().merge(Self::env_overrides()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(GatewayConfig::default()))
    }

    fn env_overrides() -> Env {
        Env::prefixed("MIRROR_GATEWAY_").split("__")
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, std::process::id()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        let origin = self
            .origin_url
            .parse::<Url>()
            .map_err(|e| anyhow!("invalid origin url {}: {}", self.origin_url, e))?;
        if origin.cannot_be_a_base() {
            return Err(anyhow!("origin url cannot be a base: {}", self.origin_url));
        }

        let mirror = &self.mirror;
        if mirror.chunk_alignment == 0 {
            return Err(anyhow!("mirror.chunk_alignment must be positive"));
        }
        if mirror.min_chunk_size > mirror.max_chunk_size {
            return Err(anyhow!(
                "mirror.min_chunk_size {} exceeds mirror.max_chunk_size {}",
                mirror.min_chunk_size,
                mirror.max_chunk_size
            ));
        }
        if mirror.chunk_alignment < mirror.min_chunk_size
            || mirror.chunk_alignment > mirror.max_chunk_size
        {
            return Err(anyhow!(
                "mirror.chunk_alignment {} must lie within [{}, {}]",
                mirror.chunk_alignment,
                mirror.min_chunk_size,
                mirror.max_chunk_size
            ));
        }
        if mirror.max_parts == 0 {
            return Err(anyhow!("mirror.max_parts must be positive"));
        }
        if mirror.part_concurrency == 0 {
            return Err(anyhow!("mirror.part_concurrency must be positive"));
        }
        Ok(())
    }
}
