//! Environment-driven configuration for both binaries.
//!
//! Required variables and the compiled-in defaults for every tunable are
//! enumerated in the external-interfaces section of the specification;
//! nothing here should need to change without a spec change.

use std::time::Duration;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Configuration shared by router and chunk server: just the database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection string. Required; every process in a
    /// deployment must point at the same database.
    pub url: String,
    /// Pool ceiling. Kept modest since both binaries are I/O-bound on
    /// chunk transfer, not on query volume.
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Load from `DATABASE_URL`. Fails fast if unset.
    pub fn from_env() -> anyhow::Result<Self> {
        let url = env_string("DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required"))?;
        Ok(Self {
            url,
            max_connections: 20,
        })
    }
}

/// Router process configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub database: DatabaseConfig,
    pub http_port: u16,
    pub heartbeat_timeout: Duration,
    pub ring_refresh_interval: Duration,
    pub connection_health_interval: Duration,
    pub reclamation_interval: Duration,
    pub session_ttl: Duration,
    pub virtual_nodes_per_server: usize,
    pub upload_timeout: Duration,
    pub download_timeout: Duration,
    pub reclamation_delete_timeout: Duration,
}

impl RouterConfig {
    /// Load from the environment, filling in compiled-in defaults for
    /// every tunable the spec doesn't require to be exposed.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            http_port: env_u16("HTTP_PORT", 8080),
            heartbeat_timeout: Duration::from_secs(30),
            ring_refresh_interval: Duration::from_secs(30),
            connection_health_interval: Duration::from_secs(10),
            reclamation_interval: Duration::from_secs(5 * 60),
            session_ttl: Duration::from_secs(60 * 60),
            virtual_nodes_per_server: 150,
            upload_timeout: Duration::from_secs(5 * 60),
            download_timeout: Duration::from_secs(10 * 60),
            reclamation_delete_timeout: Duration::from_secs(10),
        })
    }
}

/// Chunk-server process configuration.
#[derive(Debug, Clone)]
pub struct ChunkServerConfig {
    pub database: DatabaseConfig,
    pub server_id: String,
    pub grpc_port: u16,
    pub data_dir: std::path::PathBuf,
    pub heartbeat_interval: Duration,
    pub virtual_nodes_per_server: usize,
}

impl ChunkServerConfig {
    /// Load from the environment. `SERVER_ID` defaults to a fresh UUID
    /// so a server can be started without manual bookkeeping; operators
    /// who want a stable identity across restarts should set it
    /// explicitly.
    pub fn from_env() -> anyhow::Result<Self> {
        let server_id = env_string("SERVER_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let data_dir = env_string("DATA_DIR").unwrap_or_else(|| "./data".to_string());
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            server_id,
            grpc_port: env_u16("GRPC_PORT", 9090),
            data_dir: std::path::PathBuf::from(data_dir),
            heartbeat_interval: Duration::from_secs(10),
            virtual_nodes_per_server: 150,
        })
    }
}
