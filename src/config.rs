//! Environment-variable configuration.
//!
//! Every variable is optional; defaults match a single-node dev deployment.
//! Values are read once at startup and passed down by reference — nothing in
//! the node re-reads the environment after boot.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root for the KV store, state data and key material.
    pub data_dir: PathBuf,
    pub chain_id: String,
    /// This node's validator identity (empty = non-validator observer).
    pub validator_addr: String,
    pub validator_key: String,
    /// Peer-mesh websocket endpoint.
    pub mesh_endpoint: String,
    pub log_level: String,
    pub log_json: bool,
    pub api_enabled: bool,
    pub api_host: String,
    pub api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            chain_id: "oxy-gen-chain".into(),
            validator_addr: String::new(),
            validator_key: String::new(),
            mesh_endpoint: "ws://localhost:3001".into(),
            log_level: "info".into(),
            log_json: false,
            api_enabled: true,
            api_host: "localhost".into(),
            api_port: 8080,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            data_dir: PathBuf::from(env_or("OXY_DATA_DIR", "./data")),
            chain_id: env_or("OXY_CHAIN_ID", &d.chain_id),
            validator_addr: env_or("OXY_VALIDATOR_ADDR", ""),
            validator_key: env_or("OXY_VALIDATOR_KEY", ""),
            mesh_endpoint: env_or("OXY_MESH_ENDPOINT", &d.mesh_endpoint),
            log_level: env_or("OXY_LOG_LEVEL", &d.log_level),
            log_json: env_bool("OXY_LOG_JSON", false),
            api_enabled: env_bool("BLOCKCHAIN_API_ENABLED", true),
            api_host: env_or("BLOCKCHAIN_API_HOST", &d.api_host),
            api_port: env_or("BLOCKCHAIN_API_PORT", "8080").parse().unwrap_or(d.api_port),
        }
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => matches!(v.as_str(), "true" | "1" | "yes"),
        _ => default,
    }
}
