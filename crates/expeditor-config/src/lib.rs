use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub upstream: Upstream,
    #[serde(default)]
    pub menu_cache: MenuCache,
    #[serde(default)]
    pub idempotency: Idempotency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub rpc_url: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuCache {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Idempotency {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// When true, definitive upstream rejections are ledgered and replayed
    /// like successes. Off by default: a failed attempt stays retryable.
    #[serde(default)]
    pub record_failures: bool,
}

impl Default for MenuCache {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
        }
    }
}

impl Default for Idempotency {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            record_failures: false,
        }
    }
}

fn default_upstream_timeout_ms() -> u64 {
    5_000
}

fn default_ttl_ms() -> u64 {
    10 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.listen_addr.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "server.listen_addr must not be empty".to_string(),
        ));
    }
    if cfg.upstream.rpc_url.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "upstream.rpc_url must not be empty".to_string(),
        ));
    }
    if cfg.upstream.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "upstream.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.menu_cache.ttl_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "menu_cache.ttl_ms must be >= 1".to_string(),
        ));
    }
    if cfg.idempotency.ttl_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "idempotency.ttl_ms must be >= 1".to_string(),
        ));
    }
    if cfg.idempotency.sweep_interval_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "idempotency.sweep_interval_ms must be >= 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("expeditor-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

upstream:
  rpc_url: "http://127.0.0.1:8000/rpc"
  timeout_ms: 5000

menu_cache:
  ttl_ms: 600000

idempotency:
  ttl_ms: 600000
  sweep_interval_ms: 60000
  record_failures: false
"#
        .to_string()
    }

    #[test]
    fn accepts_complete_config() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("config should be accepted");
        assert_eq!(cfg.upstream.timeout_ms, 5000);
        assert_eq!(cfg.idempotency.ttl_ms, 600_000);
        assert!(!cfg.idempotency.record_failures);
    }

    #[test]
    fn defaults_apply_when_ttl_sections_are_omitted() {
        let yaml = r#"
server:
  listen_addr: "127.0.0.1:0"

upstream:
  rpc_url: "http://127.0.0.1:8000/rpc"
"#;
        let path = write_temp_config(yaml);
        let cfg = load_and_validate(&path).expect("defaults should apply");
        assert_eq!(cfg.menu_cache.ttl_ms, 600_000);
        assert_eq!(cfg.idempotency.sweep_interval_ms, 60_000);
        assert_eq!(cfg.upstream.timeout_ms, 5_000);
    }

    #[test]
    fn rejects_zero_idempotency_ttl() {
        let path = write_temp_config(&base_yaml().replace("ttl_ms: 600000", "ttl_ms: 0"));
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_missing_upstream_url() {
        let path = write_temp_config(
            &base_yaml().replace("rpc_url: \"http://127.0.0.1:8000/rpc\"\n", ""),
        );
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::Parse(_)
        ));
    }

    #[test]
    fn rejects_unknown_top_level_section() {
        let path = write_temp_config(&(base_yaml() + "\nmetrics:\n  enabled: true\n"));
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }
}
