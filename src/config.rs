// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PATH: &str = "SOUNDBOX_CONFIG_PATH";
const ENV_BACKEND_URL: &str = "SOUNDBOX_BACKEND_URL";
const ENV_DB_PATH: &str = "SOUNDBOX_DB_PATH";
const ENV_BIND: &str = "SOUNDBOX_BIND";

const DEFAULT_PATH: &str = "config/soundbox.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub entitlement: EntitlementConfig,
    pub retention: RetentionConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api/".into(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/soundbox.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Background rule refresh period.
    pub rules_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rules_interval_secs: 12 * 60 * 60,
        }
    }
}

impl SyncConfig {
    pub fn rules_interval(&self) -> Duration {
        Duration::from_secs(self.rules_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EntitlementConfig {
    pub expiry_poll_secs: u64,
    /// Length of the local premium estimate granted before the server confirms.
    pub bridge_days: i64,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            expiry_poll_secs: 10,
            bridge_days: 30,
        }
    }
}

impl EntitlementConfig {
    pub fn expiry_poll(&self) -> Duration {
        Duration::from_secs(self.expiry_poll_secs.max(1))
    }

    pub fn bridge(&self) -> chrono::Duration {
        chrono::Duration::days(self.bridge_days.max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub locked_max_age_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            locked_max_age_secs: 30 * 60,
        }
    }
}

impl RetentionConfig {
    pub fn locked_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.locked_max_age_secs).unwrap_or(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8088".into(),
        }
    }
}

/// Load from an explicit TOML file, then apply env overrides.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let mut cfg: AppConfig = toml::from_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    apply_env(&mut cfg);
    Ok(cfg)
}

/// Load config using env var + fallbacks:
/// 1) $SOUNDBOX_CONFIG_PATH
/// 2) config/soundbox.toml
/// 3) built-in defaults
///
/// Env overrides are applied in every case.
pub fn load_default() -> Result<AppConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        }
        return Err(anyhow!("SOUNDBOX_CONFIG_PATH points to non-existent path"));
    }
    let default_p = PathBuf::from(DEFAULT_PATH);
    if default_p.exists() {
        return load_from(&default_p);
    }
    let mut cfg = AppConfig::default();
    apply_env(&mut cfg);
    Ok(cfg)
}

fn apply_env(cfg: &mut AppConfig) {
    if let Some(v) = env_nonempty(ENV_BACKEND_URL) {
        cfg.backend.base_url = v;
    }
    if let Some(v) = env_nonempty(ENV_DB_PATH) {
        cfg.store.path = PathBuf::from(v);
    }
    if let Some(v) = env_nonempty(ENV_BIND) {
        cfg.server.bind = v;
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn clear_env() {
        for k in [ENV_PATH, ENV_BACKEND_URL, ENV_DB_PATH, ENV_BIND] {
            env::remove_var(k);
        }
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [sync]
            rules_interval_secs = 60

            [retention]
            locked_max_age_secs = 900
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sync.rules_interval(), Duration::from_secs(60));
        assert_eq!(cfg.retention.locked_max_age(), chrono::Duration::minutes(15));
        assert_eq!(cfg.entitlement, EntitlementConfig::default());
        assert_eq!(cfg.backend.timeout_secs, 10);
    }

    #[test]
    fn defaults_match_product_windows() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.sync.rules_interval(), Duration::from_secs(43_200));
        assert_eq!(cfg.entitlement.expiry_poll(), Duration::from_secs(10));
        assert_eq!(cfg.entitlement.bridge(), chrono::Duration::days(30));
        assert_eq!(cfg.retention.locked_max_age(), chrono::Duration::minutes(30));
    }

    #[test]
    fn example_file_spells_out_the_defaults() {
        let cfg: AppConfig = toml::from_str(include_str!("../config/soundbox.example.toml")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        clear_env();

        // No file in the temp CWD: built-in defaults.
        assert_eq!(load_default().unwrap(), AppConfig::default());

        // Env path wins over config/soundbox.toml.
        fs::create_dir_all("config").unwrap();
        fs::write(DEFAULT_PATH, "[server]\nbind = \"0.0.0.0:1\"\n").unwrap();
        assert_eq!(load_default().unwrap().server.bind, "0.0.0.0:1");

        let p = tmp.path().join("other.toml");
        fs::write(&p, "[server]\nbind = \"0.0.0.0:2\"\n").unwrap();
        env::set_var(ENV_PATH, p.display().to_string());
        assert_eq!(load_default().unwrap().server.bind, "0.0.0.0:2");

        // Field overrides beat the file.
        env::set_var(ENV_BIND, "127.0.0.1:9999");
        env::set_var(ENV_DB_PATH, "/tmp/x.db");
        let cfg = load_default().unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9999");
        assert_eq!(cfg.store.path, PathBuf::from("/tmp/x.db"));

        env::set_var(ENV_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(load_default().is_err());

        clear_env();
        env::set_current_dir(&old).unwrap();
    }
}
