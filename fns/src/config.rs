use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CodeError;

/// Environment variable selecting the active configuration profile. When
/// set, `fns-{profile}.json` is shallow-merged over `fns.json`.
pub const ACTIVE_ENV: &str = "FNS-ACTIVE";

/// Development fallback for `runtime.secretKey`. Deterministic so that a
/// cluster of unconfigured processes can still talk to itself; never ship
/// it.
pub const DEFAULT_SECRET_KEY: &str = "fns-dev-secret";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Process name, shared by every node of the application.
    pub name: String,
    /// Process version, used for accepted-version routing.
    pub version: String,
    pub runtime: RuntimeConfig,
    pub transport: TransportConfig,
    pub cluster: ClusterConfig,
    pub proxy: ProxyConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "fns".to_string(),
            version: "0.1.0".to_string(),
            runtime: RuntimeConfig::default(),
            transport: TransportConfig::default(),
            cluster: ClusterConfig::default(),
            proxy: ProxyConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load `fns.json` from `dir`, overlaying `fns-{profile}.json` when the
    /// `FNS-ACTIVE` profile is set. Missing files fall back to defaults.
    pub fn load(dir: &Path) -> Result<Self, CodeError> {
        let mut value = read_json(&dir.join("fns.json"))?.unwrap_or(serde_json::Value::Null);
        if let Ok(active) = std::env::var(ACTIVE_ENV) {
            let active = active.trim();
            if !active.is_empty() {
                if let Some(overlay) = read_json(&dir.join(format!("fns-{active}.json")))? {
                    merge(&mut value, overlay);
                }
            }
        }
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
            .map_err(|e| CodeError::internal(format!("config does not decode: {e}")))
    }
}

fn read_json(path: &Path) -> Result<Option<serde_json::Value>, CodeError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)
        .map_err(|e| CodeError::internal(format!("config '{}': {e}", path.display())))?;
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| CodeError::internal(format!("config '{}': {e}", path.display())))?;
    Ok(Some(value))
}

fn merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub max_workers: usize,
    pub worker_max_idle_seconds: u64,
    pub handle_timeout_seconds: u64,
    pub auto_max_procs: AutoMaxProcs,
    pub secret_key: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: 262_144,
            worker_max_idle_seconds: 60,
            handle_timeout_seconds: 10,
            auto_max_procs: AutoMaxProcs::default(),
            secret_key: DEFAULT_SECRET_KEY.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn handle_timeout(&self) -> Duration {
        Duration::from_secs(self.handle_timeout_seconds.max(1))
    }

    pub fn worker_max_idle(&self) -> Duration {
        Duration::from_secs(self.worker_max_idle_seconds.max(1))
    }
}

/// Bounds on scheduler threads; zero leaves the side to the host.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoMaxProcs {
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Listen port; zero picks 80, or 443 when TLS is configured.
    pub port: u16,
    pub cors: CorsConfig,
    pub tls: TlsConfig,
    pub middlewares: MiddlewaresConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 0,
            cors: CorsConfig::default(),
            tls: TlsConfig::default(),
            middlewares: MiddlewaresConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            self.port
        } else if self.tls.kind == "DEFAULT" {
            80
        } else {
            443
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allow_credentials: false,
            max_age_seconds: 86_400,
        }
    }
}

/// TLS material loading is delegated to the host; the kind string selects
/// the loader. `DEFAULT` means plain TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
    pub kind: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            kind: "DEFAULT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MiddlewaresConfig {
    pub rate_limit: RateLimitConfig,
    pub idempotent: IdempotentConfig,
    pub cache: CacheControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max: i64,
    pub window_seconds: u64,
    pub retry_after_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max: 100,
            window_seconds: 10,
            retry_after_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdempotentConfig {
    pub enabled: bool,
    pub ticket_ttl_seconds: u64,
}

impl Default for IdempotentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ticket_ttl_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheControlConfig {
    pub enabled: bool,
    /// TTL of merged peer documents in proxy mode.
    pub ttl_seconds: u64,
}

impl Default for CacheControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster builder kind; empty runs standalone.
    pub kind: String,
    pub fetch_members_interval_seconds: u64,
    /// Peer addresses for the built-in `members` kind.
    pub members: Vec<String>,
    pub shared: SharedConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kind: String::new(),
            fetch_members_interval_seconds: 10,
            members: Vec::new(),
            shared: SharedConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn fetch_members_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_members_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SharedConfig {
    pub barrier_disabled: bool,
    pub barrier_ttl_milliseconds: u64,
    /// Tunnel all shared calls to this peer instead of serving them
    /// locally.
    pub remote: Option<RemoteSharedConfig>,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            barrier_disabled: false,
            barrier_ttl_milliseconds: 100,
            remote: None,
        }
    }
}

impl SharedConfig {
    pub fn barrier_ttl(&self) -> Duration {
        Duration::from_millis(self.barrier_ttl_milliseconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSharedConfig {
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfig {
    pub enable_dev_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.runtime.max_workers, 262_144);
        assert_eq!(config.runtime.handle_timeout(), Duration::from_secs(10));
        assert_eq!(config.cluster.fetch_members_interval_seconds, 10);
        assert_eq!(config.cluster.shared.barrier_ttl(), Duration::from_millis(100));
        assert_eq!(config.transport.effective_port(), 80);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "name": "billing",
                "runtime": { "maxWorkers": 64 },
                "transport": { "port": 8080 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.name, "billing");
        assert_eq!(config.runtime.max_workers, 64);
        assert_eq!(config.runtime.handle_timeout_seconds, 10);
        assert_eq!(config.transport.effective_port(), 8080);
    }

    #[test]
    fn test_profile_overlay() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fns.json"),
            r#"{ "name": "billing", "transport": { "port": 8080 } }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("fns-test.json"),
            r#"{ "transport": { "port": 9090 } }"#,
        )
        .unwrap();

        std::env::set_var(ACTIVE_ENV, "test");
        let config = Config::load(dir.path()).unwrap();
        std::env::remove_var(ACTIVE_ENV);

        assert_eq!(config.name, "billing");
        assert_eq!(config.transport.port, 9090);
    }
}
