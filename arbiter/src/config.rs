//! Server configuration: a TOML file selected on the command line, overlaid
//! with the environment variables operators actually deploy with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{ensure, Context};
use color_eyre::Result;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub pool: ScalingConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Exported for the operator-side metrics surface; not served here
    pub metrics_port: Option<u16>,
    pub min_client_version: u32,
    pub download_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            metrics_port: None,
            min_client_version: 1,
            download_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub binary_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub threads: u32,
    pub hash_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("stockfish"),
            args: vec![],
            threads: 1,
            hash_mb: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub min_engines: usize,
    pub max_engines: usize,
    /// Queue length that triggers growing the pool
    pub scale_up_threshold: usize,
    /// Continuous idle time after which a surplus driver is drained
    pub scale_down_idle_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_engines: 1,
            max_engines: 4,
            scale_up_threshold: 2,
            scale_down_idle_ms: 60_000,
            sweep_interval_ms: 10_000,
        }
    }
}

impl ScalingConfig {
    pub fn scale_down_idle(&self) -> Duration {
        Duration::from_millis(self.scale_down_idle_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Static token table for deployments without an external verifier
    pub tokens: HashMap<String, StaticUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticUser {
    pub id: String,
    pub email: String,
}

impl Config {
    /// Reads the config file, overlays the process environment, and
    /// validates. A missing file is fine - defaults plus environment make a
    /// complete configuration; a file that fails to parse is not.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)
                .wrap_err_with(|| format!("while parsing config {}", path.display()))?,
            Err(err) => {
                warn!(?err, path = ?path, "Config file not readable, using defaults");
                Self::default()
            }
        };

        config.apply_env_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides; the environment wins over the file.
    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        override_var(&get, "PORT", &mut self.server.port);
        override_opt(&get, "METRICS_PORT", &mut self.server.metrics_port);
        override_var(&get, "MIN_CLIENT_VERSION", &mut self.server.min_client_version);
        override_var(&get, "DOWNLOAD_URL", &mut self.server.download_url);
        override_var(&get, "ENGINE_BINARY_PATH", &mut self.engine.binary_path);
        override_var(&get, "ENGINE_THREADS", &mut self.engine.threads);
        override_var(&get, "ENGINE_HASH_MB", &mut self.engine.hash_mb);
        override_var(&get, "MIN_ENGINES", &mut self.pool.min_engines);
        override_var(&get, "MAX_ENGINES", &mut self.pool.max_engines);
        override_var(&get, "SCALE_UP_THRESHOLD", &mut self.pool.scale_up_threshold);
        override_var(&get, "SCALE_DOWN_IDLE_MS", &mut self.pool.scale_down_idle_ms);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.pool.min_engines >= 1, "MIN_ENGINES must be at least 1");
        ensure!(
            self.pool.min_engines <= self.pool.max_engines,
            "MIN_ENGINES exceeds MAX_ENGINES"
        );
        ensure!(
            self.pool.scale_up_threshold >= 1,
            "SCALE_UP_THRESHOLD must be at least 1"
        );
        ensure!(self.engine.threads >= 1, "ENGINE_THREADS must be at least 1");
        ensure!(self.engine.hash_mb >= 1, "ENGINE_HASH_MB must be at least 1");

        // A pathed binary must exist up front; bare names resolve via PATH
        // at spawn time.
        let binary = &self.engine.binary_path;
        if binary.components().count() > 1 {
            ensure!(
                binary.is_file(),
                "engine binary not found: {}",
                binary.display()
            );
        }

        debug!("Configuration validated");
        Ok(())
    }
}

fn override_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: std::str::FromStr,
{
    match get(key).map(|raw| raw.parse()) {
        Some(Ok(value)) => *slot = value,
        Some(Err(_)) => warn!(key, "Ignoring unparsable environment override"),
        None => (),
    }
}

fn override_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Option<T>)
where
    T: std::str::FromStr,
{
    match get(key).map(|raw| raw.parse()) {
        Some(Ok(value)) => *slot = Some(value),
        Some(Err(_)) => warn!(key, "Ignoring unparsable environment override"),
        None => (),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.pool.min_engines, 1);
        assert_eq!(config.pool.max_engines, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_values_parse() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9100
            min_client_version = 3
            download_url = "https://example.invalid/app"

            [engine]
            binary_path = "stockfish"
            threads = 2
            hash_mb = 256

            [pool]
            min_engines = 2
            max_engines = 6

            [auth.tokens.valid]
            id = "u1"
            email = "a@b"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.engine.threads, 2);
        assert_eq!(config.pool.max_engines, 6);
        assert_eq!(config.pool.scale_up_threshold, 2);
        assert_eq!(config.auth.tokens["valid"].id, "u1");
    }

    #[test]
    fn environment_wins_over_file() {
        let mut config: Config = toml::from_str("[server]\nport = 9100\n").unwrap();

        let env: HashMap<&str, &str> = [
            ("PORT", "9500"),
            ("ENGINE_BINARY_PATH", "/opt/engine/bin"),
            ("MAX_ENGINES", "8"),
            ("METRICS_PORT", "9901"),
            ("SCALE_DOWN_IDLE_MS", "30000"),
        ]
        .into_iter()
        .collect();
        config.apply_env_from(|key| env.get(key).map(|v| (*v).to_owned()));

        assert_eq!(config.server.port, 9500);
        assert_eq!(config.engine.binary_path, PathBuf::from("/opt/engine/bin"));
        assert_eq!(config.pool.max_engines, 8);
        assert_eq!(config.server.metrics_port, Some(9901));
        assert_eq!(config.pool.scale_down_idle(), Duration::from_secs(30));
    }

    #[test]
    fn unparsable_override_is_ignored() {
        let mut config = Config::default();
        config.apply_env_from(|key| (key == "PORT").then(|| "not-a-port".to_owned()));
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn inverted_pool_bounds_are_rejected() {
        let mut config = Config::default();
        config.pool.min_engines = 5;
        config.pool.max_engines = 2;
        assert!(config.validate().is_err());
    }
}
