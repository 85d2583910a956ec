//! IES configuration
//!
//! Defaults, then the optional JSON file, then environment variables, then
//! command line flags.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use image_reconstruction::ReconstructionPolicy;
use waps_packet::{AecMap, EcEntry, MAX_AECS};

use crate::sinks::RetryPolicy;

pub const DEFAULT_HTTP_PORT: u16 = 18620;
const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_millis(2100);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IesConfig {
    /// Telemetry server, `host:port`
    pub server: Option<String>,
    pub tcp_timeout_secs: f64,
    pub output_path: PathBuf,
    pub command_path: PathBuf,
    /// Replay store file, `None` runs without persistence
    pub store_path: Option<PathBuf>,
    pub quiescence_secs: u64,
    pub abandon_after_mins: u64,
    pub sweep_interval_secs: u64,
    pub status_interval_secs: u64,
    pub accept_corrupted: bool,
    pub partial_images: bool,
    /// Tracked ECs, AEC ids 1..=4 follow list order
    pub ecs: Vec<EcEntry>,
    pub http_port: u16,
    pub nats_url: Option<String>,
    pub instance: String,
    pub sink_retry: RetryPolicy,
}

impl Default for IesConfig {
    fn default() -> Self {
        Self {
            server: None,
            tcp_timeout_secs: 2.1,
            output_path: PathBuf::from("output"),
            command_path: PathBuf::from("commands"),
            store_path: Some(PathBuf::from("store/fragments.jsonl")),
            quiescence_secs: 120,
            abandon_after_mins: 600,
            sweep_interval_secs: 60,
            status_interval_secs: 60,
            accept_corrupted: false,
            partial_images: true,
            ecs: Vec::new(),
            http_port: DEFAULT_HTTP_PORT,
            nats_url: None,
            instance: "waps-ies".into(),
            sink_retry: RetryPolicy::default(),
        }
    }
}

impl IesConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Apply `WAPS_IES_SERVER` and `WAPS_IES_HTTP_PORT` (falling back to `PORT`)
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    fn apply_env_from(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(server) = var("WAPS_IES_SERVER").filter(|s| !s.is_empty()) {
            self.server = Some(server);
        }
        let port = var("WAPS_IES_HTTP_PORT")
            .map(|v| ("WAPS_IES_HTTP_PORT", v))
            .or_else(|| var("PORT").map(|v| ("PORT", v)));
        if let Some((name, value)) = port {
            self.http_port = value.parse().map_err(|_| ConfigError::Env { var: name, value })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.quiescence_secs == 0 {
            return Err(ConfigError::Invalid("quiescence interval must be positive".into()));
        }
        let abandon_after_secs = self.abandon_after_mins.checked_mul(60).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "abandonment after {} min is out of range",
                self.abandon_after_mins
            ))
        })?;
        if abandon_after_secs < self.quiescence_secs {
            return Err(ConfigError::Invalid(format!(
                "abandonment after {} min is shorter than the {} s quiescence interval",
                self.abandon_after_mins, self.quiescence_secs
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("gap sweep interval must be positive".into()));
        }
        if !(self.tcp_timeout_secs > 0.0 && Duration::try_from_secs_f64(self.tcp_timeout_secs).is_ok()) {
            return Err(ConfigError::Invalid(format!(
                "TCP timeout must be positive, got {}",
                self.tcp_timeout_secs
            )));
        }
        if self.ecs.len() > MAX_AECS as usize {
            return Err(ConfigError::Invalid(format!(
                "at most {} ECs can be tracked, {} configured",
                MAX_AECS,
                self.ecs.len()
            )));
        }
        self.aec_map()?;
        self.policy()?;
        Ok(())
    }

    pub fn aec_map(&self) -> Result<AecMap> {
        AecMap::new(self.ecs.clone()).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn policy(&self) -> Result<ReconstructionPolicy> {
        let quiescence = i64::try_from(self.quiescence_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "quiescence interval of {} s is out of range",
                    self.quiescence_secs
                ))
            })?;
        let abandon_after = i64::try_from(self.abandon_after_mins)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "abandonment after {} min is out of range",
                    self.abandon_after_mins
                ))
            })?;
        let mut policy = ReconstructionPolicy::default()
            .with_quiescence(quiescence)
            .with_abandon_after(abandon_after)
            .with_accept_corrupted(self.accept_corrupted);
        policy.emit_partial_images = self.partial_images;
        Ok(policy)
    }

    /// Falls back to the default for values [`validate`](Self::validate) rejects
    pub fn tcp_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.tcp_timeout_secs)
            .ok()
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_TCP_TIMEOUT)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ies.json");
        std::fs::write(
            &path,
            r#"{"server": "10.0.0.5:9000", "ecs": [{"address": 171, "position": "EC_A4"}]}"#,
        )
        .unwrap();

        let config = IesConfig::load(&path).unwrap();
        assert_eq!(config.server.as_deref(), Some("10.0.0.5:9000"));
        assert_eq!(config.quiescence_secs, 120);
        assert_eq!(config.abandon_after_mins, 600);
        assert_eq!(config.tcp_timeout(), Duration::from_millis(2100));
        assert_eq!(config.aec_map().unwrap().len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_unparseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ies.json");
        std::fs::write(&path, "{ server").unwrap();
        assert!(matches!(IesConfig::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            IesConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> =
            HashMap::from([("WAPS_IES_SERVER", "host:1"), ("PORT", "9100")]);
        let mut config = IesConfig::default();
        config
            .apply_env_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.as_deref(), Some("host:1"));
        assert_eq!(config.http_port, 9100);

        let vars: HashMap<&str, &str> =
            HashMap::from([("WAPS_IES_HTTP_PORT", "9200"), ("PORT", "9100")]);
        config
            .apply_env_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.http_port, 9200);

        let err = config
            .apply_env_from(|name| (name == "WAPS_IES_HTTP_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "WAPS_IES_HTTP_PORT", .. }));
    }

    #[test]
    fn test_validate_rejects() {
        let zero = IesConfig {
            quiescence_secs: 0,
            ..IesConfig::default()
        };
        assert!(zero.validate().is_err());

        let short = IesConfig {
            quiescence_secs: 3600,
            abandon_after_mins: 30,
            ..IesConfig::default()
        };
        assert!(short.validate().is_err());

        let no_sweep = IesConfig {
            sweep_interval_secs: 0,
            ..IesConfig::default()
        };
        assert!(no_sweep.validate().is_err());

        let too_many = IesConfig {
            ecs: (0..5).map(|i| EcEntry::new(170 + i, format!("EC_{i}"))).collect(),
            ..IesConfig::default()
        };
        assert!(too_many.validate().is_err());

        let duplicate = IesConfig {
            ecs: vec![EcEntry::new(171, "EC_A4"), EcEntry::new(171, "EC_B1")],
            ..IesConfig::default()
        };
        assert!(duplicate.validate().is_err());
    }

    #[test]
    fn test_out_of_range_durations_are_errors() {
        let overflow = IesConfig {
            abandon_after_mins: u64::MAX,
            ..IesConfig::default()
        };
        assert!(matches!(overflow.validate(), Err(ConfigError::Invalid(_))));
        assert!(overflow.policy().is_err());

        let too_long = IesConfig {
            abandon_after_mins: i64::MAX as u64 / 60,
            ..IesConfig::default()
        };
        assert!(matches!(too_long.policy(), Err(ConfigError::Invalid(_))));

        let quiet_forever = IesConfig {
            quiescence_secs: u64::MAX,
            abandon_after_mins: u64::MAX / 60,
            ..IesConfig::default()
        };
        assert!(quiet_forever.validate().is_err());

        let huge_timeout = IesConfig {
            tcp_timeout_secs: 1e30,
            ..IesConfig::default()
        };
        assert!(huge_timeout.validate().is_err());
        assert_eq!(huge_timeout.tcp_timeout(), Duration::from_millis(2100));
    }

    #[test]
    fn test_policy_mapping() {
        let config = IesConfig {
            quiescence_secs: 30,
            abandon_after_mins: 5,
            accept_corrupted: true,
            partial_images: false,
            ..IesConfig::default()
        };
        let policy = config.policy().unwrap();
        assert_eq!(policy.quiescence, chrono::Duration::seconds(30));
        assert_eq!(policy.abandon_after, chrono::Duration::minutes(5));
        assert!(policy.accept_corrupted);
        assert!(!policy.emit_partial_images);
    }
}
