use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    logger::LogConfig,
    plugin::{ControlOptions, RestartPolicy},
};

const PREFIX: &str = "ROUTER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config: invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("config: loading {}: {source}", .path.display())]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
}

/// Everything the `router` binary needs to boot.
///
/// Sources, later ones winning: defaults, the `.env` file, `ROUTER_*`
/// environment variables, command line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub addr: SocketAddr,
    pub registration_addr: SocketAddr,
    pub plugins_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub handshake_timeout: Duration,
    pub watch: bool,
    pub restart: RestartPolicy,
    /// `ROUTER_*` variables nobody understood. Reported once logging is up.
    #[serde(skip)]
    pub unknown_vars: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            registration_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            plugins_dir: PathBuf::from("./plugins"),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: "info".to_string(),
            handshake_timeout: Duration::from_secs(30),
            watch: true,
            restart: RestartPolicy::default(),
            unknown_vars: Vec::new(),
        }
    }
}

impl RouterConfig {
    /// Defaults, overlaid with `env_file` (when it exists) and the process
    /// environment.
    pub fn from_env(env_file: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = env_file.filter(|p| p.exists()) {
            dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let mut config = Self::default();
        config.apply_vars(env::vars())?;
        Ok(config)
    }

    /// Applies `ROUTER_*` pairs; other keys are ignored. Unknown `ROUTER_*`
    /// keys end up in `unknown_vars`.
    pub fn apply_vars<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(PREFIX) else {
                continue;
            };
            match name {
                "ADDR" => self.addr = parse(&key, &value)?,
                "REGISTRATION_ADDR" => self.registration_addr = parse(&key, &value)?,
                "PLUGINS_DIR" => self.plugins_dir = PathBuf::from(&value),
                "LOG_DIR" => {
                    self.log_dir = (!value.is_empty()).then(|| PathBuf::from(&value));
                }
                "LOG_LEVEL" => self.log_level = value,
                "HANDSHAKE_TIMEOUT" => {
                    self.handshake_timeout = Duration::from_secs(parse(&key, &value)?);
                }
                "WATCH" => self.watch = parse_bool(&key, &value)?,
                "MAX_RESTARTS" => {
                    self.restart.max_restarts = if value.is_empty() {
                        None
                    } else {
                        Some(parse(&key, &value)?)
                    };
                }
                "RESTART_BACKOFF_MS" => {
                    self.restart.initial_backoff = Duration::from_millis(parse(&key, &value)?);
                }
                "RESTART_MAX_BACKOFF_MS" => {
                    self.restart.max_backoff = Duration::from_millis(parse(&key, &value)?);
                }
                "RESTART_WINDOW_SECS" => {
                    self.restart.restart_window = Duration::from_secs(parse(&key, &value)?);
                }
                _ => self.unknown_vars.push(key),
            }
        }
        Ok(())
    }

    pub fn control_options(&self) -> ControlOptions {
        ControlOptions {
            registration_addr: self.registration_addr,
            handshake_timeout: self.handshake_timeout,
            restart: self.restart.clone(),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            log_level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            file_name: "router.log".to_string(),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let c = RouterConfig::default();
        assert_eq!(c.addr.port(), 7070);
        assert_eq!(c.registration_addr.port(), 0);
        assert_eq!(c.handshake_timeout, Duration::from_secs(30));
        assert!(c.watch);
        assert_eq!(c.restart.max_restarts, None);
    }

    #[test]
    fn applies_router_vars_only() {
        let mut c = RouterConfig::default();
        c.apply_vars(vars(&[
            ("ROUTER_ADDR", "127.0.0.1:9000"),
            ("ROUTER_PLUGINS_DIR", "/opt/plugins"),
            ("ROUTER_LOG_DIR", ""),
            ("ROUTER_HANDSHAKE_TIMEOUT", "5"),
            ("ROUTER_WATCH", "off"),
            ("ROUTER_MAX_RESTARTS", "3"),
            ("ROUTER_RESTART_BACKOFF_MS", "250"),
            ("ROUTER_COLOUR", "blue"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();

        assert_eq!(c.addr.port(), 9000);
        assert_eq!(c.plugins_dir, PathBuf::from("/opt/plugins"));
        assert_eq!(c.log_dir, None);
        assert_eq!(c.handshake_timeout, Duration::from_secs(5));
        assert!(!c.watch);
        assert_eq!(c.restart.max_restarts, Some(3));
        assert_eq!(c.restart.initial_backoff, Duration::from_millis(250));
        assert_eq!(c.unknown_vars, vec!["ROUTER_COLOUR".to_string()]);

        let opts = c.control_options();
        assert_eq!(opts.handshake_timeout, Duration::from_secs(5));
        assert_eq!(c.log_config().log_dir, None);
    }

    #[test]
    fn rejects_bad_values() {
        let mut c = RouterConfig::default();
        let err = c
            .apply_vars(vars(&[("ROUTER_HANDSHAKE_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        assert!(c.apply_vars(vars(&[("ROUTER_WATCH", "maybe")])).is_err());
        assert!(c.apply_vars(vars(&[("ROUTER_ADDR", "nowhere")])).is_err());
    }

    #[test]
    fn env_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "ROUTER_TEST_ONLY_MARKER=1\n").unwrap();

        RouterConfig::from_env(Some(&path)).unwrap();
        assert_eq!(env::var("ROUTER_TEST_ONLY_MARKER").unwrap(), "1");
    }
}
