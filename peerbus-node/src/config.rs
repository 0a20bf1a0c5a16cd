//! Load config from file and environment.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use peerbus_core::CoreConfig;

/// Node configuration. File: ~/.config/peerbus/config.toml or /etc/peerbus/config.toml.
/// Env overrides: PEERBUS_LISTEN, PEERBUS_DISCOVERY_PORT, PEERBUS_DISCOVERY, PEERBUS_JOIN_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Bus addresses to listen on (default `tcp:addr=0.0.0.0,port=9955`).
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    #[serde(default = "default_true")]
    pub discovery_enabled: bool,
    /// Discovery UDP port (default 9956).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_beacon_interval")]
    pub beacon_interval_secs: u64,
    /// A remote advertisement not refreshed for this long is lost.
    #[serde(default = "default_advertisement_ttl")]
    pub advertisement_ttl_secs: u64,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
    #[serde(default = "default_link_timeout")]
    pub link_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Well-known names the daemon claims and advertises at startup.
    #[serde(default)]
    pub advertise: Vec<String>,
}

fn default_listen() -> Vec<String> {
    vec!["tcp:addr=0.0.0.0,port=9955".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_discovery_port() -> u16 {
    9956
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 37, 41)
}
fn default_beacon_interval() -> u64 {
    4
}
fn default_advertisement_ttl() -> u64 {
    16
}
fn default_tick_interval() -> u64 {
    250
}
fn default_join_timeout() -> u64 {
    30
}
fn default_link_timeout() -> u64 {
    40
}
fn default_handshake_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            discovery_enabled: default_true(),
            discovery_port: default_discovery_port(),
            multicast_group: default_multicast_group(),
            beacon_interval_secs: default_beacon_interval(),
            advertisement_ttl_secs: default_advertisement_ttl(),
            tick_interval_ms: default_tick_interval(),
            join_timeout_secs: default_join_timeout(),
            link_timeout_secs: default_link_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            advertise: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("bad value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

impl Config {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Whole seconds expressed in core ticks, at least one.
    pub fn secs_to_ticks(&self, secs: u64) -> u64 {
        (secs.saturating_mul(1000) / self.tick_interval_ms.max(1)).max(1)
    }

    pub fn ticks_to_secs(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(self.tick_interval_ms.max(1)) / 1000
    }

    /// Timing settings converted for the core, which counts ticks.
    pub fn core_config(&self) -> CoreConfig {
        let link = self.secs_to_ticks(self.link_timeout_secs);
        CoreConfig {
            join_timeout_ticks: self.secs_to_ticks(self.join_timeout_secs),
            // four pings per link timeout
            heartbeat_ticks: (link / 4).max(1),
            link_timeout_ticks: link,
            advertisement_ttl_ticks: self.secs_to_ticks(self.advertisement_ttl_secs),
        }
    }

    /// Apply environment overrides read through `var`.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("PEERBUS_LISTEN") {
            self.listen = s
                .split(';')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(s) = var("PEERBUS_DISCOVERY_PORT") {
            self.discovery_port = s.parse().map_err(|_| ConfigError::Env {
                var: "PEERBUS_DISCOVERY_PORT",
                value: s.clone(),
            })?;
        }
        if let Some(s) = var("PEERBUS_DISCOVERY") {
            self.discovery_enabled = match s.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: "PEERBUS_DISCOVERY",
                        value: s,
                    })
                }
            };
        }
        if let Some(s) = var("PEERBUS_JOIN_TIMEOUT_SECS") {
            self.join_timeout_secs = s.parse().map_err(|_| ConfigError::Env {
                var: "PEERBUS_JOIN_TIMEOUT_SECS",
                value: s.clone(),
            })?;
        }
        Ok(())
    }
}

/// Load config: defaults, then `path` or the first existing default file, then env vars.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match path {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerbus/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerbus/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn file_values_override_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
listen = ["tcp:addr=127.0.0.1,port=7000"]
discovery_enabled = false
join_timeout_secs = 5
advertise = ["org.example.Chat"]
"#
        )
        .unwrap();
        let c = load_file(f.path()).unwrap();
        assert_eq!(c.listen, vec!["tcp:addr=127.0.0.1,port=7000"]);
        assert!(!c.discovery_enabled);
        assert_eq!(c.join_timeout_secs, 5);
        assert_eq!(c.advertise, vec!["org.example.Chat"]);
        assert_eq!(c.discovery_port, 9956);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "proxy_port = 3128").unwrap();
        assert!(matches!(load_file(f.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(load(Some(&missing)), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PEERBUS_LISTEN", "tcp:addr=127.0.0.1,port=1; unix:path=/tmp/b.sock"),
            ("PEERBUS_DISCOVERY", "0"),
            ("PEERBUS_DISCOVERY_PORT", "4000"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.listen.len(), 2);
        assert!(!c.discovery_enabled);
        assert_eq!(c.discovery_port, 4000);

        let bad = |k: &str| (k == "PEERBUS_JOIN_TIMEOUT_SECS").then(|| "soon".to_string());
        assert!(matches!(
            Config::default().apply_env(bad),
            Err(ConfigError::Env { var: "PEERBUS_JOIN_TIMEOUT_SECS", .. })
        ));
    }

    #[test]
    fn core_config_counts_ticks() {
        let c = Config {
            tick_interval_ms: 500,
            join_timeout_secs: 30,
            link_timeout_secs: 40,
            ..Config::default()
        };
        let core = c.core_config();
        assert_eq!(core.join_timeout_ticks, 60);
        assert_eq!(core.link_timeout_ticks, 80);
        assert_eq!(core.heartbeat_ticks, 20);
        assert_eq!(c.ticks_to_secs(80), 40);
    }
}
