//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Signaling endpoint the transport connects through.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    /// Signaling host (default localhost).
    #[serde(default = "default_host")]
    pub host: String,
    /// Signaling port (default 9000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Signaling path (default "/").
    #[serde(default = "default_path")]
    pub path: String,
    /// Use TLS towards the signaling host (default false).
    #[serde(default)]
    pub secure: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_path() -> String {
    "/".to_string()
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            secure: false,
        }
    }
}

/// Peer configuration. File: ~/.config/tether/config.toml or
/// /etc/tether/config.toml. Env overrides: TETHER_HOST, TETHER_PORT,
/// TETHER_TICK_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Fixed peer identity; generated when absent.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Milliseconds per core tick (one protocol time unit, default 1000).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Request deadline in ticks.
    #[serde(default = "default_request_timeout_ticks")]
    pub request_timeout_ticks: u64,
    /// No-answer deadline for outbound calls in ticks.
    #[serde(default = "default_call_timeout_ticks")]
    pub call_timeout_ticks: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_request_timeout_ticks() -> u64 {
    tether_core::DEFAULT_REQUEST_TIMEOUT_TICKS
}
fn default_call_timeout_ticks() -> u64 {
    tether_core::DEFAULT_CALL_TIMEOUT_TICKS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: None,
            endpoint: Endpoint::default(),
            tick_interval_ms: default_tick_interval_ms(),
            request_timeout_ticks: default_request_timeout_ticks(),
            call_timeout_ticks: default_call_timeout_ticks(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("TETHER_HOST") {
        if !s.is_empty() {
            c.endpoint.host = s;
        }
    }
    if let Ok(s) = std::env::var("TETHER_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.endpoint.port = p;
        }
    }
    if let Ok(s) = std::env::var("TETHER_TICK_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.tick_interval_ms = ms;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tether/config.toml"));
    }
    out.push(PathBuf::from("/etc/tether/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.tick_interval_ms, 1000);
        assert_eq!(
            c.request_timeout_ticks,
            tether_core::DEFAULT_REQUEST_TIMEOUT_TICKS
        );
        assert_eq!(c.call_timeout_ticks, tether_core::DEFAULT_CALL_TIMEOUT_TICKS);
        assert_eq!(c.endpoint.port, 9000);
        assert!(!c.endpoint.secure);
    }

    #[test]
    fn file_fields_are_optional() {
        let c: Config = toml::from_str("tick_interval_ms = 50").unwrap();
        assert_eq!(c.tick_interval_ms, 50);
        assert_eq!(c.endpoint.host, "localhost");
    }
}
