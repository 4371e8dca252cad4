//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration. File: ~/.config/lanchat/config.toml or
/// /etc/lanchat/config.toml. Env overrides: LANCHAT_MESSAGE_PORT,
/// LANCHAT_SUBSCRIBER_PORT, LANCHAT_CACHE_DIR, LANCHAT_DNS_SERVER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Primary message TCP port (default 50311).
    #[serde(default = "default_message_port")]
    pub message_port: u16,
    /// Passive subscriber TCP port (default 50312).
    #[serde(default = "default_subscriber_port")]
    pub subscriber_port: u16,
    /// Directory holding the offline buffer and received files.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Delay between listener restart attempts.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Restarts before the listener manager stops for good.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// How long a start attempt may take before it counts as failed.
    #[serde(default = "default_liveness_delay_ms")]
    pub liveness_delay_ms: u64,
    /// Minimum interval between file-transfer progress acks.
    #[serde(default = "default_ack_interval_ms")]
    pub ack_interval_ms: u64,
    /// Overlay DNS resolver for reverse lookups.
    #[serde(default = "default_dns_server")]
    pub dns_server: String,
    /// Reverse-lookup attempts per address.
    #[serde(default = "default_dns_attempts")]
    pub dns_attempts: u32,
    /// Overall reverse-lookup budget per address.
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,
}

fn default_message_port() -> u16 {
    50311
}
fn default_subscriber_port() -> u16 {
    50312
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/lanchat")
}
fn default_restart_delay_ms() -> u64 {
    2000
}
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_liveness_delay_ms() -> u64 {
    10_000
}
fn default_ack_interval_ms() -> u64 {
    500
}
fn default_dns_server() -> String {
    "100.100.100.100:53".to_string()
}
fn default_dns_attempts() -> u32 {
    3
}
fn default_dns_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            message_port: default_message_port(),
            subscriber_port: default_subscriber_port(),
            cache_dir: default_cache_dir(),
            restart_delay_ms: default_restart_delay_ms(),
            max_restart_attempts: default_max_restart_attempts(),
            liveness_delay_ms: default_liveness_delay_ms(),
            ack_interval_ms: default_ack_interval_ms(),
            dns_server: default_dns_server(),
            dns_attempts: default_dns_attempts(),
            dns_timeout_ms: default_dns_timeout_ms(),
        }
    }
}

impl Config {
    /// The flat offline-buffer file.
    pub fn buffer_path(&self) -> PathBuf {
        self.cache_dir.join(".lanchat_buffer")
    }

    /// Where received files land, keyed by filename (last writer wins).
    pub fn transfer_dir(&self) -> PathBuf {
        self.cache_dir.join("files")
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn liveness_delay(&self) -> Duration {
        Duration::from_millis(self.liveness_delay_ms)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("LANCHAT_MESSAGE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.message_port = p;
        }
    }
    if let Ok(s) = std::env::var("LANCHAT_SUBSCRIBER_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.subscriber_port = p;
        }
    }
    if let Ok(s) = std::env::var("LANCHAT_CACHE_DIR") {
        if !s.is_empty() {
            c.cache_dir = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("LANCHAT_DNS_SERVER") {
        if !s.is_empty() {
            c.dns_server = s;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
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
