//! Load config from file and environment.

use std::path::PathBuf;

use duo_core::{DeviceKind, SessionKey};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/duo/config.toml or /etc/duo/config.toml.
/// Env overrides: DUO_DISCOVERY_PORT, DUO_TRANSPORT_PORT, DUO_DEVICE_NAME, DUO_KEY,
/// DUO_EXPANDED_NETWORKING, DUO_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 8889).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Peer transport (WebSocket) port (default 6996).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_device_kind")]
    pub device_kind: DeviceKind,
    /// Pre-shared key, base64. Without it frames are sent in plaintext.
    #[serde(default)]
    pub key: Option<SessionKey>,
    /// Accept and advertise overlay addresses, and dial non-private addresses.
    #[serde(default)]
    pub expanded_networking: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_true")]
    pub discovery_enabled: bool,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_discovery_port() -> u16 {
    8889
}
fn default_transport_port() -> u16 {
    6996
}
fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "duo-linux".to_string())
}
fn default_device_kind() -> DeviceKind {
    DeviceKind::Mobile
}
fn default_true() -> bool {
    true
}
fn home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
fn default_download_dir() -> PathBuf {
    home()
        .map(|h| h.join("Downloads/Duo"))
        .unwrap_or_else(|| PathBuf::from("/tmp/duo"))
}
fn default_state_file() -> PathBuf {
    home()
        .map(|h| h.join(".local/state/duo/session.json"))
        .unwrap_or_else(|| PathBuf::from("/tmp/duo/session.json"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            device_name: default_device_name(),
            device_kind: default_device_kind(),
            key: None,
            expanded_networking: false,
            auto_reconnect: true,
            discovery_enabled: true,
            download_dir: default_download_dir(),
            state_file: default_state_file(),
        }
    }
}

impl Config {
    /// Kind of device we expect on the other end.
    pub fn peer_kind(&self) -> DeviceKind {
        self.device_kind.counterpart()
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("DUO_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.discovery_port = p;
        }
        if let Some(p) = var("DUO_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.transport_port = p;
        }
        if let Some(name) = var("DUO_DEVICE_NAME").filter(|s| !s.trim().is_empty()) {
            self.device_name = name;
        }
        if let Some(key) = var("DUO_KEY").and_then(|s| SessionKey::from_base64(&s).ok()) {
            self.key = Some(key);
        }
        if let Some(flag) = var("DUO_EXPANDED_NETWORKING").and_then(|s| parse_flag(&s)) {
            self.expanded_networking = flag;
        }
        if let Some(dir) = var("DUO_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
            self.download_dir = PathBuf::from(dir);
        }
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|name| std::env::var(name).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = home() {
        out.push(h.join(".config/duo/config.toml"));
    }
    out.push(PathBuf::from("/etc/duo/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "Ignoring invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "Cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_uses_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.discovery_port, 8889);
        assert_eq!(c.transport_port, 6996);
        assert_eq!(c.device_kind, DeviceKind::Mobile);
        assert_eq!(c.peer_kind(), DeviceKind::Desktop);
        assert!(c.auto_reconnect);
        assert!(c.key.is_none());
    }

    #[test]
    fn file_values_and_key() {
        let key = SessionKey::generate();
        let text = format!(
            "transport_port = 7000\ndevice_kind = \"desktop\"\nkey = \"{}\"\nexpanded_networking = true\n",
            key.to_base64()
        );
        let c: Config = toml::from_str(&text).unwrap();
        assert_eq!(c.transport_port, 7000);
        assert_eq!(c.device_kind, DeviceKind::Desktop);
        assert_eq!(c.key, Some(key));
        assert!(c.expanded_networking);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let key = SessionKey::generate();
        let env: HashMap<&str, String> = HashMap::from([
            ("DUO_TRANSPORT_PORT", "7100".to_string()),
            ("DUO_DISCOVERY_PORT", "not-a-port".to_string()),
            ("DUO_KEY", key.to_base64()),
            ("DUO_EXPANDED_NETWORKING", "yes".to_string()),
        ]);
        let mut c = Config::default();
        c.apply_env(|name| env.get(name).cloned());
        assert_eq!(c.transport_port, 7100);
        assert_eq!(c.discovery_port, 8889);
        assert_eq!(c.key, Some(key));
        assert!(c.expanded_networking);
    }
}
