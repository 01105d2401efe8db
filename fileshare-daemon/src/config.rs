//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/fileshare/config.toml or /etc/fileshare/config.toml.
/// Every field can be overridden by a `FILESHARE_*` environment variable.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listener bind host (default 0.0.0.0).
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    /// QUIC listen port, advertised as the text record suffix (default 9909).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Port carried in the mDNS service record (default 9908).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Announce this host over mDNS while running (default true). With it off the
    /// listener is still reachable by address.
    #[serde(default = "default_advertise")]
    pub advertise: bool,
    /// Service instance prefix (default "FileShare").
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Advertised host name; system host name when unset.
    #[serde(default)]
    pub hostname: Option<String>,
    /// How long a lookup collects answers.
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    /// How long an inbound transfer waits for consent before it is rejected.
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,
    /// Receiver writes a receipt frame after each transfer.
    #[serde(default)]
    pub send_receipts: bool,
    /// Sender waits for and verifies the receipt.
    #[serde(default)]
    pub await_receipt: bool,
    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    /// Accept every inbound file into this directory without prompting.
    #[serde(default)]
    pub auto_accept_dir: Option<PathBuf>,
}

fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_listen_port() -> u16 {
    9909
}
fn default_discovery_port() -> u16 {
    9908
}
fn default_advertise() -> bool {
    true
}
fn default_service_name() -> String {
    "FileShare".to_string()
}
fn default_lookup_timeout_ms() -> u64 {
    1000
}
fn default_prompt_timeout_secs() -> u64 {
    120
}
fn default_receipt_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            listen_port: default_listen_port(),
            discovery_port: default_discovery_port(),
            advertise: default_advertise(),
            service_name: default_service_name(),
            hostname: None,
            lookup_timeout_ms: default_lookup_timeout_ms(),
            prompt_timeout_secs: default_prompt_timeout_secs(),
            send_receipts: false,
            await_receipt: false,
            receipt_timeout_ms: default_receipt_timeout_ms(),
            auto_accept_dir: None,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.listen_port)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    /// Text record advertised next to the service; the first entry is the listen port suffix.
    pub fn text_records(&self) -> Vec<String> {
        vec![format!(":{}", self.listen_port)]
    }

    /// Configured host name, else the system one, else a fixed fallback.
    pub fn resolved_hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(system_hostname)
            .unwrap_or_else(|| "fileshare-host".to_string())
    }

    /// Apply `FILESHARE_*` overrides from an arbitrary lookup (the process environment in `load`).
    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&get, "FILESHARE_BIND_HOST") {
            self.bind_host = v;
        }
        if let Some(v) = parse_env(&get, "FILESHARE_LISTEN_PORT") {
            self.listen_port = v;
        }
        if let Some(v) = parse_env(&get, "FILESHARE_DISCOVERY_PORT") {
            self.discovery_port = v;
        }
        if let Some(v) = parse_env(&get, "FILESHARE_ADVERTISE") {
            self.advertise = v;
        }
        if let Some(v) = get("FILESHARE_SERVICE_NAME") {
            self.service_name = v;
        }
        if let Some(v) = get("FILESHARE_HOSTNAME") {
            self.hostname = Some(v);
        }
        if let Some(v) = parse_env(&get, "FILESHARE_LOOKUP_TIMEOUT_MS") {
            self.lookup_timeout_ms = v;
        }
        if let Some(v) = parse_env(&get, "FILESHARE_PROMPT_TIMEOUT_SECS") {
            self.prompt_timeout_secs = v;
        }
        if let Some(v) = parse_env(&get, "FILESHARE_SEND_RECEIPTS") {
            self.send_receipts = v;
        }
        if let Some(v) = parse_env(&get, "FILESHARE_AWAIT_RECEIPT") {
            self.await_receipt = v;
        }
        if let Some(v) = parse_env(&get, "FILESHARE_RECEIPT_TIMEOUT_MS") {
            self.receipt_timeout_ms = v;
        }
        if let Some(v) = get("FILESHARE_AUTO_ACCEPT_DIR") {
            self.auto_accept_dir = Some(PathBuf::from(v));
        }
    }
}

fn parse_env<T, F>(get: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = get(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring malformed environment override");
            None
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/fileshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/fileshare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed config file");
            None
        }
    }
}

fn system_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
