//! LAN discovery over mDNS/DNS-SD: advertise this service, look up peers.
//!
//! Text records carry `":<listen port>"` as their first entry; a peer is dialed at
//! its first IPv4 address and that port.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::DiscoveryError;

pub const SERVICE_TYPE: &str = "_fileshare._udp.local.";
const TEXT_KEY_PREFIX: &str = "text.";

/// What this host announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvertisement {
    pub service_name: String,
    pub hostname: String,
    pub port: u16,
    pub text: Vec<String>,
}

impl ServiceAdvertisement {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service_name: config.service_name.clone(),
            hostname: short_hostname(&config.resolved_hostname()),
            port: config.discovery_port,
            text: config.text_records(),
        }
    }

    /// `<service_name>-<hostname>`, unique per host on the segment.
    pub fn instance_name(&self) -> String {
        format!("{}-{}", self.service_name, self.hostname)
    }

    fn mdns_host(&self) -> String {
        format!("{}.local.", self.hostname)
    }
}

/// First DNS label, without any `.local` suffix.
fn short_hostname(name: &str) -> String {
    name.trim_end_matches('.')
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// A resolved lookup answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub instance: String,
    pub hostname: String,
    pub addrs: Vec<Ipv4Addr>,
    pub text: Vec<String>,
}

impl PeerEntry {
    fn from_service_info(info: &ServiceInfo) -> Self {
        let mut addrs: Vec<Ipv4Addr> = info
            .get_addresses()
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        addrs.sort();
        let text = decode_text_records(
            info.get_properties()
                .iter()
                .map(|p| (p.key(), p.val_str())),
        );
        Self {
            instance: info.get_fullname().to_string(),
            hostname: info.get_hostname().to_string(),
            addrs,
            text,
        }
    }

    /// Host name as shown to users, without the trailing `.local.`.
    pub fn display_name(&self) -> &str {
        let name = self.hostname.trim_end_matches('.');
        name.strip_suffix(".local").unwrap_or(name)
    }

    /// First IPv4 address plus the port from the first text record.
    pub fn dial_addr(&self) -> Option<SocketAddr> {
        let ip = self.addrs.first()?;
        let port = parse_port_record(self.text.first()?)?;
        Some(SocketAddr::new(IpAddr::V4(*ip), port))
    }
}

/// Parse a `":9909"` text record.
pub fn parse_port_record(record: &str) -> Option<u16> {
    record.strip_prefix(':')?.parse().ok()
}

/// Ordered text entries become `text.0`, `text.1`, ... properties.
pub fn encode_text_records(text: &[String]) -> HashMap<String, String> {
    text.iter()
        .enumerate()
        .map(|(i, v)| (format!("{TEXT_KEY_PREFIX}{i}"), v.clone()))
        .collect()
}

/// Inverse of [`encode_text_records`]. Unknown keys are ignored; order follows the index.
pub fn decode_text_records<'a, I>(props: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut indexed: Vec<(usize, String)> = props
        .into_iter()
        .filter_map(|(k, v)| {
            let i = k.strip_prefix(TEXT_KEY_PREFIX)?.parse().ok()?;
            Some((i, v.to_string()))
        })
        .collect();
    indexed.sort_by_key(|(i, _)| *i);
    indexed.into_iter().map(|(_, v)| v).collect()
}

/// Add a lookup answer. A later answer for a known host replaces the earlier one in place.
pub fn merge_entry(entries: &mut Vec<PeerEntry>, entry: PeerEntry) {
    match entries.iter_mut().find(|e| e.hostname == entry.hostname) {
        Some(existing) => *existing = entry,
        None => entries.push(entry),
    }
}

/// Handle to a live advertisement. Pass to [`Discovery::shutdown`] to withdraw it.
#[derive(Debug)]
pub struct Advertisement {
    fullname: String,
}

impl Advertisement {
    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

/// mDNS responder and browser. At most one advertisement at a time.
pub struct Discovery {
    daemon: ServiceDaemon,
    advertised: Mutex<Option<String>>,
}

impl Discovery {
    pub fn new() -> Result<Self, DiscoveryError> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            advertised: Mutex::new(None),
        })
    }

    pub fn advertise(&self, ad: &ServiceAdvertisement) -> Result<Advertisement, DiscoveryError> {
        let mut advertised = self.advertised.lock();
        if advertised.is_some() {
            return Err(DiscoveryError::AlreadyAdvertising);
        }
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &ad.instance_name(),
            &ad.mdns_host(),
            "",
            ad.port,
            encode_text_records(&ad.text),
        )?
        .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info)?;
        info!(instance = %fullname, port = ad.port, text = ?ad.text, "advertising service");
        *advertised = Some(fullname.clone());
        Ok(Advertisement { fullname })
    }

    /// Withdraw an advertisement. The slot is freed even if the goodbye fails to send.
    pub fn shutdown(&self, ad: Advertisement) -> Result<(), DiscoveryError> {
        {
            let mut advertised = self.advertised.lock();
            if advertised.as_deref() == Some(ad.fullname.as_str()) {
                *advertised = None;
            }
        }
        self.daemon.unregister(&ad.fullname).map_err(|e| {
            warn!(instance = %ad.fullname, error = %e, "unregister failed");
            DiscoveryError::from(e)
        })?;
        info!(instance = %ad.fullname, "advertisement withdrawn");
        Ok(())
    }

    pub fn is_advertising(&self) -> bool {
        self.advertised.lock().is_some()
    }

    /// Browse for `timeout` and return every resolved peer, ourselves excluded.
    pub async fn lookup(&self, timeout: Duration) -> Result<Vec<PeerEntry>, DiscoveryError> {
        let events = self.daemon.browse(SERVICE_TYPE)?;
        let deadline = Instant::now() + timeout;
        let own = self.advertised.lock().clone();
        let mut entries = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, events.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let entry = PeerEntry::from_service_info(&info);
                    if own.as_deref() == Some(entry.instance.as_str()) {
                        continue;
                    }
                    debug!(host = %entry.hostname, addrs = ?entry.addrs, text = ?entry.text, "peer resolved");
                    merge_entry(&mut entries, entry);
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!(error = %e, "stop browse failed");
        }
        info!(peers = entries.len(), "lookup finished");
        Ok(entries)
    }
}

impl Discovery {
    /// Stop the responder thread. Later calls on this instance fail.
    pub fn close(&self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mdns daemon shutdown failed");
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(host: &str, ip: [u8; 4], text: &[&str]) -> PeerEntry {
        PeerEntry {
            instance: format!("FileShare-{host}.{SERVICE_TYPE}"),
            hostname: format!("{host}.local."),
            addrs: vec![Ipv4Addr::from(ip)],
            text: text.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn dial_addr_uses_first_ipv4_and_port_record() {
        let e = entry("alice-laptop", [192, 168, 1, 20], &[":9909"]);
        assert_eq!(e.dial_addr(), Some("192.168.1.20:9909".parse().unwrap()));
        assert_eq!(e.display_name(), "alice-laptop");

        assert_eq!(entry("a", [10, 0, 0, 1], &[]).dial_addr(), None);
        assert_eq!(entry("a", [10, 0, 0, 1], &["9909"]).dial_addr(), None);
        let mut no_addr = entry("a", [10, 0, 0, 1], &[":9909"]);
        no_addr.addrs.clear();
        assert_eq!(no_addr.dial_addr(), None);
    }

    #[test]
    fn text_records_keep_order() {
        let text = vec![":9909".to_string(), "v=1".to_string(), "x".to_string()];
        let props = encode_text_records(&text);
        assert_eq!(props.get("text.0").map(String::as_str), Some(":9909"));
        // HashMap iteration order is arbitrary; decoding restores it.
        let decoded = decode_text_records(props.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        assert_eq!(decoded, text);
        assert_eq!(
            decode_text_records([("other", "1"), ("text.x", "2"), ("text.1", "b"), ("text.0", "a")]),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn later_answer_overwrites_same_host() {
        let mut entries = Vec::new();
        merge_entry(&mut entries, entry("alice-laptop", [192, 168, 1, 20], &[":9909"]));
        merge_entry(&mut entries, entry("bob-desktop", [192, 168, 1, 30], &[":9909"]));
        merge_entry(&mut entries, entry("alice-laptop", [192, 168, 1, 21], &[":7000"]));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].hostname, "alice-laptop.local.");
        assert_eq!(entries[0].dial_addr(), Some("192.168.1.21:7000".parse().unwrap()));
        assert_eq!(entries[1].hostname, "bob-desktop.local.");
    }

    #[test]
    fn advertisement_from_config() {
        let config = Config {
            hostname: Some("alice-laptop.example.org".to_string()),
            listen_port: 7000,
            ..Config::default()
        };
        let ad = ServiceAdvertisement::from_config(&config);
        assert_eq!(ad.hostname, "alice-laptop");
        assert_eq!(ad.instance_name(), "FileShare-alice-laptop");
        assert_eq!(ad.mdns_host(), "alice-laptop.local.");
        assert_eq!(ad.port, 9908);
        assert_eq!(ad.text, vec![":7000".to_string()]);
    }

    #[test]
    fn parse_port_record_edge_cases() {
        assert_eq!(parse_port_record(":9909"), Some(9909));
        assert_eq!(parse_port_record(":"), None);
        assert_eq!(parse_port_record(":70000"), None);
        assert_eq!(parse_port_record(""), None);
    }

    #[tokio::test]
    async fn lookup_returns_within_its_timeout() {
        let discovery = match Discovery::new() {
            Ok(d) => d,
            Err(e) => {
                eprintln!("skipping, no mdns daemon: {e}");
                return;
            }
        };
        let started = std::time::Instant::now();
        let _ = discovery.lookup(Duration::from_millis(200)).await;
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(900), "returned after {elapsed:?}");
    }

    /// Needs a multicast-capable interface.
    #[tokio::test]
    #[ignore]
    async fn advertise_twice_then_withdraw() {
        let discovery = Discovery::new().unwrap();
        let ad = ServiceAdvertisement {
            service_name: "FileShare".to_string(),
            hostname: "fileshare-test".to_string(),
            port: 9908,
            text: vec![":9909".to_string()],
        };
        let handle = discovery.advertise(&ad).unwrap();
        assert!(matches!(
            discovery.advertise(&ad),
            Err(DiscoveryError::AlreadyAdvertising)
        ));
        let found = discovery.lookup(Duration::from_millis(500)).await.unwrap();
        assert!(found.iter().all(|p| p.instance != handle.fullname()));
        discovery.shutdown(handle).unwrap();
        assert!(!discovery.is_advertising());
        discovery.advertise(&ad).unwrap();
    }
}
