//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fileshare_daemon::transfer::SendOptions;
use fileshare_daemon::{Config, FileSender, PeerEntry, Service, UserPrompt};

/// Answers every question from a fixed script and counts consent requests.
#[derive(Default)]
pub struct ScriptedPrompt {
    pub accept: bool,
    pub save_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub file: Option<PathBuf>,
    pub asked: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn receiving_into(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            accept: true,
            save_dir: Some(dir.to_path_buf()),
            ..Self::default()
        })
    }

    pub fn declining() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sending(host: &str, file: &Path) -> Arc<Self> {
        Arc::new(Self {
            host: Some(host.to_string()),
            file: Some(file.to_path_buf()),
            ..Self::default()
        })
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl UserPrompt for ScriptedPrompt {
    fn confirm(&self, _title: &str, _message: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.accept
    }

    fn pick_save_directory(&self, _title: &str) -> Option<PathBuf> {
        self.save_dir.clone()
    }

    fn pick_open_file(&self, _title: &str) -> Option<PathBuf> {
        self.file.clone()
    }

    fn choose_from_list(&self, _title: &str, items: &[String]) -> Option<String> {
        let host = self.host.as_ref()?;
        items.iter().find(|item| *item == host).cloned()
    }
}

/// Loopback-only receiver config: ephemeral port, no mDNS.
pub fn loopback_config(send_receipts: bool) -> Config {
    Config {
        bind_host: "127.0.0.1".parse().unwrap(),
        listen_port: 0,
        advertise: false,
        send_receipts,
        prompt_timeout_secs: 5,
        ..Config::default()
    }
}

pub async fn start_receiver(prompt: Arc<ScriptedPrompt>, send_receipts: bool) -> (Service, SocketAddr) {
    let service = Service::new(loopback_config(send_receipts), prompt).unwrap();
    let addr = service.start().await.unwrap();
    (service, addr)
}

pub fn loopback_sender(prompt: Arc<ScriptedPrompt>, await_receipt: bool) -> FileSender {
    FileSender::new(
        prompt,
        SendOptions {
            await_receipt,
            linger: Duration::from_secs(10),
        },
    )
    .with_bind("127.0.0.1:0".parse().unwrap())
}

/// What a lookup would return for a host listening at `addr`.
pub fn peer_entry(host: &str, addr: SocketAddr) -> PeerEntry {
    let ip = match addr {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => Ipv4Addr::LOCALHOST,
    };
    PeerEntry {
        instance: format!("FileShare-{host}._fileshare._udp.local."),
        hostname: format!("{host}.local."),
        addrs: vec![ip],
        text: vec![format!(":{}", addr.port())],
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
