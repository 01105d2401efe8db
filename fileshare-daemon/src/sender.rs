//! Interactive send: pick a discovered host and a file, dial, transfer, close.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::VarInt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::discovery::PeerEntry;
use crate::error::{DiscoveryError, SendError, TransferError};
use crate::prompt::{run_blocking, UserPrompt};
use crate::transfer::{send_over, OutgoingFile, SendOptions, SendReport};
use crate::transport::{open_stream, Transport};

/// How long a finished connection may take to drain before the dialer is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// One send at a time; clones share the guard.
#[derive(Clone)]
pub struct FileSender {
    prompt: Arc<dyn UserPrompt>,
    options: SendOptions,
    bind: SocketAddr,
    busy: Arc<Mutex<()>>,
}

impl FileSender {
    pub fn new(prompt: Arc<dyn UserPrompt>, options: SendOptions) -> Self {
        Self {
            prompt,
            options,
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            busy: Arc::new(Mutex::new(())),
        }
    }

    /// Local address outbound connections bind to (default 0.0.0.0:0).
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Full flow. `lookup` only runs once this sender is known to be idle; an empty
    /// result aborts before any prompt is shown or connection dialed.
    pub async fn run<F>(&self, lookup: F) -> Result<SendReport, SendError>
    where
        F: Future<Output = Result<Vec<PeerEntry>, DiscoveryError>>,
    {
        let _guard = self.busy.try_lock().map_err(|_| SendError::Busy)?;
        let peers = lookup.await?;
        if peers.is_empty() {
            info!("no peers found");
            return Err(SendError::NoPeers);
        }

        let names: Vec<String> = peers.iter().map(|p| p.display_name().to_string()).collect();
        let picked = run_blocking(self.prompt.clone(), move |prompt| {
            let host = prompt.choose_from_list("Send to which host?", &names)?;
            let file = prompt.pick_open_file("Choose a file to send")?;
            Some((host, file))
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "send prompt failed");
            SendError::Cancelled
        })?;
        let Some((host, path)) = picked else {
            info!("send cancelled");
            return Err(SendError::Cancelled);
        };

        let peer = peers
            .iter()
            .find(|p| p.display_name() == host)
            .ok_or_else(|| SendError::UnknownPeer(host.clone()))?;
        let addr = peer
            .dial_addr()
            .ok_or_else(|| SendError::NoDialAddress(host.clone()))?;
        self.send_to(addr, &path).await
    }

    /// Send one file to a known address. The file is opened before dialing.
    pub async fn send_to(&self, addr: SocketAddr, path: &Path) -> Result<SendReport, SendError> {
        let outgoing = OutgoingFile::open(path).await.map_err(|e| match e {
            TransferError::Io(source) => SendError::Source {
                path: path.to_path_buf(),
                source,
            },
            other => other.into(),
        })?;
        let file_name = outgoing.request.file_name.clone();
        let size = outgoing.request.file_size;

        let dialer = Transport::dialer(self.bind)?;
        let conn = dialer.dial(addr).await?;
        info!(%addr, file = %file_name, size, "sending");

        let result = async {
            let mut stream = open_stream(&conn).await?;
            Ok::<_, SendError>(send_over(&mut stream, outgoing, &self.options).await?)
        }
        .await;

        conn.close(VarInt::from_u32(0), b"done");
        if tokio::time::timeout(CLOSE_GRACE, dialer.wait_idle()).await.is_err() {
            debug!(%addr, "connection still draining");
        }
        match &result {
            Ok(report) => info!(
                %addr,
                file = %file_name,
                bytes = report.bytes_sent,
                acknowledged = report.receipt.is_some(),
                "send complete"
            ),
            Err(e) => warn!(%addr, file = %file_name, error = %e, "send failed"),
        }
        result
    }
}
