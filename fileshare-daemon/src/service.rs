//! Service lifecycle: advertise, listen, route inbound streams; drive outbound sends.

use std::net::SocketAddr;
use std::sync::Arc;

use fileshare_core::RouteKey;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery::{Advertisement, Discovery, PeerEntry, ServiceAdvertisement};
use crate::error::{DiscoveryError, SendError, ServiceError, TransportError};
use crate::prompt::UserPrompt;
use crate::router::{self, Router};
use crate::sender::FileSender;
use crate::transfer::{FileReceiver, ReceiveOptions, SendOptions, SendReport};
use crate::transport::{Identity, Transport};

struct Running {
    discovery: Option<Arc<Discovery>>,
    advertisement: Option<Advertisement>,
    transport: Transport,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

pub struct Service {
    config: Config,
    identity: Identity,
    prompt: Arc<dyn UserPrompt>,
    sender: FileSender,
    running: Mutex<Option<Running>>,
}

impl Service {
    /// Generates this process's identity; nothing is bound until `start`.
    pub fn new(config: Config, prompt: Arc<dyn UserPrompt>) -> Result<Self, ServiceError> {
        let identity = Identity::generate_ephemeral().map_err(ServiceError::from)?;
        let sender = FileSender::new(
            prompt.clone(),
            SendOptions {
                await_receipt: config.await_receipt,
                linger: config.prompt_timeout() + config.receipt_timeout(),
            },
        );
        Ok(Self {
            config,
            identity,
            prompt,
            sender,
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn router(&self) -> Router {
        let mut router = Router::new();
        router.register(
            RouteKey::FILE_TRANSFER,
            Arc::new(FileReceiver::new(
                self.prompt.clone(),
                ReceiveOptions {
                    prompt_timeout: self.config.prompt_timeout(),
                    send_receipts: self.config.send_receipts,
                },
            )),
        );
        router
    }

    /// Advertise, listen and start accepting. Returns the bound listen address.
    /// If listening fails the advertisement is withdrawn again.
    pub async fn start(&self) -> Result<SocketAddr, ServiceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("start called while running");
            return Err(ServiceError::AlreadyRunning);
        }

        let (discovery, advertisement) = if self.config.advertise {
            let discovery = Arc::new(Discovery::new()?);
            let ad = discovery.advertise(&ServiceAdvertisement::from_config(&self.config))?;
            (Some(discovery), Some(ad))
        } else {
            (None, None)
        };

        let addr = self.config.listen_addr();
        let listened = Transport::listen(addr, &self.identity).and_then(|transport| {
            let local = transport
                .local_addr()
                .map_err(|source| TransportError::Listen { addr, source })?;
            Ok((transport, local))
        });
        let (transport, local_addr) = match listened {
            Ok(bound) => bound,
            Err(e) => {
                if let (Some(discovery), Some(ad)) = (&discovery, advertisement) {
                    let _ = discovery.shutdown(ad);
                }
                return Err(e.into());
            }
        };

        let (shutdown, signal) = watch::channel(false);
        let accept_task = tokio::spawn(router::serve(
            transport.clone(),
            Arc::new(self.router()),
            signal,
        ));
        info!(%local_addr, advertised = advertisement.is_some(), "service started");
        *running = Some(Running {
            discovery,
            advertisement,
            transport,
            local_addr,
            shutdown,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Withdraw the advertisement and stop accepting. Transfers already in
    /// progress run to completion.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let Some(running) = self.running.lock().await.take() else {
            warn!("stop called while not running");
            return Err(ServiceError::NotRunning);
        };
        if let (Some(discovery), Some(ad)) = (&running.discovery, running.advertisement) {
            if let Err(e) = discovery.shutdown(ad) {
                warn!(error = %e, "advertisement not withdrawn cleanly");
            }
        }
        running.transport.stop_accepting();
        let _ = running.shutdown.send(true);
        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        info!("service stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Browse the segment. Reuses the running responder when there is one.
    pub async fn lookup(&self) -> Result<Vec<PeerEntry>, DiscoveryError> {
        let shared = self
            .running
            .lock()
            .await
            .as_ref()
            .and_then(|r| r.discovery.clone());
        let discovery = match shared {
            Some(d) => d,
            None => Arc::new(Discovery::new()?),
        };
        discovery.lookup(self.config.lookup_timeout()).await
    }

    /// Interactive send: lookup, choose host and file, transfer.
    pub async fn send_file(&self) -> Result<SendReport, SendError> {
        self.sender.run(self.lookup()).await
    }

    pub fn sender(&self) -> &FileSender {
        &self.sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::AutoAccept;

    fn local_config() -> Config {
        Config {
            bind_host: "127.0.0.1".parse().unwrap(),
            listen_port: 0,
            advertise: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn start_and_stop_are_guarded() {
        let service = Service::new(local_config(), Arc::new(AutoAccept::new("/tmp"))).unwrap();
        assert!(matches!(service.stop().await, Err(ServiceError::NotRunning)));

        let addr = service.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(service.local_addr().await, Some(addr));
        assert!(matches!(service.start().await, Err(ServiceError::AlreadyRunning)));

        service.stop().await.unwrap();
        assert!(!service.is_running().await);
        assert!(matches!(service.stop().await, Err(ServiceError::NotRunning)));
    }

    #[tokio::test]
    async fn listen_failure_leaves_service_stopped() {
        let first = Service::new(local_config(), Arc::new(AutoAccept::new("/tmp"))).unwrap();
        let taken = first.start().await.unwrap();

        let config = Config {
            listen_port: taken.port(),
            ..local_config()
        };
        let second = Service::new(config, Arc::new(AutoAccept::new("/tmp"))).unwrap();
        assert!(matches!(
            second.start().await,
            Err(ServiceError::Transport(TransportError::Listen { .. }))
        ));
        assert!(!second.is_running().await);
        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let service = Service::new(local_config(), Arc::new(AutoAccept::new("/tmp"))).unwrap();
        service.start().await.unwrap();
        service.stop().await.unwrap();
        service.start().await.unwrap();
        service.stop().await.unwrap();
    }
}
