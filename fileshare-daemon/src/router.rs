//! Stream router: accept connections, accept streams, read the routing header and
//! hand each stream to the handler registered for its topic.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use fileshare_core::protocol::decode_routing_header;
use fileshare_core::{RouteKey, ROUTING_HEADER_SIZE};
use quinn::Connection;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RouteError;
use crate::transport::{accept_stream, BiStream, Transport};

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// The remote end of a connection, as seen by handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerContext {
    pub remote: SocketAddr,
}

impl fmt::Display for PeerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.remote)
    }
}

/// Handles one stream after its routing header has been consumed.
/// The router closes the stream once the handler returns.
pub trait StreamHandler: Send + Sync {
    fn handle<'a>(&'a self, peer: &'a PeerContext, stream: &'a mut BiStream) -> HandlerFuture<'a>;
}

/// Topic table. Populated before serving, then shared read-only.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<RouteKey, Arc<dyn StreamHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same key replaces the earlier one.
    pub fn register(&mut self, key: RouteKey, handler: Arc<dyn StreamHandler>) {
        if self.handlers.insert(key, handler).is_some() {
            warn!(route = %key, "stream handler replaced");
        }
    }

    pub fn handles(&self, key: RouteKey) -> bool {
        self.handlers.contains_key(&key)
    }

    /// Route one stream and close it. Errors end this stream only; they are logged
    /// here and returned for callers that care.
    pub async fn handle_stream(
        &self,
        peer: &PeerContext,
        mut stream: BiStream,
    ) -> Result<RouteKey, RouteError> {
        let result = self.dispatch(peer, &mut stream).await;
        if let Err(e) = stream.close().await {
            debug!(%peer, error = %e, "stream close failed");
        }
        match &result {
            Ok(key) => debug!(%peer, route = %key, "stream done"),
            Err(e) => warn!(%peer, error = %e, "stream dropped"),
        }
        result
    }

    async fn dispatch(
        &self,
        peer: &PeerContext,
        stream: &mut BiStream,
    ) -> Result<RouteKey, RouteError> {
        let mut header = [0u8; ROUTING_HEADER_SIZE];
        stream
            .recv
            .read_exact(&mut header)
            .await
            .map_err(RouteError::ShortHeader)?;
        let key = decode_routing_header(&header)?;
        let handler = self
            .handlers
            .get(&key)
            .cloned()
            .ok_or(RouteError::NoHandler(key))?;
        handler
            .handle(peer, stream)
            .await
            .map_err(|source| RouteError::Handler { key, source })?;
        Ok(key)
    }

    /// Accept streams until the connection ends; each stream runs in its own task.
    pub async fn serve_connection(self: Arc<Self>, conn: Connection) {
        let peer = PeerContext {
            remote: conn.remote_address(),
        };
        info!(%peer, "connection established");
        loop {
            match accept_stream(&conn).await {
                Ok(stream) => {
                    let router = self.clone();
                    tokio::spawn(async move {
                        let _ = router.handle_stream(&peer, stream).await;
                    });
                }
                Err(e) => {
                    debug!(%peer, error = %e, "connection closed");
                    return;
                }
            }
        }
    }
}

/// Accept loop. Runs until the endpoint stops yielding connections or `shutdown` fires.
/// Each handshake completes in its own task so a slow peer cannot stall the loop.
pub async fn serve(transport: Transport, router: Arc<Router>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            incoming = transport.accept() => {
                let Some(incoming) = incoming else { break };
                let router = router.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => router.serve_connection(conn).await,
                        Err(e) => warn!(error = %e, "inbound handshake failed"),
                    }
                });
            }
        }
    }
    info!("accept loop stopped");
}
