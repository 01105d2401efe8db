//! Error types for the daemon. Each one is terminal for the narrowest scope that
//! raised it (stream, connection, transfer); only `ServiceError` reaches the caller of `start`.

use std::net::SocketAddr;
use std::path::PathBuf;

use fileshare_core::transfer::ReceiptError;
use fileshare_core::{
    FrameDecodeError, FrameEncodeError, RouteKey, TransferHeaderError, TransferState,
};

/// Listener, dialer and stream failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("identity generation failed: {0}")]
    Identity(#[from] rcgen::Error),
    #[error("tls configuration: {0}")]
    Tls(String),
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to dial {addr}: {reason}")]
    Dial { addr: SocketAddr, reason: String },
    #[error("connection lost: {0}")]
    Connection(#[from] quinn::ConnectionError),
}

/// Why a routed stream was dropped without (or after) reaching a handler.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("short routing header: {0}")]
    ShortHeader(#[source] std::io::Error),
    #[error("bad routing header: {0}")]
    Protocol(#[from] FrameDecodeError),
    #[error("topic {0} stream handler not found")]
    NoHandler(RouteKey),
    #[error("handler for {key} failed: {source:#}")]
    Handler {
        key: RouteKey,
        #[source]
        source: anyhow::Error,
    },
}

/// mDNS advertisement and lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("service is already being advertised")]
    AlreadyAdvertising,
    #[error("mdns: {0}")]
    Daemon(#[from] mdns_sd::Error),
}

/// Failures of one file transfer, on either side.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended in state {state}: {source}")]
    ShortRead {
        state: TransferState,
        #[source]
        source: std::io::Error,
    },
    #[error("bad request header: {0}")]
    Header(#[from] TransferHeaderError),
    #[error("size mismatch: declared {expected} bytes, copied {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("protocol: {0}")]
    Protocol(#[from] FrameDecodeError),
    #[error("frame: {0}")]
    Frame(#[from] FrameEncodeError),
    #[error("receipt: {0}")]
    Receipt(#[from] ReceiptError),
    #[error("receipt mismatch: {0}")]
    ReceiptMismatch(String),
    #[error("timed out waiting for receipt")]
    ReceiptTimeout,
    #[error("receiver declined the transfer")]
    Declined,
    #[error("cannot create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the user-driven send flow.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no peers found on the local network")]
    NoPeers,
    #[error("send cancelled")]
    Cancelled,
    #[error("another send is in progress")]
    Busy,
    #[error("peer {0} is no longer in the lookup results")]
    UnknownPeer(String),
    #[error("peer {0} did not advertise a usable address")]
    NoDialAddress(String),
    #[error("cannot read {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Service lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,
    #[error("service is not running")]
    NotRunning,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}
