//! FileShare daemon: mDNS discovery, QUIC transport, stream routing and file transfer.

pub mod config;
pub mod discovery;
pub mod error;
pub mod prompt;
pub mod router;
pub mod sender;
pub mod service;
pub mod transfer;
pub mod transport;

pub use config::Config;
pub use discovery::{Discovery, PeerEntry, ServiceAdvertisement};
pub use error::{DiscoveryError, RouteError, SendError, ServiceError, TransferError, TransportError};
pub use prompt::{AutoAccept, ConsolePrompt, UserPrompt};
pub use router::{PeerContext, Router, StreamHandler};
pub use sender::FileSender;
pub use service::Service;
pub use transfer::{FileReceiver, SendReport, TransferOutcome};
pub use transport::{BiStream, Identity, Transport};
