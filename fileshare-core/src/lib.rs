//! FileShare protocol reference implementation.
//! Host-driven: no I/O; the host reads and writes streams and feeds bytes in.

pub mod integrity;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use integrity::{digest_bytes, FileDigest, DIGEST_LEN};
pub use protocol::{RouteKey, PROTOCOL_VERSION, ROUTING_HEADER_SIZE};
pub use transfer::{
    ReceiptStatus, RequestDecoder, TransferHeaderError, TransferReceipt, TransferRequest,
    TransferState,
};
pub use wire::{
    decode_frame, encode_frame, split_frame, FrameBuffer, FrameDecodeError, FrameEncodeError,
    Message, Split,
};
