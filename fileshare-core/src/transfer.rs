//! File transfer payload: request header codec, receive-side state machine, receipts.
//!
//! Host-driven like the rest of the crate: the host reads exactly
//! [`RequestDecoder::bytes_needed`] bytes off the stream and feeds them in.

use std::fmt;

use crate::integrity::DIGEST_LEN;
use crate::protocol::RouteKey;
use crate::wire::{self, FrameEncodeError, Message};

/// File names are length-prefixed by a single byte.
pub const MAX_FILE_NAME_LEN: usize = 255;
/// Size field width (u64 LE).
pub const FILE_SIZE_LEN: usize = 8;

/// Where a single transfer currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    AwaitingHeader,
    AwaitingFilenameLength,
    AwaitingFilename,
    AwaitingSize,
    AwaitingConsent,
    Copying,
    Complete,
    Rejected,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Rejected | TransferState::Failed
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::AwaitingHeader => "awaiting-header",
            TransferState::AwaitingFilenameLength => "awaiting-filename-length",
            TransferState::AwaitingFilename => "awaiting-filename",
            TransferState::AwaitingSize => "awaiting-size",
            TransferState::AwaitingConsent => "awaiting-consent",
            TransferState::Copying => "copying",
            TransferState::Complete => "complete",
            TransferState::Rejected => "rejected",
            TransferState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A file offered by a sender: validated name and declared size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub file_name: String,
    pub file_size: u64,
}

impl TransferRequest {
    /// Build a request, validating the name the way a receiver will.
    pub fn new(file_name: impl Into<String>, file_size: u64) -> Result<Self, TransferHeaderError> {
        let file_name = file_name.into();
        validate_file_name(file_name.as_bytes())?;
        Ok(Self {
            file_name,
            file_size,
        })
    }

    /// Name length byte, name bytes, u64 LE size. Sent right after the routing header.
    pub fn encode_header(&self) -> Vec<u8> {
        let name = self.file_name.as_bytes();
        let mut out = Vec::with_capacity(1 + name.len() + FILE_SIZE_LEN);
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out
    }
}

/// Check an untrusted, sender-supplied file name. It must be usable as a single
/// path component inside the chosen destination directory.
pub fn validate_file_name(raw: &[u8]) -> Result<&str, TransferHeaderError> {
    if raw.is_empty() {
        return Err(TransferHeaderError::EmptyFileName);
    }
    if raw.len() > MAX_FILE_NAME_LEN {
        return Err(TransferHeaderError::FileNameTooLong(raw.len()));
    }
    let name = std::str::from_utf8(raw).map_err(|_| TransferHeaderError::InvalidFileName {
        name: String::from_utf8_lossy(raw).into_owned(),
        reason: "not valid UTF-8",
    })?;
    let reason = if name.contains(|c: char| c == '/' || c == '\\') {
        Some("contains a path separator")
    } else if name.contains('\0') {
        Some("contains NUL")
    } else if name == "." || name == ".." {
        Some("refers to a directory")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(TransferHeaderError::InvalidFileName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(name),
    }
}

/// Error parsing or building a transfer request header.
#[derive(Debug, thiserror::Error)]
pub enum TransferHeaderError {
    #[error("empty file name")]
    EmptyFileName,
    #[error("file name too long: {0} bytes")]
    FileNameTooLong(usize),
    #[error("invalid file name {name:?}: {reason}")]
    InvalidFileName { name: String, reason: &'static str },
    #[error("expected {expected} bytes in state {state}, got {got}")]
    UnexpectedInput {
        state: TransferState,
        expected: usize,
        got: usize,
    },
}

/// Receive-side header decoder. Starts after the routing header has been consumed.
#[derive(Debug)]
pub struct RequestDecoder {
    state: TransferState,
    name_len: usize,
    file_name: Option<String>,
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self {
            state: TransferState::AwaitingFilenameLength,
            name_len: 0,
            file_name: None,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Exact number of bytes the next `feed` call expects. Zero once the request is complete.
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            TransferState::AwaitingFilenameLength => 1,
            TransferState::AwaitingFilename => self.name_len,
            TransferState::AwaitingSize => FILE_SIZE_LEN,
            _ => 0,
        }
    }

    /// Feed exactly `bytes_needed()` bytes. Returns the request once the size is read;
    /// the decoder then sits in `AwaitingConsent`. Any error moves it to `Failed`.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<TransferRequest>, TransferHeaderError> {
        let result = self.step(bytes);
        if result.is_err() {
            self.state = TransferState::Failed;
        }
        result
    }

    fn step(&mut self, bytes: &[u8]) -> Result<Option<TransferRequest>, TransferHeaderError> {
        let expected = self.bytes_needed();
        if bytes.len() != expected || expected == 0 {
            return Err(TransferHeaderError::UnexpectedInput {
                state: self.state,
                expected,
                got: bytes.len(),
            });
        }
        match self.state {
            TransferState::AwaitingFilenameLength => {
                if bytes[0] == 0 {
                    return Err(TransferHeaderError::EmptyFileName);
                }
                self.name_len = bytes[0] as usize;
                self.state = TransferState::AwaitingFilename;
                Ok(None)
            }
            TransferState::AwaitingFilename => {
                let name = validate_file_name(bytes)?;
                self.file_name = Some(name.to_string());
                self.state = TransferState::AwaitingSize;
                Ok(None)
            }
            TransferState::AwaitingSize => {
                let mut size = [0u8; FILE_SIZE_LEN];
                size.copy_from_slice(bytes);
                let file_name = self.file_name.take().unwrap_or_default();
                self.state = TransferState::AwaitingConsent;
                Ok(Some(TransferRequest {
                    file_name,
                    file_size: u64::from_le_bytes(size),
                }))
            }
            _ => unreachable!("bytes_needed() is zero in every other state"),
        }
    }
}

/// Terminal status reported back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Complete = 0,
    Rejected = 1,
    Failed = 2,
}

impl TryFrom<u8> for ReceiptStatus {
    type Error = ReceiptError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ReceiptStatus::Complete),
            1 => Ok(ReceiptStatus::Rejected),
            2 => Ok(ReceiptStatus::Failed),
            other => Err(ReceiptError::UnknownStatus(other)),
        }
    }
}

/// Optional acknowledgement frame written by the receiver once a transfer ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub status: ReceiptStatus,
    pub bytes_written: u64,
    pub digest: [u8; DIGEST_LEN],
}

const RECEIPT_BODY_LEN: usize = 1 + 8 + DIGEST_LEN;

impl TransferReceipt {
    pub fn rejected() -> Self {
        Self {
            status: ReceiptStatus::Rejected,
            bytes_written: 0,
            digest: [0u8; DIGEST_LEN],
        }
    }

    pub fn encode_frame(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let mut body = Vec::with_capacity(RECEIPT_BODY_LEN);
        body.push(self.status as u8);
        body.extend_from_slice(&self.bytes_written.to_le_bytes());
        body.extend_from_slice(&self.digest);
        let key = RouteKey::RECEIPT;
        wire::encode_frame(key.topic, key.sub_topic, &body)
    }

    pub fn from_message(msg: &Message) -> Result<Self, ReceiptError> {
        if !msg.topic_is(RouteKey::RECEIPT) {
            return Err(ReceiptError::WrongTopic(msg.route_key()));
        }
        let body = &msg.body;
        if body.len() != RECEIPT_BODY_LEN {
            return Err(ReceiptError::BadLength(body.len()));
        }
        let status = ReceiptStatus::try_from(body[0])?;
        let mut written = [0u8; 8];
        written.copy_from_slice(&body[1..9]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&body[9..]);
        Ok(Self {
            status,
            bytes_written: u64::from_le_bytes(written),
            digest,
        })
    }
}

/// Error interpreting a receipt frame.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("expected receipt frame, got topic {0}")]
    WrongTopic(RouteKey),
    #[error("receipt body has {0} bytes")]
    BadLength(usize),
    #[error("unknown receipt status {0}")]
    UnknownStatus(u8),
}
