//! File transfer over a routed stream.
//!
//! Receiver: read the request header, ask for consent, copy exactly the declared
//! number of bytes into a temporary file, then rename it into place.
//! Sender: write routing header, request header and file bytes, then wait for the
//! receiver to close its side (and, optionally, for its receipt).

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fileshare_core::integrity::to_hex;
use fileshare_core::protocol::encode_routing_header;
use fileshare_core::{
    FileDigest, FrameBuffer, ReceiptStatus, RequestDecoder, RouteKey, TransferReceipt,
    TransferRequest, TransferState, DIGEST_LEN,
};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransferError;
use crate::prompt::{run_blocking, UserPrompt};
use crate::router::{HandlerFuture, PeerContext, StreamHandler};
use crate::transport::BiStream;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// How an accepted stream ended, from the receiver's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete {
        path: PathBuf,
        bytes: u64,
        digest: [u8; DIGEST_LEN],
    },
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Unanswered consent prompts count as a rejection after this long.
    pub prompt_timeout: Duration,
    pub send_receipts: bool,
}

/// Handler for `RouteKey::FILE_TRANSFER` streams.
pub struct FileReceiver {
    prompt: Arc<dyn UserPrompt>,
    options: ReceiveOptions,
}

impl FileReceiver {
    pub fn new(prompt: Arc<dyn UserPrompt>, options: ReceiveOptions) -> Self {
        Self { prompt, options }
    }

    /// Run one inbound transfer. The routing header has already been consumed.
    pub async fn receive<R, W>(
        &self,
        peer: &PeerContext,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<TransferOutcome, TransferError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request = read_request(reader).await?;
        info!(%peer, file = %request.file_name, size = request.file_size, "incoming transfer");

        let Some(dir) = self.ask_consent(peer, &request).await else {
            info!(%peer, file = %request.file_name, state = %TransferState::Rejected, "transfer rejected");
            self.send_receipt(writer, &TransferReceipt::rejected()).await;
            return Ok(TransferOutcome::Rejected);
        };

        debug!(%peer, dir = %dir.display(), state = %TransferState::Copying, "copying");
        match save_into(&dir, &request, reader).await {
            Ok((path, digest)) => {
                info!(
                    %peer,
                    path = %path.display(),
                    bytes = request.file_size,
                    sha256 = %to_hex(&digest),
                    state = %TransferState::Complete,
                    "transfer complete"
                );
                let receipt = TransferReceipt {
                    status: ReceiptStatus::Complete,
                    bytes_written: request.file_size,
                    digest,
                };
                self.send_receipt(writer, &receipt).await;
                Ok(TransferOutcome::Complete {
                    path,
                    bytes: request.file_size,
                    digest,
                })
            }
            Err(e) => {
                let bytes_written = match &e {
                    TransferError::SizeMismatch { actual, .. } => *actual,
                    _ => 0,
                };
                let receipt = TransferReceipt {
                    status: ReceiptStatus::Failed,
                    bytes_written,
                    digest: [0u8; DIGEST_LEN],
                };
                self.send_receipt(writer, &receipt).await;
                Err(e)
            }
        }
    }

    /// Consent, then destination directory. `None` means rejected.
    async fn ask_consent(&self, peer: &PeerContext, request: &TransferRequest) -> Option<PathBuf> {
        let title = request.file_name.clone();
        let message = format!(
            "{peer} wants to share {} ({:.2} MB). Accept?",
            request.file_name,
            request.file_size as f64 / (1024.0 * 1024.0)
        );
        let deadline = std::time::Instant::now() + self.options.prompt_timeout;
        let ask = run_blocking(self.prompt.clone(), move |prompt| {
            prompt.consent(&title, &message, deadline)
        });
        match tokio::time::timeout(self.options.prompt_timeout, ask).await {
            Ok(Ok(dir)) => dir,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "consent prompt failed");
                None
            }
            Err(_) => {
                warn!(%peer, timeout = ?self.options.prompt_timeout, "consent prompt timed out");
                None
            }
        }
    }

    async fn send_receipt<W>(&self, writer: &mut W, receipt: &TransferReceipt)
    where
        W: AsyncWrite + Unpin,
    {
        if !self.options.send_receipts {
            return;
        }
        let result = async {
            let frame = receipt.encode_frame()?;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok::<_, TransferError>(())
        }
        .await;
        if let Err(e) = result {
            debug!(error = %e, status = ?receipt.status, "receipt not delivered");
        }
    }
}

impl StreamHandler for FileReceiver {
    fn handle<'a>(&'a self, peer: &'a PeerContext, stream: &'a mut BiStream) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.receive(peer, &mut stream.recv, &mut stream.send).await?;
            Ok(())
        })
    }
}

/// Feed the stream to a `RequestDecoder` until the header is complete.
async fn read_request<R>(reader: &mut R) -> Result<TransferRequest, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = RequestDecoder::new();
    loop {
        let mut buf = vec![0u8; decoder.bytes_needed()];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|source| TransferError::ShortRead {
                state: decoder.state(),
                source,
            })?;
        if let Some(request) = decoder.feed(&buf)? {
            return Ok(request);
        }
    }
}

/// Copy into a hidden temporary file in `dir`, then rename it onto a claimed name.
/// The temporary file is removed on any failure.
async fn save_into<R>(
    dir: &Path,
    request: &TransferRequest,
    reader: &mut R,
) -> Result<(PathBuf, [u8; DIGEST_LEN]), TransferError>
where
    R: AsyncRead + Unpin,
{
    let part = dir.join(format!(".fileshare-{}.part", Uuid::new_v4().simple()));
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&part)
        .await
        .map_err(|source| TransferError::Create {
            path: part.clone(),
            source,
        })?;

    let result = async {
        let digest = copy_exact(reader, file, request.file_size).await?;
        let dest = claim_destination(dir, &request.file_name).await?;
        if let Err(e) = fs::rename(&part, &dest).await {
            if let Err(e) = fs::remove_file(&dest).await {
                warn!(path = %dest.display(), error = %e, "cannot remove claimed name");
            }
            return Err(e.into());
        }
        Ok((dest, digest))
    }
    .await;

    if result.is_err() {
        if let Err(e) = fs::remove_file(&part).await {
            warn!(path = %part.display(), error = %e, "cannot remove partial file");
        }
    }
    result
}

/// Copy exactly `expected` bytes, hashing as they go. Fewer bytes is an error.
async fn copy_exact<R>(reader: &mut R, file: File, expected: u64) -> Result<[u8; DIGEST_LEN], TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut limited = reader.take(expected);
    let mut out = BufWriter::new(file);
    let mut digest = FileDigest::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = limited.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
        out.write_all(&buf[..n]).await?;
    }
    out.flush().await?;
    out.get_ref().sync_all().await?;
    if digest.bytes() != expected {
        return Err(TransferError::SizeMismatch {
            expected,
            actual: digest.bytes(),
        });
    }
    Ok(digest.finalize())
}

/// Create an empty file at `dir/name`, or at `dir/stem (n).ext` for the first n
/// still free. Creation is exclusive, so two transfers never end up on one name.
async fn claim_destination(dir: &Path, name: &str) -> io::Result<PathBuf> {
    for n in 0u32.. {
        let candidate = numbered_name(dir, name, n);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"))
}

/// `dir/name` for 0, `dir/stem (n).ext` otherwise.
fn numbered_name(dir: &Path, name: &str, n: u32) -> PathBuf {
    if n == 0 {
        return dir.join(name);
    }
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    match as_path.extension().and_then(|s| s.to_str()) {
        Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
        None => dir.join(format!("{stem} ({n})")),
    }
}

// ---- sender ----

#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Fail unless the receiver acknowledges with a matching receipt.
    pub await_receipt: bool,
    /// Upper bound on waiting for the receiver after the last byte is written.
    pub linger: Duration,
}

/// A local file opened for sending, with its request header prepared.
pub struct OutgoingFile {
    pub path: PathBuf,
    pub request: TransferRequest,
    file: File,
}

impl OutgoingFile {
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let request = TransferRequest::new(name, size)?;
        Ok(Self {
            path: path.to_path_buf(),
            request,
            file,
        })
    }
}

/// What the sender knows once a send returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub file_name: String,
    pub bytes_sent: u64,
    pub digest: [u8; DIGEST_LEN],
    /// Present when the receiver wrote one.
    pub receipt: Option<TransferReceipt>,
}

/// Write one file onto an opened stream and finish it.
pub async fn send_over(
    stream: &mut BiStream,
    outgoing: OutgoingFile,
    options: &SendOptions,
) -> Result<SendReport, TransferError> {
    let OutgoingFile { request, file, .. } = outgoing;
    stream
        .send
        .write_all(&encode_routing_header(RouteKey::FILE_TRANSFER))
        .await?;
    stream.send.write_all(&request.encode_header()).await?;

    let mut source = file.take(request.file_size);
    let mut digest = FileDigest::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
        stream.send.write_all(&buf[..n]).await?;
    }
    let sent = digest.bytes();
    if sent != request.file_size {
        return Err(TransferError::SizeMismatch {
            expected: request.file_size,
            actual: sent,
        });
    }
    let digest = digest.finalize();
    stream.close().await?;
    debug!(file = %request.file_name, bytes = sent, "file written, waiting for receiver");

    let receipt = match tokio::time::timeout(options.linger, read_receipt(&mut stream.recv)).await {
        Ok(receipt) => receipt?,
        Err(_) if options.await_receipt => return Err(TransferError::ReceiptTimeout),
        Err(_) => {
            warn!(file = %request.file_name, "receiver did not close the stream in time");
            None
        }
    };
    match &receipt {
        Some(r) => check_receipt(r, sent, &digest)?,
        None if options.await_receipt => {
            return Err(TransferError::ReceiptMismatch(
                "stream closed without a receipt".to_string(),
            ))
        }
        None => {}
    }
    Ok(SendReport {
        file_name: request.file_name,
        bytes_sent: sent,
        digest,
        receipt,
    })
}

/// Read until the receiver closes its side; return the first receipt frame seen.
async fn read_receipt<R>(reader: &mut R) -> Result<Option<TransferReceipt>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::new();
    let mut buf = [0u8; 512];
    let mut receipt = None;
    loop {
        let n = reader.read(&mut buf).await?;
        let at_eof = n == 0;
        frames.extend(&buf[..n]);
        while let Some(msg) = frames.next_message(at_eof)? {
            if msg.topic_is(RouteKey::RECEIPT) && receipt.is_none() {
                receipt = Some(TransferReceipt::from_message(&msg)?);
            } else {
                debug!(route = %msg.route_key(), "ignoring frame from receiver");
            }
        }
        if at_eof {
            return Ok(receipt);
        }
    }
}

fn check_receipt(
    receipt: &TransferReceipt,
    sent: u64,
    digest: &[u8; DIGEST_LEN],
) -> Result<(), TransferError> {
    match receipt.status {
        ReceiptStatus::Rejected => Err(TransferError::Declined),
        ReceiptStatus::Failed => Err(TransferError::ReceiptMismatch(format!(
            "receiver failed after {} bytes",
            receipt.bytes_written
        ))),
        ReceiptStatus::Complete if receipt.bytes_written != sent => {
            Err(TransferError::ReceiptMismatch(format!(
                "receiver stored {} bytes, sent {sent}",
                receipt.bytes_written
            )))
        }
        ReceiptStatus::Complete if &receipt.digest != digest => Err(TransferError::ReceiptMismatch(
            format!("digest {} does not match {}", to_hex(&receipt.digest), to_hex(digest)),
        )),
        ReceiptStatus::Complete => Ok(()),
    }
}
