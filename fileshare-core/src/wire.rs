//! Framing: 7-byte header (version, topic, sub-topic, u32 LE total length) + body.

use crate::protocol::{RouteKey, PROTOCOL_VERSION};

/// Fixed frame header size.
pub const HEADER_SIZE: usize = 7;
/// Upper bound on a single frame, header included.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub topic: u8,
    pub sub_topic: u8,
    /// Total encoded length, header included.
    pub length: u32,
    pub body: Vec<u8>,
}

impl Message {
    /// Fails with `TooLarge` for bodies `encode_frame` would refuse.
    pub fn new(key: RouteKey, body: Vec<u8>) -> Result<Self, FrameEncodeError> {
        let length = checked_frame_len(body.len())?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            topic: key.topic,
            sub_topic: key.sub_topic,
            length,
            body,
        })
    }

    pub fn route_key(&self) -> RouteKey {
        RouteKey::new(self.topic, self.sub_topic)
    }

    pub fn topic_is(&self, key: RouteKey) -> bool {
        self.route_key() == key
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        encode_frame(self.topic, self.sub_topic, &self.body)
    }
}

/// Encode `body` under the given routing key into a single frame.
pub fn encode_frame(topic: u8, sub_topic: u8, body: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let total = checked_frame_len(body.len())?;
    let mut out = Vec::with_capacity(total as usize);
    out.push(PROTOCOL_VERSION);
    out.push(topic);
    out.push(sub_topic);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Total frame length for a body of `body_len` bytes, bounded by `MAX_FRAME_LEN`.
fn checked_frame_len(body_len: usize) -> Result<u32, FrameEncodeError> {
    let total = body_len.saturating_add(HEADER_SIZE);
    match u32::try_from(total) {
        Ok(len) if len <= MAX_FRAME_LEN => Ok(len),
        _ => Err(FrameEncodeError::TooLarge(total)),
    }
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Decode one frame from the front of `buf`. Trailing bytes past the declared length are ignored.
pub fn decode_frame(buf: &[u8]) -> Result<Message, FrameDecodeError> {
    if buf.len() < HEADER_SIZE {
        return Err(FrameDecodeError::ShortBuffer {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(FrameDecodeError::UnsupportedVersion(buf[0]));
    }
    let length = declared_len(buf);
    if (length as usize) < HEADER_SIZE {
        return Err(FrameDecodeError::InvalidLength(length));
    }
    if length as usize > buf.len() {
        return Err(FrameDecodeError::LengthMismatch {
            declared: length,
            available: buf.len(),
        });
    }
    Ok(Message {
        version: buf[0],
        topic: buf[1],
        sub_topic: buf[2],
        length,
        body: buf[HEADER_SIZE..length as usize].to_vec(),
    })
}

/// Error decoding a frame or routing header.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("short buffer: need {needed} bytes, have {available}")]
    ShortBuffer { needed: usize, available: usize },
    #[error("unsupported message version v{0}")]
    UnsupportedVersion(u8),
    #[error("declared length {0} is smaller than the header")]
    InvalidLength(u32),
    #[error("declared length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: u32, available: usize },
    #[error("stream ended inside a frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

/// Result of one tokenizer step over buffered stream data.
#[derive(Debug, PartialEq, Eq)]
pub enum Split<'a> {
    /// A complete frame sits at the front of the buffer; consume `advance` bytes.
    Token { advance: usize, frame: &'a [u8] },
    /// The front of the buffer cannot start a frame; drop this many bytes and retry.
    Skip(usize),
    /// Not enough data buffered yet.
    NeedMore,
}

/// Carve the next frame out of a continuous byte stream.
///
/// A frame is yielded once it is completely buffered. A prefix that cannot be a frame
/// (wrong version byte, impossible length) is skipped up to the next byte that could
/// start a header, so a desynchronized stream recovers instead of stalling.
pub fn split_frame(data: &[u8], at_eof: bool) -> Result<Split<'_>, FrameDecodeError> {
    if data.is_empty() {
        return Ok(Split::NeedMore);
    }
    if data[0] != PROTOCOL_VERSION {
        return Ok(Split::Skip(next_header_candidate(data)));
    }
    if data.len() < HEADER_SIZE {
        return need_more(data.len(), HEADER_SIZE, at_eof);
    }
    let length = declared_len(data);
    if (length as usize) < HEADER_SIZE || length > MAX_FRAME_LEN {
        return Ok(Split::Skip(next_header_candidate(data)));
    }
    let length = length as usize;
    if length <= data.len() {
        return Ok(Split::Token {
            advance: length,
            frame: &data[..length],
        });
    }
    need_more(data.len(), length, at_eof)
}

fn need_more(available: usize, needed: usize, at_eof: bool) -> Result<Split<'static>, FrameDecodeError> {
    if at_eof {
        Err(FrameDecodeError::Truncated { needed, available })
    } else {
        Ok(Split::NeedMore)
    }
}

fn declared_len(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]])
}

/// Offset of the next byte (after the first) equal to the protocol version.
fn next_header_candidate(data: &[u8]) -> usize {
    data[1..]
        .iter()
        .position(|&b| b == PROTOCOL_VERSION)
        .map(|p| p + 1)
        .unwrap_or(data.len())
}

/// Accumulates stream bytes and pops complete messages.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    skipped: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message, skipping garbage. `Ok(None)` means more data is needed.
    pub fn next_message(&mut self, at_eof: bool) -> Result<Option<Message>, FrameDecodeError> {
        loop {
            match split_frame(&self.buf, at_eof)? {
                Split::Token { advance, frame } => {
                    let decoded = decode_frame(frame);
                    self.buf.drain(..advance);
                    return decoded.map(Some);
                }
                Split::Skip(n) => {
                    self.buf.drain(..n);
                    self.skipped += n as u64;
                }
                Split::NeedMore => return Ok(None),
            }
        }
    }

    /// Bytes currently buffered and not yet part of a returned message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes discarded while resynchronizing.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn roundtrip_various_bodies() {
        let mut rng = rand::thread_rng();
        for len in [0usize, 1, 6, 7, 8, 255, 4096] {
            let mut body = vec![0u8; len];
            rng.fill_bytes(&mut body);
            let topic: u8 = rng.gen();
            let sub: u8 = rng.gen();
            let frame = encode_frame(topic, sub, &body).unwrap();
            assert_eq!(frame.len(), HEADER_SIZE + len);
            let msg = decode_frame(&frame).unwrap();
            assert_eq!(msg.topic, topic);
            assert_eq!(msg.sub_topic, sub);
            assert_eq!(msg.body, body);
            assert_eq!(msg.length as usize, frame.len());
        }
    }

    #[test]
    fn message_encode_matches_free_fn() {
        let msg = Message::new(RouteKey::RECEIPT, b"ok".to_vec()).unwrap();
        assert_eq!(msg.length, 9);
        assert!(msg.topic_is(RouteKey::RECEIPT));
        assert_eq!(msg.encode().unwrap(), encode_frame(1, 2, b"ok").unwrap());
    }

    #[test]
    fn decode_rejects_version_regardless_of_content() {
        let mut frame = encode_frame(1, 1, b"payload").unwrap();
        frame[0] = 7;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::UnsupportedVersion(7))
        ));
        assert!(matches!(
            decode_frame(&[0, 0, 0, 0, 0, 0, 0, 0]),
            Err(FrameDecodeError::UnsupportedVersion(0))
        ));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        for n in 0..HEADER_SIZE {
            let buf = vec![PROTOCOL_VERSION; n];
            assert!(matches!(
                decode_frame(&buf),
                Err(FrameDecodeError::ShortBuffer { .. })
            ));
        }
    }

    #[test]
    fn decode_rejects_length_past_buffer() {
        let frame = encode_frame(1, 1, b"abcdef").unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::LengthMismatch { declared: 13, available: 12 })
        ));
    }

    #[test]
    fn decode_rejects_length_below_header() {
        let buf = [PROTOCOL_VERSION, 1, 1, 3, 0, 0, 0];
        assert!(matches!(
            decode_frame(&buf),
            Err(FrameDecodeError::InvalidLength(3))
        ));
    }

    #[test]
    fn encode_rejects_oversized_body() {
        let body = vec![0u8; MAX_FRAME_LEN as usize];
        assert!(matches!(
            encode_frame(1, 1, &body),
            Err(FrameEncodeError::TooLarge(_))
        ));
        assert!(matches!(
            Message::new(RouteKey::RECEIPT, body),
            Err(FrameEncodeError::TooLarge(_))
        ));
    }

    #[test]
    fn frame_len_never_wraps() {
        let fits = MAX_FRAME_LEN as usize - HEADER_SIZE;
        assert_eq!(checked_frame_len(fits).unwrap(), MAX_FRAME_LEN);
        assert!(matches!(checked_frame_len(fits + 1), Err(FrameEncodeError::TooLarge(_))));
        // 4 GiB + 1 would truncate to a small u32.
        let wraps = (u32::MAX as usize - HEADER_SIZE).saturating_add(2);
        assert!(matches!(checked_frame_len(wraps), Err(FrameEncodeError::TooLarge(_))));
        assert!(matches!(checked_frame_len(usize::MAX), Err(FrameEncodeError::TooLarge(_))));
    }

    #[test]
    fn split_yields_each_concatenated_frame_in_order() {
        let frames: Vec<Vec<u8>> = (0u8..5)
            .map(|i| encode_frame(1, i, &vec![i; i as usize * 3]).unwrap())
            .collect();
        let stream: Vec<u8> = frames.concat();
        let mut offset = 0;
        let mut tokens = Vec::new();
        loop {
            match split_frame(&stream[offset..], false).unwrap() {
                Split::Token { advance, frame } => {
                    tokens.push(frame.to_vec());
                    offset += advance;
                }
                Split::NeedMore => break,
                Split::Skip(_) => panic!("unexpected skip"),
            }
        }
        assert_eq!(tokens, frames);
    }

    #[test]
    fn split_needs_more_for_partial_frame() {
        let frame = encode_frame(1, 1, b"hello").unwrap();
        assert_eq!(split_frame(&frame[..4], false).unwrap(), Split::NeedMore);
        assert_eq!(split_frame(&frame[..10], false).unwrap(), Split::NeedMore);
        assert!(matches!(
            split_frame(&frame[..10], true),
            Err(FrameDecodeError::Truncated { needed: 12, available: 10 })
        ));
        assert_eq!(split_frame(&[], true).unwrap(), Split::NeedMore);
    }

    #[test]
    fn split_accepts_header_only_frame_at_eof() {
        let frame = encode_frame(1, 2, &[]).unwrap();
        assert_eq!(
            split_frame(&frame, true).unwrap(),
            Split::Token { advance: HEADER_SIZE, frame: &frame[..] }
        );
    }

    #[test]
    fn split_skips_to_next_candidate() {
        let mut data = vec![0xAA, 0xBB, PROTOCOL_VERSION];
        data.extend_from_slice(&encode_frame(1, 1, b"x").unwrap());
        assert_eq!(split_frame(&data, false).unwrap(), Split::Skip(2));
        // version byte followed by an impossible length
        let bogus = [PROTOCOL_VERSION, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0x42];
        assert_eq!(split_frame(&bogus, false).unwrap(), Split::Skip(8));
    }

    #[test]
    fn frame_buffer_recovers_after_garbage() {
        let a = encode_frame(1, 1, b"first").unwrap();
        let b = encode_frame(1, 2, b"second").unwrap();
        let mut buf = FrameBuffer::new();
        buf.extend(&[0xDE, 0xAD]);
        buf.extend(&a[..3]);
        assert!(buf.next_message(false).unwrap().is_none());
        buf.extend(&a[3..]);
        buf.extend(&[0x00, 0x13]);
        buf.extend(&b);
        let m1 = buf.next_message(false).unwrap().unwrap();
        let m2 = buf.next_message(false).unwrap().unwrap();
        assert_eq!(m1.body, b"first");
        assert_eq!(m2.body, b"second");
        assert!(buf.next_message(true).unwrap().is_none());
        assert_eq!(buf.skipped(), 4);
        assert_eq!(buf.buffered(), 0);
    }
}
