//! FileShare wire protocol: version, routing keys and the per-stream routing header.

use std::fmt;

use crate::wire::FrameDecodeError;

/// Current protocol version. First byte of every routing header and frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Routing header size: version + topic + sub-topic.
pub const ROUTING_HEADER_SIZE: usize = 3;

/// Topic for everything file-transfer related.
pub const TOPIC_TRANSFER: u8 = 1;
/// Sub-topic: inbound file (payload follows the routing header, unframed).
pub const SUB_TOPIC_FILE: u8 = 1;
/// Sub-topic: receipt frame written back by the receiver.
pub const SUB_TOPIC_RECEIPT: u8 = 2;

/// Routing key selecting the handler for a stream or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub topic: u8,
    pub sub_topic: u8,
}

impl RouteKey {
    pub const FILE_TRANSFER: RouteKey = RouteKey::new(TOPIC_TRANSFER, SUB_TOPIC_FILE);
    pub const RECEIPT: RouteKey = RouteKey::new(TOPIC_TRANSFER, SUB_TOPIC_RECEIPT);

    pub const fn new(topic: u8, sub_topic: u8) -> Self {
        Self { topic, sub_topic }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.topic, self.sub_topic)
    }
}

/// Encode the routing header written at the start of every stream.
pub fn encode_routing_header(key: RouteKey) -> [u8; ROUTING_HEADER_SIZE] {
    [PROTOCOL_VERSION, key.topic, key.sub_topic]
}

/// Parse a routing header. The full message length is not known at this point,
/// so this is read straight off the stream rather than through the frame codec.
pub fn decode_routing_header(buf: &[u8]) -> Result<RouteKey, FrameDecodeError> {
    if buf.len() < ROUTING_HEADER_SIZE {
        return Err(FrameDecodeError::ShortBuffer {
            needed: ROUTING_HEADER_SIZE,
            available: buf.len(),
        });
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(FrameDecodeError::UnsupportedVersion(buf[0]));
    }
    Ok(RouteKey::new(buf[1], buf[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_header_roundtrip() {
        let header = encode_routing_header(RouteKey::FILE_TRANSFER);
        assert_eq!(header, [1, 1, 1]);
        assert_eq!(decode_routing_header(&header).unwrap(), RouteKey::FILE_TRANSFER);
    }

    #[test]
    fn routing_header_rejects_version() {
        assert!(matches!(
            decode_routing_header(&[2, 1, 1]),
            Err(FrameDecodeError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn routing_header_short() {
        assert!(matches!(
            decode_routing_header(&[1, 1]),
            Err(FrameDecodeError::ShortBuffer { needed: 3, available: 2 })
        ));
    }

    #[test]
    fn route_key_display() {
        assert_eq!(RouteKey::new(9, 9).to_string(), "(9,9)");
    }
}
