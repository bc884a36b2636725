//! Frame codec: protobuf encode/decode of a single [`Frame`] per packet.
//!
//! The transport (see [`crate::transport`]) is message-oriented and already
//! preserves packet boundaries, so unlike a byte-stream codec this performs
//! no length-prefix framing of its own: `encode` produces exactly the bytes
//! of one packet, `decode` consumes exactly the bytes of one packet.

use bytes::{Bytes, BytesMut};
use prost::Message;

use crate::error::{Error, Result};
use crate::frame::Validate;
use crate::proto::Frame;

/// Default maximum packet size (16 MiB), matching the transport's default.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Encodes a [`Frame`] to the bytes of a single packet.
pub fn encode_frame(frame: &Frame) -> Result<Bytes> {
    let size = frame.encoded_len();
    if size > MAX_PACKET_SIZE {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("encoded frame size {size} exceeds maximum {MAX_PACKET_SIZE}"),
        )));
    }

    let mut buf = BytesMut::with_capacity(size);
    frame
        .encode(&mut buf)
        .expect("BytesMut grows to fit, encode is infallible here");
    Ok(buf.freeze())
}

/// Decodes a single packet's bytes into a validated [`Frame`].
///
/// Returns an [`Error::Unmarshal`] if the bytes are not a valid `Frame`
/// protobuf message, or a protocol-violation error if the decoded frame
/// fails the per-type field rules in [`crate::frame::Validate`].
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let frame = Frame::decode(bytes).map_err(|source| Error::Unmarshal {
        type_name: "Frame",
        source,
    })?;
    frame.validate()?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{new_begin, new_no_op, new_request};
    use crate::proto::Any;

    #[test]
    fn round_trips_no_op() {
        let frame = new_no_op();
        let bytes = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trips_begin() {
        let frame = new_begin(7, "foo.Bar", None);
        let bytes = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trips_request_with_payload() {
        let payload = Any {
            type_url: "type.example/foo.Req".into(),
            value: vec![1, 2, 3],
        };
        let frame = new_request(3, payload);
        let bytes = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_rejects_garbage_bytes() {
        // A single 0xFF byte is an invalid protobuf varint tag continuation.
        let bytes = [0xFFu8; 1];
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_protocol_violation() {
        let frame = new_begin(0, "foo.Bar", None);
        let bytes = encode_frame(&frame).unwrap();
        assert!(decode_frame(&bytes).is_err());
    }
}
