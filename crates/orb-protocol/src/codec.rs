use std::io::{Read, Write};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{is_known_tag, RpcMessage, MAX_MESSAGE_SIZE};

/// Codec for encoding/decoding connection messages.
pub struct RpcCodec;

impl RpcCodec {
    /// Encode a message with framing: [4 bytes len][1 byte tag][payload]
    pub fn encode(msg: &RpcMessage) -> ProtocolResult<Vec<u8>> {
        let payload =
            bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(4 + 1 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(msg.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a framed message. Returns (message, bytes_consumed).
    pub fn decode(data: &[u8]) -> ProtocolResult<(RpcMessage, usize)> {
        if data.len() < 5 {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let len = frame_len([data[0], data[1], data[2], data[3]])?;
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let msg = Self::decode_body(data[4], &data[5..total])?;
        Ok((msg, total))
    }

    /// Read one framed message. Returns `Ok(None)` if the stream ends cleanly
    /// before the first byte of a frame.
    pub fn read_message<R: Read>(reader: &mut R) -> ProtocolResult<Option<RpcMessage>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(ProtocolError::FramingError(format!(
                        "stream ended inside a frame header ({filled} of 4 bytes)"
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        let len = frame_len(header)?;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        Self::decode_body(body[0], &body[1..]).map(Some)
    }

    /// Write an encoded frame and flush.
    pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> ProtocolResult<()> {
        writer.write_all(frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Decode the payload framed under `tag`. Values nested deeper than
    /// [`MAX_NESTING`](crate::wire::MAX_NESTING) fail here, before any of
    /// them reaches a thread's stack limit.
    fn decode_body(tag: u8, payload: &[u8]) -> ProtocolResult<RpcMessage> {
        if !is_known_tag(tag) {
            return Err(ProtocolError::InvalidMessageType(tag));
        }
        let msg: RpcMessage = bincode::deserialize(payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if msg.type_tag() != tag {
            return Err(ProtocolError::FramingError(format!(
                "tag {tag} framed a {} payload",
                msg.type_name()
            )));
        }
        Ok(msg)
    }
}

/// Length of the tag plus payload, validated against the size limit.
fn frame_len(header: [u8; 4]) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len < 1 {
        return Err(ProtocolError::FramingError("zero-length frame".into()));
    }
    if len - 1 > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len - 1,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{WireValue, MAX_NESTING};
    use orb_types::{ErrorValue, Range};
    use proptest::prelude::*;
    use std::io::Cursor;

    fn call() -> RpcMessage {
        RpcMessage::MethodCall {
            caller: 7,
            target: Some(3),
            method: "raise!".into(),
            args: vec![
                WireValue::Int(10),
                WireValue::Range(Range::inclusive(1, 2)),
                WireValue::Remote(4),
            ],
            block: WireValue::Remote(5),
        }
    }

    #[test]
    fn frame_roundtrip() {
        let msg = call();
        let encoded = RpcCodec::encode(&msg).unwrap();
        assert_eq!(encoded[4], 1);
        let (decoded, consumed) = RpcCodec::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn stream_yields_messages_then_clean_eof() {
        let reply = RpcMessage::ReturnValue {
            is_exception: true,
            result: WireValue::Error(ErrorValue::new("RuntimeError", "boom").with_frame("a.rs:1")),
            caller: 7,
        };
        let mut bytes = RpcCodec::encode(&call()).unwrap();
        bytes.extend(RpcCodec::encode(&reply).unwrap());
        let mut stream = Cursor::new(bytes);

        assert_eq!(RpcCodec::read_message(&mut stream).unwrap(), Some(call()));
        assert_eq!(RpcCodec::read_message(&mut stream).unwrap(), Some(reply));
        assert_eq!(RpcCodec::read_message(&mut stream).unwrap(), None);
    }

    #[test]
    fn eof_inside_frame_is_an_error() {
        let encoded = RpcCodec::encode(&call()).unwrap();
        let mut header_only = Cursor::new(encoded[..2].to_vec());
        assert!(matches!(
            RpcCodec::read_message(&mut header_only),
            Err(ProtocolError::FramingError(_))
        ));
        let mut truncated = Cursor::new(encoded[..encoded.len() - 1].to_vec());
        let err = RpcCodec::read_message(&mut truncated).unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn decode_truncated() {
        let err = RpcCodec::decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn decode_zero_length() {
        let data = [0u8, 0, 0, 0, 0]; // length = 0
        let err = RpcCodec::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn oversized_frame_rejected_before_reading() {
        let len = (MAX_MESSAGE_SIZE as u32) + 2;
        let mut data = len.to_be_bytes().to_vec();
        data.push(1);
        let err = RpcCodec::read_message(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }

    #[test]
    fn unknown_and_mismatched_tags() {
        let mut encoded = RpcCodec::encode(&call()).unwrap();
        encoded[4] = 9;
        assert!(matches!(
            RpcCodec::decode(&encoded),
            Err(ProtocolError::InvalidMessageType(9))
        ));
        encoded[4] = 3;
        assert!(matches!(
            RpcCodec::decode(&encoded),
            Err(ProtocolError::FramingError(_))
        ));
    }

    /// A framed `echo` call whose one argument is `levels` lists, each
    /// holding the next, around a nil. Built byte by byte so that no deep
    /// value ever exists on this side.
    fn nested_call_frame(levels: usize) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes()); // MethodCall
        payload.extend_from_slice(&1u64.to_le_bytes()); // caller
        payload.push(0); // target: None
        payload.extend_from_slice(&4u64.to_le_bytes());
        payload.extend_from_slice(b"echo");
        payload.extend_from_slice(&1u64.to_le_bytes()); // one argument
        for _ in 0..levels {
            payload.extend_from_slice(&7u32.to_le_bytes()); // List
            payload.extend_from_slice(&1u64.to_le_bytes());
        }
        payload.extend_from_slice(&0u32.to_le_bytes()); // Nil
        payload.extend_from_slice(&0u32.to_le_bytes()); // block: Nil

        let mut frame = ((payload.len() + 1) as u32).to_be_bytes().to_vec();
        frame.push(1);
        frame.extend(payload);
        frame
    }

    #[test]
    fn shallow_nesting_decodes() {
        let (msg, _) = RpcCodec::decode(&nested_call_frame(2)).unwrap();
        let expected = RpcMessage::MethodCall {
            caller: 1,
            target: None,
            method: "echo".into(),
            args: vec![WireValue::List(vec![WireValue::List(vec![WireValue::Nil])])],
            block: WireValue::Nil,
        };
        assert_eq!(msg, expected);
        assert!(RpcCodec::decode(&nested_call_frame(MAX_NESTING - 1)).is_ok());
    }

    #[test]
    fn deep_nesting_is_rejected_not_overflowed() {
        let err = RpcCodec::decode(&nested_call_frame(MAX_NESTING)).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));

        let frame = nested_call_frame(200_000);
        assert!(frame.len() < MAX_MESSAGE_SIZE);
        let err = RpcCodec::read_message(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = RpcCodec::decode(&bytes);
            let _ = RpcCodec::read_message(&mut Cursor::new(bytes));
        }

        #[test]
        fn garbage_notices_survive_framing(id in any::<u64>()) {
            let msg = RpcMessage::GarbageFound { object_id: id };
            let encoded = RpcCodec::encode(&msg).unwrap();
            let (decoded, _) = RpcCodec::decode(&encoded).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
