// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Length-prefixed framing for DHT messages.
//!
//! A frame is a 4-byte big-endian payload length followed by the
//! bincode-encoded `Message`. Frames above `MAX_MESSAGE_SIZE` are rejected
//! on both sides.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::messages::Message;

/// Maximum encoded message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Encode a message into a single length-prefixed frame.
pub fn encode_message(msg: &Message) -> Result<Bytes, ProtocolError> {
    let payload =
        bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut frame = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Decode one length-prefixed frame into a message.
pub fn decode_message(mut frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() < LEN_PREFIX {
        return Err(ProtocolError::TruncatedFrame {
            expected: LEN_PREFIX,
            actual: frame.len(),
        });
    }
    let payload_len = frame.get_u32() as usize;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload_len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if frame.len() < payload_len {
        return Err(ProtocolError::TruncatedFrame {
            expected: payload_len,
            actual: frame.len(),
        });
    }

    bincode::deserialize(&frame[..payload_len])
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Address, PeerId};
    use crate::messages::Peer;
    use crate::record::Record;

    fn sample_message() -> Message {
        Message::put_value(Record::new(
            b"/v/name".as_slice(),
            b"value".as_slice(),
            PeerId::new(vec![7; 32]),
            b"sig".as_slice(),
        ))
        .with_closer_peers(vec![Peer::new(
            PeerId::new(vec![9; 32]),
            vec![Address::new("tcp", "192.0.2.9:4001")],
        )])
    }

    #[test]
    fn test_roundtrip_preserves_message() {
        let msg = sample_message();
        let frame = encode_message(&msg).unwrap();
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let frame = encode_message(&sample_message()).unwrap();
        let err = decode_message(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedFrame { .. }));
    }

    #[test]
    fn test_oversized_length_prefix_is_rejected() {
        let mut frame = BytesMut::new();
        frame.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        let err = decode_message(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        let mut frame = BytesMut::new();
        frame.put_u32(4);
        frame.put_slice(&[0xff, 0xff, 0xff, 0xff]);
        let err = decode_message(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
