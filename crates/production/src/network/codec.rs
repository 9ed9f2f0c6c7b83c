//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][kind: u8][payload: SBOR-encoded body]
//! ```
//!
//! - Version is currently `1`
//! - Kind selects the body type: block, vote or sync request

use keel_core::OutboundMessage;
use keel_types::{BlockNum, SignedBlock, Vote};
use std::sync::Arc;
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

const KIND_BLOCK: u8 = 1;
const KIND_VOTE: u8 = 2;
const KIND_SYNC_REQUEST: u8 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("SBOR decode error: {0}")]
    SborDecode(String),

    #[error("SBOR encode error: {0}")]
    SborEncode(String),
}

fn encode_err<E: std::fmt::Debug>(e: E) -> CodecError {
    CodecError::SborEncode(format!("{:?}", e))
}

fn decode_err<E: std::fmt::Debug>(e: E) -> CodecError {
    CodecError::SborDecode(format!("{:?}", e))
}

/// Encode an outbound message to wire format.
pub fn encode_message(message: &OutboundMessage) -> Result<Vec<u8>, CodecError> {
    let (kind, payload) = match message {
        OutboundMessage::Block(block) => (
            KIND_BLOCK,
            sbor::basic_encode(block.as_ref()).map_err(encode_err)?,
        ),
        OutboundMessage::Vote(vote) => (KIND_VOTE, sbor::basic_encode(vote).map_err(encode_err)?),
        OutboundMessage::SyncRequest { from_num, to_num } => (
            KIND_SYNC_REQUEST,
            sbor::basic_encode(&(*from_num, *to_num)).map_err(encode_err)?,
        ),
    };

    let mut bytes = Vec::with_capacity(2 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.push(kind);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode a message from wire format.
pub fn decode_message(data: &[u8]) -> Result<OutboundMessage, CodecError> {
    let [version, kind, payload @ ..] = data else {
        return Err(CodecError::MessageTooShort);
    };
    if *version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(*version));
    }

    match *kind {
        KIND_BLOCK => {
            let block: SignedBlock = sbor::basic_decode(payload).map_err(decode_err)?;
            Ok(OutboundMessage::Block(Arc::new(block)))
        }
        KIND_VOTE => {
            let vote: Vote = sbor::basic_decode(payload).map_err(decode_err)?;
            Ok(OutboundMessage::Vote(vote))
        }
        KIND_SYNC_REQUEST => {
            let (from_num, to_num): (BlockNum, BlockNum) =
                sbor::basic_decode(payload).map_err(decode_err)?;
            Ok(OutboundMessage::SyncRequest { from_num, to_num })
        }
        other => Err(CodecError::UnknownKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::test_utils::test_key;
    use keel_types::{BlockId, Hash, VoteKind};

    #[test]
    fn test_vote_survives_wire() {
        let digest = Hash::from_bytes(b"finality digest");
        let vote = Vote::sign(
            &test_key(0),
            BlockId::new(5, &Hash::from_bytes(b"block")),
            &digest,
            VoteKind::Strong,
        );
        let bytes = encode_message(&OutboundMessage::Vote(vote.clone())).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);

        match decode_message(&bytes).unwrap() {
            OutboundMessage::Vote(decoded) => {
                assert_eq!(decoded, vote);
                assert!(decoded.verify(&digest));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_sync_request_survives_wire() {
        let bytes = encode_message(&OutboundMessage::SyncRequest {
            from_num: 10,
            to_num: 42,
        })
        .unwrap();
        assert!(matches!(
            decode_message(&bytes).unwrap(),
            OutboundMessage::SyncRequest {
                from_num: 10,
                to_num: 42
            }
        ));
    }

    #[test]
    fn test_unknown_version() {
        let result = decode_message(&[99, KIND_VOTE, 1, 2, 3]);
        assert!(matches!(result, Err(CodecError::UnknownVersion(99))));
    }

    #[test]
    fn test_unknown_kind_and_short_message() {
        assert!(matches!(
            decode_message(&[WIRE_VERSION, 77]),
            Err(CodecError::UnknownKind(77))
        ));
        assert!(matches!(
            decode_message(&[WIRE_VERSION]),
            Err(CodecError::MessageTooShort)
        ));
    }

    #[test]
    fn test_garbage_payload() {
        assert!(matches!(
            decode_message(&[WIRE_VERSION, KIND_BLOCK, 0xFF, 0x00]),
            Err(CodecError::SborDecode(_))
        ));
    }
}
