//! Binary wire protocol for the realtime room.
//!
//! The envelope is the Yjs sync protocol as implemented by [`yrs::sync`]:
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ kind: varint │ body                                         │
//! ├──────────────┼──────────────────────────────────────────────┤
//! │ 0 SYNC       │ subtype: varint (0 step-1, 1 step-2, 2 upd)  │
//! │              │ payload: varbuf                              │
//! │ 1 AWARENESS  │ update: varbuf                               │
//! │ 3 QUERY_AW.  │ (empty)                                      │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! This module only adds the room's rules on top: the kind is peeked with
//! the lib0 varint reader and anything other than SYNC, AWARENESS or
//! QUERY_AWARENESS is reported as [`DecodeError::UnknownKind`] for the
//! caller to log and drop. Trailing bytes after a complete message are
//! ignored.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

pub use yrs::sync::awareness::AwarenessUpdate;
pub use yrs::sync::{Message, SyncMessage};

pub const MESSAGE_SYNC: u64 = 0;
pub const MESSAGE_AWARENESS: u64 = 1;
/// Reserved for auth; never produced and treated as unknown.
pub const MESSAGE_AUTH: u64 = 2;
pub const MESSAGE_QUERY_AWARENESS: u64 = 3;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown message kind {0}")]
    UnknownKind(u64),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("invalid awareness state: {0}")]
    InvalidAwareness(String),
}

impl From<yrs::encoding::read::Error> for DecodeError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

/// Wrap a CRDT update as a SYNC envelope.
pub fn encode_sync(update: &[u8]) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update.to_vec())).encode_v1()
}

pub fn encode_sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

pub fn encode_sync_step2(diff: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

pub fn encode_awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

pub fn encode_query_awareness() -> Vec<u8> {
    Message::AwarenessQuery.encode_v1()
}

/// Parse one envelope.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let kind: u64 = Cursor::new(bytes).read_var()?;
    match kind {
        MESSAGE_SYNC | MESSAGE_AWARENESS | MESSAGE_QUERY_AWARENESS => {
            Ok(Message::decode_v1(bytes)?)
        }
        other => Err(DecodeError::UnknownKind(other)),
    }
}
