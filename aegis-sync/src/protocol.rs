//! Binary sync protocol (y-protocols compatible).
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────┬───────────────────┬──────────────┐
//! │ kind     │ step     │ payload length    │ payload      │
//! │ 1 byte   │ 1 byte   │ LEB128 varint     │ variable     │
//! └──────────┴──────────┴───────────────────┴──────────────┘
//! ```
//!
//! `kind` is always 0 (SYNC). `step` selects the payload meaning:
//!
//! | step | variant  | payload                                        |
//! |------|----------|------------------------------------------------|
//! | 0    | `Step1`  | sender's state vector                          |
//! | 1    | `Step2`  | update the requester is missing                |
//! | 2    | `Update` | unsolicited live edit                          |
//!
//! Payloads are opaque to this layer; only the replica interprets them.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Message kind tag for document synchronization.
pub const MSG_SYNC: u8 = 0;

pub const STEP1: u8 = 0;
pub const STEP2: u8 = 1;
pub const UPDATE: u8 = 2;

/// Protocol decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),
    #[error("Unknown sync step: {0}")]
    UnknownStep(u8),
    #[error("Truncated frame: {0}")]
    Truncated(String),
    #[error("Trailing bytes after sync payload")]
    TrailingBytes,
}

/// One step of the sync exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep {
    /// State vector of the sender.
    Step1(Vec<u8>),
    /// Update answering a `Step1`.
    Step2(Vec<u8>),
    /// Live edit.
    Update(Vec<u8>),
}

impl SyncStep {
    pub fn tag(&self) -> u8 {
        match self {
            SyncStep::Step1(_) => STEP1,
            SyncStep::Step2(_) => STEP2,
            SyncStep::Update(_) => UPDATE,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            SyncStep::Step1(p) | SyncStep::Step2(p) | SyncStep::Update(p) => p,
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncStep),
}

impl Message {
    pub fn step1(state_vector: Vec<u8>) -> Self {
        Message::Sync(SyncStep::Step1(state_vector))
    }

    pub fn step2(update: Vec<u8>) -> Self {
        Message::Sync(SyncStep::Step2(update))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Message::Sync(SyncStep::Update(update))
    }

    /// Encode to a wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let Message::Sync(step) = self;
        let payload = step.payload();
        // kind + step + up to 5 varint bytes for realistic payload sizes
        let mut buf = Vec::with_capacity(payload.len() + 7);
        buf.write_u8(MSG_SYNC);
        buf.write_u8(step.tag());
        buf.write_buf(payload);
        buf
    }

    /// Decode a single wire frame. The frame must contain exactly one message.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);

        let kind = cursor
            .read_u8()
            .map_err(|e| ProtocolError::Truncated(e.to_string()))?;
        if kind != MSG_SYNC {
            return Err(ProtocolError::UnknownKind(kind));
        }

        let step = cursor
            .read_u8()
            .map_err(|e| ProtocolError::Truncated(e.to_string()))?;
        if step > UPDATE {
            return Err(ProtocolError::UnknownStep(step));
        }

        let payload = cursor
            .read_buf()
            .map_err(|e| ProtocolError::Truncated(e.to_string()))?
            .to_vec();
        if cursor.has_content() {
            return Err(ProtocolError::TrailingBytes);
        }

        Ok(Message::Sync(match step {
            STEP1 => SyncStep::Step1(payload),
            STEP2 => SyncStep::Step2(payload),
            _ => SyncStep::Update(payload),
        }))
    }
}
