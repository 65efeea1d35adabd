//! Per-connection sync state machine.
//!
//! ```text
//!            open()                 STEP2 received
//!  Opened ───────────► AwaitingStep2 ──────────────► Synced
//!            sends STEP1                               │  ▲
//!                                                      └──┘ STEP1 / UPDATE
//! ```
//!
//! The exchange is symmetric: the relay and the client both run a
//! `SyncSession`. Each side sends its state vector, answers the other's
//! vector with exactly the update it is missing, and from then on streams
//! live edits. The session never touches the socket; it returns the frames
//! to send and leaves fan-out and persistence to the caller.

use aegis_core::{ReplicaDoc, SharedDoc};
use thiserror::Error;

use crate::protocol::{Message, ProtocolError, SyncStep};

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Created, nothing sent yet.
    Opened,
    /// Our STEP1 is out; waiting for the peer's STEP2.
    AwaitingStep2,
    /// The peer's answer has been merged.
    Synced,
}

/// Session errors. Any of these ends the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// What the transport must do after a frame was processed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SessionOutput {
    /// Frames to send back to the peer, in order.
    pub replies: Vec<Vec<u8>>,
    /// Frame to fan out to the rest of the room.
    pub broadcast: Option<Vec<u8>>,
    /// Update that changed the local document, for persistence.
    pub applied: Option<Vec<u8>>,
}

/// Sync protocol driver for one connection to one document.
pub struct SyncSession<D> {
    doc: SharedDoc<D>,
    state: HandshakeState,
    label: String,
}

impl<D: ReplicaDoc> SyncSession<D> {
    /// `label` names the peer/room in log lines.
    pub fn new(doc: SharedDoc<D>, label: impl Into<String>) -> Self {
        Self {
            doc,
            state: HandshakeState::Opened,
            label: label.into(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == HandshakeState::Synced
    }

    pub fn doc(&self) -> &SharedDoc<D> {
        &self.doc
    }

    /// Start the handshake: returns the STEP1 frame carrying our state vector.
    ///
    /// Callers that fan out updates must join the room before calling this,
    /// so no edit can fall between the vector and the membership.
    pub fn open(&mut self) -> Vec<u8> {
        let vector = self.doc.state_vector();
        if self.state == HandshakeState::Opened {
            self.state = HandshakeState::AwaitingStep2;
        }
        log::debug!("[{}] sending STEP1 ({} bytes)", self.label, vector.len());
        Message::step1(vector).encode()
    }

    /// Process one incoming frame.
    ///
    /// Returns `Err` only for frames that cannot be decoded; the connection
    /// must then be closed. Updates the document rejects are logged and
    /// dropped.
    pub fn on_frame(&mut self, frame: &[u8]) -> Result<SessionOutput, SessionError> {
        let Message::Sync(step) = Message::decode(frame)?;
        let mut output = SessionOutput::default();

        match step {
            SyncStep::Step1(remote_vector) => match self.doc.encode_diff(&remote_vector) {
                Ok(diff) => {
                    log::debug!("[{}] answering STEP1 with {} bytes", self.label, diff.len());
                    output.replies.push(Message::step2(diff).encode());
                }
                Err(e) => log::warn!("[{}] dropping STEP1: {e}", self.label),
            },

            SyncStep::Step2(update) => {
                if self.merge(&update, "STEP2") {
                    // The peer's offline edits are new to everyone else too.
                    output.broadcast = Some(Message::update(update.clone()).encode());
                    output.applied = Some(update);
                }
                if self.state != HandshakeState::Synced {
                    self.state = HandshakeState::Synced;
                    log::debug!("[{}] handshake complete", self.label);
                }
            }

            SyncStep::Update(update) => {
                if self.merge(&update, "UPDATE") {
                    output.broadcast = Some(frame.to_vec());
                    output.applied = Some(update);
                }
            }
        }

        Ok(output)
    }

    /// Apply an update. Returns whether the document changed.
    fn merge(&self, update: &[u8], kind: &str) -> bool {
        match self.doc.apply_update(update) {
            Ok(outcome) => {
                log::debug!("[{}] {kind} applied: {outcome:?}", self.label);
                outcome.is_changed()
            }
            Err(e) => {
                log::warn!("[{}] dropping {kind}: {e}", self.label);
                false
            }
        }
    }
}
