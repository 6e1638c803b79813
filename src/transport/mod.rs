//! Session transport to the realtime inference service.
//!
//! The vendor endpoint is an opaque collaborator behind a narrow capability
//! interface: connect non-blocking, send encoded chunks while Open, close.
//! Everything inbound (open ack, audio, barge-in, close, errors) arrives as
//! [`TransportEvent`]s on a channel, never by blocking the caller. The state
//! machine is Idle → Opening → Open → Closed; there is no reconnect, a new
//! call makes a new transport.

pub mod live;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Start configuration handed to the remote endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub api_key: String,
    pub host: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

/// Lifecycle of the logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Idle = 0,
    Opening = 1,
    Open = 2,
    Closed = 3,
}

impl TransportState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransportState::Idle,
            1 => TransportState::Opening,
            2 => TransportState::Open,
            _ => TransportState::Closed,
        }
    }
}

/// Inbound events from the remote; audio payloads are PCM16 bytes with the
/// base64 wrapping already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The remote acknowledged setup; the channel is Open.
    Opened,
    /// One synthesized audio chunk (PCM16 LE at the playback rate).
    Audio(Vec<u8>),
    /// Barge-in: discard all in-flight playback.
    Interrupted,
    /// The remote finished a response turn.
    TurnComplete,
    /// The remote closed the channel.
    Closed,
    /// The channel failed; the session tears down.
    Error(String),
}

/// Capability interface over the vendor channel. Implementations deliver
/// inbound traffic through the event channel supplied at connect time.
pub trait SessionTransport: Send {
    fn state(&self) -> TransportState;

    /// Send one encoded chunk. Valid only while Open: in any other state the
    /// chunk is dropped (counted, never queued) and `false` is returned.
    fn send(&self, chunk: &[u8]) -> bool;

    /// Request shutdown. Fire-and-forget on the wire; the local state always
    /// resolves to Closed even when the remote is unresponsive.
    fn close(&mut self);

    /// Chunks dropped by `send` calls outside the Open state.
    fn dropped_sends(&self) -> usize;
}

/// Lock-free state cell shared between a transport handle and its I/O thread.
#[derive(Clone, Debug)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new(state: TransportState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub(crate) fn get(&self) -> TransportState {
        TransportState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: TransportState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_round_trips_every_state() {
        let cell = StateCell::new(TransportState::Idle);
        for state in [
            TransportState::Opening,
            TransportState::Open,
            TransportState::Closed,
            TransportState::Idle,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn unknown_state_bits_resolve_to_closed() {
        assert_eq!(TransportState::from_u8(200), TransportState::Closed);
    }
}
