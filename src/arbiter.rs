//! Codec resource arbitration: a process-wide broker that can tell any
//! running session to give its codecs back, the pause gate sessions use to
//! suspend work at sample boundaries, and the opaque checkpoint token handed
//! to clients for resume.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TranscodeError};

/// Asynchronous "codec resources reclaimed" signal. Sessions subscribed to a
/// broker pause within a bounded time of receiving it.
#[derive(Debug, Clone, Copy)]
pub struct ResourceReclaim;

/// Fan-out handle for resource-reclamation signals. Cloneable; one broker
/// may serve any number of sessions, and a session without a broker is never
/// paused externally.
#[derive(Clone)]
pub struct ResourceBroker {
    tx: tokio::sync::broadcast::Sender<ResourceReclaim>,
}

impl ResourceBroker {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(16);
        Self { tx }
    }

    /// Signal every subscribed session to release codec resources.
    pub fn reclaim(&self) {
        let n = self.tx.send(ResourceReclaim).unwrap_or(0);
        log::info!("resource reclaim signalled to {n} sessions");
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ResourceReclaim> {
        self.tx.subscribe()
    }
}

impl Default for ResourceBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Suspension point shared by a session's workers. Closed gate = paused;
/// workers observe it between samples and never mid-codec-call.
#[derive(Clone, Default)]
pub struct PauseGate {
    closed: Arc<AtomicBool>,
}

impl PauseGate {
    /// Poll interval for blocking waiters while paused.
    const POLL: Duration = Duration::from_millis(1);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Park a blocking worker until the gate opens or the session cancels.
    pub fn wait_open_blocking(&self, cancel: &CancellationToken) {
        while self.is_closed() && !cancel.is_cancelled() {
            std::thread::sleep(Self::POLL);
        }
    }
}

/// Per-track resume checkpoint: how many output samples had been committed
/// when the session paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackCheckpoint {
    pub track: usize,
    pub samples_written: u64,
}

/// Opaque-to-the-client pause state delivered with
/// [`crate::events::TranscodeEvent::ResourceLost`]. The wire form (JSON) and
/// contents are engine policy, not a protocol; clients treat the bytes as a
/// ticket and hand them back to `resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseToken {
    pub session: u64,
    pub tracks: Vec<TrackCheckpoint>,
}

impl PauseToken {
    pub fn to_bytes(&self) -> Bytes {
        // Serialization of a plain struct cannot fail.
        Bytes::from(serde_json::to_vec(self).expect("pause token serialization"))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| TranscodeError::ResumeRejected(format!("malformed token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_through_opaque_bytes() {
        let token = PauseToken {
            session: 7,
            tracks: vec![
                TrackCheckpoint { track: 0, samples_written: 120 },
                TrackCheckpoint { track: 1, samples_written: 88 },
            ],
        };
        let parsed = PauseToken::from_bytes(&token.to_bytes()).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn garbage_token_is_rejected() {
        let err = PauseToken::from_bytes(b"not json").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ResumeRejected);
    }

    #[test]
    fn gate_open_close() {
        let gate = PauseGate::new();
        assert!(!gate.is_closed());
        gate.close();
        assert!(gate.is_closed());
        gate.open();
        assert!(!gate.is_closed());
    }
}
