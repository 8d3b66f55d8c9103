//! Session lifecycle signals shared by every per-session task
//!
//! A session is torn down by closing its [`DoneSignal`]; every long-lived
//! loop (signaling reader/writer, RTP reader, PLI ticker, dispatcher) selects
//! on [`DoneSignal::closed`] and exits. The owning supervisor learns about the
//! outcome through [`SessionEvent`]s instead of the process aborting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Shared "done" indicator for one session
#[derive(Clone)]
pub struct DoneSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl DoneSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Close the signal. Idempotent.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal has been closed
    pub async fn closed(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a session as reported to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Peer connection reached the connected state
    Connected,
    /// Session-fatal failure; resources have been released
    Failed(String),
    /// Session ended normally (remote hang-up or local shutdown)
    Closed,
}

/// Sender half used by session tasks to report to the supervisor
#[derive(Clone)]
pub struct SessionReporter {
    session_id: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
    done: DoneSignal,
    /// Set by the first terminal report; the done signal may close earlier
    reported: Arc<AtomicBool>,
}

impl SessionReporter {
    /// Create a reporter plus the receiver the supervisor should poll
    pub fn new(
        session_id: impl Into<String>,
        done: DoneSignal,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id: session_id.into(),
                tx,
                done,
                reported: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn done(&self) -> &DoneSignal {
        &self.done
    }

    pub fn connected(&self) {
        let _ = self.tx.send(SessionEvent::Connected);
    }

    /// Report a fatal failure and tear the session down
    pub fn fail(&self, reason: impl Into<String>) {
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = reason.into();
        warn!(session_id = %self.session_id, "Session failed: {}", reason);
        self.done.close();
        let _ = self.tx.send(SessionEvent::Failed(reason));
    }

    /// Report a normal end of session
    pub fn close(&self) {
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(session_id = %self.session_id, "Session closed");
        self.done.close();
        let _ = self.tx.send(SessionEvent::Closed);
    }
}
