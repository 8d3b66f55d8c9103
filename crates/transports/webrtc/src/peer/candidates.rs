//! Local ICE candidates gathered before the remote description is known
//!
//! Candidates found while the remote description is unset are held in
//! arrival order. Setting the remote description flushes them exactly once,
//! under the same lock that gates new arrivals, so a candidate racing the
//! flush is either in the flushed batch or sent directly, never both and
//! never neither.

use parking_lot::Mutex;

#[derive(Debug)]
struct QueueState<C> {
    remote_set: bool,
    pending: Vec<C>,
}

#[derive(Debug)]
pub struct IceCandidateQueue<C> {
    state: Mutex<QueueState<C>>,
}

impl<C> IceCandidateQueue<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                remote_set: false,
                pending: Vec::new(),
            }),
        }
    }

    /// Hand over a locally discovered candidate
    ///
    /// Returns `true` if `send` was called, `false` if the candidate was queued.
    pub fn offer(&self, candidate: C, send: impl FnOnce(C)) -> bool {
        let mut state = self.state.lock();
        if state.remote_set {
            send(candidate);
            true
        } else {
            state.pending.push(candidate);
            false
        }
    }

    /// Mark the remote description as set and send everything queued
    ///
    /// Returns how many candidates were sent. Later calls send nothing.
    pub fn flush(&self, mut send: impl FnMut(C)) -> usize {
        let mut state = self.state.lock();
        state.remote_set = true;
        let pending = std::mem::take(&mut state.pending);
        let count = pending.len();
        for candidate in pending {
            send(candidate);
        }
        count
    }

    pub fn is_remote_set(&self) -> bool {
        self.state.lock().remote_set
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl<C> Default for IceCandidateQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}
