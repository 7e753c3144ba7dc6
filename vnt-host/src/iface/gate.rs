use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureState {
    #[default]
    Idle,
    /// A capture was requested and its command is being started.
    Starting,
    /// The capture command is running, or failed to start, and its result is pending.
    Capturing,
}

/// Single-slot readiness signal of the packet capture of one interface.
///
/// Arming the gate reserves the slot until the returned [`CaptureGuard`] is dropped. The guard
/// releases the readiness signal exactly once: explicitly once the capture command runs or
/// failed to start, or on drop otherwise.
#[derive(Debug, Default)]
pub struct CaptureGate {
    state: Mutex<CaptureState>,
    ready: Notify,
    releases: AtomicU64,
}

impl CaptureGate {
    /// Reserves the slot, or returns `None` when a capture is already in progress.
    pub fn arm(self: &Arc<Self>) -> Option<CaptureGuard> {
        let mut state = self.state.lock();
        if *state != CaptureState::Idle {
            return None;
        }

        *state = CaptureState::Starting;
        Some(CaptureGuard { gate: Arc::clone(self), released: false })
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    /// Number of times the readiness signal was released.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    /// Waits until no capture is starting. Returns right away if none was requested.
    pub async fn ready(&self) {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state() != CaptureState::Starting {
                return;
            }

            notified.await;
        }
    }

    fn transition(&self, next: CaptureState) {
        let was_starting = {
            let mut state = self.state.lock();
            let was_starting = *state == CaptureState::Starting;
            *state = next;
            was_starting
        };

        if was_starting {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.ready.notify_waiters();
        }
    }
}

/// Reservation of a [`CaptureGate`], held for the whole duration of one capture.
#[derive(Debug)]
pub struct CaptureGuard {
    gate: Arc<CaptureGate>,
    released: bool,
}

impl CaptureGuard {
    /// Signals readiness. Later calls are no-ops.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.transition(CaptureState::Capturing);
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.gate.transition(CaptureState::Idle);
    }
}
