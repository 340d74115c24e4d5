//! Replay isolation flag.
//!
//! While a replay lease is held, the event store refuses every
//! append. The gate is shared between the store and the replay
//! engine; the lease releases on drop, so an early return from a
//! failed replay still reopens the write path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared replay-active flag.
#[derive(Debug, Default)]
pub struct ReplayGate {
    active: AtomicUsize,
}

impl ReplayGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Acquire a lease; appends are blocked until it drops.
    pub fn acquire(self: &Arc<Self>) -> ReplayLease {
        self.active.fetch_add(1, Ordering::SeqCst);
        tracing::info!("replay mode activated; persistence blocked");
        ReplayLease {
            gate: Arc::clone(self),
        }
    }
}

/// RAII lease over the replay gate.
#[derive(Debug)]
pub struct ReplayLease {
    gate: Arc<ReplayGate>,
}

impl Drop for ReplayLease {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
        tracing::info!("replay mode deactivated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_toggles_the_gate() {
        let gate = ReplayGate::new();
        assert!(!gate.is_active());
        {
            let _lease = gate.acquire();
            assert!(gate.is_active());
        }
        assert!(!gate.is_active());
    }

    #[test]
    fn nested_leases_release_in_any_order() {
        let gate = ReplayGate::new();
        let a = gate.acquire();
        let b = gate.acquire();
        drop(a);
        assert!(gate.is_active());
        drop(b);
        assert!(!gate.is_active());
    }
}
