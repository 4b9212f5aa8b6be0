//! Host port allocation for workspace containers
//!
//! Ports are drawn uniformly from the configured range, skipping ports
//! already claimed by a workspace or reserved for the gateway itself, and
//! probed with a local bind to catch ports held by unrelated processes.

use crate::error::GatewayError;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use tracing::debug;

/// Upper bound on candidate probes per acquisition.
const MAX_PROBE_ATTEMPTS: u32 = 128;

/// Hands out host ports for new workspaces.
///
/// The claimed set is guarded by a mutex held across the whole
/// probe-and-claim sequence, so two concurrent acquisitions can never
/// return the same port. The bind probe is synchronous; no suspension
/// point occurs while the lock is held.
pub struct PortAllocator {
    range: (u16, u16),
    claimed: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: (u16, u16)) -> Self {
        Self {
            range,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Mark a port as permanently claimed (the gateway's own listeners).
    pub fn reserve(&self, port: u16) {
        self.claimed.lock().insert(port);
    }

    /// Claim a free port from the configured range.
    pub fn acquire(&self) -> Result<u16, GatewayError> {
        let (low, high) = self.range;
        let mut claimed = self.claimed.lock();
        let mut rng = rand::thread_rng();

        for _ in 0..MAX_PROBE_ATTEMPTS {
            let candidate = rng.gen_range(low..=high);

            if claimed.contains(&candidate) {
                continue;
            }

            // The port may be held by a process outside our bookkeeping.
            if !probe_bindable(candidate) {
                debug!(port = candidate, "Port occupied externally, skipping");
                continue;
            }

            claimed.insert(candidate);
            debug!(port = candidate, "Port claimed");
            return Ok(candidate);
        }

        Err(GatewayError::PortExhausted)
    }

    /// Re-claim a specific port for a workspace adopted during reconcile.
    /// Returns false if the port is already claimed by someone else.
    pub fn claim(&self, port: u16) -> bool {
        self.claimed.lock().insert(port)
    }

    /// Return a port to the pool. Only called once the owning workspace
    /// has reached the removed state.
    pub fn release(&self, port: u16) {
        if self.claimed.lock().remove(&port) {
            debug!(port, "Port released");
        }
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().len()
    }
}

/// Check whether the port can be bound locally right now.
fn probe_bindable(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}
