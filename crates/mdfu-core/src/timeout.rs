//! Monotonic deadlines for polled transport reads.

use std::time::{Duration, Instant};

/// A fixed point in monotonic time against which polling loops are bounded.
///
/// A deadline is armed once before the first MAC access of an operation and
/// consulted between accesses; the individual MAC calls stay short so the
/// loop can observe expiry promptly.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    /// Arm a deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
        }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left until expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}
