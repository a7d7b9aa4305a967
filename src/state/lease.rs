//! Time-bounded leases guarding state mutation.
//!
//! A run must hold the current, unexpired lease to write state. An
//! expired lease may be taken over by another run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Information about a state lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    /// Unique lease identifier.
    pub lease_id: String,
    /// Who holds the lease.
    pub holder: String,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Creates a new lease valid for `ttl`.
    #[must_use]
    pub fn new(holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            lease_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: expiry(now, ttl),
        }
    }

    /// Checks if the lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Pushes the expiry to `ttl` from now.
    pub fn extend(&mut self, ttl: Duration) {
        self.expires_at = expiry(Utc::now(), ttl);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

fn expiry(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}
