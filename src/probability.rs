// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Time-decayed replication probability.
//!
//! Anti-entropy bandwidth is biased toward recently modified objects: an
//! object written a moment ago is almost certainly offered to the peer, one
//! untouched for a day almost never is.
//!
//! ```text
//! p(t) = exp(minutes_since(t) * LAMBDA)
//!
//!   age     p
//!   0m      1.000
//!   1h      0.825
//!   6h      0.316
//!   24h     0.010
//! ```
//!
//! The random source is injected so tests can seed it. It is shared by the
//! oracle, peer selection and the jittered ticker behind one mutex whose
//! critical section is a single draw.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

/// Decay constant per minute. `exp(1440 * LAMBDA)` is roughly 0.01.
pub const LAMBDA: f64 = -0.0032;

/// Random source shared across the replica.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Build a shared random source; `Some(seed)` makes it deterministic.
pub fn shared_rng(seed: Option<u64>) -> SharedRng {
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    Arc::new(Mutex::new(rng))
}

/// Run `f` with exclusive access to the generator.
///
/// A poisoned lock still holds a usable generator, so it is recovered.
pub fn with_rng<T>(rng: &SharedRng, f: impl FnOnce(&mut StdRng) -> T) -> T {
    let mut guard = rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

/// Probability that an object last modified at `modified` is replicated at `now`.
///
/// Timestamps in the future are treated as "just modified".
pub fn time_probability(modified: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let minutes = (now - modified).num_milliseconds() as f64 / 60_000.0;
    (minutes.max(0.0) * LAMBDA).exp()
}

/// How the oracle selects objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Draw against the time-decayed probability.
    #[default]
    TimeDecay,
    /// Select every object. Used for full reconciliation and in tests.
    Always,
}

/// Decides whether an object takes part in a sync round.
#[derive(Clone)]
pub struct ReplicationOracle {
    rng: SharedRng,
    policy: SelectionPolicy,
}

impl ReplicationOracle {
    pub fn new(rng: SharedRng) -> Self {
        Self {
            rng,
            policy: SelectionPolicy::TimeDecay,
        }
    }

    pub fn with_policy(rng: SharedRng, policy: SelectionPolicy) -> Self {
        Self { rng, policy }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// True if an object modified at `modified` should be sent this round.
    pub fn should_replicate(&self, modified: DateTime<Utc>) -> bool {
        self.should_replicate_at(modified, Utc::now())
    }

    pub fn should_replicate_at(&self, modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.policy {
            SelectionPolicy::Always => true,
            SelectionPolicy::TimeDecay => {
                let p = time_probability(modified, now);
                let draw: f64 = with_rng(&self.rng, |rng| rng.gen());
                draw < p
            }
        }
    }
}

impl std::fmt::Debug for ReplicationOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationOracle")
            .field("policy", &self.policy)
            .finish()
    }
}
