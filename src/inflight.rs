//! In-flight Deduplication
//!
//! Guarantees that each `(fingerprint, tier)` pair is computed at most once at
//! a time. The first caller becomes the leader and receives a [`Publisher`];
//! everyone arriving while the computation runs receives a [`Waiter`] that
//! resolves to the same [`Outcome`].
//!
//! Registration happens under one lock together with a caller-supplied cache
//! re-check, which closes the window where a computation finishes (writes the
//! cache, deregisters) between a caller's cache miss and its registration.
//!
//! ## Usage
//!
//! ```rust
//! use tokio_math_cascade::inflight::{InFlightRegistry, Registration};
//! use tokio_math_cascade::cache::CacheKey;
//! use tokio_math_cascade::{fingerprint, Outcome, TierId};
//! # #[tokio::main]
//! # async fn main() {
//! let registry = InFlightRegistry::new();
//! let key = CacheKey::new(&fingerprint("2+2"), TierId::Symbolic);
//!
//! match registry.join_or_register(key, || None) {
//!     Registration::Leader { publisher, waiter } => {
//!         publisher.publish(Outcome::solved("4", "arithmetic"));
//!         assert!(waiter.wait().await.is_ok());
//!     }
//!     Registration::Joined(waiter) => { let _ = waiter.wait().await; }
//!     Registration::Cached(outcome) => { let _ = outcome; }
//! }
//! # }
//! ```

use crate::cache::CacheKey;
use crate::{CascadeError, Outcome};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

type Slots = Arc<Mutex<HashMap<CacheKey, watch::Receiver<Option<Outcome>>>>>;

/// Registry of computations currently running.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    slots: Slots,
}

/// Result of [`InFlightRegistry::join_or_register`].
pub enum Registration {
    /// No computation was running; the caller must run one and publish.
    Leader {
        /// Completes the registration.
        publisher: Publisher,
        /// Lets the leader await its own (possibly spawned) computation.
        waiter: Waiter,
    },
    /// A computation is already running; await its outcome.
    Joined(Waiter),
    /// The re-check found a fresh cached outcome; nothing to run.
    Cached(Outcome),
}

/// Write side of a registration. Dropping it without publishing removes the
/// registration and wakes waiters with an error.
pub struct Publisher {
    key: CacheKey,
    tx: watch::Sender<Option<Outcome>>,
    slots: Slots,
    published: bool,
}

/// Read side of a registration.
pub struct Waiter {
    key: CacheKey,
    rx: watch::Receiver<Option<Outcome>>,
}

impl InFlightRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the computation for `key`, or register a new one.
    ///
    /// `recheck` runs under the registry lock only when no computation is
    /// registered; returning `Some` short-circuits to
    /// [`Registration::Cached`]. It must not block.
    pub fn join_or_register<F>(&self, key: CacheKey, recheck: F) -> Registration
    where
        F: FnOnce() -> Option<Outcome>,
    {
        let mut slots = self.slots.lock();

        if let Some(rx) = slots.get(&key) {
            debug!(key = %key, "joining in-flight computation");
            return Registration::Joined(Waiter {
                key,
                rx: rx.clone(),
            });
        }

        if let Some(outcome) = recheck() {
            debug!(key = %key, "outcome cached while registering");
            return Registration::Cached(outcome);
        }

        let (tx, rx) = watch::channel(None);
        slots.insert(key.clone(), rx.clone());
        debug!(key = %key, "registered in-flight computation");

        Registration::Leader {
            publisher: Publisher {
                key: key.clone(),
                tx,
                slots: Arc::clone(&self.slots),
                published: false,
            },
            waiter: Waiter { key, rx },
        }
    }

    /// Number of computations currently registered.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// `true` when nothing is running.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Whether a computation for `key` is registered.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots.lock().contains_key(key)
    }
}

impl Publisher {
    /// The key this publisher completes.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Deregister and deliver `outcome` to every waiter.
    ///
    /// Callers should write the cache before publishing so a request arriving
    /// after deregistration finds the outcome there.
    pub fn publish(mut self, outcome: Outcome) {
        let mut slots = self.slots.lock();
        slots.remove(&self.key);
        // send only fails when every receiver is gone, which is fine
        let _ = self.tx.send(Some(outcome));
        self.published = true;
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if !self.published {
            warn!(key = %self.key, "in-flight computation dropped without an outcome");
            self.slots.lock().remove(&self.key);
        }
    }
}

impl Waiter {
    /// Wait for the published outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CascadeError::Invariant`] if the publisher was dropped
    /// without publishing.
    pub async fn wait(mut self) -> Result<Outcome, CascadeError> {
        let key = self.key;
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().ok_or_else(|| {
                CascadeError::Invariant(format!("in-flight slot for {key} resolved empty"))
            }),
            Err(_) => Err(CascadeError::Invariant(format!(
                "in-flight computation for {key} ended without an outcome"
            ))),
        }
    }
}

impl std::fmt::Debug for InFlightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("in_flight", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fingerprint, TierId};

    fn key(q: &str) -> CacheKey {
        CacheKey::new(&fingerprint(q), TierId::Symbolic)
    }

    #[tokio::test]
    async fn test_first_caller_leads_second_joins() {
        let registry = InFlightRegistry::new();

        let Registration::Leader { publisher, waiter } = registry.join_or_register(key("q"), || None)
        else {
            panic!("first caller must lead");
        };
        let Registration::Joined(joined) = registry.join_or_register(key("q"), || None) else {
            panic!("second caller must join");
        };
        assert_eq!(registry.len(), 1);

        publisher.publish(Outcome::solved("1", "t"));
        assert_eq!(waiter.wait().await.expect("test: leader"), Outcome::solved("1", "t"));
        assert_eq!(joined.wait().await.expect("test: joiner"), Outcome::solved("1", "t"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_recheck_short_circuits_registration() {
        let registry = InFlightRegistry::new();
        let reg = registry.join_or_register(key("q"), || Some(Outcome::solved("c", "cache")));
        assert!(matches!(reg, Registration::Cached(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_recheck_not_consulted_when_joining() {
        let registry = InFlightRegistry::new();
        let _lead = registry.join_or_register(key("q"), || None);
        let reg = registry.join_or_register(key("q"), || panic!("recheck must not run"));
        assert!(matches!(reg, Registration::Joined(_)));
    }

    #[tokio::test]
    async fn test_dropped_publisher_errors_waiters_and_deregisters() {
        let registry = InFlightRegistry::new();
        let Registration::Leader { publisher, waiter } = registry.join_or_register(key("q"), || None)
        else {
            panic!("first caller must lead");
        };
        drop(publisher);

        assert!(registry.is_empty());
        assert!(matches!(waiter.wait().await, Err(CascadeError::Invariant(_))));
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let registry = InFlightRegistry::new();
        let a = registry.join_or_register(key("a"), || None);
        let b = registry.join_or_register(key("b"), || None);
        let c = registry.join_or_register(
            CacheKey::new(&fingerprint("a"), TierId::Reasoning),
            || None,
        );
        assert!(matches!(a, Registration::Leader { .. }));
        assert!(matches!(b, Registration::Leader { .. }));
        assert!(matches!(c, Registration::Leader { .. }));
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_waiter_joining_after_publish_still_sees_outcome() {
        let registry = InFlightRegistry::new();
        let Registration::Leader { publisher, .. } = registry.join_or_register(key("q"), || None)
        else {
            panic!("first caller must lead");
        };
        let Registration::Joined(late) = registry.join_or_register(key("q"), || None) else {
            panic!("must join");
        };
        publisher.publish(Outcome::unsolvable("no"));
        assert_eq!(late.wait().await.expect("test: late"), Outcome::unsolvable("no"));
    }
}
