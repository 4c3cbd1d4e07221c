//! Admission control for telemetry delivery.
//!
//! The admission controller is a backpressure valve, not a queue: when the
//! pipeline is over budget the event is dropped on the spot. Losing
//! telemetry under sustained overload is preferable to amplifying load on
//! the warehouse or delaying the response.
//!
//! [`EndpointRateLimiter`] partitions by `(method, path)` and admits at
//! most one event per interval per partition, with an LRU-bounded partition
//! table so unbounded route cardinality cannot grow memory without limit.

use std::fmt::Debug;
use std::hash::{BuildHasher, BuildHasherDefault, Hasher};
use std::sync::Mutex;
use std::time::Duration;

#[cfg(test)]
use mock_instant::global::Instant;
#[cfg(not(test))]
use std::time::Instant;

use fnv::FnvBuildHasher;
use ordered_hash_map::OrderedHashMap;

/// Default number of `(method, path)` partitions tracked before LRU eviction.
const DEFAULT_PARTITION_CAPACITY: usize = 4_096;

/// A granted admission lease.
///
/// Releasing is idempotent. The built-in interval limiter has nothing to
/// hand back, but I/O-bound controllers can use the release signal to
/// return permits.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmissionLease {
    released: bool,
}

impl AdmissionLease {
    /// Returns the lease. Safe to call more than once.
    pub fn release(&mut self) {
        self.released = true;
    }

    /// Whether the lease has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Outcome of an admission check.
#[derive(Debug)]
pub enum AdmissionDecision {
    /// The event may be delivered.
    Granted(AdmissionLease),
    /// The event must be dropped. No queueing, no retry.
    Denied,
}

impl AdmissionDecision {
    /// Whether the decision admits the event.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Decides whether a request's event may be delivered.
pub trait AdmissionController: Send + Sync + Debug {
    /// Makes an admission decision for the given request signature.
    fn try_acquire(&self, method: &str, path: &str) -> AdmissionDecision;
}

#[derive(Debug, Clone, Copy)]
struct PartitionState {
    last_admitted: Instant,
}

/// Interval-based, per-endpoint admission controller.
///
/// Each `(method, path)` pair is admitted at most once per `interval`.
/// Partitions are tracked in an LRU map; when capacity is reached the
/// least recently seen endpoint is evicted.
#[derive(Debug)]
pub struct EndpointRateLimiter {
    interval: Duration,
    partitions: Mutex<OrderedHashMap<u64, PartitionState, BuildIdentityHasher>>,
    capacity: usize,
    hasher_builder: FnvBuildHasher,
}

impl EndpointRateLimiter {
    /// Creates a limiter admitting one event per `interval` per endpoint,
    /// with the default partition capacity.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self::with_capacity(interval, DEFAULT_PARTITION_CAPACITY)
    }

    /// Creates a limiter with an explicit partition capacity (minimum 1).
    #[must_use]
    pub fn with_capacity(interval: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            interval,
            partitions: Mutex::new(OrderedHashMap::with_capacity_and_hasher(
                capacity,
                BuildIdentityHasher::default(),
            )),
            capacity,
            hasher_builder: FnvBuildHasher::default(),
        }
    }

    /// Hash of the partition signature `method \0 path`. The null delimiter
    /// keeps `("GET", "a/b")` distinct from `("GETa", "/b")`.
    fn partition_hash(&self, method: &str, path: &str) -> u64 {
        let mut hasher = self.hasher_builder.build_hasher();
        hasher.write(method.as_bytes());
        hasher.write_u8(0);
        hasher.write(path.as_bytes());
        hasher.finish()
    }
}

impl AdmissionController for EndpointRateLimiter {
    fn try_acquire(&self, method: &str, path: &str) -> AdmissionDecision {
        let hash = self.partition_hash(method, path);

        let mut partitions = match self.partitions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(state) = partitions.get_mut(&hash) {
            if state.last_admitted.elapsed() >= self.interval {
                state.last_admitted = Instant::now();
                partitions.move_to_back(&hash);
                AdmissionDecision::Granted(AdmissionLease::default())
            } else {
                // Within the interval; keep the partition hot so active
                // endpoints are not evicted while being throttled.
                partitions.move_to_back(&hash);
                AdmissionDecision::Denied
            }
        } else {
            if partitions.len() >= self.capacity {
                partitions.pop_front();
            }
            partitions.insert(
                hash,
                PartitionState {
                    last_admitted: Instant::now(),
                },
            );
            AdmissionDecision::Granted(AdmissionLease::default())
        }
    }
}

type BuildIdentityHasher = BuildHasherDefault<IdentityHasher>;

/// Pass-through hasher for keys that are already fnv hashes.
#[derive(Debug, Default, Clone, Copy)]
struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn write(&mut self, _: &[u8]) {
        unimplemented!("IdentityHasher only accepts u64 keys")
    }

    fn write_u64(&mut self, v: u64) {
        self.0 = v;
    }

    fn finish(&self) -> u64 {
        self.0
    }
}
