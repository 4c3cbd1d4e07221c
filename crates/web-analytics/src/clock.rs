//! Injectable time source.
//!
//! Event timestamps and credential-expiry decisions go through [`Clock`]
//! rather than reading the wall clock directly, so tests can pin or advance
//! time deterministically.

use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// A source of UTC time.
pub trait Clock: Send + Sync + Debug {
    /// The current moment in UTC.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
