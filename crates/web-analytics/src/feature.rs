//! Request-scoped owner of one [`Event`].
//!
//! The capture middleware creates one [`EventFeature`] per request and
//! publishes a handle in the request's extensions. Downstream handler code
//! can read or mutate the event, or ignore it entirely; the completion task
//! drives it to a terminal state. The handle is cloneable but only ever
//! shared between the request's own handler chain and its own completion
//! task, never across requests.
//!
//! Sending is exactly-once: marking an event sent twice, or ignoring it
//! after it was sent, is a programmer fault and raises
//! [`AnalyticsError::ProtocolMisuse`] rather than silently no-opping.

use std::sync::{Arc, Mutex};

use crate::error::AnalyticsError;
use crate::event::Event;

/// Where the event is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureState {
    /// Created or populated; still eligible for delivery.
    Active,
    /// Vetoed before delivery. Terminal.
    Ignored,
    /// Dropped by admission control. Terminal.
    Dropped,
    /// Delivered to the warehouse. Terminal.
    Sent,
}

#[derive(Debug)]
struct Inner {
    event: Event,
    state: FeatureState,
}

/// Cloneable handle to the per-request event and its send/ignore state.
#[derive(Debug, Clone)]
pub struct EventFeature {
    inner: Arc<Mutex<Inner>>,
}

impl EventFeature {
    /// Wraps a freshly initialized event.
    #[must_use]
    pub fn new(event: Event) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                event,
                state: FeatureState::Active,
            })),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FeatureState {
        self.lock().state
    }

    /// Whether the event has been ignored.
    pub fn is_ignored(&self) -> bool {
        self.state() == FeatureState::Ignored
    }

    /// Whether the event has been delivered.
    pub fn is_sent(&self) -> bool {
        self.state() == FeatureState::Sent
    }

    /// Runs `f` with mutable access to the event.
    pub fn with_event<R>(&self, f: impl FnOnce(&mut Event) -> R) -> R {
        f(&mut self.lock().event)
    }

    /// Clones the current event, e.g. to build the insert row.
    pub fn snapshot(&self) -> Event {
        self.lock().event.clone()
    }

    /// Marks the event ignored so it will not be delivered.
    ///
    /// Idempotent before the send.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::ProtocolMisuse`] if the event was already
    /// sent.
    pub fn ignore(&self) -> Result<(), AnalyticsError> {
        let mut inner = self.lock();
        match inner.state {
            FeatureState::Sent => Err(AnalyticsError::ProtocolMisuse(
                "cannot ignore an event that has already been sent",
            )),
            _ => {
                inner.state = FeatureState::Ignored;
                Ok(())
            }
        }
    }

    /// Records an admission-control drop. Terminal; no row is inserted.
    pub(crate) fn mark_dropped(&self) {
        let mut inner = self.lock();
        if inner.state == FeatureState::Active {
            inner.state = FeatureState::Dropped;
        }
    }

    /// Records that the event's row was inserted.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::ProtocolMisuse`] on a second call.
    pub(crate) fn mark_sent(&self) -> Result<(), AnalyticsError> {
        let mut inner = self.lock();
        if inner.state == FeatureState::Sent {
            return Err(AnalyticsError::ProtocolMisuse(
                "the event has already been sent",
            ));
        }
        inner.state = FeatureState::Sent;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The handle never crosses a panic boundary while locked.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn feature() -> EventFeature {
        let event = Event::new(Utc::now(), "test", None).expect("valid event");
        EventFeature::new(event)
    }

    #[test]
    fn starts_active() {
        assert_eq!(feature().state(), FeatureState::Active);
    }

    #[test]
    fn ignore_is_idempotent_before_send() {
        let feature = feature();
        feature.ignore().expect("first ignore succeeds");
        feature.ignore().expect("second ignore is a no-op");
        assert!(feature.is_ignored());
    }

    #[test]
    fn ignore_after_send_raises() {
        let feature = feature();
        feature.mark_sent().expect("first send succeeds");
        let err = feature.ignore().expect_err("ignore after send must fail");
        assert!(matches!(err, AnalyticsError::ProtocolMisuse(_)));
    }

    #[test]
    fn double_send_raises() {
        let feature = feature();
        feature.mark_sent().expect("first send succeeds");
        let err = feature.mark_sent().expect_err("second send must fail");
        assert!(matches!(err, AnalyticsError::ProtocolMisuse(_)));
    }

    #[test]
    fn dropped_is_terminal_for_active_events() {
        let feature = feature();
        feature.mark_dropped();
        assert_eq!(feature.state(), FeatureState::Dropped);
    }

    #[test]
    fn handles_share_state() {
        let feature = feature();
        let other = feature.clone();
        other.with_event(|event| event.add_tag("shared"));
        assert_eq!(feature.snapshot().tags(), ["shared"]);
    }
}
