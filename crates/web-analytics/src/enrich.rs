//! Pluggable event enrichment.
//!
//! Enrichers run at response completion, strictly in registration order,
//! each awaited before the next. An enricher may mutate the event, veto
//! delivery via [`EnrichContext::ignore`], or fail; a veto halts the rest
//! of the chain and the send, and an error aborts the chain and propagates
//! to the completion task.
//!
//! There is no enforced per-enricher timeout. A slow enricher delays only
//! its own request's telemetry task, never the response.

use async_trait::async_trait;

use crate::error::{AnalyticsError, BoxError};
use crate::event::Event;
use crate::feature::EventFeature;
use crate::middleware::RequestInfo;

/// Context handed to each enricher: the event under construction plus the
/// captured request details.
pub struct EnrichContext<'a> {
    feature: &'a EventFeature,
    request: &'a RequestInfo,
}

impl<'a> EnrichContext<'a> {
    pub(crate) fn new(feature: &'a EventFeature, request: &'a RequestInfo) -> Self {
        Self { feature, request }
    }

    /// The captured request details.
    pub fn request(&self) -> &RequestInfo {
        self.request
    }

    /// A snapshot of the event as it currently stands.
    pub fn event(&self) -> Event {
        self.feature.snapshot()
    }

    /// Mutates the event in place.
    pub fn update_event<R>(&self, f: impl FnOnce(&mut Event) -> R) -> R {
        self.feature.with_event(f)
    }

    /// Vetoes delivery of this event. Halts the remaining chain.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::ProtocolMisuse`] if the event was already
    /// sent (enrichers always run before the send, so this only fires on
    /// misuse of a retained handle).
    pub fn ignore(&self) -> Result<(), AnalyticsError> {
        self.feature.ignore()
    }
}

/// A unit of event enrichment registered with the pipeline.
#[async_trait]
pub trait EventEnricher: Send + Sync {
    /// Inspects or mutates the event before delivery.
    async fn enrich(&self, cx: &EnrichContext<'_>) -> Result<(), BoxError>;
}

/// Runs `enrichers` in order against `feature`.
///
/// Returns `true` if the event is still eligible for delivery afterwards,
/// `false` if an enricher vetoed it. The ignore flag is checked immediately
/// after each enricher returns.
///
/// # Errors
///
/// The first enricher error aborts the chain and is returned as
/// [`AnalyticsError::Enrichment`].
pub(crate) async fn run_enrichers(
    enrichers: &[std::sync::Arc<dyn EventEnricher>],
    feature: &EventFeature,
    request: &RequestInfo,
) -> Result<bool, AnalyticsError> {
    let cx = EnrichContext::new(feature, request);
    for enricher in enrichers {
        enricher
            .enrich(&cx)
            .await
            .map_err(AnalyticsError::Enrichment)?;
        if feature.is_ignored() {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn feature() -> EventFeature {
        let event = Event::new(Utc::now(), "test", None).expect("valid event");
        EventFeature::new(event)
    }

    fn request_info() -> RequestInfo {
        RequestInfo::for_tests("GET", "/test", None)
    }

    struct TagEnricher(&'static str);

    #[async_trait]
    impl EventEnricher for TagEnricher {
        async fn enrich(&self, cx: &EnrichContext<'_>) -> Result<(), BoxError> {
            cx.update_event(|event| event.add_tag(self.0));
            Ok(())
        }
    }

    struct VetoEnricher;

    #[async_trait]
    impl EventEnricher for VetoEnricher {
        async fn enrich(&self, cx: &EnrichContext<'_>) -> Result<(), BoxError> {
            cx.ignore()?;
            Ok(())
        }
    }

    struct CountingEnricher(Arc<AtomicUsize>);

    #[async_trait]
    impl EventEnricher for CountingEnricher {
        async fn enrich(&self, _cx: &EnrichContext<'_>) -> Result<(), BoxError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingEnricher;

    #[async_trait]
    impl EventEnricher for FailingEnricher {
        async fn enrich(&self, _cx: &EnrichContext<'_>) -> Result<(), BoxError> {
            Err("lookup failed".into())
        }
    }

    #[tokio::test]
    async fn runs_in_registration_order() {
        let feature = feature();
        let enrichers: Vec<Arc<dyn EventEnricher>> = vec![
            Arc::new(TagEnricher("first")),
            Arc::new(TagEnricher("second")),
        ];
        let eligible = run_enrichers(&enrichers, &feature, &request_info())
            .await
            .expect("chain succeeds");
        assert!(eligible);
        assert_eq!(feature.snapshot().tags(), ["first", "second"]);
    }

    #[tokio::test]
    async fn veto_halts_remaining_chain() {
        let feature = feature();
        let calls = Arc::new(AtomicUsize::new(0));
        let enrichers: Vec<Arc<dyn EventEnricher>> = vec![
            Arc::new(VetoEnricher),
            Arc::new(CountingEnricher(calls.clone())),
        ];
        let eligible = run_enrichers(&enrichers, &feature, &request_info())
            .await
            .expect("chain succeeds");
        assert!(!eligible);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(feature.is_ignored());
    }

    #[tokio::test]
    async fn error_aborts_chain_and_propagates() {
        let feature = feature();
        let calls = Arc::new(AtomicUsize::new(0));
        let enrichers: Vec<Arc<dyn EventEnricher>> = vec![
            Arc::new(FailingEnricher),
            Arc::new(CountingEnricher(calls.clone())),
        ];
        let err = run_enrichers(&enrichers, &feature, &request_info())
            .await
            .expect_err("chain must fail");
        assert!(matches!(err, AnalyticsError::Enrichment(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
