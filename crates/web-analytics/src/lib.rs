//! Per-request web analytics capture for tower/axum services.
//!
//! The capture middleware records one `web_request` event per inbound HTTP
//! request and streams it, after the response has been sent, as a single
//! row into a BigQuery dataset. Handlers can enrich or veto the event
//! through a request-scoped feature handle; pluggable enrichers,
//! completion-time filtering, and admission control shape what is
//! delivered.
//!
//! Warehouse credentials come from a [`credentials::BigQueryClientProvider`]:
//! either a static preconfigured client or a federated provider that
//! converts a projected workload-identity token into a short-lived
//! service-account credential via a three-hop token exchange, cached until
//! shortly before expiry.
//!
//! ```no_run
//! use std::sync::Arc;
//! use web_analytics::{
//!     AnalyticsConfig, AnalyticsPipeline, BigQueryClient, CaptureLayer,
//!     StaticClientProvider,
//! };
//!
//! let config = AnalyticsConfig::new("production", "analytics");
//! let client = BigQueryClient::new("my-project", "access-token");
//! let pipeline = Arc::new(AnalyticsPipeline::new(
//!     config,
//!     Arc::new(StaticClientProvider::new(Some(client))),
//! ));
//! let app: axum::Router = axum::Router::new().layer(CaptureLayer::new(pipeline));
//! ```

#![deny(clippy::all)]

pub mod admission;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod enrich;
pub mod error;
pub mod event;
pub mod feature;
pub mod middleware;
pub mod sink;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionLease, EndpointRateLimiter};
pub use clock::{Clock, SystemClock};
pub use config::{AnalyticsConfig, FederationConfig, RequestFilter, UserIdResolver};
pub use credentials::{BigQueryClientProvider, FederatedClientProvider, StaticClientProvider};
pub use enrich::{EnrichContext, EventEnricher};
pub use error::{AnalyticsError, BoxError};
pub use event::{anonymize, Event, WEB_REQUEST_EVENT_TYPE};
pub use feature::{EventFeature, FeatureState};
pub use middleware::{
    current_event_feature, AnalyticsPipeline, CaptureLayer, CaptureService, OriginalRequest,
    RequestInfo,
};
pub use sink::BigQueryClient;
