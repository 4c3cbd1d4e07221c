//! Error taxonomy for the analytics pipeline.
//!
//! Failures fall into four families: configuration problems (fail fast,
//! never per-request), authentication failures during the federated token
//! exchange, delivery failures against the warehouse, and protocol misuse
//! of the per-request event feature (a programmer fault).
//!
//! Configuration errors abort the telemetry path but never the served
//! request. Delivery and authentication errors are logged with context and
//! forwarded to the host's background fault channel; they are never
//! retried internally and never silently swallowed.

use thiserror::Error;

/// Boxed error source used where the concrete failure type is not ours.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the analytics pipeline.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// A required setting is missing or invalid.
    #[error("invalid analytics configuration: {0}")]
    Configuration(String),

    /// A token-exchange call failed while provisioning warehouse credentials.
    #[error("authentication failed: {context}")]
    Authentication {
        /// Which step of the exchange failed.
        context: String,
        /// The transport or status failure behind it.
        #[source]
        source: BoxError,
    },

    /// The warehouse insert failed.
    #[error("failed to deliver event: {context}")]
    Delivery {
        /// What was being delivered.
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    /// An enricher returned an error; the chain and the send were aborted.
    #[error("event enricher failed")]
    Enrichment(#[source] BoxError),

    /// The event feature was driven through an illegal state transition.
    /// Double-send and ignore-after-send are programmer faults.
    #[error("event feature protocol misuse: {0}")]
    ProtocolMisuse(&'static str),

    /// The request or process was cancelled while telemetry was in flight.
    #[error("telemetry work cancelled")]
    Cancelled,
}

impl AnalyticsError {
    /// Shorthand for an [`AnalyticsError::Authentication`] wrapping `source`.
    pub fn authentication(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Authentication {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Shorthand for an [`AnalyticsError::Delivery`] wrapping `source`.
    pub fn delivery(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Delivery {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    /// A delivery error carrying only a message (e.g. a rejected row).
    pub fn delivery_message(context: impl Into<String>) -> Self {
        Self::Delivery {
            context: context.into(),
            source: None,
        }
    }
}
