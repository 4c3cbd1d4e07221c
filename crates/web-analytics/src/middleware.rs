//! Request capture middleware.
//!
//! [`CaptureLayer`] wraps an inner tower service. On every request it
//! builds the [`Event`], publishes the [`EventFeature`] handle in the
//! request extensions for downstream handlers, and invokes the inner
//! service. Once the response is produced, the completion work (response
//! fields → enrichers → admission → client resolution → insert) runs on a
//! spawned task so no telemetry step ever delays the client-visible
//! response.
//!
//! Delivery and authentication failures are logged and forwarded to the
//! pipeline's background fault channel; configuration errors abort the
//! telemetry path but never the served request.

use axum::extract::ConnectInfo;
use http::header::{CONTENT_TYPE, REFERER, USER_AGENT};
use http::{HeaderMap, Request, Response};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::clock::{Clock, SystemClock};
use crate::config::AnalyticsConfig;
use crate::credentials::BigQueryClientProvider;
use crate::enrich::{run_enrichers, EventEnricher};
use crate::error::AnalyticsError;
use crate::event::{anonymize, Event};
use crate::feature::EventFeature;

/// Details captured from the request before the inner service consumed it.
///
/// Handed to user-id resolvers, request filters, and enrichers.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Unique id assigned to this request.
    pub request_id: String,
    /// HTTP method.
    pub method: String,
    /// Request path, without the query string.
    pub path: String,
    /// Raw query string, if any.
    pub raw_query: Option<String>,
    /// Flattened query parameters in first-appearance order.
    pub query: Vec<(String, Vec<String>)>,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
    /// `Referer` header.
    pub referer: Option<String>,
    /// Client address, when the host exposes one.
    pub remote_addr: Option<IpAddr>,
    /// All request headers, for resolver hooks.
    pub headers: HeaderMap,
}

impl RequestInfo {
    #[cfg(test)]
    pub(crate) fn for_tests(method: &str, path: &str, raw_query: Option<&str>) -> Self {
        Self {
            request_id: "test-request".into(),
            method: method.into(),
            path: path.into(),
            raw_query: raw_query.map(str::to_string),
            query: raw_query.map(flatten_query).unwrap_or_default(),
            user_agent: None,
            referer: None,
            remote_addr: None,
            headers: HeaderMap::new(),
        }
    }
}

/// The pre-re-execution request details, recorded by an error handler
/// before it re-executes a request against an error route.
///
/// Insert this into the *response* extensions; with the restoration
/// toggles enabled, the delivered event reflects what the client actually
/// requested and received instead of the internal error route.
#[derive(Debug, Clone)]
pub struct OriginalRequest {
    /// Path of the original request.
    pub path: String,
    /// Raw query string of the original request.
    pub raw_query: Option<String>,
    /// Status code the client actually received, if it differs from the
    /// re-executed response's.
    pub status: Option<u16>,
}

/// What the completion task needs from the response, captured before the
/// response is handed back to the client.
#[derive(Debug, Clone)]
struct ResponseSnapshot {
    status: u16,
    content_type: Option<String>,
    original: Option<OriginalRequest>,
}

/// Shared state for the capture middleware: configuration, clock,
/// credential provider, enrichment chain, admission controller, and the
/// background fault channel.
pub struct AnalyticsPipeline {
    config: AnalyticsConfig,
    clock: Arc<dyn Clock>,
    client_provider: Arc<dyn BigQueryClientProvider>,
    enrichers: Vec<Arc<dyn EventEnricher>>,
    admission: Option<Arc<dyn AdmissionController>>,
    faults: Option<UnboundedSender<AnalyticsError>>,
    cancel: CancellationToken,
}

impl AnalyticsPipeline {
    /// Creates a pipeline with the given configuration and credential
    /// provider. Uses the system clock; no enrichers, admission control,
    /// or fault channel until registered.
    #[must_use]
    pub fn new(config: AnalyticsConfig, client_provider: Arc<dyn BigQueryClientProvider>) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            client_provider,
            enrichers: Vec::new(),
            admission: None,
            faults: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the clock (tests pin time through this).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Appends an enricher. Enrichers run in registration order.
    #[must_use]
    pub fn with_enricher(mut self, enricher: Arc<dyn EventEnricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    /// Installs an admission controller.
    #[must_use]
    pub fn with_admission_controller(mut self, controller: Arc<dyn AdmissionController>) -> Self {
        self.admission = Some(controller);
        self
    }

    /// Installs the background fault channel. Completion-task failures are
    /// sent here after being logged, so hosts can observe telemetry loss.
    #[must_use]
    pub fn with_fault_channel(mut self, sender: UnboundedSender<AnalyticsError>) -> Self {
        self.faults = Some(sender);
        self
    }

    /// Ties all outbound telemetry work to a shutdown token.
    #[must_use]
    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn report_fault(&self, error: AnalyticsError) {
        if let Some(sender) = &self.faults {
            let _ = sender.send(error);
        }
    }

    /// Builds the event and feature for a request and publishes the handle
    /// in the request extensions.
    fn begin_request<B>(
        &self,
        request: &mut Request<B>,
    ) -> Result<(EventFeature, RequestInfo), AnalyticsError> {
        self.config.validate()?;

        let info = RequestInfo {
            request_id: Uuid::new_v4().to_string(),
            method: request.method().to_string(),
            path: request.uri().path().to_string(),
            raw_query: request.uri().query().map(str::to_string),
            query: request
                .uri()
                .query()
                .map(flatten_query)
                .unwrap_or_default(),
            user_agent: header_value(request.headers(), USER_AGENT.as_str()),
            referer: header_value(request.headers(), REFERER.as_str()),
            remote_addr: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|connect| connect.0.ip()),
            headers: request.headers().clone(),
        };

        let mut event = Event::new(
            self.clock.now_utc(),
            self.config.environment.clone(),
            self.config.namespace.clone(),
        )?;
        event.request_id = Some(info.request_id.clone());
        event.request_method = Some(info.method.clone());
        event.request_path = Some(info.path.clone());
        event.request_query = info.query.clone();
        event.request_user_agent = info.user_agent.clone();
        event.request_referer = info.referer.clone();
        event.anonymized_user_agent_and_ip = info.remote_addr.map(|addr| {
            anonymize(&format!(
                "{}{}",
                info.user_agent.as_deref().unwrap_or_default(),
                addr
            ))
        });
        event.user_id = self.resolve_user_id(&info);

        let feature = EventFeature::new(event);
        request.extensions_mut().insert(feature.clone());
        Ok((feature, info))
    }

    fn resolve_user_id(&self, info: &RequestInfo) -> Option<String> {
        let resolver = self.config.user_id_resolver.as_ref()?;
        let user_id = resolver(info)?;
        if self.config.pseudonymize_user_id {
            Some(anonymize(&user_id))
        } else {
            Some(user_id)
        }
    }

    /// Completion work, run on a spawned task after the response exists.
    async fn finalize(
        &self,
        feature: EventFeature,
        info: RequestInfo,
        response: ResponseSnapshot,
    ) -> Result<(), AnalyticsError> {
        if feature.is_ignored() || feature.is_sent() {
            return Ok(());
        }
        if let Some(filter) = &self.config.request_filter {
            if !filter(&info) {
                debug!(path = %info.path, "request filtered out of analytics capture");
                return Ok(());
            }
        }

        self.populate_from_response(&feature, &response);

        // The user may only have been identifiable after downstream
        // middleware ran; try again if the first resolution came up empty.
        if feature.snapshot().user_id.is_none() {
            if let Some(user_id) = self.resolve_user_id(&info) {
                feature.with_event(|event| event.user_id = Some(user_id));
            }
        }

        if !run_enrichers(&self.enrichers, &feature, &info).await? {
            debug!(path = %info.path, "event ignored by enricher");
            return Ok(());
        }

        if let Some(admission) = &self.admission {
            match admission.try_acquire(&info.method, &info.path) {
                AdmissionDecision::Granted(_lease) => {}
                AdmissionDecision::Denied => {
                    feature.mark_dropped();
                    debug!(
                        method = %info.method,
                        path = %info.path,
                        "analytics event dropped by admission control"
                    );
                    return Ok(());
                }
            }
        }

        let client = self.client_provider.get_client(&self.cancel).await?;
        let row = feature.snapshot().to_insert_row();
        client
            .insert_row(
                &self.config.dataset_id,
                &self.config.table_id,
                &row,
                &self.cancel,
            )
            .await?;

        // A cancelled in-flight send must not count as delivered.
        if self.cancel.is_cancelled() {
            return Err(AnalyticsError::Cancelled);
        }
        feature.mark_sent()?;
        info!(
            method = %info.method,
            path = %info.path,
            "sent web_request event to warehouse"
        );
        Ok(())
    }

    /// Fills response fields, applying path/status restoration first.
    fn populate_from_response(&self, feature: &EventFeature, response: &ResponseSnapshot) {
        let mut status = response.status;
        let mut restored_path = None;
        let mut restored_query = None;

        if let Some(original) = &response.original {
            if self.config.restore_original_path_and_query {
                restored_path = Some(original.path.clone());
                restored_query = Some(
                    original
                        .raw_query
                        .as_deref()
                        .map(flatten_query)
                        .unwrap_or_default(),
                );
            }
            if self.config.restore_original_status_code {
                if let Some(original_status) = original.status {
                    status = original_status;
                }
            }
        }

        feature.with_event(|event| {
            if let Some(path) = restored_path {
                event.request_path = Some(path);
            }
            if let Some(query) = restored_query {
                event.request_query = query;
            }
            event.response_content_type = response.content_type.clone();
            event.response_status = Some(status.to_string());
        });
    }
}

impl fmt::Debug for AnalyticsPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyticsPipeline")
            .field("config", &self.config)
            .field("enrichers", &self.enrichers.len())
            .field("admission", &self.admission.is_some())
            .finish_non_exhaustive()
    }
}

/// Fetches the current request's event feature from the extensions map.
///
/// Returns `None` outside a captured request (e.g. when the middleware is
/// not installed or configuration validation failed).
#[must_use]
pub fn current_event_feature(extensions: &http::Extensions) -> Option<EventFeature> {
    extensions.get::<EventFeature>().cloned()
}

/// Tower layer installing the capture middleware.
#[derive(Clone, Debug)]
pub struct CaptureLayer {
    pipeline: Arc<AnalyticsPipeline>,
}

impl CaptureLayer {
    /// Wraps services with the given pipeline.
    #[must_use]
    pub fn new(pipeline: Arc<AnalyticsPipeline>) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for CaptureLayer {
    type Service = CaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

/// Service produced by [`CaptureLayer`].
#[derive(Clone, Debug)]
pub struct CaptureService<S> {
    inner: S,
    pipeline: Arc<AnalyticsPipeline>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CaptureService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        // Take the service that was polled ready; leave the clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let capture = match pipeline.begin_request(&mut request) {
                Ok(capture) => Some(capture),
                Err(e) => {
                    // Telemetry must never take the request down with it.
                    error!(error = %e, "analytics capture disabled for this request");
                    pipeline.report_fault(e);
                    None
                }
            };

            let response = inner.call(request).await?;

            if let Some((feature, info)) = capture {
                let snapshot = ResponseSnapshot {
                    status: response.status().as_u16(),
                    content_type: header_value(response.headers(), CONTENT_TYPE.as_str()),
                    original: response.extensions().get::<OriginalRequest>().cloned(),
                };
                tokio::spawn(async move {
                    if let Err(e) = pipeline.finalize(feature, info, snapshot).await {
                        match e {
                            AnalyticsError::Cancelled => {
                                debug!("analytics completion cancelled");
                            }
                            e => {
                                error!(error = %e, "failed sending web_request event to warehouse");
                                pipeline.report_fault(e);
                            }
                        }
                    }
                });
            }

            Ok(response)
        })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Flattens a raw query string into an ordered `name -> values` mapping
/// with unique keys, preserving first-appearance order.
fn flatten_query(raw_query: &str) -> Vec<(String, Vec<String>)> {
    let mut entries: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        let key = key.into_owned();
        let value = value.into_owned();
        if let Some((_, values)) = entries.iter_mut().find(|(existing, _)| *existing == key) {
            values.push(value);
        } else {
            entries.push((key, vec![value]));
        }
    }
    entries
}
