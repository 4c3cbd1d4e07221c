//! The web request event record.
//!
//! One [`Event`] is captured per inbound HTTP request. Request fields are
//! filled when the request arrives, response fields at completion, and the
//! whole record is serialized to a single warehouse insert row with
//! `request_query` and `data` as nested repeated `{key, value}` records.
//!
//! Identifying values (user ids, user-agent + IP) can be reduced to an
//! unsalted SHA-256 digest via [`anonymize`], preserving equality
//! comparability without storing the raw value.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::AnalyticsError;

/// The constant `event_type` discriminator for request events.
pub const WEB_REQUEST_EVENT_TYPE: &str = "web_request";

/// A structured record of one HTTP request/response.
#[derive(Debug, Clone)]
pub struct Event {
    /// When the request was observed, from the injected clock.
    pub occurred_at: DateTime<Utc>,
    /// Deployment environment name. Must be non-empty before delivery.
    environment: String,
    /// Logical application namespace.
    pub namespace: Option<String>,
    /// The signed-in user's id, possibly pseudonymized.
    pub user_id: Option<String>,
    /// Unique id for this request.
    pub request_id: Option<String>,
    /// HTTP method.
    pub request_method: Option<String>,
    /// Request path, without the query string.
    pub request_path: Option<String>,
    /// `User-Agent` request header.
    pub request_user_agent: Option<String>,
    /// `Referer` request header.
    pub request_referer: Option<String>,
    /// Query parameters in first-appearance order; keys are unique.
    pub request_query: Vec<(String, Vec<String>)>,
    /// `Content-Type` of the final response.
    pub response_content_type: Option<String>,
    /// Status code of the final response, as a string.
    pub response_status: Option<String>,
    /// Open extension bag; duplicate keys are rejected.
    data: Vec<(String, Vec<String>)>,
    /// Table name for entity events. Unused by the request pipeline.
    pub entity_table_name: Option<String>,
    /// One-way digest of the client's user agent and address.
    pub anonymized_user_agent_and_ip: Option<String>,
    /// Case-insensitive tag set, preserving first-seen casing.
    tags: Vec<String>,
}

impl Event {
    /// Creates an event stamped at `occurred_at` for the given environment.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Configuration`] if `environment` is empty.
    pub fn new(
        occurred_at: DateTime<Utc>,
        environment: impl Into<String>,
        namespace: Option<String>,
    ) -> Result<Self, AnalyticsError> {
        let environment = environment.into();
        if environment.trim().is_empty() {
            return Err(AnalyticsError::Configuration(
                "event environment must not be empty".into(),
            ));
        }

        Ok(Self {
            occurred_at,
            environment,
            namespace,
            user_id: None,
            request_id: None,
            request_method: None,
            request_path: None,
            request_user_agent: None,
            request_referer: None,
            request_query: Vec::new(),
            response_content_type: None,
            response_status: None,
            data: Vec::new(),
            entity_table_name: None,
            anonymized_user_agent_and_ip: None,
            tags: Vec::new(),
        })
    }

    /// The deployment environment this event belongs to.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Adds a single-valued entry to the `data` bag.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `key` is already present.
    pub fn add_data(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), AnalyticsError> {
        self.add_data_values(key, vec![value.into()])
    }

    /// Adds a multi-valued entry to the `data` bag.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `key` is already present.
    pub fn add_data_values(
        &mut self,
        key: impl Into<String>,
        values: Vec<String>,
    ) -> Result<(), AnalyticsError> {
        let key = key.into();
        if self.data.iter().any(|(existing, _)| *existing == key) {
            return Err(AnalyticsError::Configuration(format!(
                "event data already contains key '{key}'"
            )));
        }
        self.data.push((key, values));
        Ok(())
    }

    /// The `data` extension bag in insertion order.
    pub fn data(&self) -> &[(String, Vec<String>)] {
        &self.data
    }

    /// Adds a tag. Comparison is case-insensitive; the first-seen casing wins.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self
            .tags
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(&tag))
        {
            self.tags.push(tag);
        }
    }

    /// Adds several tags, deduplicating case-insensitively.
    pub fn add_tags<I>(&mut self, tags: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for tag in tags {
            self.add_tag(tag);
        }
    }

    /// The tag set in insertion order.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Builds the warehouse insert row for this event.
    ///
    /// Column names follow the analytics schema: `request_uuid` for the
    /// request id, `anonymised_user_agent_and_ip` for the digest, and
    /// `event_tags` for the tag set.
    pub fn to_insert_row(&self) -> Value {
        json!({
            "occurred_at": self
                .occurred_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            "event_type": WEB_REQUEST_EVENT_TYPE,
            "environment": self.environment,
            "namespace": self.namespace,
            "user_id": self.user_id,
            "request_uuid": self.request_id,
            "request_method": self.request_method,
            "request_path": self.request_path,
            "request_user_agent": self.request_user_agent,
            "request_referer": self.request_referer,
            "request_query": key_value_records(&self.request_query),
            "response_content_type": self.response_content_type,
            "response_status": self.response_status,
            "data": key_value_records(&self.data),
            "entity_table_name": self.entity_table_name,
            "anonymised_user_agent_and_ip": self.anonymized_user_agent_and_ip,
            "event_tags": self.tags,
        })
    }
}

/// Serializes an ordered key/values mapping as repeated `{key, value}` records.
fn key_value_records(entries: &[(String, Vec<String>)]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|(key, values)| json!({ "key": key, "value": values }))
            .collect(),
    )
}

/// One-way digest used for pseudonymization: SHA-256 over the UTF-8 bytes,
/// hex-encoded lowercase. Unsalted so equal inputs remain equality-comparable
/// across events without storing the raw identifier.
#[must_use]
pub fn anonymize(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}
