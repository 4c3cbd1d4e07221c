//! Warehouse insert sink.
//!
//! [`BigQueryClient`] performs one streaming-insert call per event. There
//! is no batching, buffering, or retry here: a failed insert surfaces as a
//! delivery error and the caller decides what to observe. The base URL is
//! overridable so tests can point the client at a mock backend.

use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AnalyticsError;

/// Default BigQuery API endpoint.
pub const DEFAULT_BIGQUERY_BASE_URL: &str = "https://bigquery.googleapis.com";

/// Minimal BigQuery client: bearer-authorized single-row streaming inserts.
#[derive(Clone)]
pub struct BigQueryClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    access_token: String,
}

/// Subset of the `insertAll` response we care about.
#[derive(Debug, Deserialize)]
struct InsertAllResponse {
    #[serde(rename = "insertErrors", default)]
    insert_errors: Vec<Value>,
}

impl BigQueryClient {
    /// Creates a client for `project_id` authorized by `access_token`.
    #[must_use]
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self::with_base_url(project_id, access_token, DEFAULT_BIGQUERY_BASE_URL)
    }

    /// Creates a client against a non-default endpoint (used by tests).
    #[must_use]
    pub fn with_base_url(
        project_id: impl Into<String>,
        access_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            access_token: access_token.into(),
        }
    }

    /// The project this client inserts into.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Inserts a single row into `dataset`.`table`.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Delivery`] on transport failures, non-2xx
    /// responses, or per-row insert errors reported by the backend, and
    /// [`AnalyticsError::Cancelled`] if `cancel` fires first.
    pub async fn insert_row(
        &self,
        dataset: &str,
        table: &str,
        row: &Value,
        cancel: &CancellationToken,
    ) -> Result<(), AnalyticsError> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/datasets/{dataset}/tables/{table}/insertAll",
            self.base_url, self.project_id
        );
        let body = json!({ "rows": [ { "json": row } ] });

        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send();

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(AnalyticsError::Cancelled),
            result = send => result.map_err(|e| {
                AnalyticsError::delivery(format!("inserting row into {dataset}.{table}"), e)
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AnalyticsError::delivery_message(format!(
                "inserting row into {dataset}.{table}: status {status}: {detail}"
            )));
        }

        // insertAll reports row-level failures in a 200 response.
        let parsed: InsertAllResponse = response.json().await.map_err(|e| {
            AnalyticsError::delivery(format!("decoding insert response for {dataset}.{table}"), e)
        })?;
        if !parsed.insert_errors.is_empty() {
            return Err(AnalyticsError::delivery_message(format!(
                "inserting row into {dataset}.{table}: backend rejected {} row(s)",
                parsed.insert_errors.len()
            )));
        }

        debug!(dataset, table, "inserted analytics row");
        Ok(())
    }
}

impl fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The access token stays out of logs.
        f.debug_struct("BigQueryClient")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}
