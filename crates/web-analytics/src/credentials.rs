//! Warehouse credential provisioning.
//!
//! Two providers implement [`BigQueryClientProvider`]:
//!
//! - [`StaticClientProvider`] hands out a single preconfigured client.
//! - [`FederatedClientProvider`] converts a local workload identity into a
//!   short-lived service-account credential through a three-hop exchange:
//!   projected token file → workload-identity bearer token → federated
//!   access token → impersonated service-account token. The resulting
//!   `(client, expiry)` pair is cached process-wide and refreshed shortly
//!   before expiry.
//!
//! The cache is the only cross-request mutable state in the pipeline. It
//! sits behind an async mutex, so concurrent near-expiry callers serialize
//! and at most one exchange runs at a time; waiting callers reuse the
//! fresh client once the refresh completes.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::Clock;
use crate::config::FederationConfig;
use crate::error::AnalyticsError;
use crate::sink::BigQueryClient;

/// How long before expiry a cached client is considered stale.
const EXPIRATION_ALLOWANCE_SECS: i64 = 60;

/// Resolves the warehouse client used to deliver events.
#[async_trait]
pub trait BigQueryClientProvider: Send + Sync + Debug {
    /// Returns a client ready to insert rows. May perform network I/O.
    async fn get_client(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BigQueryClient, AnalyticsError>;
}

/// Provider returning one preconfigured client.
#[derive(Debug)]
pub struct StaticClientProvider {
    client: Option<BigQueryClient>,
}

impl StaticClientProvider {
    /// Wraps a preconfigured client, or the absence of one.
    #[must_use]
    pub fn new(client: Option<BigQueryClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BigQueryClientProvider for StaticClientProvider {
    async fn get_client(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<BigQueryClient, AnalyticsError> {
        self.client.clone().ok_or_else(|| {
            AnalyticsError::Configuration("BigQueryClient has not been configured".into())
        })
    }
}

#[derive(Debug, Clone)]
struct CachedClient {
    client: BigQueryClient,
    expiry: DateTime<Utc>,
}

/// Provider performing the federated three-hop token exchange, with a
/// cached self-renewing client.
#[derive(Debug)]
pub struct FederatedClientProvider {
    config: FederationConfig,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    cache: Mutex<Option<CachedClient>>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ImpersonationResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expireTime")]
    expire_time: DateTime<Utc>,
}

impl FederatedClientProvider {
    /// Creates a provider from a validated federation config.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Configuration`] if the config is
    /// incomplete.
    pub fn new(config: FederationConfig, clock: Arc<dyn Clock>) -> Result<Self, AnalyticsError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            http: reqwest::Client::new(),
            cache: Mutex::new(None),
        })
    }

    /// Step 1: exchange the projected token file for a workload-identity
    /// bearer token.
    async fn acquire_workload_token(&self) -> Result<String, AnalyticsError> {
        let assertion = tokio::fs::read_to_string(&self.config.token_file)
            .await
            .map_err(|e| {
                AnalyticsError::authentication(
                    format!(
                        "reading workload identity token file {}",
                        self.config.token_file.display()
                    ),
                    e,
                )
            })?;

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.entra_base_url.trim_end_matches('/'),
            self.config.tenant_id
        );
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("scope", "api://AzureADTokenExchange/.default"),
            (
                "client_assertion_type",
                "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
            ),
            ("client_assertion", assertion.trim()),
            ("grant_type", "client_credentials"),
        ];

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AnalyticsError::authentication("acquiring workload identity token", e))?;
        let parsed: AccessTokenResponse =
            decode_token_response(response, "acquiring workload identity token").await?;
        Ok(parsed.access_token)
    }

    /// Step 2: exchange the workload token at the federation broker for a
    /// federated access token scoped to the workload identity pool.
    async fn exchange_for_federated_token(
        &self,
        subject_token: &str,
    ) -> Result<String, AnalyticsError> {
        let audience = format!(
            "//iam.googleapis.com/projects/{}/locations/global/workloadIdentityPools/{}/providers/{}",
            self.config.project_number,
            self.config.workload_identity_pool,
            self.config.workload_identity_pool_provider,
        );
        let url = format!("{}/v1/token", self.config.sts_base_url.trim_end_matches('/'));
        let body = json!({
            "grantType": "urn:ietf:params:oauth:grant-type:token-exchange",
            "audience": audience,
            "scope": "https://www.googleapis.com/auth/cloud-platform",
            "requestedTokenType": "urn:ietf:params:oauth:token-type:access_token",
            "subjectToken": subject_token,
            "subjectTokenType": "urn:ietf:params:oauth:token-type:jwt",
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalyticsError::authentication("exchanging federated token", e))?;
        let parsed: AccessTokenResponse =
            decode_token_response(response, "exchanging federated token").await?;
        Ok(parsed.access_token)
    }

    /// Step 3: impersonate the target service account, yielding a
    /// short-lived access token and its absolute expiry.
    async fn impersonate_service_account(
        &self,
        federated_token: &str,
    ) -> Result<(String, DateTime<Utc>), AnalyticsError> {
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            self.config.iam_credentials_base_url.trim_end_matches('/'),
            self.config.service_account_email,
        );
        let body = json!({ "scope": ["https://www.googleapis.com/auth/cloud-platform"] });

        let response = self
            .http
            .post(&url)
            .bearer_auth(federated_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalyticsError::authentication("impersonating service account", e))?;
        let parsed: ImpersonationResponse =
            decode_token_response(response, "impersonating service account").await?;
        Ok((parsed.access_token, parsed.expire_time))
    }

    /// Runs the full exchange and mints a fresh client.
    async fn refresh(&self) -> Result<CachedClient, AnalyticsError> {
        let workload_token = self.acquire_workload_token().await?;
        let federated_token = self.exchange_for_federated_token(&workload_token).await?;
        let (access_token, expiry) = self.impersonate_service_account(&federated_token).await?;

        debug!(%expiry, "refreshed federated warehouse credentials");
        let client = BigQueryClient::with_base_url(
            self.config.project_number.clone(),
            access_token,
            self.config.bigquery_base_url.clone(),
        );
        Ok(CachedClient { client, expiry })
    }
}

#[async_trait]
impl BigQueryClientProvider for FederatedClientProvider {
    async fn get_client(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BigQueryClient, AnalyticsError> {
        let mut cache = self.cache.lock().await;

        let now = self.clock.now_utc();
        let allowance = ChronoDuration::seconds(EXPIRATION_ALLOWANCE_SECS);
        if let Some(cached) = cache.as_ref() {
            if now + allowance < cached.expiry {
                return Ok(cached.client.clone());
            }
        }

        // Stale or unprimed: discard the old client before refreshing so a
        // failed exchange never leaves an expired credential in use.
        *cache = None;

        let refreshed = tokio::select! {
            () = cancel.cancelled() => return Err(AnalyticsError::Cancelled),
            result = self.refresh() => result?,
        };
        let client = refreshed.client.clone();
        *cache = Some(refreshed);
        Ok(client)
    }
}

/// Checks the response status and decodes the JSON payload, wrapping any
/// failure in an authentication error naming the failing step.
async fn decode_token_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    context: &str,
) -> Result<T, AnalyticsError> {
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(AnalyticsError::Authentication {
            context: format!("{context}: status {status}: {detail}"),
            source: Box::new(std::io::Error::other(format!(
                "token endpoint returned {status}"
            ))),
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| AnalyticsError::authentication(format!("{context}: decoding response"), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DEFAULT_ENTRA_BASE_URL, DEFAULT_IAM_CREDENTIALS_BASE_URL, DEFAULT_STS_BASE_URL,
    };
    use std::path::PathBuf;

    #[derive(Debug)]
    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now_utc(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn federation_config() -> FederationConfig {
        FederationConfig {
            project_number: "123456".into(),
            workload_identity_pool: "pool".into(),
            workload_identity_pool_provider: "provider".into(),
            service_account_email: "svc@example.iam.gserviceaccount.com".into(),
            client_id: "client".into(),
            tenant_id: "tenant".into(),
            token_file: PathBuf::from("/nonexistent/token"),
            entra_base_url: DEFAULT_ENTRA_BASE_URL.into(),
            sts_base_url: DEFAULT_STS_BASE_URL.into(),
            iam_credentials_base_url: DEFAULT_IAM_CREDENTIALS_BASE_URL.into(),
            bigquery_base_url: crate::sink::DEFAULT_BIGQUERY_BASE_URL.into(),
        }
    }

    #[tokio::test]
    async fn static_provider_returns_configured_client() {
        let client = BigQueryClient::new("proj", "token");
        let provider = StaticClientProvider::new(Some(client));
        let resolved = provider
            .get_client(&CancellationToken::new())
            .await
            .expect("client resolves");
        assert_eq!(resolved.project_id(), "proj");
    }

    #[tokio::test]
    async fn static_provider_without_client_is_a_configuration_error() {
        let provider = StaticClientProvider::new(None);
        let err = provider
            .get_client(&CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, AnalyticsError::Configuration(_)));
    }

    #[tokio::test]
    async fn missing_token_file_is_an_authentication_error() {
        let clock = Arc::new(FixedClock(Utc::now()));
        let provider =
            FederatedClientProvider::new(federation_config(), clock).expect("valid config");
        let err = provider
            .get_client(&CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, AnalyticsError::Authentication { .. }));
    }

    #[test]
    fn incomplete_config_is_rejected() {
        let mut config = federation_config();
        config.service_account_email = String::new();
        let clock = Arc::new(FixedClock(Utc::now()));
        assert!(FederatedClientProvider::new(config, clock).is_err());
    }
}
