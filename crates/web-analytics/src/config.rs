//! Pipeline configuration.
//!
//! [`AnalyticsConfig`] carries everything the capture middleware needs to
//! know about the host application; [`FederationConfig`] carries the
//! workload-identity settings for the federated credential provider.
//!
//! Validation is strict and early: missing required settings are
//! configuration errors raised before any event is captured, never
//! per-request failures.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::AnalyticsError;
use crate::middleware::RequestInfo;

/// Default table events are inserted into.
pub const DEFAULT_TABLE_ID: &str = "events";

/// Resolves the signed-in user's id from the captured request, if any.
pub type UserIdResolver = Arc<dyn Fn(&RequestInfo) -> Option<String> + Send + Sync>;

/// Decides at completion time whether a request's event should be sent.
/// Returning `false` skips the event entirely.
pub type RequestFilter = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Configuration for the capture middleware.
#[derive(Clone)]
pub struct AnalyticsConfig {
    /// Deployment environment recorded on every event. Required.
    pub environment: String,
    /// Logical application namespace. Defaults to the host executable name.
    pub namespace: Option<String>,
    /// Warehouse dataset events are inserted into. Required.
    pub dataset_id: String,
    /// Warehouse table events are inserted into.
    pub table_id: String,
    /// Whether resolved user ids are one-way hashed before capture.
    pub pseudonymize_user_id: bool,
    /// Substitute the pre-re-execution path and query for the captured ones.
    pub restore_original_path_and_query: bool,
    /// Substitute the pre-re-execution status for the captured one.
    pub restore_original_status_code: bool,
    /// Hook returning the signed-in user's id.
    pub user_id_resolver: Option<UserIdResolver>,
    /// Hook excluding requests from capture at completion time.
    pub request_filter: Option<RequestFilter>,
}

impl AnalyticsConfig {
    /// Creates a config with required fields and defaults for the rest.
    pub fn new(
        environment: impl Into<String>,
        dataset_id: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            namespace: default_namespace(),
            dataset_id: dataset_id.into(),
            table_id: DEFAULT_TABLE_ID.to_string(),
            pseudonymize_user_id: false,
            restore_original_path_and_query: false,
            restore_original_status_code: false,
            user_id_resolver: None,
            request_filter: None,
        }
    }

    /// Checks that every required setting is present.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Configuration`] naming the first missing
    /// setting.
    pub fn validate(&self) -> Result<(), AnalyticsError> {
        if self.environment.trim().is_empty() {
            return Err(AnalyticsError::Configuration(
                "Environment has not been configured".into(),
            ));
        }
        if self.dataset_id.trim().is_empty() {
            return Err(AnalyticsError::Configuration(
                "DatasetId has not been configured".into(),
            ));
        }
        if self.table_id.trim().is_empty() {
            return Err(AnalyticsError::Configuration(
                "TableId has not been configured".into(),
            ));
        }
        if self
            .namespace
            .as_deref()
            .map_or(true, |ns| ns.trim().is_empty())
        {
            return Err(AnalyticsError::Configuration(
                "Namespace has not been configured and no default is available".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for AnalyticsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyticsConfig")
            .field("environment", &self.environment)
            .field("namespace", &self.namespace)
            .field("dataset_id", &self.dataset_id)
            .field("table_id", &self.table_id)
            .field("pseudonymize_user_id", &self.pseudonymize_user_id)
            .field(
                "restore_original_path_and_query",
                &self.restore_original_path_and_query,
            )
            .field(
                "restore_original_status_code",
                &self.restore_original_status_code,
            )
            .field("user_id_resolver", &self.user_id_resolver.is_some())
            .field("request_filter", &self.request_filter.is_some())
            .finish()
    }
}

/// The host application identity used when no namespace is configured:
/// the current executable's file stem.
fn default_namespace() -> Option<String> {
    env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
}

/// Environment variable carrying the workload client id.
pub const CLIENT_ID_ENV_VAR: &str = "AZURE_CLIENT_ID";
/// Environment variable carrying the tenant id.
pub const TENANT_ID_ENV_VAR: &str = "AZURE_TENANT_ID";
/// Environment variable carrying the projected token file path.
pub const TOKEN_FILE_ENV_VAR: &str = "AZURE_FEDERATED_TOKEN_FILE";

/// Default base URL for the workload-identity token endpoint.
pub const DEFAULT_ENTRA_BASE_URL: &str = "https://login.microsoftonline.com";
/// Default base URL for the federation broker.
pub const DEFAULT_STS_BASE_URL: &str = "https://sts.googleapis.com";
/// Default base URL for the impersonation endpoint.
pub const DEFAULT_IAM_CREDENTIALS_BASE_URL: &str = "https://iamcredentials.googleapis.com";

/// Settings for the three-hop federated token exchange.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// GCP project number hosting the workload identity pool.
    pub project_number: String,
    /// Workload identity pool name.
    pub workload_identity_pool: String,
    /// Workload identity pool provider name.
    pub workload_identity_pool_provider: String,
    /// Service account to impersonate for warehouse access.
    pub service_account_email: String,
    /// Workload client id, from `AZURE_CLIENT_ID`.
    pub client_id: String,
    /// Tenant id, from `AZURE_TENANT_ID`.
    pub tenant_id: String,
    /// Projected token file path, from `AZURE_FEDERATED_TOKEN_FILE`.
    pub token_file: PathBuf,
    /// Workload-identity token endpoint base (overridable for tests).
    pub entra_base_url: String,
    /// Federation broker base (overridable for tests).
    pub sts_base_url: String,
    /// Impersonation endpoint base (overridable for tests).
    pub iam_credentials_base_url: String,
    /// Warehouse endpoint base handed to freshly minted clients.
    pub bigquery_base_url: String,
}

impl FederationConfig {
    /// Builds a federation config, reading the workload identity triple
    /// from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Configuration`] if any required
    /// environment variable is missing. This is a hard failure; it is
    /// never retried.
    pub fn from_env(
        project_number: impl Into<String>,
        workload_identity_pool: impl Into<String>,
        workload_identity_pool_provider: impl Into<String>,
        service_account_email: impl Into<String>,
    ) -> Result<Self, AnalyticsError> {
        let config = Self {
            project_number: project_number.into(),
            workload_identity_pool: workload_identity_pool.into(),
            workload_identity_pool_provider: workload_identity_pool_provider.into(),
            service_account_email: service_account_email.into(),
            client_id: required_env_var(CLIENT_ID_ENV_VAR)?,
            tenant_id: required_env_var(TENANT_ID_ENV_VAR)?,
            token_file: PathBuf::from(required_env_var(TOKEN_FILE_ENV_VAR)?),
            entra_base_url: DEFAULT_ENTRA_BASE_URL.to_string(),
            sts_base_url: DEFAULT_STS_BASE_URL.to_string(),
            iam_credentials_base_url: DEFAULT_IAM_CREDENTIALS_BASE_URL.to_string(),
            bigquery_base_url: crate::sink::DEFAULT_BIGQUERY_BASE_URL.to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that every required setting is present.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Configuration`] naming the first missing
    /// setting.
    pub fn validate(&self) -> Result<(), AnalyticsError> {
        let required = [
            ("ProjectNumber", &self.project_number),
            ("WorkloadIdentityPoolName", &self.workload_identity_pool),
            (
                "WorkloadIdentityPoolProviderName",
                &self.workload_identity_pool_provider,
            ),
            ("ServiceAccountEmail", &self.service_account_email),
            ("ClientId", &self.client_id),
            ("TenantId", &self.tenant_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(AnalyticsError::Configuration(format!(
                    "{name} has not been configured"
                )));
            }
        }
        if self.token_file.as_os_str().is_empty() {
            return Err(AnalyticsError::Configuration(
                "TokenFile has not been configured".into(),
            ));
        }
        Ok(())
    }
}

fn required_env_var(name: &str) -> Result<String, AnalyticsError> {
    env::var(name).map_err(|_| {
        AnalyticsError::Configuration(format!("the {name} environment variable is missing"))
    })
}
