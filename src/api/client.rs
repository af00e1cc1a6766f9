//! HTTP client for the cloud application API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::models::{Application, ApplicationSummary};

/// Base URL for the application API.
const API_BASE_URL: &str = "https://cloud.ravellosystems.com/api/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Errors that can occur during API operations.
#[derive(Error, Debug)]
pub enum ApiError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ApiError {
    /// The HTTP status code carried by this error, if any.
    ///
    /// Feeds the per-status retry budget; errors without a status are
    /// never retried on the budget path.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::NotFound(_) => Some(404),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Serialization(_) => None,
        }
    }
}

/// Remote power verbs accepted by the VM action endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Restart,
    Poweroff,
}

impl VmAction {
    /// Path segment for this action.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Poweroff => "poweroff",
        }
    }
}

impl std::fmt::Display for VmAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for the application API consumed by power and provisioning code.
#[async_trait]
pub trait ApplicationApi: Send + Sync {
    /// Fetch a full application snapshot by id.
    async fn get_application(&self, id: u64) -> Result<Application, ApiError>;

    /// Resolve an application by name and fetch its full snapshot.
    async fn find_application(&self, name: &str) -> Result<Application, ApiError>;

    /// Replace the whole application document.
    async fn update_application(&self, app: &Application) -> Result<(), ApiError>;

    /// Commit design-time changes to the running deployment.
    async fn publish_updates(
        &self,
        id: u64,
        start_all_draft_vms: Option<bool>,
    ) -> Result<(), ApiError>;

    /// Extend the application lifetime by `seconds` from now.
    async fn set_expiration(&self, id: u64, seconds: u64) -> Result<(), ApiError>;

    /// Issue a power action against one VM.
    async fn vm_action(&self, app_id: u64, vm_id: u64, action: VmAction) -> Result<(), ApiError>;
}

/// Authenticated reqwest client for the application API.
#[derive(Clone)]
pub struct CloudClient {
    /// HTTP client.
    client: Client,
    /// Base URL, overridable for tests.
    base_url: String,
    /// API username.
    username: String,
    /// API password.
    password: String,
}

impl CloudClient {
    /// Create a new client against the default API endpoint.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Override the API base URL (used by tests and private deployments).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated PUT request with an empty success body.
    async fn put_empty<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "PUT request");

        let response = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;

        Self::handle_empty(response).await
    }

    /// Make an authenticated POST request with an empty success body.
    async fn post_empty<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;

        Self::handle_empty(response).await
    }

    /// Handle an API response, parsing JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ApiError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(ApiError::NotFound(text))
        } else {
            Err(ApiError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Handle an API response that carries no useful body.
    async fn handle_empty(response: reqwest::Response) -> Result<(), ApiError> {
        let status = response.status();
        if status.is_success() || status == StatusCode::NO_CONTENT {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ApiError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }
}

#[async_trait]
impl ApplicationApi for CloudClient {
    async fn get_application(&self, id: u64) -> Result<Application, ApiError> {
        self.get(&format!("/applications/{id}")).await
    }

    async fn find_application(&self, name: &str) -> Result<Application, ApiError> {
        let summaries: Vec<ApplicationSummary> = self.get("/applications").await?;
        let summary = summaries
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ApiError::NotFound(format!("application `{name}`")))?;

        self.get_application(summary.id).await
    }

    async fn update_application(&self, app: &Application) -> Result<(), ApiError> {
        info!(application = %app.name, "Updating application");
        self.put_empty(&format!("/applications/{}", app.id), app)
            .await
    }

    async fn publish_updates(
        &self,
        id: u64,
        start_all_draft_vms: Option<bool>,
    ) -> Result<(), ApiError> {
        let path = match start_all_draft_vms {
            Some(start) => {
                format!("/applications/{id}/publishUpdates?startAllDraftVms={start}")
            }
            None => format!("/applications/{id}/publishUpdates"),
        };
        info!(application_id = id, "Publishing updates");
        self.post_empty(&path, &serde_json::json!({})).await
    }

    async fn set_expiration(&self, id: u64, seconds: u64) -> Result<(), ApiError> {
        debug!(application_id = id, seconds, "Extending expiration");
        self.post_empty(
            &format!("/applications/{id}/setExpiration"),
            &serde_json::json!({ "expirationFromNowSeconds": seconds }),
        )
        .await
    }

    async fn vm_action(&self, app_id: u64, vm_id: u64, action: VmAction) -> Result<(), ApiError> {
        info!(application_id = app_id, vm_id, action = %action, "VM power action");
        self.post_empty(
            &format!("/applications/{app_id}/vms/{vm_id}/{action}"),
            &serde_json::json!({}),
        )
        .await
    }
}
