//! Thin client for the login and exercise catalog endpoints.
//!
//! These are plain request/response calls that sit outside the streaming
//! core; they exist so a caller can obtain a token and pick an exercise.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StreamError};

/// Body of `POST /api/login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    /// Account email.
    pub email: &'a str,
    /// Account password.
    pub password: &'a str,
}

/// Public part of a user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Account identifier.
    pub id: String,
    /// Display name.
    pub username: String,
    /// Account email.
    pub email: String,
}

/// Successful login.
#[derive(Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Bearer token for the streaming endpoint and the catalog.
    pub token: String,
    /// The logged-in user.
    pub user: User,
}

impl std::fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginResponse")
            .field("token", &"***")
            .field("user", &self.user)
            .finish()
    }
}

/// One entry of the exercise catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exercise {
    /// Catalog identifier.
    pub id: String,
    /// Exercise name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// Error body returned by the API on failure.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: String,
}

/// HTTP client for the collaborator API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Creates a client for the API at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Creates a client that reuses an existing `reqwest::Client`.
    #[must_use]
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    /// Returns the API base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchanges credentials for a token.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Api` with the server's message on a non-2xx
    /// status, or `StreamError::Http` on transport failure.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse> {
        let url = format!("{}/api/login", self.base_url);
        debug!(url = %url, "Logging in");

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        let login: LoginResponse = Self::parse(response).await?;
        debug!(user = %login.user.username, "Login succeeded");
        Ok(login)
    }

    /// Fetches the exercise catalog.
    pub async fn exercises(&self, token: &str) -> Result<Vec<Exercise>> {
        let url = format!("{}/api/exercises", self.base_url);
        debug!(url = %url, "Fetching exercise catalog");

        let response = self.client.get(&url).bearer_auth(token).send().await?;
        let exercises: Vec<Exercise> = Self::parse(response).await?;
        debug!(count = exercises.len(), "Fetched exercise catalog");
        Ok(exercises)
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string()
            });
        warn!(status = status.as_u16(), message = %message, "API request failed");
        Err(StreamError::api(status.as_u16(), message))
    }
}
