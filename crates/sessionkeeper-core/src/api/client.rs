//! Request dispatcher for the backend REST API.
//!
//! `RequestDispatcher` attaches bearer credentials to protected requests,
//! hands 401/403 responses to the refresh coordinator, and replays the
//! request once the session has been recovered.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::endpoint::{
    ApiRequest, LOGIN_PATH, PASSWORD_RESET_PATH, PROFILE_PATH, SIGNUP_PATH, VERIFY_EMAIL_PATH,
};
use super::models::{AuthResponse, LoginRequest, PasswordResetRequest};
use super::ApiError;
use crate::auth::{AuthSnapshot, AuthState, RefreshCoordinator};

/// A successful (2xx) response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}

/// Build the shared HTTP client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
pub fn build_http_client(timeout: Duration) -> Result<Client, ApiError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Join a base URL and an endpoint path with exactly one slash
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Check if response is successful, returning an error with body if not.
/// Auth failures on public endpoints are plain HTTP errors (bad password,
/// rejected refresh), not expired sessions.
pub(crate) async fn check_response(response: reqwest::Response, public: bool) -> Result<ApiResponse, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    } else if public {
        Err(ApiError::http(status.as_u16(), &body))
    } else {
        Err(ApiError::from_status(status.as_u16(), &body))
    }
}

#[derive(Clone)]
pub struct RequestDispatcher {
    client: Client,
    base_url: String,
    auth: Arc<AuthState>,
    coordinator: Arc<RefreshCoordinator>,
}

impl RequestDispatcher {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        auth: Arc<AuthState>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            auth,
            coordinator,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a request.
    ///
    /// Network errors and non-auth HTTP errors are returned untouched. A
    /// 401/403 on a protected request waits for the refresh coordinator and
    /// is retried once with the token current at retry time.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let token = match request.bearer_override {
            Some(ref token) => Some(token.clone()),
            None => self.auth.access_token(),
        };

        match self.send_once(&request, token.as_deref()).await {
            Err(e) if e.is_auth_failure() && !request.public => {
                info!(path = %request.path, status = ?e.status(), "Auth failure, recovering session");
                self.coordinator.recover(token.as_deref()).await?;

                let retry_token = self.auth.access_token();
                let result = self.send_once(&request, retry_token.as_deref()).await;
                if let Err(ref e) = result {
                    if e.is_auth_failure() {
                        warn!(path = %request.path, "Auth failure persisted after refresh");
                    }
                }
                result
            }
            other => other,
        }
    }

    /// Send a request and deserialize the success body
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        self.send(request).await?.json()
    }

    async fn send_once(&self, request: &ApiRequest, token: Option<&str>) -> Result<ApiResponse, ApiError> {
        let url = join_url(&self.base_url, &request.path);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(header::ACCEPT, "application/json");

        if !request.public {
            match token {
                Some(token) => builder = builder.bearer_auth(token),
                // Let the server answer 401 so failure handling stays in one place
                None => debug!(path = %request.path, "No access token, sending without Authorization"),
            }
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(path = %request.path, error = %e, "Request failed without response");
            ApiError::Network(e)
        })?;

        check_response(response, request.public).await
    }

    // ===== Auth Endpoints =====

    /// Log in and commit the returned session
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSnapshot, ApiError> {
        let body = serde_json::to_value(LoginRequest { email, password })
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;
        let response: AuthResponse = self.send_json(ApiRequest::post(LOGIN_PATH, body)).await?;

        self.commit_auth_response(response)?
            .ok_or_else(|| ApiError::InvalidResponse("login response carried no tokens".to_string()))
    }

    /// Sign up. Returns `None` when the account still needs verification.
    pub async fn signup(&self, body: Value) -> Result<Option<AuthSnapshot>, ApiError> {
        let response: AuthResponse = self.send_json(ApiRequest::post(SIGNUP_PATH, body)).await?;
        self.commit_auth_response(response)
    }

    /// Confirm an email address. Returns `None` when no session is issued.
    pub async fn verify_email(&self, body: Value) -> Result<Option<AuthSnapshot>, ApiError> {
        let response: AuthResponse = self.send_json(ApiRequest::post(VERIFY_EMAIL_PATH, body)).await?;
        self.commit_auth_response(response)
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), ApiError> {
        let body = serde_json::to_value(PasswordResetRequest { email })
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;
        self.send(ApiRequest::post(PASSWORD_RESET_PATH, body)).await?;
        Ok(())
    }

    /// Fetch the signed-in user's profile
    pub async fn fetch_profile(&self) -> Result<Value, ApiError> {
        self.send_json(ApiRequest::get(PROFILE_PATH)).await
    }

    fn commit_auth_response(&self, response: AuthResponse) -> Result<Option<AuthSnapshot>, ApiError> {
        let (access_token, user) = match (response.access_token, response.user) {
            (Some(access_token), Some(user)) => (access_token, user),
            (Some(_), None) => {
                return Err(ApiError::InvalidResponse("auth response has tokens but no user".to_string()))
            }
            _ => return Ok(None),
        };
        if response.refresh_token.is_none() {
            warn!(user_id = %user.id, "Auth response without refresh token, session cannot be refreshed");
        }
        // Never pair a new access token with a previous session's refresh token
        let snapshot = self
            .auth
            .establish(&access_token, response.refresh_token.as_deref(), &user.id)?;
        Ok(Some(snapshot))
    }
}
