use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{header, Client};
use tracing::debug;

use super::client::join_url;
use super::endpoint::REFRESH_PATH;
use super::models::{RefreshRequest, RefreshResponse};
use crate::auth::{RefreshFailure, RefreshedTokens, TokenRefresher};

/// Calls `POST /auth/refresh` with the stored refresh token.
#[derive(Clone)]
pub struct HttpTokenRefresher {
    client: Client,
    base_url: String,
}

impl HttpTokenRefresher {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn call(client: Client, url: String, refresh_token: String) -> Result<RefreshedTokens, RefreshFailure> {
        let response = client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
            .map_err(|e| RefreshFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Refresh endpoint rejected token");
            return Err(RefreshFailure::Rejected(status.as_u16()));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshFailure::InvalidResponse(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(RefreshFailure::InvalidResponse("empty access token".to_string()));
        }

        Ok(RefreshedTokens {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.filter(|token| !token.is_empty()),
            user_id: parsed.user.map(|user| user.id),
        })
    }
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh(&self, refresh_token: String) -> BoxFuture<'static, Result<RefreshedTokens, RefreshFailure>> {
        let url = join_url(&self.base_url, REFRESH_PATH);
        Self::call(self.client.clone(), url, refresh_token).boxed()
    }
}
