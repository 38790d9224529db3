//! Startup reconciliation of stored credentials with the server.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::logout::LogoutCascade;
use super::state::AuthState;
use crate::api::endpoint::PROFILE_PATH;
use crate::api::{ApiError, ApiRequest, RequestDispatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionOutcome {
    NoCredentials,
    InvalidCredentials,
    /// Authenticated, but onboarding/profile data is incomplete
    ValidIncomplete,
    ValidComplete,
}

impl SessionOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionOutcome::ValidIncomplete | SessionOutcome::ValidComplete)
    }
}

/// Decides whether a profile payload has everything onboarding requires
pub type CompletenessPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Complete when every named top-level field is present and not null.
/// An empty list accepts every profile.
pub fn required_fields_predicate(fields: Vec<String>) -> CompletenessPredicate {
    Arc::new(move |profile: &Value| {
        fields
            .iter()
            .all(|field| profile.get(field).map(|v| !v.is_null()).unwrap_or(false))
    })
}

pub struct SessionValidator {
    auth: Arc<AuthState>,
    dispatcher: RequestDispatcher,
    cascade: LogoutCascade,
    is_complete: CompletenessPredicate,
}

impl SessionValidator {
    pub fn new(auth: Arc<AuthState>, dispatcher: RequestDispatcher, cascade: LogoutCascade) -> Self {
        Self {
            auth,
            dispatcher,
            cascade,
            is_complete: required_fields_predicate(Vec::new()),
        }
    }

    pub fn with_completeness(mut self, predicate: CompletenessPredicate) -> Self {
        self.is_complete = predicate;
        self
    }

    /// Validate stored credentials against `GET /user/me`.
    ///
    /// Network failures are returned as `Err(ApiError::Network)` and leave the
    /// stored session alone so the caller can retry.
    pub async fn validate(&self) -> Result<SessionOutcome, ApiError> {
        let (token, user_id) = match self.auth.stored_credentials() {
            Ok((Some(token), Some(user_id))) if !token.is_empty() && !user_id.is_empty() => (token, user_id),
            Ok(_) => {
                info!("No stored credentials");
                self.logout();
                return Ok(SessionOutcome::NoCredentials);
            }
            Err(e) => {
                warn!(error = %e, "Could not read stored credentials, treating as signed out");
                self.logout();
                return Ok(SessionOutcome::NoCredentials);
            }
        };

        let request = ApiRequest::get(PROFILE_PATH).with_bearer(token.clone());
        let profile: Value = match self.dispatcher.send_json(request).await {
            Ok(profile) => profile,
            // Refresh impossible, or the refreshed token was still refused
            Err(ApiError::SessionExpired) | Err(ApiError::AuthExpired { .. }) => {
                info!(user_id = %user_id, "Stored session rejected by server");
                self.logout();
                return Ok(SessionOutcome::InvalidCredentials);
            }
            Err(e) => return Err(e),
        };

        // The profile call may have gone through a refresh, keep the newest token
        let snapshot = self.auth.read();
        let token = snapshot.access_token.unwrap_or(token);
        let user_id = snapshot.user_id.unwrap_or(user_id);
        self.auth.set_authenticated(true, &token, None, &user_id)?;

        let outcome = if (self.is_complete)(&profile) {
            SessionOutcome::ValidComplete
        } else {
            SessionOutcome::ValidIncomplete
        };
        info!(user_id = %user_id, ?outcome, "Session validated");
        Ok(outcome)
    }

    fn logout(&self) {
        if let Err(e) = self.cascade.logout() {
            warn!(error = %e, "Failed to clear credential storage during validation");
        }
    }
}
