//! Session wiring.
//!
//! `Session` is built once at process start and owns every component. Hosts
//! pass it (or the handles it exposes) to the code that needs them instead
//! of reaching into global state.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::api::{build_http_client, ApiError, ApiRequest, ApiResponse, HttpTokenRefresher, RequestDispatcher};
use crate::auth::{
    required_fields_predicate, AuthSnapshot, AuthState, CompletenessPredicate, CredentialStore,
    FileCredentialStore, KeyringCredentialStore, LogoutCascade, PendingQueue, RefreshCoordinator,
    SessionOutcome, SessionValidator, StorageError, TokenRefresher,
};
use crate::config::{SessionConfig, StorageBackend};

pub struct Session {
    auth: Arc<AuthState>,
    cascade: LogoutCascade,
    coordinator: Arc<RefreshCoordinator>,
    dispatcher: RequestDispatcher,
    validator: SessionValidator,
}

impl Session {
    /// Wire a session that refreshes over HTTP against `config.base_url`
    pub fn new(config: &SessionConfig, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let client = build_http_client(config.request_timeout())?;
        let refresher = Arc::new(HttpTokenRefresher::new(client.clone(), &config.base_url));
        Ok(Self::with_refresher(config, store, client, refresher))
    }

    /// Wire a session with a custom refresh implementation
    pub fn with_refresher(
        config: &SessionConfig,
        store: Arc<dyn CredentialStore>,
        client: Client,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let auth = Arc::new(AuthState::new(store));
        let cascade = LogoutCascade::new(auth.clone(), Arc::new(PendingQueue::new()));
        let coordinator = RefreshCoordinator::new(
            auth.clone(),
            cascade.clone(),
            refresher,
            config.refresh_timeout(),
        );
        let dispatcher = RequestDispatcher::new(client, &config.base_url, auth.clone(), coordinator.clone());
        let validator = SessionValidator::new(auth.clone(), dispatcher.clone(), cascade.clone())
            .with_completeness(required_fields_predicate(config.required_profile_fields.clone()));

        info!(base_url = %config.base_url, "Session initialized");
        Self {
            auth,
            cascade,
            coordinator,
            dispatcher,
            validator,
        }
    }

    /// Open the credential store selected in the config
    pub fn open_store(config: &SessionConfig) -> Result<Arc<dyn CredentialStore>> {
        match config.storage {
            StorageBackend::Keyring => Ok(Arc::new(KeyringCredentialStore::new(&config.keyring_service))),
            StorageBackend::File => {
                let path = match config.credential_file {
                    Some(ref path) => path.clone(),
                    None => FileCredentialStore::default_path()
                        .context("Could not find data directory for credential file")?,
                };
                Ok(Arc::new(FileCredentialStore::new(path)))
            }
        }
    }

    /// Replace the onboarding completeness check used by `validate`
    pub fn with_completeness(mut self, predicate: CompletenessPredicate) -> Self {
        self.validator = self.validator.with_completeness(predicate);
        self
    }

    pub fn auth(&self) -> &Arc<AuthState> {
        &self.auth
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn read(&self) -> AuthSnapshot {
        self.auth.read()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.auth.subscribe()
    }

    /// Reconcile stored credentials with the server. Run once at startup.
    pub async fn validate(&self) -> Result<SessionOutcome, ApiError> {
        self.validator.validate().await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSnapshot, ApiError> {
        self.dispatcher.login(email, password).await
    }

    pub async fn signup(&self, body: Value) -> Result<Option<AuthSnapshot>, ApiError> {
        self.dispatcher.signup(body).await
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.dispatcher.send(request).await
    }

    /// Explicit user sign-out
    pub fn logout(&self) -> Result<(), StorageError> {
        self.cascade.logout()
    }
}
