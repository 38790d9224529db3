//! Session and credential lifecycle core.
//!
//! Persists an access/refresh token pair across restarts, attaches
//! credentials to outbound API calls, refreshes expired tokens with
//! single-flight semantics and cascades a clean logout when refresh is
//! impossible.

pub mod api;
pub mod auth;
pub mod config;
pub mod session;
pub mod utils;

pub use api::{ApiError, ApiRequest, ApiResponse, RequestDispatcher};
pub use auth::{
    AuthSnapshot, AuthState, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    LogoutCascade, MemoryCredentialStore, RefreshCoordinator, SessionOutcome, StorageError,
};
pub use config::{SessionConfig, StorageBackend};
pub use session::Session;
