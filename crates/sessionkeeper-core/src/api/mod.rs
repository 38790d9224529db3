//! REST API plumbing for the backend.
//!
//! This module provides the `RequestDispatcher`, which attaches bearer
//! credentials to protected requests and routes auth failures through the
//! refresh coordinator, plus the HTTP implementation of the refresh call.

pub mod client;
pub mod endpoint;
pub mod error;
mod models;
pub mod refresher;

pub use client::{build_http_client, ApiResponse, RequestDispatcher};
pub use endpoint::{is_public_path, ApiRequest};
pub use error::ApiError;
pub use refresher::HttpTokenRefresher;
