//! Endpoint paths and the public/protected classification table.

use reqwest::Method;
use serde_json::Value;

pub const LOGIN_PATH: &str = "/auth/login";
pub const SIGNUP_PATH: &str = "/auth/signup";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const VERIFY_EMAIL_PATH: &str = "/auth/verify-email";
pub const PASSWORD_RESET_PATH: &str = "/auth/password-reset";
pub const PROFILE_PATH: &str = "/user/me";

/// Endpoints that never carry an `Authorization` header
const PUBLIC_PATHS: &[&str] = &[
    LOGIN_PATH,
    SIGNUP_PATH,
    REFRESH_PATH,
    VERIFY_EMAIL_PATH,
    PASSWORD_RESET_PATH,
    "/auth/password-reset/confirm",
];

/// Social sign-in variants, e.g. `/auth/social/google`
const PUBLIC_PREFIXES: &[&str] = &["/auth/social/"];

/// Whether a path is in the public endpoint table.
/// Query strings and trailing slashes are ignored.
pub fn is_public_path(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    PUBLIC_PATHS.contains(&path) || PUBLIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// An outbound API call, relative to the configured base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Public requests are sent without credentials and never refreshed
    pub public: bool,
    /// Token to use on the first attempt instead of the in-memory one.
    /// Retries after a refresh always use the current token.
    pub bearer_override: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            method,
            public: is_public_path(&path),
            path,
            body: None,
            bearer_override: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Override the classification from the endpoint table
    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_override = Some(token.into());
        self
    }
}
