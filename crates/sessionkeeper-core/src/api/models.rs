//! Wire types for the auth endpoints.
//!
//! Only the credential-bearing parts of each payload are modelled; business
//! fields pass through as raw JSON.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct PasswordResetRequest<'a> {
    pub email: &'a str,
}

/// Response from login, signup and email verification.
/// Signup may succeed without tokens when verification is still pending.
#[derive(Debug, Deserialize)]
pub(crate) struct AuthResponse {
    #[serde(alias = "accessToken")]
    pub access_token: Option<String>,
    #[serde(alias = "refreshToken")]
    pub refresh_token: Option<String>,
    pub user: Option<UserRef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<UserRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UserRef {
    #[serde(alias = "_id", deserialize_with = "string_or_number")]
    pub id: String,
}

/// User ids arrive as strings from some backends and numbers from others
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number user id, got {}",
            other
        ))),
    }
}
