use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use bcrypt::{hash, verify};
use uuid::Uuid;

use crate::error::{ApiError, NOT_AUTHENTICATED};
use crate::models::Usage;
use crate::storage::{Storage, StorageError};

pub fn hash_password(password: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    hash(password, cost)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, bcrypt::BcryptError> {
    verify(password, hash)
}

/// Fresh API key: 32 lowercase hex characters.
pub fn generate_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Give `username` its API key. Called right after an account is created and
/// again on every key exchange; the user keeps the first key ever issued.
pub fn provision_credential(storage: &Storage, username: &str) -> Result<String, StorageError> {
    storage.get_or_create_token(username, &generate_key())
}

/// Pull the key out of `Authorization: Token <key>` (or `Bearer <key>`).
/// Returns the client-facing reason on failure.
pub fn extract_key(header: Option<&str>) -> Result<&str, &'static str> {
    let mut parts = header.ok_or(NOT_AUTHENTICATED)?.split_whitespace();
    match parts.next() {
        Some(keyword)
            if keyword.eq_ignore_ascii_case("token") || keyword.eq_ignore_ascii_case("bearer") => {}
        _ => return Err(NOT_AUTHENTICATED),
    }
    let key = parts
        .next()
        .ok_or("Invalid token header. No credentials provided.")?;
    if parts.next().is_some() {
        return Err("Invalid token header. Token string should not contain spaces.");
    }
    Ok(key)
}

/// The authenticated user of the current request, placed in the request
/// extensions by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub username: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Caller>()
            .cloned()
            .ok_or(ApiError::AuthenticationRequired(NOT_AUTHENTICATED))
    }
}

/// Object-level permission: only the owner may see or touch a usage.
pub fn ensure_owner(usage: &Usage, caller: &Caller) -> Result<(), ApiError> {
    if usage.user == caller.username {
        Ok(())
    } else {
        Err(ApiError::PermissionDenied)
    }
}
