//! Account sign-up and API key exchange. Both routes are public.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use super::AppState;
use crate::auth::{hash_password, provision_credential, verify_password};
use crate::error::{ApiError, FieldErrors};
use crate::models::User;
use crate::payload::Payload;

pub const USERNAME_MAX_LEN: usize = 150;
pub const PASSWORD_MIN_LEN: usize = 8;

const INVALID_USERNAME: &str =
    "Enter a valid username. This value may contain only letters, numbers, and @/./+/-/_ characters.";
const BAD_CREDENTIALS: &str = "Unable to log in with provided credentials.";

#[derive(Debug, Serialize, ToSchema)]
pub struct SignupResponse {
    pub username: String,
    pub token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub token: String,
}

fn valid_username(username: &str) -> bool {
    username
        .chars()
        .all(|c| c.is_alphanumeric() || "@.+-_".contains(c))
}

/// Password strength rules, one message per failed rule.
fn password_problems(password: &str) -> Vec<String> {
    let mut problems = Vec::new();
    if password.chars().count() < PASSWORD_MIN_LEN {
        problems.push(format!(
            "This password is too short. It must contain at least {PASSWORD_MIN_LEN} characters."
        ));
    }
    if password.chars().all(|c| c.is_ascii_digit()) {
        problems.push("This password is entirely numeric.".to_string());
    }
    problems
}

/// Register a user and issue their API key.
#[utoipa::path(
    post,
    path = "/signup/",
    responses(
        (status = 201, description = "Account created", body = SignupResponse),
        (status = 400, description = "Field validation errors")
    ),
    tag = "accounts"
)]
pub async fn signup(
    State(state): State<Arc<AppState>>,
    payload: Payload,
) -> Result<(StatusCode, Json<SignupResponse>), ApiError> {
    let mut errors = FieldErrors::default();
    let username = payload.text("username", USERNAME_MAX_LEN, true, &mut errors);
    let password1 = payload.secret("password1", true, &mut errors);
    let password2 = payload.secret("password2", true, &mut errors);

    if let Some(name) = username.as_deref() {
        if !valid_username(name) {
            errors.add("username", INVALID_USERNAME);
        } else if state.storage.get_user(name)?.is_some() {
            errors.add("username", "A user with that username already exists.");
        }
    }
    if let (Some(first), Some(second)) = (password1.as_deref(), password2.as_deref()) {
        if first != second {
            errors.add("password2", "The two password fields didn't match.");
        } else {
            for problem in password_problems(second) {
                errors.add("password2", problem);
            }
        }
    }
    errors.into_result()?;

    let (Some(username), Some(password)) = (username, password1) else {
        return Err(ApiError::Malformed("username and password are required".into()));
    };
    let cost = state.settings.bcrypt_cost;
    let password_hash =
        tokio::task::spawn_blocking(move || hash_password(&password, cost)).await??;
    let user = User {
        username,
        password_hash,
        date_joined: Utc::now(),
    };
    state.storage.create_user(&user)?;
    let token = provision_credential(&state.storage, &user.username)?;
    tracing::info!(username = %user.username, "user signed up");

    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            username: user.username,
            token,
        }),
    ))
}

/// Exchange a username and password for the user's API key.
#[utoipa::path(
    post,
    path = "/api-token-auth/",
    responses(
        (status = 200, description = "The caller's API key", body = TokenResponse),
        (status = 400, description = "Missing fields or wrong credentials")
    ),
    tag = "accounts"
)]
pub async fn obtain_token(
    State(state): State<Arc<AppState>>,
    payload: Payload,
) -> Result<Json<TokenResponse>, ApiError> {
    let mut errors = FieldErrors::default();
    let username = payload.text("username", USERNAME_MAX_LEN, true, &mut errors);
    let password = payload.secret("password", true, &mut errors);
    errors.into_result()?;

    let (Some(username), Some(password)) = (username, password) else {
        return Err(ApiError::Malformed("username and password are required".into()));
    };
    let verified = match state.storage.get_user(&username)? {
        Some(user) => {
            let hash = user.password_hash.clone();
            let matches =
                tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await??;
            matches.then_some(user)
        }
        None => None,
    };
    let user = match verified {
        Some(user) => user,
        None => {
            tracing::debug!(%username, "rejected key exchange");
            return Err(ApiError::Validation(FieldErrors::single(
                "non_field_errors",
                BAD_CREDENTIALS,
            )));
        }
    };

    let token = provision_credential(&state.storage, &user.username)?;
    Ok(Json(TokenResponse { token }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_characters() {
        assert!(valid_username("alice"));
        assert!(valid_username("alice.smith+carbon@example-co_2"));
        assert!(!valid_username("alice smith"));
        assert!(!valid_username("alice/smith"));
    }

    #[test]
    fn test_password_rules() {
        assert!(password_problems("zerocarbon").is_empty());
        assert_eq!(password_problems("short").len(), 1);
        assert_eq!(password_problems("1234567").len(), 2);
        assert_eq!(
            password_problems("123456789"),
            vec!["This password is entirely numeric.".to_string()]
        );
    }
}
