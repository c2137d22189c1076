//! Handlers for usages. Every usage belongs to the user who created it:
//! lists only show the caller's own records, and item routes answer 403
//! when the record belongs to someone else.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use std::sync::Arc;

use super::{parse_id, AppState, RequestUrl};
use crate::auth::{ensure_owner, Caller};
use crate::error::{invalid_pk, ApiError, FieldErrors};
use crate::models::Usage;
use crate::payload::Payload;
use crate::query::{
    paginate, parse_ordering, sort_records, ListParams, Page, TimeRangeParams,
};
use crate::storage::Storage;

/// Validated fields of a usage body. The owner never comes from the body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UsageInput {
    pub usage_type: Option<u64>,
    pub usage_at: Option<DateTime<FixedOffset>>,
}

impl UsageInput {
    pub fn from_payload(
        payload: &Payload,
        partial: bool,
        storage: &Storage,
        default_tz: Tz,
    ) -> Result<Self, ApiError> {
        let mut errors = FieldErrors::default();
        let usage_type = payload.primary_key("usage_type", !partial, &mut errors);
        if let Some(id) = usage_type {
            if storage.get_usage_type(id)?.is_none() {
                errors.add("usage_type", invalid_pk(id));
            }
        }
        let usage_at = payload.timestamp("usage_at", !partial, default_tz, &mut errors);
        errors.into_result()?;
        Ok(Self {
            usage_type,
            usage_at,
        })
    }

    fn apply(self, usage: &mut Usage) {
        if let Some(usage_type) = self.usage_type {
            usage.usage_type = usage_type;
        }
        if let Some(usage_at) = self.usage_at {
            usage.usage_at = usage_at;
        }
    }

    fn complete(self) -> Result<(u64, DateTime<FixedOffset>), ApiError> {
        match (self.usage_type, self.usage_at) {
            (Some(usage_type), Some(usage_at)) => Ok((usage_type, usage_at)),
            _ => Err(ApiError::Malformed(
                "usage_type and usage_at are required".into(),
            )),
        }
    }
}

#[utoipa::path(
    get,
    path = "/carbon_usage/usage/",
    params(ListParams, TimeRangeParams),
    responses(
        (status = 200, description = "One page of the caller's usages", body = crate::query::UsagePage),
        (status = 400, description = "Malformed time range bound"),
        (status = 404, description = "Invalid page")
    ),
    security(("token" = [])),
    tag = "usage"
)]
pub async fn list(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    params: ListParams,
    range: TimeRangeParams,
    RequestUrl(url): RequestUrl,
) -> Result<Json<Page<Usage>>, ApiError> {
    let range = range.parse(state.settings.time_zone)?;
    let mut records = state.storage.list_usages_owned_by(&caller.username)?;
    records.retain(|usage| range.contains(&usage.usage_at));
    sort_records(&mut records, &parse_ordering::<Usage>(params.ordering.as_deref()));
    let page = paginate(
        records,
        params.page.as_deref(),
        state.settings.page_size,
        &url,
    )?;
    Ok(Json(page))
}

#[utoipa::path(
    post,
    path = "/carbon_usage/usage/",
    responses(
        (status = 201, description = "Usage recorded for the caller", body = Usage),
        (status = 400, description = "Field validation errors")
    ),
    security(("token" = [])),
    tag = "usage"
)]
pub async fn create(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    payload: Payload,
) -> Result<(StatusCode, Json<Usage>), ApiError> {
    let (usage_type, usage_at) =
        UsageInput::from_payload(&payload, false, &state.storage, state.settings.time_zone)?
            .complete()?;
    let created = state
        .storage
        .create_usage(&caller.username, usage_type, usage_at)?;
    tracing::info!(id = created.id, user = %caller.username, usage_type, "recorded usage");
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/carbon_usage/usage/{id}/",
    params(("id" = u64, Path, description = "Usage id")),
    responses(
        (status = 200, description = "The usage", body = Usage),
        (status = 403, description = "Usage belongs to another user"),
        (status = 404, description = "No such usage")
    ),
    security(("token" = [])),
    tag = "usage"
)]
pub async fn retrieve(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Usage>, ApiError> {
    Ok(Json(owned_usage(&state, &caller, &id)?))
}

#[utoipa::path(
    put,
    path = "/carbon_usage/usage/{id}/",
    params(("id" = u64, Path, description = "Usage id")),
    responses(
        (status = 200, description = "Usage replaced", body = Usage),
        (status = 400, description = "Field validation errors"),
        (status = 403, description = "Usage belongs to another user"),
        (status = 404, description = "No such usage")
    ),
    security(("token" = [])),
    tag = "usage"
)]
pub async fn replace(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    payload: Payload,
) -> Result<Json<Usage>, ApiError> {
    update(&state, &caller, &id, &payload, false)
}

#[utoipa::path(
    patch,
    path = "/carbon_usage/usage/{id}/",
    params(("id" = u64, Path, description = "Usage id")),
    responses(
        (status = 200, description = "Usage updated", body = Usage),
        (status = 400, description = "Field validation errors"),
        (status = 403, description = "Usage belongs to another user"),
        (status = 404, description = "No such usage")
    ),
    security(("token" = [])),
    tag = "usage"
)]
pub async fn partial_update(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    payload: Payload,
) -> Result<Json<Usage>, ApiError> {
    update(&state, &caller, &id, &payload, true)
}

#[utoipa::path(
    delete,
    path = "/carbon_usage/usage/{id}/",
    params(("id" = u64, Path, description = "Usage id")),
    responses(
        (status = 204, description = "Usage deleted"),
        (status = 403, description = "Usage belongs to another user"),
        (status = 404, description = "No such usage")
    ),
    security(("token" = [])),
    tag = "usage"
)]
pub async fn destroy(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let usage = owned_usage(&state, &caller, &id)?;
    state.storage.delete_usage(usage.id)?;
    tracing::info!(id = usage.id, user = %caller.username, "deleted usage");
    Ok(StatusCode::NO_CONTENT)
}

/// Load a usage for an item route: 404 if unknown, 403 if not the caller's.
fn owned_usage(state: &AppState, caller: &Caller, raw_id: &str) -> Result<Usage, ApiError> {
    let id = parse_id(raw_id)?;
    let usage = state.storage.get_usage(id)?.ok_or(ApiError::NotFound)?;
    ensure_owner(&usage, caller)?;
    Ok(usage)
}

fn update(
    state: &AppState,
    caller: &Caller,
    raw_id: &str,
    payload: &Payload,
    partial: bool,
) -> Result<Json<Usage>, ApiError> {
    let mut usage = owned_usage(state, caller, raw_id)?;
    UsageInput::from_payload(payload, partial, &state.storage, state.settings.time_zone)?
        .apply(&mut usage);
    Ok(Json(state.storage.replace_usage(&usage)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => Payload(map),
            _ => panic!("test payloads must be objects"),
        }
    }

    #[test]
    fn test_unknown_usage_type_is_a_field_error() {
        let storage = Storage::temporary().unwrap();
        let body = payload(json!({
            "usage_type": 42,
            "usage_at": "2021-04-05T18:55:06+02:00",
        }));
        match UsageInput::from_payload(&body, false, &storage, Tz::UTC) {
            Err(ApiError::Validation(errors)) => assert_eq!(
                errors.get("usage_type"),
                Some(&["Invalid pk \"42\" - object does not exist.".to_string()][..])
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_partial_input_changes_only_given_fields() {
        let storage = Storage::temporary().unwrap();
        let driving = storage.create_usage_type("driving", "kilometers").unwrap();
        let flying = storage.create_usage_type("flying", "kilometers").unwrap();
        let at = DateTime::parse_from_rfc3339("2021-04-05T18:55:06+02:00").unwrap();
        let mut usage = storage.create_usage("alice", driving.id, at).unwrap();

        let body = payload(json!({ "usage_type": flying.id.to_string() }));
        UsageInput::from_payload(&body, true, &storage, Tz::UTC)
            .unwrap()
            .apply(&mut usage);
        assert_eq!(usage.usage_type, flying.id);
        assert_eq!(usage.usage_at, at);
    }

    #[test]
    fn test_full_input_requires_both_fields() {
        let storage = Storage::temporary().unwrap();
        match UsageInput::from_payload(&payload(json!({})), false, &storage, Tz::UTC) {
            Err(ApiError::Validation(errors)) => {
                assert!(errors.get("usage_type").is_some());
                assert!(errors.get("usage_at").is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
