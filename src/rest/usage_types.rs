//! Handlers for the shared usage type catalog. Any authenticated user may
//! read and write it.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::{parse_id, AppState, RequestUrl};
use crate::error::{ApiError, FieldErrors};
use crate::models::UsageType;
use crate::payload::Payload;
use crate::query::{paginate, parse_ordering, sort_records, ListParams, Page};

pub const NAME_MAX_LEN: usize = 255;
pub const UNIT_MAX_LEN: usize = 20;

/// Validated fields of a usage type body. On partial updates absent fields
/// stay `None` and keep their stored value.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UsageTypeInput {
    pub name: Option<String>,
    pub unit: Option<String>,
}

impl UsageTypeInput {
    pub fn from_payload(payload: &Payload, partial: bool) -> Result<Self, ApiError> {
        let mut errors = FieldErrors::default();
        let input = Self {
            name: payload.text("name", NAME_MAX_LEN, !partial, &mut errors),
            unit: payload.text("unit", UNIT_MAX_LEN, !partial, &mut errors),
        };
        errors.into_result()?;
        Ok(input)
    }

    fn apply(self, usage_type: &mut UsageType) {
        if let Some(name) = self.name {
            usage_type.name = name;
        }
        if let Some(unit) = self.unit {
            usage_type.unit = unit;
        }
    }
}

#[utoipa::path(
    get,
    path = "/carbon_usage/usage_type/",
    params(ListParams),
    responses(
        (status = 200, description = "One page of usage types", body = crate::query::UsageTypePage),
        (status = 404, description = "Invalid page")
    ),
    security(("token" = [])),
    tag = "usage_type"
)]
pub async fn list(
    State(state): State<Arc<AppState>>,
    params: ListParams,
    RequestUrl(url): RequestUrl,
) -> Result<Json<Page<UsageType>>, ApiError> {
    let mut records = state.storage.list_usage_types()?;
    sort_records(&mut records, &parse_ordering::<UsageType>(params.ordering.as_deref()));
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
    path = "/carbon_usage/usage_type/",
    responses(
        (status = 201, description = "Usage type created", body = UsageType),
        (status = 400, description = "Field validation errors")
    ),
    security(("token" = [])),
    tag = "usage_type"
)]
pub async fn create(
    State(state): State<Arc<AppState>>,
    payload: Payload,
) -> Result<(StatusCode, Json<UsageType>), ApiError> {
    let input = UsageTypeInput::from_payload(&payload, false)?;
    let (Some(name), Some(unit)) = (input.name, input.unit) else {
        return Err(ApiError::Malformed("name and unit are required".into()));
    };
    let created = state.storage.create_usage_type(&name, &unit)?;
    tracing::info!(id = created.id, name = %created.name, "created usage type");
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/carbon_usage/usage_type/{id}/",
    params(("id" = u64, Path, description = "Usage type id")),
    responses(
        (status = 200, description = "The usage type", body = UsageType),
        (status = 404, description = "No such usage type")
    ),
    security(("token" = [])),
    tag = "usage_type"
)]
pub async fn retrieve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<UsageType>, ApiError> {
    Ok(Json(fetch(&state, &id)?))
}

#[utoipa::path(
    put,
    path = "/carbon_usage/usage_type/{id}/",
    params(("id" = u64, Path, description = "Usage type id")),
    responses(
        (status = 200, description = "Usage type replaced", body = UsageType),
        (status = 400, description = "Field validation errors"),
        (status = 404, description = "No such usage type")
    ),
    security(("token" = [])),
    tag = "usage_type"
)]
pub async fn replace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Payload,
) -> Result<Json<UsageType>, ApiError> {
    update(&state, &id, &payload, false)
}

#[utoipa::path(
    patch,
    path = "/carbon_usage/usage_type/{id}/",
    params(("id" = u64, Path, description = "Usage type id")),
    responses(
        (status = 200, description = "Usage type updated", body = UsageType),
        (status = 400, description = "Field validation errors"),
        (status = 404, description = "No such usage type")
    ),
    security(("token" = [])),
    tag = "usage_type"
)]
pub async fn partial_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Payload,
) -> Result<Json<UsageType>, ApiError> {
    update(&state, &id, &payload, true)
}

#[utoipa::path(
    delete,
    path = "/carbon_usage/usage_type/{id}/",
    params(("id" = u64, Path, description = "Usage type id")),
    responses(
        (status = 204, description = "Usage type and its usages deleted"),
        (status = 404, description = "No such usage type")
    ),
    security(("token" = [])),
    tag = "usage_type"
)]
pub async fn destroy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    let cascaded = state.storage.delete_usage_type(id)?;
    tracing::info!(id, cascaded, "deleted usage type");
    Ok(StatusCode::NO_CONTENT)
}

fn fetch(state: &AppState, raw_id: &str) -> Result<UsageType, ApiError> {
    let id = parse_id(raw_id)?;
    state
        .storage
        .get_usage_type(id)?
        .ok_or(ApiError::NotFound)
}

fn update(
    state: &AppState,
    raw_id: &str,
    payload: &Payload,
    partial: bool,
) -> Result<Json<UsageType>, ApiError> {
    let mut usage_type = fetch(state, raw_id)?;
    UsageTypeInput::from_payload(payload, partial)?.apply(&mut usage_type);
    state.storage.update_usage_type(&usage_type)?;
    Ok(Json(usage_type))
}
