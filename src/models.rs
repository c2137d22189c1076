use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use utoipa::ToSchema;

use crate::query::Sortable;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub date_joined: DateTime<Utc>,
}

/// A named category of trackable activity with its unit of measure.
/// Shared catalog: not owned by any user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct UsageType {
    pub id: u64,
    #[schema(example = "driving")]
    pub name: String,
    #[schema(example = "kilometers")]
    pub unit: String,
}

/// One timestamped occurrence of a usage type, owned by `user`.
///
/// The stored document and the wire representation are the same shape:
/// `user` carries the owner's username and is never taken from a request body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct Usage {
    pub id: u64,
    pub user: String,
    pub usage_type: u64,
    #[schema(value_type = String, example = "2021-04-05T18:55:06.212829+02:00")]
    pub usage_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageTypeField {
    Name,
    Unit,
}

impl Sortable for UsageType {
    type Field = UsageTypeField;

    fn sort_field(name: &str) -> Option<Self::Field> {
        match name {
            "name" => Some(UsageTypeField::Name),
            "unit" => Some(UsageTypeField::Unit),
            _ => None,
        }
    }

    fn compare_by(&self, other: &Self, field: Self::Field) -> Ordering {
        match field {
            UsageTypeField::Name => self.name.cmp(&other.name),
            UsageTypeField::Unit => self.unit.cmp(&other.unit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageField {
    UsageAt,
    UsageType,
}

impl Sortable for Usage {
    type Field = UsageField;

    fn sort_field(name: &str) -> Option<Self::Field> {
        match name {
            "usage_at" => Some(UsageField::UsageAt),
            "usage_type" => Some(UsageField::UsageType),
            _ => None,
        }
    }

    // DateTime ordering compares instants, so mixed offsets sort correctly
    fn compare_by(&self, other: &Self, field: Self::Field) -> Ordering {
        match field {
            UsageField::UsageAt => self.usage_at.cmp(&other.usage_at),
            UsageField::UsageType => self.usage_type.cmp(&other.usage_type),
        }
    }
}
