//! Request body extraction and field validation.
//!
//! Clients post either JSON objects or urlencoded forms (the round-trip
//! script and the CLI both do the latter), so bodies are normalized into a
//! JSON map and each field is coerced and validated on read.

use async_trait::async_trait;
use axum::extract::{FromRequest, Request};
use axum::http::header;
use axum::{Form, Json};
use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use serde_json::{Map, Value};

use crate::error::{invalid_pk, ApiError, FieldErrors};
use crate::query::{parse_timestamp, TIMESTAMP_FORMAT_ERROR};

pub const REQUIRED: &str = "This field is required.";
pub const NOT_NULL: &str = "This field may not be null.";
pub const NOT_BLANK: &str = "This field may not be blank.";

/// A request body as a flat field map.
#[derive(Debug, Default, Clone)]
pub struct Payload(pub Map<String, Value>);

#[async_trait]
impl<S> FromRequest<S> for Payload
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase()
            });

        match content_type.as_deref() {
            None => Ok(Payload::default()),
            Some("application/json") => {
                let Json(value) = Json::<Value>::from_request(req, state)
                    .await
                    .map_err(|rejection| {
                        ApiError::Malformed(format!("JSON parse error - {}", rejection.body_text()))
                    })?;
                match value {
                    Value::Object(map) => Ok(Payload(map)),
                    other => Err(ApiError::Malformed(format!(
                        "Invalid data. Expected a dictionary, but got {}.",
                        type_name(&other)
                    ))),
                }
            }
            Some("application/x-www-form-urlencoded") => {
                let Form(pairs) = Form::<Vec<(String, String)>>::from_request(req, state)
                    .await
                    .map_err(|rejection| ApiError::Malformed(rejection.body_text()))?;
                Ok(Payload(
                    pairs
                        .into_iter()
                        .map(|(key, value)| (key, Value::String(value)))
                        .collect(),
                ))
            }
            Some(other) => Err(ApiError::UnsupportedMediaType(other.to_string())),
        }
    }
}

impl Payload {
    /// Look up a field, recording "required" (if `required`) or "null" errors.
    fn present(&self, field: &str, required: bool, errors: &mut FieldErrors) -> Option<&Value> {
        match self.0.get(field) {
            None => {
                if required {
                    errors.add(field, REQUIRED);
                }
                None
            }
            Some(Value::Null) => {
                errors.add(field, NOT_NULL);
                None
            }
            Some(value) => Some(value),
        }
    }

    /// Whitespace-trimmed, non-blank text of at most `max_len` characters.
    pub fn text(
        &self,
        field: &str,
        max_len: usize,
        required: bool,
        errors: &mut FieldErrors,
    ) -> Option<String> {
        let value = self.present(field, required, errors)?;
        let text = match value {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            _ => {
                errors.add(field, "Not a valid string.");
                return None;
            }
        };
        if text.is_empty() {
            errors.add(field, NOT_BLANK);
            return None;
        }
        if text.chars().count() > max_len {
            errors.add(
                field,
                format!("Ensure this field has no more than {max_len} characters."),
            );
            return None;
        }
        Some(text)
    }

    /// Like [`Payload::text`] but untrimmed and unbounded, for passwords.
    pub fn secret(&self, field: &str, required: bool, errors: &mut FieldErrors) -> Option<String> {
        match self.present(field, required, errors)? {
            Value::String(secret) if secret.is_empty() => {
                errors.add(field, NOT_BLANK);
                None
            }
            Value::String(secret) => Some(secret.clone()),
            _ => {
                errors.add(field, "Not a valid string.");
                None
            }
        }
    }

    /// A primary key given as an integer or a numeric string. Existence is
    /// checked by the caller.
    pub fn primary_key(&self, field: &str, required: bool, errors: &mut FieldErrors) -> Option<u64> {
        let value = self.present(field, required, errors)?;
        let parsed = match value {
            Value::Number(number) => number
                .as_u64()
                .ok_or_else(|| match number.as_i64() {
                    Some(negative) => invalid_pk(negative),
                    None => incorrect_pk_type(value),
                }),
            Value::String(text) => {
                let text = text.trim();
                text.parse::<u64>().map_err(|_| match text.parse::<i64>() {
                    Ok(negative) => invalid_pk(negative),
                    Err(_) => incorrect_pk_type(value),
                })
            }
            _ => Err(incorrect_pk_type(value)),
        };
        parsed.map_err(|message| errors.add(field, message)).ok()
    }

    /// An ISO-8601 timestamp; one without a UTC offset is read in `default_tz`.
    pub fn timestamp(
        &self,
        field: &str,
        required: bool,
        default_tz: Tz,
        errors: &mut FieldErrors,
    ) -> Option<DateTime<FixedOffset>> {
        let value = self.present(field, required, errors)?;
        let parsed = value
            .as_str()
            .and_then(|raw| parse_timestamp(raw, default_tz));
        if parsed.is_none() {
            errors.add(field, TIMESTAMP_FORMAT_ERROR);
        }
        parsed
    }
}

fn incorrect_pk_type(value: &Value) -> String {
    format!("Incorrect type. Expected pk value, received {}.", type_name(value))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(number) if number.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => Payload(map),
            _ => panic!("test payloads must be objects"),
        }
    }

    #[test]
    fn test_text_field_rules() {
        let body = payload(json!({
            "name": "  driving ",
            "unit": "",
            "blank": "   ",
            "nothing": null,
            "long": "x".repeat(21),
            "flag": true,
        }));
        let mut errors = FieldErrors::default();

        assert_eq!(body.text("name", 255, true, &mut errors).as_deref(), Some("driving"));
        assert_eq!(body.text("unit", 20, true, &mut errors), None);
        assert_eq!(body.text("blank", 20, true, &mut errors), None);
        assert_eq!(body.text("nothing", 20, false, &mut errors), None);
        assert_eq!(body.text("long", 20, true, &mut errors), None);
        assert_eq!(body.text("flag", 20, true, &mut errors), None);
        assert_eq!(body.text("missing", 20, false, &mut errors), None);
        assert!(errors.get("missing").is_none());
        assert_eq!(body.text("missing", 20, true, &mut errors), None);

        assert_eq!(errors.get("unit"), Some(&[NOT_BLANK.to_string()][..]));
        assert_eq!(errors.get("blank"), Some(&[NOT_BLANK.to_string()][..]));
        assert_eq!(errors.get("nothing"), Some(&[NOT_NULL.to_string()][..]));
        assert_eq!(
            errors.get("long"),
            Some(&["Ensure this field has no more than 20 characters.".to_string()][..])
        );
        assert_eq!(errors.get("missing"), Some(&[REQUIRED.to_string()][..]));
        assert!(errors.get("flag").is_some());
    }

    #[test]
    fn test_primary_key_coercion() {
        let body = payload(json!({
            "int": 3,
            "string": "4",
            "negative": -1,
            "word": "abc",
            "float": 1.5,
        }));
        let mut errors = FieldErrors::default();

        assert_eq!(body.primary_key("int", true, &mut errors), Some(3));
        assert_eq!(body.primary_key("string", true, &mut errors), Some(4));
        assert_eq!(body.primary_key("negative", true, &mut errors), None);
        assert_eq!(body.primary_key("word", true, &mut errors), None);
        assert_eq!(body.primary_key("float", true, &mut errors), None);

        assert_eq!(
            errors.get("negative"),
            Some(&["Invalid pk \"-1\" - object does not exist.".to_string()][..])
        );
        assert_eq!(
            errors.get("word"),
            Some(&["Incorrect type. Expected pk value, received str.".to_string()][..])
        );
        assert_eq!(
            errors.get("float"),
            Some(&["Incorrect type. Expected pk value, received float.".to_string()][..])
        );
    }

    #[test]
    fn test_timestamp_field() {
        let body = payload(json!({
            "good": "2021-04-05T18:55:06.212829+02:00",
            "naive": "2021-04-05 18:55:06.212829",
            "date_only": "2021-04-05",
            "number": 12,
        }));
        let mut errors = FieldErrors::default();

        assert!(body.timestamp("good", true, Tz::UTC, &mut errors).is_some());
        let naive = body.timestamp("naive", true, Tz::UTC, &mut errors).unwrap();
        assert_eq!(naive.to_rfc3339(), "2021-04-05T18:55:06.212829+00:00");
        assert!(body.timestamp("date_only", true, Tz::UTC, &mut errors).is_none());
        assert!(body.timestamp("number", true, Tz::UTC, &mut errors).is_none());
        assert_eq!(
            errors.get("date_only"),
            Some(&[TIMESTAMP_FORMAT_ERROR.to_string()][..])
        );
        assert!(errors.get("naive").is_none());
        assert!(errors.get("number").is_some());
    }

    #[tokio::test]
    async fn test_extracts_json_and_form_bodies() {
        let json_request = axum::http::Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from(r#"{"name": "driving", "unit": "miles"}"#))
            .unwrap();
        let Payload(map) = Payload::from_request(json_request, &()).await.unwrap();
        assert_eq!(map.get("unit"), Some(&json!("miles")));

        let form_request = axum::http::Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("usage_type=3&usage_at=2021-04-05T18%3A55%3A06%2B02%3A00"))
            .unwrap();
        let Payload(map) = Payload::from_request(form_request, &()).await.unwrap();
        assert_eq!(map.get("usage_type"), Some(&json!("3")));
        assert_eq!(map.get("usage_at"), Some(&json!("2021-04-05T18:55:06+02:00")));
    }

    #[tokio::test]
    async fn test_rejects_non_object_json_and_unknown_media_types() {
        let array_request = axum::http::Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("[1, 2]"))
            .unwrap();
        assert!(matches!(
            Payload::from_request(array_request, &()).await,
            Err(ApiError::Malformed(_))
        ));

        let xml_request = axum::http::Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, "application/xml")
            .body(Body::from("<usage/>"))
            .unwrap();
        assert!(matches!(
            Payload::from_request(xml_request, &()).await,
            Err(ApiError::UnsupportedMediaType(_))
        ));
    }
}
