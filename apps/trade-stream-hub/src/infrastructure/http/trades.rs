//! Historical range query.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Map, Value, json};

use super::ApiState;
use crate::domain::trade::TimeRange;
use crate::infrastructure::metrics::{self, Outcome};

/// Maximum number of trades returned by one range query.
pub const RANGE_QUERY_LIMIT: usize = 1000;

/// A single problem with a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Offending field, or `body` for the document as a whole.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Rejected range request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeRequestError {
    /// Empty body or JSON `null`.
    #[error("no body sent")]
    NoBody,

    /// The body is not `{from: number, to: number}`.
    #[error("validation failed ({} issues)", .0.len())]
    Validation(Vec<ValidationIssue>),
}

impl IntoResponse for RangeRequestError {
    fn into_response(self) -> Response {
        let body = match self {
            Self::NoBody => json!({ "error": "No body sent" }),
            Self::Validation(issues) => json!({
                "error": "validation failed",
                "issues": issues,
            }),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

/// Parse a `{from, to}` body into a [`TimeRange`].
///
/// Fractional bounds are floored to whole milliseconds.
///
/// # Errors
///
/// Returns [`RangeRequestError::NoBody`] for an empty or `null` body and
/// [`RangeRequestError::Validation`] for anything else that is not an object
/// with numeric `from` and `to`.
pub fn parse_range_request(body: &[u8]) -> Result<TimeRange, RangeRequestError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(RangeRequestError::NoBody);
    }

    let value: Value = serde_json::from_slice(body).map_err(|e| {
        RangeRequestError::Validation(vec![ValidationIssue::new(
            "body",
            format!("invalid JSON: {e}"),
        )])
    })?;

    let object = match value {
        Value::Null => return Err(RangeRequestError::NoBody),
        Value::Object(object) => object,
        other => {
            return Err(RangeRequestError::Validation(vec![ValidationIssue::new(
                "body",
                format!("expected object, received {}", type_name(&other)),
            )]));
        }
    };

    let from = millis_field(&object, "from");
    let to = millis_field(&object, "to");

    match (from, to) {
        (Ok(from), Ok(to)) => Ok(TimeRange::new(from, to)),
        (from, to) => Err(RangeRequestError::Validation(
            [from.err(), to.err()].into_iter().flatten().collect(),
        )),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn millis_field(object: &Map<String, Value>, field: &str) -> Result<i64, ValidationIssue> {
    let value = object
        .get(field)
        .ok_or_else(|| ValidationIssue::new(field, "required"))?;

    let Value::Number(number) = value else {
        return Err(ValidationIssue::new(
            field,
            format!("expected number, received {}", type_name(value)),
        ));
    };

    if let Some(millis) = number.as_i64() {
        return Ok(millis);
    }

    let float = number.as_f64().map(f64::floor).unwrap_or(f64::NAN);
    if float.is_finite() && float >= i64::MIN as f64 && float < i64::MAX as f64 {
        Ok(float as i64)
    } else {
        Err(ValidationIssue::new(field, "number out of range"))
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `POST /api/trades`
pub(super) async fn range_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    let range = match parse_range_request(&body) {
        Ok(range) => range,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected range query");
            return e.into_response();
        }
    };

    match state.store.find_in_range(range, RANGE_QUERY_LIMIT).await {
        Ok(trades) => {
            metrics::record_range_query(Outcome::Success);
            tracing::debug!(
                from = range.from,
                to = range.to,
                returned = trades.len(),
                "Range query served"
            );
            (StatusCode::OK, Json(trades)).into_response()
        }
        Err(e) => {
            metrics::record_range_query(Outcome::Failure);
            tracing::error!(error = %e, from = range.from, to = range.to, "Range query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to query trades" })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
