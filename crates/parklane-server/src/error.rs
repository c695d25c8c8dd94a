//! HTTP error mapping.
//!
//! Every error variant produces a JSON body with a machine-readable
//! `error` code and a human-readable `message`. Messages never leak
//! identifiers from other tenants; cross-tenant lookups surface as plain
//! `not_found`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use parklane_core::error::{AuthError, SignatureError, SpoolError};
use parklane_coord::CoordError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Credentials missing or invalid.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Credential valid but lacks scope or role.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource absent within the requester's tenant scope.
    #[error("not found: {0}")]
    NotFound(String),

    /// Overlap, replay, or unique violation.
    #[error("conflict ({code}): {message}")]
    Conflict { code: &'static str, message: String },

    /// Malformed payload or invalid field values.
    #[error("validation: {0}")]
    Validation(String),

    /// Token bucket exhausted; retry after the hinted seconds.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// A dependency is down and the request could not be deferred.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unexpected failure; details stay in the logs.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, "unauthenticated", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::Conflict { code, message } => (StatusCode::CONFLICT, code, message),
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, "validation", msg),
            Self::RateLimited { retry_after_secs } => {
                let body = ErrorBody {
                    error: "rate_limited",
                    message: format!("rate limited, retry after {retry_after_secs}s"),
                };
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after_secs.to_string())],
                    axum::Json(body),
                )
                    .into_response();
            }
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("resource not found".to_owned()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // Unique violation.
                Some("23505") => Self::Conflict {
                    code: "duplicate",
                    message: "resource already exists".to_owned(),
                },
                // Exclusion violation — only reservations carry one.
                Some("23P01") => Self::Conflict {
                    code: "reservation-overlap",
                    message: "reservation overlaps an existing booking".to_owned(),
                },
                _ => Self::Internal(format!("database error: {db_err}")),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                Self::Unavailable("database unavailable".to_owned())
            }
            _ => Self::Internal(format!("database error: {err}")),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated(msg) => Self::Unauthenticated(msg),
            AuthError::TokenExpired => Self::Unauthenticated("access token expired".to_owned()),
            AuthError::Forbidden(msg) => Self::Forbidden(msg),
            AuthError::Hashing(msg) | AuthError::TokenCodec(msg) => Self::Internal(msg),
        }
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::MissingHeader(_)
            | SignatureError::MalformedTimestamp(_)
            | SignatureError::MalformedSignature => Self::Validation(err.to_string()),
            SignatureError::SkewExceeded { .. } | SignatureError::Mismatch => {
                Self::Unauthenticated(err.to_string())
            }
        }
    }
}

impl From<CoordError> for ApiError {
    fn from(err: CoordError) -> Self {
        match err {
            CoordError::Unavailable(msg) => Self::Unavailable(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<SpoolError> for ApiError {
    fn from(err: SpoolError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn statuses_match_kinds() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (
                ApiError::Unauthenticated("x".to_owned()),
                StatusCode::UNAUTHORIZED,
            ),
            (ApiError::Forbidden("x".to_owned()), StatusCode::FORBIDDEN),
            (ApiError::NotFound("x".to_owned()), StatusCode::NOT_FOUND),
            (
                ApiError::Conflict {
                    code: "nonce-replay",
                    message: "x".to_owned(),
                },
                StatusCode::CONFLICT,
            ),
            (ApiError::Validation("x".to_owned()), StatusCode::BAD_REQUEST),
            (
                ApiError::RateLimited {
                    retry_after_secs: 3,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ApiError::Unavailable("x".to_owned()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::Internal("x".to_owned()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn rate_limited_carries_retry_after_header() {
        let response = ApiError::RateLimited {
            retry_after_secs: 7,
        }
        .into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &"7".parse::<axum::http::HeaderValue>().unwrap()
        );
    }
}
