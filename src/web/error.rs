//! Error-to-HTTP mapping.
//!
//! Adapter errors are plain `anyhow` chains. Whenever a caller needs a
//! specific HTTP status (validation problems, missing objects), the error
//! is marked with an [`ApiError`] via [`ResultExt`]; everything unmarked
//! collapses to a 500 with the wrapped message attached.

use serde::Serialize;
use std::fmt::{Display, Formatter};
use warp::http::StatusCode;
use warp::reject::Reject;

/// An error carrying the HTTP status to report. The status itself is not
/// part of the serialized body.
#[derive(Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub message: String,
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Reject for ApiError {}

impl ApiError {
    pub fn new(status: StatusCode, message: impl ToString) -> Self {
        ApiError {
            status,
            message: message.to_string(),
        }
    }
}

/// Attaches an HTTP status to an `anyhow` error chain.
pub trait ResultExt<T> {
    fn with_status(self, status: StatusCode) -> Result<T, anyhow::Error>;

    /// Marks the error as a 400 Bad Request.
    fn mark_client_error(self) -> Result<T, anyhow::Error>;

    /// Marks the error as a 404 Not Found. Used by adapters to keep
    /// "object absent" distinguishable from a generic upstream failure.
    fn mark_not_found(self) -> Result<T, anyhow::Error>;
}

impl<T> ResultExt<T> for Result<T, anyhow::Error> {
    fn with_status(self, status: StatusCode) -> Result<T, anyhow::Error> {
        match self {
            Ok(t) => Ok(t),
            Err(err) => {
                let message = format!("{:#}", err);
                Err(err.context(ApiError { status, message }))
            }
        }
    }

    fn mark_client_error(self) -> Result<T, anyhow::Error> {
        self.with_status(StatusCode::BAD_REQUEST)
    }

    fn mark_not_found(self) -> Result<T, anyhow::Error> {
        self.with_status(StatusCode::NOT_FOUND)
    }
}

/// Early return with a 400 Bad Request error.
#[macro_export]
macro_rules! client_bail {
    ($err:expr $(,)?) => {
        return $crate::web::error::ResultExt::mark_client_error(Err(::anyhow::anyhow!($err)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return $crate::web::error::ResultExt::mark_client_error(Err(::anyhow::anyhow!($fmt, $($arg)*)))
    };
}

/// Early return with a custom HTTP status code.
#[macro_export]
macro_rules! status_bail {
    ($status:expr, $msg:literal $(,)?) => {
        return $crate::web::error::ResultExt::with_status(Err(::anyhow::anyhow!($msg)), $status)
    };
    ($status:expr, $fmt:literal, $($arg:tt)*) => {
        return $crate::web::error::ResultExt::with_status(Err(::anyhow::anyhow!($fmt, $($arg)*)), $status)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn with_status_attaches_api_error() {
        let result: Result<(), _> = Err(anyhow!("boom")).with_status(StatusCode::NOT_FOUND);
        let err = result.unwrap_err();
        let api_error = err.downcast_ref::<ApiError>().unwrap();

        assert_eq!(api_error.status, StatusCode::NOT_FOUND);
        assert_eq!(api_error.message, "boom");
    }

    #[test]
    fn mark_client_error_uses_bad_request() {
        let result: Result<(), _> = Err(anyhow!("invalid input")).mark_client_error();
        let err = result.unwrap_err();

        assert_eq!(
            err.downcast_ref::<ApiError>().unwrap().status,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn marking_preserves_context_chain() {
        let result: Result<(), _> =
            Err(anyhow!("root cause").context("while doing the thing")).mark_not_found();
        let err = result.unwrap_err();
        let api_error = err.downcast_ref::<ApiError>().unwrap();

        assert_eq!(api_error.status, StatusCode::NOT_FOUND);
        assert!(api_error.message.contains("root cause"));
        assert!(api_error.message.contains("while doing the thing"));
    }

    #[test]
    fn ok_results_pass_through_untouched() {
        let result: Result<u32, anyhow::Error> = Ok(42).mark_client_error();
        assert_eq!(result.unwrap(), 42);
    }
}
