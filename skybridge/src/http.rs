use core::fmt;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// Error response of the ActivityPub surface.
///
/// Remote servers only ever see the status code and a short static message;
/// the underlying cause is logged when the response is rendered and goes no
/// further.
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
    source: Option<anyhow::Error>,
}

impl ApiError {
    pub fn not_found(message: &'static str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
            source: None,
        }
    }

    pub fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
            source: None,
        }
    }

    /// Wraps an unexpected failure. Usable directly as a `map_err` argument.
    pub fn internal<E: Into<anyhow::Error>>(source: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error",
            source: Some(source.into()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)?;

        if let Some(source) = &self.source {
            write!(f, " ({source:#})")?;
        }

        Ok(())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.source {
            Some(source) => {
                warn!(status = %self.status, error = format!("{source:#}"), "Request failed");
            }
            None => {
                debug!(status = %self.status, message = self.message, "Request rejected");
            }
        }

        (self.status, self.message).into_response()
    }
}

/// JSON response carrying the `application/activity+json` content type
/// expected by ActivityPub consumers.
pub struct ActivityJson<T>(pub T);

impl<T: Serialize> IntoResponse for ActivityJson<T> {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => ([(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)], body).into_response(),
            Err(error) => ApiError::internal(error).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_the_cause_chain() {
        let plain = ApiError::not_found("no such record");
        assert_eq!(plain.to_string(), "404 Not Found: no such record");

        let wrapped = ApiError::internal(anyhow::anyhow!("inner failure").context("outer step"));
        let rendered = wrapped.to_string();
        assert!(rendered.starts_with("500 Internal Server Error: internal error"));
        assert!(rendered.contains("outer step"));
        assert!(rendered.contains("inner failure"));
    }
}
