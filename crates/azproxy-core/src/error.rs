use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderValue};
use serde_json::json;

use crate::converter::ConvertError;
use crate::director::DirectorError;
use crate::route::RouteError;
use crate::upstream_client::{UpstreamFailure, UpstreamTransportErrorKind};

/// A response the proxy produces itself, in the OpenAI error shape.
#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ProxyError {
    fn openai(status: StatusCode, message: &str, kind: &str, code: &str) -> Self {
        let body = json!({
            "error": {
                "message": message,
                "type": kind,
                "code": code,
            }
        });
        Self {
            status,
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::openai(StatusCode::NOT_FOUND, message, "invalid_request_error", "not_found")
    }

    pub fn method_not_allowed(message: &str) -> Self {
        Self::openai(
            StatusCode::METHOD_NOT_ALLOWED,
            message,
            "invalid_request_error",
            "method_not_allowed",
        )
    }

    pub fn bad_gateway(message: &str) -> Self {
        Self::openai(StatusCode::BAD_GATEWAY, message, "upstream_error", "upstream_error")
    }

    pub fn gateway_timeout(message: &str) -> Self {
        Self::openai(StatusCode::GATEWAY_TIMEOUT, message, "upstream_error", "upstream_error")
    }
}

impl From<RouteError> for ProxyError {
    fn from(err: RouteError) -> Self {
        let message = err.to_string();
        match err {
            RouteError::NotFound(_) => Self::not_found(&message),
            RouteError::MethodNotAllowed { .. } => Self::method_not_allowed(&message),
        }
    }
}

impl From<ConvertError> for ProxyError {
    fn from(err: ConvertError) -> Self {
        let message = err.to_string();
        match err {
            ConvertError::RouteMismatch { .. } => Self::openai(
                StatusCode::NOT_FOUND,
                &message,
                "invalid_request_error",
                "route_mismatch",
            ),
            ConvertError::UnresolvedPlaceholder(_) => Self::openai(
                StatusCode::BAD_REQUEST,
                &message,
                "invalid_request_error",
                "unresolved_placeholder",
            ),
            ConvertError::UnknownModel(_) => Self::openai(
                StatusCode::NOT_FOUND,
                &message,
                "invalid_request_error",
                "model_not_found",
            ),
        }
    }
}

impl From<DirectorError> for ProxyError {
    fn from(err: DirectorError) -> Self {
        match err {
            DirectorError::Convert(err) => err.into(),
            DirectorError::MissingCredential | DirectorError::InvalidCredential => Self::openai(
                StatusCode::UNAUTHORIZED,
                &err.to_string(),
                "invalid_request_error",
                "missing_api_key",
            ),
            DirectorError::Query(_) => Self::openai(
                StatusCode::BAD_REQUEST,
                &err.to_string(),
                "invalid_request_error",
                "invalid_query",
            ),
        }
    }
}

impl From<UpstreamFailure> for ProxyError {
    fn from(err: UpstreamFailure) -> Self {
        match err.kind {
            UpstreamTransportErrorKind::Timeout => Self::gateway_timeout("upstream timed out"),
            _ => Self::bad_gateway("upstream unavailable"),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut resp = Response::new(Body::from(self.body));
        *resp.status_mut() = self.status;
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    }
}
