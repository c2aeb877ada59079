use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The origin could not be reached or answered with a server error.
    #[error("origin unavailable: {source:#}")]
    OriginUnavailable {
        status: Option<StatusCode>,
        source: anyhow::Error,
    },

    /// One part of a multipart mirror failed; the whole session is aborted.
    #[error("transfer of part {part_number} failed: {source:#}")]
    PartTransferFailed {
        part_number: u32,
        source: anyhow::Error,
    },

    /// A write to or abort on the primary store failed.
    #[error("primary store write for {key} failed: {source:#}")]
    StoreWriteFailed { key: String, source: anyhow::Error },

    #[error("malformed range header: {header}")]
    MalformedRange { header: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn origin(source: anyhow::Error) -> Self {
        GatewayError::OriginUnavailable {
            status: None,
            source,
        }
    }

    pub fn store_write(key: &str, source: anyhow::Error) -> Self {
        GatewayError::StoreWriteFailed {
            key: key.to_string(),
            source,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::OriginUnavailable {
                status: Some(status),
                ..
            } => *status,
            GatewayError::OriginUnavailable { status: None, .. } => StatusCode::BAD_GATEWAY,
            GatewayError::MalformedRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::PartTransferFailed { .. }
            | GatewayError::StoreWriteFailed { .. }
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        error!("gateway error: {} - {}", status, self);
        let mut response = (status, status.canonical_reason().unwrap_or_default()).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
