//! Request-level error taxonomy.
//!
//! Every failure surfaced to the transport boundary carries a stable
//! discriminator name and an HTTP status code equivalent; the boundary
//! layer maps these onto its own response envelope. Unexpected errors pass
//! through as `Internal` and are logged server-side, never silently
//! swallowed.

use thiserror::Error;

/// Errors produced by the ingestion orchestrator.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Device enforces an access token and the supplied one did not match.
    #[error("Device access token not valid!")]
    Unauthorized,

    /// Unknown device, or sensor not present on the device.
    #[error("{0}")]
    NotFound(String),

    /// Payload decoded but failed validation, or could not be decoded at
    /// all.
    #[error("{0}")]
    UnprocessableEntity(String),

    /// No decoder exists for the request's content type.
    #[error("No decoder found for content-type '{0}'")]
    UnsupportedMediaType(String),

    /// Anything unexpected: storage failures, bugs. Rethrown unchanged.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IngestError {
    /// Stable discriminator used by the boundary layer.
    pub fn name(&self) -> &'static str {
        match self {
            IngestError::Unauthorized => "UnauthorizedError",
            IngestError::NotFound(_) => "NotFoundError",
            IngestError::UnprocessableEntity(_) => "UnprocessableEntityError",
            IngestError::UnsupportedMediaType(_) => "UnsupportedMediaTypeError",
            IngestError::Internal(_) => "InternalServerError",
        }
    }

    /// HTTP status code equivalent for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            IngestError::Unauthorized => 401,
            IngestError::NotFound(_) => 404,
            IngestError::UnprocessableEntity(_) => 422,
            IngestError::UnsupportedMediaType(_) => 415,
            IngestError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(IngestError::Unauthorized.status_code(), 401);
        assert_eq!(IngestError::NotFound("x".into()).status_code(), 404);
        assert_eq!(IngestError::UnprocessableEntity("x".into()).status_code(), 422);
        assert_eq!(IngestError::UnsupportedMediaType("x".into()).status_code(), 415);
        assert_eq!(
            IngestError::Internal(anyhow::anyhow!("boom")).status_code(),
            500
        );
    }

    #[test]
    fn test_names_are_stable() {
        assert_eq!(IngestError::Unauthorized.name(), "UnauthorizedError");
        assert_eq!(IngestError::NotFound("x".into()).name(), "NotFoundError");
        assert_eq!(
            IngestError::UnprocessableEntity("x".into()).name(),
            "UnprocessableEntityError"
        );
    }

    #[test]
    fn test_unauthorized_message() {
        assert_eq!(
            IngestError::Unauthorized.to_string(),
            "Device access token not valid!"
        );
    }
}
