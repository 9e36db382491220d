use crate::prelude::*;
use warp::http::StatusCode;

/// Wire-level error codes; each maps to a fixed HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidManifest,
    InvalidVersion,
    InvalidRequest,
    VersionExists,
    PackageNotFound,
    VersionNotFound,
    Unauthorized,
    Forbidden,
    RateLimited,
    ChecksumMismatch,
    InternalError,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidManifest => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidVersion => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::VersionExists => StatusCode::CONFLICT,
            ErrorCode::PackageNotFound => StatusCode::NOT_FOUND,
            ErrorCode::VersionNotFound => StatusCode::NOT_FOUND,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::ChecksumMismatch => StatusCode::BAD_REQUEST,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub error: String,
}

/// A typed API failure, rendered as the standard error envelope:
/// `{"error": {"code": ..., "message": ..., "details": [...]}}`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Vec<FieldError>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> ApiError {
        ApiError {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> ApiError {
        self.details = details;
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> ApiError {
        ApiError::new(ErrorCode::InvalidRequest, message)
    }

    pub fn invalid_manifest(message: impl Into<String>) -> ApiError {
        ApiError::new(ErrorCode::InvalidManifest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> ApiError {
        ApiError::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> ApiError {
        ApiError::new(ErrorCode::Forbidden, message)
    }

    pub fn package_not_found(name: &str) -> ApiError {
        ApiError::new(ErrorCode::PackageNotFound, format!("package '{name}' not found"))
    }

    pub fn version_not_found(name: &str, version: &str) -> ApiError {
        ApiError::new(
            ErrorCode::VersionNotFound,
            format!("version '{version}' of package '{name}' not found"),
        )
    }

    pub fn version_exists(name: &str, version: &str) -> ApiError {
        ApiError::new(
            ErrorCode::VersionExists,
            format!("version '{version}' of package '{name}' already exists"),
        )
    }

    pub fn checksum_mismatch(message: impl Into<String>) -> ApiError {
        ApiError::new(ErrorCode::ChecksumMismatch, message)
    }

    pub fn internal() -> ApiError {
        ApiError::new(ErrorCode::InternalError, "internal error")
    }
}

impl warp::reject::Reject for ApiError {}

#[derive(Serialize)]
struct Envelope<'a> {
    error: EnvelopeBody<'a>,
}

fn details_empty(details: &&[FieldError]) -> bool {
    details.is_empty()
}

#[derive(Serialize)]
struct EnvelopeBody<'a> {
    code: ErrorCode,
    message: &'a str,
    #[serde(skip_serializing_if = "details_empty")]
    details: &'a [FieldError],
}

pub fn error_reply(err: &ApiError) -> warp::reply::WithStatus<warp::reply::Json> {
    let envelope = Envelope {
        error: EnvelopeBody {
            code: err.code,
            message: &err.message,
            details: &err.details,
        },
    };
    warp::reply::with_status(warp::reply::json(&envelope), err.code.status())
}

/// Terminal rejection handler: typed errors become their envelope, warp's
/// own rejections are translated, and anything else is an opaque 500.
pub async fn handle_rejection(
    rejection: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let err = if let Some(api_error) = rejection.find::<ApiError>() {
        api_error.clone()
    } else if rejection.is_not_found() {
        ApiError::new(ErrorCode::PackageNotFound, "not found")
    } else if let Some(body_err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        ApiError::invalid_request(format!("malformed request body: {body_err}"))
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        ApiError::invalid_request("method not allowed")
    } else {
        warn!("unhandled rejection: {rejection:?}");
        ApiError::internal()
    };
    Ok(error_reply(&err))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::VersionExists.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::ChecksumMismatch.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::RateLimited.status().as_u16(), 429);
        assert_eq!(ErrorCode::InternalError.status().as_u16(), 500);
    }

    #[test]
    fn test_envelope_shape() {
        let err = ApiError::invalid_manifest("bad manifest").with_details(vec![FieldError {
            field: "name".into(),
            error: "does not match pattern".into(),
        }]);
        let body = serde_json::to_value(&Envelope {
            error: EnvelopeBody {
                code: err.code,
                message: &err.message,
                details: &err.details,
            },
        })
        .unwrap();
        assert_eq!(body["error"]["code"], "INVALID_MANIFEST");
        assert_eq!(body["error"]["details"][0]["field"], "name");
    }

    #[test]
    fn test_details_omitted_when_empty() {
        let err = ApiError::package_not_found("ghost");
        let body = serde_json::to_value(&Envelope {
            error: EnvelopeBody {
                code: err.code,
                message: &err.message,
                details: &err.details,
            },
        })
        .unwrap();
        assert!(body["error"].get("details").is_none());
    }
}
