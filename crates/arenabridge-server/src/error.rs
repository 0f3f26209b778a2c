//! Error → HTTP response mapping.

use arenabridge_core::Error;
use arenabridge_openai::ErrorBody;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// Handler error carrying the bridge error taxonomy.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NoMapping(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized => StatusCode::UNAUTHORIZED,
        Error::NotCaptured => StatusCode::REQUEST_TIMEOUT,
        Error::CoordinatorBusy(_) => StatusCode::CONFLICT,
        Error::NoWorkerAvailable | Error::WorkerBusy => StatusCode::SERVICE_UNAVAILABLE,
        Error::WorkerLost | Error::Upstream(_) | Error::Translation(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use arenabridge_core::TimeoutPhase;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::NoMapping("m".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::NoWorkerAvailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&Error::WorkerLost), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&Error::Timeout(TimeoutPhase::Idle)),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&Error::CoordinatorBusy("ID capture")), StatusCode::CONFLICT);
        assert_eq!(status_for(&Error::Cancelled), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
