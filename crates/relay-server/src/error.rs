use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::EngineError;
use serde_json::json;

/// Wraps `EngineError` so this crate can give it an `IntoResponse` impl
/// (the orphan rule blocks implementing a foreign trait on a foreign
/// type directly). Every handler returns `Result<_, ApiError>` and uses
/// `?` against fallible `relay-core`/`relay-orchestrator` calls instead
/// of mapping status codes at each call site.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::SidechannelAuth => StatusCode::UNAUTHORIZED,
            EngineError::ClientResourceLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AdmissionDenied(_) | EngineError::SubprocessFailure(_) | EngineError::MissingCollaborator(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}
