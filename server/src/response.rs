use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tablesnap_core::Error;
use tracing::{error, warn};

/// Body of every JSON response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            result: None,
            message: None,
        }
    }

    pub fn with_result<T: Serialize>(result: T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(result).map_err(Error::from)?;
        Ok(Self {
            success: true,
            result: Some(value),
            message: None,
        })
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            result: None,
            message: Some(message.into()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            message: Some(message.into()),
        }
    }
}

/// Handler failure rendered as a `success: false` envelope.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            Error::LockContention { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            warn!(error = %self.0, "Request rejected");
        } else {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(ApiResponse::failure(self.0.to_string()))).into_response()
    }
}

pub type ApiResult = Result<Json<ApiResponse>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let busy = ApiError(Error::LockContention {
            operation: "upload".to_string(),
        });
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);
        let invalid = ApiError(Error::Validation("bad".to_string()));
        assert_eq!(invalid.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError(Error::not_found("k")).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_envelope_omits_empty_fields() {
        assert_eq!(serde_json::to_string(&ApiResponse::ok()).unwrap(), r#"{"success":true}"#);
        assert_eq!(
            serde_json::to_string(&ApiResponse::failure("boom")).unwrap(),
            r#"{"success":false,"message":"boom"}"#
        );
        let listed = ApiResponse::with_result(vec!["a", "b"]).unwrap();
        assert_eq!(
            serde_json::to_string(&listed).unwrap(),
            r#"{"success":true,"result":["a","b"]}"#
        );
    }
}
