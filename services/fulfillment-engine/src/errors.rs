use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FulfillmentError>;

#[derive(Error, Debug)]
pub enum FulfillmentError {
    #[error("Missing capability token")]
    TokenMissing,

    #[error("Capability token rejected")]
    TokenInvalid,

    #[error("Signing link expired")]
    LinkExpired,

    #[error("Signing link already used")]
    LinkUsed,

    #[error("Signing session not found")]
    SessionGone,

    #[error("Token role does not match session")]
    RoleMismatch,

    #[error("Active session already exists for this shipment milestone")]
    SessionConflict,

    #[error("Location outside geofence: {distance_m} m > {radius_m} m")]
    RadiusExceeded { distance_m: u64, radius_m: u64 },

    #[error("Signature does not match expected signer {expected_signer}")]
    BadSignature {
        expected_signer: String,
        recovered: Option<String>,
    },

    #[error("Claimed distance {claimed} m deviates from planned {planned} m")]
    BadDistance { claimed: u64, planned: u64 },

    #[error("Shipment state rejects this transition: {0}")]
    ShipmentState(String),

    #[error("Shipment not found: {0}")]
    ShipmentNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Chain call failed: {0}")]
    ChainFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FulfillmentError {
    /// Opaque client-facing kind per the protocol error table.
    pub fn kind(&self) -> &'static str {
        match self {
            FulfillmentError::TokenMissing => "TOKEN_MISSING",
            FulfillmentError::TokenInvalid => "TOKEN_INVALID",
            FulfillmentError::LinkExpired => "LINK_EXPIRED",
            FulfillmentError::LinkUsed => "LINK_USED",
            FulfillmentError::SessionGone => "SESSION_GONE",
            FulfillmentError::RoleMismatch => "ROLE_MISMATCH",
            FulfillmentError::SessionConflict => "SESSION_CONFLICT",
            FulfillmentError::RadiusExceeded { .. } => "RADIUS_EXCEEDED",
            FulfillmentError::BadSignature { .. } => "BAD_SIGNATURE",
            FulfillmentError::BadDistance { .. } => "BAD_DISTANCE",
            FulfillmentError::ShipmentState(_) | FulfillmentError::ShipmentNotFound(_) => {
                "SHIPMENT_STATE"
            }
            FulfillmentError::OrderNotFound(_) => "SHIPMENT_STATE",
            FulfillmentError::ChainFailed(_) => "CHAIN_FAILED",
            FulfillmentError::Database(_) => "INTERNAL",
            FulfillmentError::Validation(_) => "VALIDATION",
            FulfillmentError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<chain_gateway::GatewayError> for FulfillmentError {
    fn from(error: chain_gateway::GatewayError) -> Self {
        FulfillmentError::ChainFailed(error.to_string())
    }
}

impl ResponseError for FulfillmentError {
    fn status_code(&self) -> StatusCode {
        match self {
            FulfillmentError::TokenMissing => StatusCode::BAD_REQUEST,
            FulfillmentError::TokenInvalid => StatusCode::FORBIDDEN,
            FulfillmentError::LinkExpired => StatusCode::FORBIDDEN,
            FulfillmentError::LinkUsed => StatusCode::CONFLICT,
            FulfillmentError::SessionGone => StatusCode::NOT_FOUND,
            FulfillmentError::RoleMismatch => StatusCode::FORBIDDEN,
            FulfillmentError::SessionConflict => StatusCode::CONFLICT,
            FulfillmentError::RadiusExceeded { .. } => StatusCode::FORBIDDEN,
            FulfillmentError::BadSignature { .. } => StatusCode::BAD_REQUEST,
            FulfillmentError::BadDistance { .. } => StatusCode::BAD_REQUEST,
            FulfillmentError::ShipmentState(_) => StatusCode::CONFLICT,
            FulfillmentError::ShipmentNotFound(_) | FulfillmentError::OrderNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            FulfillmentError::ChainFailed(_) => StatusCode::BAD_GATEWAY,
            FulfillmentError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FulfillmentError::Validation(_) => StatusCode::BAD_REQUEST,
            FulfillmentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        // Internal failure details stay in the logs; clients get the kind.
        let message = match self {
            FulfillmentError::Database(_) | FulfillmentError::Internal(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let mut body = json!({
            "error": self.kind(),
            "message": message,
        });
        if let FulfillmentError::BadSignature {
            expected_signer,
            recovered,
        } = self
        {
            body["expectedSigner"] = json!(expected_signer);
            if let Some(recovered) = recovered {
                body["recovered"] = json!(recovered);
            }
        }
        HttpResponse::build(status).json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_protocol_table() {
        assert_eq!(FulfillmentError::TokenMissing.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(FulfillmentError::TokenInvalid.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(FulfillmentError::LinkExpired.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(FulfillmentError::LinkUsed.status_code(), StatusCode::CONFLICT);
        assert_eq!(FulfillmentError::SessionGone.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            FulfillmentError::RadiusExceeded { distance_m: 3500, radius_m: 2000 }.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            FulfillmentError::ChainFailed("revert".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_bad_signature_carries_diagnostics() {
        let err = FulfillmentError::BadSignature {
            expected_signer: "0xCafe".into(),
            recovered: Some("0xDead".into()),
        };
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_internal_messages_are_opaque() {
        let err = FulfillmentError::Internal("secret detail".into());
        let response = err.error_response();
        let bytes = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains("secret detail"));
        assert!(text.contains("INTERNAL"));
    }

    #[tokio::test]
    async fn test_signature_diagnostics_only_on_bad_signature() {
        let err = FulfillmentError::RadiusExceeded {
            distance_m: 3_500,
            radius_m: 2_000,
        };
        let response = err.error_response();
        let bytes = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("RADIUS_EXCEEDED"));
        assert!(!text.contains("expectedSigner"));
    }
}
