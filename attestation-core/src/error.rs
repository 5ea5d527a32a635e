use thiserror::Error;

pub type Result<T> = std::result::Result<T, AttestationError>;

#[derive(Error, Debug)]
pub enum AttestationError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signature recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Unsupported EIP-712 type: {0}")]
    UnsupportedType(String),

    #[error("Malformed EIP-712 value for field {field}: {reason}")]
    MalformedValue { field: String, reason: String },

    #[error("Missing EIP-712 field: {0}")]
    MissingField(String),

    #[error("Invalid attestation input: {0}")]
    InvalidInput(String),

    #[error("Token format invalid")]
    TokenFormat,

    #[error("Token MAC mismatch")]
    TokenMac,

    #[error("Token expired")]
    TokenExpired,

    #[error("Unrecognised token role: {0}")]
    TokenRole(String),

    #[error("Token secret too short: {0} bytes, need at least 32")]
    SecretTooShort(usize),
}
