use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("RPC transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Response(String),

    #[error("Transaction {0} reverted")]
    Reverted(String),

    #[error("Timed out waiting for receipt of {0}")]
    ReceiptTimeout(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Gateway misconfigured: {0}")]
    Config(String),
}
