//! EIP-712 signature verification with ERC-1271 fallback.

use crate::errors::{FulfillmentError, Result};
use attestation_core::{recover_address, Address, TypedData};
use chain_gateway::ChainGateway;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Outcome of a verification attempt. `recovered` is surfaced for
/// diagnostics on mismatch.
#[derive(Debug, Clone)]
pub struct Verification {
    pub valid: bool,
    pub recovered: Option<Address>,
}

/// Verifies typed-data signatures: ECDSA recovery first, then the
/// ERC-1271 contract-wallet path. Code lookups are cached per address for
/// the lifetime of the process.
pub struct SignatureVerifier {
    gateway: Arc<ChainGateway>,
    code_cache: RwLock<HashMap<Address, bool>>,
}

impl SignatureVerifier {
    pub fn new(gateway: Arc<ChainGateway>) -> Self {
        Self {
            gateway,
            code_cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn verify(
        &self,
        expected_signer: Address,
        typed_data: &TypedData,
        signature_hex: &str,
    ) -> Result<Verification> {
        let signature = decode_signature(signature_hex)?;
        let digest = typed_data
            .signing_digest()
            .map_err(|e| FulfillmentError::Validation(e.to_string()))?;

        let recovered = recover_address(&digest, &signature).ok();
        if recovered == Some(expected_signer) {
            return Ok(Verification {
                valid: true,
                recovered,
            });
        }

        if self.is_contract(expected_signer).await? {
            let accepted = self
                .gateway
                .is_valid_signature(expected_signer, digest, &signature)
                .await?;
            if accepted {
                debug!("ERC-1271 wallet {} accepted signature", expected_signer);
                return Ok(Verification {
                    valid: true,
                    recovered,
                });
            }
        }

        Ok(Verification {
            valid: false,
            recovered,
        })
    }

    /// Convenience wrapper that raises `BAD_SIGNATURE` on mismatch.
    pub async fn require_valid(
        &self,
        expected_signer: Address,
        typed_data: &TypedData,
        signature_hex: &str,
    ) -> Result<()> {
        let verification = self
            .verify(expected_signer, typed_data, signature_hex)
            .await?;
        if verification.valid {
            return Ok(());
        }
        Err(FulfillmentError::BadSignature {
            expected_signer: expected_signer.to_checksum(),
            recovered: verification.recovered.map(|a| a.to_checksum()),
        })
    }

    async fn is_contract(&self, address: Address) -> Result<bool> {
        if let Some(cached) = self.code_cache.read().await.get(&address) {
            return Ok(*cached);
        }
        let has_code = !self.gateway.get_code(address).await?.is_empty();
        self.code_cache.write().await.insert(address, has_code);
        Ok(has_code)
    }
}

pub(crate) fn decode_signature(signature_hex: &str) -> Result<Vec<u8>> {
    let stripped = signature_hex
        .trim()
        .strip_prefix("0x")
        .unwrap_or_else(|| signature_hex.trim());
    let bytes = hex::decode(stripped)
        .map_err(|e| FulfillmentError::Validation(format!("signature is not hex: {e}")))?;
    if bytes.len() != 65 {
        return Err(FulfillmentError::Validation(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}
