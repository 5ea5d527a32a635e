//! The delivery-oracle signer.
//!
//! Holds the single process-wide secp256k1 key authorised on the order
//! registry and signs EIP-155 legacy transactions for it.

use crate::error::{GatewayError, Result};
use attestation_core::{keccak256, signature::address_of, Address};
use k256::ecdsa::SigningKey;
use primitive_types::U256;
use rlp::RlpStream;
use zeroize::Zeroize;

/// An unsigned legacy (pre-EIP-1559) transaction.
#[derive(Debug, Clone)]
pub struct LegacyTransaction {
    pub nonce: U256,
    pub gas_price: U256,
    pub gas: U256,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

impl LegacyTransaction {
    /// EIP-155 signing hash: keccak of the RLP list with
    /// `(chain_id, 0, 0)` in the signature slots.
    pub fn sighash(&self, chain_id: u64) -> [u8; 32] {
        let mut stream = RlpStream::new_list(9);
        self.append_common(&mut stream);
        stream.append(&chain_id);
        stream.append(&0u8);
        stream.append(&0u8);
        keccak256(&stream.out())
    }

    fn append_common(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas);
        stream.append(&self.to.as_bytes().to_vec());
        stream.append(&self.value);
        stream.append(&self.data);
    }

    fn encode_signed(&self, v: u64, r: U256, s: U256) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_common(&mut stream);
        stream.append(&v);
        stream.append(&r);
        stream.append(&s);
        stream.out().to_vec()
    }
}

/// Process-wide oracle signing handle. Created once at startup; the key
/// bytes are zeroized when the handle is dropped.
pub struct OracleSigner {
    key: SigningKey,
    address: Address,
    chain_id: u64,
}

impl OracleSigner {
    pub fn from_hex(private_key: &str, chain_id: u64) -> Result<Self> {
        let stripped = private_key.strip_prefix("0x").unwrap_or(private_key);
        let mut raw = hex::decode(stripped)
            .map_err(|e| GatewayError::Signer(format!("bad private key hex: {e}")))?;
        if raw.len() != 32 {
            raw.zeroize();
            return Err(GatewayError::Signer(format!(
                "private key must be 32 bytes, got {}",
                raw.len()
            )));
        }
        let key = SigningKey::from_slice(&raw)
            .map_err(|e| GatewayError::Signer(format!("invalid private key: {e}")))?;
        raw.zeroize();
        let address = address_of(key.verifying_key());
        Ok(Self {
            key,
            address,
            chain_id,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sign a transaction, returning the raw RLP ready for
    /// `eth_sendRawTransaction`.
    pub fn sign_transaction(&self, tx: &LegacyTransaction) -> Result<Vec<u8>> {
        let sighash = tx.sighash(self.chain_id);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&sighash)
            .map_err(|e| GatewayError::Signer(e.to_string()))?;
        let bytes = signature.to_bytes();
        let r = U256::from_big_endian(&bytes[..32]);
        let s = U256::from_big_endian(&bytes[32..]);
        let v = self.chain_id * 2 + 35 + u64::from(recovery_id.to_byte());
        Ok(tx.encode_signed(v, r, s))
    }
}

impl Drop for OracleSigner {
    fn drop(&mut self) {
        let mut bytes: [u8; 32] = self.key.to_bytes().into();
        bytes.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The worked example from the EIP-155 specification.
    fn example_tx() -> LegacyTransaction {
        LegacyTransaction {
            nonce: U256::from(9),
            gas_price: U256::from(20_000_000_000u64),
            gas: U256::from(21_000),
            to: "0x3535353535353535353535353535353535353535".parse().unwrap(),
            value: U256::from(1_000_000_000_000_000_000u64),
            data: vec![],
        }
    }

    #[test]
    fn test_eip155_sighash_vector() {
        let sighash = example_tx().sighash(1);
        assert_eq!(
            hex::encode(sighash),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_eip155_signature_vector() {
        let signer = OracleSigner::from_hex(
            "0x4646464646464646464646464646464646464646464646464646464646464646",
            1,
        )
        .unwrap();
        assert_eq!(
            signer.address().to_checksum(),
            "0x9d8A62f656a8d1615C1294fd71e9CFb3E4855A4F"
        );

        let raw = signer.sign_transaction(&example_tx()).unwrap();
        assert_eq!(
            hex::encode(raw),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0\
             b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e159062\
             0aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(OracleSigner::from_hex("0xabcd", 1).is_err());
    }

    #[test]
    fn test_v_encodes_chain_id() {
        let signer = OracleSigner::from_hex(
            "4646464646464646464646464646464646464646464646464646464646464646",
            11155111,
        )
        .unwrap();
        let raw = signer.sign_transaction(&example_tx()).unwrap();
        let decoded = rlp::Rlp::new(&raw);
        let v: u64 = decoded.val_at(6).unwrap();
        assert!(v == 11155111 * 2 + 35 || v == 11155111 * 2 + 36);
    }
}
