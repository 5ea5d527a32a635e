//! EIP-712 typed-data hashing.
//!
//! The encoder is deliberately small: it supports the flat struct types the
//! protocol uses (`bytes32`, `uint256`, `uint64`, `address`, `string`,
//! `bytes`) and coerces integer values from either native JSON numbers or
//! decimal/hex strings, so a wire message (stringified big integers) and a
//! verify message (native integers) hash to the same digest.

use crate::address::Address;
use crate::error::{AttestationError, Result};
use crate::keccak::{keccak256, keccak256_concat};
use primitive_types::U256;
use serde_json::Value;

const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

/// EIP-712 domain binding a message to a chain and verifying contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip712Domain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl Eip712Domain {
    pub fn separator(&self) -> [u8; 32] {
        let type_hash = keccak256(DOMAIN_TYPE.as_bytes());
        let name_hash = keccak256(self.name.as_bytes());
        let version_hash = keccak256(self.version.as_bytes());
        let chain_id = u256_word(U256::from(self.chain_id));
        let contract = address_word(&self.verifying_contract);
        keccak256_concat(&[&type_hash, &name_hash, &version_hash, &chain_id, &contract])
    }
}

/// One `name: type` member of a struct type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub type_name: String,
}

impl FieldDef {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
        }
    }
}

/// A typed-data message plus the schema needed to hash it.
#[derive(Debug, Clone)]
pub struct TypedData {
    pub domain: Eip712Domain,
    pub primary_type: String,
    pub fields: Vec<FieldDef>,
    pub message: Value,
}

impl TypedData {
    /// Canonical `Primary(type1 name1,type2 name2,...)` encoding.
    pub fn encode_type(&self) -> String {
        let members: Vec<String> = self
            .fields
            .iter()
            .map(|f| format!("{} {}", f.type_name, f.name))
            .collect();
        format!("{}({})", self.primary_type, members.join(","))
    }

    /// `hashStruct(message)` per EIP-712.
    pub fn struct_hash(&self) -> Result<[u8; 32]> {
        let mut encoded = Vec::with_capacity(32 * (self.fields.len() + 1));
        encoded.extend_from_slice(&keccak256(self.encode_type().as_bytes()));
        for field in &self.fields {
            let value = self
                .message
                .get(&field.name)
                .ok_or_else(|| AttestationError::MissingField(field.name.clone()))?;
            encoded.extend_from_slice(&encode_value(&field.type_name, &field.name, value)?);
        }
        Ok(keccak256(&encoded))
    }

    /// `keccak256(0x1901 ‖ domainSeparator ‖ hashStruct(message))`.
    pub fn signing_digest(&self) -> Result<[u8; 32]> {
        let separator = self.domain.separator();
        let struct_hash = self.struct_hash()?;
        Ok(keccak256_concat(&[&[0x19, 0x01], &separator, &struct_hash]))
    }

    /// The JSON shape wallets expect (`eth_signTypedData_v4`).
    pub fn to_wire_json(&self) -> Value {
        let field_json = |fields: &[(&str, &str)]| -> Value {
            Value::Array(
                fields
                    .iter()
                    .map(|(name, ty)| {
                        serde_json::json!({ "name": name, "type": ty })
                    })
                    .collect(),
            )
        };
        let domain_fields = [
            ("name", "string"),
            ("version", "string"),
            ("chainId", "uint256"),
            ("verifyingContract", "address"),
        ];
        let primary_fields: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.type_name.as_str()))
            .collect();
        let mut types = serde_json::Map::new();
        types.insert("EIP712Domain".to_string(), field_json(&domain_fields));
        types.insert(self.primary_type.clone(), field_json(&primary_fields));
        serde_json::json!({
            "types": types,
            "primaryType": self.primary_type,
            "domain": {
                "name": self.domain.name,
                "version": self.domain.version,
                "chainId": self.domain.chain_id,
                "verifyingContract": self.domain.verifying_contract.to_checksum(),
            },
            "message": self.message,
        })
    }
}

/// Parse a uint value from a JSON number, decimal string, or `0x` hex string.
pub fn parse_uint(value: &Value, field: &str) -> Result<U256> {
    let malformed = |reason: &str| AttestationError::MalformedValue {
        field: field.to_string(),
        reason: reason.to_string(),
    };
    match value {
        Value::Number(n) => {
            let as_u64 = n.as_u64().ok_or_else(|| malformed("not an unsigned integer"))?;
            Ok(U256::from(as_u64))
        }
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex_part) = s.strip_prefix("0x") {
                U256::from_str_radix(hex_part, 16).map_err(|_| malformed("bad hex integer"))
            } else {
                U256::from_dec_str(s).map_err(|_| malformed("bad decimal integer"))
            }
        }
        _ => Err(malformed("expected number or string")),
    }
}

fn parse_bytes(value: &Value, field: &str) -> Result<Vec<u8>> {
    let raw = value.as_str().ok_or_else(|| AttestationError::MalformedValue {
        field: field.to_string(),
        reason: "expected hex string".to_string(),
    })?;
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(stripped).map_err(|e| AttestationError::MalformedValue {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

fn encode_value(type_name: &str, field: &str, value: &Value) -> Result<[u8; 32]> {
    match type_name {
        "uint256" | "uint64" => {
            let parsed = parse_uint(value, field)?;
            if type_name == "uint64" && parsed > U256::from(u64::MAX) {
                return Err(AttestationError::MalformedValue {
                    field: field.to_string(),
                    reason: "uint64 overflow".to_string(),
                });
            }
            Ok(u256_word(parsed))
        }
        "bytes32" => {
            let bytes = parse_bytes(value, field)?;
            if bytes.len() != 32 {
                return Err(AttestationError::MalformedValue {
                    field: field.to_string(),
                    reason: format!("expected 32 bytes, got {}", bytes.len()),
                });
            }
            let mut word = [0u8; 32];
            word.copy_from_slice(&bytes);
            Ok(word)
        }
        "address" => {
            let raw = value.as_str().ok_or_else(|| AttestationError::MalformedValue {
                field: field.to_string(),
                reason: "expected address string".to_string(),
            })?;
            let address: Address = raw
                .parse()
                .map_err(|e: AttestationError| AttestationError::MalformedValue {
                    field: field.to_string(),
                    reason: e.to_string(),
                })?;
            Ok(address_word(&address))
        }
        "string" => {
            let raw = value.as_str().ok_or_else(|| AttestationError::MalformedValue {
                field: field.to_string(),
                reason: "expected string".to_string(),
            })?;
            Ok(keccak256(raw.as_bytes()))
        }
        "bytes" => Ok(keccak256(&parse_bytes(value, field)?)),
        other => Err(AttestationError::UnsupportedType(other.to_string())),
    }
}

pub(crate) fn u256_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

pub(crate) fn address_word(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_domain() -> Eip712Domain {
        Eip712Domain {
            name: "PODxShipment".to_string(),
            version: "1".to_string(),
            chain_id: 11155111,
            verifying_contract: "0x0000000000000000000000000000000000001234".parse().unwrap(),
        }
    }

    fn typed(message: Value) -> TypedData {
        TypedData {
            domain: test_domain(),
            primary_type: "PickupApproval".to_string(),
            fields: vec![
                FieldDef::new("shipmentId", "bytes32"),
                FieldDef::new("orderId", "uint256"),
                FieldDef::new("locationHash", "bytes32"),
                FieldDef::new("claimedTs", "uint64"),
            ],
            message,
        }
    }

    #[test]
    fn test_encode_type() {
        let td = typed(Value::Null);
        assert_eq!(
            td.encode_type(),
            "PickupApproval(bytes32 shipmentId,uint256 orderId,bytes32 locationHash,uint64 claimedTs)"
        );
    }

    #[test]
    fn test_domain_separator_is_stable() {
        let a = test_domain().separator();
        let b = test_domain().separator();
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 32]);
    }

    #[test]
    fn test_string_and_number_forms_hash_identically() {
        let shipment = format!("0x{}", hex::encode([1u8; 32]));
        let location = format!("0x{}", hex::encode([2u8; 32]));
        let wire = typed(serde_json::json!({
            "shipmentId": shipment,
            "orderId": "1700000000000",
            "locationHash": location,
            "claimedTs": "1700000100",
        }));
        let native = typed(serde_json::json!({
            "shipmentId": shipment,
            "orderId": 1_700_000_000_000u64,
            "locationHash": location,
            "claimedTs": 1_700_000_100u64,
        }));
        assert_eq!(
            wire.signing_digest().unwrap(),
            native.signing_digest().unwrap()
        );
    }

    #[test]
    fn test_hex_order_id_matches_decimal() {
        let shipment = format!("0x{}", hex::encode([1u8; 32]));
        let location = format!("0x{}", hex::encode([2u8; 32]));
        let decimal = typed(serde_json::json!({
            "shipmentId": shipment,
            "orderId": "255",
            "locationHash": location,
            "claimedTs": 1u64,
        }));
        let hexed = typed(serde_json::json!({
            "shipmentId": shipment,
            "orderId": "0xff",
            "locationHash": location,
            "claimedTs": 1u64,
        }));
        assert_eq!(
            decimal.signing_digest().unwrap(),
            hexed.signing_digest().unwrap()
        );
    }

    #[test]
    fn test_missing_field_rejected() {
        let td = typed(serde_json::json!({ "orderId": 1 }));
        assert!(matches!(
            td.struct_hash(),
            Err(AttestationError::MissingField(_))
        ));
    }

    #[test]
    fn test_uint64_overflow_rejected() {
        let shipment = format!("0x{}", hex::encode([1u8; 32]));
        let td = typed(serde_json::json!({
            "shipmentId": shipment,
            "orderId": 1,
            "locationHash": shipment,
            "claimedTs": "18446744073709551616",
        }));
        assert!(td.struct_hash().is_err());
    }

    #[test]
    fn test_wire_json_shape() {
        let shipment = format!("0x{}", hex::encode([1u8; 32]));
        let td = typed(serde_json::json!({
            "shipmentId": shipment,
            "orderId": "1",
            "locationHash": shipment,
            "claimedTs": 1u64,
        }));
        let wire = td.to_wire_json();
        assert_eq!(wire["primaryType"], "PickupApproval");
        assert_eq!(wire["domain"]["name"], "PODxShipment");
        assert_eq!(wire["types"]["PickupApproval"][3]["type"], "uint64");
    }
}
