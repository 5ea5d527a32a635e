//! Deterministic typed-data construction for pickup and drop attestations.

use crate::address::Address;
use crate::eip712::{u256_word, Eip712Domain, FieldDef, TypedData};
use crate::error::{AttestationError, Result};
use crate::keccak::{keccak256, keccak256_concat};
use primitive_types::U256;
use serde_json::Value;

/// Domain name pinned by the shipment registry contract.
pub const DOMAIN_NAME: &str = "PODxShipment";
/// Domain version pinned by the shipment registry contract.
pub const DOMAIN_VERSION: &str = "1";

/// Fixed-point scale for geolocation coordinates (micro-degrees).
const COORD_SCALE: f64 = 1_000_000.0;

/// The two courier milestones that advance a shipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilestoneKind {
    Pickup,
    Drop,
}

impl MilestoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneKind::Pickup => "pickup",
            MilestoneKind::Drop => "drop",
        }
    }

    pub fn primary_type(&self) -> &'static str {
        match self {
            MilestoneKind::Pickup => "PickupApproval",
            MilestoneKind::Drop => "DropApproval",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pickup" => Ok(MilestoneKind::Pickup),
            "drop" => Ok(MilestoneKind::Drop),
            other => Err(AttestationError::InvalidInput(format!(
                "unknown milestone kind {other}"
            ))),
        }
    }
}

/// A typed-data pair: the wire form (stringified big integers, safe for
/// JSON transport to wallets) and the verify form (native integers used
/// for server-side recovery). Both hash to the same digest.
#[derive(Debug, Clone)]
pub struct TypedDataBundle {
    pub wire: TypedData,
    pub verify: TypedData,
}

impl TypedDataBundle {
    pub fn signing_digest(&self) -> Result<[u8; 32]> {
        self.verify.signing_digest()
    }
}

/// Builds `PickupApproval` / `DropApproval` typed data against the fixed
/// `PODxShipment` domain.
#[derive(Debug, Clone)]
pub struct AttestationBuilder {
    domain: Eip712Domain,
}

impl AttestationBuilder {
    pub fn new(chain_id: u64, verifying_contract: Address) -> Self {
        Self {
            domain: Eip712Domain {
                name: DOMAIN_NAME.to_string(),
                version: DOMAIN_VERSION.to_string(),
                chain_id,
                verifying_contract,
            },
        }
    }

    pub fn domain(&self) -> &Eip712Domain {
        &self.domain
    }

    /// `keccak256(utf8(shipment.id))` — the 32-byte on-chain shipment key.
    pub fn shipment_hash(shipment_id: &str) -> [u8; 32] {
        keccak256(shipment_id.as_bytes())
    }

    /// `keccak256(abi.encode(int256 latScaled, int256 lonScaled, uint64 ts))`
    /// with coordinates scaled to micro-degrees, round-half-to-even.
    pub fn location_hash(lat: f64, lon: f64, claimed_ts: u64) -> Result<[u8; 32]> {
        if claimed_ts == 0 {
            return Err(AttestationError::InvalidInput(
                "claimedTs must be non-zero".to_string(),
            ));
        }
        let lat_scaled = scale_coordinate(lat, -90.0..=90.0, "latitude")?;
        let lon_scaled = scale_coordinate(lon, -180.0..=180.0, "longitude")?;
        Ok(keccak256_concat(&[
            &int256_word(lat_scaled),
            &int256_word(lon_scaled),
            &u256_word(U256::from(claimed_ts)),
        ]))
    }

    pub fn pickup(
        &self,
        shipment_hash: [u8; 32],
        order_id: U256,
        location_hash: [u8; 32],
        claimed_ts: u64,
    ) -> Result<TypedDataBundle> {
        if claimed_ts == 0 {
            return Err(AttestationError::InvalidInput(
                "claimedTs must be non-zero".to_string(),
            ));
        }
        let fields = vec![
            FieldDef::new("shipmentId", "bytes32"),
            FieldDef::new("orderId", "uint256"),
            FieldDef::new("locationHash", "bytes32"),
            FieldDef::new("claimedTs", "uint64"),
        ];
        let base = |order: Value| {
            serde_json::json!({
                "shipmentId": hex_word(&shipment_hash),
                "orderId": order,
                "locationHash": hex_word(&location_hash),
                "claimedTs": claimed_ts,
            })
        };
        Ok(TypedDataBundle {
            wire: self.typed(MilestoneKind::Pickup, fields.clone(), base(Value::String(order_id.to_string()))),
            verify: self.typed(MilestoneKind::Pickup, fields, base(uint_value(order_id))),
        })
    }

    pub fn drop_off(
        &self,
        shipment_hash: [u8; 32],
        order_id: U256,
        location_hash: [u8; 32],
        claimed_ts: u64,
        distance_meters: u64,
    ) -> Result<TypedDataBundle> {
        if claimed_ts == 0 {
            return Err(AttestationError::InvalidInput(
                "claimedTs must be non-zero".to_string(),
            ));
        }
        let fields = vec![
            FieldDef::new("shipmentId", "bytes32"),
            FieldDef::new("orderId", "uint256"),
            FieldDef::new("locationHash", "bytes32"),
            FieldDef::new("claimedTs", "uint64"),
            FieldDef::new("distanceMeters", "uint256"),
        ];
        let base = |order: Value, distance: Value| {
            serde_json::json!({
                "shipmentId": hex_word(&shipment_hash),
                "orderId": order,
                "locationHash": hex_word(&location_hash),
                "claimedTs": claimed_ts,
                "distanceMeters": distance,
            })
        };
        Ok(TypedDataBundle {
            wire: self.typed(
                MilestoneKind::Drop,
                fields.clone(),
                base(
                    Value::String(order_id.to_string()),
                    Value::String(distance_meters.to_string()),
                ),
            ),
            verify: self.typed(
                MilestoneKind::Drop,
                fields,
                base(uint_value(order_id), Value::from(distance_meters)),
            ),
        })
    }

    fn typed(&self, kind: MilestoneKind, fields: Vec<FieldDef>, message: Value) -> TypedData {
        TypedData {
            domain: self.domain.clone(),
            primary_type: kind.primary_type().to_string(),
            fields,
            message,
        }
    }
}

fn scale_coordinate(
    value: f64,
    range: std::ops::RangeInclusive<f64>,
    label: &str,
) -> Result<i64> {
    if !value.is_finite() || !range.contains(&value) {
        return Err(AttestationError::InvalidInput(format!(
            "{label} {value} out of range"
        )));
    }
    Ok((value * COORD_SCALE).round_ties_even() as i64)
}

/// Two's-complement `int256` encoding of an `i64`.
fn int256_word(value: i64) -> [u8; 32] {
    let fill = if value < 0 { 0xffu8 } else { 0x00u8 };
    let mut word = [fill; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn hex_word(word: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(word))
}

fn uint_value(value: U256) -> Value {
    if value <= U256::from(u64::MAX) {
        Value::from(value.as_u64())
    } else {
        Value::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{address_of, recover_address};
    use k256::ecdsa::SigningKey;

    fn builder() -> AttestationBuilder {
        AttestationBuilder::new(
            11155111,
            "0x00000000000000000000000000000000000000aa".parse().unwrap(),
        )
    }

    #[test]
    fn test_location_hash_round_trip() {
        let a = AttestationBuilder::location_hash(37.7749, -122.4194, 1_700_000_100).unwrap();
        let b = AttestationBuilder::location_hash(37.7749, -122.4194, 1_700_000_100).unwrap();
        assert_eq!(a, b);
        let moved = AttestationBuilder::location_hash(37.7750, -122.4194, 1_700_000_100).unwrap();
        assert_ne!(a, moved);
    }

    #[test]
    fn test_location_hash_discards_sub_microdegree_noise() {
        let a = AttestationBuilder::location_hash(1.000000049, 2.0, 10).unwrap();
        let b = AttestationBuilder::location_hash(1.0, 2.0, 10).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_claimed_ts_rejected() {
        assert!(AttestationBuilder::location_hash(0.0, 0.0, 0).is_err());
        let err = builder().pickup([0u8; 32], U256::one(), [0u8; 32], 0);
        assert!(err.is_err());
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        assert!(AttestationBuilder::location_hash(91.0, 0.0, 1).is_err());
        assert!(AttestationBuilder::location_hash(0.0, 181.0, 1).is_err());
        assert!(AttestationBuilder::location_hash(f64::NAN, 0.0, 1).is_err());
    }

    #[test]
    fn test_negative_coordinate_changes_hash() {
        let west = AttestationBuilder::location_hash(37.0, -122.0, 5).unwrap();
        let east = AttestationBuilder::location_hash(37.0, 122.0, 5).unwrap();
        assert_ne!(west, east);
    }

    #[test]
    fn test_wire_and_verify_forms_share_digest() {
        let shipment = AttestationBuilder::shipment_hash("shp_1");
        let location = AttestationBuilder::location_hash(0.0, 0.01, 1_700_000_100).unwrap();
        let bundle = builder()
            .drop_off(shipment, U256::from(1_700_000_000_000u64), location, 1_700_000_100, 1_113)
            .unwrap();
        assert_eq!(
            bundle.wire.signing_digest().unwrap(),
            bundle.verify.signing_digest().unwrap()
        );
    }

    #[test]
    fn test_courier_signature_recovers_over_bundle_digest() {
        let key = SigningKey::from_bytes((&[0x11u8; 32]).into()).unwrap();
        let courier = address_of(key.verifying_key());

        let shipment = AttestationBuilder::shipment_hash("shp_1");
        let location = AttestationBuilder::location_hash(37.7750, -122.4193, 1_700_000_100).unwrap();
        let bundle = builder()
            .pickup(shipment, U256::from(1_700_000_000_000u64), location, 1_700_000_100)
            .unwrap();

        let digest = bundle.signing_digest().unwrap();
        let (sig, recid) = key.sign_prehash_recoverable(&digest).unwrap();
        let mut raw = sig.to_bytes().to_vec();
        raw.push(recid.to_byte() + 27);

        assert_eq!(recover_address(&digest, &raw).unwrap(), courier);
    }

    #[test]
    fn test_pickup_and_drop_digests_differ() {
        let shipment = AttestationBuilder::shipment_hash("shp_1");
        let location = AttestationBuilder::location_hash(1.0, 1.0, 99).unwrap();
        let b = builder();
        let pickup = b.pickup(shipment, U256::one(), location, 99).unwrap();
        let drop = b.drop_off(shipment, U256::one(), location, 99, 0).unwrap();
        assert_ne!(
            pickup.signing_digest().unwrap(),
            drop.signing_digest().unwrap()
        );
    }
}
