use crate::errors::{FulfillmentError, Result};
use attestation_core::MilestoneKind;
use chrono::{DateTime, Utc};
use primitive_types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Order lifecycle. Monotonic except for Disputed <-> Resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
pub enum OrderStatus {
    Created,
    Approved,
    Funded,
    InFulfillment,
    Shipped,
    Delivered,
    Disputed,
    Resolved,
    Cancelled,
}

/// Shipment lifecycle: Created -> InTransit -> Delivered, or Created -> Cancelled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
pub enum ShipmentStatus {
    Created,
    InTransit,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    PendingSupplier,
    PendingBuyer,
    Completed,
    Expired,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Expired | SessionStatus::Cancelled
        )
    }

    /// The pending status a session of the given kind waits in.
    pub fn pending_for(kind: MilestoneKind) -> Self {
        match kind {
            MilestoneKind::Pickup => SessionStatus::PendingSupplier,
            MilestoneKind::Drop => SessionStatus::PendingBuyer,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ProofKind {
    Pickup,
    Drop,
    PickupCountersign,
    DropCountersign,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
pub enum PaymentStatus {
    Pending,
    Escrowed,
    Released,
    Refunded,
}

// ---- metadata blobs ------------------------------------------------------

/// Open-ended structured metadata with typed buckets for the recognised
/// keys and a pass-through map for everything else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataBlob {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup: Option<MilestoneMeta>,
    #[serde(rename = "drop", skip_serializing_if = "Option::is_none")]
    pub drop_off: Option<MilestoneMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onchain: Option<OnchainMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow: Option<EscrowMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<LineItem>>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MilestoneMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub courier_reward_wei: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_uri: Option<String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnchainMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_tx: Option<String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EscrowMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fund_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_tx: Option<String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

/// One order line item, replenished into buyer inventory on delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub sku_id: String,
    pub qty: f64,
}

// ---- entities ------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: String,
    pub buyer: String,
    pub supplier: String,
    pub total_amount: Decimal,
    pub currency: String,
    /// Canonical decimal string of the on-chain uint256 order id.
    pub chain_order_id: Option<String>,
    pub status: OrderStatus,
    pub metadata: Option<Json<MetadataBlob>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub funded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn metadata_blob(&self) -> MetadataBlob {
        self.metadata.as_ref().map(|j| j.0.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Shipment {
    pub id: String,
    pub order_id: String,
    pub shipment_no: i64,
    pub supplier: String,
    pub buyer: String,
    pub assigned_courier: Option<String>,
    pub pickup_lat: f64,
    pub pickup_lon: f64,
    pub drop_lat: f64,
    pub drop_lon: f64,
    pub due_by: DateTime<Utc>,
    pub status: ShipmentStatus,
    pub metadata: Option<Json<MetadataBlob>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shipment {
    pub fn metadata_blob(&self) -> MetadataBlob {
        self.metadata.as_ref().map(|j| j.0.clone()).unwrap_or_default()
    }
}

/// Everything needed to deterministically rebuild the typed data a courier
/// signed. Never read back from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub shipment_hash: String,
    pub location_hash: String,
    pub claimed_ts: u64,
    pub current_lat: f64,
    pub current_lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<u64>,
    pub radius_m: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SigningSession {
    pub id: Uuid,
    /// 128-bit hex identifier, the public session handle.
    pub session_uid: String,
    pub shipment_id: String,
    pub kind: String,
    pub courier: String,
    pub counterparty: String,
    pub chain_order_id: String,
    pub deadline: DateTime<Utc>,
    pub status: SessionStatus,
    pub courier_nonce: String,
    pub counterparty_nonce: String,
    pub context_hash: String,
    pub courier_signature: String,
    pub counterparty_signature: Option<String>,
    pub payload: Json<SessionPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SigningSession {
    pub fn milestone_kind(&self) -> Result<MilestoneKind> {
        MilestoneKind::parse(&self.kind)
            .map_err(|_| FulfillmentError::Internal(format!("corrupt session kind {}", self.kind)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MagicLink {
    pub id: Uuid,
    pub session_id: Uuid,
    pub token_hash: String,
    pub role: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Proof {
    pub id: Uuid,
    pub shipment_id: String,
    pub shipment_no: i64,
    pub kind: ProofKind,
    pub signer: String,
    pub claimed_ts: i64,
    pub photo_hash: Option<String>,
    pub photo_cid: Option<String>,
    pub distance_meters: Option<i64>,
    pub within_radius: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: String,
    pub order_id: String,
    pub payer: String,
    pub payee: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub escrow_tx: Option<String>,
    pub release_tx: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub owner: String,
    pub sku_id: String,
    pub name: String,
    pub unit: String,
    pub min_threshold: i64,
    pub target_stock: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---- request / response DTOs --------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub kind: String,
    pub shipment_id: String,
    pub shipment_hash: String,
    pub chain_order_id: String,
    pub claimed_ts: u64,
    pub current_lat: f64,
    pub current_lon: f64,
    pub location_hash: String,
    pub courier_signature: String,
    pub distance_meters: Option<u64>,
    pub pickup_lat: Option<f64>,
    pub pickup_lon: Option<f64>,
    pub drop_lat: Option<f64>,
    pub drop_lon: Option<f64>,
    pub radius_m: Option<u64>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub link: String,
    pub role: String,
    pub kind: String,
    pub deadline: DateTime<Utc>,
}

/// Session projection safe for the counterparty: no signatures, no nonces.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub kind: String,
    pub status: SessionStatus,
    pub shipment_id: String,
    pub chain_order_id: String,
    pub courier: String,
    pub counterparty: String,
    pub deadline: DateTime<Utc>,
    pub claimed_ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<u64>,
}

impl SessionView {
    pub fn from_session(session: &SigningSession) -> Self {
        Self {
            session_id: session.session_uid.clone(),
            kind: session.kind.clone(),
            status: session.status,
            shipment_id: session.shipment_id.clone(),
            chain_order_id: session.chain_order_id.clone(),
            courier: session.courier.clone(),
            counterparty: session.counterparty.clone(),
            deadline: session.deadline,
            claimed_ts: session.payload.claimed_ts,
            distance_meters: session.payload.distance_meters,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveSessionResponse {
    pub session: SessionView,
    pub typed_data: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignRequest {
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub courier_reward_wei: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShipmentRequest {
    pub order_id: String,
    pub shipment_no: i64,
    pub supplier_wallet: String,
    pub buyer_wallet: String,
    pub pickup_lat: f64,
    pub pickup_lon: f64,
    pub drop_lat: f64,
    pub drop_lon: f64,
    pub due_by: DateTime<Utc>,
    pub assigned_courier: Option<String>,
    pub metadata: Option<MetadataBlob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShipmentResponse {
    pub shipment: Shipment,
    pub order: Option<Order>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register_tx: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCourierRequest {
    pub courier_wallet: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCourierResponse {
    pub shipment: Shipment,
    pub tx: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundOrderRequest {
    /// Escrow amount in token base units, decimal string.
    pub amount_base_units: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundOrderResponse {
    pub order: Order,
    pub payment: Payment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_tx: Option<String>,
    pub fund_tx: String,
    pub mark_funded_tx: String,
}

// ---- helpers -------------------------------------------------------------

/// Accepts a `0x…` hex or decimal `chainOrderId` and canonicalises it to a
/// decimal string. Format is preserved on input, never used to infer intent.
pub fn canonical_chain_order_id(raw: &str) -> Result<String> {
    Ok(parse_chain_order_id(raw)?.to_string())
}

pub fn parse_chain_order_id(raw: &str) -> Result<U256> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FulfillmentError::Validation(
            "chainOrderId is required".to_string(),
        ));
    }
    let parsed = if let Some(hex_part) = trimmed.strip_prefix("0x") {
        U256::from_str_radix(hex_part, 16).ok()
    } else {
        U256::from_dec_str(trimmed).ok()
    };
    parsed.ok_or_else(|| {
        FulfillmentError::Validation(format!("chainOrderId {trimmed} is not a valid uint256"))
    })
}

/// Lowercased wallet form used for every address column.
pub fn normalize_wallet(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order_id_accepts_hex_and_decimal() {
        assert_eq!(canonical_chain_order_id("255").unwrap(), "255");
        assert_eq!(canonical_chain_order_id("0xff").unwrap(), "255");
        assert_eq!(
            canonical_chain_order_id("1700000000000").unwrap(),
            "1700000000000"
        );
    }

    #[test]
    fn test_chain_order_id_rejects_garbage() {
        assert!(canonical_chain_order_id("").is_err());
        assert!(canonical_chain_order_id("0xzz").is_err());
        assert!(canonical_chain_order_id("12a").is_err());
        assert!(canonical_chain_order_id("-5").is_err());
    }

    #[test]
    fn test_session_status_terminality() {
        assert!(!SessionStatus::PendingSupplier.is_terminal());
        assert!(!SessionStatus::PendingBuyer.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_pending_status_by_kind() {
        assert_eq!(
            SessionStatus::pending_for(MilestoneKind::Pickup),
            SessionStatus::PendingSupplier
        );
        assert_eq!(
            SessionStatus::pending_for(MilestoneKind::Drop),
            SessionStatus::PendingBuyer
        );
    }

    #[test]
    fn test_metadata_blob_preserves_unknown_keys() {
        let raw = serde_json::json!({
            "items": [{"skuId": "SKU-1", "qty": 3}],
            "customField": {"nested": true},
        });
        let blob: MetadataBlob = serde_json::from_value(raw).unwrap();
        assert_eq!(blob.items.as_ref().unwrap()[0].sku_id, "SKU-1");
        assert!(blob.other.contains_key("customField"));

        let back = serde_json::to_value(&blob).unwrap();
        assert_eq!(back["customField"]["nested"], true);
    }

    #[test]
    fn test_metadata_drop_key_round_trips() {
        let raw = serde_json::json!({
            "drop": {"txHash": "0xabc", "distanceMeters": 1113}
        });
        let blob: MetadataBlob = serde_json::from_value(raw).unwrap();
        assert_eq!(
            blob.drop_off.as_ref().unwrap().tx_hash.as_deref(),
            Some("0xabc")
        );
        let back = serde_json::to_value(&blob).unwrap();
        assert!(back.get("drop").is_some());
    }

    #[test]
    fn test_session_status_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::PendingSupplier).unwrap(),
            "\"PENDING_SUPPLIER\""
        );
        assert_eq!(
            serde_json::to_string(&ProofKind::DropCountersign).unwrap(),
            "\"drop-countersign\""
        );
    }

    #[test]
    fn test_normalize_wallet() {
        assert_eq!(
            normalize_wallet(" 0xABCdef0000000000000000000000000000000001 "),
            "0xabcdef0000000000000000000000000000000001"
        );
    }
}
