//! Settlement coordination: composes the on-chain milestone confirmation
//! with the matching relational transition.
//!
//! Commit ordering: the chain call always happens BEFORE the relational
//! commit, so a terminal database state always reflects a confirmed chain
//! state. A chain failure leaves the database untouched and the session
//! pending; a database failure after a confirmed chain call is healed on
//! the next attempt by the event-keyed catch-up path.

use crate::database::{Database, NewProof};
use crate::errors::{FulfillmentError, Result};
use crate::inventory;
use crate::models::{
    EscrowMeta, MetadataBlob, MilestoneMeta, OnchainMeta, Order, ProofKind, Shipment,
    ShipmentStatus, SigningSession,
};
use attestation_core::geo;
use attestation_core::{AttestationBuilder, MilestoneKind};
use chain_gateway::ChainGateway;
use chrono::Utc;
use primitive_types::U256;
use sqlx::{Postgres, Transaction};
use std::sync::Arc;
use tracing::{info, warn};

/// Claimed drop distance may deviate from the planned route by this much.
pub const DISTANCE_TOLERANCE_M: u64 = 5;

/// Result of a settled milestone, surfaced to the signing counterparty.
#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub kind: MilestoneKind,
    pub tx_hash: String,
    pub courier_reward: Option<U256>,
}

pub struct SettlementCoordinator {
    db: Arc<Database>,
    gateway: Arc<ChainGateway>,
    reward_per_meter: u64,
}

impl SettlementCoordinator {
    pub fn new(db: Arc<Database>, gateway: Arc<ChainGateway>, reward_per_meter: u64) -> Self {
        Self {
            db,
            gateway,
            reward_per_meter,
        }
    }

    /// Run the milestone settlement. The caller holds the session row lock
    /// in `tx` and has already verified both signatures; this method owns
    /// the transaction from here and commits it on success.
    pub async fn settle(
        &self,
        tx: Transaction<'static, Postgres>,
        session: &SigningSession,
        counterparty_signature: &str,
    ) -> Result<SettlementOutcome> {
        match session.milestone_kind()? {
            MilestoneKind::Pickup => self.settle_pickup(tx, session, counterparty_signature).await,
            MilestoneKind::Drop => self.settle_drop(tx, session, counterparty_signature).await,
        }
    }

    async fn settle_pickup(
        &self,
        mut tx: Transaction<'static, Postgres>,
        session: &SigningSession,
        counterparty_signature: &str,
    ) -> Result<SettlementOutcome> {
        let (shipment, order) = self.load_for_settlement(&mut tx, session).await?;
        if shipment.status != ShipmentStatus::Created {
            return Err(FulfillmentError::ShipmentState(format!(
                "pickup requires Created shipment, found {:?}",
                shipment.status
            )));
        }

        let shipment_hash = AttestationBuilder::shipment_hash(&shipment.id);
        let order_id = crate::models::parse_chain_order_id(&session.chain_order_id)?;
        let location_hash = decode_hash32(&session.payload.location_hash)?;
        let courier_sig = crate::verifier::decode_signature(&session.courier_signature)?;
        let counterparty_sig = crate::verifier::decode_signature(counterparty_signature)?;

        let submitted = self
            .gateway
            .confirm_pickup(
                shipment_hash,
                order_id,
                location_hash,
                session.payload.claimed_ts,
                &courier_sig,
                &counterparty_sig,
            )
            .await;

        let tx_hash = match submitted {
            Ok(receipt) => receipt.transaction_hash,
            // A revert on retry can mean the milestone is already on-chain
            // (database commit failed last time). Catch up from the event.
            Err(chain_error) => {
                match self
                    .gateway
                    .find_milestone_event(MilestoneKind::Pickup, shipment_hash)
                    .await?
                {
                    Some(event) => {
                        warn!(
                            "pickup for {} already confirmed on-chain, catching up",
                            shipment.id
                        );
                        event.tx_hash.unwrap_or_default()
                    }
                    None => return Err(chain_error.into()),
                }
            }
        };

        self.commit_pickup(tx, session, &shipment, &order, &tx_hash, counterparty_signature)
            .await?;

        info!("pickup settled for shipment {} ({})", shipment.id, tx_hash);
        Ok(SettlementOutcome {
            kind: MilestoneKind::Pickup,
            tx_hash,
            courier_reward: None,
        })
    }

    async fn settle_drop(
        &self,
        mut tx: Transaction<'static, Postgres>,
        session: &SigningSession,
        counterparty_signature: &str,
    ) -> Result<SettlementOutcome> {
        let (shipment, order) = self.load_for_settlement(&mut tx, session).await?;
        if !matches!(
            shipment.status,
            ShipmentStatus::InTransit | ShipmentStatus::Delivered
        ) {
            return Err(FulfillmentError::ShipmentState(format!(
                "drop requires InTransit shipment, found {:?}",
                shipment.status
            )));
        }
        if self
            .db
            .proof_exists(&shipment.id, ProofKind::DropCountersign)
            .await?
        {
            return Err(FulfillmentError::ShipmentState(
                "drop already settled".to_string(),
            ));
        }

        let claimed_distance = session.payload.distance_meters.ok_or_else(|| {
            FulfillmentError::Validation("drop session is missing distanceMeters".to_string())
        })?;
        let planned = planned_distance(&shipment);
        if claimed_distance.abs_diff(planned) > DISTANCE_TOLERANCE_M {
            return Err(FulfillmentError::BadDistance {
                claimed: claimed_distance,
                planned,
            });
        }

        let shipment_hash = AttestationBuilder::shipment_hash(&shipment.id);
        let order_id = crate::models::parse_chain_order_id(&session.chain_order_id)?;
        let location_hash = decode_hash32(&session.payload.location_hash)?;
        let courier_sig = crate::verifier::decode_signature(&session.courier_signature)?;
        let counterparty_sig = crate::verifier::decode_signature(counterparty_signature)?;

        let order_meta = order.metadata_blob();
        let line_items = order_meta.items.clone().unwrap_or_default();
        let line_items_json = serde_json::to_string(&line_items)
            .map_err(|e| FulfillmentError::Internal(e.to_string()))?;
        let metadata_uri = order_meta
            .other
            .get("dropMetadataUri")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // The escrow headroom must be read before the release happens.
        let escrowed = self.gateway.escrowed(order_id).await?;
        let supplier_amount = self
            .gateway
            .order(order_id)
            .await?
            .map(|o| o.amount)
            .unwrap_or_default();

        let submitted = self
            .gateway
            .confirm_drop(
                shipment_hash,
                order_id,
                location_hash,
                session.payload.claimed_ts,
                U256::from(claimed_distance),
                &courier_sig,
                &counterparty_sig,
                &line_items_json,
                &metadata_uri,
            )
            .await;

        let (tx_hash, event_reward) = match submitted {
            Ok(receipt) => {
                let reward = self.gateway.drop_reward_from_receipt(&receipt);
                (receipt.transaction_hash, reward)
            }
            Err(chain_error) => {
                match self
                    .gateway
                    .find_milestone_event(MilestoneKind::Drop, shipment_hash)
                    .await?
                {
                    Some(event) => {
                        warn!(
                            "drop for {} already confirmed on-chain, catching up",
                            shipment.id
                        );
                        (event.tx_hash.unwrap_or_default(), event.courier_reward)
                    }
                    None => return Err(chain_error.into()),
                }
            }
        };

        let courier_reward = bounded_reward(
            event_reward,
            claimed_distance,
            self.reward_per_meter,
            escrowed,
            supplier_amount,
        );

        self.commit_drop(
            tx,
            session,
            &shipment,
            &order,
            &tx_hash,
            counterparty_signature,
            claimed_distance,
            courier_reward,
            &line_items,
            &metadata_uri,
        )
        .await?;

        info!(
            "drop settled for shipment {} ({}), courier reward {}",
            shipment.id, tx_hash, courier_reward
        );
        Ok(SettlementOutcome {
            kind: MilestoneKind::Drop,
            tx_hash,
            courier_reward: Some(courier_reward),
        })
    }

    async fn load_for_settlement(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        session: &SigningSession,
    ) -> Result<(Shipment, Order)> {
        let shipment = self
            .db
            .get_shipment_for_update(tx, &session.shipment_id)
            .await?
            .ok_or_else(|| FulfillmentError::ShipmentNotFound(session.shipment_id.clone()))?;
        let order = self
            .db
            .get_order_for_update(tx, &shipment.order_id)
            .await?
            .ok_or_else(|| FulfillmentError::OrderNotFound(shipment.order_id.clone()))?;
        Ok((shipment, order))
    }

    async fn commit_pickup(
        &self,
        mut tx: Transaction<'static, Postgres>,
        session: &SigningSession,
        shipment: &Shipment,
        order: &Order,
        tx_hash: &str,
        counterparty_signature: &str,
    ) -> Result<()> {
        let now = Utc::now();

        self.db
            .insert_proof(
                &mut tx,
                &NewProof {
                    shipment_id: shipment.id.clone(),
                    shipment_no: shipment.shipment_no,
                    kind: ProofKind::PickupCountersign,
                    signer: session.counterparty.clone(),
                    claimed_ts: session.payload.claimed_ts as i64,
                    distance_meters: None,
                    within_radius: true,
                },
                now,
            )
            .await?;

        let mut shipment_meta = shipment.metadata_blob();
        stamp_pickup(&mut shipment_meta, tx_hash, session);
        self.db
            .update_shipment_after_pickup(&mut tx, &shipment.id, &session.courier, &shipment_meta, now)
            .await?;

        let mut order_meta = order.metadata_blob();
        stamp_pickup(&mut order_meta, tx_hash, session);
        self.db
            .update_order_after_pickup(&mut tx, &order.id, &order_meta, now)
            .await?;

        self.finalise_session(&mut tx, session, counterparty_signature, now)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_drop(
        &self,
        mut tx: Transaction<'static, Postgres>,
        session: &SigningSession,
        shipment: &Shipment,
        order: &Order,
        tx_hash: &str,
        counterparty_signature: &str,
        distance_meters: u64,
        courier_reward: U256,
        line_items: &[crate::models::LineItem],
        metadata_uri: &str,
    ) -> Result<()> {
        let now = Utc::now();

        self.db
            .insert_proof(
                &mut tx,
                &NewProof {
                    shipment_id: shipment.id.clone(),
                    shipment_no: shipment.shipment_no,
                    kind: ProofKind::DropCountersign,
                    signer: session.counterparty.clone(),
                    claimed_ts: session.payload.claimed_ts as i64,
                    distance_meters: Some(distance_meters as i64),
                    within_radius: true,
                },
                now,
            )
            .await?;

        let mut shipment_meta = shipment.metadata_blob();
        stamp_drop(&mut shipment_meta, tx_hash, session, distance_meters, courier_reward, metadata_uri);
        self.db
            .update_shipment_after_drop(&mut tx, &shipment.id, &shipment_meta, now)
            .await?;

        let mut order_meta = order.metadata_blob();
        stamp_drop(&mut order_meta, tx_hash, session, distance_meters, courier_reward, metadata_uri);
        order_meta.escrow.get_or_insert_with(EscrowMeta::default).release_tx =
            Some(tx_hash.to_string());
        self.db
            .update_order_after_drop(&mut tx, &order.id, &order_meta, now)
            .await?;

        inventory::replenish_line_items(&mut tx, &order.buyer, line_items, now).await?;

        if self.db.release_payment(&mut tx, &order.id, tx_hash, now).await? {
            info!("payment for order {} released", order.id);
        }

        self.finalise_session(&mut tx, session, counterparty_signature, now)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Mark session completed and consume the magic link. A lost race on
    /// the single-use link aborts the whole transaction.
    async fn finalise_session(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        session: &SigningSession,
        counterparty_signature: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.db
            .mark_session_completed(tx, session.id, counterparty_signature, now)
            .await?;
        let link = sqlx::query_as::<_, crate::models::MagicLink>(
            "SELECT * FROM magic_links WHERE session_id = $1 FOR UPDATE",
        )
        .bind(session.id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(FulfillmentError::SessionGone)?;
        if !self.db.mark_link_used(tx, link.id, now).await? {
            return Err(FulfillmentError::LinkUsed);
        }
        Ok(())
    }
}

/// The route distance the courier committed to: pickup point to drop point.
pub fn planned_distance(shipment: &Shipment) -> u64 {
    geo::distance_meters_rounded(
        shipment.pickup_lat,
        shipment.pickup_lon,
        shipment.drop_lat,
        shipment.drop_lon,
    )
}

/// Courier reward: the on-chain `DropApproved` value when the log parses,
/// otherwise `distance · rewardPerMeter`; always bounded by both the
/// per-meter schedule and the escrow headroom left after the supplier.
pub fn bounded_reward(
    event_reward: Option<U256>,
    distance_meters: u64,
    reward_per_meter: u64,
    escrowed: U256,
    supplier_amount: U256,
) -> U256 {
    let schedule = U256::from(distance_meters) * U256::from(reward_per_meter);
    let headroom = escrowed.saturating_sub(supplier_amount);
    event_reward.unwrap_or(schedule).min(schedule).min(headroom)
}

fn stamp_pickup(meta: &mut MetadataBlob, tx_hash: &str, session: &SigningSession) {
    meta.onchain.get_or_insert_with(OnchainMeta::default).pickup_tx = Some(tx_hash.to_string());
    let pickup = meta.pickup.get_or_insert_with(MilestoneMeta::default);
    pickup.tx_hash = Some(tx_hash.to_string());
    pickup.claimed_ts = Some(session.payload.claimed_ts as i64);
}

fn stamp_drop(
    meta: &mut MetadataBlob,
    tx_hash: &str,
    session: &SigningSession,
    distance_meters: u64,
    courier_reward: U256,
    metadata_uri: &str,
) {
    meta.onchain.get_or_insert_with(OnchainMeta::default).drop_tx = Some(tx_hash.to_string());
    let drop_meta = meta.drop_off.get_or_insert_with(MilestoneMeta::default);
    drop_meta.tx_hash = Some(tx_hash.to_string());
    drop_meta.claimed_ts = Some(session.payload.claimed_ts as i64);
    drop_meta.distance_meters = Some(distance_meters as i64);
    drop_meta.courier_reward_wei = Some(courier_reward.to_string());
    if !metadata_uri.is_empty() {
        drop_meta.metadata_uri = Some(metadata_uri.to_string());
    }
}

fn decode_hash32(raw: &str) -> Result<[u8; 32]> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped)
        .map_err(|e| FulfillmentError::Validation(format!("bad 32-byte hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| FulfillmentError::Validation("expected 32 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_reward_scenario() {
        // 1113 m at 10 units/m against 1,000,000 units of headroom.
        let reward = bounded_reward(
            None,
            1_113,
            10,
            U256::from(100_000_000u64),
            U256::from(99_000_000u64),
        );
        assert_eq!(reward, U256::from(11_130));
    }

    #[test]
    fn test_reward_capped_by_headroom() {
        let reward = bounded_reward(
            None,
            1_000_000,
            10,
            U256::from(100_000u64),
            U256::from(90_000u64),
        );
        assert_eq!(reward, U256::from(10_000));
    }

    #[test]
    fn test_event_reward_cannot_exceed_schedule() {
        let reward = bounded_reward(
            Some(U256::from(999_999u64)),
            100,
            10,
            U256::from(1_000_000u64),
            U256::zero(),
        );
        assert_eq!(reward, U256::from(1_000));
    }

    #[test]
    fn test_reward_zero_when_escrow_exhausted() {
        let reward = bounded_reward(
            None,
            100,
            10,
            U256::from(50u64),
            U256::from(80u64),
        );
        assert_eq!(reward, U256::zero());
    }

    #[test]
    fn test_event_reward_used_when_within_bounds() {
        let reward = bounded_reward(
            Some(U256::from(500u64)),
            100,
            10,
            U256::from(1_000_000u64),
            U256::zero(),
        );
        assert_eq!(reward, U256::from(500));
    }

    #[test]
    fn test_decode_hash32() {
        let ok = format!("0x{}", "ab".repeat(32));
        assert_eq!(decode_hash32(&ok).unwrap()[0], 0xab);
        assert!(decode_hash32("0x1234").is_err());
        assert!(decode_hash32("zz").is_err());
    }
}
