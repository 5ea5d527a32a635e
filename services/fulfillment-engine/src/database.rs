use crate::errors::{FulfillmentError, Result};
use crate::models::{
    MagicLink, MetadataBlob, Order, OrderStatus, Payment, PaymentStatus, Proof, ProofKind,
    SessionPayload, SessionStatus, Shipment, ShipmentStatus, SigningSession,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// Name of the partial unique index enforcing one active session per
/// `(shipment, kind)`; conflicts on it surface as `SESSION_CONFLICT`.
const ACTIVE_SESSION_INDEX: &str = "signing_sessions_active_milestone_idx";

pub struct NewSession {
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
    pub payload: SessionPayload,
}

pub struct NewMagicLink {
    pub token_hash: String,
    pub role: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

pub struct NewProof {
    pub shipment_id: String,
    pub shipment_no: i64,
    pub kind: ProofKind,
    pub signer: String,
    pub claimed_ts: i64,
    pub distance_meters: Option<i64>,
    pub within_radius: bool,
}

pub struct NewShipment {
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
    pub metadata: Option<MetadataBlob>,
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // ---- orders ----------------------------------------------------------

    pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    pub async fn get_order_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
    ) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(order)
    }

    /// Move an order to `Shipped` and merge the updated metadata blob.
    pub async fn update_order_after_pickup(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
        metadata: &MetadataBlob,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET status = $1, metadata = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(OrderStatus::Shipped)
        .bind(Json(metadata))
        .bind(now)
        .bind(order_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Terminal delivery transition: `Delivered` plus `completed_at`.
    pub async fn update_order_after_drop(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
        metadata: &MetadataBlob,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET status = $1, metadata = $2, completed_at = $3, updated_at = $3 \
             WHERE id = $4",
        )
        .bind(OrderStatus::Delivered)
        .bind(Json(metadata))
        .bind(now)
        .bind(order_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        metadata: Option<&MetadataBlob>,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>> {
        let timestamp_column = match status {
            OrderStatus::Approved => Some("approved_at"),
            OrderStatus::Funded => Some("funded_at"),
            OrderStatus::Delivered | OrderStatus::Resolved => Some("completed_at"),
            OrderStatus::Cancelled => Some("cancelled_at"),
            _ => None,
        };
        let set_timestamp = timestamp_column
            .map(|col| format!(", {col} = $3"))
            .unwrap_or_default();
        let query = format!(
            "UPDATE orders SET status = $1, \
             metadata = COALESCE($2, metadata), updated_at = $3{set_timestamp} \
             WHERE id = $4 RETURNING *",
        );
        let order = sqlx::query_as::<_, Order>(&query)
            .bind(status)
            .bind(metadata.map(Json))
            .bind(now)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    // ---- shipments -------------------------------------------------------

    pub async fn get_shipment(&self, shipment_id: &str) -> Result<Option<Shipment>> {
        let shipment = sqlx::query_as::<_, Shipment>("SELECT * FROM shipments WHERE id = $1")
            .bind(shipment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(shipment)
    }

    pub async fn get_shipment_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        shipment_id: &str,
    ) -> Result<Option<Shipment>> {
        let shipment =
            sqlx::query_as::<_, Shipment>("SELECT * FROM shipments WHERE id = $1 FOR UPDATE")
                .bind(shipment_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(shipment)
    }

    pub async fn create_shipment(&self, new: &NewShipment) -> Result<Shipment> {
        let now = Utc::now();
        let shipment = sqlx::query_as::<_, Shipment>(
            r#"
            INSERT INTO shipments (
                id, order_id, shipment_no, supplier, buyer, assigned_courier,
                pickup_lat, pickup_lon, drop_lat, drop_lon, due_by, status,
                metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING *
            "#,
        )
        .bind(&new.id)
        .bind(&new.order_id)
        .bind(new.shipment_no)
        .bind(&new.supplier)
        .bind(&new.buyer)
        .bind(&new.assigned_courier)
        .bind(new.pickup_lat)
        .bind(new.pickup_lon)
        .bind(new.drop_lat)
        .bind(new.drop_lon)
        .bind(new.due_by)
        .bind(ShipmentStatus::Created)
        .bind(new.metadata.as_ref().map(Json))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match constraint_of(&e) {
            Some(name) if name.contains("shipment_no") => FulfillmentError::Validation(
                "shipment number already used for this supplier".to_string(),
            ),
            _ => FulfillmentError::Database(e),
        })?;
        Ok(shipment)
    }

    /// Pickup commit: `InTransit`, courier backfill, merged metadata.
    pub async fn update_shipment_after_pickup(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        shipment_id: &str,
        courier: &str,
        metadata: &MetadataBlob,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE shipments SET status = $1, picked_up_at = $2, updated_at = $2, \
             assigned_courier = COALESCE(assigned_courier, $3), metadata = $4 WHERE id = $5",
        )
        .bind(ShipmentStatus::InTransit)
        .bind(now)
        .bind(courier)
        .bind(Json(metadata))
        .bind(shipment_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Drop commit: terminal `Delivered` state.
    pub async fn update_shipment_after_drop(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        shipment_id: &str,
        metadata: &MetadataBlob,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE shipments SET status = $1, delivered_at = $2, updated_at = $2, \
             metadata = $3 WHERE id = $4",
        )
        .bind(ShipmentStatus::Delivered)
        .bind(now)
        .bind(Json(metadata))
        .bind(shipment_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn set_shipment_courier(
        &self,
        shipment_id: &str,
        courier: &str,
    ) -> Result<Option<Shipment>> {
        let shipment = sqlx::query_as::<_, Shipment>(
            "UPDATE shipments SET assigned_courier = $1, updated_at = $2 WHERE id = $3 RETURNING *",
        )
        .bind(courier)
        .bind(Utc::now())
        .bind(shipment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(shipment)
    }

    // ---- signing sessions & magic links ----------------------------------

    /// Atomically insert a session and its magic link. A conflict on the
    /// active-session partial index means a non-terminal session already
    /// exists for this `(shipment, kind)`.
    pub async fn create_session(
        &self,
        new_session: &NewSession,
        new_link: &NewMagicLink,
    ) -> Result<SigningSession> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let session = sqlx::query_as::<_, SigningSession>(
            r#"
            INSERT INTO signing_sessions (
                id, session_uid, shipment_id, kind, courier, counterparty,
                chain_order_id, deadline, status, courier_nonce, counterparty_nonce,
                context_hash, courier_signature, counterparty_signature, payload,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NULL, $14, $15, $15)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_session.session_uid)
        .bind(&new_session.shipment_id)
        .bind(&new_session.kind)
        .bind(&new_session.courier)
        .bind(&new_session.counterparty)
        .bind(&new_session.chain_order_id)
        .bind(new_session.deadline)
        .bind(new_session.status)
        .bind(&new_session.courier_nonce)
        .bind(&new_session.counterparty_nonce)
        .bind(&new_session.context_hash)
        .bind(&new_session.courier_signature)
        .bind(Json(&new_session.payload))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match constraint_of(&e) {
            Some(name) if name == ACTIVE_SESSION_INDEX => FulfillmentError::SessionConflict,
            _ => FulfillmentError::Database(e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO magic_links (
                id, session_id, token_hash, role, jti, expires_at, used_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NULL, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session.id)
        .bind(&new_link.token_hash)
        .bind(&new_link.role)
        .bind(&new_link.jti)
        .bind(new_link.expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session)
    }

    pub async fn get_session_by_uid(&self, session_uid: &str) -> Result<Option<SigningSession>> {
        let session = sqlx::query_as::<_, SigningSession>(
            "SELECT * FROM signing_sessions WHERE session_uid = $1",
        )
        .bind(session_uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Row-locked read; all session mutations serialise on this.
    pub async fn get_session_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        session_uid: &str,
    ) -> Result<Option<SigningSession>> {
        let session = sqlx::query_as::<_, SigningSession>(
            "SELECT * FROM signing_sessions WHERE session_uid = $1 FOR UPDATE",
        )
        .bind(session_uid)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(session)
    }

    pub async fn get_magic_link_by_hash(&self, token_hash: &str) -> Result<Option<MagicLink>> {
        let link =
            sqlx::query_as::<_, MagicLink>("SELECT * FROM magic_links WHERE token_hash = $1")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(link)
    }

    pub async fn get_magic_link_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        token_hash: &str,
    ) -> Result<Option<MagicLink>> {
        let link = sqlx::query_as::<_, MagicLink>(
            "SELECT * FROM magic_links WHERE token_hash = $1 FOR UPDATE",
        )
        .bind(token_hash)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(link)
    }

    /// Single-use enforcement: the conditional update succeeds exactly once.
    pub async fn mark_link_used(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        link_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE magic_links SET used_at = $1 WHERE id = $2 AND used_at IS NULL")
                .bind(now)
                .bind(link_id)
                .execute(&mut **tx)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_session_completed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        session_id: Uuid,
        counterparty_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE signing_sessions SET status = $1, counterparty_signature = $2, \
             updated_at = $3 WHERE id = $4",
        )
        .bind(SessionStatus::Completed)
        .bind(counterparty_signature)
        .bind(now)
        .bind(session_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Background sweep: flip overdue non-terminal sessions to `EXPIRED`
    /// and clamp their magic links so both lookup paths reject them.
    pub async fn expire_due_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let expired: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE signing_sessions SET status = $1, updated_at = $2 \
             WHERE deadline < $2 AND status IN ($3, $4) RETURNING id",
        )
        .bind(SessionStatus::Expired)
        .bind(now)
        .bind(SessionStatus::PendingSupplier)
        .bind(SessionStatus::PendingBuyer)
        .fetch_all(&mut *tx)
        .await?;

        if !expired.is_empty() {
            let ids: Vec<Uuid> = expired.iter().map(|(id,)| *id).collect();
            sqlx::query(
                "UPDATE magic_links SET expires_at = $1 \
                 WHERE session_id = ANY($2) AND used_at IS NULL AND expires_at > $1",
            )
            .bind(now)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(expired.len() as u64)
    }

    // ---- proofs ----------------------------------------------------------

    pub async fn insert_proof(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        proof: &NewProof,
        now: DateTime<Utc>,
    ) -> Result<Proof> {
        let inserted = sqlx::query_as::<_, Proof>(
            r#"
            INSERT INTO proofs (
                id, shipment_id, shipment_no, kind, signer, claimed_ts,
                photo_hash, photo_cid, distance_meters, within_radius, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&proof.shipment_id)
        .bind(proof.shipment_no)
        .bind(proof.kind)
        .bind(&proof.signer)
        .bind(proof.claimed_ts)
        .bind(proof.distance_meters)
        .bind(proof.within_radius)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;
        Ok(inserted)
    }

    pub async fn proof_exists(&self, shipment_id: &str, kind: ProofKind) -> Result<bool> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM proofs WHERE shipment_id = $1 AND kind = $2 LIMIT 1")
                .bind(shipment_id)
                .bind(kind)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    // ---- payments --------------------------------------------------------

    pub async fn get_payment_for_order(&self, order_id: &str) -> Result<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE order_id = $1 ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    /// Upsert the single payment row for `(order, payer, payee)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_payment(
        &self,
        order_id: &str,
        payer: &str,
        payee: &str,
        amount: Decimal,
        currency: &str,
        status: PaymentStatus,
        escrow_tx: Option<&str>,
    ) -> Result<Payment> {
        let now = Utc::now();
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (
                id, order_id, payer, payee, amount, currency, status,
                escrow_tx, release_tx, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9, $9)
            ON CONFLICT (order_id, payer, payee)
            DO UPDATE SET
                amount = EXCLUDED.amount,
                status = EXCLUDED.status,
                escrow_tx = COALESCE(EXCLUDED.escrow_tx, payments.escrow_tx),
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(format!("pay_{}", Uuid::new_v4().simple()))
        .bind(order_id)
        .bind(payer)
        .bind(payee)
        .bind(amount)
        .bind(currency)
        .bind(status)
        .bind(escrow_tx)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(payment)
    }

    /// Transition an escrowed payment to `Released`; no-op when the order
    /// never had a payment row.
    pub async fn release_payment(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
        release_tx: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payments SET status = $1, release_tx = $2, updated_at = $3 \
             WHERE order_id = $4 AND status <> $1",
        )
        .bind(PaymentStatus::Released)
        .bind(release_tx)
        .bind(now)
        .bind(order_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn constraint_of(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) => db.constraint().map(|s| s.to_string()),
        _ => None,
    }
}
