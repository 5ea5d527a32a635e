//! Signing-session store: create, resolve, complete, expire.
//!
//! A session binds a courier-signed milestone to a one-time magic link for
//! the opposite counterparty. All typed data handed to the counterparty is
//! rebuilt from the stored payload, never from caller input.

use crate::database::{Database, NewMagicLink, NewSession};
use crate::errors::{FulfillmentError, Result};
use crate::models::{
    canonical_chain_order_id, normalize_wallet, parse_chain_order_id, CreateSessionRequest,
    CreateSessionResponse, MagicLink, ResolveSessionResponse, SessionPayload, SessionStatus,
    SessionView, Shipment, ShipmentStatus, SignResponse, SigningSession,
};
use crate::settlement::{planned_distance, SettlementCoordinator, DISTANCE_TOLERANCE_M};
use crate::verifier::{decode_signature, SignatureVerifier};
use attestation_core::token::{MagicLinkClaims, TokenCodec, TokenRole};
use attestation_core::{
    geo, keccak256, recover_address, Address, AttestationBuilder, AttestationError, MilestoneKind,
    TypedDataBundle,
};
use chrono::{Duration, Utc};
use rand::RngCore;
use std::sync::Arc;
use tracing::info;

pub struct SessionService {
    db: Arc<Database>,
    verifier: Arc<SignatureVerifier>,
    coordinator: Arc<SettlementCoordinator>,
    codec: Arc<TokenCodec>,
    builder: AttestationBuilder,
    session_ttl: Duration,
    default_radius_m: u64,
    public_url: String,
}

impl SessionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        verifier: Arc<SignatureVerifier>,
        coordinator: Arc<SettlementCoordinator>,
        codec: Arc<TokenCodec>,
        builder: AttestationBuilder,
        ttl_minutes: i64,
        default_radius_m: u64,
        public_url: String,
    ) -> Self {
        Self {
            db,
            verifier,
            coordinator,
            codec,
            builder,
            session_ttl: Duration::minutes(ttl_minutes),
            default_radius_m,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    // ---- createSession ---------------------------------------------------

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        let kind = MilestoneKind::parse(&request.kind)
            .map_err(|e| FulfillmentError::Validation(e.to_string()))?;
        if request.claimed_ts == 0 {
            return Err(FulfillmentError::Validation(
                "claimedTs must be non-zero".to_string(),
            ));
        }

        let shipment = self
            .db
            .get_shipment(&request.shipment_id)
            .await?
            .ok_or_else(|| FulfillmentError::ShipmentNotFound(request.shipment_id.clone()))?;
        check_shipment_state(kind, &shipment)?;

        let chain_order_id = canonical_chain_order_id(&request.chain_order_id)?;
        let order_u256 = parse_chain_order_id(&chain_order_id)?;

        // The shipment hash the courier signed must be derived from the row
        // we hold, not trusted from the wire.
        let shipment_hash = AttestationBuilder::shipment_hash(&shipment.id);
        let provided_hash = decode_hash32(&request.shipment_hash)?;
        if provided_hash != shipment_hash {
            return Err(FulfillmentError::Validation(
                "shipmentHash does not match shipment".to_string(),
            ));
        }

        // Geofence against the milestone's target coordinates.
        let (target_lat, target_lon) = match kind {
            MilestoneKind::Pickup => (shipment.pickup_lat, shipment.pickup_lon),
            MilestoneKind::Drop => (shipment.drop_lat, shipment.drop_lon),
        };
        let radius_m = request
            .radius_m
            .filter(|r| *r > 0)
            .unwrap_or(self.default_radius_m);
        let fence_distance = geo::distance_meters_rounded(
            target_lat,
            target_lon,
            request.current_lat,
            request.current_lon,
        );
        if !geo::within_radius(fence_distance, radius_m) {
            return Err(FulfillmentError::RadiusExceeded {
                distance_m: fence_distance,
                radius_m,
            });
        }

        // Drop sessions must carry a route distance consistent with the plan.
        let distance_meters = match kind {
            MilestoneKind::Pickup => None,
            MilestoneKind::Drop => {
                let claimed = request.distance_meters.ok_or_else(|| {
                    FulfillmentError::Validation("distanceMeters is required for drop".to_string())
                })?;
                let planned = planned_distance(&shipment);
                if claimed.abs_diff(planned) > DISTANCE_TOLERANCE_M {
                    return Err(FulfillmentError::BadDistance { claimed, planned });
                }
                Some(claimed)
            }
        };

        // The location hash is recomputed server-side; a mismatch means the
        // client hashed different coordinates than it reported.
        let location_hash = AttestationBuilder::location_hash(
            request.current_lat,
            request.current_lon,
            request.claimed_ts,
        )
        .map_err(|e| FulfillmentError::Validation(e.to_string()))?;
        if decode_hash32(&request.location_hash)? != location_hash {
            return Err(FulfillmentError::Validation(
                "locationHash does not match reported coordinates".to_string(),
            ));
        }

        let bundle = self.build_bundle(
            kind,
            shipment_hash,
            order_u256,
            location_hash,
            request.claimed_ts,
            distance_meters,
        )?;

        // Courier identity: the assigned courier when the shipment has one,
        // otherwise the address the signature itself recovers to.
        let courier = self.courier_identity(&shipment, &bundle, &request.courier_signature)?;
        self.verifier
            .require_valid(courier, &bundle.verify, &request.courier_signature)
            .await?;

        let role = match kind {
            MilestoneKind::Pickup => TokenRole::Supplier,
            MilestoneKind::Drop => TokenRole::Buyer,
        };
        let counterparty = match kind {
            MilestoneKind::Pickup => shipment.supplier.clone(),
            MilestoneKind::Drop => shipment.buyer.clone(),
        };

        let session_uid = random_hex_128();
        let deadline = Utc::now() + self.session_ttl;
        let (token, jti) = self.codec.mint(&session_uid, role, deadline.timestamp());

        let payload = SessionPayload {
            shipment_hash: hex_prefixed(&shipment_hash),
            location_hash: hex_prefixed(&location_hash),
            claimed_ts: request.claimed_ts,
            current_lat: request.current_lat,
            current_lon: request.current_lon,
            distance_meters,
            radius_m,
            notes: request.notes.clone(),
        };
        let context_hash = context_hash(&shipment_hash, &location_hash, request.claimed_ts, kind);

        let new_session = NewSession {
            session_uid: session_uid.clone(),
            shipment_id: shipment.id.clone(),
            kind: kind.as_str().to_string(),
            courier: normalize_wallet(&courier.to_lower_hex()),
            counterparty: normalize_wallet(&counterparty),
            chain_order_id,
            deadline,
            status: SessionStatus::pending_for(kind),
            courier_nonce: random_hex_128(),
            counterparty_nonce: random_hex_128(),
            context_hash: hex_prefixed(&context_hash),
            courier_signature: request.courier_signature.clone(),
            payload,
        };
        let new_link = NewMagicLink {
            token_hash: TokenCodec::token_hash(&token),
            role: role.as_str().to_string(),
            jti,
            expires_at: deadline,
        };

        let session = match self.db.create_session(&new_session, &new_link).await {
            Ok(session) => session,
            // The blocking session may be overdue and simply not swept yet.
            Err(FulfillmentError::SessionConflict) => {
                if self.db.expire_due_sessions(Utc::now()).await? > 0 {
                    self.db.create_session(&new_session, &new_link).await?
                } else {
                    return Err(FulfillmentError::SessionConflict);
                }
            }
            Err(e) => return Err(e),
        };

        info!(
            "created {} session {} for shipment {}",
            kind.as_str(),
            session.session_uid,
            shipment.id
        );
        Ok(CreateSessionResponse {
            link: format!(
                "{}/signing-sessions/{}?t={}",
                self.public_url, session.session_uid, token
            ),
            session_id: session.session_uid,
            role: role.as_str().to_string(),
            kind: kind.as_str().to_string(),
            deadline,
        })
    }

    // ---- resolveSession --------------------------------------------------

    pub async fn resolve_session(
        &self,
        session_uid: &str,
        token: &str,
    ) -> Result<ResolveSessionResponse> {
        let claims = self.check_token(token)?;
        let link = self
            .db
            .get_magic_link_by_hash(&TokenCodec::token_hash(token))
            .await?
            .ok_or(FulfillmentError::SessionGone)?;
        let session = self
            .db
            .get_session_by_uid(session_uid)
            .await?
            .ok_or(FulfillmentError::SessionGone)?;
        validate_presented(&session, &link, &claims)?;

        let bundle = self.rebuild_bundle(&session)?;
        Ok(ResolveSessionResponse {
            session: SessionView::from_session(&session),
            typed_data: bundle.wire.to_wire_json(),
        })
    }

    // ---- completeSession -------------------------------------------------

    /// Verify and settle. The inner future is spawned so a client
    /// disconnect cannot cancel the flow once the chain submission may
    /// have been enqueued.
    pub async fn complete_session(
        self: Arc<Self>,
        session_uid: String,
        token: String,
        signature: String,
    ) -> Result<SignResponse> {
        let service = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            service
                .complete_inner(&session_uid, &token, &signature)
                .await
        });
        handle
            .await
            .map_err(|e| FulfillmentError::Internal(format!("settlement task failed: {e}")))?
    }

    async fn complete_inner(
        &self,
        session_uid: &str,
        token: &str,
        signature: &str,
    ) -> Result<SignResponse> {
        let claims = self.check_token(token)?;

        let mut tx = self.db.begin().await?;
        let session = self
            .db
            .get_session_for_update(&mut tx, session_uid)
            .await?
            .ok_or(FulfillmentError::SessionGone)?;
        let link = self
            .db
            .get_magic_link_for_update(&mut tx, &TokenCodec::token_hash(token))
            .await?
            .ok_or(FulfillmentError::SessionGone)?;
        validate_presented(&session, &link, &claims)?;

        let bundle = self.rebuild_bundle(&session)?;
        let counterparty: Address = session.counterparty.parse().map_err(|_| {
            FulfillmentError::Internal("session counterparty address corrupt".to_string())
        })?;
        self.verifier
            .require_valid(counterparty, &bundle.verify, signature)
            .await?;

        let outcome = self.coordinator.settle(tx, &session, signature).await?;
        Ok(match outcome.kind {
            MilestoneKind::Pickup => SignResponse {
                ok: true,
                pickup_tx: Some(outcome.tx_hash),
                drop_tx: None,
                courier_reward_wei: None,
            },
            MilestoneKind::Drop => SignResponse {
                ok: true,
                pickup_tx: None,
                drop_tx: Some(outcome.tx_hash),
                courier_reward_wei: outcome.courier_reward.map(|r| r.to_string()),
            },
        })
    }

    // ---- internals -------------------------------------------------------

    fn check_token(&self, token: &str) -> Result<MagicLinkClaims> {
        self.codec
            .verify(token, Utc::now().timestamp())
            .map_err(|e| match e {
                AttestationError::TokenExpired => FulfillmentError::LinkExpired,
                _ => FulfillmentError::TokenInvalid,
            })
    }

    fn courier_identity(
        &self,
        shipment: &Shipment,
        bundle: &TypedDataBundle,
        courier_signature: &str,
    ) -> Result<Address> {
        if let Some(assigned) = shipment
            .assigned_courier
            .as_deref()
            .filter(|c| !c.is_empty())
        {
            return assigned.parse().map_err(|_| {
                FulfillmentError::Internal("assigned courier address corrupt".to_string())
            });
        }
        let digest = bundle
            .signing_digest()
            .map_err(|e| FulfillmentError::Validation(e.to_string()))?;
        let raw = decode_signature(courier_signature)?;
        recover_address(&digest, &raw).map_err(|_| FulfillmentError::BadSignature {
            expected_signer: "assigned courier".to_string(),
            recovered: None,
        })
    }

    fn build_bundle(
        &self,
        kind: MilestoneKind,
        shipment_hash: [u8; 32],
        order_id: primitive_types::U256,
        location_hash: [u8; 32],
        claimed_ts: u64,
        distance_meters: Option<u64>,
    ) -> Result<TypedDataBundle> {
        let bundle = match kind {
            MilestoneKind::Pickup => {
                self.builder
                    .pickup(shipment_hash, order_id, location_hash, claimed_ts)
            }
            MilestoneKind::Drop => self.builder.drop_off(
                shipment_hash,
                order_id,
                location_hash,
                claimed_ts,
                distance_meters.unwrap_or_default(),
            ),
        };
        bundle.map_err(|e| FulfillmentError::Validation(e.to_string()))
    }

    /// Reconstruct the typed data from the stored payload alone.
    fn rebuild_bundle(&self, session: &SigningSession) -> Result<TypedDataBundle> {
        let kind = session.milestone_kind()?;
        let shipment_hash = decode_hash32(&session.payload.shipment_hash)?;
        let location_hash = decode_hash32(&session.payload.location_hash)?;
        let order_id = parse_chain_order_id(&session.chain_order_id)?;
        self.build_bundle(
            kind,
            shipment_hash,
            order_id,
            location_hash,
            session.payload.claimed_ts,
            session.payload.distance_meters,
        )
    }
}

fn check_shipment_state(kind: MilestoneKind, shipment: &Shipment) -> Result<()> {
    let ok = match kind {
        MilestoneKind::Pickup => shipment.status == ShipmentStatus::Created,
        MilestoneKind::Drop => matches!(
            shipment.status,
            ShipmentStatus::InTransit | ShipmentStatus::Delivered
        ),
    };
    if ok {
        Ok(())
    } else {
        Err(FulfillmentError::ShipmentState(format!(
            "{} milestone not allowed while shipment is {:?}",
            kind.as_str(),
            shipment.status
        )))
    }
}

/// Shared presentation checks for resolve and complete: token/session
/// binding, single use, expected pending status, role, and deadline.
fn validate_presented(
    session: &SigningSession,
    link: &MagicLink,
    claims: &MagicLinkClaims,
) -> Result<()> {
    if claims.sid != session.session_uid || link.session_id != session.id {
        return Err(FulfillmentError::TokenInvalid);
    }
    if link.used_at.is_some() {
        return Err(FulfillmentError::LinkUsed);
    }

    let kind = session.milestone_kind()?;
    match session.status {
        status if status == SessionStatus::pending_for(kind) => {}
        SessionStatus::Completed => return Err(FulfillmentError::LinkUsed),
        SessionStatus::Expired => return Err(FulfillmentError::LinkExpired),
        _ => return Err(FulfillmentError::SessionGone),
    }

    let now = Utc::now();
    if session.deadline <= now || link.expires_at <= now {
        return Err(FulfillmentError::LinkExpired);
    }

    let expected_role = match kind {
        MilestoneKind::Pickup => TokenRole::Supplier,
        MilestoneKind::Drop => TokenRole::Buyer,
    };
    if claims.role != expected_role || link.role != expected_role.as_str() {
        return Err(FulfillmentError::RoleMismatch);
    }
    Ok(())
}

fn context_hash(
    shipment_hash: &[u8; 32],
    location_hash: &[u8; 32],
    claimed_ts: u64,
    kind: MilestoneKind,
) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(32 + 32 + 8 + 8);
    preimage.extend_from_slice(shipment_hash);
    preimage.extend_from_slice(location_hash);
    preimage.extend_from_slice(&claimed_ts.to_be_bytes());
    preimage.extend_from_slice(kind.as_str().as_bytes());
    keccak256(&preimage)
}

fn random_hex_128() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hex_prefixed(hash: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(hash))
}

fn decode_hash32(raw: &str) -> Result<[u8; 32]> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped)
        .map_err(|e| FulfillmentError::Validation(format!("bad 32-byte hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| FulfillmentError::Validation("expected 32 bytes".to_string()))
}
