//! Fulfillment provisioning: shipment creation, courier reassignment and
//! escrow funding. These paths run before any signing session exists and
//! feed the registries the settlement core later settles against.

use crate::database::{Database, NewShipment};
use crate::errors::{FulfillmentError, Result};
use crate::models::{
    canonical_chain_order_id, normalize_wallet, parse_chain_order_id, CreateShipmentRequest,
    CreateShipmentResponse, EscrowMeta, FundOrderRequest, FundOrderResponse, OrderStatus,
    PaymentStatus, UpdateCourierRequest, UpdateCourierResponse,
};
use attestation_core::{Address, AttestationBuilder};
use chain_gateway::ChainGateway;
use chrono::Utc;
use primitive_types::U256;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct ProvisioningService {
    db: Arc<Database>,
    gateway: Arc<ChainGateway>,
}

impl ProvisioningService {
    pub fn new(db: Arc<Database>, gateway: Arc<ChainGateway>) -> Self {
        Self { db, gateway }
    }

    /// Create a shipment from a funded order, mirror it on-chain when the
    /// order is chain-bound, and move the order into fulfillment.
    pub async fn create_shipment(
        &self,
        request: CreateShipmentRequest,
    ) -> Result<CreateShipmentResponse> {
        let order = self
            .db
            .get_order(&request.order_id)
            .await?
            .ok_or_else(|| FulfillmentError::OrderNotFound(request.order_id.clone()))?;

        let shipment = self
            .db
            .create_shipment(&NewShipment {
                id: format!("shp_{}", Uuid::new_v4().simple()),
                order_id: order.id.clone(),
                shipment_no: request.shipment_no,
                supplier: normalize_wallet(&request.supplier_wallet),
                buyer: normalize_wallet(&request.buyer_wallet),
                assigned_courier: request
                    .assigned_courier
                    .as_deref()
                    .map(normalize_wallet),
                pickup_lat: request.pickup_lat,
                pickup_lon: request.pickup_lon,
                drop_lat: request.drop_lat,
                drop_lon: request.drop_lon,
                due_by: request.due_by,
                metadata: request.metadata.clone(),
            })
            .await?;

        // Mirror on-chain when the order carries a chain id. Registration
        // failure is logged, not fatal: the registry can be caught up by a
        // later courier update.
        let mut register_tx = None;
        if let Some(raw) = order.chain_order_id.as_deref() {
            match self.register_onchain(&shipment.id, raw, &shipment).await {
                Ok(tx) => register_tx = Some(tx),
                Err(e) => warn!("on-chain registration of {} failed: {}", shipment.id, e),
            }
        }

        let order = self
            .db
            .update_order_status(&order.id, OrderStatus::InFulfillment, None, Utc::now())
            .await?;

        info!("created shipment {}", shipment.id);
        Ok(CreateShipmentResponse {
            shipment,
            order,
            register_tx,
        })
    }

    pub async fn update_courier(
        &self,
        shipment_id: &str,
        request: UpdateCourierRequest,
    ) -> Result<UpdateCourierResponse> {
        let courier = normalize_wallet(&request.courier_wallet);
        let courier_address: Address = courier
            .parse()
            .map_err(|_| FulfillmentError::Validation("courierWallet is not an address".to_string()))?;

        let shipment = self
            .db
            .get_shipment(shipment_id)
            .await?
            .ok_or_else(|| FulfillmentError::ShipmentNotFound(shipment_id.to_string()))?;

        let tx = self
            .gateway
            .update_courier(AttestationBuilder::shipment_hash(&shipment.id), courier_address)
            .await?;

        let shipment = self
            .db
            .set_shipment_courier(&shipment.id, &courier)
            .await?
            .ok_or_else(|| FulfillmentError::ShipmentNotFound(shipment_id.to_string()))?;

        info!("courier for {} updated to {} ({})", shipment.id, courier, tx);
        Ok(UpdateCourierResponse { shipment, tx })
    }

    /// Drive the escrow funding pipeline for an order. Every chain step is
    /// idempotent, so a partially-funded order can be replayed safely.
    pub async fn fund_order(
        &self,
        order_id: &str,
        request: FundOrderRequest,
    ) -> Result<FundOrderResponse> {
        let order = self
            .db
            .get_order(order_id)
            .await?
            .ok_or_else(|| FulfillmentError::OrderNotFound(order_id.to_string()))?;
        let chain_order_raw = order.chain_order_id.as_deref().ok_or_else(|| {
            FulfillmentError::Validation("order has no chainOrderId".to_string())
        })?;
        let chain_order_id = parse_chain_order_id(&canonical_chain_order_id(chain_order_raw)?)?;

        let amount = U256::from_dec_str(request.amount_base_units.trim()).map_err(|_| {
            FulfillmentError::Validation("amountBaseUnits is not a valid uint256".to_string())
        })?;
        let buyer: Address = order.buyer.parse().map_err(|_| {
            FulfillmentError::Internal("order buyer address corrupt".to_string())
        })?;
        let supplier: Address = order.supplier.parse().map_err(|_| {
            FulfillmentError::Internal("order supplier address corrupt".to_string())
        })?;

        let create_tx = self
            .gateway
            .create_order(chain_order_id, buyer, supplier, amount)
            .await?;
        let approval_tx = self.gateway.approve_escrow(amount).await?;
        let fund_tx = self.gateway.fund_escrow(chain_order_id, amount).await?;
        let mark_funded_tx = self.gateway.mark_funded(chain_order_id).await?;

        let mut metadata = order.metadata_blob();
        let escrow = metadata.escrow.get_or_insert_with(EscrowMeta::default);
        escrow.fund_tx = Some(fund_tx.clone());
        if let Some(tx) = &approval_tx {
            escrow.approval_tx = Some(tx.clone());
        }

        let order = self
            .db
            .update_order_status(&order.id, OrderStatus::Funded, Some(&metadata), Utc::now())
            .await?
            .ok_or_else(|| FulfillmentError::OrderNotFound(order_id.to_string()))?;

        let payment = self
            .db
            .upsert_payment(
                &order.id,
                &order.buyer,
                &order.supplier,
                order.total_amount,
                &order.currency,
                PaymentStatus::Escrowed,
                Some(&fund_tx),
            )
            .await?;

        info!("order {} funded in escrow ({})", order.id, fund_tx);
        Ok(FundOrderResponse {
            order,
            payment,
            create_tx,
            approval_tx,
            fund_tx,
            mark_funded_tx,
        })
    }

    async fn register_onchain(
        &self,
        shipment_id: &str,
        chain_order_raw: &str,
        shipment: &crate::models::Shipment,
    ) -> Result<String> {
        let chain_order_id = parse_chain_order_id(chain_order_raw)?;
        let buyer: Address = shipment.buyer.parse().map_err(|_| {
            FulfillmentError::Internal("shipment buyer address corrupt".to_string())
        })?;
        let supplier: Address = shipment.supplier.parse().map_err(|_| {
            FulfillmentError::Internal("shipment supplier address corrupt".to_string())
        })?;
        let courier = shipment
            .assigned_courier
            .as_deref()
            .unwrap_or(&shipment.supplier)
            .parse()
            .map_err(|_| FulfillmentError::Internal("courier address corrupt".to_string()))?;

        let tx = self
            .gateway
            .register_shipment(
                AttestationBuilder::shipment_hash(shipment_id),
                chain_order_id,
                buyer,
                supplier,
                courier,
            )
            .await?;
        Ok(tx)
    }
}
