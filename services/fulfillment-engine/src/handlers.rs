use crate::errors::FulfillmentError;
use crate::models::{
    CreateSessionRequest, CreateShipmentRequest, FundOrderRequest, SignRequest,
    UpdateCourierRequest,
};
use crate::provisioning::ProvisioningService;
use crate::sessions::SessionService;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    t: Option<String>,
}

impl TokenQuery {
    fn require(&self) -> Result<String, FulfillmentError> {
        self.t
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or(FulfillmentError::TokenMissing)
    }
}

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "fulfillment-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Courier opens a signing session for a milestone
pub async fn create_session(
    service: web::Data<Arc<SessionService>>,
    request: web::Json<CreateSessionRequest>,
) -> Result<HttpResponse, FulfillmentError> {
    let response = service.create_session(request.into_inner()).await?;
    Ok(HttpResponse::Created().json(response))
}

/// Counterparty resolves the session behind a magic link
pub async fn resolve_session(
    service: web::Data<Arc<SessionService>>,
    session_id: web::Path<String>,
    query: web::Query<TokenQuery>,
) -> Result<HttpResponse, FulfillmentError> {
    let token = query.require()?;
    let response = service.resolve_session(&session_id, &token).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Counterparty submits the counter-signature; settles the milestone
pub async fn sign_session(
    service: web::Data<Arc<SessionService>>,
    session_id: web::Path<String>,
    query: web::Query<TokenQuery>,
    request: web::Json<SignRequest>,
) -> Result<HttpResponse, FulfillmentError> {
    let token = query.require()?;
    let response = service
        .get_ref()
        .clone()
        .complete_session(
            session_id.into_inner(),
            token,
            request.into_inner().signature,
        )
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Supplier creates a shipment from a funded order
pub async fn create_shipment(
    service: web::Data<Arc<ProvisioningService>>,
    request: web::Json<CreateShipmentRequest>,
) -> Result<HttpResponse, FulfillmentError> {
    let response = service.create_shipment(request.into_inner()).await?;
    Ok(HttpResponse::Created().json(response))
}

/// Reassign the courier for a shipment, on-chain and in the database
pub async fn update_courier(
    service: web::Data<Arc<ProvisioningService>>,
    shipment_id: web::Path<String>,
    request: web::Json<UpdateCourierRequest>,
) -> Result<HttpResponse, FulfillmentError> {
    let response = service
        .update_courier(&shipment_id, request.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Drive the idempotent escrow funding pipeline for an order
pub async fn fund_order(
    service: web::Data<Arc<ProvisioningService>>,
    order_id: web::Path<String>,
    request: web::Json<FundOrderRequest>,
) -> Result<HttpResponse, FulfillmentError> {
    let response = service.fund_order(&order_id, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .service(
            web::scope("/signing-sessions")
                .route("", web::post().to(create_session))
                .route("/{session_id}", web::get().to(resolve_session))
                .route("/{session_id}/sign", web::post().to(sign_session)),
        )
        .service(
            web::scope("/shipments")
                .route("", web::post().to(create_shipment))
                .route("/{shipment_id}/courier", web::post().to(update_courier)),
        )
        .service(web::scope("/orders").route("/{order_id}/fund", web::post().to(fund_order)));
}
