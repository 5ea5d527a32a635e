use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use attestation_core::{AttestationBuilder, TokenCodec};
use chain_gateway::{ChainGateway, GatewayConfig};
use dotenv::dotenv;
use fulfillment_engine::{
    config::Config, database::Database, handlers, provisioning::ProvisioningService,
    sessions::SessionService, settlement::SettlementCoordinator, sweeper,
    verifier::SignatureVerifier,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize tracing
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .json()
        .init();

    info!("Starting Fulfillment Engine...");

    // Load configuration
    let config = Config::from_env().expect("Failed to load configuration");
    config.validate().expect("Invalid configuration");

    info!("Configuration loaded successfully");

    // Initialize database
    let db = Arc::new(
        Database::new(&config.database.url, config.database.max_connections)
            .await
            .expect("Failed to connect to database"),
    );

    info!("Database connected successfully");

    // Initialize chain gateway and assert the oracle identity
    let gateway = Arc::new(
        ChainGateway::connect(GatewayConfig {
            rpc_url: config.chain.rpc_url.clone(),
            rpc_timeout_secs: config.chain.rpc_timeout_secs,
            chain_id: config.chain.chain_id,
            oracle_private_key: config.chain.oracle_private_key.clone(),
            token_address: config
                .chain
                .token_address
                .parse()
                .expect("invalid token address"),
            escrow_address: config
                .chain
                .escrow_address
                .parse()
                .expect("invalid escrow address"),
            order_registry_address: config
                .chain
                .order_registry_address
                .parse()
                .expect("invalid order registry address"),
            shipment_registry_address: config
                .chain
                .shipment_registry_address
                .parse()
                .expect("invalid shipment registry address"),
        })
        .await
        .expect("Failed to connect to chain RPC"),
    );
    gateway
        .verify_oracle()
        .await
        .expect("Local signer is not the registered delivery oracle");

    info!("Chain gateway ready, oracle {}", gateway.oracle_address());

    // Token codec and attestation builder
    let codec = Arc::new(
        TokenCodec::new(config.session.secret.as_bytes()).expect("Invalid session secret"),
    );
    let builder = AttestationBuilder::new(
        config.chain.chain_id,
        config
            .chain
            .verifying_contract_address
            .parse()
            .expect("invalid verifying contract address"),
    );

    // Core services
    let verifier = Arc::new(SignatureVerifier::new(gateway.clone()));
    let coordinator = Arc::new(SettlementCoordinator::new(
        db.clone(),
        gateway.clone(),
        config.session.reward_per_meter,
    ));
    let sessions = Arc::new(SessionService::new(
        db.clone(),
        verifier,
        coordinator,
        codec,
        builder,
        config.session.ttl_minutes,
        config.session.default_radius_meters,
        config.server.public_url.clone(),
    ));
    let provisioning = Arc::new(ProvisioningService::new(db.clone(), gateway.clone()));

    info!("Fulfillment services initialized successfully");

    // Background expiry sweep
    let sweep_handle = sweeper::spawn(db.clone(), config.session.sweep_interval_secs);

    // Start HTTP server
    let server_config = config.server.clone();
    let sessions_data = web::Data::new(sessions);
    let provisioning_data = web::Data::new(provisioning);

    info!(
        "Starting HTTP server on {}:{}",
        server_config.host, server_config.port
    );

    let result = HttpServer::new(move || {
        App::new()
            .app_data(sessions_data.clone())
            .app_data(provisioning_data.clone())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(handlers::configure_routes)
    })
    .workers(server_config.workers)
    .bind((server_config.host, server_config.port))?
    .run()
    .await;

    // Teardown: stop the sweep and release the oracle signer
    sweep_handle.abort();
    gateway.shutdown();

    result
}
