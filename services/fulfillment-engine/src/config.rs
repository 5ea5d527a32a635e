use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    /// Base URL used when minting signing links for counterparties.
    pub public_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub rpc_timeout_secs: u64,
    pub verifying_contract_address: String,
    pub token_address: String,
    pub escrow_address: String,
    pub order_registry_address: String,
    pub shipment_registry_address: String,
    pub oracle_private_key: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub ttl_minutes: i64,
    pub default_radius_meters: u64,
    pub reward_per_meter: u64,
    /// Sweep interval for expiring overdue sessions.
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("server.workers", 4)?
            .set_default("server.public_url", "http://localhost:8090")?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("chain.chain_id", 0)?
            .set_default("chain.rpc_url", "")?
            .set_default("chain.rpc_timeout_secs", 30)?
            .set_default("chain.verifying_contract_address", "")?
            .set_default("chain.token_address", "")?
            .set_default("chain.escrow_address", "")?
            .set_default("chain.order_registry_address", "")?
            .set_default("chain.shipment_registry_address", "")?
            .set_default("chain.oracle_private_key", "")?
            .set_default("session.secret", "")?
            .set_default("session.ttl_minutes", 10)?
            .set_default("session.default_radius_meters", 2000)?
            .set_default("session.reward_per_meter", 10)?
            .set_default("session.sweep_interval_secs", 60)?;

        // Environment-specific config file if one exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder
                .add_source(File::with_name(&format!("config/{}", environment)).required(false));
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("FULFILLMENT_ENGINE")
                .separator("__")
                .list_separator(","),
        );

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(rpc_url) = env::var("RPC_URL") {
            builder = builder.set_override("chain.rpc_url", rpc_url)?;
        }

        if let Ok(key) = env::var("ORACLE_PRIVATE_KEY") {
            builder = builder.set_override("chain.oracle_private_key", key)?;
        }

        if let Ok(secret) = env::var("SESSION_SECRET") {
            builder = builder.set_override("session.secret", secret)?;
        }

        if let Ok(port) = env::var("FULFILLMENT_ENGINE_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Startup validation: every non-defaulted option must be present.
    /// A failure here is fatal by design of the caller.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.chain.chain_id == 0 {
            return Err("Chain id is required".to_string());
        }

        if self.chain.rpc_url.is_empty() {
            return Err("Chain RPC URL is required".to_string());
        }

        for (label, value) in [
            ("verifyingContractAddress", &self.chain.verifying_contract_address),
            ("tokenAddress", &self.chain.token_address),
            ("escrowAddress", &self.chain.escrow_address),
            ("orderRegistryAddress", &self.chain.order_registry_address),
            ("shipmentRegistryAddress", &self.chain.shipment_registry_address),
        ] {
            if value.is_empty() {
                return Err(format!("{label} is required"));
            }
            if value.parse::<attestation_core::Address>().is_err() {
                return Err(format!("{label} is not a valid address"));
            }
        }

        if self.chain.oracle_private_key.is_empty() {
            return Err("Oracle private key is required".to_string());
        }

        if self.session.secret.len() < 32 {
            return Err("Session secret must be at least 32 bytes".to_string());
        }

        if self.session.ttl_minutes <= 0 {
            return Err("Session TTL must be positive".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 8090,
                workers: 4,
                public_url: "http://localhost:8090".into(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/podx".into(),
                max_connections: 10,
                min_connections: 2,
            },
            chain: ChainConfig {
                chain_id: 11155111,
                rpc_url: "http://localhost:8545".into(),
                rpc_timeout_secs: 30,
                verifying_contract_address: "0x00000000000000000000000000000000000000aa".into(),
                token_address: "0x00000000000000000000000000000000000000ab".into(),
                escrow_address: "0x00000000000000000000000000000000000000ac".into(),
                order_registry_address: "0x00000000000000000000000000000000000000ad".into(),
                shipment_registry_address: "0x00000000000000000000000000000000000000ae".into(),
                oracle_private_key: "0x4646464646464646464646464646464646464646464646464646464646464646".into(),
            },
            session: SessionConfig {
                secret: "0123456789abcdef0123456789abcdef".into(),
                ttl_minutes: 10,
                default_radius_meters: 2000,
                reward_per_meter: 10,
                sweep_interval_secs: 60,
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_required_options_fail() {
        let mut cfg = valid_config();
        cfg.database.url.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.chain.rpc_url.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.chain.oracle_private_key.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.chain.escrow_address.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut cfg = valid_config();
        cfg.session.secret = "too-short".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_address_rejected() {
        let mut cfg = valid_config();
        cfg.chain.token_address = "not-an-address".into();
        assert!(cfg.validate().is_err());
    }
}
