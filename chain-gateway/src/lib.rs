//! EVM chain gateway for PODx.
//!
//! Wraps the three pre-deployed contracts (ERC-20 token, escrow vault,
//! order registry, shipment registry) behind typed calls, owns the
//! delivery-oracle signer, and keeps all JSON-RPC plumbing out of the
//! fulfillment service.

pub mod abi;
pub mod contracts;
pub mod error;
pub mod rpc;
pub mod signer;

pub use contracts::{ChainGateway, ChainOrder, GatewayConfig, MilestoneEvent};
pub use error::{GatewayError, Result};
pub use rpc::{LogEntry, RpcClient, TxReceipt};
pub use signer::{LegacyTransaction, OracleSigner};
