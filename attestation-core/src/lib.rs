//! Attestation primitives for the PODx fulfillment protocol.
//!
//! This crate is the pure (chain-free) half of the attestation and
//! settlement core:
//! - Keccak-256 hashing and EVM address handling
//! - EIP-712 domain and struct hashing
//! - `PickupApproval` / `DropApproval` typed-data construction
//! - ECDSA address recovery from 65-byte signatures
//! - Haversine geofencing
//! - HMAC-signed magic-link capability tokens
//!
//! Everything here is deterministic and side-effect free; contract wallets
//! (ERC-1271) and anything else that needs an RPC round-trip live in
//! `chain-gateway` and the fulfillment service.

pub mod address;
pub mod attestation;
pub mod eip712;
pub mod error;
pub mod geo;
pub mod keccak;
pub mod signature;
pub mod token;

pub use address::Address;
pub use attestation::{AttestationBuilder, MilestoneKind, TypedDataBundle};
pub use eip712::{Eip712Domain, TypedData};
pub use error::{AttestationError, Result};
pub use keccak::keccak256;
pub use signature::{recover_address, ERC1271_MAGIC_VALUE};
pub use token::{MagicLinkClaims, TokenCodec, TokenRole};
