//! Typed wrappers over the escrow, order-registry and shipment-registry
//! contracts, plus the delivery-oracle transaction pipeline.

use crate::abi::{self, Token};
use crate::error::{GatewayError, Result};
use crate::rpc::{RpcClient, TxReceipt};
use crate::signer::{LegacyTransaction, OracleSigner};
use attestation_core::{Address, MilestoneKind, ERC1271_MAGIC_VALUE};
use primitive_types::U256;
use tokio::sync::Mutex;
use tracing::{info, warn};

const PICKUP_APPROVED_SIG: &str = "PickupApproved(bytes32,uint256,bytes32,uint64)";
const DROP_APPROVED_SIG: &str = "DropApproved(bytes32,uint256,bytes32,uint64,uint256,uint256)";

const GAS_CONFIRM_PICKUP: u64 = 250_000;
const GAS_CONFIRM_DROP: u64 = 350_000;
const GAS_REGISTER_SHIPMENT: u64 = 300_000;
const GAS_UPDATE_COURIER: u64 = 200_000;
const GAS_DEFAULT: u64 = 120_000;

/// Gateway wiring: node URL, oracle key, and the deployed contract set.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub rpc_url: String,
    pub rpc_timeout_secs: u64,
    pub chain_id: u64,
    pub oracle_private_key: String,
    pub token_address: Address,
    pub escrow_address: Address,
    pub order_registry_address: Address,
    pub shipment_registry_address: Address,
}

/// On-chain order registry row.
#[derive(Debug, Clone)]
pub struct ChainOrder {
    pub buyer: Address,
    pub supplier: Address,
    pub amount: U256,
    pub status: u8,
}

/// A decoded `PickupApproved` / `DropApproved` event.
#[derive(Debug, Clone)]
pub struct MilestoneEvent {
    pub kind: MilestoneKind,
    pub shipment_hash: [u8; 32],
    pub order_id: U256,
    pub location_hash: [u8; 32],
    pub claimed_ts: u64,
    pub distance_meters: Option<U256>,
    pub courier_reward: Option<U256>,
    pub tx_hash: Option<String>,
}

/// Owns the RPC connection and the single oracle signer. All writes go
/// through one send lock so the signer never issues parallel transactions.
pub struct ChainGateway {
    rpc: RpcClient,
    signer: OracleSigner,
    send_lock: Mutex<()>,
    token: Address,
    escrow: Address,
    order_registry: Address,
    shipment_registry: Address,
}

impl ChainGateway {
    /// Connect to the node and sanity-check the configured chain id.
    pub async fn connect(config: GatewayConfig) -> Result<Self> {
        let rpc = RpcClient::new(&config.rpc_url, config.rpc_timeout_secs)?;
        let node_chain = rpc.chain_id().await?;
        if node_chain != config.chain_id {
            return Err(GatewayError::Config(format!(
                "node reports chain id {node_chain}, configured {}",
                config.chain_id
            )));
        }
        let signer = OracleSigner::from_hex(&config.oracle_private_key, config.chain_id)?;
        info!("chain gateway connected, oracle {}", signer.address());
        Ok(Self {
            rpc,
            signer,
            send_lock: Mutex::new(()),
            token: config.token_address,
            escrow: config.escrow_address,
            order_registry: config.order_registry_address,
            shipment_registry: config.shipment_registry_address,
        })
    }

    pub fn oracle_address(&self) -> Address {
        self.signer.address()
    }

    /// Startup assertion: the local key must be the registry's oracle.
    pub async fn verify_oracle(&self) -> Result<()> {
        let registered = self.delivery_oracle().await?;
        if registered != self.signer.address() {
            return Err(GatewayError::Config(format!(
                "delivery oracle mismatch: registry has {}, local signer is {}",
                registered,
                self.signer.address()
            )));
        }
        Ok(())
    }

    /// Teardown hook; the signer key is zeroized on drop.
    pub fn shutdown(&self) {
        info!("chain gateway shutting down, oracle {}", self.signer.address());
    }

    // ---- views -----------------------------------------------------------

    pub async fn delivery_oracle(&self) -> Result<Address> {
        let words = self
            .call_view(&self.order_registry, abi::encode_call("deliveryOracle()", &[]))
            .await?;
        abi::word_to_address(first(&words)?)
    }

    pub async fn escrowed(&self, order_id: U256) -> Result<U256> {
        let words = self
            .call_view(
                &self.escrow,
                abi::encode_call("escrowed(uint256)", &[Token::Uint(order_id)]),
            )
            .await?;
        Ok(abi::word_to_u256(first(&words)?))
    }

    /// `orders(orderId)`; `None` when the slot is unset (zero buyer).
    pub async fn order(&self, order_id: U256) -> Result<Option<ChainOrder>> {
        let words = self
            .call_view(
                &self.order_registry,
                abi::encode_call("orders(uint256)", &[Token::Uint(order_id)]),
            )
            .await?;
        if words.len() < 4 {
            return Err(GatewayError::Abi(format!(
                "orders() returned {} words",
                words.len()
            )));
        }
        let buyer = abi::word_to_address(&words[0])?;
        if buyer.is_zero() {
            return Ok(None);
        }
        Ok(Some(ChainOrder {
            buyer,
            supplier: abi::word_to_address(&words[1])?,
            amount: abi::word_to_u256(&words[2]),
            status: words[3][31],
        }))
    }

    pub async fn allowance(&self, owner: Address, spender: Address) -> Result<U256> {
        let words = self
            .call_view(
                &self.token,
                abi::encode_call(
                    "allowance(address,address)",
                    &[Token::Address(owner), Token::Address(spender)],
                ),
            )
            .await?;
        Ok(abi::word_to_u256(first(&words)?))
    }

    pub async fn get_code(&self, address: Address) -> Result<Vec<u8>> {
        self.rpc.get_code(&address).await
    }

    /// ERC-1271 `isValidSignature(bytes32,bytes)` staticcall. Any revert or
    /// malformed return counts as rejection.
    pub async fn is_valid_signature(
        &self,
        wallet: Address,
        digest: [u8; 32],
        signature: &[u8],
    ) -> Result<bool> {
        let data = abi::encode_call(
            "isValidSignature(bytes32,bytes)",
            &[
                Token::FixedBytes(digest),
                Token::Bytes(signature.to_vec()),
            ],
        );
        match self.rpc.call(&wallet, &data).await {
            Ok(ret) => Ok(ret.len() >= 4 && ret[..4] == ERC1271_MAGIC_VALUE),
            Err(GatewayError::Rpc { .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }

    // ---- idempotent submitters ------------------------------------------

    /// Create the on-chain order unless it already exists.
    pub async fn create_order(
        &self,
        order_id: U256,
        buyer: Address,
        supplier: Address,
        amount: U256,
    ) -> Result<Option<String>> {
        if self.order(order_id).await?.is_some() {
            info!("order {} already registered on-chain, skipping", order_id);
            return Ok(None);
        }
        let data = abi::encode_call(
            "createOrder(uint256,address,address,uint256)",
            &[
                Token::Uint(order_id),
                Token::Address(buyer),
                Token::Address(supplier),
                Token::Uint(amount),
            ],
        );
        let receipt = self.submit(self.order_registry, data, GAS_DEFAULT).await?;
        Ok(Some(receipt.transaction_hash))
    }

    pub async fn mark_funded(&self, order_id: U256) -> Result<String> {
        let data = abi::encode_call("markFunded(uint256)", &[Token::Uint(order_id)]);
        let receipt = self.submit(self.order_registry, data, GAS_DEFAULT).await?;
        Ok(receipt.transaction_hash)
    }

    /// Approve the escrow to pull `amount` token units, unless the current
    /// allowance already covers it.
    pub async fn approve_escrow(&self, amount: U256) -> Result<Option<String>> {
        let current = self.allowance(self.signer.address(), self.escrow).await?;
        if current >= amount {
            return Ok(None);
        }
        let data = abi::encode_call(
            "approve(address,uint256)",
            &[Token::Address(self.escrow), Token::Uint(amount)],
        );
        let receipt = self.submit(self.token, data, GAS_DEFAULT).await?;
        Ok(Some(receipt.transaction_hash))
    }

    pub async fn fund_escrow(&self, order_id: U256, amount: U256) -> Result<String> {
        let data = abi::encode_call(
            "fund(uint256,uint256)",
            &[Token::Uint(order_id), Token::Uint(amount)],
        );
        let receipt = self.submit(self.escrow, data, GAS_DEFAULT).await?;
        Ok(receipt.transaction_hash)
    }

    pub async fn register_shipment(
        &self,
        shipment_hash: [u8; 32],
        order_id: U256,
        buyer: Address,
        supplier: Address,
        courier: Address,
    ) -> Result<String> {
        let data = abi::encode_call(
            "registerShipment(bytes32,uint256,address,address,address)",
            &[
                Token::FixedBytes(shipment_hash),
                Token::Uint(order_id),
                Token::Address(buyer),
                Token::Address(supplier),
                Token::Address(courier),
            ],
        );
        let receipt = self
            .submit(self.shipment_registry, data, GAS_REGISTER_SHIPMENT)
            .await?;
        Ok(receipt.transaction_hash)
    }

    pub async fn update_courier(&self, shipment_hash: [u8; 32], courier: Address) -> Result<String> {
        let data = abi::encode_call(
            "updateCourier(bytes32,address)",
            &[Token::FixedBytes(shipment_hash), Token::Address(courier)],
        );
        let receipt = self
            .submit(self.shipment_registry, data, GAS_UPDATE_COURIER)
            .await?;
        Ok(receipt.transaction_hash)
    }

    pub async fn confirm_pickup(
        &self,
        shipment_hash: [u8; 32],
        order_id: U256,
        location_hash: [u8; 32],
        claimed_ts: u64,
        courier_signature: &[u8],
        counterparty_signature: &[u8],
    ) -> Result<TxReceipt> {
        let approval = Token::Tuple(vec![
            Token::FixedBytes(shipment_hash),
            Token::Uint(order_id),
            Token::FixedBytes(location_hash),
            Token::Uint(U256::from(claimed_ts)),
        ]);
        let data = abi::encode_call(
            "confirmPickup((bytes32,uint256,bytes32,uint64),bytes,bytes)",
            &[
                approval,
                Token::Bytes(courier_signature.to_vec()),
                Token::Bytes(counterparty_signature.to_vec()),
            ],
        );
        self.submit(self.shipment_registry, data, GAS_CONFIRM_PICKUP)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn confirm_drop(
        &self,
        shipment_hash: [u8; 32],
        order_id: U256,
        location_hash: [u8; 32],
        claimed_ts: u64,
        distance_meters: U256,
        courier_signature: &[u8],
        counterparty_signature: &[u8],
        line_items_json: &str,
        metadata_uri: &str,
    ) -> Result<TxReceipt> {
        let approval = Token::Tuple(vec![
            Token::FixedBytes(shipment_hash),
            Token::Uint(order_id),
            Token::FixedBytes(location_hash),
            Token::Uint(U256::from(claimed_ts)),
            Token::Uint(distance_meters),
        ]);
        let data = abi::encode_call(
            "confirmDrop((bytes32,uint256,bytes32,uint64,uint256),bytes,bytes,string,string)",
            &[
                approval,
                Token::Bytes(courier_signature.to_vec()),
                Token::Bytes(counterparty_signature.to_vec()),
                Token::Str(line_items_json.to_string()),
                Token::Str(metadata_uri.to_string()),
            ],
        );
        self.submit(self.shipment_registry, data, GAS_CONFIRM_DROP)
            .await
    }

    // ---- events ----------------------------------------------------------

    /// Pull `courierReward` out of the `DropApproved` log in a receipt.
    pub fn drop_reward_from_receipt(&self, receipt: &TxReceipt) -> Option<U256> {
        let topic = format!("0x{}", hex::encode(abi::event_topic(DROP_APPROVED_SIG)));
        let registry = self.shipment_registry.to_lower_hex();
        for log in &receipt.logs {
            if !log.address.eq_ignore_ascii_case(&registry) {
                continue;
            }
            if log.topics.first().map(|t| t.eq_ignore_ascii_case(&topic)) != Some(true) {
                continue;
            }
            match decode_milestone_data(MilestoneKind::Drop, &log.data) {
                Ok(event) => return event.courier_reward,
                Err(e) => warn!("undecodable DropApproved log: {}", e),
            }
        }
        None
    }

    /// Look up the milestone event for `(kind, shipment)` across the whole
    /// chain history. Drives the divergence recovery pass.
    pub async fn find_milestone_event(
        &self,
        kind: MilestoneKind,
        shipment_hash: [u8; 32],
    ) -> Result<Option<MilestoneEvent>> {
        let signature = match kind {
            MilestoneKind::Pickup => PICKUP_APPROVED_SIG,
            MilestoneKind::Drop => DROP_APPROVED_SIG,
        };
        let topic = abi::event_topic(signature);
        let logs = self.rpc.logs_by_topic(&self.shipment_registry, &topic).await?;
        for log in logs {
            let mut event = match decode_milestone_data(kind, &log.data) {
                Ok(event) => event,
                Err(e) => {
                    warn!("skipping undecodable {:?} log: {}", kind, e);
                    continue;
                }
            };
            if event.shipment_hash == shipment_hash {
                event.tx_hash = log.transaction_hash;
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    // ---- internals -------------------------------------------------------

    async fn call_view(&self, to: &Address, data: Vec<u8>) -> Result<Vec<[u8; 32]>> {
        let ret = self.rpc.call(to, &data).await?;
        abi::words(&ret)
    }

    /// Sign and send one transaction. The send lock serialises nonce use;
    /// receipt polling happens outside the lock.
    async fn submit(&self, to: Address, data: Vec<u8>, gas: u64) -> Result<TxReceipt> {
        let tx_hash = {
            let _guard = self.send_lock.lock().await;
            let nonce = self.rpc.transaction_count(&self.signer.address()).await?;
            let gas_price = self.rpc.gas_price().await?;
            let tx = LegacyTransaction {
                nonce,
                gas_price,
                gas: U256::from(gas),
                to,
                value: U256::zero(),
                data,
            };
            let raw = self.signer.sign_transaction(&tx)?;
            self.rpc.send_raw_transaction(&raw).await?
        };
        info!("submitted {} to {}", tx_hash, to);
        self.rpc.wait_for_receipt(&tx_hash).await
    }
}

fn first<'a>(words: &'a [[u8; 32]]) -> Result<&'a [u8; 32]> {
    words
        .first()
        .ok_or_else(|| GatewayError::Abi("empty return data".to_string()))
}

fn decode_milestone_data(kind: MilestoneKind, data: &str) -> Result<MilestoneEvent> {
    let raw = crate::rpc::parse_hex_bytes(data)?;
    let words = abi::words(&raw)?;
    let expected = match kind {
        MilestoneKind::Pickup => 4,
        MilestoneKind::Drop => 6,
    };
    if words.len() < expected {
        return Err(GatewayError::Abi(format!(
            "{:?} event has {} words, expected {}",
            kind,
            words.len(),
            expected
        )));
    }
    let claimed = abi::word_to_u256(&words[3]);
    if claimed > U256::from(u64::MAX) {
        return Err(GatewayError::Abi("claimedTs overflows u64".to_string()));
    }
    Ok(MilestoneEvent {
        kind,
        shipment_hash: words[0],
        order_id: abi::word_to_u256(&words[1]),
        location_hash: words[2],
        claimed_ts: claimed.as_u64(),
        distance_meters: (kind == MilestoneKind::Drop).then(|| abi::word_to_u256(&words[4])),
        courier_reward: (kind == MilestoneKind::Drop).then(|| abi::word_to_u256(&words[5])),
        tx_hash: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_hex(words: &[[u8; 32]]) -> String {
        let mut out = String::from("0x");
        for w in words {
            out.push_str(&hex::encode(w));
        }
        out
    }

    fn uint_word(v: u64) -> [u8; 32] {
        let mut w = [0u8; 32];
        w[24..].copy_from_slice(&v.to_be_bytes());
        w
    }

    #[test]
    fn test_decode_drop_event() {
        let shipment = [9u8; 32];
        let location = [7u8; 32];
        let data = word_hex(&[
            shipment,
            uint_word(1_700_000_000_000),
            location,
            uint_word(1_700_000_100),
            uint_word(1_113),
            uint_word(11_130),
        ]);
        let event = decode_milestone_data(MilestoneKind::Drop, &data).unwrap();
        assert_eq!(event.shipment_hash, shipment);
        assert_eq!(event.order_id, U256::from(1_700_000_000_000u64));
        assert_eq!(event.claimed_ts, 1_700_000_100);
        assert_eq!(event.distance_meters, Some(U256::from(1_113)));
        assert_eq!(event.courier_reward, Some(U256::from(11_130)));
    }

    #[test]
    fn test_decode_pickup_event_has_no_reward() {
        let data = word_hex(&[[1u8; 32], uint_word(5), [2u8; 32], uint_word(42)]);
        let event = decode_milestone_data(MilestoneKind::Pickup, &data).unwrap();
        assert_eq!(event.courier_reward, None);
        assert_eq!(event.distance_meters, None);
        assert_eq!(event.claimed_ts, 42);
    }

    #[test]
    fn test_decode_rejects_truncated_data() {
        let data = word_hex(&[[1u8; 32], uint_word(5)]);
        assert!(decode_milestone_data(MilestoneKind::Pickup, &data).is_err());
    }

    #[test]
    fn test_event_topics_differ_by_kind() {
        assert_ne!(
            abi::event_topic(PICKUP_APPROVED_SIG),
            abi::event_topic(DROP_APPROVED_SIG)
        );
    }
}
