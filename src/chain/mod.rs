//! Chain client seams: everything the relay needs from a Cosmos node
//!
//! The concrete gRPC/LCD client lives outside this crate. The relay only
//! depends on the [`Reader`] and [`Writer`] traits below.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::RelayerResult;
use crate::tx::{AccountSigner, CosmosMsg};

/// On-chain account numbers needed for signing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Account {
    pub account_number: u64,
    pub sequence: u64,
}

/// Decimal amount of a denom, as used for gas prices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecCoin {
    pub denom: String,
    pub amount: Decimal,
}

impl DecCoin {
    pub fn new(denom: impl Into<String>, amount: Decimal) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
}

impl EventAttribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<EventAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxLog {
    pub events: Vec<Event>,
}

/// Executed transaction as returned by a tx lookup
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxResponse {
    pub tx_hash: String,
    pub height: i64,
    /// Zero on successful execution
    pub code: u32,
    pub raw_log: String,
    pub logs: Vec<TxLog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    Sync,
    Async,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BroadcastResponse {
    pub tx_hash: String,
    pub code: u32,
    pub raw_log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GasInfo {
    pub gas_wanted: u64,
    pub gas_used: u64,
}

/// A stored message handed to the batch simulator, keyed by its row id
#[derive(Debug, Clone, PartialEq)]
pub struct SimMsg {
    pub id: i64,
    pub msg: CosmosMsg,
}

/// Outcome of simulating a set of messages one after another
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSimResults {
    pub succeeded: Vec<SimMsg>,
    pub failed: Vec<SimMsg>,
}

/// Everything needed to build and sign one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedTx {
    pub msgs: Vec<CosmosMsg>,
    pub account_number: u64,
    pub sequence: u64,
    pub gas_limit: u64,
    pub gas_limit_multiplier: f64,
    pub gas_price: DecCoin,
    pub timeout_height: u64,
}

/// Read access to the chain
#[async_trait]
pub trait Reader: Send + Sync {
    async fn account(&self, address: &str) -> RelayerResult<Account>;

    async fn tx(&self, hash: &str) -> RelayerResult<TxResponse>;

    /// Search transactions by event query, e.g. `tx.height=5`
    async fn txs_events(&self, events: &[String]) -> RelayerResult<Vec<TxResponse>>;

    async fn latest_block(&self) -> RelayerResult<u64>;

    /// Raw smart query against a wasm contract
    async fn contract_state(&self, contract: &str, query: &[u8]) -> RelayerResult<Vec<u8>>;
}

/// Simulation, signing and submission
#[async_trait]
pub trait Writer: Send + Sync {
    /// Simulate messages in order, splitting them into those that would
    /// succeed and those that would fail at the given sequence.
    async fn batch_simulate_unsigned(
        &self,
        msgs: Vec<SimMsg>,
        sequence: u64,
    ) -> RelayerResult<BatchSimResults>;

    async fn simulate_unsigned(&self, msgs: &[CosmosMsg], sequence: u64)
        -> RelayerResult<GasInfo>;

    async fn create_and_sign(
        &self,
        unsigned: UnsignedTx,
        signer: AccountSigner,
    ) -> RelayerResult<Vec<u8>>;

    async fn broadcast(
        &self,
        tx_bytes: Vec<u8>,
        mode: BroadcastMode,
    ) -> RelayerResult<BroadcastResponse>;
}

/// Full chain client
pub trait ReaderWriter: Reader + Writer {}

impl<T: Reader + Writer> ReaderWriter for T {}
