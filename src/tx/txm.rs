//! Transaction manager
//!
//! Every poll tick first re-confirms transactions left broadcasted, then
//! builds the next batch: at most one new message per sender, simulated,
//! signed into one transaction per sender, broadcast and confirmed.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use rust_decimal::Decimal;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::gas::{FixedGasPriceEstimator, GasPricesEstimator};
use super::keystore::{AccountSigner, KeystoreAdapter};
use super::msg::{AnyMsg, CosmosMsg};
use super::retry::RetryPolicy;
use super::MsgEnqueuer;
use crate::chain::{BroadcastMode, DecCoin, ReaderWriter, SimMsg, UnsignedTx};
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{Msg, MsgOrm, MsgState};

/// Transaction manager settings
#[derive(Debug, Clone)]
pub struct TxmConfig {
    pub gas_token: String,
    pub gas_limit_multiplier: f64,
    pub max_gas_price: Option<Decimal>,
    pub max_msgs_per_batch: i64,
    pub block_rate: Duration,
    pub blocks_until_tx_timeout: i64,
    pub tx_msg_timeout: Duration,
    pub confirm_retry: RetryPolicy,
    pub close_timeout: Duration,
}

impl From<&ChainConfig> for TxmConfig {
    fn from(cfg: &ChainConfig) -> Self {
        Self {
            gas_token: cfg.gas_token.clone(),
            gas_limit_multiplier: cfg.gas_limit_multiplier,
            max_gas_price: cfg.max_gas_price,
            max_msgs_per_batch: cfg.max_msgs_per_batch,
            block_rate: cfg.block_rate(),
            blocks_until_tx_timeout: cfg.blocks_until_tx_timeout,
            tx_msg_timeout: cfg.tx_msg_timeout(),
            confirm_retry: cfg.confirm_retry_policy(),
            close_timeout: cfg.close_timeout(),
        }
    }
}

/// A loaded message together with its decoded form
struct PendingMsg {
    msg: Msg,
    decoded: CosmosMsg,
}

#[derive(Default)]
struct SenderMsgs {
    started: Vec<PendingMsg>,
    unstarted: Vec<PendingMsg>,
}

/// Messages of one sender that go out in a single transaction
struct SenderBatch {
    sender: String,
    signer: AccountSigner,
    msgs: Vec<PendingMsg>,
}

#[derive(Default)]
struct Lifecycle {
    closed: bool,
    stop: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

/// Transaction manager for one chain
pub struct Txm {
    cfg: TxmConfig,
    orm: MsgOrm,
    client: Arc<dyn ReaderWriter>,
    keystore: Arc<KeystoreAdapter>,
    gas_prices: Arc<dyn GasPricesEstimator>,
    lifecycle: Mutex<Lifecycle>,
}

impl Txm {
    pub fn new(
        cfg: TxmConfig,
        orm: MsgOrm,
        client: Arc<dyn ReaderWriter>,
        keystore: Arc<KeystoreAdapter>,
        gas_prices: Arc<dyn GasPricesEstimator>,
    ) -> Self {
        Self {
            cfg,
            orm,
            client,
            keystore,
            gas_prices,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Spawn the poll loop. Starting a running manager is a no-op.
    pub async fn start(self: &Arc<Self>) -> RelayerResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.closed {
            return Err(RelayerError::Internal(
                "transaction manager already closed".to_string(),
            ));
        }
        if lifecycle.handle.is_some() {
            debug!("Transaction manager already started");
            return Ok(());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let this = self.clone();
        lifecycle.handle = Some(tokio::spawn(async move { this.run(stop_rx).await }));
        lifecycle.stop = Some(stop_tx);

        info!("Transaction manager started for chain {}", self.orm.chain_id());
        Ok(())
    }

    /// Stop the poll loop and wait, bounded by `close_timeout`, for the
    /// cycle in progress to finish. Closing twice is a no-op.
    pub async fn close(&self) -> RelayerResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.closed = true;

        let Some(handle) = lifecycle.handle.take() else {
            return Ok(());
        };
        if let Some(stop) = lifecycle.stop.take() {
            let _ = stop.send(true);
        }

        match tokio::time::timeout(self.cfg.close_timeout, handle).await {
            Ok(Ok(())) => {
                info!("Transaction manager stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(RelayerError::Internal(format!("poll loop task failed: {}", e))),
            Err(_) => {
                warn!(
                    "Transaction manager did not stop within {:?}",
                    self.cfg.close_timeout
                );
                Err(RelayerError::Timeout {
                    operation: "transaction manager close".to_string(),
                })
            }
        }
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut poll = interval(self.cfg.block_rate);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = poll.tick() => self.poll_cycle().await,
            }
        }

        debug!("Transaction manager poll loop exited");
    }

    /// One tick of the poll loop. Errors and estimator panics end the
    /// cycle and are logged; the loop keeps going.
    pub async fn poll_cycle(&self) {
        match AssertUnwindSafe(self.confirm_any_unconfirmed())
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Error confirming unconfirmed msgs: {}", e),
            Err(panic) => error!("Confirmation sweep panicked: {}", panic_message(&*panic)),
        }

        match AssertUnwindSafe(self.send_msg_batch()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Error sending msg batch: {}", e),
            Err(panic) => error!("Msg batch cycle panicked: {}", panic_message(&*panic)),
        }
    }

    /// Validate and persist a message for delivery
    pub async fn enqueue(&self, contract_id: &str, msg: AnyMsg) -> RelayerResult<i64> {
        let decoded = CosmosMsg::from_any(&msg)?;
        let raw = decoded.encode_raw();

        let id = self
            .orm
            .insert_msg(contract_id, decoded.type_url(), &raw)
            .await?;
        debug!(
            "Enqueued msg {} ({}) for contract {} from {}",
            id,
            decoded.type_url(),
            contract_id,
            decoded.sender()
        );
        Ok(id)
    }

    /// Build, broadcast and confirm the next batch
    pub async fn send_msg_batch(&self) -> RelayerResult<()> {
        let limit = self.cfg.max_msgs_per_batch;
        let leftover = self.orm.get_msgs_state(MsgState::Started, limit).await?;
        let unstarted = self.orm.get_msgs_state(MsgState::Unstarted, limit).await?;
        if leftover.is_empty() && unstarted.is_empty() {
            return Ok(());
        }
        if !leftover.is_empty() {
            info!("Retrying {} msgs left started by a previous cycle", leftover.len());
        }

        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.cfg.tx_msg_timeout)
            .map_err(|e| RelayerError::Config(format!("invalid tx_msg_timeout: {}", e)))?;

        let mut expired = Vec::new();
        let mut undecodable = Vec::new();
        let mut by_sender: BTreeMap<String, SenderMsgs> = BTreeMap::new();
        for msg in leftover.into_iter().chain(unstarted) {
            if msg.age(now) > timeout {
                expired.push(msg.id);
                continue;
            }
            match CosmosMsg::decode(&msg.type_url, &msg.raw) {
                Ok(decoded) => {
                    let entry = by_sender.entry(decoded.sender().to_string()).or_default();
                    let pending = PendingMsg { msg, decoded };
                    if pending.msg.state == MsgState::Started {
                        entry.started.push(pending);
                    } else {
                        entry.unstarted.push(pending);
                    }
                }
                Err(e) => {
                    error!("Failed to decode msg {}: {}", msg.id, e);
                    undecodable.push(msg.id);
                }
            }
        }

        if !expired.is_empty() {
            warn!(
                "Expiring msgs {:?}: not sent within {:?}",
                expired, self.cfg.tx_msg_timeout
            );
            self.orm.update_msgs(&expired, MsgState::Errored, None).await?;
        }
        if !undecodable.is_empty() {
            self.orm.update_msgs(&undecodable, MsgState::Errored, None).await?;
        }

        let mut batches = Vec::new();
        let mut to_start = Vec::new();
        let mut unsignable = Vec::new();
        for (sender, msgs) in by_sender {
            let mut candidates = msgs.started;
            let mut unstarted = msgs.unstarted.into_iter();
            let next = unstarted.next();
            let deferred = unstarted.len();
            if deferred > 0 {
                debug!("Deferring {} msgs from {} to later cycles", deferred, sender);
            }

            let signer = match self.keystore.signer(&sender).await {
                Ok(signer) => signer,
                Err(e) => {
                    error!("No signing key for sender {}: {}", sender, e);
                    unsignable.extend(candidates.iter().map(|m| m.msg.id));
                    unsignable.extend(next.iter().map(|m| m.msg.id));
                    continue;
                }
            };

            if let Some(next) = next {
                to_start.push(next.msg.id);
                candidates.push(next);
            }
            if !candidates.is_empty() {
                batches.push(SenderBatch {
                    sender,
                    signer,
                    msgs: candidates,
                });
            }
        }

        if !unsignable.is_empty() {
            self.orm.update_msgs(&unsignable, MsgState::Errored, None).await?;
        }
        if batches.is_empty() {
            return Ok(());
        }
        self.orm.update_msgs(&to_start, MsgState::Started, None).await?;

        let prices = self.gas_prices.gas_prices().await?;
        let gas_price = prices.get(&self.cfg.gas_token).cloned().ok_or_else(|| {
            RelayerError::GasPrice(format!("no gas price for {}", self.cfg.gas_token))
        })?;
        let gas_price = self.capped_gas_price(gas_price);

        let gas_price = &gas_price;
        join_all(batches.into_iter().map(|batch| async move {
            let sender = batch.sender.clone();
            if let Err(e) = self.send_sender_batch(batch, gas_price).await {
                error!("Failed to send batch for sender {}: {}", sender, e);
            }
        }))
        .await;

        Ok(())
    }

    fn capped_gas_price(&self, estimated: DecCoin) -> DecCoin {
        let Some(max) = self.cfg.max_gas_price else {
            return estimated;
        };
        let cap = DecCoin::new(&self.cfg.gas_token, max);
        let price =
            FixedGasPriceEstimator::calculate_gas_price(&self.cfg.gas_token, &cap, &estimated, &cap);
        if price.amount < estimated.amount {
            warn!(
                "Estimated gas price {} {} is above the max, using {}",
                estimated.amount, estimated.denom, price.amount
            );
        }
        price
    }

    /// Simulate, sign, broadcast and confirm one sender's batch. Errors
    /// returned here leave the msgs started for the next cycle.
    async fn send_sender_batch(&self, batch: SenderBatch, gas_price: &DecCoin) -> RelayerResult<()> {
        let SenderBatch {
            sender,
            signer,
            msgs,
        } = batch;
        let ids: Vec<i64> = msgs.iter().map(|m| m.msg.id).collect();

        let account = self.client.account(&sender).await?;
        let sim_msgs = msgs
            .iter()
            .map(|m| SimMsg {
                id: m.msg.id,
                msg: m.decoded.clone(),
            })
            .collect();
        let sim = self
            .client
            .batch_simulate_unsigned(sim_msgs, account.sequence)
            .await?;

        // A failure invalidates the sequence for every other msg of this sender
        let succeeded: HashSet<i64> = sim.succeeded.iter().map(|m| m.id).collect();
        let failed: Vec<i64> = ids.iter().copied().filter(|id| !succeeded.contains(id)).collect();
        if !failed.is_empty() {
            for id in &failed {
                warn!("Simulation failed for msg {} from {}", id, sender);
            }
            self.orm.update_msgs(&failed, MsgState::Errored, None).await?;

            let cancelled: Vec<i64> = ids.iter().copied().filter(|id| succeeded.contains(id)).collect();
            if !cancelled.is_empty() {
                warn!(
                    "Cancelled msgs {:?} from {}: batched with a failed msg from the same sender",
                    cancelled, sender
                );
                self.orm.update_msgs(&cancelled, MsgState::Errored, None).await?;
            }
            return Ok(());
        }

        let to_send: Vec<CosmosMsg> = msgs.into_iter().map(|m| m.decoded).collect();
        let gas = match self.client.simulate_unsigned(&to_send, account.sequence).await {
            Ok(gas) => gas,
            Err(e) => {
                error!("Failed to simulate msgs {:?} from {}: {}", ids, sender, e);
                self.orm.update_msgs(&ids, MsgState::Errored, None).await?;
                return Ok(());
            }
        };

        let height = self.client.latest_block().await?;
        let unsigned = UnsignedTx {
            msgs: to_send,
            account_number: account.account_number,
            sequence: account.sequence,
            gas_limit: gas.gas_used,
            gas_limit_multiplier: self.cfg.gas_limit_multiplier,
            gas_price: gas_price.clone(),
            timeout_height: height + self.cfg.blocks_until_tx_timeout as u64,
        };

        let tx_bytes = match self.client.create_and_sign(unsigned, signer).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to sign msgs {:?} from {}: {}", ids, sender, e);
                self.orm.update_msgs(&ids, MsgState::Errored, None).await?;
                return Ok(());
            }
        };

        let tx_hash = match self.broadcast(tx_bytes, ids.clone()).await {
            Ok(hash) => hash,
            Err(e) => {
                error!("Failed to broadcast msgs {:?} from {}: {}", ids, sender, e);
                self.orm.update_msgs(&ids, MsgState::Errored, None).await?;
                return Ok(());
            }
        };
        info!(
            "Broadcast tx {} with {} msgs from {} (sequence {})",
            tx_hash,
            ids.len(),
            sender,
            account.sequence
        );

        self.confirm_tx(&tx_hash, &ids).await
    }

    /// Broadcast and mark the msgs broadcasted in one database transaction
    async fn broadcast(&self, tx_bytes: Vec<u8>, ids: Vec<i64>) -> RelayerResult<String> {
        let client = self.client.clone();
        self.orm
            .transaction(move |tx| {
                Box::pin(async move {
                    let resp = client.broadcast(tx_bytes, BroadcastMode::Sync).await?;
                    if resp.code != 0 {
                        return Err(RelayerError::chain(
                            "broadcast",
                            format!(
                                "tx {} rejected with code {}: {}",
                                resp.tx_hash, resp.code, resp.raw_log
                            ),
                        ));
                    }
                    tx.update_msgs(&ids, MsgState::Broadcasted, Some(&resp.tx_hash))
                        .await?;
                    Ok(resp.tx_hash)
                })
            })
            .await
    }

    /// Poll for the tx until it is found or the retry policy gives up
    pub async fn confirm_tx(&self, tx_hash: &str, ids: &[i64]) -> RelayerResult<()> {
        let result = self
            .cfg
            .confirm_retry
            .retry("confirm tx", move |_| self.client.tx(tx_hash))
            .await;

        match result {
            Ok(resp) if resp.code == 0 => {
                info!(
                    "Confirmed tx {} at height {} ({} msgs)",
                    tx_hash,
                    resp.height,
                    ids.len()
                );
                self.orm.update_msgs(ids, MsgState::Confirmed, None).await
            }
            Ok(resp) => {
                error!(
                    "Tx {} failed on chain with code {}: {}",
                    tx_hash, resp.code, resp.raw_log
                );
                self.orm.update_msgs(ids, MsgState::Errored, None).await
            }
            Err(e) => {
                error!(
                    "Failed to confirm tx {} after {} attempts: {}",
                    tx_hash, self.cfg.confirm_retry.max_attempts, e
                );
                self.orm.update_msgs(ids, MsgState::Errored, None).await
            }
        }
    }

    /// Confirm messages left broadcasted, e.g. by a restart. Txs of one
    /// sender are confirmed in order, different senders concurrently.
    pub async fn confirm_any_unconfirmed(&self) -> RelayerResult<()> {
        let broadcasted = self
            .orm
            .get_msgs_state(MsgState::Broadcasted, self.cfg.max_msgs_per_batch)
            .await?;
        if broadcasted.is_empty() {
            return Ok(());
        }

        // sender -> [(tx hash, ids)], oldest first
        let mut by_sender: BTreeMap<String, Vec<(String, Vec<i64>)>> = BTreeMap::new();
        for msg in broadcasted {
            let Some(tx_hash) = msg.tx_hash.clone() else {
                continue;
            };
            let sender = CosmosMsg::decode(&msg.type_url, &msg.raw)
                .map(|m| m.sender().to_string())
                .unwrap_or_default();

            let txs = by_sender.entry(sender).or_default();
            match txs.iter_mut().find(|(hash, _)| *hash == tx_hash) {
                Some((_, ids)) => ids.push(msg.id),
                None => txs.push((tx_hash, vec![msg.id])),
            }
        }

        info!(
            "Confirming unconfirmed txs for {} senders",
            by_sender.len()
        );
        join_all(by_sender.into_values().map(|txs| async move {
            for (tx_hash, ids) in txs {
                if let Err(e) = self.confirm_tx(&tx_hash, &ids).await {
                    error!("Failed to record confirmation of tx {}: {}", tx_hash, e);
                }
            }
        }))
        .await;

        Ok(())
    }
}

#[async_trait]
impl MsgEnqueuer for Txm {
    async fn enqueue(&self, contract_id: &str, msg: AnyMsg) -> RelayerResult<i64> {
        Txm::enqueue(self, contract_id, msg).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
