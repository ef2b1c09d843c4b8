//! Transaction submission: message codec, gas pricing, signing and the
//! transaction manager that drives queued messages to confirmation

pub mod gas;
pub mod keystore;
pub mod msg;
mod retry;
mod txm;

use async_trait::async_trait;

use crate::error::RelayerResult;

pub use gas::{
    CachingGasPriceEstimator, ClosureGasPriceEstimator, FixedGasPriceEstimator, GasPrices,
    GasPricesEstimator, MustGasPriceEstimator,
};
pub use keystore::{pub_to_addr, AccountSigner, Keystore, KeystoreAdapter};
pub use msg::{AnyMsg, CosmosMsg, MsgExecuteContract, MsgSend};
pub use retry::{Backoff, RetryPolicy};
pub use txm::{Txm, TxmConfig};

/// Queue a message for delivery, returning its store id
#[async_trait]
pub trait MsgEnqueuer: Send + Sync {
    async fn enqueue(&self, contract_id: &str, msg: AnyMsg) -> RelayerResult<i64>;
}
