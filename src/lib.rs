//! Cosmos OCR2 relay
//!
//! Durable message queueing and transaction management for Cosmos SDK wasm
//! chains, plus the OCR2 report codec, config digester and contract
//! adapters used by the off-chain reporting plugin.

pub mod chain;
pub mod config;
pub mod error;
pub mod ocr2;
pub mod state;
pub mod telemetry;
pub mod tx;

pub use config::{ChainConfig, DatabaseConfig, Settings};
pub use error::{RelayerError, RelayerResult};
pub use state::{Msg, MsgOrm, MsgState};
pub use tx::{MsgEnqueuer, Txm, TxmConfig};
