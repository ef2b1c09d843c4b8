//! Durable message store
//!
//! Handles:
//! - Message persistence, scoped per chain id
//! - Guarded state transitions (in code and in the schema)
//! - Transactional batches of updates

mod models;
mod orm;

pub use models::{Msg, MsgState, MsgStats};
pub use orm::{MsgOrm, TxOrm};

#[cfg(test)]
pub(crate) use orm::test_orm;
