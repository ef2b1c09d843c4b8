//! Persisted message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RelayerError;

/// Lifecycle of a queued message
///
/// `Unstarted -> Started -> Broadcasted -> Confirmed`, with `Errored`
/// reachable from every non-terminal state. `Confirmed` and `Errored` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgState {
    Unstarted,
    Started,
    Broadcasted,
    Confirmed,
    Errored,
}

impl MsgState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgState::Unstarted => "unstarted",
            MsgState::Started => "started",
            MsgState::Broadcasted => "broadcasted",
            MsgState::Confirmed => "confirmed",
            MsgState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MsgState::Confirmed | MsgState::Errored)
    }

    /// Whether a row may move from `self` to `next`
    pub fn can_transition_to(&self, next: MsgState) -> bool {
        use MsgState::*;
        matches!(
            (self, next),
            (Unstarted, Started)
                | (Unstarted, Errored)
                | (Started, Broadcasted)
                | (Started, Errored)
                | (Broadcasted, Confirmed)
                | (Broadcasted, Errored)
        )
    }

    /// States in which a row carries a tx hash
    pub fn has_tx_hash(&self) -> bool {
        matches!(self, MsgState::Broadcasted | MsgState::Confirmed)
    }
}

impl fmt::Display for MsgState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsgState {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unstarted" => Ok(MsgState::Unstarted),
            "started" => Ok(MsgState::Started),
            "broadcasted" => Ok(MsgState::Broadcasted),
            "confirmed" => Ok(MsgState::Confirmed),
            "errored" => Ok(MsgState::Errored),
            other => Err(RelayerError::Internal(format!("unknown msg state {}", other))),
        }
    }
}

/// A queued chain message
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub id: i64,
    pub chain_id: String,
    pub contract_id: String,
    pub state: MsgState,
    pub type_url: String,
    pub raw: Vec<u8>,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Msg {
    /// Time since the message was enqueued
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Per-state row counts for one chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgStats {
    pub unstarted: u64,
    pub started: u64,
    pub broadcasted: u64,
    pub confirmed: u64,
    pub errored: u64,
}
