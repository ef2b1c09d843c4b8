//! Cosmos messages the relay knows how to queue
//!
//! Protobuf layouts follow `cosmwasm.wasm.v1` and `cosmos.bank.v1beta1`.

use prost::Message;

use crate::error::{RelayerError, RelayerResult};

pub const MSG_EXECUTE_CONTRACT_TYPE_URL: &str = "/cosmwasm.wasm.v1.MsgExecuteContract";
pub const MSG_SEND_TYPE_URL: &str = "/cosmos.bank.v1beta1.MsgSend";

#[derive(Clone, PartialEq, Message)]
pub struct Coin {
    #[prost(string, tag = "1")]
    pub denom: String,
    #[prost(string, tag = "2")]
    pub amount: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct MsgExecuteContract {
    #[prost(string, tag = "1")]
    pub sender: String,
    #[prost(string, tag = "2")]
    pub contract: String,
    /// JSON execute message
    #[prost(bytes = "vec", tag = "3")]
    pub msg: Vec<u8>,
    #[prost(message, repeated, tag = "5")]
    pub funds: Vec<Coin>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MsgSend {
    #[prost(string, tag = "1")]
    pub from_address: String,
    #[prost(string, tag = "2")]
    pub to_address: String,
    #[prost(message, repeated, tag = "3")]
    pub amount: Vec<Coin>,
}

/// Type-tagged encoded message, the form callers enqueue
#[derive(Clone, PartialEq, Message)]
pub struct AnyMsg {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// A decoded message of one of the supported types
#[derive(Debug, Clone, PartialEq)]
pub enum CosmosMsg {
    ExecuteContract(MsgExecuteContract),
    Send(MsgSend),
}

impl CosmosMsg {
    pub fn type_url(&self) -> &'static str {
        match self {
            CosmosMsg::ExecuteContract(_) => MSG_EXECUTE_CONTRACT_TYPE_URL,
            CosmosMsg::Send(_) => MSG_SEND_TYPE_URL,
        }
    }

    /// Address that must sign the message
    pub fn sender(&self) -> &str {
        match self {
            CosmosMsg::ExecuteContract(m) => &m.sender,
            CosmosMsg::Send(m) => &m.from_address,
        }
    }

    /// Protobuf encoding of the inner message
    pub fn encode_raw(&self) -> Vec<u8> {
        match self {
            CosmosMsg::ExecuteContract(m) => m.encode_to_vec(),
            CosmosMsg::Send(m) => m.encode_to_vec(),
        }
    }

    /// Decode a stored message and check its sender address
    pub fn decode(type_url: &str, raw: &[u8]) -> RelayerResult<Self> {
        let msg = match type_url {
            MSG_EXECUTE_CONTRACT_TYPE_URL => CosmosMsg::ExecuteContract(
                MsgExecuteContract::decode(raw)
                    .map_err(|e| RelayerError::InvalidMsg(e.to_string()))?,
            ),
            MSG_SEND_TYPE_URL => CosmosMsg::Send(
                MsgSend::decode(raw).map_err(|e| RelayerError::InvalidMsg(e.to_string()))?,
            ),
            other => {
                return Err(RelayerError::MsgUnsupported {
                    type_url: other.to_string(),
                })
            }
        };

        bech32::decode(msg.sender()).map_err(|e| {
            RelayerError::InvalidMsg(format!("invalid sender {:?}: {}", msg.sender(), e))
        })?;

        Ok(msg)
    }

    pub fn from_any(any: &AnyMsg) -> RelayerResult<Self> {
        Self::decode(&any.type_url, &any.value)
    }

    pub fn to_any(&self) -> AnyMsg {
        AnyMsg {
            type_url: self.type_url().to_string(),
            value: self.encode_raw(),
        }
    }
}

impl From<MsgExecuteContract> for CosmosMsg {
    fn from(m: MsgExecuteContract) -> Self {
        CosmosMsg::ExecuteContract(m)
    }
}

impl From<MsgSend> for CosmosMsg {
    fn from(m: MsgSend) -> Self {
        CosmosMsg::Send(m)
    }
}
