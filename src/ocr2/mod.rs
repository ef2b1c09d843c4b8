//! OCR2 adapter for cosmwasm contracts
//!
//! Report encoding, config digests, and the contract-facing reader,
//! cache and transmitter used by the off-chain reporting plugin.

pub mod cache;
pub mod digester;
pub mod reader;
pub mod report;
pub mod signed_int;
pub mod transmitter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RelayerError, RelayerResult};

pub use cache::ContractCache;
pub use digester::CosmwasmConfigDigester;
pub use reader::{parse_attributes, OCR2Reader};
pub use report::MedianReportCodec;
pub use transmitter::CosmwasmTransmitter;

/// 32-byte fingerprint of an oracle configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigDigest(pub [u8; 32]);

impl ConfigDigest {
    pub fn from_slice(bytes: &[u8]) -> RelayerResult<Self> {
        let digest: [u8; 32] = bytes.try_into().map_err(|_| {
            RelayerError::Codec(format!(
                "cannot convert bytes to ConfigDigest. bytes have wrong length {}",
                bytes.len()
            ))
        })?;
        Ok(Self(digest))
    }

    pub fn from_hex(s: &str) -> RelayerResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| RelayerError::Codec(format!("invalid config digest {}: {}", s, e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Chain families a contract adapter can target. The discriminator picks
/// the adapter at construction time and stamps the config digest prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Cosmwasm,
}

impl ChainFamily {
    /// Second byte of every config digest produced for this family
    pub fn digest_prefix(&self) -> u8 {
        match self {
            ChainFamily::Cosmwasm => 2,
        }
    }
}

/// Oracle configuration as set on the contract
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractConfig {
    pub config_digest: ConfigDigest,
    pub config_count: u64,
    pub signers: Vec<Vec<u8>>,
    pub transmitters: Vec<String>,
    pub f: u8,
    pub onchain_config: Vec<u8>,
    pub offchain_config_version: u64,
    pub offchain_config: Vec<u8>,
}

/// Latest accepted report as recorded by the contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmissionDetails {
    pub config_digest: ConfigDigest,
    pub epoch: u32,
    pub round: u8,
    pub latest_answer: BigInt,
    pub latest_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportContext {
    pub config_digest: ConfigDigest,
    pub epoch: u32,
    pub round: u8,
    pub extra_hash: [u8; 32],
}

/// One oracle's observation after parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAttributedObservation {
    pub timestamp: u32,
    pub value: BigInt,
    pub juels_per_fee_coin: BigInt,
    pub observer: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributedOnchainSignature {
    pub signature: Vec<u8>,
    pub signer: u8,
}

/// Source of the contract's current configuration
#[async_trait]
pub trait ContractConfigTracker: Send + Sync {
    /// Block the config was last changed in, and its digest
    async fn latest_config_details(&self) -> RelayerResult<(u64, ConfigDigest)>;

    async fn latest_config(&self, changed_in_block: u64) -> RelayerResult<ContractConfig>;

    async fn latest_block_height(&self) -> RelayerResult<u64>;
}

#[async_trait]
pub trait ContractTransmitter: Send + Sync {
    async fn transmit(
        &self,
        report_context: &ReportContext,
        report: &[u8],
        signatures: &[AttributedOnchainSignature],
    ) -> RelayerResult<()>;

    async fn latest_config_digest_and_epoch(&self) -> RelayerResult<(ConfigDigest, u32)>;

    fn from_account(&self) -> String;
}

#[async_trait]
pub trait MedianContract: Send + Sync {
    async fn latest_transmission_details(&self) -> RelayerResult<TransmissionDetails>;

    /// Digest, epoch and round of the latest round requested
    async fn latest_round_requested(&self) -> RelayerResult<(ConfigDigest, u32, u8)>;
}

pub trait OffchainConfigDigester: Send + Sync {
    fn config_digest(&self, config: &ContractConfig) -> RelayerResult<ConfigDigest>;

    fn config_digest_prefix(&self) -> u8;
}

pub trait ReportCodec: Send + Sync {
    fn build_report(&self, observations: &[ParsedAttributedObservation]) -> RelayerResult<Vec<u8>>;

    fn median_from_report(&self, report: &[u8]) -> RelayerResult<BigInt>;

    fn max_report_length(&self, n: usize) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_digest_from_hex() {
        let digest = ConfigDigest::from_hex(
            "7465737420636f6e66696720646967657374203332206368617273206c6f6e67",
        )
        .unwrap();
        assert_eq!(digest.as_bytes(), b"test config digest 32 chars long");
        assert_eq!(
            digest.to_string(),
            "7465737420636f6e66696720646967657374203332206368617273206c6f6e67"
        );

        let err = ConfigDigest::from_hex("7465737420636f6e6669672064").unwrap_err();
        assert!(err.to_string().contains("bytes have wrong length"));
    }

    #[test]
    fn test_config_digest_json_is_byte_array() {
        let digest: ConfigDigest = serde_json::from_str(&format!("{:?}", [7u8; 32])).unwrap();
        assert_eq!(digest, ConfigDigest([7u8; 32]));
    }
}
