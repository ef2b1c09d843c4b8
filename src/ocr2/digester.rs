//! Config digest for cosmwasm OCR2 contracts

use blake2::{Blake2s256, Digest};

use super::{ChainFamily, ConfigDigest, ContractConfig, OffchainConfigDigester};
use crate::error::{RelayerError, RelayerResult};

/// Digests oracle configs exactly as the on-chain contract does
#[derive(Debug, Clone)]
pub struct CosmwasmConfigDigester {
    chain_id: String,
    contract: String,
}

impl CosmwasmConfigDigester {
    pub fn new(chain_id: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            contract: contract.into(),
        }
    }
}

impl OffchainConfigDigester for CosmwasmConfigDigester {
    fn config_digest(&self, config: &ContractConfig) -> RelayerResult<ConfigDigest> {
        let config_count = u32::try_from(config.config_count).map_err(|_| {
            RelayerError::Codec(format!("config count {} overflows u32", config.config_count))
        })?;
        let signer_count = u8::try_from(config.signers.len()).map_err(|_| {
            RelayerError::Codec(format!("too many signers: {}", config.signers.len()))
        })?;
        let offchain_len = u32::try_from(config.offchain_config.len()).map_err(|_| {
            RelayerError::Codec("offchain config too large".to_string())
        })?;

        let mut hasher = Blake2s256::new();
        hasher.update(self.chain_id.as_bytes());
        hasher.update(self.contract.as_bytes());
        hasher.update(config_count.to_be_bytes());
        hasher.update([signer_count]);
        for signer in &config.signers {
            hasher.update(signer);
        }
        for transmitter in &config.transmitters {
            hasher.update(transmitter.as_bytes());
        }
        hasher.update([config.f]);
        // onchain config is not part of the digest, only its (zero) length
        hasher.update(0u32.to_be_bytes());
        hasher.update(config.offchain_config_version.to_be_bytes());
        hasher.update(offchain_len.to_be_bytes());
        hasher.update(&config.offchain_config);

        let mut digest: [u8; 32] = hasher.finalize().into();
        digest[0] = 0x00;
        digest[1] = self.config_digest_prefix();
        Ok(ConfigDigest(digest))
    }

    fn config_digest_prefix(&self) -> u8 {
        ChainFamily::Cosmwasm.digest_prefix()
    }
}
