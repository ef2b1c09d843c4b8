//! Direct reads of OCR2 contract state

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{TimeZone, Utc};
use num_bigint::BigInt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use super::{ConfigDigest, ContractConfig, TransmissionDetails};
use crate::chain::{EventAttribute, Reader};
use crate::error::{RelayerError, RelayerResult};

const SET_CONFIG_EVENT: &str = "wasm-set_config";
const TRANSMISSION_NOT_FOUND: &str = "ocr2::state::Transmission not found";
const KNOWN_KEYS: usize = 8;

#[derive(Debug, Deserialize)]
struct ConfigDetails {
    block_number: u64,
    config_digest: ConfigDigest,
}

#[derive(Debug, Deserialize)]
struct LatestTransmissionDetails {
    latest_config_digest: ConfigDigest,
    epoch: u32,
    round: u8,
    latest_answer: String,
    latest_timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct LatestConfigDigestAndEpoch {
    config_digest: ConfigDigest,
    epoch: u32,
}

/// Reads config and transmission state of one OCR2 contract
#[derive(Clone)]
pub struct OCR2Reader {
    address: String,
    reader: Arc<dyn Reader>,
}

impl OCR2Reader {
    pub fn new(address: impl Into<String>, reader: Arc<dyn Reader>) -> Self {
        Self {
            address: address.into(),
            reader,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn query<T: DeserializeOwned>(&self, name: &str) -> RelayerResult<T> {
        let query = serde_json::to_vec(name)
            .map_err(|e| RelayerError::Codec(format!("failed to encode query {}: {}", name, e)))?;
        let resp = self.reader.contract_state(&self.address, &query).await?;
        serde_json::from_slice(&resp)
            .map_err(|e| RelayerError::Codec(format!("failed to decode {} response: {}", name, e)))
    }

    /// Block of the last config change and the digest it produced
    pub async fn latest_config_details(&self) -> RelayerResult<(u64, ConfigDigest)> {
        let details: ConfigDetails = self.query("latest_config_details").await?;
        Ok((details.block_number, details.config_digest))
    }

    /// Config from the set_config event emitted in `changed_in_block`
    pub async fn latest_config(&self, changed_in_block: u64) -> RelayerResult<ContractConfig> {
        let query = vec![
            format!("tx.height={}", changed_in_block),
            format!("{}.contract_address='{}'", SET_CONFIG_EVENT, self.address),
        ];
        let txs = self.reader.txs_events(&query).await?;

        let tx = txs.first().ok_or_else(|| {
            RelayerError::chain(
                "latest config",
                format!("No transactions found for block {}, query {:?}", changed_in_block, query),
            )
        })?;
        let log = tx.logs.first().ok_or_else(|| {
            RelayerError::chain(
                "latest config",
                format!("No logs found for tx {}, query {:?}", tx.tx_hash, query),
            )
        })?;
        if log.events.is_empty() {
            return Err(RelayerError::chain(
                "latest config",
                format!("No events found for tx {}, query {:?}", tx.tx_hash, query),
            ));
        }

        let event = log
            .events
            .iter()
            .find(|e| e.kind == SET_CONFIG_EVENT)
            .ok_or_else(|| {
                RelayerError::chain(
                    "latest config",
                    format!("No set_config event found for tx {}", tx.tx_hash),
                )
            })?;

        let (config, unknown) = parse_attributes(&event.attributes)?;
        if !unknown.is_empty() {
            info!(
                "Ignoring unknown set_config attributes {:?} of contract {}",
                unknown, self.address
            );
        }
        Ok(config)
    }

    /// Latest transmission, or the current digest and epoch with a zero
    /// answer when nothing has been transmitted yet
    pub async fn latest_transmission_details(&self) -> RelayerResult<TransmissionDetails> {
        match self
            .query::<LatestTransmissionDetails>("latest_transmission_details")
            .await
        {
            Ok(details) => {
                let latest_answer: BigInt = details.latest_answer.parse().map_err(|_| {
                    RelayerError::Codec(format!(
                        "Could not create BigInt from {}",
                        details.latest_answer
                    ))
                })?;
                let latest_timestamp = Utc
                    .timestamp_opt(details.latest_timestamp, 0)
                    .single()
                    .ok_or_else(|| {
                        RelayerError::Codec(format!(
                            "invalid latest timestamp {}",
                            details.latest_timestamp
                        ))
                    })?;
                Ok(TransmissionDetails {
                    config_digest: details.latest_config_digest,
                    epoch: details.epoch,
                    round: details.round,
                    latest_answer,
                    latest_timestamp,
                })
            }
            Err(e) if e.to_string().contains(TRANSMISSION_NOT_FOUND) => {
                info!(
                    "No transmissions found when fetching `latest_transmission_details` attempting with `latest_config_digest_and_epoch`"
                );
                match self.latest_config_digest_and_epoch().await {
                    Ok((config_digest, epoch)) => {
                        if epoch != 0 {
                            error!(
                                "Unexpected non-zero epoch {} and no transmissions found for contract {}",
                                epoch, self.address
                            );
                        }
                        Ok(TransmissionDetails {
                            config_digest,
                            epoch,
                            round: 0,
                            latest_answer: BigInt::from(0),
                            latest_timestamp: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
                        })
                    }
                    Err(e2) => {
                        error!(
                            "Error reading latest config digest and epoch of contract {}: {}",
                            self.address, e2
                        );
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn latest_config_digest_and_epoch(&self) -> RelayerResult<(ConfigDigest, u32)> {
        let resp: LatestConfigDigestAndEpoch = self.query("latest_config_digest_and_epoch").await?;
        Ok((resp.config_digest, resp.epoch))
    }

    pub async fn latest_block_height(&self) -> RelayerResult<u64> {
        self.reader.latest_block().await
    }
}

/// Build a contract config from set_config event attributes. Returns the
/// config and a count of every attribute key it did not recognise.
pub fn parse_attributes(
    attrs: &[EventAttribute],
) -> RelayerResult<(ContractConfig, HashMap<String, usize>)> {
    let mut config = ContractConfig::default();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut unknown: HashMap<String, usize> = HashMap::new();

    for attr in attrs {
        let key = attr.key.as_str();
        let value = attr.value.as_str();

        let repeatable = matches!(key, "signers" | "transmitters");
        let known = match key {
            "config_count" => {
                config.config_count = parse_number(key, value)?;
                true
            }
            "f" => {
                config.f = parse_number(key, value)?;
                true
            }
            "latest_config_digest" => {
                config.config_digest = ConfigDigest::from_hex(value)?;
                true
            }
            "offchain_config" => {
                config.offchain_config = decode_base64(key, value)?;
                true
            }
            "offchain_config_version" => {
                config.offchain_config_version = parse_number(key, value)?;
                true
            }
            "onchain_config" => {
                config.onchain_config = decode_base64(key, value)?;
                true
            }
            "signers" => {
                let signer = hex::decode(value).map_err(|e| {
                    RelayerError::Codec(format!("invalid signer {}: {}", value, e))
                })?;
                config.signers.push(signer);
                true
            }
            "transmitters" => {
                config.transmitters.push(value.to_string());
                true
            }
            _ => false,
        };

        if !known {
            *unknown.entry(key.to_string()).or_default() += 1;
            continue;
        }
        let count = seen.entry(key).or_default();
        *count += 1;
        if *count > 1 && !repeatable {
            return Err(RelayerError::Codec(format!("duplicate attribute {}", key)));
        }
    }

    if seen.len() != KNOWN_KEYS {
        return Err(RelayerError::Codec(format!(
            "expected {} types of known keys, but found {}: {:?}",
            KNOWN_KEYS,
            seen.len(),
            seen.keys().collect::<Vec<_>>()
        )));
    }
    Ok((config, unknown))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> RelayerResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| RelayerError::Codec(format!("invalid {} {:?}: {}", key, value, e)))
}

fn decode_base64(key: &str, value: &str) -> RelayerResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| RelayerError::Codec(format!("invalid {} {:?}: {}", key, value, e)))
}
