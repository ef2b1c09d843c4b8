//! Polling cache over an OCR2 contract's config and transmission state

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::reader::OCR2Reader;
use super::{ConfigDigest, ContractConfig, ContractConfigTracker, MedianContract, TransmissionDetails};
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};

#[derive(Default)]
struct CachedConfig {
    updated_at: Option<Instant>,
    block: u64,
    config: ContractConfig,
}

#[derive(Default)]
struct CachedTransmission {
    updated_at: Option<Instant>,
    details: Option<TransmissionDetails>,
}

#[derive(Default)]
struct Lifecycle {
    stop: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

/// Serves contract state to the reporting plugin from memory, refreshed in
/// the background every poll period. Values older than the TTL are refused.
pub struct ContractCache {
    reader: OCR2Reader,
    poll_period: Duration,
    ttl: Duration,
    close_timeout: Duration,
    config: RwLock<CachedConfig>,
    transmission: RwLock<CachedTransmission>,
    lifecycle: Mutex<Lifecycle>,
}

impl ContractCache {
    pub fn new(reader: OCR2Reader, cfg: &ChainConfig) -> Self {
        Self::with_periods(
            reader,
            cfg.ocr2_cache_poll_period(),
            cfg.ocr2_cache_ttl(),
            cfg.close_timeout(),
        )
    }

    pub fn with_periods(
        reader: OCR2Reader,
        poll_period: Duration,
        ttl: Duration,
        close_timeout: Duration,
    ) -> Self {
        Self {
            reader,
            poll_period,
            ttl,
            close_timeout,
            config: RwLock::new(CachedConfig::default()),
            transmission: RwLock::new(CachedTransmission::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub async fn start(self: &Arc<Self>) -> RelayerResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.handle.is_some() {
            return Ok(());
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let this = self.clone();
        lifecycle.handle = Some(tokio::spawn(async move {
            let mut poll = interval(this.poll_period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = poll.tick() => {
                        if let Err(e) = this.refresh().await {
                            error!("Failed to refresh contract cache for {}: {}", this.reader.address(), e);
                        }
                    }
                }
            }
        }));
        lifecycle.stop = Some(stop_tx);

        info!("Contract cache started for {}", self.reader.address());
        Ok(())
    }

    pub async fn close(&self) -> RelayerResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(handle) = lifecycle.handle.take() else {
            return Ok(());
        };
        if let Some(stop) = lifecycle.stop.take() {
            let _ = stop.send(true);
        }

        // the chain client may not honour cancellation, so don't wait forever
        if tokio::time::timeout(self.close_timeout, handle).await.is_err() {
            debug!("Contract cache poll loop still busy after {:?}", self.close_timeout);
        }
        Ok(())
    }

    /// Refresh config and transmission details concurrently
    pub async fn refresh(&self) -> RelayerResult<()> {
        let (config, transmission) = tokio::join!(self.update_config(), self.update_transmission());

        let errors: Vec<String> = [
            config.err().map(|e| format!("config: {}", e)),
            transmission.err().map(|e| format!("transmission: {}", e)),
        ]
        .into_iter()
        .flatten()
        .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RelayerError::Cache(errors.join("; ")))
        }
    }

    async fn update_config(&self) -> RelayerResult<()> {
        let (changed_in_block, digest) = self.reader.latest_config_details().await?;

        {
            let mut cached = self.config.write().await;
            if cached.updated_at.is_some()
                && cached.block == changed_in_block
                && cached.config.config_digest == digest
            {
                cached.updated_at = Some(Instant::now());
                return Ok(());
            }
        }

        let config = self.reader.latest_config(changed_in_block).await?;
        info!(
            "Contract {} config changed in block {}: digest {}",
            self.reader.address(),
            changed_in_block,
            config.config_digest
        );

        let mut cached = self.config.write().await;
        cached.updated_at = Some(Instant::now());
        cached.block = changed_in_block;
        cached.config = config;
        Ok(())
    }

    async fn update_transmission(&self) -> RelayerResult<()> {
        let details = self.reader.latest_transmission_details().await?;

        let mut cached = self.transmission.write().await;
        cached.updated_at = Some(Instant::now());
        cached.details = Some(details);
        Ok(())
    }

    fn check_age(&self, updated_at: Option<Instant>) -> RelayerResult<()> {
        match updated_at {
            None => Err(RelayerError::Cache("contract cache not yet initialized".to_string())),
            Some(ts) => {
                let since = ts.elapsed();
                if since > self.ttl {
                    Err(RelayerError::Cache(format!(
                        "contract cache expired: value cached {:?} ago",
                        since
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn cached_transmission(&self) -> RelayerResult<TransmissionDetails> {
        let cached = self.transmission.read().await;
        self.check_age(cached.updated_at)?;
        cached
            .details
            .clone()
            .ok_or_else(|| RelayerError::Cache("contract cache not yet initialized".to_string()))
    }
}

#[async_trait]
impl ContractConfigTracker for ContractCache {
    async fn latest_config_details(&self) -> RelayerResult<(u64, ConfigDigest)> {
        let cached = self.config.read().await;
        self.check_age(cached.updated_at)?;
        Ok((cached.block, cached.config.config_digest))
    }

    async fn latest_config(&self, changed_in_block: u64) -> RelayerResult<ContractConfig> {
        let cached = self.config.read().await;
        self.check_age(cached.updated_at)?;
        if cached.block != changed_in_block {
            return Err(RelayerError::Cache(format!(
                "failed to get config from {}: latest config in cache is from {}",
                changed_in_block, cached.block
            )));
        }
        Ok(cached.config.clone())
    }

    async fn latest_block_height(&self) -> RelayerResult<u64> {
        self.reader.latest_block_height().await
    }
}

#[async_trait]
impl MedianContract for ContractCache {
    async fn latest_transmission_details(&self) -> RelayerResult<TransmissionDetails> {
        self.cached_transmission().await
    }

    async fn latest_round_requested(&self) -> RelayerResult<(ConfigDigest, u32, u8)> {
        let details = self.cached_transmission().await?;
        Ok((details.config_digest, details.epoch, details.round))
    }
}
