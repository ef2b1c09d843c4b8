//! Median report codec
//!
//! Layout: `[4 timestamp][32 observers][1 count][count × 16 observation][16 juels per fee coin]`,
//! all integers big-endian, observations signed.

use num_bigint::BigInt;

use super::signed_int::{to_bytes, to_int, to_unsigned_bytes};
use super::{ParsedAttributedObservation, ReportCodec};
use crate::error::{RelayerError, RelayerResult};

pub const TIMESTAMP_SIZE_BYTES: usize = 4;
pub const OBSERVERS_SIZE_BYTES: usize = 32;
pub const OBSERVATIONS_LEN_BYTES: usize = 1;
pub const PREFIX_SIZE_BYTES: usize =
    TIMESTAMP_SIZE_BYTES + OBSERVERS_SIZE_BYTES + OBSERVATIONS_LEN_BYTES;
pub const OBSERVATION_SIZE_BYTES: usize = 16;
pub const JUELS_PER_FEE_COIN_SIZE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct MedianReportCodec;

impl ReportCodec for MedianReportCodec {
    fn build_report(&self, observations: &[ParsedAttributedObservation]) -> RelayerResult<Vec<u8>> {
        let n = observations.len();
        if n == 0 {
            return Err(RelayerError::Codec(
                "cannot build report from empty attributed observations".to_string(),
            ));
        }
        if n > OBSERVERS_SIZE_BYTES {
            return Err(RelayerError::Codec(format!(
                "too many observations: {} (max {})",
                n, OBSERVERS_SIZE_BYTES
            )));
        }

        let mut oo = observations.to_vec();

        oo.sort_by_key(|o| o.timestamp);
        let timestamp = oo[n / 2].timestamp;

        oo.sort_by(|a, b| a.juels_per_fee_coin.cmp(&b.juels_per_fee_coin));
        let juels_per_fee_coin = oo[n / 2].juels_per_fee_coin.clone();

        oo.sort_by(|a, b| a.value.cmp(&b.value));

        let mut report = Vec::with_capacity(self.max_report_length(n));
        report.extend_from_slice(&timestamp.to_be_bytes());

        let mut observers = [0u8; OBSERVERS_SIZE_BYTES];
        for (i, o) in oo.iter().enumerate() {
            observers[i] = o.observer;
        }
        report.extend_from_slice(&observers);

        report.push(n as u8);
        for o in &oo {
            report.extend(to_bytes(&o.value, OBSERVATION_SIZE_BYTES)?);
        }

        report.extend(to_unsigned_bytes(
            &juels_per_fee_coin,
            JUELS_PER_FEE_COIN_SIZE_BYTES,
        )?);
        Ok(report)
    }

    /// The n/2-th ranked observation
    fn median_from_report(&self, report: &[u8]) -> RelayerResult<BigInt> {
        let len = report.len();
        if len < PREFIX_SIZE_BYTES {
            return Err(RelayerError::Codec(format!(
                "report length missmatch: {} (received), {} (expected)",
                len, PREFIX_SIZE_BYTES
            )));
        }

        let n = report[TIMESTAMP_SIZE_BYTES + OBSERVERS_SIZE_BYTES] as usize;
        if n == 0 {
            return Err(RelayerError::Codec(
                "unpacked report has no 'observations'".to_string(),
            ));
        }
        if len < PREFIX_SIZE_BYTES + OBSERVATION_SIZE_BYTES * n + JUELS_PER_FEE_COIN_SIZE_BYTES {
            return Err(RelayerError::Codec(
                "report does not contain enough observations or is missing juels/feeCoin observation"
                    .to_string(),
            ));
        }

        let start = PREFIX_SIZE_BYTES + OBSERVATION_SIZE_BYTES * (n / 2);
        to_int(&report[start..start + OBSERVATION_SIZE_BYTES], OBSERVATION_SIZE_BYTES)
    }

    fn max_report_length(&self, n: usize) -> usize {
        PREFIX_SIZE_BYTES + OBSERVATION_SIZE_BYTES * n + JUELS_PER_FEE_COIN_SIZE_BYTES
    }
}
