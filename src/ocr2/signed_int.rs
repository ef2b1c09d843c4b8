//! Fixed-width big-endian two's complement integers

use num_bigint::{BigInt, Sign};
use num_traits::{One, Zero};

use crate::error::{RelayerError, RelayerResult};

/// Decode `bytes` as a signed integer of exactly `num_bytes` bytes
pub fn to_int(bytes: &[u8], num_bytes: usize) -> RelayerResult<BigInt> {
    check_width(num_bytes)?;
    if bytes.len() != num_bytes {
        return Err(RelayerError::Codec(format!(
            "invalid int length: expected {} got {}",
            num_bytes,
            bytes.len()
        )));
    }

    let val = BigInt::from_bytes_be(Sign::Plus, bytes);
    let modulus = BigInt::one() << (num_bytes * 8);
    let max_positive = (BigInt::one() << (num_bytes * 8 - 1)) - 1;
    if val > max_positive {
        Ok(val - modulus)
    } else {
        Ok(val)
    }
}

/// Encode `value` in `num_bytes` bytes, negative values as `2^(8n) + value`
pub fn to_bytes(value: &BigInt, num_bytes: usize) -> RelayerResult<Vec<u8>> {
    check_width(num_bytes)?;
    let bits = num_bytes * 8;
    let min = -(BigInt::one() << (bits - 1));
    let max = (BigInt::one() << (bits - 1)) - 1;
    if *value < min || *value > max {
        return Err(RelayerError::Codec(format!(
            "{} does not fit in {} signed bytes",
            value, num_bytes
        )));
    }

    let encoded = if value.sign() == Sign::Minus {
        (BigInt::one() << bits) + value
    } else {
        value.clone()
    };
    pad(&encoded, num_bytes)
}

/// Encode a non-negative `value` in `num_bytes` bytes
pub fn to_unsigned_bytes(value: &BigInt, num_bytes: usize) -> RelayerResult<Vec<u8>> {
    if value.sign() == Sign::Minus {
        return Err(RelayerError::Codec(format!("{} is negative", value)));
    }
    pad(value, num_bytes)
}

fn check_width(num_bytes: usize) -> RelayerResult<()> {
    if num_bytes == 0 {
        return Err(RelayerError::Codec(
            "signed int width must be at least one byte".to_string(),
        ));
    }
    Ok(())
}

fn pad(value: &BigInt, num_bytes: usize) -> RelayerResult<Vec<u8>> {
    if value.is_zero() {
        return Ok(vec![0u8; num_bytes]);
    }

    let (_, be) = value.to_bytes_be();
    if be.len() > num_bytes {
        return Err(RelayerError::Codec(format!(
            "value must fit in {} bytes",
            num_bytes
        )));
    }

    let mut out = vec![0u8; num_bytes - be.len()];
    out.extend_from_slice(&be);
    Ok(out)
}
