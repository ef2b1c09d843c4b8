//! Gas price estimation strategies
//!
//! Estimators return a price per gas unit for every denom they know. They
//! compose: a remote source can be wrapped in a cache and chained in front
//! of a fixed fallback.

use async_trait::async_trait;
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::chain::DecCoin;
use crate::error::{RelayerError, RelayerResult};

/// Prices keyed by denom
pub type GasPrices = HashMap<String, DecCoin>;

#[async_trait]
pub trait GasPricesEstimator: Send + Sync {
    async fn gas_prices(&self) -> RelayerResult<GasPrices>;
}

/// Static prices
pub struct FixedGasPriceEstimator {
    prices: GasPrices,
}

impl FixedGasPriceEstimator {
    pub fn new(prices: GasPrices) -> Self {
        Self { prices }
    }

    /// Single-denom price, as configured by `fallback_gas_price`
    pub fn single(price: DecCoin) -> Self {
        let mut prices = HashMap::new();
        prices.insert(price.denom.clone(), price);
        Self { prices }
    }

    pub fn gas_price(&self, denom: &str) -> Option<&DecCoin> {
        self.prices.get(denom)
    }

    pub fn set_gas_price(&mut self, price: DecCoin) {
        self.prices.insert(price.denom.clone(), price);
    }

    /// Lowest of the operator's max, the default and the node's configured
    /// max price.
    pub fn calculate_gas_price(
        denom: &str,
        max_gas_price: &DecCoin,
        default_gas_price: &DecCoin,
        max_gas_price_configured: &DecCoin,
    ) -> DecCoin {
        let allowed = max_gas_price.amount.min(max_gas_price_configured.amount);
        DecCoin::new(denom, default_gas_price.amount.min(allowed))
    }

    /// Bump `original_gas_price` by `bump_percent`, or by at least `bump_min`.
    /// A current price above the bump is kept while it stays under the cap,
    /// the lower of `max_gas_price` and `max_bump_price`.
    pub fn calculate_bump_gas_price(
        denom: &str,
        current_gas_price: &DecCoin,
        original_gas_price: &DecCoin,
        max_gas_price: &DecCoin,
        max_bump_price: &DecCoin,
        bump_min: &DecCoin,
        bump_percent: u16,
    ) -> RelayerResult<DecCoin> {
        let original = original_gas_price.amount;
        let current = current_gas_price.amount;
        let cap = max_gas_price.amount.min(max_bump_price.amount);

        let by_percent = original
            .checked_mul(Decimal::from(bump_percent))
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .and_then(|v| v.checked_add(original));
        let by_min = original.checked_add(bump_min.amount);
        let (Some(by_percent), Some(by_min)) = (by_percent, by_min) else {
            return Err(RelayerError::GasPrice(format!(
                "bumping gas price {} overflows",
                original
            )));
        };

        let mut bumped = by_percent.max(by_min);
        if current > bumped {
            if current > cap {
                warn!(
                    "Current gas price {} exceeds max gas price {}, using bumped price {}",
                    current, cap, bumped
                );
            } else {
                bumped = current;
            }
        }

        if bumped > cap {
            return Err(RelayerError::GasPrice(format!(
                "bumped gas price of {} would exceed configured max gas price of {} (original price was {})",
                bumped, cap, original
            )));
        }
        if bumped == original {
            return Err(RelayerError::GasPrice(format!(
                "bumped gas price of {} is equal to original gas price of {}: increase the bump percent or bump min",
                bumped, original
            )));
        }
        Ok(DecCoin::new(denom, bumped))
    }
}

#[async_trait]
impl GasPricesEstimator for FixedGasPriceEstimator {
    async fn gas_prices(&self) -> RelayerResult<GasPrices> {
        Ok(self.prices.clone())
    }
}

type PriceSource = dyn Fn() -> BoxFuture<'static, RelayerResult<GasPrices>> + Send + Sync;

/// Prices from an arbitrary source, e.g. a remote endpoint or reloadable config
pub struct ClosureGasPriceEstimator {
    source: Box<PriceSource>,
}

impl ClosureGasPriceEstimator {
    pub fn new<F>(source: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, RelayerResult<GasPrices>> + Send + Sync + 'static,
    {
        Self {
            source: Box::new(source),
        }
    }
}

#[async_trait]
impl GasPricesEstimator for ClosureGasPriceEstimator {
    async fn gas_prices(&self) -> RelayerResult<GasPrices> {
        (self.source)().await
    }
}

/// Remembers the last successful answer of the wrapped estimator and serves
/// it while the estimator is failing.
pub struct CachingGasPriceEstimator {
    inner: Arc<dyn GasPricesEstimator>,
    last_prices: Mutex<Option<GasPrices>>,
}

impl CachingGasPriceEstimator {
    pub fn new(inner: Arc<dyn GasPricesEstimator>) -> Self {
        Self {
            inner,
            last_prices: Mutex::new(None),
        }
    }
}

#[async_trait]
impl GasPricesEstimator for CachingGasPriceEstimator {
    async fn gas_prices(&self) -> RelayerResult<GasPrices> {
        let latest = self.inner.gas_prices().await;
        let mut last_prices = self.last_prices.lock().await;

        match latest {
            Ok(prices) => {
                *last_prices = Some(prices.clone());
                Ok(prices)
            }
            Err(e) => match last_prices.as_ref() {
                Some(cached) => {
                    warn!("Failed to get gas prices, using cached prices: {}", e);
                    Ok(cached.clone())
                }
                None => Err(RelayerError::GasPrice(format!(
                    "unable to get gas prices and cache is empty: {}",
                    e
                ))),
            },
        }
    }
}

/// Tries each estimator in order and never returns an error: when every
/// one of them fails it panics with all their errors.
pub struct MustGasPriceEstimator {
    estimators: Vec<Arc<dyn GasPricesEstimator>>,
}

impl MustGasPriceEstimator {
    pub fn new(estimators: Vec<Arc<dyn GasPricesEstimator>>) -> Self {
        Self { estimators }
    }

    /// Prefer `primary`, cached across its failures, with a fixed floor price
    pub fn with_fallback(primary: Option<Arc<dyn GasPricesEstimator>>, fallback: DecCoin) -> Self {
        let mut estimators: Vec<Arc<dyn GasPricesEstimator>> = Vec::with_capacity(2);
        if let Some(primary) = primary {
            estimators.push(Arc::new(CachingGasPriceEstimator::new(primary)));
        }
        estimators.push(Arc::new(FixedGasPriceEstimator::single(fallback)));
        Self { estimators }
    }

    pub async fn must_gas_prices(&self) -> GasPrices {
        let mut errors = Vec::new();
        for (i, estimator) in self.estimators.iter().enumerate() {
            match estimator.gas_prices().await {
                Ok(prices) => return prices,
                Err(e) => {
                    warn!("Error using gas price estimator {}, trying next one: {}", i, e);
                    errors.push(e.to_string());
                }
            }
        }
        panic!("no estimator succeeded errs {}", errors.join("; "));
    }
}

#[async_trait]
impl GasPricesEstimator for MustGasPriceEstimator {
    async fn gas_prices(&self) -> RelayerResult<GasPrices> {
        Ok(self.must_gas_prices().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use rust_decimal::Decimal;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FailingEstimator;

    #[async_trait]
    impl GasPricesEstimator for FailingEstimator {
        async fn gas_prices(&self) -> RelayerResult<GasPrices> {
            Err(RelayerError::GasPrice("endpoint unavailable".to_string()))
        }
    }

    fn ucosm(amount: Decimal) -> GasPrices {
        let mut prices = HashMap::new();
        prices.insert("ucosm".to_string(), DecCoin::new("ucosm", amount));
        prices
    }

    #[tokio::test]
    async fn test_fixed() {
        let fixed = FixedGasPriceEstimator::single(DecCoin::new("ucosm", Decimal::new(15, 3)));
        let prices = fixed.gas_prices().await.unwrap();
        assert_eq!(prices["ucosm"].amount, Decimal::new(15, 3));
    }

    #[tokio::test]
    async fn test_closure_reloads() {
        let high = Arc::new(AtomicBool::new(false));
        let flag = high.clone();
        let estimator = ClosureGasPriceEstimator::new(move || {
            let amount = if flag.load(Ordering::SeqCst) { 2 } else { 1 };
            async move { Ok(ucosm(Decimal::from(amount))) }.boxed()
        });

        assert_eq!(estimator.gas_prices().await.unwrap()["ucosm"].amount, Decimal::from(1));
        high.store(true, Ordering::SeqCst);
        assert_eq!(estimator.gas_prices().await.unwrap()["ucosm"].amount, Decimal::from(2));
    }

    #[tokio::test]
    async fn test_caching_serves_last_good_prices() {
        let fail = Arc::new(AtomicBool::new(false));
        let flag = fail.clone();
        let source = ClosureGasPriceEstimator::new(move || {
            let fail = flag.load(Ordering::SeqCst);
            async move {
                if fail {
                    Err(RelayerError::GasPrice("timeout".to_string()))
                } else {
                    Ok(ucosm(Decimal::new(25, 3)))
                }
            }
            .boxed()
        });
        let caching = CachingGasPriceEstimator::new(Arc::new(source));

        let first = caching.gas_prices().await.unwrap();
        fail.store(true, Ordering::SeqCst);
        let second = caching.gas_prices().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_caching_empty_cache_propagates() {
        let caching = CachingGasPriceEstimator::new(Arc::new(FailingEstimator));
        let err = caching.gas_prices().await.unwrap_err();
        assert!(err
            .to_string()
            .contains("unable to get gas prices and cache is empty"));
    }

    #[tokio::test]
    async fn test_must_falls_back_in_order() {
        let must = MustGasPriceEstimator::new(vec![
            Arc::new(FailingEstimator),
            Arc::new(FixedGasPriceEstimator::new(ucosm(Decimal::new(15, 3)))),
        ]);
        let prices = must.gas_prices().await.unwrap();
        assert_eq!(prices, ucosm(Decimal::new(15, 3)));
    }

    #[tokio::test]
    async fn test_with_fallback_uses_floor_price() {
        let must = MustGasPriceEstimator::with_fallback(
            Some(Arc::new(FailingEstimator) as Arc<dyn GasPricesEstimator>),
            DecCoin::new("ucosm", Decimal::new(15, 3)),
        );
        assert_eq!(must.gas_prices().await.unwrap(), ucosm(Decimal::new(15, 3)));

        let primary = FixedGasPriceEstimator::new(ucosm(Decimal::new(2, 2)));
        let must = MustGasPriceEstimator::with_fallback(
            Some(Arc::new(primary) as Arc<dyn GasPricesEstimator>),
            DecCoin::new("ucosm", Decimal::new(15, 3)),
        );
        assert_eq!(must.gas_prices().await.unwrap(), ucosm(Decimal::new(2, 2)));
    }

    fn dec(s: &str) -> DecCoin {
        DecCoin::new("ucosm", s.parse::<Decimal>().unwrap())
    }

    #[test]
    fn test_calculate_gas_price() {
        // (name, default, max, max configured on the node, want)
        let cases = [
            ("default below both caps", "0.001", "0.0011", "0.0012", "0.001"),
            ("max below default and node max", "0.01", "0.009", "0.012", "0.009"),
            ("node max below default and max", "0.010", "0.011", "0.008", "0.008"),
        ];
        for (name, default, max, node_max, want) in cases {
            let got = FixedGasPriceEstimator::calculate_gas_price(
                "ucosm",
                &dec(max),
                &dec(default),
                &dec(node_max),
            );
            assert_eq!(got, dec(want), "{}", name);
        }
    }

    #[test]
    fn test_calculate_bump_gas_price() {
        // (name, bump min, want): current and original 0.001, max 0.02,
        // max bump 0.3, 30 percent
        let cases = [
            ("bump min exceeds percent bump", "0.0005", "0.0015"),
            ("percent bump exceeds bump min", "0.00005", "0.0013"),
        ];
        let mut fixed = FixedGasPriceEstimator::single(dec("0.001"));
        for (name, bump_min, want) in cases {
            let bumped = FixedGasPriceEstimator::calculate_bump_gas_price(
                "ucosm",
                &dec("0.001"),
                &dec("0.001"),
                &dec("0.02"),
                &dec("0.3"),
                &dec(bump_min),
                30,
            )
            .unwrap();
            fixed.set_gas_price(bumped);
            assert_eq!(fixed.gas_price("ucosm"), Some(&dec(want)), "{}", name);
        }
    }

    #[test]
    fn test_bump_keeps_higher_current_price_under_cap() {
        let bumped = FixedGasPriceEstimator::calculate_bump_gas_price(
            "ucosm",
            &dec("0.005"),
            &dec("0.001"),
            &dec("0.02"),
            &dec("0.3"),
            &dec("0.0001"),
            10,
        )
        .unwrap();
        assert_eq!(bumped, dec("0.005"));
    }

    #[test]
    fn test_bump_rejects_price_over_cap() {
        let err = FixedGasPriceEstimator::calculate_bump_gas_price(
            "ucosm",
            &dec("0.001"),
            &dec("0.001"),
            &dec("0.0012"),
            &dec("0.3"),
            &dec("0.0005"),
            30,
        )
        .unwrap_err();
        assert!(err.to_string().contains("would exceed configured max gas price"));
    }

    #[test]
    fn test_bump_rejects_zero_bump() {
        let err = FixedGasPriceEstimator::calculate_bump_gas_price(
            "ucosm",
            &dec("0.001"),
            &dec("0.001"),
            &dec("0.02"),
            &dec("0.3"),
            &dec("0"),
            0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("equal to original gas price"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_must_warns_on_failing_estimator() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let must = MustGasPriceEstimator::new(vec![
            Arc::new(FailingEstimator),
            Arc::new(FixedGasPriceEstimator::new(ucosm(Decimal::new(15, 3)))),
        ]);
        must.gas_prices().await.unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("trying next one: Gas price error: endpoint unavailable"));
    }

    #[tokio::test]
    async fn test_must_panics_when_all_fail() {
        let must = MustGasPriceEstimator::new(vec![
            Arc::new(FailingEstimator),
            Arc::new(FailingEstimator),
        ]);
        let result = AssertUnwindSafe(must.must_gas_prices()).catch_unwind().await;
        assert!(result.is_err());
    }
}
