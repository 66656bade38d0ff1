//! Price Feed Cache (C2): `instrument -> (price, observed_at)`, single
//! -writer (the market-data adapter), multi-reader. No persistence —
//! rebuilt on start, exactly as the distilled spec calls out.

use std::collections::BTreeMap;
use std::fmt;

use aegis_money::Amount;
use aegis_schemas::Instrument;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

#[derive(Debug, PartialEq, Eq)]
pub enum PriceFeedError {
    /// The last observation is older than `max_price_age`.
    StalePrice { instrument: Instrument, age: Duration },
    MissingPrice { instrument: Instrument },
}

impl fmt::Display for PriceFeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceFeedError::StalePrice { instrument, age } => {
                write!(f, "stale price for {instrument}: last observed {}s ago", age.num_seconds())
            }
            PriceFeedError::MissingPrice { instrument } => {
                write!(f, "no price observed for {instrument}")
            }
        }
    }
}

impl std::error::Error for PriceFeedError {}

#[derive(Copy, Clone, Debug)]
struct PriceEntry {
    price: Amount,
    observed_at: DateTime<Utc>,
}

/// Default freshness bound (§4.2).
pub const DEFAULT_MAX_PRICE_AGE_SECS: i64 = 60;

pub struct PriceFeedCache {
    max_price_age: Duration,
    prices: RwLock<BTreeMap<Instrument, PriceEntry>>,
}

impl PriceFeedCache {
    pub fn new(max_price_age: Duration) -> Self {
        PriceFeedCache {
            max_price_age,
            prices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record a new observation. The only mutator; callers are expected to
    /// be the single market-data adapter task.
    pub async fn record_price(&self, instrument: Instrument, price: Amount, observed_at: DateTime<Utc>) {
        self.prices
            .write()
            .await
            .insert(instrument, PriceEntry { price, observed_at });
    }

    /// The last-known price, failing with `StalePrice` when
    /// `now - observed_at > max_price_age`, inclusive of the boundary
    /// (exactly `max_price_age` old is still accepted, per §8).
    pub async fn last_price(&self, instrument: &Instrument, now: DateTime<Utc>) -> Result<Amount, PriceFeedError> {
        let prices = self.prices.read().await;
        let entry = prices.get(instrument).ok_or_else(|| PriceFeedError::MissingPrice {
            instrument: instrument.clone(),
        })?;
        let age = now - entry.observed_at;
        if age > self.max_price_age {
            return Err(PriceFeedError::StalePrice {
                instrument: instrument.clone(),
                age,
            });
        }
        Ok(entry.price)
    }

    /// A consistent snapshot of every cached price at `now`, dropping
    /// instruments whose price is stale.
    pub async fn fresh_snapshot(&self, now: DateTime<Utc>) -> BTreeMap<Instrument, Amount> {
        let prices = self.prices.read().await;
        prices
            .iter()
            .filter(|(_, entry)| now - entry.observed_at <= self.max_price_age)
            .map(|(instrument, entry)| (instrument.clone(), entry.price))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_price_is_returned() {
        let cache = PriceFeedCache::new(Duration::seconds(60));
        let instrument = Instrument::new("BTCZAR");
        let now = Utc::now();
        cache.record_price(instrument.clone(), Amount::from_units_cents(1_200_000, 0), now).await;
        let price = cache.last_price(&instrument, now).await.unwrap();
        assert_eq!(price, Amount::from_units_cents(1_200_000, 0));
    }

    #[tokio::test]
    async fn exactly_max_age_is_accepted() {
        let cache = PriceFeedCache::new(Duration::seconds(60));
        let instrument = Instrument::new("BTCZAR");
        let observed_at = Utc::now();
        cache
            .record_price(instrument.clone(), Amount::from_units_cents(1_200_000, 0), observed_at)
            .await;
        let now = observed_at + Duration::seconds(60);
        assert!(cache.last_price(&instrument, now).await.is_ok());
    }

    #[tokio::test]
    async fn past_max_age_is_stale() {
        let cache = PriceFeedCache::new(Duration::seconds(60));
        let instrument = Instrument::new("BTCZAR");
        let observed_at = Utc::now();
        cache
            .record_price(instrument.clone(), Amount::from_units_cents(1_200_000, 0), observed_at)
            .await;
        let now = observed_at + Duration::seconds(61);
        let err = cache.last_price(&instrument, now).await.unwrap_err();
        assert!(matches!(err, PriceFeedError::StalePrice { .. }));
    }

    #[tokio::test]
    async fn missing_instrument_is_missing_price() {
        let cache = PriceFeedCache::new(Duration::seconds(60));
        let err = cache
            .last_price(&Instrument::new("ETHZAR"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PriceFeedError::MissingPrice { .. }));
    }

    #[tokio::test]
    async fn fresh_snapshot_excludes_stale_entries() {
        let cache = PriceFeedCache::new(Duration::seconds(60));
        let fresh = Instrument::new("BTCZAR");
        let stale = Instrument::new("ETHZAR");
        let now = Utc::now();
        cache.record_price(fresh.clone(), Amount::from_units_cents(1_200_000, 0), now).await;
        cache
            .record_price(stale.clone(), Amount::from_units_cents(50_000, 0), now - Duration::seconds(120))
            .await;
        let snapshot = cache.fresh_snapshot(now).await;
        assert!(snapshot.contains_key(&fresh));
        assert!(!snapshot.contains_key(&stale));
    }
}
