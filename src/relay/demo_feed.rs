use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::time::{sleep, Duration};

use crate::relay::broadcast_hub::HubHandle;
use crate::relay::config::DemoFeedConfig;
use crate::relay::models::{RawVenueUpdate, Side, UpdateOrigin};

const PRICE_STEP: Decimal = Decimal::TWO;

/// Illustrative venue traffic for running the relay without real feeds.
///
/// Every configured venue is seeded with `levels` bids below and `levels` asks
/// above `mid_price`, spaced by a fixed step. Afterwards one random level is
/// re-sized every `interval` ms. Prices never move across the mid, so the
/// generated books never cross.
pub struct DemoFeed {
    venues: Vec<String>,
    interval: u64,
    levels: u32,
    mid_price: Decimal,
    hub: HubHandle,
    rng: StdRng,
}

impl DemoFeed {
    pub fn new(config: &DemoFeedConfig, hub: HubHandle) -> Self {
        Self::with_rng(config, hub, StdRng::from_entropy())
    }

    pub fn with_seed(config: &DemoFeedConfig, hub: HubHandle, seed: u64) -> Self {
        Self::with_rng(config, hub, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &DemoFeedConfig, hub: HubHandle, rng: StdRng) -> Self {
        Self {
            venues: config.venues.clone(),
            interval: config.interval,
            levels: config.levels,
            mid_price: config.mid_price,
            hub,
            rng,
        }
    }

    /// Full ladder for every venue, best levels first.
    pub fn seed_updates(&mut self) -> Vec<RawVenueUpdate> {
        let mut updates = Vec::new();

        for venue in self.venues.clone() {
            for index in 0..self.levels {
                for side in [Side::Bid, Side::Ask] {
                    let Some(price) = self.level_price(side, index) else { continue };
                    let size = self.random_size(false);
                    updates.push(Self::update(&venue, side, price, size));
                }
            }
        }

        updates
    }

    /// Re-size one random level of one random venue. A zero size removes the level.
    pub fn next_update(&mut self) -> Option<RawVenueUpdate> {
        if self.venues.is_empty() {
            return None;
        }

        let venue = self.venues[self.rng.gen_range(0..self.venues.len())].clone();
        let side = if self.rng.gen_bool(0.5) { Side::Bid } else { Side::Ask };
        let index = self.rng.gen_range(0..self.levels.max(1));
        let price = self.level_price(side, index)?;
        let size = self.random_size(true);

        Some(Self::update(&venue, side, price, size))
    }

    /// Price of the `index`-th level away from the mid, or `None` if it is not
    /// positive or does not fit in a `Decimal`.
    fn level_price(&self, side: Side, index: u32) -> Option<Decimal> {
        let offset = PRICE_STEP.checked_mul(Decimal::from(u64::from(index) + 1))?;
        let price = match side {
            Side::Bid => self.mid_price.checked_sub(offset)?,
            Side::Ask => self.mid_price.checked_add(offset)?,
        };
        (price > Decimal::ZERO).then_some(price)
    }

    /// Size in [0.001, 2.000), or [0.000, 2.000) when removals are allowed.
    fn random_size(&mut self, allow_zero: bool) -> Decimal {
        let low = if allow_zero { 0 } else { 1 };
        Decimal::new(self.rng.gen_range(low..2000), 3)
    }

    fn update(venue: &str, side: Side, price: Decimal, size: Decimal) -> RawVenueUpdate {
        RawVenueUpdate::new(venue, &side.to_string(), &price.to_string(), &size.to_string())
    }

    /// Run the DemoFeed as an asynchronous task
    ///
    /// Seeds every venue, then emits one update per interval until the hub stops
    pub async fn run(mut self) {
        tracing::info!(
            "Starting DemoFeed for venues '{:?}' with update interval: '{}' ms",
            self.venues,
            self.interval
        );

        for update in self.seed_updates() {
            if self.hub.on_venue_update(update, UpdateOrigin::Feed).await.is_err() {
                tracing::info!("Hub stopped. Closing DemoFeed");
                return;
            }
        }

        loop {
            sleep(Duration::from_millis(self.interval)).await;

            let Some(update) = self.next_update() else { continue };
            tracing::trace!("Generated demo update: '{}'", update);

            if self.hub.on_venue_update(update, UpdateOrigin::Feed).await.is_err() {
                tracing::info!("Hub stopped. Closing DemoFeed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::broadcast_hub::HubCommand;
    use crate::relay::venue_book::VenueBook;
    use std::collections::BTreeMap;
    use std::str::FromStr;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    fn config(levels: u32, mid_price: &str) -> DemoFeedConfig {
        DemoFeedConfig {
            venues: vec!["OKX".to_string(), "Bybit".to_string(), "Deribit".to_string()],
            interval: 10,
            levels,
            mid_price: Decimal::from_str(mid_price).unwrap(),
        }
    }

    fn handle() -> (HubHandle, mpsc::Receiver<HubCommand>) {
        let (tx, rx) = mpsc::channel::<HubCommand>(1024);
        let (_view_tx, view_rx) = watch::channel(Arc::new(Default::default()));
        (HubHandle::new(tx, view_rx), rx)
    }

    fn apply_all(books: &mut BTreeMap<String, VenueBook>, updates: &[RawVenueUpdate]) {
        for raw in updates {
            let (venue, update) = raw.validate().unwrap();
            books
                .entry(venue.clone())
                .or_insert_with(|| VenueBook::new(&venue))
                .apply(&update)
                .unwrap();
        }
    }

    #[test]
    fn test_seed_builds_full_uncrossed_ladders() {
        let (hub, _rx) = handle();
        let mut feed = DemoFeed::with_seed(&config(15, "55000.0"), hub, 7);

        let updates = feed.seed_updates();
        assert_eq!(updates.len(), 3 * 15 * 2);

        let mut books = BTreeMap::new();
        apply_all(&mut books, &updates);

        for book in books.values() {
            assert_eq!(book.depth(Side::Bid), 15);
            assert_eq!(book.depth(Side::Ask), 15);
            assert_eq!(book.best_bid().unwrap().price, Decimal::from(54998));
            assert_eq!(book.best_ask().unwrap().price, Decimal::from(55002));
        }
    }

    #[test]
    fn test_random_walk_never_crosses() {
        let (hub, _rx) = handle();
        let mut feed = DemoFeed::with_seed(&config(5, "100"), hub, 42);

        let mut books = BTreeMap::new();
        let seed = feed.seed_updates();
        apply_all(&mut books, &seed);

        let walk: Vec<RawVenueUpdate> = (0..1000).filter_map(|_| feed.next_update()).collect();
        assert_eq!(walk.len(), 1000);
        apply_all(&mut books, &walk);
    }

    #[test]
    fn test_skips_non_positive_prices() {
        let (hub, _rx) = handle();
        let mut feed = DemoFeed::with_seed(&config(10, "5"), hub, 1);

        let updates = feed.seed_updates();
        let bids = updates.iter().filter(|u| u.side == "bid").count();
        let asks = updates.iter().filter(|u| u.side == "ask").count();

        assert_eq!(bids, 3 * 2);
        assert_eq!(asks, 3 * 10);
    }

    #[test]
    fn test_skips_prices_beyond_decimal_range() {
        let (hub, _rx) = handle();
        let mut demo = config(3, "100");
        demo.mid_price = Decimal::MAX - Decimal::from(3);
        let mut feed = DemoFeed::with_seed(&demo, hub, 5);

        let updates = feed.seed_updates();
        let asks = updates.iter().filter(|u| u.side == "ask").count();
        let bids = updates.iter().filter(|u| u.side == "bid").count();

        // Only the first ask step still fits below Decimal::MAX.
        assert_eq!(asks, 3);
        assert_eq!(bids, 3 * 3);

        for _ in 0..200 {
            if let Some(update) = feed.next_update() {
                assert!(update.validate().is_ok());
            }
        }
    }

    #[tokio::test]
    async fn test_run_sends_seed_then_stops_with_hub() {
        let (hub, mut rx) = handle();
        let feed = DemoFeed::with_seed(&config(2, "100"), hub, 3);
        let join = tokio::spawn(feed.run());

        for _ in 0..(3 * 2 * 2) {
            assert!(matches!(rx.recv().await, Some(HubCommand::VenueUpdate { .. })));
        }
        drop(rx);

        join.await.unwrap();
    }
}
