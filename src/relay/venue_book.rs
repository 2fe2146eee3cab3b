use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::relay::errors::{RejectReason, RejectedUpdate};
use crate::relay::models::{BookSnapshot, LevelUpdate, PriceLevel, Side};

/// Key of a price level, distinguishing between bid and ask prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceKey {
    Bid(Decimal),
    Ask(Decimal),
}

impl PriceKey {
    pub fn new(side: Side, price: Decimal) -> Self {
        match side {
            Side::Bid => PriceKey::Bid(price),
            Side::Ask => PriceKey::Ask(price),
        }
    }

    /// Returns the underlying price value regardless of whether it's a bid or ask.
    pub fn price(&self) -> Decimal {
        match self {
            PriceKey::Bid(price) => *price,
            PriceKey::Ask(price) => *price,
        }
    }
}

/// Bids sort descending and asks ascending, so the first entry of either
/// ladder is always the best price. A bid sorts before any ask.
impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PriceKey::Bid(a), PriceKey::Bid(b)) => b.cmp(a),
            (PriceKey::Ask(a), PriceKey::Ask(b)) => a.cmp(b),
            (PriceKey::Bid(_), PriceKey::Ask(_)) => Ordering::Less,
            (PriceKey::Ask(_), PriceKey::Bid(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One venue's current bid/ask ladder.
#[derive(Debug, Clone)]
pub struct VenueBook {
    venue: String,
    bids: BTreeMap<PriceKey, Decimal>,
    asks: BTreeMap<PriceKey, Decimal>,
    stale: bool,
    updated_at: DateTime<Utc>,
}

impl fmt::Display for VenueBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut formatted_string = format!("BOOK '{}'{}:\n", self.venue, if self.stale { " (stale)" } else { "" });

        formatted_string.push_str("BIDS:\n");
        for (key, size) in self.bids.iter() {
            formatted_string.push_str(&format!("  Price: '{}', Size: '{}'\n", key.price(), size));
        }

        formatted_string.push_str("------------------------------------\n");

        formatted_string.push_str("ASKS:\n");
        for (key, size) in self.asks.iter() {
            formatted_string.push_str(&format!("  Price: '{}', Size: '{}'\n", key.price(), size));
        }

        write!(f, "{}", formatted_string)
    }
}

impl VenueBook {
    pub fn new(venue: &str) -> Self {
        VenueBook {
            venue: venue.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            stale: false,
            updated_at: Utc::now(),
        }
    }

    /// Apply a level update to the book
    ///
    /// # Behavior
    /// * If size = 0, the price level is removed (no-op if absent)
    /// * Otherwise the level at that price is inserted or replaced
    /// * An update that would leave best bid >= best ask is rejected and the book is left untouched
    ///
    /// Any effective change clears the stale flag.
    pub fn apply(&mut self, update: &LevelUpdate) -> Result<(), RejectedUpdate> {
        let key = PriceKey::new(update.side, update.price);

        if update.size.is_zero() {
            if self.ladder_mut(update.side).remove(&key).is_some() {
                self.touch();
            }
            return Ok(());
        }

        if self.would_cross(update) {
            return Err(RejectedUpdate { reason: RejectReason::CrossedBook });
        }

        self.ladder_mut(update.side).insert(key, update.size);
        self.touch();
        Ok(())
    }

    /// Copy at most `depth` levels per side, best price first.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        BookSnapshot {
            venue: self.venue.clone(),
            stale: self.stale,
            bids: Self::top_levels(&self.bids, depth),
            asks: Self::top_levels(&self.asks, depth),
            updated_at: self.updated_at,
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.iter().next().map(|(key, size)| PriceLevel { price: key.price(), size: *size })
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.iter().next().map(|(key, size)| PriceLevel { price: key.price(), size: *size })
    }

    /// Flags the book as no longer fed; the last known levels are kept.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn depth(&self, side: Side) -> usize {
        match side {
            Side::Bid => self.bids.len(),
            Side::Ask => self.asks.len(),
        }
    }

    fn would_cross(&self, update: &LevelUpdate) -> bool {
        match update.side {
            Side::Bid => self.best_ask().map_or(false, |ask| update.price >= ask.price),
            Side::Ask => self.best_bid().map_or(false, |bid| update.price <= bid.price),
        }
    }

    fn ladder_mut(&mut self, side: Side) -> &mut BTreeMap<PriceKey, Decimal> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn touch(&mut self) {
        self.stale = false;
        self.updated_at = Utc::now();
    }

    fn top_levels(ladder: &BTreeMap<PriceKey, Decimal>, depth: usize) -> Vec<PriceLevel> {
        ladder
            .iter()
            .take(depth)
            .map(|(key, size)| PriceLevel { price: key.price(), size: *size })
            .collect()
    }
}
