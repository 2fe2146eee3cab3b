use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::relay::errors::ViewError;
use crate::relay::models::{BookSnapshot, SnapshotMessage};
use crate::relay::venue_book::VenueBook;

/// Immutable multi-venue view, keyed by venue id.
///
/// A view is never patched: the hub builds a new one from its books after every
/// accepted update and hands out shared copies of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateView {
    sequence: u64,
    computed_at: DateTime<Utc>,
    venues: BTreeMap<String, BookSnapshot>,
}

impl Default for AggregateView {
    fn default() -> Self {
        Self {
            sequence: 0,
            computed_at: Utc::now(),
            venues: BTreeMap::new(),
        }
    }
}

impl AggregateView {
    /// Build a view from the given books, copying at most `depth` levels per side.
    ///
    /// # Arguments
    /// * `books` - All venue books known to the caller, taken at one instant
    /// * `depth` - Levels per side to keep for every venue
    /// * `sequence` - Publish sequence number assigned to this view
    pub fn recompute(books: &BTreeMap<String, VenueBook>, depth: usize, sequence: u64) -> Self {
        let venues = books
            .iter()
            .map(|(venue, book)| (venue.clone(), book.snapshot(depth)))
            .collect();

        Self {
            sequence,
            computed_at: Utc::now(),
            venues,
        }
    }

    pub fn get(&self, venue: &str) -> Result<&BookSnapshot, ViewError> {
        self.venues
            .get(venue)
            .ok_or_else(|| ViewError::NotFound(venue.to_string()))
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.venues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }

    pub fn to_message(&self) -> SnapshotMessage<'_> {
        SnapshotMessage {
            message_type: "snapshot",
            sequence: self.sequence,
            timestamp: self.computed_at,
            venues: &self.venues,
        }
    }

    /// Serialize the view into the text payload sent to subscribers.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_message())
    }
}

impl fmt::Display for AggregateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence: '{}', Venues: '{}'", self.sequence, self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::models::{LevelUpdate, Side};
    use rust_decimal::Decimal;

    fn update(side: Side, price: i64, size: i64) -> LevelUpdate {
        LevelUpdate { side, price: Decimal::from(price), size: Decimal::from(size) }
    }

    fn apply(books: &mut BTreeMap<String, VenueBook>, venue: &str, update: LevelUpdate) {
        books
            .entry(venue.to_string())
            .or_insert_with(|| VenueBook::new(venue))
            .apply(&update)
            .unwrap();
    }

    #[test]
    fn test_recompute_matches_latest_snapshots() {
        let mut books = BTreeMap::new();
        let venues = ["OKX", "Bybit", "Deribit"];

        for (i, venue) in venues.iter().enumerate() {
            apply(&mut books, venue, update(Side::Bid, 100 + i as i64, 1));
            apply(&mut books, venue, update(Side::Ask, 110 + i as i64, 2));
        }

        let view = AggregateView::recompute(&books, 5, 1);

        assert_eq!(view.len(), 3);
        for venue in venues {
            assert_eq!(view.get(venue).unwrap(), &books[venue].snapshot(5));
        }
    }

    #[test]
    fn test_interleaved_venue_updates_stay_separate() {
        let mut books = BTreeMap::new();

        apply(&mut books, "OKX", update(Side::Bid, 50000, 1));
        apply(&mut books, "Bybit", update(Side::Bid, 49990, 3));
        apply(&mut books, "OKX", update(Side::Ask, 50020, 2));
        let first = AggregateView::recompute(&books, 10, 1);

        apply(&mut books, "Bybit", update(Side::Ask, 50005, 4));
        let second = AggregateView::recompute(&books, 10, 2);

        assert_eq!(first.get("OKX").unwrap(), second.get("OKX").unwrap());
        assert!(first.get("Bybit").unwrap().asks.is_empty());
        assert_eq!(second.get("Bybit").unwrap(), &books["Bybit"].snapshot(10));
        assert_eq!(second.get("OKX").unwrap(), &books["OKX"].snapshot(10));
    }

    #[test]
    fn test_recompute_does_not_alias_books() {
        let mut books = BTreeMap::new();
        apply(&mut books, "OKX", update(Side::Bid, 100, 1));
        let view = AggregateView::recompute(&books, 10, 1);

        apply(&mut books, "OKX", update(Side::Bid, 100, 9));

        assert_eq!(view.get("OKX").unwrap().bids[0].size, Decimal::from(1));
    }

    #[test]
    fn test_get_unknown_venue() {
        let view = AggregateView::default();
        assert_eq!(view.get("Kraken"), Err(ViewError::NotFound("Kraken".to_string())));
        assert!(view.is_empty());
    }

    #[test]
    fn test_to_json_round_trips_venue_keys() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut books = BTreeMap::new();
        apply(&mut books, "OKX", update(Side::Bid, 100, 1));
        apply(&mut books, "Bybit", update(Side::Ask, 101, 1));

        let view = AggregateView::recompute(&books, 10, 42);
        let value: serde_json::Value = serde_json::from_str(&view.to_json()?)?;

        assert_eq!(value["sequence"], 42);
        assert!(value["venues"].get("OKX").is_some());
        assert!(value["venues"].get("Bybit").is_some());

        Ok(())
    }
}
