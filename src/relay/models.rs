use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::relay::errors::MalformedUpdate;

pub trait FromJson: Sized {
    fn from_json(s: &str) -> Result<Self, serde_json::Error>;
}

impl<T> FromJson for T where T: de::DeserializeOwned,
{
    fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

impl FromStr for Side {
    type Err = MalformedUpdate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bid" | "buy" => Ok(Side::Bid),
            "ask" | "sell" => Ok(Side::Ask),
            _ => Err(MalformedUpdate::UnknownSide(s.to_string())),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Ask => write!(f, "ask"),
        }
    }
}

/// A single resting (price, size) pair on one side of a ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl fmt::Display for PriceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Price: '{}', Size: '{}'", self.price, self.size)
    }
}

/// A validated change to one price level. `size == 0` removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelUpdate {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

impl LevelUpdate {
    /// Validate the string fields of an inbound update.
    pub fn parse(side: &str, price: &str, size: &str) -> Result<Self, MalformedUpdate> {
        let side = side.parse::<Side>()?;

        let price = Decimal::from_str(price.trim())
            .map_err(|_| MalformedUpdate::InvalidPrice(price.to_string()))?;
        let size = Decimal::from_str(size.trim())
            .map_err(|_| MalformedUpdate::InvalidSize(size.to_string()))?;

        if price <= Decimal::ZERO {
            return Err(MalformedUpdate::NonPositivePrice(price.to_string()));
        }
        if size < Decimal::ZERO {
            return Err(MalformedUpdate::NegativeSize(size.to_string()));
        }

        Ok(LevelUpdate { side, price, size })
    }
}

impl fmt::Display for LevelUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Side: '{}', Price: '{}', Size: '{}'", self.side, self.price, self.size)
    }
}

/// Venue update as it arrives on the wire, before validation.
///
/// ```json
/// {"venue": "OKX", "side": "bid", "price": "50000.5", "size": "1.0"}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawVenueUpdate {
    #[serde(default)]
    pub venue: String,
    pub side: String,
    pub price: String,
    pub size: String,
}

impl RawVenueUpdate {
    pub fn new(venue: &str, side: &str, price: &str, size: &str) -> Self {
        Self {
            venue: venue.to_string(),
            side: side.to_string(),
            price: price.to_string(),
            size: size.to_string(),
        }
    }

    /// Parses a text frame into a raw update.
    pub fn from_text(text: &str) -> Result<Self, MalformedUpdate> {
        RawVenueUpdate::from_json(text).map_err(|e| MalformedUpdate::Json(e.to_string()))
    }

    /// Validates the update, producing the venue id and a typed level update.
    pub fn validate(&self) -> Result<(String, LevelUpdate), MalformedUpdate> {
        let venue = self.venue.trim();
        if venue.is_empty() {
            return Err(MalformedUpdate::EmptyVenue);
        }
        let update = LevelUpdate::parse(&self.side, &self.price, &self.size)?;
        Ok((venue.to_string(), update))
    }
}

impl fmt::Display for RawVenueUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Venue: '{}', Side: '{}', Price: '{}', Size: '{}'",
            self.venue, self.side, self.price, self.size
        )
    }
}

/// Identifier handed out by the `SubscriberRegistry`.
pub type SubscriberId = u64;

/// Where a venue update came from. Only subscriber-originated updates are
/// candidates for echo exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Feed,
    Subscriber(SubscriberId),
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOrigin::Feed => write!(f, "feed"),
            UpdateOrigin::Subscriber(id) => write!(f, "subscriber '{}'", id),
        }
    }
}

/// Point-in-time copy of the top of one venue's ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookSnapshot {
    pub venue: String,
    pub stale: bool,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

/// Wire shape of one publish cycle: one combined object keyed by venue.
#[derive(Debug, Serialize)]
pub struct SnapshotMessage<'a> {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub venues: &'a BTreeMap<String, BookSnapshot>,
}
