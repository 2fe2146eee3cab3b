use std::fmt;
use thiserror::Error;

/// Why a well-formed update was refused by a `VenueBook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Applying the update would leave best bid >= best ask.
    CrossedBook,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::CrossedBook => write!(f, "CrossedBook"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("update rejected: {reason}")]
pub struct RejectedUpdate {
    pub reason: RejectReason,
}

/// Inbound update that never reaches a `VenueBook` because it failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedUpdate {
    #[error("failed to parse update json: {0}")]
    Json(String),
    #[error("venue id is empty")]
    EmptyVenue,
    #[error("venue is not configured: '{0}'")]
    UnknownVenue(String),
    #[error("unknown side: '{0}'")]
    UnknownSide(String),
    #[error("price is not a decimal number: '{0}'")]
    InvalidPrice(String),
    #[error("size is not a decimal number: '{0}'")]
    InvalidSize(String),
    #[error("price must be positive: '{0}'")]
    NonPositivePrice(String),
    #[error("size must not be negative: '{0}'")]
    NegativeSize(String),
}

/// Delivery failure local to a single subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriberSendFailure {
    #[error("subscriber channel is closed")]
    Closed,
    #[error("subscriber queue overflowed")]
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    #[error("venue not found: '{0}'")]
    NotFound(String),
}
