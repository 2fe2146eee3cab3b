use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::relay::aggregate_view::AggregateView;
use crate::relay::errors::{MalformedUpdate, RejectedUpdate};
use crate::relay::models::{RawVenueUpdate, Side, SubscriberId, UpdateOrigin};
use crate::relay::outbound_queue::Payload;
use crate::relay::subscriber_registry::SubscriberRegistry;
use crate::relay::venue_book::VenueBook;

/// Events consumed by the hub, in arrival order.
#[derive(Debug, Clone)]
pub enum HubCommand {
    VenueUpdate {
        update: RawVenueUpdate,
        origin: UpdateOrigin,
    },
    VenueDisconnected {
        venue: String,
    },
}

impl fmt::Display for HubCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubCommand::VenueUpdate { update, origin } => write!(f, "VenueUpdate from {}: '{}'", origin, update),
            HubCommand::VenueDisconnected { venue } => write!(f, "VenueDisconnected: '{}'", venue),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    /// Levels per side kept in every published venue snapshot.
    pub depth: usize,
    /// Skip the echo to the subscriber an update came from.
    pub exclude_origin: bool,
}

/// Result of one publish pass over the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub excluded: usize,
    pub failed: Vec<SubscriberId>,
}

/// Terminal state of one venue update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Published { sequence: u64, report: PublishReport },
    Rejected(RejectedUpdate),
    Malformed(MalformedUpdate),
    /// Removal of a level on a venue that has no book yet.
    Ignored,
}

/// BroadcastHub is the single writer of venue books and the aggregate view.
///
/// It consumes `HubCommand` messages from its input channel one at a time: each
/// update is validated, applied to its venue book, aggregated into a fresh
/// `AggregateView` and published to every registered subscriber before the next
/// command is looked at.
pub struct BroadcastHub {
    settings: HubSettings,
    books: BTreeMap<String, VenueBook>,
    known_venues: BTreeSet<String>,
    sequence: u64,
    registry: Arc<SubscriberRegistry>,
    view: watch::Sender<Arc<AggregateView>>,
    input: mpsc::Receiver<HubCommand>,
}

impl BroadcastHub {
    /// Create a new BroadcastHub
    ///
    /// # Arguments
    /// * `settings` - Publish depth and echo exclusion policy
    /// * `registry` - Subscribers to publish to
    /// * `input` - Receiver for venue events from feeds and subscribers
    pub fn new(settings: HubSettings, registry: Arc<SubscriberRegistry>, input: mpsc::Receiver<HubCommand>) -> Self {
        let (view, _) = watch::channel(Arc::new(AggregateView::default()));

        Self {
            settings,
            books: BTreeMap::new(),
            known_venues: BTreeSet::new(),
            sequence: 0,
            registry,
            view,
            input,
        }
    }

    /// Restrict accepted updates to the given venues. An empty set accepts any venue.
    pub fn with_venues<I>(mut self, venues: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.known_venues = venues.into_iter().collect();
        self
    }

    /// Receiver that always holds the most recently published view.
    pub fn view_receiver(&self) -> watch::Receiver<Arc<AggregateView>> {
        self.view.subscribe()
    }

    /// Validate, apply, aggregate and publish a single venue update.
    ///
    /// Malformed updates never reach a book. Rejected updates leave the book
    /// untouched and are not broadcast.
    pub fn on_venue_update(&mut self, raw: &RawVenueUpdate, origin: UpdateOrigin) -> UpdateOutcome {
        tracing::trace!("Received venue update from {}: '{}'", origin, raw);

        let (venue, update) = match raw.validate() {
            Ok(validated) => validated,
            Err(e) => {
                tracing::warn!("Discarding malformed update from {}: '{}'. Details: '{}'", origin, raw, e);
                return UpdateOutcome::Malformed(e);
            }
        };

        if !self.known_venues.is_empty() && !self.known_venues.contains(&venue) {
            let e = MalformedUpdate::UnknownVenue(venue);
            tracing::warn!("Discarding update from {}: '{}'. Details: '{}'", origin, raw, e);
            return UpdateOutcome::Malformed(e);
        }

        if update.size.is_zero() && !self.books.contains_key(&venue) {
            tracing::debug!("Ignoring removal for venue without a book: '{}'", venue);
            return UpdateOutcome::Ignored;
        }

        let book = self.books.entry(venue.clone()).or_insert_with(|| {
            tracing::info!("Tracking new venue: '{}'", venue);
            VenueBook::new(&venue)
        });

        if let Err(rejected) = book.apply(&update) {
            tracing::warn!(
                venue_id = %venue,
                reason = %rejected.reason,
                attempted_price = %update.price,
                attempted_size = %update.size,
                timestamp = %Utc::now().to_rfc3339(),
                "Rejected venue update"
            );
            return UpdateOutcome::Rejected(rejected);
        }

        tracing::debug!(
            "Applied update to '{}': '{}'. Depth bids: '{}', asks: '{}'",
            venue,
            update,
            book.depth(Side::Bid),
            book.depth(Side::Ask)
        );

        let view = self.aggregate();
        let exclude = match origin {
            UpdateOrigin::Subscriber(id) if self.settings.exclude_origin => Some(id),
            _ => None,
        };
        let report = self.publish(&view, exclude);

        UpdateOutcome::Published {
            sequence: view.sequence(),
            report,
        }
    }

    /// Mark a venue's book stale after its feed went away and publish the change.
    ///
    /// # Returns
    /// * `None` if the venue never produced an update
    pub fn on_venue_disconnected(&mut self, venue: &str) -> Option<PublishReport> {
        let Some(book) = self.books.get_mut(venue) else {
            tracing::debug!("Disconnect for unknown venue '{}'. Ignoring", venue);
            return None;
        };

        if book.is_stale() {
            return None;
        }

        tracing::info!("Venue '{}' disconnected. Marking book stale", venue);
        book.mark_stale();

        let view = self.aggregate();
        if let Ok(snapshot) = view.get(venue) {
            tracing::debug!(
                "Keeping last known levels of '{}': '{}' bids, '{}' asks",
                venue,
                snapshot.bids.len(),
                snapshot.asks.len()
            );
        }
        Some(self.publish(&view, None))
    }

    /// Serialize `view` once and hand the same payload to every subscriber.
    ///
    /// A subscriber whose queue is closed or overflows is unregistered; the pass
    /// carries on with the rest.
    pub fn publish(&self, view: &AggregateView, exclude: Option<SubscriberId>) -> PublishReport {
        let mut report = PublishReport::default();

        if self.registry.is_empty() {
            tracing::trace!("No subscribers for view '{}'", view);
            return report;
        }

        let payload: Payload = match view.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!("Failed to serialize view '{}': '{}'", view, e);
                return report;
            }
        };

        self.registry.for_each(|subscriber| {
            if Some(subscriber.id()) == exclude {
                report.excluded += 1;
                return;
            }

            match subscriber.send(Arc::clone(&payload)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!("Failed to deliver to subscriber '{}': '{}'. Unregistering", subscriber.id(), e);
                    self.registry.unregister(subscriber.id());
                    report.failed.push(subscriber.id());
                }
            }
        });

        tracing::debug!(
            "Published view '{}': delivered '{}', excluded '{}', failed '{}'",
            view,
            report.delivered,
            report.excluded,
            report.failed.len()
        );

        report
    }

    #[cfg(test)]
    pub fn book(&self, venue: &str) -> Option<&VenueBook> {
        self.books.get(venue)
    }

    /// Latest published view.
    #[cfg(test)]
    pub fn view(&self) -> Arc<AggregateView> {
        self.view.borrow().clone()
    }

    fn aggregate(&mut self) -> Arc<AggregateView> {
        self.sequence += 1;
        let view = Arc::new(AggregateView::recompute(&self.books, self.settings.depth, self.sequence));
        self.view.send_replace(Arc::clone(&view));
        view
    }

    /// Run the BroadcastHub as an asynchronous task
    ///
    /// This method processes commands until every `HubHandle` is dropped
    pub async fn run(mut self) {
        tracing::info!("Starting BroadcastHub with depth: '{}', exclude origin: '{}'", self.settings.depth, self.settings.exclude_origin);

        while let Some(command) = self.input.recv().await {
            match command {
                HubCommand::VenueUpdate { update, origin } => {
                    self.on_venue_update(&update, origin);
                }
                HubCommand::VenueDisconnected { venue } => {
                    self.on_venue_disconnected(&venue);
                }
            }
        }

        tracing::info!("BroadcastHub input closed. Stopping");
    }
}

/// Cloneable entry point for producers and readers of the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    view: watch::Receiver<Arc<AggregateView>>,
}

impl HubHandle {
    pub fn new(commands: mpsc::Sender<HubCommand>, view: watch::Receiver<Arc<AggregateView>>) -> Self {
        Self { commands, view }
    }

    /// Queue a venue update. Waits while the hub's input channel is full.
    pub async fn on_venue_update(&self, update: RawVenueUpdate, origin: UpdateOrigin) -> Result<()> {
        self.commands
            .send(HubCommand::VenueUpdate { update, origin })
            .await
            .map_err(|_| anyhow!("BroadcastHub is not running"))
    }

    pub async fn on_venue_disconnected(&self, venue: &str) -> Result<()> {
        self.commands
            .send(HubCommand::VenueDisconnected { venue: venue.to_string() })
            .await
            .map_err(|_| anyhow!("BroadcastHub is not running"))
    }

    /// Latest published view. Never waits on the hub.
    pub fn view(&self) -> Arc<AggregateView> {
        self.view.borrow().clone()
    }

    /// Wait until a view newer than the last one seen through this handle is published.
    #[cfg(test)]
    pub async fn changed(&mut self) -> Result<Arc<AggregateView>> {
        self.view.changed().await?;
        Ok(self.view.borrow_and_update().clone())
    }
}
