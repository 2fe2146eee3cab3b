use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::error::Error;
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Bytes, Message};

use crate::relay::broadcast_hub::HubHandle;
use crate::relay::models::{RawVenueUpdate, UpdateOrigin};

/// A WebSocket client that connects to one venue's normalized update feed and
/// forwards every update to the `BroadcastHub`.
///
/// Each text frame is expected to hold one update in the relay's own schema
/// (`{"side": "bid", "price": "...", "size": "..."}`); the `venue` field, if
/// present, is overridden with the configured venue name. When a session ends
/// the venue's book is marked stale and the stream reconnects after
/// `reconnect_timeout` milliseconds.
pub struct VenueFeedStream {
    venue: String,
    url: String,
    hub: HubHandle,
    reconnect_timeout: u64,
}

impl VenueFeedStream {
    /// Creates a new `VenueFeedStream` instance.
    ///
    /// # Arguments
    /// * `venue` - Venue id attached to every forwarded update
    /// * `url` - The WebSocket endpoint URL to connect to
    /// * `hub` - Handle of the hub receiving the updates
    /// * `reconnect_timeout` - Timeout in milliseconds to wait before reconnecting after a session ends
    pub fn new(venue: String, url: String, hub: HubHandle, reconnect_timeout: u64) -> Self {
        Self {
            venue,
            url,
            hub,
            reconnect_timeout,
        }
    }

    /// Keeps the feed connected until the hub stops.
    pub async fn run(&mut self) {
        loop {
            match self.run_session().await {
                Ok(_) => {
                    tracing::info!("Feed session '{}' for '{}' finished", self.url, self.venue);
                }
                Err(e) => {
                    tracing::error!("Feed session '{}' for '{}' finished with error: '{}'", self.url, self.venue, e);
                }
            }

            if self.hub.on_venue_disconnected(&self.venue).await.is_err() {
                tracing::info!("Hub stopped. Closing feed for '{}'", self.venue);
                return;
            }

            tracing::info!("Reconnecting feed for '{}' in '{}' ms", self.venue, self.reconnect_timeout);
            sleep(Duration::from_millis(self.reconnect_timeout)).await;
        }
    }

    /// Runs a single WebSocket session until the peer closes it or an error occurs.
    async fn run_session(&mut self) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        tracing::info!("Connected feed for '{}' to '{}'", self.venue, self.url);

        while let Some(msg) = ws_reader.next().await {
            tracing::trace!("Received message: '{:?}'", msg);

            match msg {
                Ok(Message::Text(text)) => { self.on_message(&text).await?; }
                Ok(Message::Ping(payload)) => { self.on_ping(&mut ws_writer, &payload).await?; }
                Ok(Message::Close(frame)) => { self.on_close(frame).await?; }
                Err(e) => { return Err(e.into()); }
                _ => {}
            }
        }
        Ok(())
    }

    /// Parses a text frame and forwards it to the hub.
    ///
    /// Malformed frames are logged and skipped; only a stopped hub ends the session.
    async fn on_message(&mut self, message: &str) -> Result<()> {
        let mut update = match RawVenueUpdate::from_text(message) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!("Discarding malformed frame from feed '{}': '{}'", self.venue, e);
                return Ok(());
            }
        };

        update.venue = self.venue.clone();
        self.hub.on_venue_update(update, UpdateOrigin::Feed).await?;
        Ok(())
    }

    async fn on_ping<S>(&mut self, ws_writer: &mut S, payload: &Bytes) -> Result<()>
    where S: SinkExt<Message> + Unpin,
          <S as futures::Sink<Message>>::Error: Error + Send + Sync + 'static
    {
        tracing::trace!("Received ping message. payload: {:?}", payload);
        ws_writer.send(Message::Pong(payload.clone())).await?;
        Ok(())
    }

    async fn on_close(&mut self, frame: Option<CloseFrame>) -> Result<()> {
        tracing::debug!("Feed '{}' was closed: {:?}", self.venue, frame);
        Ok(())
    }
}
