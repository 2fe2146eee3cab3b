use anyhow::Result;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tungstenite::Message;

use crate::relay::broadcast_hub::HubHandle;
use crate::relay::models::{RawVenueUpdate, SubscriberId, UpdateOrigin};
use crate::relay::outbound_queue::{outbound_queue, OutboundSender, OverflowPolicy};
use crate::relay::subscriber_registry::SubscriberRegistry;

/// Everything a single connection needs, cloned into its task.
#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<SubscriberRegistry>,
    hub: HubHandle,
    queue_capacity: usize,
    overflow_policy: OverflowPolicy,
}

/// Accepts subscriber WebSocket connections and wires each one into the registry.
///
/// For every connection a bounded outbound queue is created and primed with the
/// current aggregate view, then registered. A writer task drains the queue into
/// the socket while the reader forwards text frames to the hub as
/// subscriber-originated venue updates. Whichever side finishes first ends the
/// session and unregisters the subscriber.
pub struct SubscriberListener {
    listener: TcpListener,
    context: ConnectionContext,
}

impl SubscriberListener {
    /// Bind the listening socket.
    ///
    /// # Arguments
    /// * `listen_address` - Address to accept subscribers on, e.g. `0.0.0.0:5001`
    /// * `registry` - Registry new subscribers are added to
    /// * `hub` - Hub receiving subscriber-originated updates
    /// * `queue_capacity` - Per-subscriber outbound queue size
    /// * `overflow_policy` - What to do when a subscriber's queue is full
    pub async fn bind(
        listen_address: &str,
        registry: Arc<SubscriberRegistry>,
        hub: HubHandle,
        queue_capacity: usize,
        overflow_policy: OverflowPolicy,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_address).await?;

        Ok(Self {
            listener,
            context: ConnectionContext {
                registry,
                hub,
                queue_capacity,
                overflow_policy,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per subscriber.
    pub async fn run(self) {
        match self.local_addr() {
            Ok(addr) => tracing::info!("Accepting subscribers on '{}'", addr),
            Err(e) => tracing::warn!("Accepting subscribers on unknown address: '{}'", e),
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Failed to accept connection: '{}'", e);
                    continue;
                }
            };

            let context = self.context.clone();
            tokio::spawn(async move {
                if let Err(e) = context.serve(stream, peer).await {
                    tracing::debug!("Connection from '{}' ended with error: '{}'", peer, e);
                }
            });
        }
    }
}

impl ConnectionContext {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (sender, mut receiver) = outbound_queue(self.queue_capacity, self.overflow_policy);

        let primed = self.prime(&sender)?;
        let id = self.registry.register(sender);
        if let Err(e) = self.catch_up(id, primed) {
            self.registry.unregister(id);
            return Err(e);
        }
        tracing::info!("Subscriber '{}' connected from '{}'. Subscribers: '{}'", id, peer, self.registry.len());

        let mut writer = tokio::spawn(async move {
            while let Some(payload) = receiver.recv().await {
                if let Err(e) = ws_writer.send(Message::text(payload.to_string())).await {
                    tracing::debug!("Failed to write to subscriber '{}': '{}'", id, e);
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::select! {
            _ = &mut writer => {
                tracing::info!("Outbound queue of subscriber '{}' closed", id);
            }
            result = self.read_loop(id, ws_reader) => {
                if let Err(e) = result {
                    tracing::debug!("Subscriber '{}' read loop ended with error: '{}'", id, e);
                }
            }
        }

        self.registry.unregister(id);
        writer.abort();
        tracing::info!("Subscriber '{}' disconnected", id);
        Ok(())
    }

    /// Queue the current view for a subscriber that is not registered yet.
    ///
    /// # Returns
    /// * Sequence of the queued view, `0` if nothing was queued
    fn prime(&self, sender: &OutboundSender) -> Result<u64> {
        let view = self.hub.view();
        if view.is_empty() {
            return Ok(0);
        }
        sender.send(Arc::from(view.to_json()?))?;
        Ok(view.sequence())
    }

    /// Queue the latest view again if the hub published between `prime` and
    /// registration, since that publish never reached this subscriber.
    fn catch_up(&self, id: SubscriberId, primed: u64) -> Result<()> {
        let latest = self.hub.view();
        if latest.sequence() <= primed {
            return Ok(());
        }

        let Some(subscriber) = self.registry.get(id) else {
            return Ok(());
        };
        tracing::debug!("Subscriber '{}' missed view '{}' while connecting. Resending", id, latest);
        subscriber.send(Arc::from(latest.to_json()?))?;
        Ok(())
    }

    /// Forward every text frame to the hub until the peer goes away.
    ///
    /// Control frames are answered by tungstenite itself.
    async fn read_loop(&self, id: SubscriberId, mut ws_reader: SplitStream<WebSocketStream<TcpStream>>) -> Result<()> {
        while let Some(msg) = ws_reader.next().await {
            tracing::trace!("Received message from subscriber '{}': '{:?}'", id, msg);

            match msg? {
                Message::Text(text) => self.on_text(id, &text).await?,
                Message::Close(frame) => {
                    tracing::debug!("Subscriber '{}' closed the connection: {:?}", id, frame);
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn on_text(&self, id: SubscriberId, text: &str) -> Result<()> {
        match RawVenueUpdate::from_text(text) {
            Ok(update) => self.hub.on_venue_update(update, UpdateOrigin::Subscriber(id)).await,
            Err(e) => {
                tracing::warn!("Discarding malformed message from subscriber '{}': '{}'", id, e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::broadcast_hub::{BroadcastHub, HubCommand, HubSettings};
    use crate::relay::aggregate_view::AggregateView;
    use crate::relay::venue_book::VenueBook;
    use std::collections::BTreeMap;
    use tokio::sync::{mpsc, watch};
    use tokio::time::{sleep, timeout, Duration};
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(exclude_origin: bool) -> (String, Arc<SubscriberRegistry>, HubHandle) {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let registry = Arc::new(SubscriberRegistry::new());
        let (tx, rx) = mpsc::channel::<HubCommand>(100);
        let hub = BroadcastHub::new(HubSettings { depth: 5, exclude_origin }, Arc::clone(&registry), rx);
        let handle = HubHandle::new(tx, hub.view_receiver());
        tokio::spawn(hub.run());

        let listener = SubscriberListener::bind("127.0.0.1:0", Arc::clone(&registry), handle.clone(), 16, OverflowPolicy::Disconnect)
            .await
            .unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(listener.run());

        (url, registry, handle)
    }

    async fn wait_for_subscribers(registry: &SubscriberRegistry, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while registry.len() != expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Timed out waiting for subscriber count");
    }

    async fn next_json(client: &mut Client) -> serde_json::Value {
        loop {
            let msg = timeout(Duration::from_secs(2), client.next())
                .await
                .expect("Timed out waiting for message")
                .expect("Connection closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn update_frame(venue: &str, side: &str, price: &str, size: &str) -> Message {
        Message::text(format!(r#"{{"venue":"{}","side":"{}","price":"{}","size":"{}"}}"#, venue, side, price, size))
    }

    #[tokio::test]
    async fn test_subscriber_update_fans_out() {
        let (url, registry, _handle) = start(false).await;

        let (mut a, _) = connect_async(url.as_str()).await.unwrap();
        let (mut b, _) = connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&registry, 2).await;

        a.send(update_frame("OKX", "bid", "50000", "1.0")).await.unwrap();

        let seen_by_b = next_json(&mut b).await;
        assert_eq!(seen_by_b["venues"]["OKX"]["bids"][0]["price"], "50000");

        let echoed_to_a = next_json(&mut a).await;
        assert_eq!(echoed_to_a["sequence"], seen_by_b["sequence"]);
    }

    #[tokio::test]
    async fn test_origin_not_echoed_when_excluded() {
        let (url, registry, _handle) = start(true).await;

        let (mut a, _) = connect_async(url.as_str()).await.unwrap();
        let (mut b, _) = connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&registry, 2).await;

        a.send(update_frame("Bybit", "ask", "101", "2")).await.unwrap();
        let _ = next_json(&mut b).await;

        b.send(update_frame("Bybit", "ask", "102", "3")).await.unwrap();
        let from_b = next_json(&mut a).await;
        assert_eq!(from_b["sequence"], 2);
    }

    #[tokio::test]
    async fn test_new_subscriber_receives_current_view() {
        let (url, registry, mut handle) = start(false).await;

        handle
            .on_venue_update(RawVenueUpdate::new("Deribit", "bid", "99", "4"), UpdateOrigin::Feed)
            .await
            .unwrap();
        handle.changed().await.unwrap();

        let (mut late, _) = connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&registry, 1).await;

        let initial = next_json(&mut late).await;
        assert_eq!(initial["venues"]["Deribit"]["bids"][0]["size"], "4");
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (url, registry, _handle) = start(false).await;

        let (mut a, _) = connect_async(url.as_str()).await.unwrap();
        let (_b, _) = connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&registry, 2).await;

        a.close(None).await.unwrap();
        wait_for_subscribers(&registry, 1).await;
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_connection_open() {
        let (url, registry, _handle) = start(false).await;

        let (mut a, _) = connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&registry, 1).await;

        a.send(Message::text("hello".to_string())).await.unwrap();
        a.send(update_frame("OKX", "bid", "abc", "1")).await.unwrap();
        a.send(update_frame("OKX", "bid", "100", "1")).await.unwrap();

        let echoed = next_json(&mut a).await;
        assert_eq!(echoed["sequence"], 1);
        assert_eq!(registry.len(), 1);
    }

    fn view_with_bid(sequence: u64, size: &str) -> Arc<AggregateView> {
        let raw = RawVenueUpdate::new("OKX", "bid", "100", size);
        let (venue, update) = raw.validate().unwrap();
        let mut book = VenueBook::new(&venue);
        book.apply(&update).unwrap();
        Arc::new(AggregateView::recompute(&BTreeMap::from([(venue, book)]), 5, sequence))
    }

    #[tokio::test]
    async fn test_publish_while_connecting_is_caught_up() {
        let (commands, _rx) = mpsc::channel::<HubCommand>(10);
        let (view_tx, view_rx) = watch::channel(view_with_bid(1, "1"));
        let context = ConnectionContext {
            registry: Arc::new(SubscriberRegistry::new()),
            hub: HubHandle::new(commands, view_rx),
            queue_capacity: 16,
            overflow_policy: OverflowPolicy::Disconnect,
        };

        let (sender, mut receiver) = outbound_queue(16, OverflowPolicy::Disconnect);
        let primed = context.prime(&sender).unwrap();
        assert_eq!(primed, 1);

        // Published after priming, before the subscriber is in the registry.
        view_tx.send_replace(view_with_bid(2, "2"));

        let id = context.registry.register(sender);
        context.catch_up(id, primed).unwrap();

        let first: serde_json::Value = serde_json::from_str(&receiver.recv().await.unwrap()).unwrap();
        let second: serde_json::Value = serde_json::from_str(&receiver.recv().await.unwrap()).unwrap();
        assert_eq!(first["sequence"], 1);
        assert_eq!(second["sequence"], 2);
        assert_eq!(second["venues"]["OKX"]["bids"][0]["size"], "2");

        context.catch_up(id, 2).unwrap();
        tokio::select! {
            _ = sleep(Duration::from_millis(50)) => {}
            _ = receiver.recv() => {
                panic!("Received unexpected payload");
            }
        }
    }
}
