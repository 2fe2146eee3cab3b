use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::relay::broadcast_hub::{BroadcastHub, HubCommand, HubHandle};
use crate::relay::config::Config;
use crate::relay::demo_feed::DemoFeed;
use crate::relay::subscriber_listener::SubscriberListener;
use crate::relay::subscriber_registry::SubscriberRegistry;
use crate::relay::venue_feed_stream::VenueFeedStream;

pub struct RelayServer {
    config: Config,
}

impl RelayServer {
    pub(crate) fn new(config: Config) -> Self {
        RelayServer { config }
    }

    pub(crate) async fn start(&self) -> Result<()> {
        let (hub_sender, hub_receiver) = mpsc::channel::<HubCommand>(self.config.hub_queue_capacity);
        let registry = Arc::new(SubscriberRegistry::new());

        let hub = BroadcastHub::new(self.config.hub_settings(), Arc::clone(&registry), hub_receiver)
            .with_venues(self.config.known_venues());
        let hub_handle = HubHandle::new(hub_sender, hub.view_receiver());

        let listener = SubscriberListener::bind(
            &self.config.listen_address,
            Arc::clone(&registry),
            hub_handle.clone(),
            self.config.subscriber_queue_capacity,
            self.config.overflow_policy,
        )
        .await
        .with_context(|| format!("Failed to listen on: '{}'", self.config.listen_address))?;

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            tracing::info!("Starting broadcast hub");
            hub.run().await;
        }));

        tasks.push(tokio::spawn(async move {
            tracing::info!("Starting subscriber listener");
            listener.run().await;
        }));

        for venue in &self.config.venues {
            let Some(feed_url) = venue.feed_url.clone() else {
                tracing::debug!("Venue '{}' has no feed url. Skipping feed stream", venue.name);
                continue;
            };

            let mut feed_stream = VenueFeedStream::new(
                venue.name.clone(),
                feed_url,
                hub_handle.clone(),
                self.config.reconnect_timeout,
            );

            let name = venue.name.clone();
            tasks.push(tokio::spawn(async move {
                tracing::info!("Starting venue feed stream: '{}'", name);
                feed_stream.run().await;
            }));
        }

        if let Some(demo_config) = &self.config.demo_feed {
            let demo_feed = DemoFeed::new(demo_config, hub_handle.clone());

            tasks.push(tokio::spawn(async move {
                tracing::info!("Starting demo feed");
                demo_feed.run().await;
            }));
        }

        drop(hub_handle);

        for handle in tasks {
            handle.await?;
        }

        Ok(())
    }
}
