pub mod config;
pub mod server;

pub mod errors;
pub(crate) mod models;
pub mod venue_book;
pub mod aggregate_view;
pub mod outbound_queue;
pub mod subscriber_registry;
pub mod broadcast_hub;
pub mod subscriber_listener;
pub mod venue_feed_stream;
pub mod demo_feed;
