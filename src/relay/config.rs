use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::relay::broadcast_hub::HubSettings;
use crate::relay::outbound_queue::OverflowPolicy;

/// A venue the relay knows about up front.
#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    /// WebSocket endpoint streaming normalized updates for this venue.
    #[serde(default)]
    pub feed_url: Option<String>,
}

/// Illustrative generator of order book traffic.
#[derive(Debug, Clone, Deserialize)]
pub struct DemoFeedConfig {
    pub venues: Vec<String>,
    pub interval: u64,
    pub levels: u32,
    pub mid_price: Decimal,
}

/// Configuration for the relay server.
///
/// This struct holds all the configuration parameters needed to run the relay
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_address: String,
    pub max_depth: u64,
    #[serde(default)]
    pub exclude_origin: bool,
    pub hub_queue_capacity: usize,
    pub subscriber_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub reconnect_timeout: u64,
    #[serde(default)]
    pub venues: Vec<VenueConfig>,
    #[serde(default)]
    pub demo_feed: Option<DemoFeedConfig>,
}

impl Config {
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            depth: self.max_depth as usize,
            exclude_origin: self.exclude_origin,
        }
    }

    /// Venues named in `venues` or `demo_feed.venues`. Updates for any other
    /// venue are refused by the hub unless this set is empty.
    pub fn known_venues(&self) -> BTreeSet<String> {
        let configured = self.venues.iter().map(|venue| venue.name.clone());
        let demo = self.demo_feed.iter().flat_map(|demo| demo.venues.iter().cloned());
        configured.chain(demo).collect()
    }

    /// Checks the values serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            bail!("max_depth must be greater than zero");
        }
        if self.hub_queue_capacity == 0 {
            bail!("hub_queue_capacity must be greater than zero");
        }
        if self.subscriber_queue_capacity == 0 {
            bail!("subscriber_queue_capacity must be greater than zero");
        }

        let mut names = BTreeSet::new();
        for venue in &self.venues {
            if venue.name.trim().is_empty() {
                bail!("venue name must not be empty");
            }
            if !names.insert(venue.name.as_str()) {
                bail!("duplicate venue: '{}'", venue.name);
            }
        }

        if let Some(demo) = &self.demo_feed {
            if demo.interval == 0 {
                bail!("demo_feed.interval must be greater than zero");
            }
            if demo.levels == 0 {
                bail!("demo_feed.levels must be greater than zero");
            }
            if demo.mid_price <= Decimal::ONE {
                bail!("demo_feed.mid_price must be greater than one");
            }
        }

        Ok(())
    }
}

/// Parses a YAML string into a `Config` struct.
///
/// # Arguments
/// * `yaml_data` - A string containing YAML-formatted configuration data
///
/// # Errors
/// Returns an error if the YAML data is invalid, missing required fields, or fails validation
pub fn load_config_from_yaml_str(yaml_data: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(yaml_data)
        .context("Failed to deserialize configuration from YAML")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Loads a configuration from a YAML file at the specified path.
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The file content is not valid YAML
/// - The YAML data is missing required fields or fails validation
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let data = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read configuration from: {:?}", path.as_ref()))?;
    let config = load_config_from_yaml_str(&data)?;
    Ok(config)
}
