//! Well-known framework service keys

use std::collections::BTreeMap;

use crate::bridge::Bridge;
use crate::pubsub::{InMemoryBus, Publisher, Subscriber};
use crate::registry::ServiceKey;
use crate::topics::TopicManager;

pub const TOPICS: ServiceKey<TopicManager> = ServiceKey::new("framework.topics");
pub const BUS: ServiceKey<InMemoryBus> = ServiceKey::new("framework.bus");
pub const PUBLISHER: ServiceKey<dyn Publisher> = ServiceKey::new("framework.publisher");
pub const SUBSCRIBER: ServiceKey<dyn Subscriber> = ServiceKey::new("framework.subscriber");
pub const BRIDGES: ServiceKey<Bridges> = ServiceKey::new("framework.bridges");

/// The runtime's bridges, by channel
#[derive(Clone, Default)]
pub struct Bridges {
    by_channel: BTreeMap<String, Bridge>,
}

impl Bridges {
    pub(crate) fn insert(&mut self, bridge: Bridge) {
        self.by_channel.insert(bridge.channel().to_string(), bridge);
    }

    pub fn get(&self, channel: &str) -> Option<&Bridge> {
        self.by_channel.get(channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bridge> {
        self.by_channel.values()
    }

    pub fn channels(&self) -> Vec<&str> {
        self.by_channel.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.by_channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }
}
