//! Topic Registry
//!
//! Topics bind a name to one schema. Subscribers are kept in subscription
//! order; each publish takes a snapshot of the live subscribers together
//! with the next sequence number of the topic.

use core::fmt;
use std::collections::{BTreeMap, HashMap};

use cap_broker::ProcessId;
use capbus_ipc::Channel;

use crate::error::{BusError, Result};
use crate::service_registry::validate_name;

/// Identifier of one subscription, unique per router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}

/// Handle returned by subscribe, consumed by unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    schema_id: u32,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, topic: &str, schema_id: u32) -> Self {
        Self {
            id,
            topic: topic.to_string(),
            schema_id,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn schema_id(&self) -> u32 {
        self.schema_id
    }
}

/// Public view of a declared topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub schema_id: u32,
    pub subscribers: usize,
}

#[derive(Debug)]
pub(crate) struct Subscriber {
    /// Router-side outbound channel to the subscriber endpoint
    pub channel: Channel,
    pub owner: ProcessId,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        let caps = self.channel.capabilities();
        let cap_live = self
            .channel
            .outbound()
            .is_some_and(|cap| caps.validate(cap).is_ok());
        cap_live && caps.kernel().process_alive(self.owner)
    }

    pub fn discard(self) {
        // Revoked copies only need their slot freed
        let _ = self.channel.close();
    }
}

struct Topic {
    schema_id: u32,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    next_sequence: u64,
}

/// What one publish delivers to
pub(crate) struct PublishPlan {
    pub schema_id: u32,
    pub sequence: u64,
    pub targets: Vec<(SubscriptionId, Channel)>,
}

pub(crate) struct TopicRegistry {
    topics: HashMap<String, Topic>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
        }
    }

    /// Declare a topic; redeclaring with the same schema is a no-op
    pub fn declare(&mut self, name: &str, schema_id: u32) -> Result<bool> {
        validate_name(name)?;
        match self.topics.get(name) {
            Some(topic) if topic.schema_id == schema_id => Ok(false),
            Some(_) => Err(BusError::NameTaken(name.to_string())),
            None => {
                self.topics.insert(
                    name.to_string(),
                    Topic {
                        schema_id,
                        subscribers: BTreeMap::new(),
                        next_sequence: 1,
                    },
                );
                log::info!("router: topic {:?} declared (schema {:#010x})", name, schema_id);
                Ok(true)
            }
        }
    }

    pub fn schema_of(&self, name: &str) -> Result<u32> {
        self.topics
            .get(name)
            .map(|t| t.schema_id)
            .ok_or_else(|| BusError::TopicNotFound(name.to_string()))
    }

    pub fn add(&mut self, name: &str, id: SubscriptionId, subscriber: Subscriber) -> Result<()> {
        let topic = self
            .topics
            .get_mut(name)
            .ok_or_else(|| BusError::TopicNotFound(name.to_string()))?;
        log::info!("router: {} subscribed {} to {:?}", subscriber.owner, id, name);
        topic.subscribers.insert(id, subscriber);
        Ok(())
    }

    pub fn remove(&mut self, name: &str, id: SubscriptionId) -> Result<Subscriber> {
        self.topics
            .get_mut(name)
            .and_then(|t| t.subscribers.remove(&id))
            .ok_or(BusError::NotSubscribed(id.0))
    }

    pub fn owner_of(&self, name: &str, id: SubscriptionId) -> Result<ProcessId> {
        self.topics
            .get(name)
            .and_then(|t| t.subscribers.get(&id))
            .map(|s| s.owner)
            .ok_or(BusError::NotSubscribed(id.0))
    }

    /// Snapshot live subscribers and claim the next sequence number
    pub fn plan(&mut self, name: &str) -> Result<PublishPlan> {
        let topic = self
            .topics
            .get_mut(name)
            .ok_or_else(|| BusError::TopicNotFound(name.to_string()))?;
        let sequence = topic.next_sequence;
        topic.next_sequence += 1;
        Ok(PublishPlan {
            schema_id: topic.schema_id,
            sequence,
            targets: topic
                .subscribers
                .iter()
                .map(|(id, s)| (*id, s.channel.clone()))
                .collect(),
        })
    }

    /// Topics sorted by name; subscribers found dead are dropped first
    pub fn list(&mut self) -> Vec<TopicInfo> {
        for (name, topic) in &mut self.topics {
            let dead: Vec<SubscriptionId> = topic
                .subscribers
                .iter()
                .filter(|(_, s)| !s.is_live())
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                if let Some(subscriber) = topic.subscribers.remove(&id) {
                    log::info!("router: pruned {} from {:?} (owner {} gone)", id, name, subscriber.owner);
                    subscriber.discard();
                }
            }
        }
        let mut infos: Vec<TopicInfo> = self
            .topics
            .iter()
            .map(|(name, t)| TopicInfo {
                name: name.clone(),
                schema_id: t.schema_id,
                subscribers: t.subscribers.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
