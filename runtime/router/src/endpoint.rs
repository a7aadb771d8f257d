//! Receiving ends of services and subscriptions
//!
//! A service answers calls through [`ServiceEndpoint`]: each request carries
//! a one-shot reply capability to the caller's private reply endpoint, which
//! [`IncomingRequest::respond`] uses exactly once. Subscribers read published
//! events through [`TopicEndpoint`].

use std::sync::Arc;
use std::time::Duration;

use cap_broker::{Badge, Capability, CapabilityError, CapabilityManager, ProcessId};
use capbus_ipc::{Channel, ChannelError, Message};
use capbus_schema::{Record, SchemaError, SchemaRegistry, Version};

use crate::error::{BusError, Result};
use crate::service_registry::SchemaPair;
use crate::topic_registry::Subscription;

/// Encode with the newest registered version of `schema_id`
pub(crate) fn encode_latest(
    registry: &SchemaRegistry,
    schema_id: u32,
    record: &Record,
) -> Result<(Version, Vec<u8>)> {
    let layout = registry
        .latest(schema_id)
        .ok_or(SchemaError::UnknownSchema { id: schema_id })?;
    let payload = registry.encode(schema_id, layout.version(), record)?;
    Ok((layout.version(), payload))
}

/// Server side of a registered service
#[derive(Debug)]
pub struct ServiceEndpoint {
    name: String,
    channel: Channel,
    schemas: SchemaPair,
    registry: Arc<SchemaRegistry>,
    reply_timeout: Duration,
}

impl ServiceEndpoint {
    /// Wrap the inbound channel a service was registered with
    pub fn new(
        name: impl Into<String>,
        channel: Channel,
        schemas: SchemaPair,
        registry: Arc<SchemaRegistry>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            schemas,
            registry,
            reply_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schemas(&self) -> SchemaPair {
        self.schemas
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Block for the next request
    ///
    /// Requests that fail validation are dropped (their capabilities are
    /// released) and reported as errors; the endpoint stays usable.
    pub fn next_request(&self, timeout: Option<Duration>) -> Result<IncomingRequest> {
        let mut msg = self.channel.receive_timeout(timeout)?;
        let caps = self.channel.capabilities().clone();

        if msg.caps.is_empty() {
            return Err(BusError::MalformedRequest(format!(
                "request to {:?} carries no reply capability",
                self.name
            )));
        }
        let reply_cap = msg.caps.remove(0);

        let record = match self
            .registry
            .decode(self.schemas.request, msg.version, &msg.payload)
        {
            Ok(record) => record,
            Err(e) => {
                for cap in core::iter::once(&reply_cap).chain(&msg.caps) {
                    let _ = caps.release(cap);
                }
                return Err(e.into());
            }
        };

        let caller = caps.kernel().object_owner(reply_cap.object().id).ok();
        let reply = Channel::open(&caps, reply_cap, self.schemas.response)?;

        Ok(IncomingRequest {
            service: self.name.clone(),
            record,
            version: msg.version,
            badge: msg.badge(),
            correlation: msg.label,
            caller,
            caps: msg.caps,
            table: caps,
            reply: Some(reply),
            registry: Arc::clone(&self.registry),
            response_schema: self.schemas.response,
            reply_timeout: self.reply_timeout,
        })
    }

    /// Release the service endpoint; pending callers see `PeerUnavailable`
    pub fn close(self) -> Result<()> {
        Ok(self.channel.close()?)
    }
}

/// One call waiting for its response
///
/// Attached capabilities not taken with [`IncomingRequest::take_caps`] are
/// released when the request is dropped.
#[derive(Debug)]
pub struct IncomingRequest {
    service: String,
    record: Record,
    version: Version,
    badge: Badge,
    correlation: u64,
    caller: Option<ProcessId>,
    caps: Vec<Capability>,
    /// The service's capability table
    table: CapabilityManager,
    reply: Option<Channel>,
    registry: Arc<SchemaRegistry>,
    response_schema: u32,
    reply_timeout: Duration,
}

impl IncomingRequest {
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Version the caller encoded the request with
    pub fn version(&self) -> Version {
        self.version
    }

    /// Badge of the capability the request arrived through
    pub fn badge(&self) -> Badge {
        self.badge
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation
    }

    /// Process that made the call (owner of the reply endpoint)
    pub fn caller(&self) -> Option<ProcessId> {
        self.caller
    }

    /// Capabilities the caller attached besides the reply capability
    pub fn caps(&self) -> &[Capability] {
        &self.caps
    }

    /// Take ownership of the attached capabilities
    pub fn take_caps(&mut self) -> Vec<Capability> {
        core::mem::take(&mut self.caps)
    }

    /// Send the response; consumes the reply capability
    ///
    /// Fails with `PeerUnavailable` or `CapabilityRevoked` when the caller
    /// already gave up on the call.
    pub fn respond(mut self, response: &Record) -> Result<()> {
        let reply = self
            .reply
            .take()
            .ok_or_else(|| BusError::MalformedRequest("response already sent".into()))?;

        let result = encode_latest(&self.registry, self.response_schema, response).and_then(
            |(version, payload)| {
                let msg = Message::new(self.response_schema, version, payload)
                    .with_label(self.correlation);
                reply
                    .send_timeout(msg, Some(self.reply_timeout))
                    .map_err(BusError::from)
            },
        );

        if let Err(e) = &result {
            if is_caller_gone(e) {
                log::warn!(
                    "{}: late reply to call {} dropped, caller gone",
                    self.service,
                    self.correlation
                );
            }
        }
        let _ = reply.close();
        result
    }

    fn release_attached(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.close();
        }
        for cap in self.caps.drain(..) {
            if let Err(e) = self.table.release(&cap) {
                log::debug!("{}: attached {} not released: {}", self.service, cap.node(), e);
            }
        }
    }
}

impl Drop for IncomingRequest {
    fn drop(&mut self) {
        self.release_attached();
    }
}

fn is_caller_gone(err: &BusError) -> bool {
    matches!(
        err,
        BusError::Channel(ChannelError::PeerUnavailable(_))
            | BusError::Channel(ChannelError::Capability(CapabilityError::CapabilityRevoked(_)))
    )
}

/// One published message as a subscriber sees it
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    /// Position in the topic's publication order
    pub sequence: u64,
    pub version: Version,
    pub record: Record,
    pub badge: Badge,
}

/// Subscriber side of a subscription
#[derive(Debug)]
pub struct TopicEndpoint {
    subscription: Subscription,
    channel: Channel,
    registry: Arc<SchemaRegistry>,
}

impl TopicEndpoint {
    pub fn new(subscription: Subscription, channel: Channel, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            subscription,
            channel,
            registry,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Block for the next published event
    pub fn next_event(&self, timeout: Option<Duration>) -> Result<Event> {
        let msg = self.channel.receive_timeout(timeout)?;
        for cap in &msg.caps {
            let _ = self.channel.capabilities().release(cap);
        }
        let record = self
            .registry
            .decode(self.subscription.schema_id(), msg.version, &msg.payload)?;
        Ok(Event {
            topic: self.subscription.topic().to_string(),
            sequence: msg.label,
            version: msg.version,
            badge: msg.badge(),
            record,
        })
    }

    pub fn close(self) -> Result<()> {
        Ok(self.channel.close()?)
    }
}
