//! The Bus Router
//!
//! The router is a process of its own: it owns a capability table holding
//! one `SEND | GRANT` capability per registered service and subscriber.
//! Router operations execute on the thread of the process invoking them,
//! against the router's table, so no router lock is ever held across a
//! blocking rendezvous.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use cap_broker::{Capability, CapabilityError, CapabilityManager, Kernel, ProcessId, Rights};
use capbus_ipc::{Channel, ChannelError, Direction, Message};
use capbus_schema::{Record, SchemaError, SchemaRegistry};
use kernel_mock::MAX_CAPS;

use crate::bootstrap::{self, BootstrapServer};
use crate::config::RouterConfig;
use crate::endpoint::{encode_latest, ServiceEndpoint, TopicEndpoint};
use crate::error::{BusError, Result};
use crate::service_registry::{SchemaPair, ServiceInfo, ServiceRecord, ServiceRegistry};
use crate::topic_registry::{Subscriber, Subscription, SubscriptionId, TopicInfo, TopicRegistry};

/// Kernel name of the router process
pub const ROUTER_PROCESS_NAME: &str = "bus.router";

/// Longest single wait while a call is blocked on its reply
const REPLY_POLL: Duration = Duration::from_millis(50);

/// One subscriber a publish could not reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub subscription: SubscriptionId,
    pub error: BusError,
}

/// Outcome of one publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub topic: String,
    /// Sequence number the message carried
    pub sequence: u64,
    pub delivered: Vec<SubscriptionId>,
    pub failures: Vec<DeliveryFailure>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub(crate) struct RouterInner {
    pub(crate) caps: CapabilityManager,
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) config: RouterConfig,
    services: Mutex<ServiceRegistry>,
    topics: Mutex<TopicRegistry>,
    next_correlation: AtomicU64,
    next_subscription: AtomicU64,
    bootstrap: Mutex<Option<BootstrapServer>>,
    closed: AtomicBool,
}

impl Drop for RouterInner {
    fn drop(&mut self) {
        // Destroys the bootstrap endpoint, which ends the bootstrap thread
        let _ = self.caps.kernel().exit_process(self.caps.pid());
    }
}

/// Handle to a running router; clones share the same tables
#[derive(Clone)]
pub struct Router {
    pub(crate) inner: Arc<RouterInner>,
}

impl core::fmt::Debug for Router {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Router")
            .field("pid", &self.pid())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Spawn the router process without the bootstrap service
    pub fn new(kernel: &Kernel, registry: Arc<SchemaRegistry>, config: RouterConfig) -> Result<Self> {
        bootstrap::install_schemas(&registry)?;
        let pid = kernel.spawn_process(ROUTER_PROCESS_NAME);
        log::info!("router: started as {}", pid);
        Ok(Self {
            inner: Arc::new(RouterInner {
                caps: CapabilityManager::new(kernel.clone(), pid),
                registry,
                config,
                services: Mutex::new(ServiceRegistry::new()),
                topics: Mutex::new(TopicRegistry::new()),
                next_correlation: AtomicU64::new(1),
                next_subscription: AtomicU64::new(1),
                bootstrap: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Spawn the router and serve `bus.bootstrap`
    pub fn start(kernel: &Kernel, registry: Arc<SchemaRegistry>, config: RouterConfig) -> Result<Self> {
        let router = Self::new(kernel, registry, config)?;
        let server = bootstrap::start(&router)?;
        *lock(&router.inner.bootstrap) = Some(server);
        Ok(router)
    }

    pub(crate) fn downgrade(&self) -> Weak<RouterInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<RouterInner>) -> Self {
        Self { inner }
    }

    pub fn pid(&self) -> ProcessId {
        self.inner.caps.pid()
    }

    pub fn kernel(&self) -> &Kernel {
        self.inner.caps.kernel()
    }

    /// The router process's own capability table
    pub fn capabilities(&self) -> &CapabilityManager {
        &self.inner.caps
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::PeerUnavailable(ROUTER_PROCESS_NAME.to_string()));
        }
        Ok(())
    }

    fn services(&self) -> MutexGuard<'_, ServiceRegistry> {
        lock(&self.inner.services)
    }

    fn topics(&self) -> MutexGuard<'_, TopicRegistry> {
        lock(&self.inner.topics)
    }

    fn check_schemas(&self, schemas: SchemaPair) -> Result<()> {
        for id in [schemas.request, schemas.response] {
            if !self.inner.registry.contains(id) {
                return Err(SchemaError::UnknownSchema { id }.into());
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Services
    // ---------------------------------------------------------------------

    /// Bind `name` to the inbound side of `channel`
    ///
    /// A `SEND | GRANT` capability derived from the channel's endpoint moves
    /// into the router's table; the owner keeps its endpoint and serves
    /// requests through the returned [`ServiceEndpoint`].
    ///
    /// # Errors
    /// `NameTaken` while a live service holds `name`, `SchemaMismatch` when
    /// the channel is bound to a schema other than the request schema.
    pub fn register_service(
        &self,
        owner: &CapabilityManager,
        name: &str,
        schemas: SchemaPair,
        channel: Channel,
    ) -> Result<ServiceEndpoint> {
        self.ensure_open()?;
        let inbound = *inbound_of(&channel, schemas.request)?;
        self.check_schemas(schemas)?;

        let mut services = self.services();
        services.check_available(name)?;
        let send = owner.delegate(&inbound, Rights::SEND | Rights::GRANT)?;
        let held = match owner.transfer(&send, &self.inner.caps) {
            Ok(held) => held,
            Err(e) => {
                let _ = owner.release(&send);
                return Err(e.into());
            }
        };
        match self.service_record(name, schemas, held, owner.pid()) {
            Ok(record) => services.insert(record),
            Err(e) => {
                let _ = self.inner.caps.release(&held);
                return Err(e);
            }
        }
        drop(services);

        Ok(ServiceEndpoint::new(
            name,
            channel,
            schemas,
            Arc::clone(&self.inner.registry),
            self.inner.config.reply_timeout,
        ))
    }

    /// Bind a service whose capability already sits in the router's table
    pub(crate) fn bind_service(
        &self,
        name: &str,
        schemas: SchemaPair,
        held: Capability,
        owner: ProcessId,
    ) -> Result<()> {
        let result = self.check_schemas(schemas).and_then(|()| {
            let mut services = self.services();
            services.check_available(name)?;
            services.insert(self.service_record(name, schemas, held, owner)?);
            Ok(())
        });
        if result.is_err() {
            let _ = self.inner.caps.release(&held);
        }
        result
    }

    fn service_record(
        &self,
        name: &str,
        schemas: SchemaPair,
        held: Capability,
        owner: ProcessId,
    ) -> Result<ServiceRecord> {
        Ok(ServiceRecord {
            name: name.to_string(),
            schemas,
            channel: Channel::open(&self.inner.caps, held, schemas.request)?,
            owner,
        })
    }

    /// Remove `name`; only the registering process may do so
    ///
    /// # Errors
    /// `NotOwner` when `owner` is not the process that registered `name`.
    pub fn deregister_service(&self, owner: &CapabilityManager, name: &str) -> Result<()> {
        self.deregister_as(owner.pid(), name)
    }

    pub(crate) fn deregister_as(&self, owner: ProcessId, name: &str) -> Result<()> {
        self.ensure_open()?;
        let record = self.services().unregister(name, owner)?;
        log::info!("router: service {:?} deregistered by {}", name, owner);
        let _ = record.channel.close();
        Ok(())
    }

    /// Resolve a service name
    pub fn lookup(&self, name: &str) -> Result<ServiceInfo> {
        let record = self.services().lookup(name)?;
        Ok(ServiceInfo {
            name: record.name,
            schemas: record.schemas,
            owner: record.owner,
        })
    }

    /// Live services, sorted by name
    pub fn list_services(&self) -> Vec<ServiceInfo> {
        self.services().list()
    }

    // ---------------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------------

    /// Call with the configured default deadline
    pub fn call(&self, caller: &CapabilityManager, name: &str, request: &Record) -> Result<Record> {
        self.call_timeout(caller, name, request, self.inner.config.default_call_timeout)
    }

    /// Call `name` and wait at most `timeout` for the response
    pub fn call_timeout(
        &self,
        caller: &CapabilityManager,
        name: &str,
        request: &Record,
        timeout: Duration,
    ) -> Result<Record> {
        self.call_with_caps(caller, name, request, &[], timeout)
    }

    /// Call `name`, moving `attach` to the service with the request
    ///
    /// The attached capabilities need `GRANT`. When the request cannot be
    /// delivered they are moved back to the caller.
    pub fn call_with_caps(
        &self,
        caller: &CapabilityManager,
        name: &str,
        request: &Record,
        attach: &[Capability],
        timeout: Duration,
    ) -> Result<Record> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        if attach.len() + 1 > MAX_CAPS {
            return Err(BusError::MalformedRequest(format!(
                "{} capabilities attached, at most {} fit beside the reply capability",
                attach.len(),
                MAX_CAPS - 1
            )));
        }

        let service = self.services().lookup(name)?;
        let (version, payload) = encode_latest(&self.inner.registry, service.schemas.request, request)?;
        let correlation = self.inner.next_correlation.fetch_add(1, Ordering::Relaxed);

        let message = Message::new(service.schemas.request, version, payload).with_label(correlation);

        let reply_root = caller.create_endpoint()?;
        let result = self.exchange(caller, &service, reply_root, message, attach, deadline);

        // Destroys the reply endpoint; a late response fails on the service side
        if let Err(e) = caller.release(&reply_root) {
            log::debug!("{}: reply endpoint release failed: {}", caller.pid(), e);
        }
        log::debug!(
            "router: call {} from {} to {:?}: {}",
            correlation,
            caller.pid(),
            name,
            if result.is_ok() { "ok" } else { "failed" }
        );
        result
    }

    fn exchange(
        &self,
        caller: &CapabilityManager,
        service: &ServiceRecord,
        reply_root: Capability,
        mut message: Message,
        attach: &[Capability],
        deadline: Instant,
    ) -> Result<Record> {
        let router = &self.inner.caps;
        let reply_send = caller.delegate(&reply_root, Rights::SEND | Rights::GRANT)?;
        let reply_held = caller.transfer(&reply_send, router).inspect_err(|_| {
            let _ = caller.release(&reply_send);
        })?;

        let mut moved = Vec::with_capacity(attach.len());
        for cap in attach {
            match caller.transfer(cap, router) {
                Ok(held) => moved.push(held),
                Err(e) => {
                    self.give_back(caller, reply_held, &moved);
                    return Err(e.into());
                }
            }
        }

        let correlation = message.label;
        message.caps = core::iter::once(reply_held).chain(moved.iter().copied()).collect();

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.give_back(caller, reply_held, &moved);
            return Err(BusError::Timeout);
        }
        if let Err(e) = service.channel.send_timeout(message, Some(remaining)) {
            self.give_back(caller, reply_held, &moved);
            return Err(self.send_failed(service, e));
        }

        let replies = Channel::open(caller, reply_root, service.schemas.response)?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BusError::Timeout);
            }
            let reply = match replies.receive_timeout(Some(remaining.min(REPLY_POLL))) {
                Ok(reply) => reply,
                Err(ChannelError::Timeout) => {
                    if !self.service_alive(service) {
                        self.services().evict(service);
                        return Err(BusError::PeerUnavailable(service.name.clone()));
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            for cap in &reply.caps {
                let _ = caller.release(cap);
            }
            if reply.label != correlation {
                log::warn!(
                    "{}: discarded reply {} while waiting for {}",
                    caller.pid(),
                    reply.label,
                    correlation
                );
                continue;
            }
            return Ok(self
                .inner
                .registry
                .decode(service.schemas.response, reply.version, &reply.payload)?);
        }
    }

    fn service_alive(&self, service: &ServiceRecord) -> bool {
        service
            .channel
            .outbound()
            .is_some_and(|cap| self.inner.caps.validate(cap).is_ok())
            && self.kernel().process_alive(service.owner)
    }

    /// Undo the capability moves of a request that never left
    fn give_back(&self, caller: &CapabilityManager, reply: Capability, moved: &[Capability]) {
        let router = &self.inner.caps;
        let _ = router.release(&reply);
        for cap in moved {
            if let Err(e) = router.transfer(cap, caller) {
                log::warn!("router: could not return {} to {}: {}", cap.node(), caller.pid(), e);
                let _ = router.release(cap);
            }
        }
    }

    fn send_failed(&self, service: &ServiceRecord, err: ChannelError) -> BusError {
        let name = &service.name;
        match err {
            ChannelError::Timeout => BusError::Timeout,
            ChannelError::PeerUnavailable(_) => {
                self.services().evict(service);
                BusError::PeerUnavailable(name.to_string())
            }
            ChannelError::Capability(CapabilityError::CapabilityRevoked(_)) => {
                self.services().evict(service);
                BusError::ServiceNotFound(name.to_string())
            }
            other => other.into(),
        }
    }

    // ---------------------------------------------------------------------
    // Topics
    // ---------------------------------------------------------------------

    /// Declare `name` as a topic carrying `schema_id`
    ///
    /// Declaring again with the same schema is a no-op.
    pub fn register_topic(&self, name: &str, schema_id: u32) -> Result<()> {
        self.ensure_open()?;
        if !self.inner.registry.contains(schema_id) {
            return Err(SchemaError::UnknownSchema { id: schema_id }.into());
        }
        self.topics().declare(name, schema_id)?;
        Ok(())
    }

    pub fn list_topics(&self) -> Vec<TopicInfo> {
        self.topics().list()
    }

    /// Schema carried by `topic`
    pub fn topic_schema(&self, topic: &str) -> Result<u32> {
        self.topics().schema_of(topic)
    }

    /// Add the inbound side of `channel` to the subscribers of `topic`
    pub fn subscribe(
        &self,
        subscriber: &CapabilityManager,
        topic: &str,
        channel: Channel,
    ) -> Result<TopicEndpoint> {
        self.ensure_open()?;
        let schema_id = self.topics().schema_of(topic)?;
        let inbound = *inbound_of(&channel, schema_id)?;

        let send = subscriber.delegate(&inbound, Rights::SEND | Rights::GRANT)?;
        let held = match subscriber.transfer(&send, &self.inner.caps) {
            Ok(held) => held,
            Err(e) => {
                let _ = subscriber.release(&send);
                return Err(e.into());
            }
        };
        let subscription = self.bind_subscription(topic, schema_id, held, subscriber.pid())?;
        Ok(TopicEndpoint::new(
            subscription,
            channel,
            Arc::clone(&self.inner.registry),
        ))
    }

    /// Add a subscriber whose capability already sits in the router's table
    pub(crate) fn bind_subscription(
        &self,
        topic: &str,
        schema_id: u32,
        held: Capability,
        owner: ProcessId,
    ) -> Result<Subscription> {
        let result = (|| {
            let channel = Channel::open(&self.inner.caps, held, schema_id)?;
            let mut topics = self.topics();
            let declared = topics.schema_of(topic)?;
            if declared != schema_id {
                return Err(BusError::SchemaMismatch {
                    expected: declared,
                    actual: schema_id,
                });
            }
            let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
            topics.add(topic, id, Subscriber { channel, owner })?;
            Ok(Subscription::new(id, topic, schema_id))
        })();
        if result.is_err() {
            let _ = self.inner.caps.release(&held);
        }
        result
    }

    /// Stop delivering to `subscription`
    ///
    /// # Errors
    /// `NotOwner` when `subscriber` did not make the subscription.
    pub fn unsubscribe(&self, subscriber: &CapabilityManager, subscription: &Subscription) -> Result<()> {
        self.unsubscribe_as(subscriber.pid(), subscription.topic(), subscription.id())
    }

    /// Unsubscribe on behalf of `owner`, which must hold the subscription
    pub(crate) fn unsubscribe_as(&self, owner: ProcessId, topic: &str, id: SubscriptionId) -> Result<()> {
        self.ensure_open()?;
        let mut topics = self.topics();
        if topics.owner_of(topic, id)? != owner {
            return Err(BusError::NotOwner {
                name: id.to_string(),
            });
        }
        let removed = topics.remove(topic, id)?;
        drop(topics);
        log::info!("router: {} removed from {:?}", id, topic);
        removed.discard();
        Ok(())
    }

    /// Deliver `record` to every live subscriber of `topic`
    ///
    /// Each subscriber is served on its own thread with the configured
    /// publish timeout, so a stalled subscriber delays nobody else. Failed
    /// deliveries are reported per subscriber; subscribers found dead are
    /// removed from the topic.
    pub fn publish(&self, topic: &str, record: &Record) -> Result<PublishReport> {
        self.ensure_open()?;
        let schema_id = self.topics().schema_of(topic)?;
        let (version, payload) = encode_latest(&self.inner.registry, schema_id, record)?;
        // Sequence is claimed only once the record is known to encode
        let plan = self.topics().plan(topic)?;
        let timeout = self.inner.config.publish_timeout;

        let outcomes: Vec<(SubscriptionId, Result<()>)> = thread::scope(|s| {
            let pending: Vec<_> = plan
                .targets
                .iter()
                .map(|(id, channel)| {
                    let msg = Message::new(plan.schema_id, version, payload.clone())
                        .with_label(plan.sequence);
                    (*id, s.spawn(move || channel.send_timeout(msg, Some(timeout))))
                })
                .collect();
            pending
                .into_iter()
                .map(|(id, handle)| {
                    let outcome = match handle.join() {
                        Ok(sent) => sent.map_err(BusError::from),
                        Err(_) => Err(BusError::PeerUnavailable(id.to_string())),
                    };
                    (id, outcome)
                })
                .collect()
        });

        let mut report = PublishReport {
            topic: topic.to_string(),
            sequence: plan.sequence,
            delivered: Vec::with_capacity(outcomes.len()),
            failures: Vec::new(),
        };
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered.push(id),
                Err(error) => {
                    log::warn!(
                        "router: {:?} #{} not delivered to {}: {}",
                        topic,
                        plan.sequence,
                        id,
                        error
                    );
                    if subscriber_gone(&error) {
                        if let Ok(dead) = self.topics().remove(topic, id) {
                            log::info!("router: pruned {} from {:?}", id, topic);
                            dead.discard();
                        }
                    }
                    report.failures.push(DeliveryFailure {
                        subscription: id,
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Stop the bootstrap service and drop every binding
    ///
    /// Later operations fail with `PeerUnavailable`.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(server) = lock(&self.inner.bootstrap).take() {
            server.stop(&self.inner.caps);
        }
        let held = self.inner.caps.held();
        for cap in &held {
            let _ = self.inner.caps.release(cap);
        }
        log::info!("router: shut down ({} capabilities released)", held.len());
    }
}

fn subscriber_gone(err: &BusError) -> bool {
    matches!(
        err,
        BusError::Channel(ChannelError::PeerUnavailable(_))
            | BusError::Channel(ChannelError::Capability(CapabilityError::CapabilityRevoked(_)))
    )
}

/// Inbound capability of a channel bound to `schema_id`
fn inbound_of(channel: &Channel, schema_id: u32) -> Result<&Capability> {
    if channel.schema_id() != schema_id {
        return Err(BusError::SchemaMismatch {
            expected: schema_id,
            actual: channel.schema_id(),
        });
    }
    channel
        .inbound()
        .ok_or(BusError::Channel(ChannelError::NotBound(Direction::Inbound)))
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
