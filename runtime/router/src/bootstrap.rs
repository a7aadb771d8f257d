//! Bootstrap service
//!
//! `bus.bootstrap` is the one name every process can reach: registration
//! of services, topic declaration and subscription are all single calls
//! against it. The registrant's endpoint capability travels attached to
//! the request, and the registrant is identified as the kernel owner of
//! the reply endpoint the call carries.
//!
//! Request (`0xB005_0001`): `op: u8, name: string, request_schema: u32,
//! response_schema: u32, id: u64`. Response (`0xB005_0002`): `status: u8,
//! id: u64, detail: string`, where a non-zero status is an [`ErrorKind`]
//! code.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cap_broker::{Capability, CapabilityManager, ProcessId, Rights};
use capbus_ipc::{Channel, ChannelError, Direction};
use capbus_schema::{FieldType, Layout, Record, SchemaRegistry, Version};

use crate::endpoint::{IncomingRequest, ServiceEndpoint, TopicEndpoint};
use crate::error::{BusError, ErrorKind, Result};
use crate::router::Router;
use crate::service_registry::SchemaPair;
use crate::topic_registry::{Subscription, SubscriptionId};

/// Well-known name of the bootstrap service
pub const BOOTSTRAP_SERVICE: &str = "bus.bootstrap";
pub const BOOTSTRAP_REQUEST_SCHEMA: u32 = 0xB005_0001;
pub const BOOTSTRAP_RESPONSE_SCHEMA: u32 = 0xB005_0002;
pub const BOOTSTRAP_VERSION: Version = Version::new(1, 0);

/// Operations understood by the bootstrap service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootstrapOp {
    RegisterService = 1,
    DeregisterService = 2,
    DeclareTopic = 3,
    Subscribe = 4,
    Unsubscribe = 5,
}

impl BootstrapOp {
    pub fn from_u8(op: u8) -> Option<Self> {
        match op {
            1 => Some(BootstrapOp::RegisterService),
            2 => Some(BootstrapOp::DeregisterService),
            3 => Some(BootstrapOp::DeclareTopic),
            4 => Some(BootstrapOp::Subscribe),
            5 => Some(BootstrapOp::Unsubscribe),
            _ => None,
        }
    }
}

pub fn request_layout() -> Result<Layout> {
    Ok(Layout::builder(BOOTSTRAP_REQUEST_SCHEMA, BOOTSTRAP_VERSION)
        .field("op", FieldType::U8)
        .field("name", FieldType::String)
        .field("request_schema", FieldType::U32)
        .field("response_schema", FieldType::U32)
        .field("id", FieldType::U64)
        .build()?)
}

pub fn response_layout() -> Result<Layout> {
    Ok(Layout::builder(BOOTSTRAP_RESPONSE_SCHEMA, BOOTSTRAP_VERSION)
        .field("status", FieldType::U8)
        .field("id", FieldType::U64)
        .field("detail", FieldType::String)
        .build()?)
}

pub(crate) fn install_schemas(registry: &SchemaRegistry) -> Result<()> {
    registry.register_layout(request_layout()?)?;
    registry.register_layout(response_layout()?)?;
    Ok(())
}

// -------------------------------------------------------------------------
// Server
// -------------------------------------------------------------------------

pub(crate) struct BootstrapServer {
    root: Capability,
    thread: Option<JoinHandle<()>>,
}

impl BootstrapServer {
    /// Destroy the bootstrap endpoint and wait for the server thread
    pub fn stop(mut self, caps: &CapabilityManager) {
        let _ = caps.release(&self.root);
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

pub(crate) fn start(router: &Router) -> Result<BootstrapServer> {
    let caps = router.capabilities();
    let schemas = SchemaPair::new(BOOTSTRAP_REQUEST_SCHEMA, BOOTSTRAP_RESPONSE_SCHEMA);

    let root = caps.create_endpoint()?;
    let send = caps.delegate(&root, Rights::SEND | Rights::GRANT)?;
    router.bind_service(BOOTSTRAP_SERVICE, schemas, send, caps.pid())?;

    let endpoint = ServiceEndpoint::new(
        BOOTSTRAP_SERVICE,
        Channel::open(caps, root, BOOTSTRAP_REQUEST_SCHEMA)?,
        schemas,
        Arc::clone(router.registry()),
        router.config().reply_timeout,
    );

    let weak = router.downgrade();
    let thread = thread::Builder::new()
        .name(BOOTSTRAP_SERVICE.to_string())
        .spawn(move || {
            log::info!("bootstrap: serving {:?}", BOOTSTRAP_SERVICE);
            loop {
                let request = match endpoint.next_request(None) {
                    Ok(request) => request,
                    Err(e) if is_endpoint_gone(&e) => break,
                    Err(e) => {
                        log::warn!("bootstrap: dropped request: {}", e);
                        continue;
                    }
                };
                let Some(inner) = weak.upgrade() else { break };
                handle(&Router::from_inner(inner), request);
            }
            log::info!("bootstrap: stopped");
        })
        .map_err(|e| BusError::PeerUnavailable(format!("{BOOTSTRAP_SERVICE}: {e}")))?;

    Ok(BootstrapServer {
        root,
        thread: Some(thread),
    })
}

fn is_endpoint_gone(err: &BusError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::PeerUnavailable | ErrorKind::CapabilityRevoked
    )
}

fn handle(router: &Router, mut request: IncomingRequest) {
    let op = request.record().u64("op").and_then(|op| u8::try_from(op).ok());
    let name = request.record().str("name").unwrap_or_default().to_string();
    let caps = request.take_caps();

    let outcome = match (op.and_then(BootstrapOp::from_u8), request.caller()) {
        (Some(op), Some(caller)) => dispatch(router, op, &name, request.record(), caller, caps),
        (known, _) => {
            release_all(router, caps);
            Err(BusError::MalformedRequest(match known {
                None => format!("unknown bootstrap op {op:?}"),
                Some(_) => "caller could not be identified".to_string(),
            }))
        }
    };

    let response = match &outcome {
        Ok(id) => Record::new()
            .with("status", 0u8)
            .with("id", *id)
            .with("detail", ""),
        Err(e) => {
            log::info!("bootstrap: op {:?} on {:?} refused: {}", op, name, e);
            Record::new()
                .with("status", e.kind().code())
                .with("id", 0u64)
                .with("detail", e.to_string())
        }
    };
    if let Err(e) = request.respond(&response) {
        log::warn!("bootstrap: response not delivered: {}", e);
    }
}

fn release_all(router: &Router, caps: impl IntoIterator<Item = Capability>) {
    for cap in caps {
        let _ = router.capabilities().release(&cap);
    }
}

/// Run one op; the attached capabilities are either bound or released
fn dispatch(
    router: &Router,
    op: BootstrapOp,
    name: &str,
    record: &Record,
    caller: ProcessId,
    caps: Vec<Capability>,
) -> Result<u64> {
    let field = |f: &str| record.u64(f).unwrap_or_default();
    let schema = |f: &str| u32::try_from(field(f)).unwrap_or_default();

    let mut caps = caps.into_iter();
    let attached = caps.next();
    release_all(router, caps);

    match op {
        BootstrapOp::RegisterService => {
            let cap = owned_endpoint(router, attached, caller)?;
            let schemas = SchemaPair::new(schema("request_schema"), schema("response_schema"));
            router.bind_service(name, schemas, cap, caller)?;
            Ok(0)
        }
        BootstrapOp::Subscribe => {
            let cap = owned_endpoint(router, attached, caller)?;
            let subscription = router.bind_subscription(name, schema("request_schema"), cap, caller)?;
            Ok(subscription.id().0)
        }
        BootstrapOp::DeregisterService => {
            release_all(router, attached);
            router.deregister_as(caller, name)?;
            Ok(0)
        }
        BootstrapOp::DeclareTopic => {
            release_all(router, attached);
            router.register_topic(name, schema("request_schema"))?;
            Ok(0)
        }
        BootstrapOp::Unsubscribe => {
            release_all(router, attached);
            router.unsubscribe_as(caller, name, SubscriptionId(field("id")))?;
            Ok(0)
        }
    }
}

/// The attached capability, which must point at an endpoint the caller owns
fn owned_endpoint(router: &Router, attached: Option<Capability>, caller: ProcessId) -> Result<Capability> {
    let cap = attached
        .ok_or_else(|| BusError::MalformedRequest("no endpoint capability attached".into()))?;
    let owner = router.kernel().object_owner(cap.object().id).ok();
    if owner != Some(caller) || !cap.object().is_endpoint() {
        let _ = router.capabilities().release(&cap);
        return Err(BusError::NotOwner {
            name: cap.object().id.to_string(),
        });
    }
    Ok(cap)
}

// -------------------------------------------------------------------------
// Client
// -------------------------------------------------------------------------

impl Router {
    fn bootstrap_call(
        &self,
        caller: &CapabilityManager,
        op: BootstrapOp,
        name: &str,
        schemas: SchemaPair,
        id: u64,
        attach: &[Capability],
    ) -> Result<u64> {
        let request = Record::new()
            .with("op", op as u8)
            .with("name", name)
            .with("request_schema", schemas.request)
            .with("response_schema", schemas.response)
            .with("id", id);
        let response = self.call_with_caps(
            caller,
            BOOTSTRAP_SERVICE,
            &request,
            attach,
            self.config().default_call_timeout,
        )?;

        let status = response.u64("status").unwrap_or(ErrorKind::Other.code() as u64);
        if status == 0 {
            return Ok(response.u64("id").unwrap_or_default());
        }
        let kind = u8::try_from(status)
            .ok()
            .and_then(ErrorKind::from_code)
            .unwrap_or(ErrorKind::Other);
        let detail = response.str("detail").unwrap_or_default().to_string();
        Err(match kind {
            ErrorKind::NameTaken => BusError::NameTaken(name.to_string()),
            _ => BusError::Remote { kind, detail },
        })
    }

    /// Delegate a `SEND | GRANT` capability to the channel's endpoint and
    /// run one bootstrap op with it attached
    fn bootstrap_attach(
        &self,
        owner: &CapabilityManager,
        channel: &Channel,
        op: BootstrapOp,
        name: &str,
        schemas: SchemaPair,
    ) -> Result<u64> {
        let inbound = channel
            .inbound()
            .ok_or(BusError::Channel(ChannelError::NotBound(Direction::Inbound)))?;
        let send = owner.delegate(inbound, Rights::SEND | Rights::GRANT)?;
        let result = self.bootstrap_call(owner, op, name, schemas, 0, &[send]);
        if result.is_err() {
            // Only still here if the request never left
            let _ = owner.release(&send);
        }
        result
    }

    /// Register a service through `bus.bootstrap`
    pub fn bootstrap_register_service(
        &self,
        owner: &CapabilityManager,
        name: &str,
        schemas: SchemaPair,
        channel: Channel,
    ) -> Result<ServiceEndpoint> {
        if channel.schema_id() != schemas.request {
            return Err(BusError::SchemaMismatch {
                expected: schemas.request,
                actual: channel.schema_id(),
            });
        }
        self.bootstrap_attach(owner, &channel, BootstrapOp::RegisterService, name, schemas)?;
        Ok(ServiceEndpoint::new(
            name,
            channel,
            schemas,
            Arc::clone(self.registry()),
            self.config().reply_timeout,
        ))
    }

    pub fn bootstrap_deregister_service(&self, owner: &CapabilityManager, name: &str) -> Result<()> {
        self.bootstrap_call(owner, BootstrapOp::DeregisterService, name, SchemaPair::new(0, 0), 0, &[])?;
        Ok(())
    }

    pub fn bootstrap_declare_topic(&self, caller: &CapabilityManager, name: &str, schema_id: u32) -> Result<()> {
        self.bootstrap_call(caller, BootstrapOp::DeclareTopic, name, SchemaPair::new(schema_id, 0), 0, &[])?;
        Ok(())
    }

    /// Subscribe through `bus.bootstrap`; the channel's schema must be the
    /// topic's
    pub fn bootstrap_subscribe(
        &self,
        subscriber: &CapabilityManager,
        topic: &str,
        channel: Channel,
    ) -> Result<TopicEndpoint> {
        let schema_id = channel.schema_id();
        let id = self.bootstrap_attach(
            subscriber,
            &channel,
            BootstrapOp::Subscribe,
            topic,
            SchemaPair::new(schema_id, 0),
        )?;
        let subscription = Subscription::new(SubscriptionId(id), topic, schema_id);
        Ok(TopicEndpoint::new(subscription, channel, Arc::clone(self.registry())))
    }

    pub fn bootstrap_unsubscribe(&self, subscriber: &CapabilityManager, subscription: &Subscription) -> Result<()> {
        self.bootstrap_call(
            subscriber,
            BootstrapOp::Unsubscribe,
            subscription.topic(),
            SchemaPair::new(subscription.schema_id(), 0),
            subscription.id().0,
            &[],
        )?;
        Ok(())
    }
}
