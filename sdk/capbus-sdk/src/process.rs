//! Processes and their receive loops
//!
//! A [`Process`] is a kernel process plus its capability table. Services and
//! subscriptions are registered through `bus.bootstrap` and queued; [`Process::run`]
//! then starts one blocking receive loop per registration, each dispatching
//! to its handler. A loop ends when its handle is stopped or dropped, or when
//! the process exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cap_broker::{Capability, CapabilityError, CapabilityManager, ProcessId};
use capbus_ipc::Channel;
use capbus_router::{
    BusError, ErrorKind, Event, IncomingRequest, PublishReport, Router, SchemaPair,
    ServiceEndpoint, Subscription, TopicEndpoint,
};
use capbus_schema::Record;

use crate::error::{Result, SdkError};

/// How often an idle receive loop checks whether it was stopped
const STOP_POLL: Duration = Duration::from_millis(50);

type ServeFn = Box<dyn FnMut(&mut IncomingRequest) -> Record + Send>;
type EventFn = Box<dyn FnMut(Event) + Send>;

enum Worker {
    Service {
        endpoint: ServiceEndpoint,
        handler: ServeFn,
        stop: Arc<AtomicBool>,
    },
    Topic {
        endpoint: TopicEndpoint,
        handler: EventFn,
        stop: Arc<AtomicBool>,
    },
}

impl Worker {
    fn label(&self) -> String {
        match self {
            Worker::Service { endpoint, .. } => endpoint.name().to_string(),
            Worker::Topic { endpoint, .. } => endpoint.subscription().topic().to_string(),
        }
    }

    fn run(self, process: &str) {
        match self {
            Worker::Service {
                endpoint,
                mut handler,
                stop,
            } => {
                while !stop.load(Ordering::Acquire) {
                    match endpoint.next_request(Some(STOP_POLL)) {
                        Ok(mut request) => {
                            let response = handler(&mut request);
                            if let Err(e) = request.respond(&response) {
                                log::warn!("{}: response from {:?} lost: {}", process, endpoint.name(), e);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Timeout => {}
                        Err(e) if is_terminal(&e) => break,
                        Err(e) => log::warn!("{}: {:?} dropped a request: {}", process, endpoint.name(), e),
                    }
                }
                let _ = endpoint.close();
            }
            Worker::Topic {
                endpoint,
                mut handler,
                stop,
            } => {
                while !stop.load(Ordering::Acquire) {
                    match endpoint.next_event(Some(STOP_POLL)) {
                        Ok(event) => handler(event),
                        Err(e) if e.kind() == ErrorKind::Timeout => {}
                        Err(e) if is_terminal(&e) => break,
                        Err(e) => log::warn!(
                            "{}: dropped event on {:?}: {}",
                            process,
                            endpoint.subscription().topic(),
                            e
                        ),
                    }
                }
                let _ = endpoint.close();
            }
        }
    }
}

/// Errors after which the endpoint can never deliver again
fn is_terminal(err: &BusError) -> bool {
    match err {
        BusError::Channel(capbus_ipc::ChannelError::Capability(e)) => !matches!(
            e,
            CapabilityError::RightsExceeded { .. } | CapabilityError::UnknownBadge(_)
        ),
        _ => matches!(
            err.kind(),
            ErrorKind::PeerUnavailable | ErrorKind::CapabilityRevoked | ErrorKind::InvalidObject
        ),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A process attached to the bus
pub struct Process {
    name: String,
    caps: CapabilityManager,
    router: Router,
    pending: Mutex<Vec<Worker>>,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("pid", &self.caps.pid())
            .field("pending", &lock(&self.pending).len())
            .field("running", &lock(&self.running).len())
            .finish()
    }
}

impl Process {
    pub(crate) fn new(name: &str, caps: CapabilityManager, router: Router) -> Self {
        Self {
            name: name.to_string(),
            caps,
            router,
            pending: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> ProcessId {
        self.caps.pid()
    }

    pub fn capabilities(&self) -> &CapabilityManager {
        &self.caps
    }

    pub fn is_alive(&self) -> bool {
        self.caps.kernel().process_alive(self.caps.pid())
    }

    fn ensure_alive(&self) -> Result<()> {
        if !self.is_alive() {
            return Err(SdkError::ProcessExited(self.name.clone()));
        }
        Ok(())
    }

    /// Call a service with the bus's default deadline
    pub fn call(&self, service: &str, request: &Record) -> Result<Record> {
        Ok(self.router.call(&self.caps, service, request)?)
    }

    pub fn call_timeout(&self, service: &str, request: &Record, timeout: Duration) -> Result<Record> {
        Ok(self.router.call_timeout(&self.caps, service, request, timeout)?)
    }

    /// Call a service, moving `caps` to it along with the request
    pub fn call_with_caps(
        &self,
        service: &str,
        request: &Record,
        caps: &[Capability],
        timeout: Duration,
    ) -> Result<Record> {
        Ok(self
            .router
            .call_with_caps(&self.caps, service, request, caps, timeout)?)
    }

    pub fn publish(&self, topic: &str, message: &Record) -> Result<PublishReport> {
        Ok(self.router.publish(topic, message)?)
    }

    /// Declare a topic through `bus.bootstrap`
    pub fn declare_topic(&self, topic: &str, schema_id: u32) -> Result<()> {
        Ok(self.router.bootstrap_declare_topic(&self.caps, topic, schema_id)?)
    }

    /// Register `name` and queue a loop answering its requests with `handler`
    ///
    /// The loop starts with the next [`Process::run`]. Attached capabilities
    /// the handler does not take with [`IncomingRequest::take_caps`] are
    /// released once the response is sent.
    pub fn serve<F>(&self, name: &str, schemas: SchemaPair, handler: F) -> Result<ServiceHandle>
    where
        F: FnMut(&mut IncomingRequest) -> Record + Send + 'static,
    {
        self.ensure_alive()?;
        let root = self.caps.create_endpoint()?;
        let channel = Channel::open(&self.caps, root, schemas.request).inspect_err(|_| {
            let _ = self.caps.release(&root);
        })?;
        let endpoint = self
            .router
            .bootstrap_register_service(&self.caps, name, schemas, channel)
            .inspect_err(|_| {
                let _ = self.caps.release(&root);
            })?;

        let stop = Arc::new(AtomicBool::new(false));
        lock(&self.pending).push(Worker::Service {
            endpoint,
            handler: Box::new(handler),
            stop: Arc::clone(&stop),
        });
        Ok(ServiceHandle {
            name: name.to_string(),
            caps: self.caps.clone(),
            router: self.router.clone(),
            stop,
            active: true,
        })
    }

    /// Subscribe to `topic` and queue a loop feeding its events to `handler`
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(Event) + Send + 'static,
    {
        self.ensure_alive()?;
        let schema_id = self.router.topic_schema(topic)?;
        let root = self.caps.create_endpoint()?;
        let channel = Channel::open(&self.caps, root, schema_id).inspect_err(|_| {
            let _ = self.caps.release(&root);
        })?;
        let endpoint = self
            .router
            .bootstrap_subscribe(&self.caps, topic, channel)
            .inspect_err(|_| {
                let _ = self.caps.release(&root);
            })?;

        let subscription = endpoint.subscription().clone();
        let stop = Arc::new(AtomicBool::new(false));
        lock(&self.pending).push(Worker::Topic {
            endpoint,
            handler: Box::new(handler),
            stop: Arc::clone(&stop),
        });
        Ok(SubscriptionHandle {
            subscription,
            caps: self.caps.clone(),
            router: self.router.clone(),
            stop,
            active: true,
        })
    }

    /// Start a receive loop for every queued service and subscription
    ///
    /// Returns how many loops were started.
    pub fn run(&self) -> Result<usize> {
        self.ensure_alive()?;
        let workers: Vec<Worker> = lock(&self.pending).drain(..).collect();
        let mut running = lock(&self.running);
        let started = workers.len();
        for worker in workers {
            let process = self.name.clone();
            let handle = thread::Builder::new()
                .name(format!("{}/{}", self.name, worker.label()))
                .spawn(move || worker.run(&process))
                .map_err(|e| SdkError::Spawn(e.to_string()))?;
            running.push(handle);
        }
        log::debug!("{}: {} receive loops started", self.name, started);
        Ok(started)
    }

    /// Wait for every running loop to end
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.running).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::warn!("{}: a receive loop panicked", self.name);
            }
        }
    }

    /// Exit through the kernel
    ///
    /// Everything the process owns is destroyed and everything it holds is
    /// revoked; its loops wake up and end.
    pub fn exit(self) -> Result<()> {
        self.caps
            .kernel()
            .exit_process(self.caps.pid())
            .map_err(CapabilityError::from)?;
        log::info!("{}: exited", self.name);
        self.join();
        Ok(())
    }
}

/// A service served by a [`Process`]; dropping it stops the service
#[derive(Debug)]
pub struct ServiceHandle {
    name: String,
    caps: CapabilityManager,
    router: Router,
    stop: Arc<AtomicBool>,
    active: bool,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deregister the service and end its loop
    pub fn stop(mut self) -> Result<()> {
        self.active = false;
        self.stop.store(true, Ordering::Release);
        match self.router.bootstrap_deregister_service(&self.caps, &self.name) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ServiceNotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if self.active {
            self.stop.store(true, Ordering::Release);
            let _ = self.router.bootstrap_deregister_service(&self.caps, &self.name);
        }
    }
}

/// A subscription held by a [`Process`]; dropping it unsubscribes
#[derive(Debug)]
pub struct SubscriptionHandle {
    subscription: Subscription,
    caps: CapabilityManager,
    router: Router,
    stop: Arc<AtomicBool>,
    active: bool,
}

impl SubscriptionHandle {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Unsubscribe and end the loop
    pub fn cancel(mut self) -> Result<()> {
        self.active = false;
        self.stop.store(true, Ordering::Release);
        Ok(self
            .router
            .bootstrap_unsubscribe(&self.caps, &self.subscription)?)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.active {
            self.stop.store(true, Ordering::Release);
            let _ = self.router.bootstrap_unsubscribe(&self.caps, &self.subscription);
        }
    }
}
