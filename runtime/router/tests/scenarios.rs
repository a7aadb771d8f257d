//! End-to-end router scenarios: one kernel, one router, several processes.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cap_broker::{CapabilityManager, Kernel};
use capbus_ipc::Channel;
use capbus_router::{
    BusError, ErrorKind, Router, RouterConfig, SchemaPair, ServiceEndpoint, BOOTSTRAP_SERVICE,
};
use capbus_schema::{FieldType, Layout, Record, SchemaRegistry, Version};

const ECHO: u32 = 0x0000_EC40;
const TEMPS: u32 = 0x0000_7E30;

fn setup() -> (Kernel, Router) {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = Kernel::new();
    let registry = Arc::new(SchemaRegistry::new());
    let v1 = Version::new(1, 0);
    registry
        .register_layout(Layout::builder(ECHO, v1).field("text", FieldType::String).build().unwrap())
        .unwrap();
    registry
        .register_layout(Layout::builder(TEMPS, v1).field("reading", FieldType::U64).build().unwrap())
        .unwrap();

    let config = RouterConfig {
        publish_timeout: Duration::from_millis(100),
        reply_timeout: Duration::from_millis(200),
        default_call_timeout: Duration::from_secs(2),
    };
    let router = Router::start(&kernel, registry, config).unwrap();
    (kernel, router)
}

fn process(kernel: &Kernel, name: &str) -> CapabilityManager {
    CapabilityManager::new(kernel.clone(), kernel.spawn_process(name))
}

fn inbox(caps: &CapabilityManager, schema: u32) -> Channel {
    Channel::open(caps, caps.create_endpoint().unwrap(), schema).unwrap()
}

fn serve_echo(endpoint: ServiceEndpoint) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(request) = endpoint.next_request(None) {
            let reply = request.record().clone();
            let _ = request.respond(&reply);
        }
    })
}

fn text(s: &str) -> Record {
    Record::new().with("text", s)
}

fn reading(n: u64) -> Record {
    Record::new().with("reading", n)
}

#[test]
fn echo_service_answers_call() {
    let (kernel, router) = setup();
    let server = process(&kernel, "echo");
    let endpoint = router
        .register_service(&server, "echo", SchemaPair::symmetric(ECHO), inbox(&server, ECHO))
        .unwrap();
    serve_echo(endpoint);

    let client = process(&kernel, "client");
    let reply = router.call(&client, "echo", &text("hi")).unwrap();
    assert_eq!(reply, text("hi"));

    // The reply endpoint is gone once the call returns
    assert!(client.is_empty());
}

#[test]
fn request_identifies_caller_and_badge() {
    let (kernel, router) = setup();
    let server = process(&kernel, "echo");
    let endpoint = router
        .register_service(&server, "echo", SchemaPair::symmetric(ECHO), inbox(&server, ECHO))
        .unwrap();
    let inbound = *endpoint.channel().inbound().unwrap();

    let handle = thread::spawn(move || {
        let request = endpoint.next_request(None).unwrap();
        let caller = request.caller();
        let via = endpoint.channel().capabilities().lookup(request.badge()).unwrap();
        let reply = request.record().clone();
        request.respond(&reply).unwrap();
        (caller, via)
    });

    let client = process(&kernel, "client");
    router.call(&client, "echo", &text("who")).unwrap();
    let (caller, via) = handle.join().unwrap();
    assert_eq!(caller, Some(client.pid()));
    assert_eq!(via.object().id, inbound.object().id);
}

#[test]
fn second_registration_is_name_taken() {
    let (kernel, router) = setup();
    let first = process(&kernel, "auth-1");
    let second = process(&kernel, "auth-2");

    let endpoint = router
        .register_service(&first, "auth", SchemaPair::symmetric(ECHO), inbox(&first, ECHO))
        .unwrap();
    serve_echo(endpoint);

    let err = router
        .register_service(&second, "auth", SchemaPair::symmetric(ECHO), inbox(&second, ECHO))
        .unwrap_err();
    assert_eq!(err, BusError::NameTaken("auth".into()));
    assert_eq!(err.kind(), ErrorKind::NameTaken);

    let err = router
        .bootstrap_register_service(&second, "auth", SchemaPair::symmetric(ECHO), inbox(&second, ECHO))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameTaken);

    // The original binding is untouched
    assert_eq!(router.lookup("auth").unwrap().owner, first.pid());
    let client = process(&kernel, "client");
    assert_eq!(router.call(&client, "auth", &text("ok")).unwrap(), text("ok"));
}

#[test]
fn timeout_then_later_call_succeeds() {
    let (kernel, router) = setup();
    let server = process(&kernel, "slow");
    let endpoint = router
        .register_service(&server, "slow", SchemaPair::symmetric(ECHO), inbox(&server, ECHO))
        .unwrap();

    thread::spawn(move || {
        // Sit on the first request past the caller's deadline
        let first = endpoint.next_request(None).unwrap();
        thread::sleep(Duration::from_millis(300));
        let reply = first.record().clone();
        assert!(first.respond(&reply).is_err());
        serve_echo(endpoint).join().unwrap();
    });

    let client = process(&kernel, "client");
    let start = Instant::now();
    let err = router
        .call_timeout(&client, "slow", &text("one"), Duration::from_millis(100))
        .unwrap_err();
    let elapsed = start.elapsed();
    assert_eq!(err, BusError::Timeout);
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(250), "{elapsed:?}");

    let reply = router
        .call_timeout(&client, "slow", &text("two"), Duration::from_secs(2))
        .unwrap();
    assert_eq!(reply, text("two"));
}

#[test]
fn call_to_exited_service_is_service_not_found() {
    let (kernel, router) = setup();
    let server = process(&kernel, "echo");
    let endpoint = router
        .register_service(&server, "echo", SchemaPair::symmetric(ECHO), inbox(&server, ECHO))
        .unwrap();
    serve_echo(endpoint);

    kernel.exit_process(server.pid()).unwrap();

    let client = process(&kernel, "client");
    let err = router.call(&client, "echo", &text("hi")).unwrap_err();
    assert_eq!(err, BusError::ServiceNotFound("echo".into()));
    assert!(router.list_services().iter().all(|s| s.name != "echo"));
}

#[test]
fn service_exiting_mid_call_is_peer_unavailable() {
    let (kernel, router) = setup();
    let server = process(&kernel, "flaky");
    let endpoint = router
        .register_service(&server, "flaky", SchemaPair::symmetric(ECHO), inbox(&server, ECHO))
        .unwrap();

    let exiting = kernel.clone();
    let pid = server.pid();
    thread::spawn(move || {
        let request = endpoint.next_request(None).unwrap();
        exiting.exit_process(pid).unwrap();
        drop(request);
    });

    let client = process(&kernel, "client");
    let start = Instant::now();
    let err = router
        .call_timeout(&client, "flaky", &text("hi"), Duration::from_secs(5))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerUnavailable);
    assert!(start.elapsed() < Duration::from_secs(2));

    let err = router.call(&client, "flaky", &text("again")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceNotFound);
}

#[test]
fn stale_call_leaves_replacement_registered() {
    let (kernel, router) = setup();
    let first = process(&kernel, "svc-a");
    let endpoint = router
        .register_service(&first, "svc", SchemaPair::symmetric(ECHO), inbox(&first, ECHO))
        .unwrap();

    let (exiting, registering) = (kernel.clone(), router.clone());
    let pid = first.pid();
    let replacement = thread::spawn(move || {
        let request = endpoint.next_request(None).unwrap();
        exiting.exit_process(pid).unwrap();
        drop(request);
        let second = process(&exiting, "svc-b");
        let endpoint = registering
            .register_service(&second, "svc", SchemaPair::symmetric(ECHO), inbox(&second, ECHO))
            .unwrap();
        (second, endpoint)
    });

    let client = process(&kernel, "client");
    let err = router
        .call_timeout(&client, "svc", &text("hi"), Duration::from_secs(5))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerUnavailable);

    let (second, endpoint) = replacement.join().unwrap();
    assert_eq!(router.lookup("svc").unwrap().owner, second.pid());
    serve_echo(endpoint);
    assert_eq!(router.call(&client, "svc", &text("again")).unwrap(), text("again"));
}

#[test]
fn only_the_owner_deregisters_or_unsubscribes() {
    let (kernel, router) = setup();
    let server = process(&kernel, "echo");
    let other = process(&kernel, "other");
    let _endpoint = router
        .register_service(&server, "echo", SchemaPair::symmetric(ECHO), inbox(&server, ECHO))
        .unwrap();

    assert!(matches!(
        router.deregister_service(&other, "echo"),
        Err(BusError::NotOwner { .. })
    ));
    assert_eq!(router.lookup("echo").unwrap().owner, server.pid());
    router.deregister_service(&server, "echo").unwrap();
    assert!(matches!(router.lookup("echo"), Err(BusError::ServiceNotFound(_))));

    router.register_topic("temps", TEMPS).unwrap();
    let sub = process(&kernel, "sub");
    let events = router.subscribe(&sub, "temps", inbox(&sub, TEMPS)).unwrap();
    assert!(matches!(
        router.unsubscribe(&other, events.subscription()),
        Err(BusError::NotOwner { .. })
    ));
    assert_eq!(router.list_topics()[0].subscribers, 1);
    router.unsubscribe(&sub, events.subscription()).unwrap();
    assert_eq!(router.list_topics()[0].subscribers, 0);
}

#[test]
fn request_schema_is_enforced() {
    let (kernel, router) = setup();
    let server = process(&kernel, "echo");
    let endpoint = router
        .register_service(&server, "echo", SchemaPair::symmetric(ECHO), inbox(&server, ECHO))
        .unwrap();
    serve_echo(endpoint);

    let client = process(&kernel, "client");
    let err = router.call(&client, "echo", &reading(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);

    // A channel bound to another schema cannot back a service
    let other = process(&kernel, "other");
    let err = router
        .register_service(&other, "other", SchemaPair::symmetric(ECHO), inbox(&other, TEMPS))
        .unwrap_err();
    assert_eq!(err, BusError::SchemaMismatch { expected: ECHO, actual: TEMPS });
}

#[test]
fn attached_capabilities_reach_the_service() {
    let (kernel, router) = setup();
    let server = process(&kernel, "store");
    let endpoint = router
        .register_service(&server, "store", SchemaPair::symmetric(ECHO), inbox(&server, ECHO))
        .unwrap();

    let handle = thread::spawn(move || {
        let mut request = endpoint.next_request(None).unwrap();
        let caps = request.take_caps();
        let reply = request.record().clone();
        request.respond(&reply).unwrap();
        caps
    });

    let client = process(&kernel, "client");
    let region = client.create_memory_region(4096).unwrap();
    let shared = client
        .delegate(&region, cap_broker::Rights::SEND | cap_broker::Rights::GRANT)
        .unwrap();
    router
        .call_with_caps(&client, "store", &text("buf"), &[shared], Duration::from_secs(2))
        .unwrap();

    let received = handle.join().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].object().id, region.object().id);
    assert!(client.validate(&shared).is_err());
    assert!(client.validate(&region).is_ok());
}

#[test]
fn unsubscribed_process_receives_nothing() {
    let (kernel, router) = setup();
    router.register_topic("temps", TEMPS).unwrap();

    let leaving = process(&kernel, "leaving");
    let staying = process(&kernel, "staying");
    let gone = router.subscribe(&leaving, "temps", inbox(&leaving, TEMPS)).unwrap();
    let kept = router.subscribe(&staying, "temps", inbox(&staying, TEMPS)).unwrap();
    let kept_id = kept.subscription().id();

    router.unsubscribe(&leaving, gone.subscription()).unwrap();
    assert!(matches!(
        router.unsubscribe(&leaving, gone.subscription()),
        Err(BusError::NotSubscribed(_))
    ));

    let reader = thread::spawn(move || kept.next_event(Some(Duration::from_secs(2))).unwrap());
    let report = router.publish("temps", &reading(21)).unwrap();
    assert_eq!(report.delivered, vec![kept_id]);
    assert!(report.is_complete());
    assert_eq!(reader.join().unwrap().record, reading(21));

    let err = gone.next_event(Some(Duration::from_millis(100))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn single_publisher_order_is_preserved() {
    let (kernel, router) = setup();
    router.register_topic("temps", TEMPS).unwrap();
    let sub = process(&kernel, "sub");
    let events = router.subscribe(&sub, "temps", inbox(&sub, TEMPS)).unwrap();

    let reader = thread::spawn(move || {
        (0..10)
            .map(|_| events.next_event(Some(Duration::from_secs(2))).unwrap())
            .collect::<Vec<_>>()
    });
    for n in 0..10u64 {
        let report = router.publish("temps", &reading(n)).unwrap();
        assert_eq!(report.delivered.len(), 1);
    }

    let got = reader.join().unwrap();
    let readings: Vec<u64> = got.iter().map(|e| e.record.u64("reading").unwrap()).collect();
    assert_eq!(readings, (0..10).collect::<Vec<_>>());
    assert!(got.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[test]
fn stalled_subscriber_does_not_block_others() {
    let (kernel, router) = setup();
    router.register_topic("temps", TEMPS).unwrap();

    let stalled = process(&kernel, "stalled");
    let live = process(&kernel, "live");
    let never_reads = router.subscribe(&stalled, "temps", inbox(&stalled, TEMPS)).unwrap();
    let reads = router.subscribe(&live, "temps", inbox(&live, TEMPS)).unwrap();
    let (stalled_id, live_id) = (never_reads.subscription().id(), reads.subscription().id());

    let reader = thread::spawn(move || reads.next_event(Some(Duration::from_secs(2))).unwrap());
    let start = Instant::now();
    let report = router.publish("temps", &reading(7)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));

    assert_eq!(report.delivered, vec![live_id]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].subscription, stalled_id);
    assert_eq!(report.failures[0].error.kind(), ErrorKind::Timeout);
    assert_eq!(reader.join().unwrap().record, reading(7));

    // A slow subscriber stays subscribed
    assert_eq!(router.list_topics()[0].subscribers, 2);
}

#[test]
fn dead_subscriber_is_pruned() {
    let (kernel, router) = setup();
    router.register_topic("temps", TEMPS).unwrap();
    let sub = process(&kernel, "sub");
    let events = router.subscribe(&sub, "temps", inbox(&sub, TEMPS)).unwrap();
    let id = events.subscription().id();

    kernel.exit_process(sub.pid()).unwrap();

    let report = router.publish("temps", &reading(1)).unwrap();
    assert!(report.delivered.is_empty());
    assert_eq!(report.failures[0].subscription, id);
    assert_eq!(report.failures[0].error.kind(), ErrorKind::PeerUnavailable);
    assert_eq!(router.list_topics()[0].subscribers, 0);
}

#[test]
fn exited_subscriber_is_not_listed() {
    let (kernel, router) = setup();
    router.register_topic("temps", TEMPS).unwrap();
    let sub = process(&kernel, "sub");
    let _events = router.subscribe(&sub, "temps", inbox(&sub, TEMPS)).unwrap();
    assert_eq!(router.list_topics()[0].subscribers, 1);

    kernel.exit_process(sub.pid()).unwrap();
    assert_eq!(router.list_topics()[0].subscribers, 0);
}

#[test]
fn topics_must_be_declared() {
    let (kernel, router) = setup();
    let err = router.publish("nowhere", &reading(1)).unwrap_err();
    assert_eq!(err, BusError::TopicNotFound("nowhere".into()));
    assert_eq!(err.kind(), ErrorKind::ServiceNotFound);

    let sub = process(&kernel, "sub");
    assert!(matches!(
        router.subscribe(&sub, "nowhere", inbox(&sub, TEMPS)),
        Err(BusError::TopicNotFound(_))
    ));

    router.register_topic("temps", TEMPS).unwrap();
    router.register_topic("temps", TEMPS).unwrap();
    assert!(matches!(
        router.register_topic("temps", ECHO),
        Err(BusError::NameTaken(_))
    ));
}

#[test]
fn registration_through_bootstrap() {
    let (kernel, router) = setup();
    assert_eq!(router.lookup(BOOTSTRAP_SERVICE).unwrap().owner, router.pid());

    let server = process(&kernel, "echo");
    let endpoint = router
        .bootstrap_register_service(&server, "echo", SchemaPair::symmetric(ECHO), inbox(&server, ECHO))
        .unwrap();
    serve_echo(endpoint);
    assert_eq!(router.lookup("echo").unwrap().owner, server.pid());

    let client = process(&kernel, "client");
    assert_eq!(router.call(&client, "echo", &text("boot")).unwrap(), text("boot"));

    // Only the owner may deregister
    let err = router.bootstrap_deregister_service(&client, "echo").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RightsExceeded);
    router.bootstrap_deregister_service(&server, "echo").unwrap();
    assert!(matches!(router.lookup("echo"), Err(BusError::ServiceNotFound(_))));
}

#[test]
fn subscription_through_bootstrap() {
    let (kernel, router) = setup();
    let publisher = process(&kernel, "publisher");
    router.bootstrap_declare_topic(&publisher, "temps", TEMPS).unwrap();

    let sub = process(&kernel, "sub");
    let events = router.bootstrap_subscribe(&sub, "temps", inbox(&sub, TEMPS)).unwrap();
    let subscription = events.subscription().clone();

    let reader = thread::spawn(move || events.next_event(Some(Duration::from_secs(2))).unwrap());
    let report = router.publish("temps", &reading(3)).unwrap();
    assert_eq!(report.delivered, vec![subscription.id()]);
    assert_eq!(reader.join().unwrap().record, reading(3));

    let err = router.bootstrap_unsubscribe(&publisher, &subscription).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RightsExceeded);
    router.bootstrap_unsubscribe(&sub, &subscription).unwrap();
    assert_eq!(router.list_topics()[0].subscribers, 0);

    // A channel of the wrong schema is refused
    let err = router.bootstrap_subscribe(&sub, "temps", inbox(&sub, ECHO)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
}

#[test]
fn shutdown_stops_the_router() {
    let (kernel, router) = setup();
    router.register_topic("temps", TEMPS).unwrap();
    router.shutdown();

    let client = process(&kernel, "client");
    assert_eq!(
        router.call(&client, BOOTSTRAP_SERVICE, &Record::new()).unwrap_err().kind(),
        ErrorKind::PeerUnavailable
    );
    assert!(router.publish("temps", &reading(1)).is_err());
    assert!(router.capabilities().is_empty());
}
