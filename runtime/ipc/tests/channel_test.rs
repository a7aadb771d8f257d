//! Channel behaviour across processes
//!
//! - Capability transfer inside messages
//! - Wake-ups when the peer's endpoint disappears
//! - Local revocation versus peer loss
//! - Revocation while a send or receive is blocked

use std::thread;
use std::time::{Duration, Instant};

use cap_broker::{CapabilityError, CapabilityManager, Kernel, Rights};
use capbus_ipc::{Channel, ChannelError, Message};
use capbus_schema::Version;

const SCHEMA: u32 = 0x00C0_FFEE;
const WAIT: Option<Duration> = Some(Duration::from_secs(2));

fn process(kernel: &Kernel, name: &str) -> CapabilityManager {
    CapabilityManager::new(kernel.clone(), kernel.spawn_process(name))
}

fn msg(payload: &[u8]) -> Message {
    Message::new(SCHEMA, Version::new(1, 0), payload.to_vec())
}

#[test]
fn attached_capabilities_move_to_receiver() {
    let kernel = Kernel::new();
    let server = process(&kernel, "server");
    let client = process(&kernel, "client");

    let inbound = server.create_endpoint().unwrap();
    let send = server
        .delegate(&inbound, Rights::SEND | Rights::GRANT)
        .unwrap();
    let send = server.transfer(&send, &client).unwrap();

    // The client hands the server a way to reach it
    let reply_root = client.create_endpoint().unwrap();
    let reply_send = client.delegate(&reply_root, Rights::SEND).unwrap();
    let before = client.len();

    let rx = Channel::open(&server, inbound, SCHEMA).unwrap();
    let tx = Channel::open(&client, send, SCHEMA).unwrap();
    let receiver = thread::spawn(move || rx.receive_timeout(WAIT));

    tx.send_timeout(msg(b"hello").with_cap(reply_send), WAIT).unwrap();
    let got = receiver.join().unwrap().unwrap();

    assert_eq!(client.len(), before - 1);
    assert!(matches!(
        client.validate(&reply_send),
        Err(CapabilityError::NotHeld { .. })
    ));

    assert_eq!(got.caps.len(), 1);
    let adopted = got.caps[0];
    assert_eq!(adopted.object(), reply_root.object());
    assert_eq!(adopted.rights(), Rights::SEND);
    assert!(server.validate(&adopted).is_ok());
}

#[test]
fn indirect_payload_survives_transfer() {
    let kernel = Kernel::new();
    let p = process(&kernel, "loopback");
    let root = p.create_endpoint().unwrap();
    let send = p.delegate(&root, Rights::SEND).unwrap();

    let rx = Channel::open(&p, root, SCHEMA).unwrap();
    let tx = Channel::open(&p, send, SCHEMA).unwrap();
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

    let receiver = thread::spawn(move || rx.receive_timeout(WAIT));
    tx.send_timeout(msg(&payload), WAIT).unwrap();
    assert_eq!(receiver.join().unwrap().unwrap().payload, payload);
}

#[test]
fn blocked_sender_wakes_when_peer_endpoint_is_destroyed() {
    let kernel = Kernel::new();
    let server = process(&kernel, "server");
    let client = process(&kernel, "client");

    let inbound = server.create_endpoint().unwrap();
    let send = server
        .delegate(&inbound, Rights::SEND | Rights::GRANT)
        .unwrap();
    let send = server.transfer(&send, &client).unwrap();
    let tx = Channel::open(&client, send, SCHEMA).unwrap();

    let sender = thread::spawn(move || tx.send_timeout(msg(b"stuck"), None));
    thread::sleep(Duration::from_millis(30));
    server.revoke(&inbound).unwrap();

    assert!(matches!(
        sender.join().unwrap(),
        Err(ChannelError::PeerUnavailable(_))
    ));
}

#[test]
fn blocked_receiver_wakes_on_process_exit() {
    let kernel = Kernel::new();
    let server = process(&kernel, "server");
    let inbound = server.create_endpoint().unwrap();
    let rx = Channel::open(&server, inbound, SCHEMA).unwrap();

    let receiver = thread::spawn(move || rx.receive_timeout(None));
    thread::sleep(Duration::from_millis(30));
    kernel.exit_process(server.pid()).unwrap();

    assert!(matches!(
        receiver.join().unwrap(),
        Err(ChannelError::PeerUnavailable(_))
    ));
}

/// Revoking only the delegated capability leaves the endpoint alive
#[test]
fn local_revocation_is_a_capability_error() {
    let kernel = Kernel::new();
    let server = process(&kernel, "server");
    let client = process(&kernel, "client");

    let inbound = server.create_endpoint().unwrap();
    let link = server
        .delegate(&inbound, Rights::SEND | Rights::GRANT | Rights::REVOKE)
        .unwrap();
    let send = server.delegate(&link, Rights::SEND | Rights::GRANT).unwrap();
    let send = server.transfer(&send, &client).unwrap();
    let tx = Channel::open(&client, send, SCHEMA).unwrap();

    server.revoke(&link).unwrap();
    assert!(matches!(
        tx.send_timeout(msg(b"x"), Some(Duration::from_millis(10))),
        Err(ChannelError::Capability(CapabilityError::CapabilityRevoked(_)))
    ));
}

#[test]
fn revocation_fails_a_blocked_send() {
    let kernel = Kernel::new();
    let server = process(&kernel, "server");
    let client = process(&kernel, "client");

    let inbound = server.create_endpoint().unwrap();
    let link = server
        .delegate(&inbound, Rights::SEND | Rights::GRANT | Rights::REVOKE)
        .unwrap();
    let send = server.delegate(&link, Rights::SEND | Rights::GRANT).unwrap();
    let send = server.transfer(&send, &client).unwrap();
    let tx = Channel::open(&client, send, SCHEMA).unwrap();

    let sender = thread::spawn(move || {
        let start = Instant::now();
        (tx.send_timeout(msg(b"late"), WAIT), start.elapsed())
    });
    thread::sleep(Duration::from_millis(30));
    server.revoke(&link).unwrap();

    let (result, waited) = sender.join().unwrap();
    assert!(matches!(
        result,
        Err(ChannelError::Capability(CapabilityError::CapabilityRevoked(_)))
    ));
    assert!(waited < Duration::from_secs(1));

    // Nothing reached the endpoint, which is still alive
    let rx = Channel::open(&server, inbound, SCHEMA).unwrap();
    assert!(matches!(
        rx.receive_timeout(Some(Duration::from_millis(100))),
        Err(ChannelError::Timeout)
    ));
}

#[test]
fn revocation_fails_a_blocked_receive() {
    let kernel = Kernel::new();
    let owner = process(&kernel, "owner");
    let worker = process(&kernel, "worker");

    let root = owner.create_endpoint().unwrap();
    let link = owner
        .delegate(&root, Rights::RECEIVE | Rights::GRANT | Rights::REVOKE)
        .unwrap();
    let recv = owner.delegate(&link, Rights::RECEIVE | Rights::GRANT).unwrap();
    let recv = owner.transfer(&recv, &worker).unwrap();
    let rx = Channel::open(&worker, recv, SCHEMA).unwrap();

    let receiver = thread::spawn(move || rx.receive_timeout(WAIT));
    thread::sleep(Duration::from_millis(30));
    owner.revoke(&link).unwrap();

    assert!(matches!(
        receiver.join().unwrap(),
        Err(ChannelError::Capability(CapabilityError::CapabilityRevoked(_)))
    ));
    assert!(kernel.object_alive(root.object().id));
}

#[test]
fn close_releases_bound_capabilities() {
    let kernel = Kernel::new();
    let p = process(&kernel, "p");
    let root = p.create_endpoint().unwrap();
    let ch = Channel::open(&p, root, SCHEMA).unwrap();

    ch.close().unwrap();
    assert!(p.is_empty());
    assert!(!kernel.object_alive(root.object().id));
}
