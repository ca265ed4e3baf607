//! Single-key operations against mock servers.

mod support;

use std::time::Duration;

use memshard::{Client, Config, Error};
use support::{MockOptions, MockServer};

fn client_for(servers: &[&MockServer]) -> Client {
    let mut builder = Config::builder();
    for server in servers {
        builder = builder.server(&server.addr).unwrap();
    }
    let config = builder
        .connect_timeout(Some(Duration::from_secs(1)))
        .io_timeout(Some(Duration::from_secs(2)))
        .build()
        .unwrap();
    Client::new(config).unwrap()
}

#[test]
fn set_then_get_round_trip() {
    let a = MockServer::start();
    let b = MockServer::start();
    let mut client = client_for(&[&a, &b]);

    assert!(client.set("k", "v", 0).unwrap());
    let value = client.get("k").unwrap().expect("hit");
    assert_eq!(value.as_bytes(), Some(&b"v"[..]));

    // Exactly one server saw traffic.
    let touched = [&a, &b]
        .iter()
        .filter(|s| s.stats.connections.load(std::sync::atomic::Ordering::SeqCst) > 0)
        .count();
    assert_eq!(touched, 1);
}

#[test]
fn get_missing_key_is_a_miss_not_an_error() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);
    assert_eq!(client.get("absent").unwrap(), None);
}

#[test]
fn add_and_replace_conditional_semantics() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);

    assert!(client.add("k", "first", 0).unwrap());
    assert!(!client.add("k", "second", 0).unwrap());
    assert!(client.replace("k", "third", 0).unwrap());
    assert!(!client.replace("other", "x", 0).unwrap());

    let value = client.get("k").unwrap().expect("hit");
    assert_eq!(value.as_bytes(), Some(&b"third"[..]));
}

#[test]
fn append_and_prepend_concatenate() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);

    assert!(client.set("k", "middle", 0).unwrap());
    assert!(client.append("k", "-end").unwrap());
    assert!(client.prepend("k", "start-").unwrap());
    let value = client.get("k").unwrap().expect("hit");
    assert_eq!(value.as_bytes(), Some(&b"start-middle-end"[..]));

    assert!(!client.append("missing", "x").unwrap());
}

#[test]
fn incr_decr_and_floor_at_zero() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);

    assert!(client.set("n", "10", 0).unwrap());
    assert_eq!(client.incr("n", 5).unwrap(), Some(15));
    assert_eq!(client.decr("n", 3).unwrap(), Some(12));
    // decrement below zero floors at a real, distinguishable zero
    assert_eq!(client.decr("n", 100).unwrap(), Some(0));
    // missing counter is a miss, not zero
    assert_eq!(client.incr("nope", 1).unwrap(), None);
}

#[test]
fn delete_reports_presence() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);

    assert!(client.set("k", "v", 0).unwrap());
    assert!(client.delete("k").unwrap());
    assert!(!client.delete("k").unwrap());
    assert_eq!(client.get("k").unwrap(), None);
}

#[test]
fn cas_detects_concurrent_writer() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);
    let mut racer = client_for(&[&server]);

    assert!(client.set("k", "a", 0).unwrap());
    let (token, value) = client.gets("k").unwrap().expect("hit");
    assert_eq!(value.as_bytes(), Some(&b"a"[..]));

    // Another client wins the race.
    assert!(racer.set("k", "b", 0).unwrap());

    // Our swap must fail, and the new value must survive.
    assert!(!client.cas("k", "c", 0, token).unwrap());
    let (token2, value2) = client.gets("k").unwrap().expect("hit");
    assert_eq!(value2.as_bytes(), Some(&b"b"[..]));
    assert_ne!(token, token2);

    // With the fresh token the swap goes through.
    assert!(client.cas("k", "c", 0, token2).unwrap());
}

#[test]
fn cas_on_missing_key_returns_false() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);
    assert!(!client.cas("ghost", "v", 0, 42).unwrap());
}

#[test]
fn namespace_is_prefixed_on_the_wire() {
    let server = MockServer::start();
    let config = Config::builder()
        .server(&server.addr)
        .unwrap()
        .namespace("app:")
        .build()
        .unwrap();
    let mut client = Client::new(config).unwrap();

    assert!(client.set("k", "v", 0).unwrap());
    // The mock stored it under the prefixed key.
    assert!(server.stats.item("app:k").is_some());
    assert!(server.stats.item("k").is_none());
    // The caller never sees the prefix.
    let by_key = client.get_many_by_key(&["k"]);
    assert!(by_key.contains_key("k"));
}

#[test]
fn old_server_is_rejected_for_cas_family() {
    let server = MockServer::start_with(MockOptions {
        version: "1.2.3".to_string(),
        ..MockOptions::default()
    });
    let mut client = client_for(&[&server]);

    assert!(client.set("k", "v", 0).unwrap());
    match client.gets("k") {
        Err(Error::ServerTooOld { version, required, .. }) => {
            assert_eq!(version, "1.2.3");
            assert_eq!(required, "1.2.4");
        }
        other => panic!("expected ServerTooOld, got {other:?}"),
    }
    assert!(matches!(
        client.cas("k", "x", 0, 1),
        Err(Error::ServerTooOld { .. })
    ));
    assert!(matches!(
        client.append("k", "x"),
        Err(Error::ServerTooOld { .. })
    ));
    // get/set are not gated
    assert!(client.get("k").unwrap().is_some());
}

#[test]
fn versions_reports_every_server() {
    let a = MockServer::start();
    let b = MockServer::start_with(MockOptions {
        version: "1.4.15".to_string(),
        ..MockOptions::default()
    });
    let mut client = client_for(&[&a, &b]);

    let versions = client.versions();
    assert_eq!(versions.len(), 2);
    assert_eq!(
        versions.get(&a.addr).unwrap().clone().ok(),
        Some("1.6.21".to_string())
    );
    assert_eq!(
        versions.get(&b.addr).unwrap().clone().ok(),
        Some("1.4.15".to_string())
    );
}

#[test]
fn flush_all_spreads_the_delay() {
    let a = MockServer::start();
    let b = MockServer::start();
    let c = MockServer::start();
    let mut client = client_for(&[&a, &b, &c]);

    let results = client.flush_all(Some(30));
    assert_eq!(results.len(), 3);
    assert!(results.values().all(|o| o.clone().ok() == Some(true)));

    assert_eq!(*a.stats.flush_delays.lock().unwrap(), vec![Some(30)]);
    assert_eq!(*b.stats.flush_delays.lock().unwrap(), vec![Some(15)]);
    assert_eq!(*c.stats.flush_delays.lock().unwrap(), vec![Some(0)]);
}

#[test]
fn flush_all_single_server_gets_full_delay() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);
    client.flush_all(Some(30));
    assert_eq!(*server.stats.flush_delays.lock().unwrap(), vec![Some(30)]);
}

#[test]
fn flush_all_without_delay_sends_none() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);
    assert!(client.set("k", "v", 0).unwrap());
    client.flush_all(None);
    assert_eq!(*server.stats.flush_delays.lock().unwrap(), vec![None]);
    assert_eq!(client.get("k").unwrap(), None);
}

#[test]
fn works_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sock");
    let server = MockServer::start_unix(&path);
    let config = Config::builder()
        .server(&server.addr)
        .unwrap()
        .build()
        .unwrap();
    let mut client = Client::new(config).unwrap();

    assert!(client.set("k", "unix", 0).unwrap());
    let value = client.get("k").unwrap().expect("hit");
    assert_eq!(value.as_bytes(), Some(&b"unix"[..]));
    // canonical identity is the socket path
    assert_eq!(client.server_names(), vec![path.display().to_string()]);
}

#[test]
fn server_error_reply_surfaces_and_drops_the_connection() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);

    assert!(client.set("text", "abc", 0).unwrap());
    match client.incr("text", 1) {
        Err(Error::Server(message)) => assert!(message.contains("CLIENT_ERROR")),
        other => panic!("expected Server error, got {other:?}"),
    }

    // close_on_error defaults on: the next call opens a new connection
    // and works normally.
    let value = client.get("text").unwrap().expect("hit");
    assert_eq!(value.as_bytes(), Some(&b"abc"[..]));
    assert!(server.stats.connections.load(std::sync::atomic::Ordering::SeqCst) >= 2);
}

#[test]
fn server_error_keeps_the_connection_when_configured() {
    let server = MockServer::start();
    let config = Config::builder()
        .server(&server.addr)
        .unwrap()
        .close_on_error(false)
        .build()
        .unwrap();
    let mut client = Client::new(config).unwrap();

    assert!(client.set("text", "abc", 0).unwrap());
    assert!(matches!(client.incr("text", 1), Err(Error::Server(_))));
    let value = client.get("text").unwrap().expect("hit");
    assert_eq!(value.as_bytes(), Some(&b"abc"[..]));
    assert_eq!(
        server.stats.connections.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[test]
fn binary_values_round_trip() {
    let server = MockServer::start();
    let mut client = client_for(&[&server]);
    let blob = [0u8, 1, 2, 13, 10, 255];
    assert!(client.set("bin", &blob, 0).unwrap());
    let value = client.get("bin").unwrap().expect("hit");
    assert_eq!(value.as_bytes(), Some(&blob[..]));
}
