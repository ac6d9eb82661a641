//! Integration tests for the role objects over real transports.
//!
//! # Purpose
//!
//! Each test wires a [`ClientStub`] or [`EventBroadcaster`] to a served
//! [`ServerDispatcher`] through the public API only, the same way the
//! connector does once the broker has paired two modules:
//!
//! - call/reply over UDP, TCP, and the in-process null channel,
//! - payloads larger than one datagram,
//! - fan-out to two native-channel subscribers sharing one region: every
//!   subscriber sees the event once, the payload is encoded once, and the
//!   region slot comes back when both have handled it.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use modlink_core::{declare_interface, EventId, ProtocolDescriptor};
use modlink_runtime::infrastructure::transport::{self, datagram::MAX_DATAGRAM_PAYLOAD};
use modlink_runtime::{serve, ClientStub, EventBroadcaster, ServerDispatcher, TransportTimeouts};

declare_interface! {
    mod archive {
        id: 950,
        kind: CallReply,
        sizing: (20_000, 20_000, 1),
        calls: {
            STORE => store(Vec<u8>) -> u32;
            NAME => name() -> String;
        }
    }
}

declare_interface! {
    mod readings {
        id: 951,
        kind: FanOut,
        sizing: (32, 0, 4),
        calls: {
            SAMPLE => sample(u32);
        }
    }
}

fn timeouts() -> TransportTimeouts {
    TransportTimeouts {
        idle: Duration::from_millis(20),
        reply: Duration::from_secs(3),
        slot: Duration::from_millis(200),
    }
}

fn archive_dispatcher() -> Arc<ServerDispatcher> {
    Arc::new(
        ServerDispatcher::new(archive::CATALOG)
            .on(archive::STORE, |req, reply| {
                let bytes: Vec<u8> = req.read()?;
                let sum = bytes.iter().map(|&b| u32::from(b)).sum::<u32>();
                reply.write(&sum)?;
                Ok(())
            })
            .on(archive::NAME, |_, reply| {
                reply.write_str("archive")?;
                Ok(())
            }),
    )
}

/// Serves the archive at `descriptor`, calls it, and returns the results of
/// one small and one large call.
fn round_trip(descriptor: ProtocolDescriptor, large: usize) -> (String, u32) {
    let mut server = serve(
        archive_dispatcher(),
        transport::open(&descriptor, archive::CATALOG.sizing, timeouts()),
        None,
    )
    .expect("server must start");
    let stub = ClientStub::new(archive::CATALOG, &descriptor, timeouts());
    let payload = vec![1u8; large];

    let name = stub
        .call(archive::NAME, |_| Ok(()), |b| b.read::<String>())
        .expect("name call");
    let sum = stub
        .call(archive::STORE, |b| b.write(&payload), |b| b.read::<u32>())
        .expect("store call");

    stub.disconnect();
    server.stop();
    (name, sum)
}

// ── Call/reply ────────────────────────────────────────────────────────────────

#[test]
fn test_call_reply_over_null_channel() {
    let (name, sum) = round_trip(ProtocolDescriptor::null(9950), 100);

    assert_eq!(name, "archive");
    assert_eq!(sum, 100);
}

#[test]
fn test_call_reply_over_datagram_with_fragmented_payload() {
    // Arrange: a payload spanning two datagrams.
    let large = MAX_DATAGRAM_PAYLOAD + 500;

    // Act
    let (name, sum) = round_trip(ProtocolDescriptor::datagram("127.0.0.1", 47951), large);

    // Assert
    assert_eq!(name, "archive");
    assert_eq!(sum, u32::try_from(large).unwrap());
}

#[test]
fn test_call_reply_over_stream() {
    let (name, sum) = round_trip(ProtocolDescriptor::stream("127.0.0.1", 47952), 15_000);

    assert_eq!(name, "archive");
    assert_eq!(sum, 15_000);
}

#[test]
fn test_stub_reconnects_after_server_restart() {
    // Arrange
    let descriptor = ProtocolDescriptor::stream("127.0.0.1", 47953);
    let stub = ClientStub::new(archive::CATALOG, &descriptor, timeouts());
    let mut first = serve(
        archive_dispatcher(),
        transport::open(&descriptor, archive::CATALOG.sizing, timeouts()),
        None,
    )
    .unwrap();
    stub.call(archive::NAME, |_| Ok(()), |b| b.read::<String>())
        .unwrap();

    // Act: replace the server; the stale connection fails once at most.
    first.stop();
    let mut second = serve(
        archive_dispatcher(),
        transport::open(&descriptor, archive::CATALOG.sizing, timeouts()),
        None,
    )
    .unwrap();
    let retried = (0..3).find_map(|_| {
        stub.call(archive::NAME, |_| Ok(()), |b| b.read::<String>())
            .ok()
    });
    second.stop();

    // Assert
    assert_eq!(retried.as_deref(), Some("archive"));
}

// ── Fan-out over native channels ──────────────────────────────────────────────

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[cfg(unix)]
#[test]
fn test_two_native_subscribers_receive_one_encoded_event() {
    use modlink_runtime::infrastructure::transport::region::SharedRegion;

    // Arrange: two implementers on separate channels sharing one region.
    let station = format!("quartet-{}", std::process::id());
    let region_name = format!("{station}-readings");
    let first = ProtocolDescriptor::native(station.as_str(), 1).with_region(region_name.as_str());
    let second = ProtocolDescriptor::native(station.as_str(), 2).with_region(region_name.as_str());

    let received = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = {
        let received = Arc::clone(&received);
        Arc::new(
            ServerDispatcher::new(readings::CATALOG).on(readings::SAMPLE, move |event, _| {
                received.lock().unwrap().push(event.read::<u32>()?);
                Ok(())
            }),
        )
    };
    let mut servers: Vec<_> = [&first, &second]
        .into_iter()
        .map(|d| {
            serve(
                Arc::clone(&dispatcher),
                transport::open(d, readings::CATALOG.sizing, timeouts()),
                None,
            )
            .unwrap()
        })
        .collect();

    let mut broadcaster = EventBroadcaster::new(readings::CATALOG, timeouts());
    broadcaster.add_subscriber(EventId::All, &first).unwrap();
    broadcaster.add_subscriber(EventId::All, &second).unwrap();
    let mut encodes = 0;

    // Act
    let report = broadcaster
        .broadcast(readings::SAMPLE, |buf| {
            encodes += 1;
            buf.write(&7u32)
        })
        .unwrap();
    let both_arrived = wait_until(Duration::from_secs(2), || received.lock().unwrap().len() >= 2);

    // Assert
    assert!(both_arrived, "each subscriber must receive the event");
    assert_eq!(*received.lock().unwrap(), vec![7, 7]);
    assert_eq!(encodes, 1);
    assert_eq!(report.delivered, 2);
    assert_eq!(broadcaster.region_names(), vec![region_name.as_str()]);

    let region = SharedRegion::lookup(&region_name).expect("region is alive");
    let depth = readings::CATALOG.sizing.pool_depth;
    assert!(
        wait_until(Duration::from_secs(1), || region.free_slots() == depth),
        "slot must return once both readers released it"
    );

    for server in &mut servers {
        server.stop();
    }
}

#[cfg(unix)]
#[test]
fn test_removing_one_native_subscriber_keeps_shared_region() {
    // Arrange
    let station = format!("quartet-rm-{}", std::process::id());
    let region_name = format!("{station}-readings");
    let first = ProtocolDescriptor::native(station.as_str(), 1).with_region(region_name.as_str());
    let second = ProtocolDescriptor::native(station.as_str(), 2).with_region(region_name.as_str());
    let mut broadcaster = EventBroadcaster::new(readings::CATALOG, timeouts());
    broadcaster.add_subscriber(EventId::All, &first).unwrap();
    broadcaster.add_subscriber(EventId::All, &second).unwrap();

    // Act
    broadcaster.remove_subscriber(EventId::All, &first);
    let after_one = broadcaster.region_names().len();
    broadcaster.remove_subscriber(EventId::All, &second);

    // Assert
    assert_eq!(after_one, 1);
    assert!(broadcaster.region_names().is_empty());
    assert_eq!(broadcaster.sender_count(), 0);
}
