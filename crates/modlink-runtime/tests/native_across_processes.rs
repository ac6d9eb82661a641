//! Native-channel pulses between two real processes.
//!
//! # Purpose
//!
//! The test binary runs itself a second time as the publisher.  The child
//! stages its event in the shared region and sends the pulse; the parent
//! receives it, reads the payload out of the same region, and checks that
//! the slot the child reserved comes back once the event is handled.
//!
//! ```text
//!  parent (receiver)                      child (sender)
//!  init_receiver() creates the region
//!  spawn ───────────────────────────────► init_sender() maps the region
//!                                         send_pulse(99) stages slot 0
//!  get_pulse() reads slot 0 ◄──────────── pulse [msg, slot 0]
//!  message_handled() frees slot 0
//! ```

#![cfg(unix)]

use std::env;
use std::process::Command;
use std::time::{Duration, Instant};

use modlink_core::{BufferSizing, MessageBuffer, MessageNum, ProtocolDescriptor};
use modlink_runtime::infrastructure::transport;
use modlink_runtime::{SendStatus, TransportTimeouts};

/// Set in the child; carries the station name the parent bound.
const PUBLISHER_ENV: &str = "MODLINK_TEST_PUBLISHER_STATION";
const CHANNEL: u32 = 1;

fn sizing() -> BufferSizing {
    BufferSizing {
        send_bytes: 64,
        reply_bytes: 64,
        pool_depth: 2,
    }
}

fn timeouts() -> TransportTimeouts {
    TransportTimeouts {
        idle: Duration::from_millis(50),
        reply: Duration::from_secs(3),
        slot: Duration::from_millis(500),
    }
}

fn publish_from_child(station: &str) {
    let descriptor = ProtocolDescriptor::native(station, CHANNEL);
    let mut sender = transport::open(&descriptor, sizing(), timeouts());
    sender.init_sender().unwrap();
    let mut event = MessageBuffer::new(64);
    event.set_message_number(MessageNum(1));
    event.write(&99u32).unwrap();
    event.finalize_size();

    let status = sender.send_pulse(&mut event).unwrap();

    assert_eq!(status, SendStatus::Sent);
}

#[test]
fn test_pulse_from_child_process_reaches_parent() {
    if let Ok(station) = env::var(PUBLISHER_ENV) {
        publish_from_child(&station);
        return;
    }

    // Arrange
    let station = format!("xproc-{}", std::process::id());
    let descriptor = ProtocolDescriptor::native(station.as_str(), CHANNEL);
    let mut receiver = transport::open(&descriptor, sizing(), timeouts());
    receiver.init_receiver().unwrap();
    let region = receiver.shared_region().cloned().expect("receiver maps the region");

    // Act
    let child = Command::new(env::current_exe().unwrap())
        .args([
            "test_pulse_from_child_process_reaches_parent",
            "--exact",
            "--nocapture",
        ])
        .env(PUBLISHER_ENV, &station)
        .status()
        .unwrap();
    let mut event = MessageBuffer::new(64);
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        receiver.get_pulse(&mut event).unwrap();
        if !event.is_timeout() || Instant::now() >= deadline {
            break;
        }
    }
    let free_while_pinned = region.free_slots();
    receiver.message_handled().unwrap();

    // Assert
    assert!(child.success(), "publisher process failed: {child}");
    assert!(!event.is_timeout(), "no pulse arrived from the child");
    assert_eq!(event.message_number(), MessageNum(1));
    assert_eq!(event.read::<u32>().unwrap(), 99);
    assert_eq!(free_while_pinned, 1, "the child's slot is pinned until handled");
    assert_eq!(region.free_slots(), 2);

    receiver.stop();
}
