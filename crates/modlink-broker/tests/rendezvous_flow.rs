//! End-to-end tests: a broker and several modules in one process.
//!
//! # Purpose
//!
//! Every test starts its own [`Rendezvous`] on in-process null channels and
//! drives real [`ModuleConnector`]s through the public API:
//!
//! - a caller that publishes first blocks until an implementer subscribes,
//!   then calls it directly,
//! - an implementer that subscribes first lets the caller's publish return
//!   at once,
//! - fan-out events reach an auto-subscribed listener,
//! - `kill` releases a blocked publisher, and `kill_modules` reaches every
//!   module,
//! - an implementer leaving detaches its callers, and unregistering twice
//!   is harmless.
//!
//! Null channels live in a process-wide registry, so each test uses its own
//! channel range.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use modlink_broker::{Broker, PairingPlan, Rendezvous, RendezvousSettings};
use modlink_core::{declare_interface, ModuleHandle, ModuleId, ProtocolDescriptor, ProtocolKind};
use modlink_runtime::application::registrar::RegistrarStub;
use modlink_runtime::{
    InterfaceSpec, ModuleConfig, ModuleConnector, PublishOutcome, Registrar, ServerDispatcher,
    ShutdownSignal, TransportTimeouts,
};

declare_interface! {
    mod counter {
        id: 42,
        kind: CallReply,
        sizing: (256, 256, 1),
        calls: {
            ADD => add(u32) -> u32;
        }
    }
}

declare_interface! {
    mod alarms {
        id: 43,
        kind: FanOut,
        sizing: (64, 0, 4),
        calls: {
            RAISED => raised(u32);
        }
    }
}

const CALLER: ModuleHandle = ModuleHandle(1001);
const IMPLEMENTER: ModuleHandle = ModuleHandle(1002);
const APP: ModuleId = ModuleId(7);

// ── Fixture ───────────────────────────────────────────────────────────────────

fn timeouts() -> TransportTimeouts {
    TransportTimeouts {
        idle: Duration::from_millis(20),
        reply: Duration::from_secs(3),
        slot: Duration::from_millis(200),
    }
}

struct Fixture {
    broker: Arc<Broker>,
    signal: Arc<ShutdownSignal>,
    rendezvous: Rendezvous,
    receptor: ProtocolDescriptor,
}

/// Receptor on `base`, module endpoints from `base + 100`, pairings from
/// `base + 1000`.
fn start_broker(base: u32) -> Fixture {
    let plan = PairingPlan::new(
        ProtocolKind::Null,
        [
            ProtocolDescriptor::datagram("127.0.0.1", 51000),
            ProtocolDescriptor::stream("127.0.0.1", 52000),
            ProtocolDescriptor::native("modlink-test", base + 1000),
            ProtocolDescriptor::null(base + 1000),
        ],
    );
    let broker = Arc::new(Broker::new(plan));
    let signal = ShutdownSignal::new();
    let receptor = ProtocolDescriptor::null(base);
    let rendezvous = Rendezvous::start(
        Arc::clone(&broker),
        RendezvousSettings {
            receptor: receptor.clone(),
            module_base: ProtocolDescriptor::null(base + 100),
            timeouts: timeouts(),
        },
        Arc::clone(&signal),
    )
    .expect("rendezvous starts");
    Fixture {
        broker,
        signal,
        rendezvous,
        receptor,
    }
}

fn connector(fixture: &Fixture, name: &str, handle: ModuleHandle) -> ModuleConnector {
    let config = ModuleConfig {
        broker: fixture.receptor.clone(),
        timeouts: timeouts(),
        publish_wait: Duration::from_secs(10),
        workers: 1,
    };
    ModuleConnector::new(name, config)
        .expect("module")
        .with_handle(handle)
}

fn counter_dispatcher() -> ServerDispatcher {
    ServerDispatcher::new(counter::CATALOG).on(counter::ADD, |req, reply| {
        let n: u32 = req.read()?;
        reply.write(&(n + 1))?;
        Ok(())
    })
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

// ── Call/reply ────────────────────────────────────────────────────────────────

#[test]
fn test_publish_before_subscribe_blocks_until_implementer_arrives() {
    // Arrange
    let fixture = start_broker(70_000);
    let mut caller = connector(&fixture, "caller", CALLER);
    let proxy = caller
        .register_proxy(InterfaceSpec::new(counter::CATALOG, APP))
        .unwrap();
    let publishing = thread::spawn(move || {
        let outcome = caller.start();
        (caller, outcome)
    });
    wait_until("the caller to wait", || {
        !fixture.broker.snapshot().waiting.is_empty()
    });

    // Act
    let mut implementer = connector(&fixture, "implementer", IMPLEMENTER);
    implementer.register_handler(InterfaceSpec::new(counter::CATALOG, APP), counter_dispatcher());
    let implementer_outcome = implementer.start().unwrap();
    let (_caller, caller_outcome) = publishing.join().unwrap();

    // Assert
    assert_eq!(implementer_outcome, PublishOutcome::Matched);
    assert_eq!(caller_outcome.unwrap(), PublishOutcome::Matched);
    assert!(proxy.is_connected());
    let answer = proxy
        .call(counter::ADD, |b| b.write(&41u32), |b| b.read::<u32>())
        .unwrap();
    assert_eq!(answer, 42);
    assert_eq!(fixture.broker.snapshot().pairs.len(), 1);
}

#[test]
fn test_subscribe_first_lets_publish_return_at_once() {
    // Arrange
    let fixture = start_broker(71_000);
    let mut implementer = connector(&fixture, "implementer", IMPLEMENTER);
    implementer.register_handler(InterfaceSpec::new(counter::CATALOG, APP), counter_dispatcher());
    implementer.start().unwrap();

    // Act
    let mut caller = connector(&fixture, "caller", CALLER);
    let proxy = caller
        .register_proxy(InterfaceSpec::new(counter::CATALOG, APP))
        .unwrap();
    let outcome = caller.start().unwrap();

    // Assert
    assert_eq!(outcome, PublishOutcome::Matched);
    let answer = proxy
        .call(counter::ADD, |b| b.write(&1u32), |b| b.read::<u32>())
        .unwrap();
    assert_eq!(answer, 2);
    assert_eq!(fixture.rendezvous.registrar_count(), 2);
}

#[test]
fn test_peer_constraint_keeps_caller_waiting_until_kill() {
    // Arrange
    let fixture = start_broker(72_000);
    let mut implementer = connector(&fixture, "implementer", IMPLEMENTER);
    implementer.register_handler(
        InterfaceSpec::new(counter::CATALOG, ModuleId(8)),
        counter_dispatcher(),
    );
    implementer.start().unwrap();
    let mut caller = connector(&fixture, "caller", CALLER);
    let proxy = caller
        .register_proxy(InterfaceSpec::new(counter::CATALOG, APP).with_peer(ModuleId(9)))
        .unwrap();
    let publishing = thread::spawn(move || {
        let outcome = caller.start();
        (caller, outcome)
    });
    wait_until("the caller to wait", || {
        !fixture.broker.snapshot().waiting.is_empty()
    });

    // Act
    fixture.broker.kill();
    let (_caller, outcome) = publishing.join().unwrap();

    // Assert
    assert_eq!(outcome.unwrap(), PublishOutcome::ShuttingDown);
    assert!(!proxy.is_connected());
    assert!(fixture.broker.snapshot().pairs.is_empty());
}

// ── Fan-out ───────────────────────────────────────────────────────────────────

#[test]
fn test_fan_out_events_reach_auto_subscribed_listener() {
    // Arrange
    let fixture = start_broker(73_000);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let mut listener = connector(&fixture, "listener", IMPLEMENTER);
    listener.register_handler(
        InterfaceSpec::new(alarms::CATALOG, APP),
        ServerDispatcher::new(alarms::CATALOG).on(alarms::RAISED, move |event, _| {
            let code: u32 = event.read()?;
            sink.lock().unwrap().push(code);
            Ok(())
        }),
    );
    listener.start().unwrap();

    let mut emitter = connector(&fixture, "emitter", CALLER);
    let alarms_out = emitter
        .register_broadcaster(InterfaceSpec::new(alarms::CATALOG, APP))
        .unwrap();

    // Act
    let outcome = emitter.start().unwrap();
    let report = alarms_out
        .broadcast(alarms::RAISED, |b| b.write(&9u32))
        .unwrap();

    // Assert
    assert_eq!(outcome, PublishOutcome::Matched);
    assert_eq!(report.delivered, 1);
    wait_until("the event to arrive", || !received.lock().unwrap().is_empty());
    assert_eq!(*received.lock().unwrap(), vec![9]);
}

#[test]
fn test_fan_out_without_listener_is_unmatched() {
    let fixture = start_broker(74_000);
    let mut emitter = connector(&fixture, "emitter", CALLER);
    emitter
        .register_broadcaster(InterfaceSpec::new(alarms::CATALOG, APP))
        .unwrap();

    let outcome = emitter.start().unwrap();

    assert_eq!(outcome, PublishOutcome::Unmatched);
}

// ── Teardown ──────────────────────────────────────────────────────────────────

#[test]
fn test_implementer_leaving_detaches_caller_and_retires_registrar() {
    // Arrange
    let fixture = start_broker(75_000);
    let mut implementer = connector(&fixture, "implementer", IMPLEMENTER);
    implementer.register_handler(InterfaceSpec::new(counter::CATALOG, APP), counter_dispatcher());
    implementer.start().unwrap();
    let mut caller = connector(&fixture, "caller", CALLER);
    let proxy = caller
        .register_proxy(InterfaceSpec::new(counter::CATALOG, APP))
        .unwrap();
    caller.start().unwrap();
    assert!(proxy.is_connected());

    // Act
    implementer.shutdown();

    // Assert
    assert!(!proxy.is_connected());
    let snapshot = fixture.broker.snapshot();
    assert!(snapshot.pairs.is_empty());
    assert_eq!(snapshot.modules.len(), 1);
    wait_until("the registrar to retire", || {
        fixture.rendezvous.registrar_count() == 1
    });
}

#[test]
fn test_unregistering_twice_is_harmless() {
    // Arrange
    let fixture = start_broker(76_000);
    let mut module = connector(&fixture, "solo", CALLER);
    module.connect().unwrap();

    // Act
    module.shutdown();
    module.shutdown();

    // Assert
    assert!(!fixture.broker.unregister_module(CALLER));
    assert!(fixture.broker.snapshot().modules.is_empty());
}

// ── Kill ──────────────────────────────────────────────────────────────────────

#[test]
fn test_module_kill_request_stops_the_broker() {
    // Arrange
    let fixture = start_broker(77_000);
    let mut module = connector(&fixture, "operator", CALLER);
    module.connect().unwrap();
    let registrar = RegistrarStub::new(&module.registration().unwrap().registrar, timeouts());

    // Act
    registrar.kill().unwrap();

    // Assert
    assert!(fixture.signal.is_triggered());
    assert!(fixture.broker.is_shutting_down());
}

#[test]
fn test_kill_modules_reaches_every_module() {
    // Arrange
    let fixture = start_broker(78_000);
    let mut first = connector(&fixture, "first", CALLER);
    let mut second = connector(&fixture, "second", IMPLEMENTER);
    first.connect().unwrap();
    second.connect().unwrap();

    // Act
    let reached = fixture.broker.kill_modules();

    // Assert
    assert_eq!(reached, 2);
    assert!(first.shutdown_signal().is_triggered());
    assert!(second.shutdown_signal().is_triggered());
}
