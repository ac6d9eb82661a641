//! Broker: matches publications with subscriptions and activates pairs.
//!
//! # Life of a pairing (for beginners)
//!
//! ```text
//!  Unregistered ─► Declared ─► Waiting ─► Activated ─► Torn down
//!                     │      (call/reply     ▲
//!                     │       only)          │
//!                     └──────────────────────┘  a match exists already
//! ```
//!
//! A module **publishes** what it wants to call and **subscribes** what it
//! implements.  Whenever a publication and a subscription match (same
//! interface, the publication's peer constraint admits the subscriber, same
//! path) the broker activates the pair:
//!
//! 1. derive a fresh descriptor from the base of the kind configured for the
//!    interface,
//! 2. tell the implementer to `start_server` on it,
//! 3. tell the caller to `start_proxy` towards it, for the requested events,
//! 4. record the pair and wake a publisher waiting for it.
//!
//! A call/reply `publish` with no match blocks on a condition variable of its
//! own until a subscription arrives, the publication goes away, or the broker
//! is killed.  Fan-out publications never block.
//!
//! # Locking
//!
//! One mutex guards the whole [`RegistryTable`].  It is held while the broker
//! calls out to modules, so every module sees activations in the order the
//! broker decided them.  A blocked publisher releases it while waiting and
//! re-checks the table when woken.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use modlink_core::protocol::SequenceCounter;
use modlink_core::{
    ActivationPair, DescriptorError, EventId, EventMask, InterfaceKind, ModuleHandle,
    ProtocolDescriptor, ProtocolKind, PublicationId, SubscriptionId,
};
use modlink_runtime::{
    ActivationRequest, CallError, ModuleControl, ProxyCommand, PublishOutcome, PublishRequest,
    ServerCommand, SubscribeRequest, UnpublishRequest,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::pairing::PairingPlan;
use super::table::{BrokerSnapshot, ModuleEntry, RegistryTable};

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The request names a module that never registered or already left.
    #[error("{0} is not registered")]
    UnknownModule(ModuleHandle),

    /// The descriptor family of the chosen protocol kind ran out.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// A module did not carry out a command.
    #[error("{module} refused {command}: {source}")]
    Refused {
        module: ModuleHandle,
        command: &'static str,
        #[source]
        source: CallError,
    },
}

/// The matching engine.  Shared between the rendezvous servers as
/// `Arc<Broker>`.
pub struct Broker {
    table: Mutex<RegistryTable>,
    plan: PairingPlan,
    cursor: SequenceCounter,
}

impl Broker {
    pub fn new(plan: PairingPlan) -> Self {
        Self {
            table: Mutex::new(RegistryTable::new()),
            plan,
            cursor: SequenceCounter::starting_at(1),
        }
    }

    pub fn plan(&self) -> &PairingPlan {
        &self.plan
    }

    fn lock(&self) -> MutexGuard<'_, RegistryTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Modules ───────────────────────────────────────────────────────────────

    /// Adds a module.  A handle that is still known belongs to a module that
    /// died without unregistering; its state is withdrawn first.
    ///
    /// Returns `true` when stale state was reclaimed.
    pub fn register_module(
        &self,
        handle: ModuleHandle,
        name: &str,
        control: Arc<dyn ModuleControl>,
    ) -> bool {
        let mut table = self.lock();
        let reclaimed = table.contains_module(handle);
        if reclaimed {
            warn!(%handle, module = name, "handle is still registered; reclaiming stale state");
            self.withdraw_module(&mut table, handle);
        }
        table.insert_module(ModuleEntry {
            handle,
            name: name.to_string(),
            control,
        });
        info!(%handle, module = name, modules = table.module_count(), "module registered");
        reclaimed
    }

    /// Removes a module with every publication, subscription, pair and
    /// waiter it owns.  Peers are told to stop their side of each pair.
    ///
    /// Returns `false` (and changes nothing) for an unknown handle.
    pub fn unregister_module(&self, handle: ModuleHandle) -> bool {
        let mut table = self.lock();
        if !table.contains_module(handle) {
            info!(%handle, "unregister of unknown module ignored");
            return false;
        }
        self.withdraw_module(&mut table, handle);
        info!(%handle, modules = table.module_count(), "module unregistered");
        true
    }

    fn withdraw_module(&self, table: &mut RegistryTable, handle: ModuleHandle) {
        for id in table.publications_of(handle) {
            self.drop_publication(table, id, Some(handle));
        }
        for id in table.subscriptions_of(handle) {
            self.drop_subscription(table, id, handle);
        }
        table.remove_module(handle);
    }

    // ── Declarations ──────────────────────────────────────────────────────────

    /// Declares (or re-declares) a publication and activates every matching
    /// subscription.
    ///
    /// A call/reply publication with no match blocks until it is matched
    /// ([`PublishOutcome::Matched`]), withdrawn ([`PublishOutcome::Unmatched`])
    /// or the broker is killed ([`PublishOutcome::ShuttingDown`]).
    ///
    /// # Errors
    ///
    /// [`BrokerError::UnknownModule`] when `request.handle` is not registered.
    pub fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, BrokerError> {
        let mut table = self.lock();
        if !table.contains_module(request.handle) {
            return Err(BrokerError::UnknownModule(request.handle));
        }
        let (id, added) = table.upsert_publication(request);
        if added {
            info!(interface = %request.interface, handle = %request.handle, path = ?request.path, "publication declared");
        }
        if table.is_shutting_down() {
            return Ok(PublishOutcome::ShuttingDown);
        }

        for subscription in table.matching_subscriptions(id) {
            if let Err(e) = self.activate(&mut table, id, subscription, EventId::All) {
                warn!(interface = %request.interface, error = %e, "activation failed");
            }
        }
        if table.is_paired(id) {
            return Ok(PublishOutcome::Matched);
        }
        if request.kind != InterfaceKind::CallReply {
            debug!(interface = %request.interface, "fan-out publication has no subscriber yet");
            return Ok(PublishOutcome::Unmatched);
        }

        info!(interface = %request.interface, handle = %request.handle, "waiting for an implementer");
        let wake = Arc::new(Condvar::new());
        table.add_waiter(id, Arc::clone(&wake));
        loop {
            table = wake.wait(table).unwrap_or_else(PoisonError::into_inner);
            let outcome = if table.is_shutting_down() {
                Some(PublishOutcome::ShuttingDown)
            } else if table.publication(id).is_none() {
                Some(PublishOutcome::Unmatched)
            } else if table.is_paired(id) {
                Some(PublishOutcome::Matched)
            } else {
                None
            };
            if let Some(outcome) = outcome {
                table.remove_waiter(&wake);
                info!(interface = %request.interface, ?outcome, "publisher released");
                return Ok(outcome);
            }
        }
    }

    /// Declares a call/reply implementation and activates every matching
    /// publication.
    pub fn subscribe(&self, request: &SubscribeRequest) -> Result<(), BrokerError> {
        self.add_subscription(request, false)
    }

    /// Declares a fan-out implementation receiving every event.
    pub fn auto_subscribe(&self, request: &SubscribeRequest) -> Result<(), BrokerError> {
        self.add_subscription(request, true)
    }

    fn add_subscription(&self, request: &SubscribeRequest, auto: bool) -> Result<(), BrokerError> {
        let mut table = self.lock();
        if !table.contains_module(request.handle) {
            return Err(BrokerError::UnknownModule(request.handle));
        }
        let (id, added) = table.upsert_subscription(request, auto);
        if added {
            info!(interface = %request.interface, handle = %request.handle, auto, "subscription declared");
        } else {
            debug!(interface = %request.interface, handle = %request.handle, "already subscribed");
        }
        let matches = table.matching_publications(id);
        if matches.is_empty() {
            debug!(interface = %request.interface, "no publisher yet");
        }
        for publication in matches {
            if let Err(e) = self.activate(&mut table, publication, id, EventId::All) {
                warn!(interface = %request.interface, error = %e, "activation failed");
            }
        }
        Ok(())
    }

    /// Withdraws a publication and tears down its pairs on both sides.
    ///
    /// Returns `false` when there was nothing to withdraw.
    pub fn unpublish(&self, request: &UnpublishRequest) -> bool {
        let mut table = self.lock();
        match table.find_publication(request.handle, request.interface, &request.path) {
            Some(id) => {
                self.drop_publication(&mut table, id, None);
                info!(interface = %request.interface, handle = %request.handle, "publication withdrawn");
                true
            }
            None => {
                debug!(interface = %request.interface, handle = %request.handle, "nothing to unpublish");
                false
            }
        }
    }

    /// Switches `request.event` on or off for every pair the module
    /// implements, telling each caller to start or stop its proxy for it.
    ///
    /// Returns the number of pairs whose mask changed.
    pub fn activation(&self, request: &ActivationRequest) -> Result<usize, BrokerError> {
        let mut table = self.lock();
        if !table.contains_module(request.handle) {
            return Err(BrokerError::UnknownModule(request.handle));
        }
        let mut changed = 0;
        for (publication_id, subscription_id) in table.pairs_implemented_by(request.handle) {
            let Some(publication) = table.publication(publication_id).cloned() else {
                continue;
            };
            let Some(publisher) = table.control(publication.module) else {
                continue;
            };
            let Some(pair) = table.pair_mut(publication_id, subscription_id) else {
                continue;
            };
            let mask = EventMask::select(request.event, publication.num_events);
            let toggled = if request.enable {
                pair.events.enable(mask)
            } else {
                pair.events.disable(mask)
            };
            if toggled.is_empty() {
                continue;
            }
            let command = ProxyCommand {
                interface: publication.interface,
                event: request.event,
                descriptor: pair.descriptor.clone(),
                path: publication.path.clone(),
            };
            let result = if request.enable {
                publisher.start_proxy(&command)
            } else {
                publisher.stop_proxy(&command)
            };
            if let Err(e) = result {
                warn!(interface = %publication.interface, event = %request.event, error = %e, "proxy update failed");
                // The caller never saw the change, so the mask keeps matching it.
                if request.enable {
                    pair.events.disable(toggled);
                } else {
                    pair.events.enable(toggled);
                }
                continue;
            }
            changed += 1;
        }
        info!(handle = %request.handle, event = %request.event, enable = request.enable, changed, "activation applied");
        Ok(changed)
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Puts the broker into shutdown: every waiting publisher returns
    /// [`PublishOutcome::ShuttingDown`], and so does every later `publish`.
    pub fn kill(&self) {
        let mut table = self.lock();
        if table.is_shutting_down() {
            debug!("broker already shutting down");
            return;
        }
        table.set_shutting_down();
        let released = table.wake_all();
        info!(released, "broker shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().is_shutting_down()
    }

    /// Sends `kill` to every registered module.  Returns how many accepted.
    pub fn kill_modules(&self) -> usize {
        let controls = self.lock().controls();
        let mut accepted = 0;
        for (handle, control) in controls {
            match control.kill() {
                Ok(()) => accepted += 1,
                Err(e) => warn!(%handle, error = %e, "module did not accept kill"),
            }
        }
        accepted
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        self.lock().snapshot()
    }

    // ── Pairing ───────────────────────────────────────────────────────────────

    fn activate(
        &self,
        table: &mut RegistryTable,
        publication_id: PublicationId,
        subscription_id: SubscriptionId,
        event: EventId,
    ) -> Result<(), BrokerError> {
        let (Some(publication), Some(subscription)) = (
            table.publication(publication_id).cloned(),
            table.subscription(subscription_id).cloned(),
        ) else {
            return Ok(());
        };
        let publisher = table
            .control(publication.module)
            .ok_or(BrokerError::UnknownModule(publication.module))?;
        let implementer = table
            .control(subscription.module)
            .ok_or(BrokerError::UnknownModule(subscription.module))?;
        let selected = EventMask::select(event, publication.num_events);

        if let Some(pair) = table.pair_mut(publication_id, subscription_id) {
            let server = ServerCommand {
                interface: subscription.interface,
                descriptor: pair.descriptor.clone(),
                path: subscription.path.clone(),
            };
            implementer
                .restart_server(&server)
                .map_err(|source| BrokerError::Refused {
                    module: subscription.module,
                    command: "restart_server",
                    source,
                })?;
            let added = pair.events.enable(selected);
            if added.is_empty() {
                debug!(interface = %publication.interface, descriptor = %pair.descriptor, "pair already active");
                return Ok(());
            }
            let proxy = ProxyCommand {
                interface: publication.interface,
                event,
                descriptor: server.descriptor,
                path: publication.path.clone(),
            };
            if let Err(source) = publisher.start_proxy(&proxy) {
                pair.events.disable(added);
                return Err(BrokerError::Refused {
                    module: publication.module,
                    command: "start_proxy",
                    source,
                });
            }
            return Ok(());
        }

        let kind = self.plan.kind_for(publication.interface);
        let index = self.cursor.next();
        let mut descriptor = self.plan.base(kind).derive(index)?;
        if kind == ProtocolKind::NativeChannel && publication.kind == InterfaceKind::FanOut {
            let region = table
                .shared_region(publication_id)
                .unwrap_or_else(|| region_name(&descriptor, index));
            descriptor = descriptor.with_region(region);
        }

        let server = ServerCommand {
            interface: subscription.interface,
            descriptor: descriptor.clone(),
            path: subscription.path.clone(),
        };
        let bound = implementer
            .start_server(&server)
            .map_err(|source| BrokerError::Refused {
                module: subscription.module,
                command: "start_server",
                source,
            })?;
        if bound != descriptor {
            info!(requested = %descriptor, %bound, "implementer bound another descriptor");
        }
        // The pair and the caller's proxy follow what the server listens on.
        let descriptor = bound;
        let proxy = ProxyCommand {
            interface: publication.interface,
            event,
            descriptor: descriptor.clone(),
            path: publication.path.clone(),
        };
        if let Err(source) = publisher.start_proxy(&proxy) {
            if let Err(e) = implementer.stop_server(&server) {
                debug!(%descriptor, error = %e, "could not stop orphaned server");
            }
            return Err(BrokerError::Refused {
                module: publication.module,
                command: "start_proxy",
                source,
            });
        }

        info!(
            interface = %publication.interface,
            caller = %publication.module,
            implementer = %subscription.module,
            %descriptor,
            "pair activated"
        );
        table.add_pair(ActivationPair {
            publication: publication_id,
            subscription: subscription_id,
            descriptor,
            events: selected,
        });
        table.wake_waiters(publication_id);
        Ok(())
    }

    /// Removes a publication and its pairs.  Implementers stop the servers of
    /// those pairs; the publisher detaches its proxy unless it is `leaving`.
    fn drop_publication(
        &self,
        table: &mut RegistryTable,
        id: PublicationId,
        leaving: Option<ModuleHandle>,
    ) {
        let Some((publication, pairs)) = table.remove_publication(id) else {
            return;
        };
        table.wake_waiters(id);
        for pair in pairs {
            if let Some(subscription) = table.subscription(pair.subscription) {
                if Some(subscription.module) != leaving {
                    let command = ServerCommand {
                        interface: subscription.interface,
                        descriptor: pair.descriptor.clone(),
                        path: subscription.path.clone(),
                    };
                    notify(table, subscription.module, "stop_server", |c| c.stop_server(&command));
                }
            }
            if Some(publication.module) != leaving {
                let command = ProxyCommand {
                    interface: publication.interface,
                    event: EventId::All,
                    descriptor: pair.descriptor,
                    path: publication.path.clone(),
                };
                notify(table, publication.module, "stop_proxy", |c| c.stop_proxy(&command));
            }
        }
    }

    /// Removes a subscription of the `leaving` module and detaches the
    /// callers' proxies of its pairs.
    fn drop_subscription(&self, table: &mut RegistryTable, id: SubscriptionId, leaving: ModuleHandle) {
        let Some((_, pairs)) = table.remove_subscription(id) else {
            return;
        };
        for pair in pairs {
            let Some(publication) = table.publication(pair.publication) else {
                continue;
            };
            if publication.module == leaving {
                continue;
            }
            let command = ProxyCommand {
                interface: publication.interface,
                event: EventId::All,
                descriptor: pair.descriptor,
                path: publication.path.clone(),
            };
            notify(table, publication.module, "stop_proxy", |c| c.stop_proxy(&command));
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("plan", &self.plan)
            .field("cursor", &self.cursor.current())
            .finish_non_exhaustive()
    }
}

/// Best-effort teardown command; failures are logged.
fn notify(
    table: &RegistryTable,
    module: ModuleHandle,
    command: &'static str,
    send: impl FnOnce(&dyn ModuleControl) -> Result<(), CallError>,
) {
    let Some(control) = table.control(module) else {
        return;
    };
    if let Err(e) = send(control.as_ref()) {
        warn!(%module, command, error = %e, "teardown command failed");
    }
}

/// Name of a new shared region: unique per broker through the cursor.
fn region_name(descriptor: &ProtocolDescriptor, index: u32) -> String {
    match descriptor {
        ProtocolDescriptor::NativeChannel(ep) => format!("xfer-{}-{index}", ep.station),
        _ => format!("xfer-{index}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
