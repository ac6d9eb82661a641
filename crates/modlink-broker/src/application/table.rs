//! The broker's registration table: modules, publications, subscriptions,
//! live pairs, and the publishers blocked waiting for a match.
//!
//! # Layout (for beginners)
//!
//! Publications and subscriptions live in arenas keyed by ids the table
//! hands out itself, so a pair can refer to both sides by id and survive
//! unrelated insertions and removals:
//!
//! ```text
//!   publications   {P1, P2, ...}          subscriptions  {S1, S2, ...}
//!          ▲                                      ▲
//!          └────── pairs [(P1,S2,descr,mask), ...] ┘
//!
//!   waiting  [(P2, condvar)]   only unmatched call/reply publications
//! ```
//!
//! Nothing in here talks to a module.  The [`super::broker::Broker`] decides
//! when to call out and keeps the table consistent with what it told the
//! modules.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar};

use modlink_core::{
    ActivationPair, InterfaceId, ModuleHandle, Publication, PublicationId, Subscription,
    SubscriptionId,
};
use modlink_runtime::{ModuleControl, PublishRequest, SubscribeRequest};
use serde::Serialize;

/// One registered module.
pub struct ModuleEntry {
    pub handle: ModuleHandle,
    pub name: String,
    /// Remote control of the module (a stub in production, a mock in tests).
    pub control: Arc<dyn ModuleControl>,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct WaitingPublisher {
    publication: PublicationId,
    wake: Arc<Condvar>,
}

/// Everything the broker has been told, plus what it paired.
#[derive(Default)]
pub struct RegistryTable {
    modules: BTreeMap<ModuleHandle, ModuleEntry>,
    publications: BTreeMap<PublicationId, Publication>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    pairs: Vec<ActivationPair>,
    waiting: Vec<WaitingPublisher>,
    next_publication: u64,
    next_subscription: u64,
    shutting_down: bool,
}

impl RegistryTable {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Modules ───────────────────────────────────────────────────────────────

    /// Adds `entry`, returning the entry it replaced.
    pub fn insert_module(&mut self, entry: ModuleEntry) -> Option<ModuleEntry> {
        self.modules.insert(entry.handle, entry)
    }

    pub fn module(&self, handle: ModuleHandle) -> Option<&ModuleEntry> {
        self.modules.get(&handle)
    }

    pub fn contains_module(&self, handle: ModuleHandle) -> bool {
        self.modules.contains_key(&handle)
    }

    pub fn control(&self, handle: ModuleHandle) -> Option<Arc<dyn ModuleControl>> {
        self.modules.get(&handle).map(|m| Arc::clone(&m.control))
    }

    pub fn remove_module(&mut self, handle: ModuleHandle) -> Option<ModuleEntry> {
        self.modules.remove(&handle)
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Every module's control, for broadcasting `kill`.
    pub fn controls(&self) -> Vec<(ModuleHandle, Arc<dyn ModuleControl>)> {
        self.modules
            .values()
            .map(|m| (m.handle, Arc::clone(&m.control)))
            .collect()
    }

    // ── Declarations ──────────────────────────────────────────────────────────

    /// Finds the publication `request` declares, or adds it.  Returns the id
    /// and whether it was new.
    pub fn upsert_publication(&mut self, request: &PublishRequest) -> (PublicationId, bool) {
        if let Some(existing) = self
            .publications
            .values()
            .find(|p| p.same_declaration(request.handle, request.interface, &request.path))
        {
            return (existing.id, false);
        }
        self.next_publication += 1;
        let id = PublicationId(self.next_publication);
        self.publications.insert(
            id,
            Publication {
                id,
                interface: request.interface,
                module: request.handle,
                kind: request.kind,
                num_events: request.num_events,
                caller: request.caller,
                peer: request.peer,
                path: request.path.clone(),
            },
        );
        (id, true)
    }

    /// Finds the subscription `request` declares, or adds it.
    pub fn upsert_subscription(
        &mut self,
        request: &SubscribeRequest,
        auto: bool,
    ) -> (SubscriptionId, bool) {
        if let Some(existing) = self
            .subscriptions
            .values()
            .find(|s| s.same_declaration(request.handle, request.interface, &request.path))
        {
            return (existing.id, false);
        }
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                interface: request.interface,
                module: request.handle,
                num_events: request.num_events,
                subscriber: request.subscriber,
                peer: request.peer,
                path: request.path.clone(),
                auto,
            },
        );
        (id, true)
    }

    pub fn publication(&self, id: PublicationId) -> Option<&Publication> {
        self.publications.get(&id)
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub fn find_publication(
        &self,
        module: ModuleHandle,
        interface: InterfaceId,
        path: &Option<String>,
    ) -> Option<PublicationId> {
        self.publications
            .values()
            .find(|p| p.same_declaration(module, interface, path))
            .map(|p| p.id)
    }

    pub fn publications_of(&self, module: ModuleHandle) -> Vec<PublicationId> {
        self.publications
            .values()
            .filter(|p| p.module == module)
            .map(|p| p.id)
            .collect()
    }

    pub fn subscriptions_of(&self, module: ModuleHandle) -> Vec<SubscriptionId> {
        self.subscriptions
            .values()
            .filter(|s| s.module == module)
            .map(|s| s.id)
            .collect()
    }

    /// Subscriptions the publication matches, oldest first.
    pub fn matching_subscriptions(&self, id: PublicationId) -> Vec<SubscriptionId> {
        let Some(publication) = self.publications.get(&id) else {
            return Vec::new();
        };
        self.subscriptions
            .values()
            .filter(|s| publication.matches(s))
            .map(|s| s.id)
            .collect()
    }

    /// Publications matching the subscription, oldest first.
    pub fn matching_publications(&self, id: SubscriptionId) -> Vec<PublicationId> {
        let Some(subscription) = self.subscriptions.get(&id) else {
            return Vec::new();
        };
        self.publications
            .values()
            .filter(|p| p.matches(subscription))
            .map(|p| p.id)
            .collect()
    }

    // ── Pairs ─────────────────────────────────────────────────────────────────

    pub fn pair(&self, publication: PublicationId, subscription: SubscriptionId) -> Option<&ActivationPair> {
        self.pairs
            .iter()
            .find(|p| p.publication == publication && p.subscription == subscription)
    }

    pub fn pair_mut(
        &mut self,
        publication: PublicationId,
        subscription: SubscriptionId,
    ) -> Option<&mut ActivationPair> {
        self.pairs
            .iter_mut()
            .find(|p| p.publication == publication && p.subscription == subscription)
    }

    pub fn add_pair(&mut self, pair: ActivationPair) {
        self.pairs.push(pair);
    }

    pub fn is_paired(&self, publication: PublicationId) -> bool {
        self.pairs.iter().any(|p| p.publication == publication)
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// The shared region already used by a pair of `publication`, if any.
    pub fn shared_region(&self, publication: PublicationId) -> Option<String> {
        self.pairs
            .iter()
            .filter(|p| p.publication == publication)
            .find_map(|p| p.descriptor.region().map(str::to_string))
    }

    /// Keys of the pairs whose subscription belongs to `module`.
    pub fn pairs_implemented_by(&self, module: ModuleHandle) -> Vec<(PublicationId, SubscriptionId)> {
        self.pairs
            .iter()
            .filter(|p| {
                self.subscriptions
                    .get(&p.subscription)
                    .is_some_and(|s| s.module == module)
            })
            .map(|p| (p.publication, p.subscription))
            .collect()
    }

    /// Removes the publication and every pair built on it.
    pub fn remove_publication(&mut self, id: PublicationId) -> Option<(Publication, Vec<ActivationPair>)> {
        let publication = self.publications.remove(&id)?;
        let (gone, kept): (Vec<_>, Vec<_>) = self.pairs.drain(..).partition(|p| p.publication == id);
        self.pairs = kept;
        Some((publication, gone))
    }

    /// Removes the subscription and every pair built on it.
    pub fn remove_subscription(
        &mut self,
        id: SubscriptionId,
    ) -> Option<(Subscription, Vec<ActivationPair>)> {
        let subscription = self.subscriptions.remove(&id)?;
        let (gone, kept): (Vec<_>, Vec<_>) = self.pairs.drain(..).partition(|p| p.subscription == id);
        self.pairs = kept;
        Some((subscription, gone))
    }

    // ── Waiting publishers ────────────────────────────────────────────────────

    pub fn add_waiter(&mut self, publication: PublicationId, wake: Arc<Condvar>) {
        self.waiting.push(WaitingPublisher { publication, wake });
    }

    /// Drops the waiter entry holding `wake`, if it is still listed.
    pub fn remove_waiter(&mut self, wake: &Arc<Condvar>) {
        self.waiting.retain(|w| !Arc::ptr_eq(&w.wake, wake));
    }

    /// Unlists and wakes every publisher waiting on `publication`.  Returns
    /// how many were woken.
    pub fn wake_waiters(&mut self, publication: PublicationId) -> usize {
        let (woken, kept): (Vec<_>, Vec<_>) = self
            .waiting
            .drain(..)
            .partition(|w| w.publication == publication);
        self.waiting = kept;
        for waiter in &woken {
            waiter.wake.notify_all();
        }
        woken.len()
    }

    /// Unlists and wakes every waiting publisher.
    pub fn wake_all(&mut self) -> usize {
        let woken = self.waiting.len();
        for waiter in self.waiting.drain(..) {
            waiter.wake.notify_all();
        }
        woken
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn set_shutting_down(&mut self) {
        self.shutting_down = true;
    }

    // ── Diagnostics ───────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            shutting_down: self.shutting_down,
            modules: self
                .modules
                .values()
                .map(|m| ModuleSummary {
                    handle: m.handle,
                    name: m.name.clone(),
                })
                .collect(),
            publications: self.publications.values().cloned().collect(),
            subscriptions: self.subscriptions.values().cloned().collect(),
            pairs: self.pairs.clone(),
            waiting: self.waiting.iter().map(|w| w.publication).collect(),
        }
    }
}

/// A copy of the table for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerSnapshot {
    pub shutting_down: bool,
    pub modules: Vec<ModuleSummary>,
    pub publications: Vec<Publication>,
    pub subscriptions: Vec<Subscription>,
    pub pairs: Vec<ActivationPair>,
    pub waiting: Vec<PublicationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub handle: ModuleHandle,
    pub name: String,
}
