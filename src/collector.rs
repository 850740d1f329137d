// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-program-name connection-pool collection: the in-process state that
//! accumulates pool events and exposes the derived gauges a `Sender` reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use fnv::FnvHashSet;

use crate::worker;

/// Opaque identity of a single underlying driver connection — typically a
/// pointer or handle value supplied by the host connection pool, stable for
/// the connection's lifetime and unique among concurrently-live connections.
pub type ConnectionId = u64;

/// The five connection-identity sets a `CollectionTarget` tracks.
///
/// Grouped under one lock so every event transition applies as a single
/// atomic step; the original Python model mutated five independent sets
/// under the GIL's implicit exclusion, which Rust has no equivalent of, so
/// this struct is the direct replacement for that coordination.
#[derive(Default)]
struct ConnectionSets {
    connections: FnvHashSet<ConnectionId>,
    checked_in: FnvHashSet<ConnectionId>,
    invalidated: FnvHashSet<ConnectionId>,
    detached: FnvHashSet<ConnectionId>,
    transactions: FnvHashSet<ConnectionId>,
}

/// Accumulated connection-pool activity for one reporting program name.
///
/// One `CollectionTarget` exists per distinct program name within a
/// process; all engines registered under the same name share it, so a
/// program with multiple engines reports one merged set of pool gauges.
pub struct CollectionTarget {
    name: String,
    sets: Mutex<ConnectionSets>,
    total_checkouts: AtomicU64,
    total_invalidated: AtomicU64,
    total_connects: AtomicU64,
    total_disconnects: AtomicU64,
    next_engine_id: AtomicU64,
    live_engines: Mutex<FnvHashSet<u64>>,
}

impl CollectionTarget {
    fn new(name: impl Into<String>) -> Self {
        CollectionTarget {
            name: name.into(),
            sets: Mutex::new(ConnectionSets::default()),
            total_checkouts: AtomicU64::new(0),
            total_invalidated: AtomicU64::new(0),
            total_connects: AtomicU64::new(0),
            total_disconnects: AtomicU64::new(0),
            next_engine_id: AtomicU64::new(0),
            live_engines: Mutex::new(FnvHashSet::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of engines currently attached to this target. Attachment is
    /// explicit (`attach_engine`/drop of the returned handle) rather than a
    /// weak-reference set: deterministic deregistration on `Drop` gives the
    /// same "stops counting once the engine goes away" behavior without
    /// relying on GC-timed weakref cleanup.
    pub fn num_pools(&self) -> u64 {
        self.live_engines.lock().expect("lock poisoned").len() as u64
    }

    pub fn attach_engine(self: &Arc<Self>) -> EngineHandle {
        let id = self.next_engine_id.fetch_add(1, Ordering::Relaxed);
        self.live_engines.lock().expect("lock poisoned").insert(id);
        EngineHandle {
            target: self.clone(),
            id,
        }
    }

    fn deregister_engine(&self, id: u64) {
        self.live_engines.lock().expect("lock poisoned").remove(&id);
    }

    pub fn num_checkedout(&self) -> u64 {
        let sets = self.sets.lock().expect("lock poisoned");
        sets.connections
            .iter()
            .filter(|c| {
                !sets.detached.contains(*c) && !sets.invalidated.contains(*c) && !sets.checked_in.contains(*c)
            })
            .count() as u64
    }

    pub fn num_checkedin(&self) -> u64 {
        self.sets.lock().expect("lock poisoned").checked_in.len() as u64
    }

    pub fn num_detached(&self) -> u64 {
        self.sets.lock().expect("lock poisoned").detached.len() as u64
    }

    pub fn num_invalidated(&self) -> u64 {
        self.sets.lock().expect("lock poisoned").invalidated.len() as u64
    }

    pub fn num_connections(&self) -> u64 {
        self.sets.lock().expect("lock poisoned").connections.len() as u64
    }

    pub fn num_transactions(&self) -> u64 {
        self.sets.lock().expect("lock poisoned").transactions.len() as u64
    }

    pub fn total_checkouts(&self) -> u64 {
        self.total_checkouts.load(Ordering::Relaxed)
    }

    pub fn total_invalidated(&self) -> u64 {
        self.total_invalidated.load(Ordering::Relaxed)
    }

    pub fn total_connects(&self) -> u64 {
        self.total_connects.load(Ordering::Relaxed)
    }

    pub fn total_disconnects(&self) -> u64 {
        self.total_disconnects.load(Ordering::Relaxed)
    }
}

/// The nine pool lifecycle events a host connection pool can report. Kept
/// as a trait rather than free functions so the Worker/Sender pair can talk
/// to any number of independently-driven engines through one interface.
pub trait PoolEventSink {
    fn on_connect(&self, conn: ConnectionId);
    fn on_checkout(&self, conn: ConnectionId);
    fn on_checkin(&self, conn: ConnectionId);
    fn on_invalidate(&self, conn: ConnectionId);
    fn on_soft_invalidate(&self, conn: ConnectionId);
    fn on_reset(&self, conn: ConnectionId);
    fn on_close(&self, conn: ConnectionId);
    fn on_detach(&self, conn: ConnectionId);
    fn on_close_detached(&self, conn: ConnectionId);
}

/// A live attachment of one engine (one host connection pool instance) to a
/// `CollectionTarget`. Dropping this handle deregisters the engine from
/// `num_pools`; event calls made through it mutate the shared target.
pub struct EngineHandle {
    target: Arc<CollectionTarget>,
    id: u64,
}

impl EngineHandle {
    pub fn target(&self) -> &Arc<CollectionTarget> {
        &self.target
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.target.deregister_engine(self.id);
    }
}

impl PoolEventSink for EngineHandle {
    fn on_connect(&self, conn: ConnectionId) {
        {
            let mut sets = self.target.sets.lock().expect("lock poisoned");
            sets.connections.insert(conn);
            sets.checked_in.insert(conn);
        }
        self.target.total_connects.fetch_add(1, Ordering::Relaxed);
        worker::check_threads_started();
    }

    fn on_checkout(&self, conn: ConnectionId) {
        let mut sets = self.target.sets.lock().expect("lock poisoned");
        sets.checked_in.remove(&conn);
        drop(sets);
        self.target.total_checkouts.fetch_add(1, Ordering::Relaxed);
    }

    fn on_checkin(&self, conn: ConnectionId) {
        let mut sets = self.target.sets.lock().expect("lock poisoned");
        sets.checked_in.insert(conn);
    }

    fn on_invalidate(&self, conn: ConnectionId) {
        self.invalidate(conn);
    }

    fn on_soft_invalidate(&self, conn: ConnectionId) {
        self.invalidate(conn);
    }

    fn on_reset(&self, conn: ConnectionId) {
        let mut sets = self.target.sets.lock().expect("lock poisoned");
        sets.transactions.remove(&conn);
    }

    fn on_close(&self, conn: ConnectionId) {
        let connected;
        let was_detached;
        {
            let mut sets = self.target.sets.lock().expect("lock poisoned");
            sets.transactions.remove(&conn);
            sets.invalidated.remove(&conn);
            sets.checked_in.remove(&conn);
            connected = sets.connections.remove(&conn);
            was_detached = sets.detached.remove(&conn);
        }
        if connected {
            self.target.total_disconnects.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!(connection = conn, "close event for untracked connection");
        }
        if was_detached {
            tracing::warn!(connection = conn, "close event for a connection that was still detached");
        }
    }

    fn on_detach(&self, conn: ConnectionId) {
        let mut sets = self.target.sets.lock().expect("lock poisoned");
        sets.detached.insert(conn);
    }

    fn on_close_detached(&self, conn: ConnectionId) {
        let connected;
        {
            let mut sets = self.target.sets.lock().expect("lock poisoned");
            sets.transactions.remove(&conn);
            sets.invalidated.remove(&conn);
            sets.checked_in.remove(&conn);
            if !sets.detached.remove(&conn) {
                tracing::warn!(connection = conn, "close_detached event for a connection that was never detached");
            }
            connected = sets.connections.remove(&conn);
        }
        if connected {
            self.target.total_disconnects.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!(connection = conn, "close_detached event for untracked connection");
        }
    }
}

impl EngineHandle {
    fn invalidate(&self, conn: ConnectionId) {
        {
            let mut sets = self.target.sets.lock().expect("lock poisoned");
            sets.invalidated.insert(conn);
        }
        // Both hard and soft invalidation count toward totalInvalidated:
        // an operator watching the dashboard expects every invalidation
        // path to move this counter, regardless of which triggered it.
        self.target.total_invalidated.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide registry of `CollectionTarget`s keyed by program name.
#[derive(Default)]
pub struct CollectionTargetRegistry {
    targets: Mutex<HashMap<String, Arc<CollectionTarget>>>,
}

impl CollectionTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_for_name(&self, name: &str) -> Arc<CollectionTarget> {
        let mut targets = self.targets.lock().expect("registry lock poisoned");
        targets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CollectionTarget::new(name)))
            .clone()
    }
}

static GLOBAL_TARGETS: OnceLock<CollectionTargetRegistry> = OnceLock::new();

pub fn global_targets() -> &'static CollectionTargetRegistry {
    GLOBAL_TARGETS.get_or_init(CollectionTargetRegistry::new)
}
