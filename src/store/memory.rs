//! In-memory [`StorageComponent`] with failure injection.
//!
//! Stands in for either store in tests. Clones share the same data, so a test
//! can hand one clone to the sync controller and inspect another.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::error::{PersistenceError, Result};
use crate::model::{AggregateRecord, EditClock, EditTime, RunId, RunRecord, UserToken};
use crate::store::{RemoteSession, StorageComponent};

#[derive(Debug, Default)]
struct Namespace {
    runs: BTreeMap<RunId, (RunRecord, EditTime)>,
    ghosts: BTreeSet<RunId>,
    aggregate: Option<(AggregateRecord, EditTime)>,
}

#[derive(Debug, Default)]
struct Inner {
    namespaces: HashMap<UserToken, Namespace>,
    corrupt: BTreeSet<RunId>,
    reachable: bool,
    fail_writes: bool,
    writes_before_failure: Option<u32>,
    disconnect_delay: Duration,
    connected: bool,
    connects: u32,
    disconnects: u32,
    mutations: u64,
}

/// Shared, thread-safe in-memory store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<EditClock>,
    token: UserToken,
    requires_session: bool,
}

impl MemoryStore {
    /// Store that behaves like the local store (no session needed).
    pub fn new(token: UserToken) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                reachable: true,
                ..Default::default()
            })),
            clock: Arc::new(EditClock::new()),
            token,
            requires_session: false,
        }
    }

    /// Store that behaves like the remote store: every record operation
    /// fails with `Unavailable` unless a session is open.
    pub fn remote(token: UserToken) -> Self {
        Self {
            requires_session: true,
            ..Self::new(token)
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate losing (or regaining) the network or disk.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Make every write fail with `LocalWriteFailed`. Clearing it also
    /// clears [`fail_writes_after`](Self::fail_writes_after).
    pub fn set_fail_writes(&self, fail: bool) {
        let mut inner = self.lock();
        inner.fail_writes = fail;
        if !fail {
            inner.writes_before_failure = None;
        }
    }

    /// Let the next `writes` writes succeed, then fail every write after.
    pub fn fail_writes_after(&self, writes: u32) {
        self.lock().writes_before_failure = Some(writes);
    }

    /// Hold every `disconnect` for `delay`, keeping a pass in flight.
    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.lock().disconnect_delay = delay;
    }

    /// Make reads of `id` fail with `CorruptData`.
    pub fn corrupt_record(&self, id: RunId) {
        self.lock().corrupt.insert(id);
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    pub fn disconnect_count(&self) -> u32 {
        self.lock().disconnects
    }

    /// Number of successful mutations so far.
    pub fn mutation_count(&self) -> u64 {
        self.lock().mutations
    }

    /// Full, comparable view of the bound user's data.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.lock();
        match inner.namespaces.get(&self.token) {
            Some(ns) => StoreSnapshot {
                runs: ns.runs.clone(),
                ghosts: ns.ghosts.clone(),
                aggregate: ns.aggregate.clone(),
            },
            None => StoreSnapshot::default(),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Inner, Option<&Namespace>) -> Result<T>) -> Result<T> {
        let inner = self.lock();
        self.check_reachable(&inner)?;
        f(&*inner, inner.namespaces.get(&self.token))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Namespace) -> T) -> Result<T> {
        let mut inner = self.lock();
        self.check_reachable(&inner)?;
        if inner.fail_writes || inner.writes_before_failure == Some(0) {
            return Err(PersistenceError::write_failed("Injected write failure"));
        }
        if let Some(left) = inner.writes_before_failure {
            inner.writes_before_failure = Some(left - 1);
        }
        inner.mutations += 1;
        let ns = inner.namespaces.entry(self.token.clone()).or_default();
        Ok(f(ns))
    }

    fn check_reachable(&self, inner: &Inner) -> Result<()> {
        if !inner.reachable {
            return Err(PersistenceError::unavailable("Store unreachable"));
        }
        if self.requires_session && !inner.connected {
            return Err(PersistenceError::unavailable("No open session"));
        }
        Ok(())
    }

    fn stamp(&self, hint: Option<EditTime>) -> EditTime {
        match hint {
            Some(edit_time) => {
                self.clock.observe(edit_time);
                edit_time
            }
            None => self.clock.next(),
        }
    }
}

/// Plain-data copy of one user's namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub runs: BTreeMap<RunId, (RunRecord, EditTime)>,
    pub ghosts: BTreeSet<RunId>,
    pub aggregate: Option<(AggregateRecord, EditTime)>,
}

impl StorageComponent for MemoryStore {
    fn bind_user(&mut self, token: &UserToken) {
        self.token = token.clone();
    }

    fn list_real_ids(&self) -> Result<BTreeSet<RunId>> {
        self.read(|_, ns| Ok(ns.map(|ns| ns.runs.keys().copied().collect()).unwrap_or_default()))
    }

    fn list_ghost_ids(&self) -> Result<BTreeSet<RunId>> {
        self.read(|_, ns| Ok(ns.map(|ns| ns.ghosts.clone()).unwrap_or_default()))
    }

    fn get_record(&self, id: RunId) -> Result<Option<RunRecord>> {
        self.read(|inner, ns| {
            let found = ns.and_then(|ns| ns.runs.get(&id));
            if found.is_some() && inner.corrupt.contains(&id) {
                return Err(PersistenceError::corrupt(
                    format!("run/{}", id),
                    "injected corruption",
                ));
            }
            Ok(found.map(|(record, _)| record.clone()))
        })
    }

    fn save_record(
        &mut self,
        record: &RunRecord,
        edit_time: Option<EditTime>,
    ) -> Result<EditTime> {
        let edit_time = self.stamp(edit_time);
        let record = record.clone();
        self.write(move |ns| {
            ns.runs.insert(record.id, (record, edit_time));
        })?;
        Ok(edit_time)
    }

    fn get_edit_time(&self, id: RunId) -> Result<EditTime> {
        self.read(|_, ns| {
            Ok(ns
                .and_then(|ns| ns.runs.get(&id))
                .map(|(_, t)| *t)
                .unwrap_or(EditTime::ABSENT))
        })
    }

    fn delete_record(&mut self, id: RunId) -> Result<()> {
        self.write(|ns| {
            ns.runs.remove(&id);
        })
    }

    fn save_ghost(&mut self, id: RunId) -> Result<()> {
        self.write(|ns| {
            ns.ghosts.insert(id);
        })
    }

    fn delete_ghost(&mut self, id: RunId) -> Result<()> {
        self.write(|ns| {
            ns.ghosts.remove(&id);
        })
    }

    fn get_aggregate(&self) -> Result<Option<AggregateRecord>> {
        self.read(|_, ns| Ok(ns.and_then(|ns| ns.aggregate.as_ref()).map(|(a, _)| a.clone())))
    }

    fn get_aggregate_edit_time(&self) -> Result<EditTime> {
        self.read(|_, ns| {
            Ok(ns
                .and_then(|ns| ns.aggregate.as_ref())
                .map(|(_, t)| *t)
                .unwrap_or(EditTime::ABSENT))
        })
    }

    fn save_aggregate(
        &mut self,
        record: &AggregateRecord,
        edit_time: Option<EditTime>,
    ) -> Result<EditTime> {
        let edit_time = self.stamp(edit_time);
        let record = record.clone();
        self.write(move |ns| {
            ns.aggregate = Some((record, edit_time));
        })?;
        Ok(edit_time)
    }
}

impl RemoteSession for MemoryStore {
    fn connect(&mut self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.reachable {
            return Err(PersistenceError::unavailable("Connect failed: unreachable"));
        }
        inner.connected = true;
        inner.connects += 1;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let delay = {
            let mut inner = self.lock();
            if inner.connected {
                inner.connected = false;
                inner.disconnects += 1;
            }
            inner.disconnect_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
