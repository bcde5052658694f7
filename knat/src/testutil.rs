use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::map::BpfMap;
use crate::routes::{RouteValue, Routes};
use crate::{Error, Result};

/// Mock kernel map. Clones share the backing store, so a map handed to a
/// syncer can be inspected from the test, seeded beforehand, or given to a
/// second syncer to model a restart with the kernel maps surviving.
pub(crate) struct SharedMap<K, V> {
    entries: Arc<Mutex<ahash::HashMap<K, V>>>,
    updates: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
    fail_updates: Arc<AtomicBool>,
}

impl<K, V> Clone for SharedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            updates: Arc::clone(&self.updates),
            deletes: Arc::clone(&self.deletes),
            fail_updates: Arc::clone(&self.fail_updates),
        }
    }
}

impl<K: Eq + Hash + Copy, V: Copy> SharedMap<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(ahash::HashMap::default())),
            updates: Arc::new(AtomicUsize::new(0)),
            deletes: Arc::new(AtomicUsize::new(0)),
            fail_updates: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn seed(&self, key: K, value: V) {
        self.entries.lock().unwrap().insert(key, value);
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().unwrap().get(key).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub(crate) fn snapshot(&self) -> ahash::HashMap<K, V> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub(crate) fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_counts(&self) {
        self.updates.store(0, Ordering::SeqCst);
        self.deletes.store(0, Ordering::SeqCst);
    }

    pub(crate) fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

impl<K: Eq + Hash + Copy, V: Copy> BpfMap<K, V> for SharedMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::Other("injected map write failure".into()));
        }
        self.entries.lock().unwrap().insert(key, value);
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.entries.lock().unwrap().clone())
    }
}

/// Mock route table; `set` wakes a pending `wait_for_change`.
pub(crate) struct MockRoutes {
    table: Mutex<ahash::HashMap<IpAddr, RouteValue>>,
    changed: Notify,
}

impl MockRoutes {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(ahash::HashMap::default()),
            changed: Notify::new(),
        })
    }

    pub(crate) fn set(&self, addr: IpAddr, route: RouteValue) {
        self.table.lock().unwrap().insert(addr, route);
        self.changed.notify_one();
    }
}

impl Routes for MockRoutes {
    fn lookup(&self, addr: IpAddr) -> Option<RouteValue> {
        self.table.lock().unwrap().get(&addr).copied()
    }

    fn wait_for_change(&self, cancel: CancellationToken) -> impl Future<Output = bool> + Send {
        async move {
            tokio::select! {
                _ = self.changed.notified() => true,
                _ = cancel.cancelled() => false,
            }
        }
    }
}
