use std::borrow::BorrowMut;
use std::hash::Hash;

use aya::Pod;
use aya::maps::MapData;

use crate::Result;

/// A kernel-resident key/value table, as far as the syncer is concerned:
/// point writes, point deletes and a full scan.
pub trait BpfMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()>;
    fn delete(&mut self, key: &K) -> Result<()>;
    fn get_state(&self) -> Result<ahash::HashMap<K, V>>;
}

impl<T: BorrowMut<MapData>, K: Pod + Eq + Hash, V: Pod> BpfMap<K, V>
    for aya::maps::HashMap<T, K, V>
{
    fn update(&mut self, key: K, value: V) -> Result<()> {
        Ok(self.insert(key, value, 0)?)
    }

    fn delete(&mut self, key: &K) -> Result<()> {
        Ok(self.remove(key)?)
    }

    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let mut map = ahash::HashMap::default();
        for kv in self.iter() {
            let (k, v) = kv?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<K: Eq + Hash + Copy, V: Copy + PartialEq> BpfMap<K, V> for ahash::HashMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.clone())
    }
}

/// Keeps two in-memory views of a kernel map: what is in the dataplane and
/// what the caller wants in it. The apply operations are split so the caller
/// chooses the order in which deletions and updates become visible to the
/// kernel packet path.
pub struct CachingMap<K, V, M> {
    map: M,
    dataplane: ahash::HashMap<K, V>,
    desired: ahash::HashMap<K, V>,
}

impl<K, V, M> CachingMap<K, V, M>
where
    K: Eq + Hash + Copy,
    V: Copy + PartialEq,
    M: BpfMap<K, V>,
{
    pub fn new(map: M) -> Self {
        Self {
            map,
            dataplane: ahash::HashMap::default(),
            desired: ahash::HashMap::default(),
        }
    }

    /// Replaces the dataplane view with a full scan of the kernel map.
    pub fn load_cache_from_dataplane(&mut self) -> Result<()> {
        self.dataplane = self.map.get_state()?;
        Ok(())
    }

    pub fn desired(&mut self) -> Desired<'_, K, V> {
        Desired {
            map: &mut self.desired,
        }
    }

    pub fn dataplane(&self) -> &ahash::HashMap<K, V> {
        &self.dataplane
    }

    /// Writes every desired entry that is new or differs from the dataplane
    /// view. A successful write moves the dataplane view along; a failed one
    /// leaves it untouched and surfaces the error.
    pub fn apply_updates_only(&mut self) -> Result<()> {
        for (k, v) in self.desired.iter() {
            if self.dataplane.get(k) == Some(v) {
                continue;
            }
            self.map.update(*k, *v)?;
            self.dataplane.insert(*k, *v);
        }
        Ok(())
    }

    /// Deletes every dataplane entry that is no longer desired.
    pub fn apply_deletions_only(&mut self) -> Result<()> {
        let stale: Vec<K> = self
            .dataplane
            .keys()
            .filter(|k| !self.desired.contains_key(k))
            .copied()
            .collect();
        for k in stale {
            self.map.delete(&k)?;
            self.dataplane.remove(&k);
        }
        Ok(())
    }
}

/// Mutable view of the desired state of a [`CachingMap`].
pub struct Desired<'a, K, V> {
    map: &'a mut ahash::HashMap<K, V>,
}

impl<K: Eq + Hash, V> Desired<'_, K, V> {
    pub fn set(&mut self, key: K, value: V) {
        self.map.insert(key, value);
    }

    pub fn delete(&mut self, key: &K) {
        self.map.remove(key);
    }

    pub fn delete_all(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }
}
