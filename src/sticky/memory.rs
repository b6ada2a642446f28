//! Authoritative in-memory copy of sticky records.
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use super::schema::Records;

/// Composite key of a sticky record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StickyKey {
    pub user_id: String,
    pub experiment_id: String,
}

impl StickyKey {
    pub fn new(user_id: &str, experiment_id: &str) -> StickyKey {
        StickyKey {
            user_id: user_id.to_owned(),
            experiment_id: experiment_id.to_owned(),
        }
    }
}

type Shard = HashMap<StickyKey, String>;

/// `StickyKey → variation id`, split across independently locked shards.
///
/// Shards are picked by user id only, so all records of one user live in the same shard and
/// per-user operations take a single lock.
pub(crate) struct Memory {
    shards: Box<[RwLock<Shard>]>,
}

const SHARD_COUNT: usize = 16;

impl Memory {
    pub fn new() -> Memory {
        Memory {
            shards: (0..SHARD_COUNT).map(|_| RwLock::default()).collect(),
        }
    }

    pub fn from_records(records: Records) -> Memory {
        let memory = Memory::new();
        for (user_id, decisions) in records {
            let mut shard = memory.write(&user_id);
            for (experiment_id, variation_id) in decisions {
                shard.insert(
                    StickyKey {
                        user_id: user_id.clone(),
                        experiment_id,
                    },
                    variation_id,
                );
            }
        }
        memory
    }

    fn shard_index(user_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    // Lock poisoning means a panic while holding the lock. Map operations never leave a shard
    // half-updated, so the data is still consistent and we keep serving it.
    fn read(&self, user_id: &str) -> RwLockReadGuard<'_, Shard> {
        self.shards[Self::shard_index(user_id)]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, user_id: &str) -> RwLockWriteGuard<'_, Shard> {
        self.shards[Self::shard_index(user_id)]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, user_id: &str, experiment_id: &str) -> Option<String> {
        self.read(user_id)
            .get(&StickyKey::new(user_id, experiment_id))
            .cloned()
    }

    /// Returns the previous variation id.
    pub fn insert(&self, key: StickyKey, variation_id: String) -> Option<String> {
        self.write(&key.user_id).insert(key, variation_id)
    }

    /// Insert only if the key is vacant. Returns `true` if inserted.
    pub fn insert_if_absent(&self, key: StickyKey, variation_id: String) -> bool {
        let mut shard = self.write(&key.user_id);
        if shard.contains_key(&key) {
            false
        } else {
            shard.insert(key, variation_id);
            true
        }
    }

    pub fn remove(&self, key: &StickyKey) -> Option<String> {
        self.write(&key.user_id).remove(key)
    }

    /// Remove all records of `user_id`, returning them.
    pub fn remove_user(&self, user_id: &str) -> Vec<(StickyKey, String)> {
        let mut shard = self.write(user_id);
        let keys: Vec<StickyKey> = shard
            .keys()
            .filter(|key| key.user_id == user_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| shard.remove(&key).map(|variation_id| (key, variation_id)))
            .collect()
    }

    pub fn user_records(&self, user_id: &str) -> HashMap<String, String> {
        self.read(user_id)
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(key, variation_id)| (key.experiment_id.clone(), variation_id.clone()))
            .collect()
    }

    /// Consistent per shard, not across shards.
    pub fn snapshot(&self) -> Records {
        let mut records = Records::new();
        for shard in self.shards.iter() {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            for (key, variation_id) in shard.iter() {
                records
                    .entry(key.user_id.clone())
                    .or_default()
                    .insert(key.experiment_id.clone(), variation_id.clone());
            }
        }
        records
    }

    /// For every user with more than `threshold` records, drop records whose experiment is not
    /// accepted by `is_valid`. Returns the number of dropped records.
    pub fn prune(&self, threshold: usize, is_valid: impl Fn(&str) -> bool) -> usize {
        let mut pruned = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);

            let mut per_user: HashMap<&str, usize> = HashMap::new();
            for key in shard.keys() {
                *per_user.entry(key.user_id.as_str()).or_default() += 1;
            }
            let oversized: Vec<String> = per_user
                .into_iter()
                .filter(|&(_, count)| count > threshold)
                .map(|(user_id, _)| user_id.to_owned())
                .collect();
            if oversized.is_empty() {
                continue;
            }

            let before = shard.len();
            shard.retain(|key, _| {
                !oversized.contains(&key.user_id) || is_valid(&key.experiment_id)
            });
            pruned += before - shard.len();
        }
        pruned
    }
}
