//! Sticky-decision cache ("user profiles").
//!
//! [`StickyStore`] remembers which variation each user was bucketed into, so that later decisions
//! return the same variation even after traffic allocation changes. Memory is authoritative for
//! decisions: lookups never touch the disk. Every mutation is mirrored to a [`DurableStorage`] by
//! a single background writer, so the records survive restarts.
//!
//! The store never fails a caller because of storage: I/O errors and corrupt documents are
//! logged and degrade to "no persistence" or "empty cache". Bucketing always keeps working.
//!
//! A document that can't be *read* is never overwritten: the store then runs memory-only until
//! the next start, as the records on disk may still be valid.
mod memory;
mod schema;
mod storage;
mod writer;

use std::{collections::HashSet, sync::Arc};

pub use schema::Records;
pub use storage::{DurableStorage, FileStorage, MemoryStorage};

use self::{
    memory::{Memory, StickyKey},
    schema::Migration,
    writer::Writer,
};
use crate::{Error, Result, StickyStoreConfig};

/// Thread-safe sticky-decision cache with write-through persistence.
///
/// # Examples
/// ```
/// # use sticky_bucketing::{MemoryStorage, StickyStore, StickyStoreConfig};
/// let store = StickyStore::start(StickyStoreConfig::new("project"), MemoryStorage::new());
/// assert!(store.save("user", "experiment", "variation"));
/// assert_eq!(store.lookup("user", "experiment").as_deref(), Some("variation"));
/// ```
pub struct StickyStore {
    config: StickyStoreConfig,
    memory: Arc<Memory>,
    /// `None` if storage couldn't be read or the writer thread couldn't be started. Records are
    /// then kept in memory only.
    writer: Option<Writer>,
}

impl StickyStore {
    /// Migrate legacy records, load the persisted records, and start the background writer.
    ///
    /// Never fails: corrupt storage results in an empty cache, unreadable storage in an empty,
    /// memory-only cache (both with an error log).
    pub fn start(config: StickyStoreConfig, storage: impl DurableStorage + 'static) -> StickyStore {
        let Some(records) = load(&config, &storage) else {
            return StickyStore {
                config,
                memory: Arc::new(Memory::new()),
                writer: None,
            };
        };
        log::debug!(target: "sticky_bucketing",
                    project_id:display = config.project_id,
                    users = records.len();
                    "loaded sticky records");

        let memory = Arc::new(Memory::from_records(records));

        let writer = match Writer::start(
            Box::new(storage),
            config.storage_key(),
            memory.clone(),
            config.write_queue_capacity,
        ) {
            Ok(writer) => Some(writer),
            Err(err) => {
                log::error!(target: "sticky_bucketing",
                            "failed to start writer thread, sticky records won't be persisted: {err}");
                None
            }
        };

        StickyStore {
            config,
            memory,
            writer,
        }
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &StickyStoreConfig {
        &self.config
    }

    /// Variation id previously saved for `user_id` in `experiment_id`.
    pub fn lookup(&self, user_id: &str, experiment_id: &str) -> Option<String> {
        if !validate(user_id, experiment_id) {
            return None;
        }
        self.memory.get(user_id, experiment_id)
    }

    /// Remember that `user_id` was bucketed into `variation_id` of `experiment_id`.
    ///
    /// Memory is updated before returning, so subsequent lookups observe the new value. The
    /// durable write happens in the background; its failure is logged and not reported here.
    /// Returns `false` only if an argument is empty.
    pub fn save(&self, user_id: &str, experiment_id: &str, variation_id: &str) -> bool {
        if !validate(user_id, experiment_id) || !validate_arg("variation_id", variation_id) {
            return false;
        }

        self.memory.insert(
            StickyKey::new(user_id, experiment_id),
            variation_id.to_owned(),
        );
        // Scheduled even if unchanged, so that re-saving retries a failed write. Writes coalesce.
        self.schedule(Vec::new());
        true
    }

    /// Like [`StickyStore::save`], but waits for the durable write and reports its failure.
    ///
    /// The in-memory record is kept even if the durable write fails.
    pub fn save_durable(&self, user_id: &str, experiment_id: &str, variation_id: &str) -> Result<()> {
        if user_id.is_empty() {
            return Err(Error::InvalidArgument("user_id"));
        }
        if experiment_id.is_empty() {
            return Err(Error::InvalidArgument("experiment_id"));
        }
        if variation_id.is_empty() {
            return Err(Error::InvalidArgument("variation_id"));
        }

        self.memory.insert(
            StickyKey::new(user_id, experiment_id),
            variation_id.to_owned(),
        );
        let writer = self.writer.as_ref().ok_or(Error::PersistenceDisabled)?;
        writer.schedule()?;
        writer.flush()
    }

    /// Forget the record for `user_id` in `experiment_id`.
    ///
    /// Returns `true` if a record was removed. If the durable removal fails later, the record is
    /// put back into memory (unless it was saved again in the meantime).
    pub fn remove(&self, user_id: &str, experiment_id: &str) -> bool {
        if !validate(user_id, experiment_id) {
            return false;
        }

        let key = StickyKey::new(user_id, experiment_id);
        match self.memory.remove(&key) {
            Some(variation_id) => {
                self.schedule(vec![(key, variation_id)]);
                true
            }
            None => false,
        }
    }

    /// Forget every record of `user_id`. Returns `true` if any record was removed.
    pub fn remove_user(&self, user_id: &str) -> bool {
        if !validate_arg("user_id", user_id) {
            return false;
        }

        let removed = self.memory.remove_user(user_id);
        if removed.is_empty() {
            return false;
        }
        self.schedule(removed);
        true
    }

    /// All records of `user_id`, keyed by experiment id.
    pub fn user_records(&self, user_id: &str) -> std::collections::HashMap<String, String> {
        self.memory.user_records(user_id)
    }

    /// Snapshot of all records: user id → experiment id → variation id.
    pub fn records(&self) -> Records {
        self.memory.snapshot()
    }

    /// Drop records of experiments that no longer exist.
    ///
    /// Only users with more than [`StickyStoreConfig::prune_threshold`] records are pruned; the
    /// rest are cheap to keep and may still be useful if an experiment comes back.
    pub fn prune_invalid_experiments<'a>(
        &self,
        valid_experiment_ids: impl IntoIterator<Item = &'a str>,
    ) {
        let valid: HashSet<&str> = valid_experiment_ids.into_iter().collect();
        let pruned = self
            .memory
            .prune(self.config.prune_threshold, |experiment_id| {
                valid.contains(experiment_id)
            });

        if pruned > 0 {
            log::info!(target: "sticky_bucketing",
                       pruned;
                       "pruned sticky records of removed experiments");
            self.schedule(Vec::new());
        }
    }

    /// Block until every change made so far has been written to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.writer.as_ref().ok_or(Error::PersistenceDisabled)?.flush()
    }

    /// Write pending changes and stop the background writer.
    pub fn shutdown(mut self) -> Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.shutdown(),
            None => Ok(()),
        }
    }

    fn schedule(&self, restore: Vec<(StickyKey, String)>) {
        let Some(writer) = &self.writer else {
            return;
        };

        let result = if restore.is_empty() {
            writer.schedule()
        } else {
            writer.schedule_removal(restore)
        };
        if let Err(err) = result {
            log::error!(target: "sticky_bucketing",
                        "failed to schedule sticky records write: {err}");
        }
    }
}

fn validate(user_id: &str, experiment_id: &str) -> bool {
    validate_arg("user_id", user_id) && validate_arg("experiment_id", experiment_id)
}

fn validate_arg(name: &str, value: &str) -> bool {
    if value.is_empty() {
        log::error!(target: "sticky_bucketing", argument = name; "sticky store called with an empty argument");
        false
    } else {
        true
    }
}

/// Read the current records and run the one-time legacy migration. Errors are logged, never
/// returned.
///
/// Returns `None` if the current document couldn't be read. Nothing is written then: the
/// migration would replace a document we haven't seen.
fn load(config: &StickyStoreConfig, storage: &impl DurableStorage) -> Option<Records> {
    let storage_key = config.storage_key();
    let legacy_key = config.legacy_storage_key();

    let mut records = match storage.load(&storage_key) {
        Ok(Some(json)) => schema::decode(&json).unwrap_or_else(|err| {
            log::error!(target: "sticky_bucketing",
                        storage_key:display = storage_key;
                        "failed to parse sticky records, starting with an empty cache: {err}");
            Records::new()
        }),
        Ok(None) => Records::new(),
        Err(err) => {
            log::error!(target: "sticky_bucketing",
                        storage_key:display = storage_key;
                        "failed to read sticky records, keeping records in memory only: {err}");
            return None;
        }
    };

    let migration = match storage.load(&legacy_key) {
        Ok(Some(raw)) => Migration::LegacyData(raw),
        Ok(None) => Migration::NoLegacyData,
        Err(err) => {
            log::error!(target: "sticky_bucketing",
                        storage_key:display = legacy_key;
                        "failed to read legacy sticky records: {err}");
            Migration::NoLegacyData
        }
    };

    if let Migration::LegacyData(raw) = migration {
        migrate(storage, &storage_key, &legacy_key, &raw, &mut records);
    }

    Some(records)
}

fn migrate(
    storage: &impl DurableStorage,
    storage_key: &str,
    legacy_key: &str,
    raw: &str,
    records: &mut Records,
) {
    let legacy = match schema::decode_legacy(raw) {
        Ok(legacy) => legacy,
        Err(err) => {
            // A corrupt legacy document never becomes readable; drop it so we don't retry forever.
            log::error!(target: "sticky_bucketing",
                        storage_key = legacy_key;
                        "failed to parse legacy sticky records, discarding them: {err}");
            if let Err(err) = storage.delete(legacy_key) {
                log::error!(target: "sticky_bucketing", "failed to delete legacy sticky records: {err}");
            }
            return;
        }
    };

    let migrated_users = legacy.len();
    schema::merge_legacy(records, legacy);

    let written = schema::encode(records).and_then(|json| {
        storage
            .save(storage_key, &json)
            .map_err(Error::from)
    });
    if let Err(err) = written {
        // Keep the legacy document, the migration is retried on next start.
        log::error!(target: "sticky_bucketing",
                    storage_key;
                    "failed to write migrated sticky records: {err}");
        return;
    }

    if let Err(err) = storage.delete(legacy_key) {
        log::error!(target: "sticky_bucketing",
                    storage_key = legacy_key;
                    "failed to delete migrated legacy sticky records: {err}");
    }
    log::info!(target: "sticky_bucketing",
               users = migrated_users;
               "migrated legacy sticky records");
}
