/// Configuration for [`StickyStore`](crate::StickyStore).
// Not implementing `Copy` as we carry a project id.
#[derive(Debug, Clone)]
pub struct StickyStoreConfig {
    /// Project the sticky records belong to. Used to derive storage keys, so that several projects
    /// sharing one storage don't read each other's records.
    pub project_id: String,
    /// Users with more records than this get their records for unknown experiments dropped by
    /// [`StickyStore::prune_invalid_experiments`](crate::StickyStore::prune_invalid_experiments).
    ///
    /// Defaults to [`StickyStoreConfig::DEFAULT_PRUNE_THRESHOLD`].
    pub prune_threshold: usize,
    /// Capacity of the queue feeding the background writer.
    ///
    /// Defaults to [`StickyStoreConfig::DEFAULT_WRITE_QUEUE_CAPACITY`].
    pub write_queue_capacity: usize,
}

impl StickyStoreConfig {
    /// Default value for [`StickyStoreConfig::prune_threshold`].
    pub const DEFAULT_PRUNE_THRESHOLD: usize = 100;
    /// Default value for [`StickyStoreConfig::write_queue_capacity`].
    pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 1024;

    const KEY_PREFIX: &'static str = "sticky-bucketing";

    /// Create a new `StickyStoreConfig` for `project_id` using default settings.
    ///
    /// ```
    /// # use sticky_bucketing::StickyStoreConfig;
    /// let config = StickyStoreConfig::new("8504447126").with_prune_threshold(50);
    /// assert_eq!(config.storage_key(), "sticky-bucketing-8504447126.json");
    /// ```
    pub fn new(project_id: impl Into<String>) -> StickyStoreConfig {
        StickyStoreConfig {
            project_id: project_id.into(),
            prune_threshold: StickyStoreConfig::DEFAULT_PRUNE_THRESHOLD,
            write_queue_capacity: StickyStoreConfig::DEFAULT_WRITE_QUEUE_CAPACITY,
        }
    }

    /// Update prune threshold with `prune_threshold`.
    pub fn with_prune_threshold(mut self, prune_threshold: usize) -> StickyStoreConfig {
        self.prune_threshold = prune_threshold;
        self
    }

    /// Update writer queue capacity with `write_queue_capacity`. Zero is bumped to one.
    pub fn with_write_queue_capacity(mut self, write_queue_capacity: usize) -> StickyStoreConfig {
        self.write_queue_capacity = write_queue_capacity.max(1);
        self
    }

    /// Storage key of the current record format.
    pub fn storage_key(&self) -> String {
        format!("{}-{}.json", Self::KEY_PREFIX, self.sanitized_project_id())
    }

    /// Storage key of the legacy record format, migrated on start.
    pub fn legacy_storage_key(&self) -> String {
        format!("{}-legacy-{}.json", Self::KEY_PREFIX, self.sanitized_project_id())
    }

    /// Project id with anything that can't be safely used in a file name replaced.
    fn sanitized_project_id(&self) -> String {
        self.project_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}
