//! Deterministic traffic allocation.
//!
//! A salted identifier is hashed with MurmurHash3 (x86, 32-bit, seed 1) and mapped onto
//! `[0, TOTAL_RANGE)`. The resulting bucket value is then looked up in an ordered list of
//! [`TrafficAllocation`]s. Every step is a pure function, and the constants are shared with other
//! SDKs: changing any of them reshuffles every user.
use std::io::Cursor;

use murmur3::murmur3_32;

use crate::{Experiment, Group, ProjectConfig, TrafficAllocation, Variation};

/// Size of the bucket space. One unit is 0.01% of traffic.
pub const TOTAL_RANGE: u32 = 10_000;

/// Seed for MurmurHash3.
pub const MURMUR_SEED: u32 = 1;

/// Hashes a salted identifier into 32 bits.
pub trait BucketHasher {
    #[allow(missing_docs)]
    fn hash(&self, input: &str) -> u32;
}

/// The default (and only) hasher: MurmurHash3 x86_32 over UTF-8 bytes.
#[derive(Debug, Clone, Copy)]
pub struct Murmur3Hasher {
    seed: u32,
}

impl Murmur3Hasher {
    #[allow(missing_docs)]
    pub const fn new(seed: u32) -> Murmur3Hasher {
        Murmur3Hasher { seed }
    }
}

impl Default for Murmur3Hasher {
    fn default() -> Murmur3Hasher {
        Murmur3Hasher::new(MURMUR_SEED)
    }
}

impl BucketHasher for Murmur3Hasher {
    fn hash(&self, input: &str) -> u32 {
        // The only error source is the reader, and reading a byte slice can't fail.
        murmur3_32(&mut Cursor::new(input.as_bytes()), self.seed).unwrap_or_default()
    }
}

/// Map a 32-bit hash onto `[0, TOTAL_RANGE)`.
///
/// The hash is treated as unsigned and widened before the division, so values with the high bit
/// set land in the upper half of the range.
pub fn to_bucket_value(hash: u32) -> u32 {
    let ratio = f64::from(hash) / (u64::from(u32::MAX) + 1) as f64;
    (ratio * f64::from(TOTAL_RANGE)).floor() as u32
}

/// Find the entity owning `bucket_value`.
///
/// The first allocation whose `end_of_range` is strictly greater than the bucket value wins.
/// Returns `None` when the bucket value lands past the last range or in an unallocated (empty
/// entity id) range.
pub fn resolve(bucket_value: u32, allocations: &[TrafficAllocation]) -> Option<&str> {
    allocations
        .iter()
        .find(|allocation| bucket_value < allocation.end_of_range)
        .map(|allocation| allocation.entity_id.as_str())
        .filter(|entity_id| !entity_id.is_empty())
}

/// Bucket value of `bucketing_id` salted with `entity_id`.
pub fn bucket_value(hasher: &impl BucketHasher, bucketing_id: &str, entity_id: &str) -> u32 {
    let salted = format!("{bucketing_id}{entity_id}");
    to_bucket_value(hasher.hash(&salted))
}

/// Pick a variation of `experiment` for `bucketing_id`.
pub fn bucket_to_variation<'a>(
    hasher: &impl BucketHasher,
    experiment: &'a Experiment,
    bucketing_id: &str,
) -> Option<&'a Variation> {
    let value = bucket_value(hasher, bucketing_id, experiment.id());
    let variation_id = resolve(value, experiment.traffic_allocation())?;

    let variation = experiment.variation_by_id(variation_id);
    if variation.is_none() {
        log::error!(target: "sticky_bucketing",
                    experiment_key = experiment.key(),
                    variation_id;
                    "traffic allocation references an unknown variation");
    }
    variation
}

/// Pick the member experiment of `group` that `bucketing_id` may enter.
pub fn bucket_to_experiment<'a>(
    hasher: &impl BucketHasher,
    config: &'a ProjectConfig,
    group: &Group,
    bucketing_id: &str,
) -> Option<&'a Experiment> {
    let value = bucket_value(hasher, bucketing_id, &group.id);
    let experiment_id = resolve(value, &group.traffic_allocation)?;

    let experiment = config.experiment_by_id(experiment_id);
    if experiment.is_none() {
        log::error!(target: "sticky_bucketing",
                    group_id:display = group.id,
                    experiment_id;
                    "group traffic allocation references an unknown experiment");
    }
    experiment
}

#[cfg(test)]
mod tests {
    use super::{
        bucket_to_experiment, bucket_to_variation, bucket_value, resolve, to_bucket_value,
        BucketHasher, Murmur3Hasher, TOTAL_RANGE,
    };
    use crate::{Experiment, Group, GroupPolicy, ProjectConfig, TrafficAllocation, Variation};

    /// Hasher returning a fixed value, to steer tests into a known bucket.
    struct FixedHasher(u32);

    impl BucketHasher for FixedHasher {
        fn hash(&self, _input: &str) -> u32 {
            self.0
        }
    }

    /// Smallest hash that maps to `bucket`.
    fn hash_for_bucket(bucket: u32) -> u32 {
        ((u64::from(bucket) << 32) / u64::from(TOTAL_RANGE) + 1) as u32
    }

    fn four_way_allocation() -> Vec<TrafficAllocation> {
        vec![
            TrafficAllocation::new("v1", 1000),
            TrafficAllocation::new("v2", 5000),
            TrafficAllocation::new("v3", 6000),
            TrafficAllocation::new("v4", 10000),
        ]
    }

    #[test]
    fn known_bucket_values() {
        let hasher = Murmur3Hasher::default();
        assert_eq!(bucket_value(&hasher, "ppid1", "1886780721"), 5254);
        assert_eq!(bucket_value(&hasher, "ppid2", "1886780721"), 4299);
        assert_eq!(bucket_value(&hasher, "ppid2", "1886780722"), 2434);
        assert_eq!(bucket_value(&hasher, "ppid3", "1886780721"), 5439);
    }

    #[test]
    fn hashing_is_deterministic() {
        let a = Murmur3Hasher::default();
        let b = Murmur3Hasher::default();
        for id in ["", "user", "ünïcödé", "a much longer identifier with a tail"] {
            assert_eq!(a.hash(id), b.hash(id));
        }
        assert_ne!(Murmur3Hasher::new(1).hash("user"), Murmur3Hasher::new(2).hash("user"));
    }

    #[test]
    fn bucket_value_stays_in_range() {
        assert_eq!(to_bucket_value(0), 0);
        assert_eq!(to_bucket_value(u32::MAX), TOTAL_RANGE - 1);
        assert_eq!(to_bucket_value(1 << 31), TOTAL_RANGE / 2);
        assert_eq!(to_bucket_value((1 << 31) - 1), TOTAL_RANGE / 2 - 1);

        let mut hash = 0u32;
        loop {
            assert!(to_bucket_value(hash) < TOTAL_RANGE);
            match hash.checked_add(65_521) {
                Some(next) => hash = next,
                None => break,
            }
        }
    }

    #[test]
    fn bucket_values_split_evenly() {
        let step = 4_099u32;
        let (mut below, mut total) = (0u64, 0u64);
        let mut hash = 0u32;
        loop {
            if to_bucket_value(hash) < TOTAL_RANGE / 2 {
                below += 1;
            }
            total += 1;
            match hash.checked_add(step) {
                Some(next) => hash = next,
                None => break,
            }
        }
        let ratio = below as f64 / total as f64;
        assert!((ratio - 0.5).abs() < 0.001, "ratio {ratio} is not ~0.5");
    }

    #[test]
    fn resolve_range_boundaries() {
        let allocation = four_way_allocation();
        assert_eq!(resolve(0, &allocation), Some("v1"));
        assert_eq!(resolve(999, &allocation), Some("v1"));
        assert_eq!(resolve(1000, &allocation), Some("v2"));
        assert_eq!(resolve(4999, &allocation), Some("v2"));
        assert_eq!(resolve(5999, &allocation), Some("v3"));
        assert_eq!(resolve(9999, &allocation), Some("v4"));
        assert_eq!(resolve(10000, &allocation), None);
    }

    #[test]
    fn resolve_unallocated_space() {
        let allocation = vec![
            TrafficAllocation::new("v1", 2500),
            TrafficAllocation::new("", 7500),
            TrafficAllocation::new("v2", 9000),
        ];
        assert_eq!(resolve(2499, &allocation), Some("v1"));
        assert_eq!(resolve(2500, &allocation), None);
        assert_eq!(resolve(7500, &allocation), Some("v2"));
        assert_eq!(resolve(9000, &allocation), None);
        assert_eq!(resolve(0, &[]), None);
    }

    #[test]
    fn bucket_to_variation_follows_allocation() {
        let experiment = Experiment::new(
            "1886780721",
            "exp",
            vec![
                Variation::new("v1", "a"),
                Variation::new("v2", "b"),
                Variation::new("v3", "c"),
                Variation::new("v4", "d"),
            ],
            four_way_allocation(),
        );

        for (bucket, expected) in [(999, "v1"), (1000, "v2"), (5999, "v3"), (9999, "v4")] {
            let hasher = FixedHasher(hash_for_bucket(bucket));
            assert_eq!(to_bucket_value(hasher.0), bucket);
            let variation = bucket_to_variation(&hasher, &experiment, "user").unwrap();
            assert_eq!(variation.id, expected);
        }

        // "ppid1" lands in 5254 → third range; "ppid2" lands in 4299 → second range.
        let hasher = Murmur3Hasher::default();
        assert_eq!(bucket_to_variation(&hasher, &experiment, "ppid1").unwrap().id, "v3");
        assert_eq!(bucket_to_variation(&hasher, &experiment, "ppid2").unwrap().id, "v2");
    }

    #[test]
    fn bucket_to_variation_unknown_variation_is_none() {
        let experiment = Experiment::new(
            "exp_id",
            "exp",
            vec![Variation::new("v1", "a")],
            vec![TrafficAllocation::new("deleted", 10000)],
        );
        assert_eq!(
            bucket_to_variation(&Murmur3Hasher::default(), &experiment, "user"),
            None
        );
    }

    #[test]
    fn bucket_to_experiment_uses_group_allocation() {
        let group = Group {
            id: "group".to_owned(),
            policy: GroupPolicy::Random,
            experiment_ids: vec!["exp_a".to_owned(), "exp_b".to_owned()],
            traffic_allocation: vec![
                TrafficAllocation::new("exp_a", 5000),
                TrafficAllocation::new("exp_b", 10000),
            ],
        };
        let config = ProjectConfig::new(
            "project",
            vec![
                Experiment::new("exp_a", "a", vec![], vec![]).with_group_id("group"),
                Experiment::new("exp_b", "b", vec![], vec![]).with_group_id("group"),
            ],
            vec![group.clone()],
            vec![],
        );

        let low = FixedHasher(hash_for_bucket(4999));
        assert_eq!(bucket_to_experiment(&low, &config, &group, "user").unwrap().id(), "exp_a");
        let high = FixedHasher(hash_for_bucket(5000));
        assert_eq!(bucket_to_experiment(&high, &config, &group, "user").unwrap().id(), "exp_b");
    }
}
