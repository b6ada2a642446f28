//! Deterministic experiment bucketing with sticky (persisted) decisions.
//!
//! # Overview
//!
//! The crate revolves around a [`DecisionEngine`] that decides which [`Variation`] of an
//! [`Experiment`] a user gets. Users are hashed into a fixed bucket space with MurmurHash3, so the
//! same user always lands in the same variation for a given configuration.
//!
//! Configuration changes (re-allocating traffic, editing audiences) would normally move users
//! between variations. A [`StickyStore`] prevents that: once a user is bucketed, the decision is
//! remembered and returned on every later call. The store keeps records in memory and mirrors
//! them to a [`DurableStorage`] from a background thread, so decisions survive restarts.
//!
//! # Error Handling
//!
//! Decisions never fail. Problems such as an unknown group, a broken forced variation, or a disk
//! error are logged and degrade to "no variation" or "no persistence". Operations that the caller
//! explicitly asks to be durable return [`Error`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, all
//! under the `sticky_bucketing` target. Consider integrating a `log`-compatible logger
//! implementation for visibility into decisions and persistence.
//!
//! # Examples
//!
//! ```
//! # use std::{collections::HashMap, sync::Arc};
//! # use sticky_bucketing::*;
//! let config = Arc::new(ProjectConfig::new(
//!     "project",
//!     vec![Experiment::new(
//!         "1886780721",
//!         "checkout_button",
//!         vec![Variation::new("v1", "control"), Variation::new("v2", "treatment")],
//!         vec![TrafficAllocation::new("v1", 5000), TrafficAllocation::new("v2", 10000)],
//!     )],
//!     vec![],
//!     vec![],
//! ));
//! let store = Arc::new(StickyStore::start(
//!     StickyStoreConfig::new(config.project_id()),
//!     MemoryStorage::new(),
//! ));
//! let engine = DecisionEngine::new(config).with_sticky_store(store.clone());
//!
//! let variation = engine.get_variation_by_key("checkout_button", "user-1", &HashMap::new());
//! assert!(variation.is_some());
//! assert_eq!(store.lookup("user-1", "1886780721"), variation.map(|v| v.id.clone()));
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod attributes;
mod audience;
pub mod bucketing;
mod config;
mod decision;
mod error;
mod project;
pub mod sticky;

pub use attributes::{AttributeValue, Attributes, BUCKETING_ID_ATTRIBUTE};
pub use audience::{
    Audience, AudienceEvaluator, Condition, ConditionOperator, ConditionValue,
    RuleAudienceEvaluator,
};
pub use config::StickyStoreConfig;
pub use decision::{Decision, DecisionEngine};
pub use error::{Error, Result};
pub use project::{
    Experiment, ExperimentStatus, Group, GroupPolicy, ProjectConfig, TrafficAllocation, Variation,
};
pub use sticky::{DurableStorage, FileStorage, MemoryStorage, Records, StickyStore};
