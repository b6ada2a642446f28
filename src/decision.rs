//! The decision pipeline.
//!
//! [`DecisionEngine::decide`] runs the checks below in order. The first decisive check ends the
//! pipeline:
//!
//! 1. inactive experiment → [`Decision::Inactive`]
//! 2. forced variation for the user → [`Decision::Forced`] (or [`Decision::ForcedInvalid`] if the
//!    forced key doesn't exist)
//! 3. sticky record for the user → [`Decision::Sticky`]
//! 4. audience rejects the user → [`Decision::AudienceRejected`]
//! 5. mutually-exclusive group puts the user in another experiment → [`Decision::GroupExcluded`]
//! 6. hash bucketing → [`Decision::Bucketed`] (saved to the sticky store) or
//!    [`Decision::NotBucketed`]
use std::sync::Arc;

use crate::{
    attributes::bucketing_id,
    audience::{AudienceEvaluator, RuleAudienceEvaluator},
    bucketing::{bucket_to_experiment, bucket_to_variation, BucketHasher, Murmur3Hasher},
    Attributes, Experiment, ProjectConfig, StickyStore, Variation,
};

/// Outcome of a decision, along with the reason for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<'a> {
    /// The experiment is not running.
    Inactive,
    /// The user is forced into this variation by configuration.
    Forced(&'a Variation),
    /// The user has a forced variation that doesn't exist in the experiment.
    ForcedInvalid,
    /// The user was bucketed before; returning the remembered variation.
    Sticky(&'a Variation),
    /// The user doesn't satisfy the experiment's audiences.
    AudienceRejected,
    /// The user belongs to another experiment of a mutually-exclusive group.
    GroupExcluded,
    /// The user was bucketed into this variation just now.
    Bucketed(&'a Variation),
    /// The user fell into unallocated traffic.
    NotBucketed,
}

impl<'a> Decision<'a> {
    /// The variation to serve, if any.
    pub fn variation(&self) -> Option<&'a Variation> {
        match *self {
            Decision::Forced(v) | Decision::Sticky(v) | Decision::Bucketed(v) => Some(v),
            _ => None,
        }
    }
}

/// Decides which variation of an experiment a user gets.
///
/// The engine is a pure function of its inputs apart from the sticky store write after
/// successful bucketing. It is `Sync` and can be shared between threads.
///
/// # Examples
/// ```
/// # use std::{collections::HashMap, sync::Arc};
/// # use sticky_bucketing::*;
/// let config = Arc::new(ProjectConfig::new(
///     "project",
///     vec![Experiment::new(
///         "exp",
///         "checkout",
///         vec![Variation::new("v1", "control")],
///         vec![TrafficAllocation::new("v1", 10000)],
///     )],
///     vec![],
///     vec![],
/// ));
/// let engine = DecisionEngine::new(config);
/// let variation = engine.get_variation_by_key("checkout", "user", &HashMap::new());
/// assert_eq!(variation.map(|v| v.key.as_str()), Some("control"));
/// ```
pub struct DecisionEngine<A = RuleAudienceEvaluator, H = Murmur3Hasher> {
    config: Arc<ProjectConfig>,
    sticky_store: Option<Arc<StickyStore>>,
    audience_evaluator: A,
    hasher: H,
}

impl DecisionEngine {
    /// Create an engine over `config`, using audiences from `config` and no sticky store.
    pub fn new(config: Arc<ProjectConfig>) -> DecisionEngine {
        DecisionEngine {
            config,
            sticky_store: None,
            audience_evaluator: RuleAudienceEvaluator,
            hasher: Murmur3Hasher::default(),
        }
    }
}

impl<A: AudienceEvaluator, H: BucketHasher> DecisionEngine<A, H> {
    /// Remember bucketing decisions in `sticky_store`.
    pub fn with_sticky_store(mut self, sticky_store: Arc<StickyStore>) -> Self {
        self.sticky_store = Some(sticky_store);
        self
    }

    /// Replace audience evaluation.
    pub fn with_audience_evaluator<B: AudienceEvaluator>(
        self,
        audience_evaluator: B,
    ) -> DecisionEngine<B, H> {
        DecisionEngine {
            config: self.config,
            sticky_store: self.sticky_store,
            audience_evaluator,
            hasher: self.hasher,
        }
    }

    /// Replace the hash function. Only useful for tests: every SDK must agree on the hash.
    pub fn with_hasher<G: BucketHasher>(self, hasher: G) -> DecisionEngine<A, G> {
        DecisionEngine {
            config: self.config,
            sticky_store: self.sticky_store,
            audience_evaluator: self.audience_evaluator,
            hasher,
        }
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &Arc<ProjectConfig> {
        &self.config
    }

    #[allow(missing_docs)]
    pub fn sticky_store(&self) -> Option<&Arc<StickyStore>> {
        self.sticky_store.as_ref()
    }

    /// Variation of `experiment` that `user_id` should get, or `None`.
    pub fn get_variation<'a>(
        &self,
        experiment: &'a Experiment,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<&'a Variation> {
        self.decide(experiment, user_id, attributes).variation()
    }

    /// Like [`DecisionEngine::get_variation`], looking the experiment up by key.
    pub fn get_variation_by_key(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<&Variation> {
        let Some(experiment) = self.config.experiment_by_key(experiment_key) else {
            log::warn!(target: "sticky_bucketing",
                       experiment_key,
                       user_id;
                       "requested experiment is not in the project configuration");
            return None;
        };
        self.get_variation(experiment, user_id, attributes)
    }

    /// Run the decision pipeline and report which check decided.
    pub fn decide<'a>(
        &self,
        experiment: &'a Experiment,
        user_id: &str,
        attributes: &Attributes,
    ) -> Decision<'a> {
        let decision = self.decide_inner(experiment, user_id, attributes);

        log::trace!(target: "sticky_bucketing",
                    experiment_key = experiment.key(),
                    user_id,
                    decision:? = decision;
                    "decided variation");

        decision
    }

    fn decide_inner<'a>(
        &self,
        experiment: &'a Experiment,
        user_id: &str,
        attributes: &Attributes,
    ) -> Decision<'a> {
        if !experiment.is_active() {
            log::info!(target: "sticky_bucketing",
                       experiment_key = experiment.key();
                       "experiment is not running");
            return Decision::Inactive;
        }

        if let Some(variation_key) = experiment.forced_variation_key(user_id) {
            return match experiment.variation_by_key(variation_key) {
                Some(variation) => {
                    log::info!(target: "sticky_bucketing",
                               experiment_key = experiment.key(),
                               user_id,
                               variation_key;
                               "user is forced into variation");
                    Decision::Forced(variation)
                }
                None => {
                    // A broken override disables the experiment for this user rather than
                    // bucketing them normally.
                    log::error!(target: "sticky_bucketing",
                                experiment_key = experiment.key(),
                                user_id,
                                variation_key;
                                "forced variation is not in the experiment");
                    Decision::ForcedInvalid
                }
            };
        }

        if let Some(variation) = self.sticky_variation(experiment, user_id) {
            return Decision::Sticky(variation);
        }

        if !self
            .audience_evaluator
            .is_user_in_experiment(&self.config, experiment, attributes)
        {
            log::info!(target: "sticky_bucketing",
                       experiment_key = experiment.key(),
                       user_id;
                       "user does not meet the experiment audience conditions");
            return Decision::AudienceRejected;
        }

        let bucketing_id = bucketing_id(user_id, attributes);

        if let Some(group_id) = experiment.group_id() {
            if !self.is_in_group_experiment(experiment, group_id, bucketing_id) {
                return Decision::GroupExcluded;
            }
        }

        let Some(variation) = bucket_to_variation(&self.hasher, experiment, bucketing_id) else {
            log::info!(target: "sticky_bucketing",
                       experiment_key = experiment.key(),
                       user_id;
                       "user is not in any variation");
            return Decision::NotBucketed;
        };

        log::info!(target: "sticky_bucketing",
                   experiment_key = experiment.key(),
                   user_id,
                   variation_key:display = variation.key;
                   "user is in variation");

        if let Some(store) = &self.sticky_store {
            if !store.save(user_id, experiment.id(), &variation.id) {
                log::warn!(target: "sticky_bucketing",
                           experiment_key = experiment.key(),
                           user_id;
                           "failed to remember bucketing decision");
            }
        }

        Decision::Bucketed(variation)
    }

    fn sticky_variation<'a>(
        &self,
        experiment: &'a Experiment,
        user_id: &str,
    ) -> Option<&'a Variation> {
        let store = self.sticky_store.as_ref()?;
        let variation_id = store.lookup(user_id, experiment.id())?;

        match experiment.variation_by_id(&variation_id) {
            Some(variation) => {
                log::info!(target: "sticky_bucketing",
                           experiment_key = experiment.key(),
                           user_id,
                           variation_key:display = variation.key;
                           "returning remembered variation");
                Some(variation)
            }
            None => {
                // The variation was deleted from the experiment. Bucket again; the new decision
                // replaces the stale record.
                log::warn!(target: "sticky_bucketing",
                           experiment_key = experiment.key(),
                           user_id,
                           variation_id:display = variation_id;
                           "remembered variation is no longer in the experiment");
                None
            }
        }
    }

    /// Returns `true` if group mutual exclusion lets the user into `experiment`.
    fn is_in_group_experiment(
        &self,
        experiment: &Experiment,
        group_id: &str,
        bucketing_id: &str,
    ) -> bool {
        let Some(group) = self.config.group(group_id) else {
            log::error!(target: "sticky_bucketing",
                        experiment_key = experiment.key(),
                        group_id;
                        "experiment references an unknown group");
            return false;
        };

        if !group.is_mutually_exclusive() {
            return true;
        }

        match bucket_to_experiment(&self.hasher, &self.config, group, bucketing_id) {
            Some(bucketed) if bucketed.id() == experiment.id() => true,
            Some(bucketed) => {
                log::info!(target: "sticky_bucketing",
                           experiment_key = experiment.key(),
                           group_id,
                           bucketing_id,
                           bucketed_experiment_key = bucketed.key();
                           "user is in another experiment of the group");
                false
            }
            None => {
                log::info!(target: "sticky_bucketing",
                           experiment_key = experiment.key(),
                           group_id,
                           bucketing_id;
                           "user is not in any experiment of the group");
                false
            }
        }
    }
}
