//! Read-only project configuration: experiments, variations, mutually-exclusive groups and
//! audiences.
//!
//! A [`ProjectConfig`] is an immutable snapshot. It can be assembled from already-parsed values
//! with [`ProjectConfig::new`] or deserialized from a datafile-shaped JSON document with
//! [`ProjectConfig::from_json`]. Either way, lookup indexes are built once, up front.
use std::collections::HashMap;

use serde::Deserialize;

use crate::{audience::Audience, Result};

/// A contiguous range of the bucket space owned by one entity (variation or experiment).
///
/// Allocations are kept in a list sorted by `end_of_range`; each entry owns the half-open range
/// from the previous entry's `end_of_range` up to its own.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficAllocation {
    /// Variation id or experiment id. Empty string marks deliberately unallocated traffic.
    pub entity_id: String,
    /// Exclusive upper bound of the range, in `[0, TOTAL_RANGE]`.
    pub end_of_range: u32,
}

impl TrafficAllocation {
    #[allow(missing_docs)]
    pub fn new(entity_id: impl Into<String>, end_of_range: u32) -> TrafficAllocation {
        TrafficAllocation {
            entity_id: entity_id.into(),
            end_of_range,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Variation {
    pub id: String,
    pub key: String,
}

impl Variation {
    #[allow(missing_docs)]
    pub fn new(id: impl Into<String>, key: impl Into<String>) -> Variation {
        Variation {
            id: id.into(),
            key: key.into(),
        }
    }
}

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExperimentStatus {
    #[allow(missing_docs)]
    Running,
    /// The experiment finished and its winner is being served. Still evaluated.
    Launched,
    #[allow(missing_docs)]
    Paused,
    #[allow(missing_docs)]
    NotStarted,
    #[allow(missing_docs)]
    Archived,
    /// A status this library doesn't know about. Never active.
    Unknown(String),
}

impl ExperimentStatus {
    /// Returns `true` if users should be bucketed into an experiment with this status.
    pub fn is_active(&self) -> bool {
        matches!(self, ExperimentStatus::Running | ExperimentStatus::Launched)
    }
}

impl From<String> for ExperimentStatus {
    fn from(value: String) -> ExperimentStatus {
        match value.as_str() {
            "Running" => ExperimentStatus::Running,
            "Launched" => ExperimentStatus::Launched,
            "Paused" => ExperimentStatus::Paused,
            "Not started" => ExperimentStatus::NotStarted,
            "Archived" => ExperimentStatus::Archived,
            _ => ExperimentStatus::Unknown(value),
        }
    }
}

impl<'de> Deserialize<'de> for ExperimentStatus {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(ExperimentStatus::from)
    }
}

/// Wire representation of an experiment, before indexes are built.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExperimentDef {
    id: String,
    key: String,
    status: ExperimentStatus,
    #[serde(default)]
    group_id: String,
    #[serde(default)]
    audience_ids: Vec<String>,
    variations: Vec<Variation>,
    traffic_allocation: Vec<TrafficAllocation>,
    #[serde(default)]
    forced_variations: HashMap<String, String>,
}

/// An experiment definition. Immutable once built.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "ExperimentDef")]
pub struct Experiment {
    id: String,
    key: String,
    status: ExperimentStatus,
    group_id: String,
    audience_ids: Vec<String>,
    variations: Vec<Variation>,
    traffic_allocation: Vec<TrafficAllocation>,
    /// user id → variation key
    forced_variations: HashMap<String, String>,

    variation_index_by_id: HashMap<String, usize>,
    variation_index_by_key: HashMap<String, usize>,
}

impl From<ExperimentDef> for Experiment {
    fn from(def: ExperimentDef) -> Experiment {
        let variation_index_by_id = def
            .variations
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id.clone(), i))
            .collect();
        let variation_index_by_key = def
            .variations
            .iter()
            .enumerate()
            .map(|(i, v)| (v.key.clone(), i))
            .collect();

        Experiment {
            id: def.id,
            key: def.key,
            status: def.status,
            group_id: def.group_id,
            audience_ids: def.audience_ids,
            variations: def.variations,
            traffic_allocation: def.traffic_allocation,
            forced_variations: def.forced_variations,
            variation_index_by_id,
            variation_index_by_key,
        }
    }
}

impl Experiment {
    /// Create a running, ungrouped experiment with no audiences and no forced variations.
    ///
    /// Use the `with_*` methods to fill in the rest.
    ///
    /// ```
    /// # use sticky_bucketing::{Experiment, TrafficAllocation, Variation};
    /// let experiment = Experiment::new(
    ///     "1886780721",
    ///     "checkout_button",
    ///     vec![Variation::new("v1", "control"), Variation::new("v2", "treatment")],
    ///     vec![TrafficAllocation::new("v1", 5000), TrafficAllocation::new("v2", 10000)],
    /// )
    /// .with_forced_variation("qa-user", "treatment");
    /// ```
    pub fn new(
        id: impl Into<String>,
        key: impl Into<String>,
        variations: Vec<Variation>,
        traffic_allocation: Vec<TrafficAllocation>,
    ) -> Experiment {
        Experiment::from(ExperimentDef {
            id: id.into(),
            key: key.into(),
            status: ExperimentStatus::Running,
            group_id: String::new(),
            audience_ids: Vec::new(),
            variations,
            traffic_allocation,
            forced_variations: HashMap::new(),
        })
    }

    #[allow(missing_docs)]
    pub fn with_status(mut self, status: ExperimentStatus) -> Experiment {
        self.status = status;
        self
    }

    #[allow(missing_docs)]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Experiment {
        self.group_id = group_id.into();
        self
    }

    #[allow(missing_docs)]
    pub fn with_audience_ids(mut self, audience_ids: Vec<String>) -> Experiment {
        self.audience_ids = audience_ids;
        self
    }

    #[allow(missing_docs)]
    pub fn with_traffic_allocation(mut self, traffic_allocation: Vec<TrafficAllocation>) -> Experiment {
        self.traffic_allocation = traffic_allocation;
        self
    }

    /// Force `user_id` into the variation with `variation_key`.
    pub fn with_forced_variation(
        mut self,
        user_id: impl Into<String>,
        variation_key: impl Into<String>,
    ) -> Experiment {
        self.forced_variations
            .insert(user_id.into(), variation_key.into());
        self
    }

    #[allow(missing_docs)]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[allow(missing_docs)]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[allow(missing_docs)]
    pub fn status(&self) -> &ExperimentStatus {
        &self.status
    }

    /// Returns `true` if the experiment is running (or launched).
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Id of the group this experiment belongs to, or `None` if it is not grouped.
    pub fn group_id(&self) -> Option<&str> {
        if self.group_id.is_empty() {
            None
        } else {
            Some(&self.group_id)
        }
    }

    #[allow(missing_docs)]
    pub fn audience_ids(&self) -> &[String] {
        &self.audience_ids
    }

    #[allow(missing_docs)]
    pub fn variations(&self) -> &[Variation] {
        &self.variations
    }

    #[allow(missing_docs)]
    pub fn traffic_allocation(&self) -> &[TrafficAllocation] {
        &self.traffic_allocation
    }

    /// Variation key `user_id` is forced into, if any.
    pub fn forced_variation_key(&self, user_id: &str) -> Option<&str> {
        self.forced_variations.get(user_id).map(String::as_str)
    }

    #[allow(missing_docs)]
    pub fn variation_by_id(&self, variation_id: &str) -> Option<&Variation> {
        self.variation_index_by_id
            .get(variation_id)
            .map(|&i| &self.variations[i])
    }

    #[allow(missing_docs)]
    pub fn variation_by_key(&self, variation_key: &str) -> Option<&Variation> {
        self.variation_index_by_key
            .get(variation_key)
            .map(|&i| &self.variations[i])
    }
}

/// Group policy.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Mutually exclusive: a user is bucketed into at most one experiment of the group.
    Random,
    /// Member experiments are evaluated independently.
    Overlapping,
}

/// A set of experiments sharing one traffic space.
#[derive(Debug, Clone)]
pub struct Group {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub policy: GroupPolicy,
    /// Ids of the member experiments.
    pub experiment_ids: Vec<String>,
    /// Allocation of the group traffic over member experiment ids.
    pub traffic_allocation: Vec<TrafficAllocation>,
}

impl Group {
    /// Returns `true` if at most one member experiment may be entered by a given user.
    pub fn is_mutually_exclusive(&self) -> bool {
        self.policy == GroupPolicy::Random
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupDef {
    id: String,
    policy: GroupPolicy,
    #[serde(default)]
    experiments: Vec<Experiment>,
    #[serde(default)]
    traffic_allocation: Vec<TrafficAllocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Datafile {
    project_id: String,
    #[serde(default)]
    experiments: Vec<Experiment>,
    #[serde(default)]
    groups: Vec<GroupDef>,
    #[serde(default)]
    audiences: Vec<Audience>,
}

impl From<Datafile> for ProjectConfig {
    fn from(datafile: Datafile) -> ProjectConfig {
        let mut experiments = datafile.experiments;
        let mut groups = Vec::with_capacity(datafile.groups.len());

        for group in datafile.groups {
            let experiment_ids = group.experiments.iter().map(|e| e.id.clone()).collect();
            experiments.extend(
                group
                    .experiments
                    .into_iter()
                    .map(|e| e.with_group_id(group.id.clone())),
            );
            groups.push(Group {
                id: group.id,
                policy: group.policy,
                experiment_ids,
                traffic_allocation: group.traffic_allocation,
            });
        }

        ProjectConfig::new(datafile.project_id, experiments, groups, datafile.audiences)
    }
}

/// Immutable, indexed snapshot of the project configuration.
#[derive(Debug, Deserialize)]
#[serde(from = "Datafile")]
pub struct ProjectConfig {
    project_id: String,
    experiments: Vec<Experiment>,
    experiment_index_by_id: HashMap<String, usize>,
    experiment_index_by_key: HashMap<String, usize>,
    groups: HashMap<String, Group>,
    audiences: HashMap<String, Audience>,
}

impl ProjectConfig {
    /// Build a configuration from parsed parts.
    ///
    /// Experiments belonging to a group must already carry the group id (see
    /// [`Experiment::with_group_id`]). On duplicate ids, the last definition wins.
    pub fn new(
        project_id: impl Into<String>,
        experiments: Vec<Experiment>,
        groups: Vec<Group>,
        audiences: Vec<Audience>,
    ) -> ProjectConfig {
        let experiment_index_by_id = experiments
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        let experiment_index_by_key = experiments
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.clone(), i))
            .collect();

        ProjectConfig {
            project_id: project_id.into(),
            experiments,
            experiment_index_by_id,
            experiment_index_by_key,
            groups: groups.into_iter().map(|g| (g.id.clone(), g)).collect(),
            audiences: audiences.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    /// Parse a datafile-shaped JSON document.
    ///
    /// Experiments nested inside `groups` are lifted into the experiment index and tagged with
    /// their group id.
    pub fn from_json(json: &str) -> Result<ProjectConfig> {
        Ok(serde_json::from_str(json)?)
    }

    #[allow(missing_docs)]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// All experiments, including group members.
    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    #[allow(missing_docs)]
    pub fn experiment_by_id(&self, experiment_id: &str) -> Option<&Experiment> {
        self.experiment_index_by_id
            .get(experiment_id)
            .map(|&i| &self.experiments[i])
    }

    #[allow(missing_docs)]
    pub fn experiment_by_key(&self, experiment_key: &str) -> Option<&Experiment> {
        self.experiment_index_by_key
            .get(experiment_key)
            .map(|&i| &self.experiments[i])
    }

    #[allow(missing_docs)]
    pub fn group(&self, group_id: &str) -> Option<&Group> {
        self.groups.get(group_id)
    }

    #[allow(missing_docs)]
    pub fn audience(&self, audience_id: &str) -> Option<&Audience> {
        self.audiences.get(audience_id)
    }

    /// Ids of every experiment in this configuration. Used to prune stale sticky records.
    pub fn experiment_ids(&self) -> impl Iterator<Item = &str> {
        self.experiments.iter().map(|e| e.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Read};

    use super::{ExperimentStatus, GroupPolicy, ProjectConfig};

    fn load_fixture() -> ProjectConfig {
        let mut json = String::new();
        File::open("tests/data/datafile.json")
            .expect("Failed to open tests/data/datafile.json")
            .read_to_string(&mut json)
            .unwrap();
        ProjectConfig::from_json(&json).unwrap()
    }

    #[test]
    fn parse_datafile() {
        let config = load_fixture();

        assert_eq!(config.project_id(), "8504447126");
        let experiment = config.experiment_by_key("checkout_flow").unwrap();
        assert_eq!(experiment.id(), "1886780721");
        assert_eq!(experiment.group_id(), None);
        assert_eq!(experiment.variation_by_id("v2").unwrap().key, "variation_b");
        assert_eq!(experiment.variation_by_key("variation_b").unwrap().id, "v2");
        assert_eq!(experiment.forced_variation_key("forced_user"), Some("variation_b"));
    }

    #[test]
    fn group_experiments_are_indexed_with_group_id() {
        let config = load_fixture();

        let group = config.group("group_1").unwrap();
        assert_eq!(group.policy, GroupPolicy::Random);
        assert_eq!(group.experiment_ids, vec!["group_exp_1", "group_exp_2"]);

        let experiment = config.experiment_by_id("group_exp_2").unwrap();
        assert_eq!(experiment.group_id(), Some("group_1"));
        assert_eq!(
            config.experiment_by_key("group_experiment_2").unwrap().id(),
            "group_exp_2"
        );
    }

    #[test]
    fn unknown_status_is_not_active() {
        let config = load_fixture();

        let paused = config.experiment_by_key("paused_experiment").unwrap();
        assert_eq!(paused.status(), &ExperimentStatus::Paused);
        assert!(!paused.is_active());

        let status = ExperimentStatus::from("Something new".to_owned());
        assert_eq!(status, ExperimentStatus::Unknown("Something new".to_owned()));
        assert!(!status.is_active());
        assert!(ExperimentStatus::Launched.is_active());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(ProjectConfig::from_json("{ not json").is_err());
    }
}
