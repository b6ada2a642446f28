//! Audience targeting.
//!
//! [`DecisionEngine`](crate::DecisionEngine) asks an [`AudienceEvaluator`] whether a user may
//! enter an experiment. The default [`RuleAudienceEvaluator`] interprets the audiences referenced
//! by the experiment: the user must match *any* referenced audience, and an audience matches when
//! *all* of its conditions hold.
use derive_more::From;
use regex::Regex;
use semver::Version;
use serde::Deserialize;

use crate::{AttributeValue, Attributes, Experiment, ProjectConfig};

/// Decides whether a user satisfies an experiment's targeting rules.
///
/// Implemented for closures, which is handy for tests and for hosts that bring their own
/// targeting:
///
/// ```
/// # use sticky_bucketing::{AudienceEvaluator, Attributes, Experiment, ProjectConfig};
/// let everyone = |_: &ProjectConfig, _: &Experiment, _: &Attributes| true;
/// # fn check(_: impl AudienceEvaluator) {}
/// # check(everyone);
/// ```
pub trait AudienceEvaluator {
    #[allow(missing_docs)]
    fn is_user_in_experiment(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        attributes: &Attributes,
    ) -> bool;
}

impl<F> AudienceEvaluator for F
where
    F: Fn(&ProjectConfig, &Experiment, &Attributes) -> bool,
{
    fn is_user_in_experiment(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        attributes: &Attributes,
    ) -> bool {
        self(config, experiment, attributes)
    }
}

/// Evaluates the audiences stored in [`ProjectConfig`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleAudienceEvaluator;

impl AudienceEvaluator for RuleAudienceEvaluator {
    fn is_user_in_experiment(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        attributes: &Attributes,
    ) -> bool {
        let audience_ids = experiment.audience_ids();
        if audience_ids.is_empty() {
            return true;
        }

        audience_ids
            .iter()
            .any(|audience_id| match config.audience(audience_id) {
                Some(audience) => audience.matches(attributes),
                None => {
                    log::warn!(target: "sticky_bucketing",
                               experiment_key = experiment.key(),
                               audience_id:display = audience_id;
                               "experiment references an unknown audience");
                    false
                }
            })
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Audience {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Audience {
    /// An audience matches when all of its conditions hold. An audience without conditions
    /// matches everyone.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.matches(attributes))
    }
}

/// A single targeting condition over one attribute.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Condition {
    pub attribute: String,
    pub operator: ConditionOperator,
    pub value: ConditionValue,
}

impl Condition {
    #[allow(missing_docs)]
    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.operator
            .eval(attributes.get(&self.attribute), &self.value)
    }
}

/// Right-hand side of a condition.
#[derive(Debug, Deserialize, Clone, PartialEq, From)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum ConditionValue {
    Boolean(bool),
    Number(f64),
    String(String),
    List(Vec<String>),
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> ConditionValue {
        ConditionValue::String(value.to_owned())
    }
}

impl From<Vec<&str>> for ConditionValue {
    fn from(value: Vec<&str>) -> ConditionValue {
        ConditionValue::List(value.into_iter().map(str::to_owned).collect())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ConditionOperator {
    Matches,
    NotMatches,
    Gte,
    Gt,
    Lte,
    Lt,
    OneOf,
    NotOneOf,
    IsNull,
}

impl ConditionOperator {
    /// Apply the operator. Returns `false` when it cannot be applied (type mismatch, bad regex,
    /// missing attribute).
    pub fn eval(self, attribute: Option<&AttributeValue>, value: &ConditionValue) -> bool {
        use ConditionOperator::*;

        let result = match self {
            Matches => regex_match(attribute, value),
            NotMatches => regex_match(attribute, value).map(|m| !m),
            OneOf => one_of(attribute, value),
            NotOneOf => one_of(attribute, value).map(|m| !m),
            IsNull => is_null(attribute, value),
            Gte | Gt | Lte | Lt => compare(attribute, value).map(|ordering| match self {
                Gte => ordering.is_ge(),
                Gt => ordering.is_gt(),
                Lte => ordering.is_le(),
                _ => ordering.is_lt(),
            }),
        };

        result.unwrap_or(false)
    }
}

fn regex_match(attribute: Option<&AttributeValue>, value: &ConditionValue) -> Option<bool> {
    let subject = attribute?.as_str()?;
    let ConditionValue::String(pattern) = value else {
        return None;
    };
    let regex = Regex::new(pattern).ok()?;
    Some(regex.is_match(subject))
}

fn one_of(attribute: Option<&AttributeValue>, value: &ConditionValue) -> Option<bool> {
    let subject = match attribute? {
        AttributeValue::String(s) => s.clone(),
        AttributeValue::Number(n) => n.to_string(),
        AttributeValue::Boolean(b) => b.to_string(),
        AttributeValue::Null => return None,
    };
    let ConditionValue::List(candidates) = value else {
        return None;
    };
    Some(candidates.iter().any(|c| *c == subject))
}

fn is_null(attribute: Option<&AttributeValue>, value: &ConditionValue) -> Option<bool> {
    let null = matches!(attribute, None | Some(AttributeValue::Null));
    match value {
        ConditionValue::Boolean(expected) => Some(null == *expected),
        _ => None,
    }
}

/// Compare attribute to condition value. Strings that parse as semver on both sides are compared
/// as versions, everything else numerically.
fn compare(
    attribute: Option<&AttributeValue>,
    value: &ConditionValue,
) -> Option<std::cmp::Ordering> {
    let attribute = attribute?;

    if let ConditionValue::String(s) = value {
        if let Ok(expected) = Version::parse(s) {
            let actual = Version::parse(attribute.as_str()?).ok()?;
            return Some(actual.cmp(&expected));
        }
    }

    let expected = match value {
        ConditionValue::Number(n) => *n,
        ConditionValue::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let actual = match attribute {
        AttributeValue::Number(n) => *n,
        AttributeValue::String(s) => s.parse().ok()?,
        _ => return None,
    };
    actual.partial_cmp(&expected)
}
