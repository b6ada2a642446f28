//! On-disk representation of sticky records.
//!
//! Current format, keyed by user id:
//!
//! ```json
//! {
//!   "user_1": {
//!     "user_id": "user_1",
//!     "experiment_bucket_map": { "exp_1": { "variation_id": "var_1" } }
//!   }
//! }
//! ```
//!
//! Legacy format (migrated once on start, then deleted):
//!
//! ```json
//! { "user_1": { "exp_1": "var_1" } }
//! ```
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::Result;

/// user id → experiment id → variation id.
pub type Records = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserProfile {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    experiment_bucket_map: BTreeMap<String, BucketDecision>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BucketDecision {
    variation_id: String,
}

/// Whether legacy records were found on start.
#[derive(Debug)]
pub(crate) enum Migration {
    NoLegacyData,
    LegacyData(String),
}

/// Serialize records into the current format. Users without records are omitted.
pub(crate) fn encode(records: &Records) -> Result<String> {
    // BTreeMap keeps the document stable across writes, which makes diffs and tests readable.
    let document: BTreeMap<&str, UserProfile> = records
        .iter()
        .filter(|(_, decisions)| !decisions.is_empty())
        .map(|(user_id, decisions)| {
            let profile = UserProfile {
                user_id: user_id.clone(),
                experiment_bucket_map: decisions
                    .iter()
                    .map(|(experiment_id, variation_id)| {
                        (
                            experiment_id.clone(),
                            BucketDecision {
                                variation_id: variation_id.clone(),
                            },
                        )
                    })
                    .collect(),
            };
            (user_id.as_str(), profile)
        })
        .collect();

    Ok(serde_json::to_string(&document)?)
}

/// Parse a document in the current format. Entries with empty ids are dropped.
pub(crate) fn decode(json: &str) -> Result<Records> {
    let document: HashMap<String, UserProfile> = serde_json::from_str(json)?;

    Ok(document
        .into_iter()
        .filter(|(user_id, _)| !user_id.is_empty())
        .map(|(user_id, profile)| {
            let decisions = profile
                .experiment_bucket_map
                .into_iter()
                .filter(|(experiment_id, decision)| {
                    !experiment_id.is_empty() && !decision.variation_id.is_empty()
                })
                .map(|(experiment_id, decision)| (experiment_id, decision.variation_id))
                .collect::<HashMap<_, _>>();
            (user_id, decisions)
        })
        .filter(|(_, decisions)| !decisions.is_empty())
        .collect())
}

/// Parse a document in the legacy format.
pub(crate) fn decode_legacy(json: &str) -> Result<Records> {
    let mut document: Records = serde_json::from_str(json)?;
    document.retain(|user_id, decisions| {
        decisions.retain(|experiment_id, variation_id| {
            !experiment_id.is_empty() && !variation_id.is_empty()
        });
        !user_id.is_empty() && !decisions.is_empty()
    });
    Ok(document)
}

/// Fold `legacy` into `current`. Records already present in `current` win.
pub(crate) fn merge_legacy(current: &mut Records, legacy: Records) {
    for (user_id, decisions) in legacy {
        let existing = current.entry(user_id).or_default();
        for (experiment_id, variation_id) in decisions {
            existing.entry(experiment_id).or_insert(variation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{decode, decode_legacy, encode, merge_legacy, Records};

    fn records(entries: &[(&str, &str, &str)]) -> Records {
        let mut records = Records::new();
        for (user, experiment, variation) in entries {
            records
                .entry(user.to_string())
                .or_insert_with(HashMap::new)
                .insert(experiment.to_string(), variation.to_string());
        }
        records
    }

    #[test]
    fn encodes_nested_variation_ids() {
        let json = encode(&records(&[("user_1", "exp_1", "var_1")])).unwrap();
        assert_eq!(
            json,
            r#"{"user_1":{"user_id":"user_1","experiment_bucket_map":{"exp_1":{"variation_id":"var_1"}}}}"#
        );
    }

    #[test]
    fn decodes_current_format() {
        let decoded = decode(
            r#"{
                "user_1": {
                    "user_id": "user_1",
                    "experiment_bucket_map": {
                        "exp_1": { "variation_id": "var_1" },
                        "exp_2": { "variation_id": "var_2" },
                        "exp_3": { "variation_id": "" }
                    }
                },
                "user_2": { "user_id": "user_2", "experiment_bucket_map": {} }
            }"#,
        )
        .unwrap();

        assert_eq!(
            decoded,
            records(&[("user_1", "exp_1", "var_1"), ("user_1", "exp_2", "var_2")])
        );
    }

    #[test]
    fn current_format_rejects_legacy_documents() {
        assert!(decode(r#"{"user_1":{"exp_1":"var_1"}}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn decodes_legacy_format() {
        let decoded = decode_legacy(r#"{"user_1":{"exp_1":"var_1","exp_2":""},"":{"e":"v"}}"#)
            .unwrap();
        assert_eq!(decoded, records(&[("user_1", "exp_1", "var_1")]));
    }

    #[test]
    fn merge_prefers_current_records() {
        let mut current = records(&[("user_1", "exp_1", "new")]);
        merge_legacy(
            &mut current,
            records(&[("user_1", "exp_1", "old"), ("user_1", "exp_2", "var_2"), ("user_2", "exp_1", "var_3")]),
        );
        assert_eq!(
            current,
            records(&[
                ("user_1", "exp_1", "new"),
                ("user_1", "exp_2", "var_2"),
                ("user_2", "exp_1", "var_3"),
            ])
        );
    }
}
