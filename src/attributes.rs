use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// User attributes passed to a decision, keyed by attribute name.
///
/// # Examples
/// ```
/// # use sticky_bucketing::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("browser".to_owned(), "firefox".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Reserved attribute that overrides the identity used for hashing.
///
/// When present (and a string), it replaces the user id in bucketing salts, so that several users
/// (e.g., members of one household) can share an assignment. Forced variations and sticky records
/// are still keyed by the user id.
pub const BUCKETING_ID_ATTRIBUTE: &str = "$opt_bucketing_id";

/// Value of a single user attribute.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    /// Returns the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Pick the identity to hash for `user_id`.
pub(crate) fn bucketing_id<'a>(user_id: &'a str, attributes: &'a Attributes) -> &'a str {
    match attributes.get(BUCKETING_ID_ATTRIBUTE) {
        None => user_id,
        Some(AttributeValue::String(id)) => id.as_str(),
        Some(other) => {
            log::warn!(target: "sticky_bucketing",
                       user_id,
                       bucketing_id:serde = other;
                       "bucketing id attribute is not a string, falling back to user id");
            user_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{bucketing_id, Attributes, BUCKETING_ID_ATTRIBUTE};

    #[test]
    fn bucketing_id_defaults_to_user_id() {
        assert_eq!(bucketing_id("user", &Attributes::new()), "user");
    }

    #[test]
    fn bucketing_id_attribute_overrides_user_id() {
        let attributes: Attributes = [(BUCKETING_ID_ATTRIBUTE.to_owned(), "household".into())]
            .into_iter()
            .collect();
        assert_eq!(bucketing_id("user", &attributes), "household");
    }

    #[test]
    fn non_string_bucketing_id_is_ignored() {
        let attributes: Attributes = [(BUCKETING_ID_ATTRIBUTE.to_owned(), 42.0.into())]
            .into_iter()
            .collect();
        assert_eq!(bucketing_id("user", &attributes), "user");
    }
}
