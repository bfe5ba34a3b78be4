//! The absent / null / present field trichotomy.
//!
//! Delta-carrying messages (`stream/update`, `server/state`,
//! `group/update`) distinguish three states per field:
//!
//! * *absent* - retain the receiver's prior value;
//! * `null` - clear the prior value;
//! * present - replace it.
//!
//! [`Field`] makes the trichotomy a first-class value. Declare delta
//! fields as
//!
//! ```ignore
//! #[serde(default, skip_serializing_if = "Field::is_undefined")]
//! pub title: Field<String>,
//! ```
//!
//! so that a missing key deserializes to [`Field::Undefined`] and an
//! `Undefined` value is omitted on serialize.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One field of a delta update.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Field<T> {
    /// Key absent on the wire: the receiver keeps its prior value.
    #[default]
    Undefined,

    /// Key explicitly `null`: the receiver clears its prior value.
    Null,

    /// Key present: the receiver replaces its prior value.
    Value(T),
}

impl<T> Field<T> {
    /// `true` when the key was absent.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Field::Undefined)
    }

    /// Returns the contained value, if present.
    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Applies this field to the receiver-side accumulated state.
    pub fn merge_into(self, slot: &mut Option<T>) {
        match self {
            Field::Undefined => {}
            Field::Null => *slot = None,
            Field::Value(v) => *slot = Some(v),
        }
    }

    /// Maps the present value, preserving `Undefined` and `Null`.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Field<U> {
        match self {
            Field::Undefined => Field::Undefined,
            Field::Null => Field::Null,
            Field::Value(v) => Field::Value(f(v)),
        }
    }
}

impl<T> From<Option<T>> for Field<T> {
    /// `Some` becomes `Value`, `None` becomes `Null` (an explicit clear).
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => Field::Value(v),
            None => Field::Null,
        }
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // Undefined is normally skipped at the struct level; if it is
            // serialized anyway, null is the only faithful rendering.
            Field::Undefined | Field::Null => serializer.serialize_none(),
            Field::Value(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Field::Value(v),
            None => Field::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Probe {
        #[serde(default, skip_serializing_if = "Field::is_undefined")]
        title: Field<String>,
        #[serde(default, skip_serializing_if = "Field::is_undefined")]
        year: Field<u32>,
    }

    #[test]
    fn absent_null_and_present_are_distinct() {
        let p: Probe = serde_json::from_str(r#"{"year": null}"#).unwrap();
        assert_eq!(p.title, Field::Undefined);
        assert_eq!(p.year, Field::Null);

        let p: Probe = serde_json::from_str(r#"{"title": "x", "year": 1999}"#).unwrap();
        assert_eq!(p.title, Field::Value("x".to_string()));
        assert_eq!(p.year, Field::Value(1999));
    }

    #[test]
    fn undefined_is_omitted_on_serialize() {
        let p = Probe {
            title: Field::Null,
            year: Field::Undefined,
        };
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"title":null}"#);
    }

    #[test]
    fn merge_follows_last_non_absent_occurrence() {
        let mut slot = Some("a".to_string());
        Field::<String>::Undefined.merge_into(&mut slot);
        assert_eq!(slot.as_deref(), Some("a"));

        Field::Value("b".to_string()).merge_into(&mut slot);
        assert_eq!(slot.as_deref(), Some("b"));

        Field::<String>::Null.merge_into(&mut slot);
        assert_eq!(slot, None);

        Field::<String>::Undefined.merge_into(&mut slot);
        assert_eq!(slot, None);
    }
}
