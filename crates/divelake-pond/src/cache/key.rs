use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::predicate::{DateRange, FilterValues};

/// Deterministic identity of one cached request.
///
/// Arguments are kept in a name-ordered map and set-valued filters are sorted
/// and de-duplicated, so logically equal requests produce the same digest
/// regardless of the order in which arguments or values were given.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKey {
    method: String,
    args: BTreeMap<String, Value>,
}

impl CacheKey {
    /// Key for a call of `method` with no arguments yet.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add a scalar argument.
    pub fn arg(mut self, name: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.args.insert(name.to_string(), value);
        self
    }

    /// Add a set-valued filter; a missing or empty set encodes as null.
    pub fn values(mut self, name: &str, values: Option<&FilterValues>) -> Self {
        let value = match values {
            Some(values) if !values.is_empty() => Value::from(values.canonical()),
            _ => Value::Null,
        };
        self.args.insert(name.to_string(), value);
        self
    }

    /// Add an optional time window as a pair of RFC 3339 instants.
    pub fn date_range(self, name: &str, range: Option<&DateRange>) -> Self {
        let value = range.map(|r| [r.start.to_rfc3339(), r.end.to_rfc3339()]);
        self.arg(name, value)
    }

    /// Name of the cached method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Canonical text the digest is computed over.
    pub fn canonical(&self) -> String {
        let args = serde_json::to_string(&self.args).unwrap_or_default();
        format!("{}\n{args}", self.method)
    }

    /// Hex digest naming the cache entry.
    pub fn digest(&self) -> String {
        blake3::hash(self.canonical().as_bytes()).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_order_does_not_change_the_digest() {
        let ab = FilterValues::from(vec!["a", "b"]);
        let ba = FilterValues::from(vec!["b", "a"]);
        let k1 = CacheKey::new("get_data").values("labels", Some(&ab));
        let k2 = CacheKey::new("get_data").values("labels", Some(&ba));
        assert_eq!(k1.digest(), k2.digest());
    }

    #[test]
    fn argument_order_does_not_change_the_digest() {
        let k1 = CacheKey::new("get_data").arg("dataset", "ds").arg("limit", 10);
        let k2 = CacheKey::new("get_data").arg("limit", 10).arg("dataset", "ds");
        assert_eq!(k1.digest(), k2.digest());
    }

    #[test]
    fn method_and_values_are_part_of_the_identity() {
        let base = CacheKey::new("get_data").arg("dataset", "ds");
        assert_ne!(
            base.digest(),
            CacheKey::new("get_events").arg("dataset", "ds").digest()
        );
        assert_ne!(base.digest(), base.clone().arg("limit", 5).digest());
    }

    #[test]
    fn empty_and_missing_sets_are_equivalent() {
        let empty = FilterValues::default();
        let k1 = CacheKey::new("m").values("animals", None);
        let k2 = CacheKey::new("m").values("animals", Some(&empty));
        assert_eq!(k1.digest(), k2.digest());
    }
}
