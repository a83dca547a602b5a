//! State projection helpers
//!
//! A projection is the caller-visible attribute map built from a remote
//! object. Absent optional values are left out rather than written as null.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

pub type CallerState = BTreeMap<String, Value>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Projection {
    state: CallerState,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.state.insert(key.to_string(), value.into());
        self
    }

    pub fn set_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    /// Set `key` unless `value` is the empty string
    pub fn set_non_empty(self, key: &str, value: &str) -> Self {
        if value.is_empty() {
            self
        } else {
            self.set(key, value)
        }
    }

    /// Nest another projection as an object, skipped when `None`
    pub fn nest(self, key: &str, inner: Option<Projection>) -> Self {
        match inner {
            Some(p) => {
                let object: Map<String, Value> = p.state.into_iter().collect();
                self.set(key, Value::Object(object))
            }
            None => self,
        }
    }

    /// Nest a list of projections as an array of objects
    pub fn nest_list(self, key: &str, items: impl IntoIterator<Item = Projection>) -> Self {
        let list: Vec<Value> = items
            .into_iter()
            .map(|p| Value::Object(p.state.into_iter().collect()))
            .collect();
        self.set(key, Value::Array(list))
    }

    pub fn build(self) -> CallerState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_values_are_omitted() {
        let state = Projection::new()
            .set("name", "desk")
            .set_opt::<u32>("max_guests", None)
            .set_non_empty("seed", "")
            .nest("backup", None)
            .build();

        assert_eq!(state.len(), 1);
        assert_eq!(state["name"], json!("desk"));
    }

    #[test]
    fn test_nesting() {
        let backup = Projection::new()
            .set("enabled", true)
            .set("frequency", "daily");
        let state = Projection::new()
            .nest("backup", Some(backup))
            .nest_list("interfaces", vec![Projection::new().set("vlan", 10u32)])
            .set("density", vec![1u32, 4])
            .build();

        assert_eq!(state["backup"], json!({"enabled": true, "frequency": "daily"}));
        assert_eq!(state["interfaces"], json!([{"vlan": 10}]));
        assert_eq!(state["density"], json!([1, 4]));
    }
}
