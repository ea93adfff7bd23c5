//! Method-call arguments: typed lenses over the raw JSON argument map.
//!
//! Host frameworks send loosely typed maps (numbers may arrive as ints or
//! floats). These accessors read them without intermediate structs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

/// One call on the method channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl MethodCall {
    pub fn new(method: &str, args: Value) -> Self {
        Self {
            method: method.to_string(),
            args,
        }
    }
}

/// Extension trait for reading typed fields from an argument map.
pub trait ArgsExt {
    fn str_field(&self, key: &str) -> Option<&str>;
    fn i64_field(&self, key: &str) -> Option<i64>;
    fn f64_field(&self, key: &str) -> Option<f64>;
    fn bool_field(&self, key: &str) -> Option<bool>;
    fn i64_array(&self, key: &str) -> Option<Vec<i64>>;
    fn has(&self, key: &str) -> bool;

    fn require_str(&self, key: &str) -> Result<&str, PluginError> {
        self.str_field(key).ok_or_else(|| missing(key))
    }

    fn require_f64(&self, key: &str) -> Result<f64, PluginError> {
        self.f64_field(key).ok_or_else(|| missing(key))
    }

    fn require_bool(&self, key: &str) -> Result<bool, PluginError> {
        self.bool_field(key).ok_or_else(|| missing(key))
    }
}

impl ArgsExt for Value {
    fn str_field(&self, key: &str) -> Option<&str> {
        self[key].as_str()
    }

    fn i64_field(&self, key: &str) -> Option<i64> {
        let v = &self[key];
        v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
    }

    fn f64_field(&self, key: &str) -> Option<f64> {
        self[key].as_f64()
    }

    fn bool_field(&self, key: &str) -> Option<bool> {
        self[key].as_bool()
    }

    fn i64_array(&self, key: &str) -> Option<Vec<i64>> {
        self[key].as_array().map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
                .collect()
        })
    }

    fn has(&self, key: &str) -> bool {
        !self[key].is_null()
    }
}

fn missing(key: &str) -> PluginError {
    PluginError::InvalidArguments(format!("missing or invalid argument '{}'", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_accept_ints_and_floats() {
        let args = serde_json::json!({"location": 1500.0, "speed": 2, "clipRange": [0, -1.0]});
        assert_eq!(args.i64_field("location"), Some(1500));
        assert_eq!(args.f64_field("speed"), Some(2.0));
        assert_eq!(args.i64_array("clipRange"), Some(vec![0, -1]));
    }

    #[test]
    fn null_counts_as_absent() {
        let args = serde_json::json!({"clipRange": null, "uri": "a"});
        assert!(!args.has("clipRange"));
        assert!(args.has("uri"));
        assert!(args.require_bool("looping").is_err());
    }
}
