//! Service configuration
//!
//! `ConfigTree` wraps the free-form configuration of a service with dotted
//! path getters. `ServiceConfig` adds the object bindings declared for it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ServiceError, ServiceResult};

// ─────────────────────────────────────────────────────────────────────────────
// Config Tree
// ─────────────────────────────────────────────────────────────────────────────

/// Free-form configuration tree
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTree(Value);

impl Default for ConfigTree {
    fn default() -> Self {
        Self(Value::Object(Default::default()))
    }
}

impl From<Value> for ConfigTree {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::default(),
            other => Self(other),
        }
    }
}

impl ConfigTree {
    pub fn new(value: Value) -> Self {
        Self::from(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Look up a dotted path such as `"display.color"`. The empty path is
    /// the root. Array elements are addressed by index.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(&self.0);
        }

        path.split('.').try_fold(&self.0, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn required_str(&self, path: &str) -> ServiceResult<&str> {
        match self.get(path) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(ServiceError::Configuration(format!(
                "'{path}' must be a string, found {other}"
            ))),
            None => Err(ServiceError::Configuration(format!("missing '{path}'"))),
        }
    }

    /// Typed lookup. `Ok(None)` when absent, an error when malformed.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> ServiceResult<Option<T>> {
        self.get(path)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    ServiceError::Configuration(format!("invalid '{path}': {e}"))
                })
            })
            .transpose()
    }

    pub fn required<T: DeserializeOwned>(&self, path: &str) -> ServiceResult<T> {
        self.get_as(path)?
            .ok_or_else(|| ServiceError::Configuration(format!("missing '{path}'")))
    }

    pub fn get_or<T: DeserializeOwned>(&self, path: &str, default: T) -> ServiceResult<T> {
        Ok(self.get_as(path)?.unwrap_or(default))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Object bindings
// ─────────────────────────────────────────────────────────────────────────────

/// How a service uses an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    In,
    InOut,
    Out,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::In => write!(f, "in"),
            Access::InOut => write!(f, "inout"),
            Access::Out => write!(f, "out"),
        }
    }
}

/// One object binding of a service
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectServiceConfig {
    /// Key under which the service sees the object. `name#N` denotes the
    /// N-th member of group `name`.
    pub key: String,
    /// Uid of the object in the application
    pub uid: String,
    pub access: Access,
    pub auto_connect: bool,
    pub optional: bool,
}

impl ObjectServiceConfig {
    pub fn new(key: impl Into<String>, uid: impl Into<String>, access: Access) -> Self {
        Self {
            key: key.into(),
            uid: uid.into(),
            access,
            auto_connect: false,
            optional: false,
        }
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Group name of the key (`"images"` for `"images#2"`)
    pub fn group(&self) -> &str {
        group_of(&self.key)
    }
}

pub(crate) fn group_of(key: &str) -> &str {
    match key.rsplit_once('#') {
        Some((group, index)) if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) => {
            group
        }
        _ => key,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Config
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a service receives before `configure()`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceConfig {
    pub tree: ConfigTree,
    pub objects: Vec<ObjectServiceConfig>,
    /// Auto-connect every bound object
    pub auto_connect: bool,
}

impl ServiceConfig {
    pub fn new(tree: impl Into<ConfigTree>) -> Self {
        Self {
            tree: tree.into(),
            ..Default::default()
        }
    }

    pub fn with_object(mut self, object: ObjectServiceConfig) -> Self {
        self.objects.push(object);
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn object(&self, key: &str) -> Option<&ObjectServiceConfig> {
        self.objects.iter().find(|o| o.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dotted_paths() {
        let tree = ConfigTree::new(json!({
            "display": { "color": "red", "sizes": [1, 2, 3] },
            "period": 250
        }));

        assert_eq!(tree.str("display.color"), Some("red"));
        assert_eq!(tree.get("display.sizes.1"), Some(&json!(2)));
        assert_eq!(tree.required::<u64>("period").unwrap(), 250);
        assert_eq!(tree.get_or::<u64>("missing", 7).unwrap(), 7);
        assert!(tree.required_str("period").is_err());
        assert!(matches!(
            tree.required::<String>("display.font"),
            Err(ServiceError::Configuration(_))
        ));
    }

    #[test]
    fn test_null_tree_is_empty_table() {
        let tree = ConfigTree::from(Value::Null);
        assert_eq!(tree.value(), &json!({}));
    }

    #[test]
    fn test_group_keys() {
        assert_eq!(group_of("images#2"), "images");
        assert_eq!(group_of("images"), "images");
        assert_eq!(group_of("a#b"), "a#b");
    }
}
