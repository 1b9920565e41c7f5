//! Application configuration
//!
//! An application is described by a TOML document:
//!
//! ```toml
//! id = "viewer"
//! start = ["reader", "printer"]
//! update = ["reader"]
//!
//! [parameters]
//! path = "/tmp/image.raw"
//!
//! [[object]]
//! uid = "image"
//! type = "Matrix4"
//! deferred = true
//!
//! [[service]]
//! uid = "reader"
//! type = "io::Reader"
//! worker = "io"
//! out = [{ key = "image", uid = "image" }]
//! config = { path = "${path}" }
//!
//! [[connect]]
//! channel = "refresh"
//! signals = ["reader/updated"]
//! slots = ["printer/update"]
//! ```
//!
//! `${name}` placeholders in string values are replaced by the caller's
//! parameters, then by the `[parameters]` defaults.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    Access, ConfigTree, ObjectServiceConfig, ProxyConnections, ServiceConfig, ServiceError,
    ServiceResult,
};

/// Caller supplied parameter values
pub type Parameters = HashMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, toml::Value>,
    #[serde(default, rename = "object")]
    pub objects: Vec<ObjectDecl>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDecl>,
    #[serde(default, rename = "connect")]
    pub connections: Vec<ConnectDecl>,
    /// Services started, in order, by `start()`
    #[serde(default)]
    pub start: Vec<String>,
    /// Services updated, in order, by `update()`
    #[serde(default)]
    pub update: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectDecl {
    pub uid: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Initial value, deserialized by the data type
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Produced later by a service output rather than created up front
    #[serde(default)]
    pub deferred: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDecl {
    pub uid: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Worker name; the default worker when absent
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default, rename = "in")]
    pub inputs: Vec<ObjectRefDecl>,
    #[serde(default)]
    pub inout: Vec<ObjectRefDecl>,
    #[serde(default, rename = "out")]
    pub outputs: Vec<ObjectRefDecl>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectRefDecl {
    /// Key seen by the service, the uid when absent
    #[serde(default)]
    pub key: Option<String>,
    pub uid: String,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default)]
    pub optional: bool,
}

impl ObjectRefDecl {
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectDecl {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub slots: Vec<String>,
}

impl ServiceDecl {
    /// Object references with their access, in declaration order
    pub fn object_refs(&self) -> impl Iterator<Item = (&ObjectRefDecl, Access)> {
        self.inputs
            .iter()
            .map(|r| (r, Access::In))
            .chain(self.inout.iter().map(|r| (r, Access::InOut)))
            .chain(self.outputs.iter().map(|r| (r, Access::Out)))
    }

    /// Configuration handed to the service before `configure()`
    pub fn service_config(&self) -> ServiceConfig {
        let tree = self
            .config
            .clone()
            .map(ConfigTree::from)
            .unwrap_or_default();

        self.object_refs().fold(
            ServiceConfig::new(tree).with_auto_connect(self.auto_connect),
            |config, (r, access)| {
                config.with_object(
                    ObjectServiceConfig::new(r.key(), &r.uid, access)
                        .auto_connect(r.auto_connect)
                        .optional(r.optional),
                )
            },
        )
    }
}

impl ConnectDecl {
    pub fn to_connections(&self, default_channel: impl Into<String>) -> ServiceResult<ProxyConnections> {
        let channel = self.channel.clone().unwrap_or_else(|| default_channel.into());
        ProxyConnections::from_strings(channel, self.signals.as_slice(), self.slots.as_slice())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Parse, substitute parameters and validate a document
    pub fn from_str(text: &str, params: &Parameters) -> ServiceResult<Self> {
        let mut document: toml::Value = toml::from_str(text)?;

        let defaults = match document.get("parameters") {
            None => BTreeMap::new(),
            Some(toml::Value::Table(table)) => table.clone().into_iter().collect(),
            Some(_) => {
                return Err(ServiceError::Configuration(
                    "[parameters] must be a table".into(),
                ));
            }
        };

        if let toml::Value::Table(table) = &mut document {
            for (key, value) in table.iter_mut() {
                if key != "parameters" {
                    substitute(value, params, &defaults)?;
                }
            }
        }

        let config: AppConfig = document.try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>, params: &Parameters) -> ServiceResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::Io(format!("cannot read '{}': {e}", path.display()))
        })?;
        let config = Self::from_str(&text, params)?;
        tracing::info!(app = %config.id, path = %path.display(), "Loaded application configuration");
        Ok(config)
    }

    pub fn object(&self, uid: &str) -> Option<&ObjectDecl> {
        self.objects.iter().find(|o| o.uid == uid)
    }

    pub fn service(&self, uid: &str) -> Option<&ServiceDecl> {
        self.services.iter().find(|s| s.uid == uid)
    }

    fn validate(&self) -> ServiceResult<()> {
        let invalid = |msg: String| Err(ServiceError::Configuration(format!("{}: {msg}", self.id)));

        let mut uids = HashSet::new();
        for uid in self.objects.iter().map(|o| &o.uid).chain(self.services.iter().map(|s| &s.uid)) {
            if uid.is_empty() {
                return invalid("empty uid".into());
            }
            if !uids.insert(uid.as_str()) {
                return invalid(format!("duplicate uid '{uid}'"));
            }
        }

        for service in &self.services {
            let mut keys = HashSet::new();
            for (r, access) in service.object_refs() {
                let Some(object) = self.object(&r.uid) else {
                    return invalid(format!(
                        "service '{}' refers to undeclared object '{}'",
                        service.uid, r.uid
                    ));
                };
                if access == Access::Out && !object.deferred {
                    return invalid(format!(
                        "output '{}' of service '{}' must be a deferred object",
                        r.uid, service.uid
                    ));
                }
                if !keys.insert(r.key()) {
                    return invalid(format!(
                        "service '{}' uses key '{}' twice",
                        service.uid,
                        r.key()
                    ));
                }
            }
        }

        for uid in self.start.iter().chain(&self.update) {
            if self.service(uid).is_none() {
                return invalid(format!("'{uid}' in start/update lists is not a declared service"));
            }
        }

        for connect in &self.connections {
            for endpoint in connect.signals.iter().chain(&connect.slots) {
                let (uid, _) = ProxyConnections::parse_endpoint(endpoint)?;
                if !uids.contains(uid.as_str()) {
                    return invalid(format!("connection endpoint '{endpoint}' names an undeclared uid"));
                }
            }
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameter substitution
// ─────────────────────────────────────────────────────────────────────────────

fn substitute(
    value: &mut toml::Value,
    params: &Parameters,
    defaults: &BTreeMap<String, toml::Value>,
) -> ServiceResult<()> {
    match value {
        toml::Value::String(text) => {
            if let Some(replacement) = expand(text, params, defaults)? {
                *value = replacement;
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                substitute(item, params, defaults)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute(item, params, defaults)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Expand the placeholders of one string. A string made of a single
/// placeholder takes the parameter's value and type.
fn expand(
    text: &str,
    params: &Parameters,
    defaults: &BTreeMap<String, toml::Value>,
) -> ServiceResult<Option<toml::Value>> {
    if !text.contains("${") {
        return Ok(None);
    }

    if let Some(name) = text.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        if !name.contains(['$', '{', '}']) {
            return resolve(name, params, defaults).map(Some);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        match resolve(&after[..end], params, defaults)? {
            toml::Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Some(toml::Value::String(out)))
}

/// Caller values win over defaults. A caller value is converted to the type
/// of the default when there is one.
fn resolve(
    name: &str,
    params: &Parameters,
    defaults: &BTreeMap<String, toml::Value>,
) -> ServiceResult<toml::Value> {
    let default = defaults.get(name);
    let Some(given) = params.get(name) else {
        return default.cloned().ok_or_else(|| {
            ServiceError::Configuration(format!("unresolved parameter '${{{name}}}'"))
        });
    };

    let mismatch = |kind: &str| {
        ServiceError::Configuration(format!("parameter '{name}' must be {kind}, got '{given}'"))
    };
    Ok(match default {
        Some(toml::Value::Integer(_)) => {
            toml::Value::Integer(given.parse().map_err(|_| mismatch("an integer"))?)
        }
        Some(toml::Value::Float(_)) => {
            toml::Value::Float(given.parse().map_err(|_| mismatch("a float"))?)
        }
        Some(toml::Value::Boolean(_)) => {
            toml::Value::Boolean(given.parse().map_err(|_| mismatch("a boolean"))?)
        }
        _ => toml::Value::String(given.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const DOCUMENT: &str = r#"
        id = "demo"
        start = ["producer", "printer"]
        update = ["producer"]

        [parameters]
        period = 100
        label = "matrix"

        [[object]]
        uid = "matrix"
        type = "Matrix4"

        [[object]]
        uid = "produced"
        type = "Integer"
        deferred = true

        [[service]]
        uid = "producer"
        type = "test::Producer"
        worker = "compute"
        inout = [{ key = "target", uid = "matrix", auto_connect = true }]
        out = [{ uid = "produced" }]
        config = { period = "${period}", name = "${label}-${period}" }

        [[service]]
        uid = "printer"
        type = "test::Printer"
        in = [{ key = "value", uid = "produced", optional = true }]

        [[connect]]
        signals = ["producer/updated"]
        slots = ["printer/update"]
    "#;

    #[test]
    fn test_parse_with_defaults() {
        let config = AppConfig::from_str(DOCUMENT, &Parameters::new()).unwrap();

        assert_eq!(config.id, "demo");
        assert_eq!(config.objects.len(), 2);
        assert!(config.object("produced").unwrap().deferred);

        let producer = config.service("producer").unwrap();
        assert_eq!(producer.worker.as_deref(), Some("compute"));
        assert_eq!(
            producer.config,
            Some(json!({ "period": 100, "name": "matrix-100" }))
        );

        let service_config = producer.service_config();
        let target = service_config.object("target").unwrap();
        assert_eq!(target.access, Access::InOut);
        assert!(target.auto_connect);
        assert_eq!(service_config.object("produced").unwrap().access, Access::Out);
        assert_eq!(service_config.tree.get_or::<u64>("period", 0).unwrap(), 100);

        let connections = config.connections[0].to_connections("Proxy_demo_0").unwrap();
        assert_eq!(connections.channel, "Proxy_demo_0");
        assert_eq!(connections.slots, vec![("printer".into(), "update".into())]);
    }

    #[test]
    fn test_caller_parameters_take_precedence() {
        let params = Parameters::from([
            ("period".to_string(), "250".to_string()),
            ("label".to_string(), "custom".to_string()),
        ]);
        let config = AppConfig::from_str(DOCUMENT, &params).unwrap();

        assert_eq!(
            config.service("producer").unwrap().config,
            Some(json!({ "period": 250, "name": "custom-250" }))
        );

        let params = Parameters::from([("period".to_string(), "fast".to_string())]);
        assert!(matches!(
            AppConfig::from_str(DOCUMENT, &params),
            Err(ServiceError::Configuration(_))
        ));
    }

    #[test]
    fn test_unresolved_parameter() {
        let document = r#"
            id = "demo"
            [[object]]
            uid = "${missing}"
            type = "Integer"
        "#;
        assert!(matches!(
            AppConfig::from_str(document, &Parameters::new()),
            Err(ServiceError::Configuration(msg)) if msg.contains("missing")
        ));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            // Duplicate uid
            r#"
                id = "bad"
                [[object]]
                uid = "a"
                type = "Integer"
                [[service]]
                uid = "a"
                type = "x"
            "#,
            // Unknown object
            r#"
                id = "bad"
                [[service]]
                uid = "s"
                type = "x"
                in = [{ uid = "ghost" }]
            "#,
            // Output on a non-deferred object
            r#"
                id = "bad"
                [[object]]
                uid = "o"
                type = "Integer"
                [[service]]
                uid = "s"
                type = "x"
                out = [{ uid = "o" }]
            "#,
            // Unknown service in start list
            r#"
                id = "bad"
                start = ["nobody"]
            "#,
            // Endpoint on an undeclared uid
            r#"
                id = "bad"
                [[connect]]
                signals = ["nobody/modified"]
            "#,
        ];

        for document in cases {
            assert!(
                matches!(
                    AppConfig::from_str(document, &Parameters::new()),
                    Err(ServiceError::Configuration(_))
                ),
                "accepted: {document}"
            );
        }
    }

    #[test]
    fn test_unknown_field_is_parse_error() {
        let document = r#"
            id = "bad"
            [[object]]
            uid = "o"
            type = "Integer"
            colour = "red"
        "#;
        assert!(matches!(
            AppConfig::from_str(document, &Parameters::new()),
            Err(ServiceError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DOCUMENT.as_bytes()).unwrap();

        let config = AppConfig::load(file.path(), &Parameters::new()).unwrap();
        assert_eq!(config.start, vec!["producer", "printer"]);

        assert!(matches!(
            AppConfig::load("/nonexistent/app.toml", &Parameters::new()),
            Err(ServiceError::Io(_))
        ));
    }
}
