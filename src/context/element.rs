//! Context Elements
//!
//! Typed bundles of named values pushed onto the context stack by states
//! and step outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextElementKind {
    /// Workflow variables
    Standard,
    /// Free-form named parameters
    Param,
    Phase,
    Service,
    InfraMapping,
    ContainerService,
    PcfInstance,
    Instance,
    Artifact,
}

impl ContextElementKind {
    /// Prefix used for keys of non-standard elements, e.g. `service.name`.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Standard => "workflow",
            Self::Param => "param",
            Self::Phase => "phase",
            Self::Service => "service",
            Self::InfraMapping => "infra",
            Self::ContainerService => "container",
            Self::PcfInstance => "pcf",
            Self::Instance => "instance",
            Self::Artifact => "artifact",
        }
    }

    /// Whether keys are exposed without a prefix.
    pub fn exposes_bare_keys(self) -> bool {
        matches!(self, Self::Standard | Self::Param)
    }
}

fn new_element_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContextElement {
    #[serde(default = "new_element_id")]
    pub id: String,
    pub kind: ContextElementKind,
    pub name: String,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl ContextElement {
    pub fn new(kind: ContextElementKind, name: impl Into<String>) -> Self {
        Self {
            id: new_element_id(),
            kind,
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    /// A single named parameter, e.g. `env = staging`.
    pub fn variable(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        Self::new(ContextElementKind::Param, name.clone()).with_value(name, value)
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Copy of this element with a fresh id, used when a declared element
    /// is pushed by a new instance.
    pub fn instantiate(&self) -> Self {
        let mut element = self.clone();
        element.id = new_element_id();
        element
    }

    /// Bindings this element contributes to expression evaluation.
    ///
    /// Standard and param elements expose their keys directly. Other kinds
    /// expose `prefix.key` plus `prefix.name`.
    pub fn param_map(&self) -> BTreeMap<String, Value> {
        let mut params = BTreeMap::new();
        if self.kind.exposes_bare_keys() {
            for (key, value) in &self.data {
                params.insert(key.clone(), value.clone());
            }
            return params;
        }

        let prefix = self.kind.prefix();
        params.insert(format!("{}.name", prefix), Value::String(self.name.clone()));
        for (key, value) in &self.data {
            params.insert(format!("{}.{}", prefix, key), value.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_elements_expose_bare_keys() {
        let element = ContextElement::new(ContextElementKind::Standard, "workflow")
            .with_value("env", "prod")
            .with_value("replicas", 3);
        let params = element.param_map();
        assert_eq!(params["env"], Value::from("prod"));
        assert_eq!(params["replicas"], Value::from(3));
        assert!(!params.contains_key("workflow.env"));
    }

    #[test]
    fn test_typed_elements_are_prefixed() {
        let element = ContextElement::new(ContextElementKind::Service, "web").with_value("port", 8080);
        let params = element.param_map();
        assert_eq!(params["service.name"], Value::from("web"));
        assert_eq!(params["service.port"], Value::from(8080));
        assert!(!params.contains_key("port"));
    }

    #[test]
    fn test_instantiate_assigns_new_id() {
        let element = ContextElement::variable("env", "staging");
        let copy = element.instantiate();
        assert_ne!(element.id, copy.id);
        assert_eq!(copy.param_map()["env"], Value::from("staging"));
    }

    #[test]
    fn test_element_yaml_without_id() {
        let yaml = "kind: INFRA_MAPPING\nname: east\ndata:\n  namespace: web-east\n";
        let element: ContextElement = serde_yaml::from_str(yaml).unwrap();
        assert!(!element.id.is_empty());
        assert_eq!(element.param_map()["infra.namespace"], Value::from("web-east"));
    }
}
