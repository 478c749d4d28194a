//! Context Stack
//!
//! Ordered stack of context elements. Lookups walk from the top down, so
//! an element pushed by an inner scope shadows bindings of outer scopes.

use std::collections::BTreeMap;

use serde_json::Value;

use super::element::{ContextElement, ContextElementKind};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default)]
pub struct ContextStack {
    /// (owner, element), bottom to top
    entries: Vec<(String, ContextElement)>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an element owned by the given branch or instance.
    pub fn push(&mut self, owner: impl Into<String>, element: ContextElement) {
        self.entries.push((owner.into(), element));
    }

    /// Removes every element pushed by `owner`, returning them top first.
    pub fn pop(&mut self, owner: &str) -> Vec<ContextElement> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for (entry_owner, element) in self.entries.drain(..) {
            if entry_owner == owner {
                removed.push(element);
            } else {
                kept.push((entry_owner, element));
            }
        }
        self.entries = kept;
        removed.reverse();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Elements from the top of the stack down.
    pub fn iter_top_down(&self) -> impl Iterator<Item = &ContextElement> {
        self.entries.iter().rev().map(|(_, element)| element)
    }

    /// Resolves a binding; the top-most element that binds `name` wins.
    pub fn resolve(&self, name: &str) -> Result<Value> {
        self.iter_top_down()
            .find_map(|element| element.param_map().remove(name))
            .ok_or_else(|| EngineError::Resolution(format!("'{}' is not bound in the context", name)))
    }

    /// Top-most element of the given kind.
    pub fn find(&self, kind: ContextElementKind) -> Option<&ContextElement> {
        self.iter_top_down().find(|element| element.kind == kind)
    }

    /// All bindings, with upper elements overriding lower ones.
    pub fn project(&self) -> BTreeMap<String, Value> {
        let mut params = BTreeMap::new();
        for (_, element) in &self.entries {
            params.extend(element.param_map());
        }
        params
    }

    /// Bindings contributed only by elements of one kind.
    pub fn project_kind(&self, kind: ContextElementKind) -> BTreeMap<String, Value> {
        let mut params = BTreeMap::new();
        for (_, element) in self.entries.iter().filter(|(_, e)| e.kind == kind) {
            params.extend(element.param_map());
        }
        params
    }
}
