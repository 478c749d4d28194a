//! Context Resolution
//!
//! An `ExecutionContext` is the view one state instance has of the
//! context stack. Element resolvers can contribute derived bindings for
//! an element (for example a namespace looked up from an infrastructure
//! mapping); those lookups run at most once per context build.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use once_cell::sync::OnceCell;
use serde_json::Value;

use super::element::ContextElement;
use super::expression;
use super::stack::ContextStack;
use crate::error::{EngineError, Result};

/// Supplies derived bindings for context elements.
pub trait ElementResolver: Send + Sync {
    /// Extra bindings for `element`, merged over its own `param_map`.
    fn resolve(&self, element: &ContextElement) -> Result<BTreeMap<String, Value>>;
}

/// Resolver that adds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolver;

impl ElementResolver for PassthroughResolver {
    fn resolve(&self, _element: &ContextElement) -> Result<BTreeMap<String, Value>> {
        Ok(BTreeMap::new())
    }
}

/// Context view built for a single state instance.
pub struct ExecutionContext {
    stack: ContextStack,
    resolver: Arc<dyn ElementResolver>,
    /// Cached bindings, aligned with `stack` from the top down
    lookups: Vec<OnceCell<BTreeMap<String, Value>>>,
}

impl ExecutionContext {
    pub fn new(stack: ContextStack, resolver: Arc<dyn ElementResolver>) -> Self {
        let lookups = (0..stack.len()).map(|_| OnceCell::new()).collect();
        Self {
            stack,
            resolver,
            lookups,
        }
    }

    pub fn stack(&self) -> &ContextStack {
        &self.stack
    }

    fn bindings(&self, index: usize, element: &ContextElement) -> Result<&BTreeMap<String, Value>> {
        self.lookups[index].get_or_try_init(|| {
            debug!("Resolving context element '{}' ({:?})", element.name, element.kind);
            let mut params = element.param_map();
            let derived = self.resolver.resolve(element).map_err(|e| match e {
                EngineError::Resolution(msg) => EngineError::Resolution(msg),
                other => EngineError::Resolution(format!(
                    "failed to resolve element '{}': {}",
                    element.name, other
                )),
            })?;
            params.extend(derived);
            Ok(params)
        })
    }

    /// Resolves one binding, searching from the top of the stack.
    pub fn resolve(&self, name: &str) -> Result<Value> {
        for (index, element) in self.stack.iter_top_down().enumerate() {
            if let Some(value) = self.bindings(index, element)?.get(name) {
                return Ok(value.clone());
            }
        }
        Err(EngineError::Resolution(format!(
            "'{}' is not bound in the context",
            name
        )))
    }

    /// All bindings visible to the instance, upper elements winning.
    pub fn project(&self) -> Result<BTreeMap<String, Value>> {
        let elements: Vec<_> = self.stack.iter_top_down().collect();
        let mut params = BTreeMap::new();
        for (index, element) in elements.iter().enumerate().rev() {
            params.extend(self.bindings(index, element)?.clone());
        }
        Ok(params)
    }

    pub fn render(&self, template: &str) -> Result<String> {
        expression::render(template, |name| self.resolve(name))
    }

    /// Renders every template in a map of inputs.
    pub fn render_all(&self, templates: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        templates
            .iter()
            .map(|(key, template)| Ok((key.clone(), self.render(template)?)))
            .collect()
    }
}
