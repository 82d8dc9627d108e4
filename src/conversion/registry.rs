//! Conversion rule registry
//!
//! Rules are registered once per process. Every new converter receives
//! clones of the registered rules, so parameter changes stay local to one
//! segmentation.

use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::converter::Converter;
use super::rule::ConversionRule;
use super::rules;

/// Set of rule prototypes
#[derive(Clone)]
pub struct RuleRegistry {
    rules: Vec<Box<dyn ConversionRule>>,
}

impl RuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Create a registry holding the built-in rules
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for rule in rules::default_rules() {
            registry.register(rule);
        }
        registry
    }

    /// Register a rule prototype
    ///
    /// A rule with the same name replaces the earlier registration.
    pub fn register(&mut self, rule: Box<dyn ConversionRule>) {
        let name = rule.name();
        self.rules.retain(|existing| existing.name() != name);
        debug!(rule = %name, "Registered conversion rule");
        self.rules.push(rule);
    }

    /// Remove a rule by name
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name() != name);
        before != self.rules.len()
    }

    pub fn rules(&self) -> &[Box<dyn ConversionRule>] {
        &self.rules
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.iter().any(|rule| rule.name() == name)
    }

    /// Build a converter from clones of every registered rule
    pub fn create_converter(&self) -> Converter {
        Converter::with_rules(self.rules.clone())
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn global() -> &'static RwLock<RuleRegistry> {
    static REGISTRY: OnceLock<RwLock<RuleRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(RuleRegistry::with_defaults()))
}

/// Read access to the process-wide registry
pub fn registry() -> RwLockReadGuard<'static, RuleRegistry> {
    global().read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write access to the process-wide registry
pub fn registry_mut() -> RwLockWriteGuard<'static, RuleRegistry> {
    global().write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Register a rule process-wide; later segmentations pick it up
pub fn register_rule(rule: Box<dyn ConversionRule>) {
    registry_mut().register(rule);
}

/// Converter holding clones of the process-wide rules
pub fn create_converter() -> Converter {
    registry().create_converter()
}
