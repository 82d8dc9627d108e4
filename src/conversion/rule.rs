//! Conversion rule trait and rule parameters
//!
//! A conversion rule is one edge of the representation graph. Rules are
//! registered once and cloned into every converter, so parameter values
//! are local to a segmentation.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegError};
use crate::representation::{Representation, RepresentationRef};

/// One named rule parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionParameter {
    pub name: String,
    pub value: String,
    pub description: String,
}

/// Ordered parameter list of a rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionParameters(Vec<ConversionParameter>);

impl ConversionParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter with its default value
    pub fn declare(mut self, name: &str, default: &str, description: &str) -> Self {
        self.0.push(ConversionParameter {
            name: name.to_string(),
            value: default.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|p| p.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn description(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.description.as_str())
    }

    /// Set the value of a declared parameter
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match self.0.iter_mut().find(|p| p.name == name) {
            Some(parameter) => {
                parameter.value = value.to_string();
                Ok(())
            }
            None => Err(SegError::UnknownParameter {
                name: name.to_string(),
            }),
        }
    }

    /// Add a parameter, or overwrite the value of an existing one
    pub fn insert(&mut self, parameter: ConversionParameter) {
        match self.0.iter_mut().find(|p| p.name == parameter.name) {
            Some(existing) => existing.value = parameter.value,
            None => self.0.push(parameter),
        }
    }

    /// Parse a numeric parameter
    pub fn get_f64(&self, name: &str) -> Result<f64> {
        let raw = self.get(name).ok_or_else(|| SegError::UnknownParameter {
            name: name.to_string(),
        })?;
        raw.trim().parse::<f64>().map_err(|e| SegError::Parse {
            what: "conversion parameter",
            reason: format!("'{}' = '{}': {}", name, raw, e),
        })
    }

    /// Parse a flag parameter ("1"/"0", "true"/"false")
    pub fn get_bool(&self, name: &str) -> Result<bool> {
        let raw = self.get(name).ok_or_else(|| SegError::UnknownParameter {
            name: name.to_string(),
        })?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" | "" => Ok(false),
            other => Err(SegError::Parse {
                what: "conversion parameter",
                reason: format!("'{}' = '{}' is not a flag", name, other),
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversionParameter> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An edge of the conversion graph
///
/// Rules convert a single segment's payload. Anything a rule needs to know
/// about the other segments (for example a shared output geometry) is
/// settled in [`ConversionRule::pre_convert`] before the per-segment loop.
pub trait ConversionRule: Send + Sync {
    /// Representation this rule reads
    fn source_representation_name(&self) -> &'static str;

    /// Representation this rule produces
    fn target_representation_name(&self) -> &'static str;

    /// Relative cost used by the cheapest-path search
    fn conversion_cost(&self) -> u32;

    /// Human-readable rule name
    fn name(&self) -> String {
        format!(
            "{} to {}",
            self.source_representation_name(),
            self.target_representation_name()
        )
    }

    fn parameters(&self) -> &ConversionParameters;

    fn parameters_mut(&mut self) -> &mut ConversionParameters;

    /// Prepare for converting a batch of segments
    ///
    /// `sources` holds the source payload of every segment about to be
    /// converted.
    fn pre_convert(&mut self, _sources: &[RepresentationRef<'_>]) -> Result<()> {
        Ok(())
    }

    /// Convert one segment's source payload into the target representation
    fn convert(&self, source: RepresentationRef<'_>) -> Result<Representation>;

    /// Clone the rule into a boxed trait object
    fn box_clone(&self) -> Box<dyn ConversionRule>;
}

impl Clone for Box<dyn ConversionRule> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

impl std::fmt::Debug for dyn ConversionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionRule")
            .field("name", &self.name())
            .field("cost", &self.conversion_cost())
            .finish()
    }
}

/// Implement the bookkeeping methods shared by every built-in rule
#[macro_export]
macro_rules! impl_rule_common {
    ($source:expr, $target:expr, $cost:expr) => {
        fn source_representation_name(&self) -> &'static str {
            $source
        }

        fn target_representation_name(&self) -> &'static str {
            $target
        }

        fn conversion_cost(&self) -> u32 {
            $cost
        }

        fn parameters(&self) -> &$crate::conversion::ConversionParameters {
            &self.parameters
        }

        fn parameters_mut(&mut self) -> &mut $crate::conversion::ConversionParameters {
            &mut self.parameters
        }

        fn box_clone(&self) -> Box<dyn $crate::conversion::ConversionRule> {
            Box::new(self.clone())
        }
    };
}
