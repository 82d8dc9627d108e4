//! Representation conversion
//!
//! - [`ConversionRule`]: one edge of the conversion graph
//! - [`Converter`]: segmentation-local graph with path search and parameters
//! - [`RuleRegistry`]: process-wide rule prototypes
//! - [`rules`]: the built-in labelmap and surface rules

pub mod converter;
pub mod registry;
pub mod rule;
pub mod rules;

pub use converter::{ConversionPath, Converter};
pub use registry::{create_converter, register_rule, registry, RuleRegistry};
pub use rule::{ConversionParameter, ConversionParameters, ConversionRule};
