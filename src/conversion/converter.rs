//! Conversion graph and path search
//!
//! The converter owns segmentation-local clones of the registered rules and
//! an adjacency map from source representation name to the rules leaving
//! it. Path search enumerates every simple path between two
//! representations; the cheapest one is picked by total cost, then by rule
//! count.

use std::collections::{BTreeMap, BTreeSet};

use glam::DMat4;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::rule::{ConversionParameter, ConversionParameters, ConversionRule};
use super::rules::REFERENCE_IMAGE_GEOMETRY;
use crate::error::{Result, SegError};
use crate::image::ImageGeometry;

/// Ordered chain of rules, as indices into one [`Converter`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionPath {
    rules: Vec<usize>,
    cost: u32,
}

impl ConversionPath {
    pub fn rule_indices(&self) -> &[usize] {
        &self.rules
    }

    /// Sum of the rule costs
    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Segmentation-local conversion graph
#[derive(Clone, Default)]
pub struct Converter {
    rules: Vec<Box<dyn ConversionRule>>,
    graph: BTreeMap<String, Vec<usize>>,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("rules", &self.rules.iter().map(|r| r.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Converter {
    /// Create a converter with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a converter holding clones of the given rules
    pub fn with_rules(rules: Vec<Box<dyn ConversionRule>>) -> Self {
        let mut converter = Self {
            rules,
            graph: BTreeMap::new(),
        };
        converter.rebuild_graph();
        converter
    }

    /// Create a converter from the process-wide rule registry
    pub fn from_registry() -> Self {
        super::registry::create_converter()
    }

    /// Rebuild the adjacency map after the rule set changed
    pub fn rebuild_graph(&mut self) {
        self.graph.clear();
        for (index, rule) in self.rules.iter().enumerate() {
            self.graph
                .entry(rule.source_representation_name().to_string())
                .or_default()
                .push(index);
        }
    }

    pub fn add_rule(&mut self, rule: Box<dyn ConversionRule>) {
        debug!(rule = %rule.name(), cost = rule.conversion_cost(), "Adding conversion rule");
        self.rules.push(rule);
        self.rebuild_graph();
    }

    /// Remove every rule with the given name, returning how many were removed
    pub fn remove_rules_by_name(&mut self, name: &str) -> usize {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name() != name);
        let removed = before - self.rules.len();
        if removed > 0 {
            self.rebuild_graph();
        }
        removed
    }

    pub fn rules(&self) -> &[Box<dyn ConversionRule>] {
        &self.rules
    }

    pub fn rule(&self, index: usize) -> Option<&dyn ConversionRule> {
        self.rules.get(index).map(|rule| rule.as_ref())
    }

    pub(crate) fn rule_mut(&mut self, index: usize) -> Option<&mut Box<dyn ConversionRule>> {
        self.rules.get_mut(index)
    }

    /// Every representation name that appears as a rule source or target
    pub fn representation_names(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .flat_map(|rule| {
                [
                    rule.source_representation_name().to_string(),
                    rule.target_representation_name().to_string(),
                ]
            })
            .collect()
    }

    // ===== Path search =====

    /// Find every simple path from `source` to `target`
    ///
    /// A source without outgoing rules is a dead end and yields no path.
    pub fn find_paths(&self, source: &str, target: &str) -> Result<Vec<ConversionPath>> {
        if source == target {
            return Err(SegError::SameRepresentation {
                representation: source.to_string(),
            });
        }
        let mut visited = BTreeSet::new();
        visited.insert(source.to_string());
        Ok(self.find_paths_from(source, target, &visited))
    }

    fn find_paths_from(
        &self,
        source: &str,
        target: &str,
        visited: &BTreeSet<String>,
    ) -> Vec<ConversionPath> {
        let mut paths = Vec::new();
        let Some(leaving) = self.graph.get(source) else {
            return paths;
        };

        for &index in leaving {
            let rule = &self.rules[index];
            let cost = rule.conversion_cost();
            let next = rule.target_representation_name();

            if next == target {
                paths.push(ConversionPath {
                    rules: vec![index],
                    cost,
                });
                continue;
            }
            if visited.contains(next) {
                continue;
            }

            let mut branch_visited = visited.clone();
            branch_visited.insert(next.to_string());
            for suffix in self.find_paths_from(next, target, &branch_visited) {
                let mut rules = Vec::with_capacity(suffix.rules.len() + 1);
                rules.push(index);
                rules.extend_from_slice(&suffix.rules);
                paths.push(ConversionPath {
                    rules,
                    cost: cost + suffix.cost,
                });
            }
        }
        paths
    }

    /// Pick the cheapest path: lowest cost, then fewest rules, then first seen
    pub fn cheapest_path(paths: &[ConversionPath]) -> Option<ConversionPath> {
        let mut best: Option<&ConversionPath> = None;
        for path in paths {
            let better = match best {
                None => true,
                Some(current) => {
                    (path.cost, path.rules.len()) < (current.cost, current.rules.len())
                }
            };
            if better {
                best = Some(path);
            }
        }
        best.cloned()
    }

    /// Cheapest path from `source` to `target`, `None` when unreachable
    pub fn cheapest_path_between(&self, source: &str, target: &str) -> Result<Option<ConversionPath>> {
        let paths = self.find_paths(source, target)?;
        Ok(Self::cheapest_path(&paths))
    }

    /// Rule names along a path, for logs and the CLI
    pub fn describe_path(&self, path: &ConversionPath) -> Vec<String> {
        path.rules
            .iter()
            .filter_map(|&index| self.rules.get(index).map(|rule| rule.name()))
            .collect()
    }

    // ===== Parameters =====

    /// Current value of a parameter (first rule declaring it wins)
    pub fn conversion_parameter(&self, name: &str) -> Option<String> {
        self.rules
            .iter()
            .find_map(|rule| rule.parameters().get(name).map(str::to_string))
    }

    /// Set a parameter on every rule that declares it
    pub fn set_conversion_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        let mut found = false;
        for rule in &mut self.rules {
            if rule.parameters().contains(name) {
                rule.parameters_mut().set(name, value)?;
                found = true;
            }
        }
        if found {
            debug!(parameter = name, value, "Set conversion parameter");
            Ok(())
        } else {
            Err(SegError::UnknownParameter {
                name: name.to_string(),
            })
        }
    }

    /// All distinct parameters, in rule order
    pub fn all_conversion_parameters(&self) -> ConversionParameters {
        let mut all = ConversionParameters::new();
        for rule in &self.rules {
            for parameter in rule.parameters().iter() {
                if !all.contains(&parameter.name) {
                    all.insert(parameter.clone());
                }
            }
        }
        all
    }

    /// Distinct parameters of the rules along a path
    pub fn conversion_parameters_for_path(&self, path: &ConversionPath) -> ConversionParameters {
        let mut parameters = ConversionParameters::new();
        for &index in &path.rules {
            let Some(rule) = self.rules.get(index) else {
                continue;
            };
            for parameter in rule.parameters().iter() {
                if !parameters.contains(&parameter.name) {
                    parameters.insert(parameter.clone());
                }
            }
        }
        parameters
    }

    /// Serialize as `name|value|description&` triples
    pub fn serialize_all_conversion_parameters(&self) -> String {
        self.all_conversion_parameters()
            .iter()
            .map(|p| format!("{}|{}|{}&", p.name, p.value, p.description))
            .collect()
    }

    /// Apply a string written by [`Converter::serialize_all_conversion_parameters`]
    ///
    /// Parameters no rule declares are skipped with a warning.
    pub fn deserialize_conversion_parameters(&mut self, text: &str) -> Result<()> {
        for entry in text.split('&').map(str::trim).filter(|e| !e.is_empty()) {
            let mut fields = entry.splitn(3, '|');
            let (Some(name), Some(value)) = (fields.next(), fields.next()) else {
                return Err(SegError::Parse {
                    what: "conversion parameters",
                    reason: format!("entry '{}' has no value", entry),
                });
            };
            match self.set_conversion_parameter(name, value) {
                Ok(()) => {}
                Err(SegError::UnknownParameter { name }) => {
                    warn!(parameter = %name, "Skipping unknown conversion parameter");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Parse parameter triples without applying them
    pub fn parse_conversion_parameters(text: &str) -> Result<Vec<ConversionParameter>> {
        let mut parsed = Vec::new();
        for entry in text.split('&').map(str::trim).filter(|e| !e.is_empty()) {
            let fields: Vec<&str> = entry.splitn(3, '|').collect();
            if fields.len() < 2 {
                return Err(SegError::Parse {
                    what: "conversion parameters",
                    reason: format!("entry '{}' has no value", entry),
                });
            }
            parsed.push(ConversionParameter {
                name: fields[0].to_string(),
                value: fields[1].to_string(),
                description: fields.get(2).map(|d| d.to_string()).unwrap_or_default(),
            });
        }
        Ok(parsed)
    }

    /// Make the reference geometry parameter follow a world transform
    pub fn apply_transform_on_reference_image_geometry(&mut self, transform: &DMat4) -> Result<()> {
        let Some(current) = self.conversion_parameter(REFERENCE_IMAGE_GEOMETRY) else {
            return Ok(());
        };
        if current.trim().is_empty() {
            return Ok(());
        }
        let mut geometry = ImageGeometry::deserialize(&current)?;
        geometry.image_to_world = *transform * geometry.image_to_world;
        self.set_conversion_parameter(REFERENCE_IMAGE_GEOMETRY, &geometry.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::representation::{Representation, RepresentationRef};
    use pretty_assertions::assert_eq;

    #[derive(Clone)]
    struct TestRule {
        source: &'static str,
        target: &'static str,
        cost: u32,
        parameters: ConversionParameters,
    }

    impl TestRule {
        fn boxed(source: &'static str, target: &'static str, cost: u32) -> Box<dyn ConversionRule> {
            Box::new(Self {
                source,
                target,
                cost,
                parameters: ConversionParameters::new().declare("Shared", "1", "shared"),
            })
        }
    }

    impl ConversionRule for TestRule {
        fn source_representation_name(&self) -> &'static str {
            self.source
        }

        fn target_representation_name(&self) -> &'static str {
            self.target
        }

        fn conversion_cost(&self) -> u32 {
            self.cost
        }

        fn parameters(&self) -> &ConversionParameters {
            &self.parameters
        }

        fn parameters_mut(&mut self) -> &mut ConversionParameters {
            &mut self.parameters
        }

        fn convert(&self, source: RepresentationRef<'_>) -> Result<Representation> {
            Ok(source.to_representation())
        }

        fn box_clone(&self) -> Box<dyn ConversionRule> {
            Box::new(self.clone())
        }
    }

    fn diamond() -> Converter {
        // A -> B -> D, A -> C -> D, A -> D, D -> A
        Converter::with_rules(vec![
            TestRule::boxed("A", "B", 10),
            TestRule::boxed("B", "D", 10),
            TestRule::boxed("A", "C", 5),
            TestRule::boxed("C", "D", 5),
            TestRule::boxed("A", "D", 30),
            TestRule::boxed("D", "A", 1),
        ])
    }

    #[test]
    fn test_find_all_simple_paths() {
        let converter = diamond();
        let paths = converter.find_paths("A", "D").unwrap();
        let mut costs: Vec<u32> = paths.iter().map(|p| p.cost()).collect();
        costs.sort();
        assert_eq!(costs, vec![10, 20, 30]);
    }

    #[test]
    fn test_cheapest_path_is_minimal() {
        let converter = diamond();
        let paths = converter.find_paths("A", "D").unwrap();
        let cheapest = Converter::cheapest_path(&paths).unwrap();
        assert!(paths.iter().all(|p| cheapest.cost() <= p.cost()));
        assert_eq!(converter.describe_path(&cheapest), vec!["A to C", "C to D"]);
    }

    #[test]
    fn test_fewer_rules_breaks_cost_tie() {
        let converter = Converter::with_rules(vec![
            TestRule::boxed("A", "B", 5),
            TestRule::boxed("B", "C", 5),
            TestRule::boxed("A", "C", 10),
        ]);
        let cheapest = converter.cheapest_path_between("A", "C").unwrap().unwrap();
        assert_eq!(cheapest.len(), 1);
    }

    #[test]
    fn test_same_source_and_target_is_error() {
        let err = diamond().find_paths("A", "A").unwrap_err();
        assert_eq!(err.error_code(), "SAME_REPRESENTATION");
    }

    #[test]
    fn test_dead_end_yields_no_paths() {
        let converter = diamond();
        assert!(converter.find_paths("B", "C").unwrap().is_empty());
        assert!(converter.find_paths("Z", "A").unwrap().is_empty());
        assert!(converter.cheapest_path_between("Z", "A").unwrap().is_none());
    }

    #[test]
    fn test_cycles_terminate() {
        let converter = diamond();
        // D -> A -> ... -> B must not loop back through D
        let paths = converter.find_paths("D", "B").unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].cost(), 11);
    }

    #[test]
    fn test_remove_rules_rebuilds_graph() {
        let mut converter = diamond();
        assert_eq!(converter.remove_rules_by_name("A to D"), 1);
        assert_eq!(converter.find_paths("A", "D").unwrap().len(), 2);
    }

    #[test]
    fn test_parameter_round_trip() {
        let mut converter = diamond();
        converter.set_conversion_parameter("Shared", "7").unwrap();
        assert!(converter
            .rules()
            .iter()
            .all(|r| r.parameters().get("Shared") == Some("7")));

        let text = converter.serialize_all_conversion_parameters();
        assert_eq!(text, "Shared|7|shared&");

        let mut other = diamond();
        other
            .deserialize_conversion_parameters("Shared|3|shared&Unknown|1|x&")
            .unwrap();
        assert_eq!(other.conversion_parameter("Shared").as_deref(), Some("3"));
        assert!(other.deserialize_conversion_parameters("broken&").is_err());
    }

    #[test]
    fn test_unknown_parameter() {
        let mut converter = diamond();
        assert!(matches!(
            converter.set_conversion_parameter("Nope", "1"),
            Err(SegError::UnknownParameter { .. })
        ));
    }
}
