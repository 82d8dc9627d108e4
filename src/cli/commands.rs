//! CLI Command Implementations
//!
//! Implements the actual logic for each CLI command.

use std::path::Path;

use anyhow::{bail, Context, Result};
use glam::DVec3;
use serde::Serialize;
use tracing::info;

use crate::conversion::rules::{REFERENCE_IMAGE_GEOMETRY, SMOOTHING_FACTOR};
use crate::conversion::{registry, ConversionParameter, Converter};
use crate::image::{deserialize_image_geometry, Extent, OrientedImage, ScalarType};
use crate::representation::{RepresentationRef, BINARY_LABELMAP, CLOSED_SURFACE};
use crate::segmentation::{Segment, Segmentation};

/// List registered conversion rules.
pub fn list_rules() -> Result<()> {
    let registry = registry();
    println!("{} registered conversion rules", registry.rules().len());
    for rule in registry.rules() {
        println!();
        println!("{} (cost {})", rule.name(), rule.conversion_cost());
        for parameter in rule.parameters().iter() {
            let value = if parameter.value.is_empty() {
                "<unset>"
            } else {
                parameter.value.as_str()
            };
            println!("  {} = {}", parameter.name, value);
            println!("      {}", parameter.description);
        }
    }
    Ok(())
}

/// Print every path between two representations and the cheapest one.
pub fn show_paths(from: &str, to: &str) -> Result<()> {
    info!("Searching conversion paths from '{}' to '{}'", from, to);

    let converter = Converter::from_registry();
    let paths = converter.find_paths(from, to)?;
    if paths.is_empty() {
        println!("No conversion path from '{}' to '{}'", from, to);
        return Ok(());
    }
    for (index, path) in paths.iter().enumerate() {
        println!(
            "[{}] cost {}: {}",
            index,
            path.cost(),
            converter.describe_path(path).join(" -> ")
        );
    }
    if let Some(cheapest) = Converter::cheapest_path(&paths) {
        println!();
        println!(
            "Cheapest: {} (cost {})",
            converter.describe_path(&cheapest).join(" -> "),
            cheapest.cost()
        );
    }
    Ok(())
}

/// Decode a geometry string.
pub fn show_geometry(text: &str) -> Result<()> {
    let geometry = deserialize_image_geometry(text).context("Invalid geometry string")?;
    let origin = geometry.origin();
    let spacing = geometry.spacing();
    println!("Origin: [{:.4}, {:.4}, {:.4}]", origin.x, origin.y, origin.z);
    println!("Spacing: [{:.4}, {:.4}, {:.4}]", spacing.x, spacing.y, spacing.z);
    println!("Directions:");
    let directions = geometry.directions();
    for row in 0..3 {
        let r = directions.row(row);
        println!("  [{:.4}, {:.4}, {:.4}]", r.x, r.y, r.z);
    }
    println!("Extent: {}", geometry.extent);
    println!("Voxels: {}", geometry.extent.voxel_count());
    Ok(())
}

/// Parse a parameter file and check it against the registered rules.
pub fn load_parameter_file(path: &Path) -> Result<Vec<ConversionParameter>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameter file {}", path.display()))?;
    let parameters = Converter::parse_conversion_parameters(&text)?;

    let mut converter = Converter::from_registry();
    for parameter in &parameters {
        if converter.conversion_parameter(&parameter.name).is_none() {
            bail!("No conversion rule declares parameter '{}'", parameter.name);
        }
        if parameter.name == REFERENCE_IMAGE_GEOMETRY && !parameter.value.trim().is_empty() {
            deserialize_image_geometry(&parameter.value)
                .with_context(|| format!("Invalid value for '{}'", parameter.name))?;
        }
        converter.set_conversion_parameter(&parameter.name, &parameter.value)?;
    }
    Ok(parameters)
}

/// Validate a parameter file and print its entries.
pub fn check_parameters(path: &Path) -> Result<()> {
    info!("Validating parameter file: {}", path.display());

    let parameters = load_parameter_file(path)?;
    for parameter in &parameters {
        println!("{} = {}", parameter.name, parameter.value);
    }
    println!("{} parameters OK", parameters.len());
    Ok(())
}

/// Result of the demo conversion
#[derive(Debug, Clone, Serialize)]
pub struct DemoSummary {
    pub segment_id: String,
    pub labelmap_extent: Extent,
    pub labelmap_voxels: usize,
    pub conversion_path: Vec<String>,
    pub path_cost: u32,
    pub surface_points: usize,
    pub surface_polygons: usize,
    pub surface_area: f64,
    pub enclosed_volume: f64,
    pub events: usize,
}

/// Binary sphere centred in a cubic grid with 1 mm voxels
fn sphere_labelmap(radius: f64) -> OrientedImage {
    let size = (2.0 * radius).ceil() as i64 + 3;
    let centre = DVec3::splat((size - 1) as f64 / 2.0);
    let mut image = OrientedImage::new(Extent::new(0, size - 1, 0, size - 1, 0, size - 1), ScalarType::U8);
    for [i, j, k] in image.extent().iter() {
        let p = DVec3::new(i as f64, j as f64, k as f64);
        if p.distance(centre) <= radius {
            image.set_value(i, j, k, 1.0);
        }
    }
    image
}

/// Build a sphere segment and convert it to a closed surface.
pub fn run_demo(radius: f64, smoothing: f64) -> Result<DemoSummary> {
    if radius <= 0.0 || !radius.is_finite() {
        bail!("Radius must be positive, got {}", radius);
    }

    let mut segmentation = Segmentation::new(BINARY_LABELMAP);
    let events = segmentation.subscribe();
    segmentation.set_conversion_parameter(SMOOTHING_FACTOR, &smoothing.to_string())?;

    let labelmap = sphere_labelmap(radius);
    let segment = Segment::new("Sphere")
        .with_color([0.9, 0.6, 0.4])
        .with_representation(BINARY_LABELMAP, labelmap);
    let segment_id = segmentation.add_segment(segment, None, None)?;

    let path = segmentation
        .converter()
        .cheapest_path_between(BINARY_LABELMAP, CLOSED_SURFACE)?
        .context("No conversion path to closed surface")?;
    segmentation.create_representation(CLOSED_SURFACE, false)?;

    let labelmap = segmentation.segment_labelmap(&segment_id)?;
    let Some(RepresentationRef::Mesh(surface)) =
        segmentation.segment_representation(&segment_id, CLOSED_SURFACE)
    else {
        bail!("Closed surface missing after conversion");
    };

    Ok(DemoSummary {
        segment_id: segment_id.clone(),
        labelmap_extent: labelmap.extent(),
        labelmap_voxels: labelmap.count_non_zero(),
        conversion_path: segmentation.converter().describe_path(&path),
        path_cost: path.cost(),
        surface_points: surface.number_of_points(),
        surface_polygons: surface.number_of_polygons(),
        surface_area: surface.surface_area(),
        enclosed_volume: surface.signed_volume(),
        events: events.try_iter().count(),
    })
}

/// Run the demo and print the summary as JSON.
pub fn demo(radius: f64, smoothing: f64) -> Result<()> {
    info!("Running sphere demo (radius {}, smoothing {})", radius, smoothing);

    let summary = run_demo(radius, smoothing)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
