//! Built-in conversion rules
//!
//! | Rule | Cost |
//! |---|---|
//! | Binary labelmap to Closed surface | 500 |
//! | Closed surface to Binary labelmap | 500 |
//! | Closed surface to Fractional labelmap | 700 |
//! | Fractional labelmap to Closed surface | 500 |

mod binary_to_surface;
mod fractional_to_surface;
mod surface_nets;
mod surface_to_binary;
mod surface_to_fractional;
mod voxelize;

pub use binary_to_surface::BinaryLabelmapToClosedSurface;
pub use fractional_to_surface::FractionalLabelmapToClosedSurface;
pub use surface_nets::surface_nets;
pub use surface_to_binary::ClosedSurfaceToBinaryLabelmap;
pub use surface_to_fractional::ClosedSurfaceToFractionalLabelmap;

use glam::DVec3;
use tracing::debug;

use super::rule::{ConversionParameters, ConversionRule};
use crate::error::{Result, SegError};
use crate::image::{Extent, ImageGeometry};
use crate::mesh::ClosedSurface;
use crate::representation::{RepresentationRef, CLOSED_SURFACE};

pub const REFERENCE_IMAGE_GEOMETRY: &str = "Reference image geometry";
pub const OVERSAMPLING_FACTOR: &str = "Oversampling factor";
pub const CROP_TO_REFERENCE_IMAGE_GEOMETRY: &str = "Crop to reference image geometry";
pub const SMOOTHING_FACTOR: &str = "Smoothing factor";
pub const COMPUTE_SURFACE_NORMALS: &str = "Compute surface normals";
pub const FRACTIONAL_THRESHOLD: &str = "Fractional threshold";
pub const SUBVOXEL_SAMPLES: &str = "Subvoxel samples";

/// One instance of every built-in rule with default parameters
pub fn default_rules() -> Vec<Box<dyn ConversionRule>> {
    vec![
        Box::new(BinaryLabelmapToClosedSurface::new()),
        Box::new(ClosedSurfaceToBinaryLabelmap::new()),
        Box::new(ClosedSurfaceToFractionalLabelmap::new()),
        Box::new(FractionalLabelmapToClosedSurface::new()),
    ]
}

/// Parse the reference geometry parameter; `None` when unset
pub(crate) fn reference_geometry(parameters: &ConversionParameters) -> Result<Option<ImageGeometry>> {
    match parameters.get(REFERENCE_IMAGE_GEOMETRY) {
        Some(text) if !text.trim().is_empty() => Ok(Some(ImageGeometry::deserialize(text)?)),
        _ => Ok(None),
    }
}

/// Refine a geometry by an oversampling factor
///
/// Voxel corners of the input grid stay on voxel corners of the output
/// grid, and the extent covers the same physical region.
pub fn oversampled_geometry(geometry: &ImageGeometry, factor: f64) -> ImageGeometry {
    if (factor - 1.0).abs() < f64::EPSILON || factor <= 0.0 {
        return *geometry;
    }
    let origin = geometry.origin();
    let spacing = geometry.spacing();
    let directions = geometry.directions();
    let new_spacing = spacing / factor;

    // Shift from old voxel centre to new voxel centre at the shared corner
    let shift = (new_spacing - spacing) * 0.5;
    let new_origin = origin + directions * shift;

    let extent = if geometry.extent.is_empty() {
        Extent::EMPTY
    } else {
        let e = geometry.extent.0;
        let mut scaled = [0i64; 6];
        for axis in 0..3 {
            scaled[axis * 2] = (e[axis * 2] as f64 * factor).floor() as i64;
            scaled[axis * 2 + 1] = ((e[axis * 2 + 1] + 1) as f64 * factor).ceil() as i64 - 1;
        }
        Extent(scaled)
    };

    ImageGeometry::new(
        crate::image::geometry::compose_image_to_world(new_origin, new_spacing, directions),
        extent,
    )
}

/// Axis-aligned 1 mm geometry covering world bounds
pub(crate) fn default_geometry_for_bounds(bounds: &[f64; 6]) -> ImageGeometry {
    let origin = DVec3::new(bounds[0].floor(), bounds[2].floor(), bounds[4].floor());
    let extent = Extent::new(
        0,
        (bounds[1] - origin.x).ceil() as i64,
        0,
        (bounds[3] - origin.y).ceil() as i64,
        0,
        (bounds[5] - origin.z).ceil() as i64,
    );
    ImageGeometry::axis_aligned(origin, DVec3::ONE, extent)
}

fn union_bounds(a: Option<[f64; 6]>, b: Option<[f64; 6]>) -> Option<[f64; 6]> {
    match (a, b) {
        (Some(a), Some(b)) => Some([
            a[0].min(b[0]),
            a[1].max(b[1]),
            a[2].min(b[2]),
            a[3].max(b[3]),
            a[4].min(b[4]),
            a[5].max(b[5]),
        ]),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Fill in the reference geometry from the union of all source meshes
///
/// Keeps every segment of one batch on the same grid when the caller did
/// not choose a geometry.
pub(crate) fn ensure_reference_geometry(
    parameters: &mut ConversionParameters,
    sources: &[RepresentationRef<'_>],
) -> Result<()> {
    if reference_geometry(parameters)?.is_some() {
        return Ok(());
    }
    let bounds = sources
        .iter()
        .filter_map(|source| source.mesh(CLOSED_SURFACE).ok())
        .filter(|mesh| !mesh.is_empty())
        .fold(None, |acc, mesh| union_bounds(acc, mesh.bounds()));
    if let Some(bounds) = bounds {
        let geometry = default_geometry_for_bounds(&bounds);
        debug!(geometry = %geometry.serialize(), "Derived reference geometry from surfaces");
        parameters.set(REFERENCE_IMAGE_GEOMETRY, &geometry.serialize())?;
    }
    Ok(())
}

/// Index-space extent covering a mesh on a grid (voxel centres)
pub(crate) fn mesh_extent_on_grid(mesh: &ClosedSurface, geometry: &ImageGeometry) -> Result<Extent> {
    if mesh.is_empty() {
        return Ok(Extent::EMPTY);
    }
    let world_to_ijk = crate::image::geometry::try_inverse(&geometry.image_to_world)?;
    let mut lo = DVec3::splat(f64::MAX);
    let mut hi = DVec3::splat(f64::MIN);
    for p in mesh.points() {
        let ijk = world_to_ijk.transform_point3(*p);
        lo = lo.min(ijk);
        hi = hi.max(ijk);
    }
    Ok(Extent::new(
        lo.x.floor() as i64,
        hi.x.ceil() as i64,
        lo.y.floor() as i64,
        hi.y.ceil() as i64,
        lo.z.floor() as i64,
        hi.z.ceil() as i64,
    ))
}

/// Taubin smoothing strength from a 0..1 smoothing factor
pub(crate) fn apply_smoothing(mesh: &mut ClosedSurface, factor: f64) {
    let iterations = (factor.clamp(0.0, 1.0) * 20.0).round() as usize;
    mesh.smooth(iterations, 0.5, -0.53);
}

pub(crate) fn positive_parameter(
    parameters: &ConversionParameters,
    name: &str,
    rule: &str,
) -> Result<f64> {
    let value = parameters.get_f64(name)?;
    if value <= 0.0 || !value.is_finite() {
        return Err(SegError::conversion(
            rule,
            format!("'{}' must be positive, got {}", name, value),
        ));
    }
    Ok(value)
}
