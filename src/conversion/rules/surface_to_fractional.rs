//! Closed surface to fractional labelmap
//!
//! Every voxel is probed at `N x N x N` evenly spaced sub-voxel points; the
//! voxel value is the fraction of probes that fall inside the surface.

use glam::DVec3;
use tracing::debug;

use super::surface_to_binary::output_geometry;
use super::voxelize::voxelize;
use super::{
    ensure_reference_geometry, mesh_extent_on_grid, positive_parameter,
    CROP_TO_REFERENCE_IMAGE_GEOMETRY, REFERENCE_IMAGE_GEOMETRY, SUBVOXEL_SAMPLES,
};
use crate::conversion::{ConversionParameters, ConversionRule};
use crate::error::{Result, SegError};
use crate::image::geometry::try_inverse;
use crate::image::{Extent, OrientedImage, ScalarType};
use crate::impl_rule_common;
use crate::representation::{
    Representation, RepresentationRef, CLOSED_SURFACE, FRACTIONAL_LABELMAP,
};

const MAX_SUBVOXEL_SAMPLES: f64 = 16.0;

/// Sub-voxel sample offsets along one axis, centred on the voxel
fn sample_offsets(samples: usize) -> Vec<f64> {
    let n = samples as f64;
    (0..samples)
        .map(|index| index as f64 / n - (n - 1.0) / (2.0 * n))
        .collect()
}

/// Voxelisation averaged over sub-voxel probes into `F32` fractions
#[derive(Debug, Clone)]
pub struct ClosedSurfaceToFractionalLabelmap {
    parameters: ConversionParameters,
}

impl ClosedSurfaceToFractionalLabelmap {
    pub fn new() -> Self {
        Self {
            parameters: ConversionParameters::new()
                .declare(
                    REFERENCE_IMAGE_GEOMETRY,
                    "",
                    "Image geometry description string determining the geometry of the \
                     labelmap that is created in course of conversion.",
                )
                .declare(
                    SUBVOXEL_SAMPLES,
                    "4",
                    "Number of probe points per voxel along each axis. \
                     Range: 1 to 16.",
                )
                .declare(
                    CROP_TO_REFERENCE_IMAGE_GEOMETRY,
                    "0",
                    "Crop the model to the extent of reference geometry. \
                     0 (default) = created labelmap will contain the entire model. \
                     1 = created labelmap extent will be within reference image extent.",
                ),
        }
    }
}

impl Default for ClosedSurfaceToFractionalLabelmap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionRule for ClosedSurfaceToFractionalLabelmap {
    impl_rule_common!(CLOSED_SURFACE, FRACTIONAL_LABELMAP, 700);

    fn pre_convert(&mut self, sources: &[RepresentationRef<'_>]) -> Result<()> {
        ensure_reference_geometry(&mut self.parameters, sources)
    }

    fn convert(&self, source: RepresentationRef<'_>) -> Result<Representation> {
        let mesh = source.mesh(CLOSED_SURFACE)?;
        let Some(grid) = output_geometry(&self.parameters, mesh)? else {
            return Ok(Representation::Raster(OrientedImage::new(
                Extent::EMPTY,
                ScalarType::F32,
            )));
        };

        let samples = positive_parameter(&self.parameters, SUBVOXEL_SAMPLES, &self.name())?;
        if samples.fract() != 0.0 || samples > MAX_SUBVOXEL_SAMPLES {
            return Err(SegError::conversion(
                &self.name(),
                format!("'{}' must be an integer in 1..=16, got {}", SUBVOXEL_SAMPLES, samples),
            ));
        }
        let samples = samples as usize;
        let crop = self.parameters.get_bool(CROP_TO_REFERENCE_IMAGE_GEOMETRY)?;

        let mut extent = mesh_extent_on_grid(mesh, &grid)?;
        if crop {
            extent = extent.intersect(&grid.extent);
        }
        let mut fractions = OrientedImage::from_geometry(&grid, ScalarType::F32);
        fractions.allocate(extent);
        if extent.is_empty() {
            return Ok(Representation::Raster(fractions));
        }

        let world_to_ijk = try_inverse(&grid.image_to_world)?;
        let dims = extent.dimensions();
        let mut counts = vec![0u32; extent.voxel_count()];
        let offsets = sample_offsets(samples);
        for &dz in &offsets {
            for &dy in &offsets {
                for &dx in &offsets {
                    voxelize(mesh, &world_to_ijk, &extent, DVec3::new(dx, dy, dz), |i, j, k| {
                        let index = ((k - extent.min(2)) as usize * dims[1]
                            + (j - extent.min(1)) as usize)
                            * dims[0]
                            + (i - extent.min(0)) as usize;
                        counts[index] += 1;
                    });
                }
            }
        }

        let total = (samples * samples * samples) as f64;
        for ([i, j, k], count) in extent.iter().zip(counts) {
            if count > 0 {
                fractions.set_value(i, j, k, count as f64 / total);
            }
        }
        debug!(extent = %extent, samples, "Converted closed surface to fractional labelmap");
        Ok(Representation::Raster(fractions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageGeometry;
    use crate::mesh::ClosedSurface;
    use approx::assert_relative_eq;

    fn with_grid(rule: &mut ClosedSurfaceToFractionalLabelmap) {
        let geometry =
            ImageGeometry::axis_aligned(DVec3::ZERO, DVec3::ONE, Extent::new(0, 9, 0, 9, 0, 9));
        rule.parameters_mut()
            .set(REFERENCE_IMAGE_GEOMETRY, &geometry.serialize())
            .unwrap();
    }

    fn convert(rule: &ClosedSurfaceToFractionalLabelmap, mesh: &ClosedSurface) -> OrientedImage {
        rule.convert(RepresentationRef::Mesh(mesh))
            .unwrap()
            .into_raster(FRACTIONAL_LABELMAP)
            .unwrap()
    }

    #[test]
    fn test_sample_offsets_are_centred() {
        assert_eq!(sample_offsets(1), vec![0.0]);
        assert_eq!(sample_offsets(2), vec![-0.25, 0.25]);
        let four = sample_offsets(4);
        assert_relative_eq!(four.iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn test_voxel_aligned_cube_is_fully_inside() {
        let mut rule = ClosedSurfaceToFractionalLabelmap::new();
        with_grid(&mut rule);
        let fractions = convert(&rule, &ClosedSurface::cuboid(DVec3::splat(-0.5), DVec3::splat(3.5)));
        assert_eq!(fractions.scalar_type(), ScalarType::F32);
        assert_eq!(fractions.count_value(1.0), 64);
        assert_eq!(fractions.count_non_zero(), 64);
    }

    #[test]
    fn test_fractions_sum_to_volume() {
        let mut rule = ClosedSurfaceToFractionalLabelmap::new();
        with_grid(&mut rule);
        // Unit cube straddling eight voxels
        let fractions = convert(&rule, &ClosedSurface::cuboid(DVec3::ZERO, DVec3::ONE));
        let total: f64 = fractions.scalars().iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        assert_relative_eq!(fractions.value(0, 0, 0), 0.125);
        assert_relative_eq!(fractions.value(1, 1, 1), 0.125);
    }

    #[test]
    fn test_rejects_fractional_sample_count() {
        let mut rule = ClosedSurfaceToFractionalLabelmap::new();
        rule.parameters_mut().set(SUBVOXEL_SAMPLES, "2.5").unwrap();
        let mesh = ClosedSurface::cuboid(DVec3::ZERO, DVec3::ONE);
        assert!(rule.convert(RepresentationRef::Mesh(&mesh)).is_err());
    }
}
