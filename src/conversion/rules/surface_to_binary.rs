//! Closed surface to binary labelmap

use glam::DVec3;
use tracing::debug;

use super::voxelize::voxelize;
use super::{
    default_geometry_for_bounds, ensure_reference_geometry, mesh_extent_on_grid,
    oversampled_geometry, positive_parameter, reference_geometry,
    CROP_TO_REFERENCE_IMAGE_GEOMETRY, OVERSAMPLING_FACTOR, REFERENCE_IMAGE_GEOMETRY,
};
use crate::conversion::{ConversionParameters, ConversionRule};
use crate::error::Result;
use crate::image::geometry::try_inverse;
use crate::image::{ImageGeometry, OrientedImage, ScalarType};
use crate::impl_rule_common;
use crate::mesh::ClosedSurface;
use crate::representation::{Representation, RepresentationRef, BINARY_LABELMAP, CLOSED_SURFACE};

/// Output grid for one surface: the reference geometry, or 1 mm around the mesh
pub(super) fn output_geometry(
    parameters: &ConversionParameters,
    mesh: &ClosedSurface,
) -> Result<Option<ImageGeometry>> {
    if let Some(geometry) = reference_geometry(parameters)? {
        return Ok(Some(geometry));
    }
    Ok(mesh.bounds().map(|bounds| default_geometry_for_bounds(&bounds)))
}

/// Scanline voxelisation into a 0/1 `U8` labelmap
#[derive(Debug, Clone)]
pub struct ClosedSurfaceToBinaryLabelmap {
    parameters: ConversionParameters,
}

impl ClosedSurfaceToBinaryLabelmap {
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
                    OVERSAMPLING_FACTOR,
                    "1",
                    "Determines the oversampling of the reference image geometry. \
                     If it's a number, then all segments are oversampled with the same value \
                     (value of 1 means no oversampling).",
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

impl Default for ClosedSurfaceToBinaryLabelmap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionRule for ClosedSurfaceToBinaryLabelmap {
    impl_rule_common!(CLOSED_SURFACE, BINARY_LABELMAP, 500);

    fn pre_convert(&mut self, sources: &[RepresentationRef<'_>]) -> Result<()> {
        ensure_reference_geometry(&mut self.parameters, sources)
    }

    fn convert(&self, source: RepresentationRef<'_>) -> Result<Representation> {
        let mesh = source.mesh(CLOSED_SURFACE)?;
        let Some(reference) = output_geometry(&self.parameters, mesh)? else {
            debug!("Surface is empty, producing empty labelmap");
            return Ok(Representation::Raster(OrientedImage::default()));
        };

        let factor = positive_parameter(&self.parameters, OVERSAMPLING_FACTOR, &self.name())?;
        let crop = self.parameters.get_bool(CROP_TO_REFERENCE_IMAGE_GEOMETRY)?;
        let grid = oversampled_geometry(&reference, factor);

        let mut extent = mesh_extent_on_grid(mesh, &grid)?;
        if crop {
            extent = extent.intersect(&grid.extent);
        }

        let mut labelmap = OrientedImage::from_geometry(&grid, ScalarType::U8);
        labelmap.allocate(extent);
        if extent.is_empty() {
            return Ok(Representation::Raster(labelmap));
        }

        let world_to_ijk = try_inverse(&grid.image_to_world)?;
        voxelize(mesh, &world_to_ijk, &extent, DVec3::ZERO, |i, j, k| {
            labelmap.set_value(i, j, k, 1.0);
        });
        debug!(
            extent = %extent,
            voxels = labelmap.count_non_zero(),
            "Converted closed surface to binary labelmap"
        );
        Ok(Representation::Raster(labelmap))
    }
}
