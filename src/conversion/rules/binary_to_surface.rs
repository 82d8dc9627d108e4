//! Binary labelmap to closed surface

use tracing::debug;

use super::{apply_smoothing, surface_nets, COMPUTE_SURFACE_NORMALS, SMOOTHING_FACTOR};
use crate::conversion::{ConversionParameters, ConversionRule};
use crate::error::{Result, SegError};
use crate::impl_rule_common;
use crate::representation::{Representation, RepresentationRef, BINARY_LABELMAP, CLOSED_SURFACE};

/// Surface nets over the label mask, then optional smoothing and normals
#[derive(Debug, Clone)]
pub struct BinaryLabelmapToClosedSurface {
    parameters: ConversionParameters,
}

impl BinaryLabelmapToClosedSurface {
    pub fn new() -> Self {
        Self {
            parameters: ConversionParameters::new()
                .declare(
                    SMOOTHING_FACTOR,
                    "0.5",
                    "Smoothing factor. Range: 0.0 (no smoothing) to 1.0 (strong smoothing).",
                )
                .declare(
                    COMPUTE_SURFACE_NORMALS,
                    "1",
                    "Compute surface normals. 1 (default) = surface normals are computed. \
                     0 = surface normals are not computed.",
                ),
        }
    }
}

impl Default for BinaryLabelmapToClosedSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionRule for BinaryLabelmapToClosedSurface {
    impl_rule_common!(BINARY_LABELMAP, CLOSED_SURFACE, 500);

    fn convert(&self, source: RepresentationRef<'_>) -> Result<Representation> {
        let labelmap = source.raster(BINARY_LABELMAP)?;
        let smoothing = self.parameters.get_f64(SMOOTHING_FACTOR)?;
        if !(0.0..=1.0).contains(&smoothing) {
            return Err(SegError::conversion(
                &self.name(),
                format!("smoothing factor {} outside [0, 1]", smoothing),
            ));
        }
        let normals = self.parameters.get_bool(COMPUTE_SURFACE_NORMALS)?;

        let mut mesh = surface_nets(labelmap, 0.5);
        if mesh.is_empty() {
            debug!("Labelmap is empty, producing empty surface");
            return Ok(Representation::Mesh(mesh));
        }
        apply_smoothing(&mut mesh, smoothing);
        if normals {
            mesh.compute_normals();
        }
        debug!(
            points = mesh.number_of_points(),
            polygons = mesh.number_of_polygons(),
            "Converted binary labelmap to closed surface"
        );
        Ok(Representation::Mesh(mesh))
    }
}
