//! Fractional labelmap to closed surface

use super::{
    apply_smoothing, surface_nets, COMPUTE_SURFACE_NORMALS, FRACTIONAL_THRESHOLD, SMOOTHING_FACTOR,
};
use crate::conversion::{ConversionParameters, ConversionRule};
use crate::error::{Result, SegError};
use crate::impl_rule_common;
use crate::representation::{
    Representation, RepresentationRef, CLOSED_SURFACE, FRACTIONAL_LABELMAP,
};

/// Surface nets at the fractional threshold
#[derive(Debug, Clone)]
pub struct FractionalLabelmapToClosedSurface {
    parameters: ConversionParameters,
}

impl FractionalLabelmapToClosedSurface {
    pub fn new() -> Self {
        Self {
            parameters: ConversionParameters::new()
                .declare(
                    FRACTIONAL_THRESHOLD,
                    "0.5",
                    "Fraction of a voxel that must be inside the structure. Range: 0.0 to 1.0.",
                )
                .declare(
                    SMOOTHING_FACTOR,
                    "0.0",
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

impl Default for FractionalLabelmapToClosedSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionRule for FractionalLabelmapToClosedSurface {
    impl_rule_common!(FRACTIONAL_LABELMAP, CLOSED_SURFACE, 500);

    fn convert(&self, source: RepresentationRef<'_>) -> Result<Representation> {
        let fractions = source.raster(FRACTIONAL_LABELMAP)?;
        let threshold = self.parameters.get_f64(FRACTIONAL_THRESHOLD)?;
        if !(0.0..1.0).contains(&threshold) {
            return Err(SegError::conversion(
                &self.name(),
                format!("fractional threshold {} outside [0, 1)", threshold),
            ));
        }
        let smoothing = self.parameters.get_f64(SMOOTHING_FACTOR)?;

        let mut mesh = surface_nets(fractions, threshold);
        if !mesh.is_empty() {
            apply_smoothing(&mut mesh, smoothing);
            if self.parameters.get_bool(COMPUTE_SURFACE_NORMALS)? {
                mesh.compute_normals();
            }
        }
        Ok(Representation::Mesh(mesh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Extent, OrientedImage, ScalarType};

    fn fractional_block(value: f64) -> OrientedImage {
        let mut image = OrientedImage::new(Extent::new(0, 5, 0, 5, 0, 5), ScalarType::F32);
        for [i, j, k] in Extent::new(2, 3, 2, 3, 2, 3).iter() {
            image.set_value(i, j, k, value);
        }
        image
    }

    #[test]
    fn test_threshold_controls_inclusion() {
        let mut rule = FractionalLabelmapToClosedSurface::new();
        let image = fractional_block(0.4);
        let mesh = rule
            .convert(RepresentationRef::Raster(&image))
            .unwrap()
            .into_mesh(CLOSED_SURFACE)
            .unwrap();
        assert!(mesh.is_empty());

        rule.parameters_mut().set(FRACTIONAL_THRESHOLD, "0.3").unwrap();
        let mesh = rule
            .convert(RepresentationRef::Raster(&image))
            .unwrap()
            .into_mesh(CLOSED_SURFACE)
            .unwrap();
        assert!(!mesh.is_empty());
    }

    #[test]
    fn test_invalid_threshold() {
        let mut rule = FractionalLabelmapToClosedSurface::new();
        rule.parameters_mut().set(FRACTIONAL_THRESHOLD, "1.5").unwrap();
        let image = fractional_block(1.0);
        assert!(rule.convert(RepresentationRef::Raster(&image)).is_err());
    }
}
