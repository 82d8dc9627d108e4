//! Oriented voxel images
//!
//! [`OrientedImage`] is the unit of raster storage: a voxel buffer over an
//! [`Extent`] plus the full index-to-world geometry. Values are held as
//! `f64` and every write is clamped (and rounded for integer types) to the
//! image's [`ScalarType`], so a labelmap behaves like a typed buffer.

use std::fmt;

use glam::{DMat3, DMat4, DVec3};
use num_traits::{AsPrimitive, Bounded};
use serde::{Deserialize, Serialize};

use super::extent::Extent;
use super::geometry::{compose_image_to_world, decompose_image_to_world, try_inverse, ImageGeometry};
use crate::error::Result;

/// Voxel scalar type of an oriented image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

fn bounds_of<T>() -> (f64, f64)
where
    T: Bounded + AsPrimitive<f64>,
{
    (T::min_value().as_(), T::max_value().as_())
}

impl ScalarType {
    /// Integer types in promotion order
    const PROMOTION_ORDER: [ScalarType; 7] = [
        ScalarType::U8,
        ScalarType::I8,
        ScalarType::U16,
        ScalarType::I16,
        ScalarType::U32,
        ScalarType::I32,
        ScalarType::F64,
    ];

    /// Lowest and highest representable value
    pub fn range(self) -> (f64, f64) {
        match self {
            ScalarType::U8 => bounds_of::<u8>(),
            ScalarType::I8 => bounds_of::<i8>(),
            ScalarType::U16 => bounds_of::<u16>(),
            ScalarType::I16 => bounds_of::<i16>(),
            ScalarType::U32 => bounds_of::<u32>(),
            ScalarType::I32 => bounds_of::<i32>(),
            ScalarType::F32 => bounds_of::<f32>(),
            ScalarType::F64 => bounds_of::<f64>(),
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    /// Check whether `value` can be stored without clamping or rounding
    pub fn can_represent(self, value: f64) -> bool {
        let (min, max) = self.range();
        value >= min && value <= max && (!self.is_integer() || value.fract() == 0.0)
    }

    /// Clamp and round a value into this type
    #[inline]
    pub fn quantize(self, value: f64) -> f64 {
        if value.is_nan() {
            return 0.0;
        }
        let (min, max) = self.range();
        let value = if self.is_integer() { value.round() } else { value };
        let value = value.clamp(min, max);
        if self == ScalarType::F32 {
            value as f32 as f64
        } else {
            value
        }
    }

    /// Smallest type that holds both this type's full range and `value`
    pub fn promote_for(self, value: f64) -> ScalarType {
        if self.can_represent(value) {
            return self;
        }
        if !self.is_integer() || value.fract() != 0.0 {
            return ScalarType::F64;
        }
        let (cur_min, cur_max) = self.range();
        let lo = cur_min.min(value);
        let hi = cur_max.max(value);
        Self::PROMOTION_ORDER
            .iter()
            .copied()
            .find(|candidate| {
                let (min, max) = candidate.range();
                min <= lo && max >= hi
            })
            .unwrap_or(ScalarType::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarType::U8 => "unsigned char",
            ScalarType::I8 => "char",
            ScalarType::U16 => "unsigned short",
            ScalarType::I16 => "short",
            ScalarType::U32 => "unsigned int",
            ScalarType::I32 => "int",
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Voxel buffer with origin, spacing, axis directions and extent
#[derive(Debug, Clone, PartialEq)]
pub struct OrientedImage {
    origin: DVec3,
    spacing: DVec3,
    directions: DMat3,
    extent: Extent,
    scalar_type: ScalarType,
    components: usize,
    scalars: Vec<f64>,
}

impl Default for OrientedImage {
    fn default() -> Self {
        Self {
            origin: DVec3::ZERO,
            spacing: DVec3::ONE,
            directions: DMat3::IDENTITY,
            extent: Extent::EMPTY,
            scalar_type: ScalarType::U8,
            components: 1,
            scalars: Vec::new(),
        }
    }
}

impl OrientedImage {
    /// Create a zero-filled single-component image with identity geometry
    pub fn new(extent: Extent, scalar_type: ScalarType) -> Self {
        let mut image = Self {
            scalar_type,
            ..Self::default()
        };
        image.allocate(extent);
        image
    }

    /// Create a zero-filled image over a geometry
    pub fn from_geometry(geometry: &ImageGeometry, scalar_type: ScalarType) -> Self {
        let mut image = Self::new(geometry.extent, scalar_type);
        image.set_image_to_world_matrix(&geometry.image_to_world);
        image
    }

    /// Create an empty image sharing this image's geometry and type
    pub fn empty_like(&self) -> Self {
        Self {
            origin: self.origin,
            spacing: self.spacing,
            directions: self.directions,
            extent: Extent::EMPTY,
            scalar_type: self.scalar_type,
            components: self.components,
            scalars: Vec::new(),
        }
    }

    /// Builder: set origin
    pub fn with_origin(mut self, origin: DVec3) -> Self {
        self.origin = origin;
        self
    }

    /// Builder: set spacing
    pub fn with_spacing(mut self, spacing: DVec3) -> Self {
        self.spacing = spacing;
        self
    }

    /// Builder: set axis directions
    pub fn with_directions(mut self, directions: DMat3) -> Self {
        self.directions = directions;
        self
    }

    // ===== Geometry =====

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn spacing(&self) -> DVec3 {
        self.spacing
    }

    pub fn directions(&self) -> DMat3 {
        self.directions
    }

    pub fn set_origin(&mut self, origin: DVec3) {
        self.origin = origin;
    }

    pub fn set_spacing(&mut self, spacing: DVec3) {
        self.spacing = spacing;
    }

    pub fn set_directions(&mut self, directions: DMat3) {
        self.directions = directions;
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn geometry(&self) -> ImageGeometry {
        ImageGeometry::new(self.image_to_world_matrix(), self.extent)
    }

    pub fn image_to_world_matrix(&self) -> DMat4 {
        compose_image_to_world(self.origin, self.spacing, self.directions)
    }

    pub fn world_to_image_matrix(&self) -> Result<DMat4> {
        try_inverse(&self.image_to_world_matrix())
    }

    /// Replace origin, spacing and directions from an index-to-world matrix
    pub fn set_image_to_world_matrix(&mut self, matrix: &DMat4) {
        let (origin, spacing, directions) = decompose_image_to_world(matrix);
        self.origin = origin;
        self.spacing = spacing;
        self.directions = directions;
    }

    /// Copy origin, spacing and directions (not extent) from another image
    pub fn copy_geometry_from(&mut self, other: &OrientedImage) {
        self.origin = other.origin;
        self.spacing = other.spacing;
        self.directions = other.directions;
    }

    /// World position of a voxel centre
    pub fn voxel_to_world(&self, i: f64, j: f64, k: f64) -> DVec3 {
        self.image_to_world_matrix()
            .transform_point3(DVec3::new(i, j, k))
    }

    /// Axis-aligned world bounds of the voxel centres, `None` when empty
    pub fn world_bounds(&self) -> Option<[f64; 6]> {
        if self.extent.is_empty() {
            return None;
        }
        let matrix = self.image_to_world_matrix();
        let e = self.extent.0;
        let mut bounds = [f64::MAX, f64::MIN, f64::MAX, f64::MIN, f64::MAX, f64::MIN];
        for &i in &[e[0], e[1]] {
            for &j in &[e[2], e[3]] {
                for &k in &[e[4], e[5]] {
                    let p = matrix.transform_point3(DVec3::new(i as f64, j as f64, k as f64));
                    for axis in 0..3 {
                        bounds[axis * 2] = bounds[axis * 2].min(p[axis]);
                        bounds[axis * 2 + 1] = bounds[axis * 2 + 1].max(p[axis]);
                    }
                }
            }
        }
        Some(bounds)
    }

    // ===== Voxels =====

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn is_empty(&self) -> bool {
        self.extent.is_empty()
    }

    pub fn scalars(&self) -> &[f64] {
        &self.scalars
    }

    /// Reallocate over a new extent; all voxels become zero
    pub fn allocate(&mut self, extent: Extent) {
        self.extent = if extent.is_empty() {
            Extent::EMPTY
        } else {
            extent
        };
        self.scalars = vec![0.0; self.extent.voxel_count() * self.components];
    }

    /// Reallocate with a different component count
    pub fn allocate_components(&mut self, extent: Extent, components: usize) {
        self.components = components.max(1);
        self.allocate(extent);
    }

    /// Change the scalar type, re-quantizing every voxel
    pub fn cast(&mut self, scalar_type: ScalarType) {
        if scalar_type == self.scalar_type {
            return;
        }
        self.scalar_type = scalar_type;
        for value in &mut self.scalars {
            *value = scalar_type.quantize(*value);
        }
    }

    #[inline]
    fn offset(&self, i: i64, j: i64, k: i64) -> Option<usize> {
        if !self.extent.contains(i, j, k) {
            return None;
        }
        let [dx, dy, _] = self.extent.dimensions();
        let di = (i - self.extent.0[0]) as usize;
        let dj = (j - self.extent.0[2]) as usize;
        let dk = (k - self.extent.0[4]) as usize;
        Some(((dk * dy + dj) * dx + di) * self.components)
    }

    /// First component at (i, j, k); zero outside the extent
    #[inline]
    pub fn value(&self, i: i64, j: i64, k: i64) -> f64 {
        self.component_value(i, j, k, 0)
    }

    #[inline]
    pub fn component_value(&self, i: i64, j: i64, k: i64, component: usize) -> f64 {
        match self.offset(i, j, k) {
            Some(offset) if component < self.components => self.scalars[offset + component],
            _ => 0.0,
        }
    }

    /// Write the first component; ignored outside the extent
    ///
    /// Returns whether the stored value changed.
    #[inline]
    pub fn set_value(&mut self, i: i64, j: i64, k: i64, value: f64) -> bool {
        self.set_component_value(i, j, k, 0, value)
    }

    pub fn set_component_value(
        &mut self,
        i: i64,
        j: i64,
        k: i64,
        component: usize,
        value: f64,
    ) -> bool {
        if component >= self.components {
            return false;
        }
        let Some(offset) = self.offset(i, j, k) else {
            return false;
        };
        let value = self.scalar_type.quantize(value);
        let slot = &mut self.scalars[offset + component];
        if *slot == value {
            return false;
        }
        *slot = value;
        true
    }

    /// Set every voxel (all components) to `value`
    pub fn fill(&mut self, value: f64) {
        let value = self.scalar_type.quantize(value);
        self.scalars.iter_mut().for_each(|v| *v = value);
    }

    /// Lowest and highest first-component value, `None` when empty
    pub fn scalar_range(&self) -> Option<(f64, f64)> {
        if self.scalars.is_empty() {
            return None;
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for value in self.scalars.iter().step_by(self.components) {
            min = min.min(*value);
            max = max.max(*value);
        }
        Some((min, max))
    }

    /// Number of voxels whose first component equals `value`
    pub fn count_value(&self, value: f64) -> usize {
        self.scalars
            .iter()
            .step_by(self.components)
            .filter(|v| **v == value)
            .count()
    }

    /// Number of voxels whose first component is non-zero
    pub fn count_non_zero(&self) -> usize {
        self.scalars
            .iter()
            .step_by(self.components)
            .filter(|v| **v != 0.0)
            .count()
    }
}

impl fmt::Display for OrientedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.directions;
        writeln!(f, "Scalar type: {}", self.scalar_type)?;
        writeln!(f, "Components: {}", self.components)?;
        writeln!(f, "Extent: {}", self.extent)?;
        writeln!(
            f,
            "Origin: [{:.4}, {:.4}, {:.4}]",
            self.origin.x, self.origin.y, self.origin.z
        )?;
        writeln!(
            f,
            "Spacing: [{:.4}, {:.4}, {:.4}]",
            self.spacing.x, self.spacing.y, self.spacing.z
        )?;
        writeln!(f, "Directions:")?;
        for row in 0..3 {
            let r = d.row(row);
            writeln!(f, "  [{:.4}, {:.4}, {:.4}]", r.x, r.y, r.z)?;
        }
        match self.scalar_range() {
            Some((min, max)) => write!(f, "Scalar range: [{}, {}]", min, max),
            None => write!(f, "Scalar range: (empty)"),
        }
    }
}
