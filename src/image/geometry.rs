//! Index-to-world geometry
//!
//! An image geometry is a homogeneous 4x4 matrix that maps voxel indices
//! (i, j, k) to world coordinates, plus the voxel extent it covers. The
//! matrix columns are the scaled axis directions and the origin.

use glam::{DMat3, DMat4, DVec3, DVec4};

use super::extent::Extent;
use crate::error::{Result, SegError};

/// Absolute tolerance used for every geometry comparison
pub const GEOMETRY_TOLERANCE: f64 = 1e-4;

/// Compose an index-to-world matrix from origin, spacing and axis directions
///
/// # Arguments
/// * `origin` - World position of voxel (0, 0, 0)
/// * `spacing` - Voxel size along I, J, K
/// * `directions` - Unit axis directions as matrix columns
pub fn compose_image_to_world(origin: DVec3, spacing: DVec3, directions: DMat3) -> DMat4 {
    DMat4::from_cols(
        (directions.x_axis * spacing.x).extend(0.0),
        (directions.y_axis * spacing.y).extend(0.0),
        (directions.z_axis * spacing.z).extend(0.0),
        origin.extend(1.0),
    )
}

/// Split an index-to-world matrix into origin, spacing and unit directions
///
/// A zero-length column keeps its default axis and gets zero spacing.
pub fn decompose_image_to_world(matrix: &DMat4) -> (DVec3, DVec3, DMat3) {
    let defaults = [DVec3::X, DVec3::Y, DVec3::Z];
    let mut spacing = [0.0; 3];
    let mut axes = defaults;
    for (axis, column) in [matrix.x_axis, matrix.y_axis, matrix.z_axis]
        .into_iter()
        .enumerate()
    {
        let column = column.truncate();
        let length = column.length();
        spacing[axis] = length;
        if length > 0.0 {
            axes[axis] = column / length;
        }
    }
    (
        matrix.w_axis.truncate(),
        DVec3::from_array(spacing),
        DMat3::from_cols(axes[0], axes[1], axes[2]),
    )
}

/// Element-wise comparison with [`GEOMETRY_TOLERANCE`]
pub fn matrices_equal(a: &DMat4, b: &DMat4) -> bool {
    matrices_equal_with_tolerance(a, b, GEOMETRY_TOLERANCE)
}

pub fn matrices_equal_with_tolerance(a: &DMat4, b: &DMat4, tolerance: f64) -> bool {
    a.to_cols_array()
        .iter()
        .zip(b.to_cols_array().iter())
        .all(|(x, y)| (x - y).abs() <= tolerance)
}

/// Invert a matrix, failing on (near) singular input
pub fn try_inverse(matrix: &DMat4) -> Result<DMat4> {
    let det = matrix.determinant();
    if !det.is_finite() || det.abs() < 1e-12 {
        return Err(SegError::SingularMatrix);
    }
    Ok(matrix.inverse())
}

/// Check whether the linear part of a matrix has non-orthogonal columns
pub fn does_matrix_contain_shear(matrix: &DMat4) -> bool {
    let columns = [
        matrix.x_axis.truncate(),
        matrix.y_axis.truncate(),
        matrix.z_axis.truncate(),
    ];
    for a in 0..3 {
        for b in (a + 1)..3 {
            let la = columns[a].length();
            let lb = columns[b].length();
            if la == 0.0 || lb == 0.0 {
                continue;
            }
            if (columns[a].dot(columns[b]) / (la * lb)).abs() > GEOMETRY_TOLERANCE {
                return true;
            }
        }
    }
    false
}

/// Geometry of an oriented image without its voxels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageGeometry {
    pub image_to_world: DMat4,
    pub extent: Extent,
}

impl ImageGeometry {
    pub fn new(image_to_world: DMat4, extent: Extent) -> Self {
        Self {
            image_to_world,
            extent,
        }
    }

    /// Axis-aligned geometry from origin and spacing
    pub fn axis_aligned(origin: DVec3, spacing: DVec3, extent: Extent) -> Self {
        Self::new(
            compose_image_to_world(origin, spacing, DMat3::IDENTITY),
            extent,
        )
    }

    pub fn origin(&self) -> DVec3 {
        self.image_to_world.w_axis.truncate()
    }

    pub fn spacing(&self) -> DVec3 {
        decompose_image_to_world(&self.image_to_world).1
    }

    pub fn directions(&self) -> DMat3 {
        decompose_image_to_world(&self.image_to_world).2
    }

    /// Serialize as 16 row-major matrix values followed by 6 extent values
    pub fn serialize(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(22);
        for row in 0..4 {
            let r: DVec4 = self.image_to_world.row(row);
            parts.extend(r.to_array().iter().map(|v| format!("{}", v)));
        }
        parts.extend(self.extent.0.iter().map(|v| v.to_string()));
        parts.join(";")
    }

    /// Parse the format written by [`ImageGeometry::serialize`]
    pub fn deserialize(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() != 22 {
            return Err(SegError::Parse {
                what: "image geometry",
                reason: format!("expected 22 values, found {}", parts.len()),
            });
        }

        let mut rows = [[0.0f64; 4]; 4];
        for (index, part) in parts[..16].iter().enumerate() {
            rows[index / 4][index % 4] = part.parse::<f64>().map_err(|e| SegError::Parse {
                what: "image geometry",
                reason: format!("matrix element {} '{}': {}", index, part, e),
            })?;
        }

        let mut extent = [0i64; 6];
        for (index, part) in parts[16..].iter().enumerate() {
            extent[index] = parse_extent_value(part).ok_or_else(|| SegError::Parse {
                what: "image geometry",
                reason: format!("extent element {} '{}'", index, part),
            })?;
        }

        let image_to_world = DMat4::from_cols_array_2d(&rows).transpose();
        Ok(Self::new(image_to_world, Extent(extent)))
    }
}

fn parse_extent_value(text: &str) -> Option<i64> {
    if let Ok(value) = text.parse::<i64>() {
        return Some(value);
    }
    // Extents written as floating point by older writers
    let value = text.parse::<f64>().ok()?;
    if value.fract() == 0.0 && value.is_finite() {
        Some(value as i64)
    } else {
        None
    }
}

/// Serialize an image's geometry
pub fn serialize_image_geometry(image: &super::OrientedImage) -> String {
    ImageGeometry::from(image).serialize()
}

/// Parse a geometry string into an image geometry
pub fn deserialize_image_geometry(text: &str) -> Result<ImageGeometry> {
    ImageGeometry::deserialize(text)
}
