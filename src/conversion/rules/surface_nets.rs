//! Naive surface nets over oriented images
//!
//! One vertex per cell whose corners straddle the threshold, placed at the
//! centroid of the edge crossings. Each crossing edge emits a quad joining
//! the four cells around it, split along the shorter diagonal. The scanned
//! region is the effective extent grown by one background voxel, so every
//! surface closes.
//!
//! Cell corner indices (bits: z y x):
//!
//! ```text
//!   0 = (0,0,0)    4 = (0,0,1)
//!   1 = (1,0,0)    5 = (1,0,1)
//!   2 = (0,1,0)    6 = (0,1,1)
//!   3 = (1,1,0)    7 = (1,1,1)
//! ```

use glam::DVec3;

use crate::image::resample::calculate_effective_extent;
use crate::image::OrientedImage;
use crate::mesh::ClosedSurface;

/// Corner positions within the unit cell, indexed as above
const CORNER_POSITIONS: [DVec3; 8] = [
    DVec3::new(0.0, 0.0, 0.0),
    DVec3::new(1.0, 0.0, 0.0),
    DVec3::new(0.0, 1.0, 0.0),
    DVec3::new(1.0, 1.0, 0.0),
    DVec3::new(0.0, 0.0, 1.0),
    DVec3::new(1.0, 0.0, 1.0),
    DVec3::new(0.0, 1.0, 1.0),
    DVec3::new(1.0, 1.0, 1.0),
];

/// Corner pairs of the 12 cell edges
const CUBE_EDGES: [[usize; 2]; 12] = [
    [0, 1],
    [0, 2],
    [0, 4],
    [1, 3],
    [1, 5],
    [2, 3],
    [2, 6],
    [3, 7],
    [4, 5],
    [4, 6],
    [5, 7],
    [6, 7],
];

/// Signed samples over a padded region; negative is inside
struct SampleGrid {
    samples: Vec<f64>,
    dims: [usize; 3],
}

impl SampleGrid {
    #[inline]
    fn at(&self, x: usize, y: usize, z: usize) -> f64 {
        self.samples[(z * self.dims[1] + y) * self.dims[0] + x]
    }

    #[inline]
    fn corner(&self, cell: [usize; 3], corner: usize) -> f64 {
        self.at(
            cell[0] + (corner & 1),
            cell[1] + ((corner >> 1) & 1),
            cell[2] + ((corner >> 2) & 1),
        )
    }
}

/// Centroid of the threshold crossings along the cell edges
fn cell_vertex(samples: &[f64; 8]) -> Option<DVec3> {
    let mut sum = DVec3::ZERO;
    let mut count = 0u32;
    for &[c0, c1] in &CUBE_EDGES {
        let s0 = samples[c0];
        let s1 = samples[c1];
        if (s0 < 0.0) != (s1 < 0.0) {
            let t = s0 / (s0 - s1);
            let p0 = CORNER_POSITIONS[c0];
            let p1 = CORNER_POSITIONS[c1];
            sum += p0 + t * (p1 - p0);
            count += 1;
        }
    }
    (count > 0).then(|| sum / count as f64)
}

/// Extract the surface where `image` exceeds `threshold`
///
/// The mesh is returned in world coordinates with outward-facing triangles.
/// An image with no voxel above the threshold yields an empty mesh.
pub fn surface_nets(image: &OrientedImage, threshold: f64) -> ClosedSurface {
    let effective = calculate_effective_extent(image, threshold);
    if effective.is_empty() {
        return ClosedSurface::empty();
    }

    let region = effective.padded(1);
    let dims = region.dimensions();
    let mut samples = Vec::with_capacity(region.voxel_count());
    for [i, j, k] in region.iter() {
        samples.push(threshold - image.value(i, j, k));
    }
    let grid = SampleGrid { samples, dims };

    let cells = [dims[0] - 1, dims[1] - 1, dims[2] - 1];
    let cell_index = |c: [usize; 3]| (c[2] * cells[1] + c[1]) * cells[0] + c[0];
    let mut vertex_of_cell = vec![-1i64; cells[0] * cells[1] * cells[2]];
    let mut points: Vec<DVec3> = Vec::new();
    let origin = DVec3::new(region.min(0) as f64, region.min(1) as f64, region.min(2) as f64);

    // Pass 1: vertices
    for z in 0..cells[2] {
        for y in 0..cells[1] {
            for x in 0..cells[0] {
                let cell = [x, y, z];
                let corners: [f64; 8] = std::array::from_fn(|c| grid.corner(cell, c));
                if let Some(offset) = cell_vertex(&corners) {
                    vertex_of_cell[cell_index(cell)] = points.len() as i64;
                    points.push(origin + DVec3::new(x as f64, y as f64, z as f64) + offset);
                }
            }
        }
    }

    // Pass 2: one quad per crossing edge
    let mut triangles: Vec<[u32; 3]> = Vec::new();
    for z in 0..cells[2] {
        for y in 0..cells[1] {
            for x in 0..cells[0] {
                let cell = [x, y, z];
                let a = vertex_of_cell[cell_index(cell)];
                if a < 0 {
                    continue;
                }
                let s0 = grid.at(x, y, z);
                for axis in 0..3 {
                    let mut next = cell;
                    next[axis] += 1;
                    let s1 = grid.at(next[0], next[1], next[2]);
                    if (s0 < 0.0) == (s1 < 0.0) {
                        continue;
                    }

                    let u = (axis + 1) % 3;
                    let v = (axis + 2) % 3;
                    if cell[u] == 0 || cell[v] == 0 {
                        continue;
                    }
                    let mut cell_b = cell;
                    cell_b[u] -= 1;
                    cell_b[v] -= 1;
                    let mut cell_c = cell;
                    cell_c[u] -= 1;
                    let mut cell_d = cell;
                    cell_d[v] -= 1;

                    let b = vertex_of_cell[cell_index(cell_b)];
                    let c = vertex_of_cell[cell_index(cell_c)];
                    let d = vertex_of_cell[cell_index(cell_d)];
                    if b < 0 || c < 0 || d < 0 {
                        continue;
                    }
                    let (a, b, c, d) = (a as u32, b as u32, c as u32, d as u32);

                    // Corner 0 outside means the surface faces the other way
                    let flip = s0 >= 0.0;
                    let diag_ab = points[a as usize].distance_squared(points[b as usize]);
                    let diag_cd = points[c as usize].distance_squared(points[d as usize]);
                    if diag_ab < diag_cd {
                        if flip {
                            triangles.push([a, d, b]);
                            triangles.push([a, b, c]);
                        } else {
                            triangles.push([a, b, d]);
                            triangles.push([a, c, b]);
                        }
                    } else if flip {
                        triangles.push([c, d, b]);
                        triangles.push([c, a, d]);
                    } else {
                        triangles.push([c, b, d]);
                        triangles.push([c, d, a]);
                    }
                }
            }
        }
    }

    let mut mesh = match ClosedSurface::new(points, triangles) {
        Ok(mesh) => mesh,
        Err(_) => return ClosedSurface::empty(),
    };
    mesh.transform(&image.image_to_world_matrix());
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Extent, ScalarType};
    use approx::assert_relative_eq;

    fn block(extent: Extent, filled: Extent) -> OrientedImage {
        let mut image = OrientedImage::new(extent, ScalarType::U8);
        for [i, j, k] in filled.iter() {
            image.set_value(i, j, k, 1.0);
        }
        image
    }

    #[test]
    fn test_empty_image_has_no_polygons() {
        let image = OrientedImage::new(Extent::new(0, 9, 0, 9, 0, 9), ScalarType::U8);
        let mesh = surface_nets(&image, 0.5);
        assert_eq!(mesh.number_of_polygons(), 0);
    }

    #[test]
    fn test_single_voxel_is_closed_octahedron() {
        let image = block(Extent::new(0, 2, 0, 2, 0, 2), Extent::new(1, 1, 1, 1, 1, 1));
        let mesh = surface_nets(&image, 0.5);
        // Eight surrounding cells, six crossing edges, two triangles each
        assert_eq!(mesh.number_of_points(), 8);
        assert_eq!(mesh.number_of_polygons(), 12);
        assert!(mesh.signed_volume() > 0.0);
    }

    #[test]
    fn test_block_surface_faces_outward() {
        let image = block(Extent::new(0, 9, 0, 9, 0, 9), Extent::new(2, 7, 2, 7, 2, 7));
        let mesh = surface_nets(&image, 0.5);
        assert!(mesh.signed_volume() > 0.0);
        let bounds = mesh.bounds().unwrap();
        assert_relative_eq!(bounds[0], 1.5, epsilon = 1e-9);
        assert_relative_eq!(bounds[1], 7.5, epsilon = 1e-9);
    }

    #[test]
    fn test_mirrored_geometry_keeps_outward_orientation() {
        let image = block(Extent::new(0, 4, 0, 4, 0, 4), Extent::new(1, 3, 1, 3, 1, 3))
            .with_directions(glam::DMat3::from_cols(-DVec3::X, -DVec3::Y, DVec3::Z))
            .with_spacing(DVec3::new(1.0, 1.0, 1.0));
        let mut flipped = image.clone();
        flipped.set_directions(glam::DMat3::from_cols(-DVec3::X, DVec3::Y, DVec3::Z));
        assert!(surface_nets(&image, 0.5).signed_volume() > 0.0);
        assert!(surface_nets(&flipped, 0.5).signed_volume() > 0.0);
    }
}
