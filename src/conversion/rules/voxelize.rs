//! Scanline parity voxelisation of closed surfaces
//!
//! Triangles are taken into the index space of the output grid. For every
//! (j, k) row a ray is cast along +i; the sorted intersection depths pair up
//! into inside intervals. The ray is nudged off the row centre by a tiny
//! irrational-ish offset so that it never runs exactly through a shared
//! triangle edge or vertex.

use std::collections::HashMap;

use glam::{DMat4, DVec3};

use crate::image::Extent;
use crate::mesh::ClosedSurface;

const RAY_NUDGE_J: f64 = 1.0e-7 * std::f64::consts::FRAC_1_SQRT_2;
const RAY_NUDGE_K: f64 = 1.0e-7 * std::f64::consts::FRAC_1_PI;

#[inline]
fn cross_2d(a: (f64, f64), b: (f64, f64)) -> f64 {
    a.0 * b.1 - a.1 * b.0
}

/// Depth along i where the ray (y, z) pierces the triangle, if it does
fn ray_hit(triangle: &[DVec3; 3], y: f64, z: f64) -> Option<f64> {
    let [p0, p1, p2] = triangle;
    let e1 = (p1.y - p0.y, p1.z - p0.z);
    let e2 = (p2.y - p0.y, p2.z - p0.z);
    let det = cross_2d(e1, e2);
    if det.abs() < 1e-12 {
        // Triangle is parallel to the ray
        return None;
    }
    let q = (y - p0.y, z - p0.z);
    let w1 = cross_2d(q, e2) / det;
    let w2 = cross_2d(e1, q) / det;
    let w0 = 1.0 - w1 - w2;
    if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
        return None;
    }
    Some(w0 * p0.x + w1 * p1.x + w2 * p2.x)
}

/// Mark every voxel of `extent` whose sample point lies inside `mesh`
///
/// * `world_to_ijk` - world to index transform of the output grid
/// * `sample_offset` - index-space offset of the sample point from the voxel centre
/// * `mark` - called once per inside voxel
pub(crate) fn voxelize(
    mesh: &ClosedSurface,
    world_to_ijk: &DMat4,
    extent: &Extent,
    sample_offset: DVec3,
    mut mark: impl FnMut(i64, i64, i64),
) {
    if mesh.is_empty() || extent.is_empty() {
        return;
    }

    let triangles: Vec<[DVec3; 3]> = mesh
        .triangles()
        .iter()
        .map(|t| {
            let [a, b, c] = mesh.triangle_points(t);
            [
                world_to_ijk.transform_point3(a) - sample_offset,
                world_to_ijk.transform_point3(b) - sample_offset,
                world_to_ijk.transform_point3(c) - sample_offset,
            ]
        })
        .collect();

    // Bucket triangles by the rows their (j, k) footprint can touch
    let mut rows: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (index, triangle) in triangles.iter().enumerate() {
        let y_min = triangle.iter().map(|p| p.y).fold(f64::MAX, f64::min);
        let y_max = triangle.iter().map(|p| p.y).fold(f64::MIN, f64::max);
        let z_min = triangle.iter().map(|p| p.z).fold(f64::MAX, f64::min);
        let z_max = triangle.iter().map(|p| p.z).fold(f64::MIN, f64::max);
        let j0 = (y_min.floor() as i64).max(extent.min(1));
        let j1 = (y_max.ceil() as i64).min(extent.max(1));
        let k0 = (z_min.floor() as i64).max(extent.min(2));
        let k1 = (z_max.ceil() as i64).min(extent.max(2));
        for k in k0..=k1 {
            for j in j0..=j1 {
                rows.entry((j, k)).or_default().push(index);
            }
        }
    }

    let mut depths: Vec<f64> = Vec::new();
    for ((j, k), candidates) in rows {
        let y = j as f64 + RAY_NUDGE_J;
        let z = k as f64 + RAY_NUDGE_K;
        depths.clear();
        depths.extend(
            candidates
                .iter()
                .filter_map(|&index| ray_hit(&triangles[index], y, z)),
        );
        if depths.len() < 2 {
            continue;
        }
        depths.sort_by(|a, b| a.total_cmp(b));

        for pair in depths.chunks_exact(2) {
            let first = (pair[0].ceil() as i64).max(extent.min(0));
            let last = (pair[1].ceil() as i64 - 1).min(extent.max(0));
            for i in first..=last {
                mark(i, j, k);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_inside(mesh: &ClosedSurface, extent: Extent, offset: DVec3) -> usize {
        let mut count = 0;
        voxelize(mesh, &DMat4::IDENTITY, &extent, offset, |_, _, _| count += 1);
        count
    }

    #[test]
    fn test_cuboid_voxel_count() {
        // Voxel centres 0..=3 on each axis lie inside
        let mesh = ClosedSurface::cuboid(DVec3::splat(-0.5), DVec3::splat(3.5));
        assert_eq!(count_inside(&mesh, Extent::new(-2, 6, -2, 6, -2, 6), DVec3::ZERO), 64);
    }

    #[test]
    fn test_extent_clips_output() {
        let mesh = ClosedSurface::cuboid(DVec3::splat(-0.5), DVec3::splat(3.5));
        assert_eq!(count_inside(&mesh, Extent::new(0, 1, 0, 3, 0, 3), DVec3::ZERO), 32);
    }

    #[test]
    fn test_sample_offset_shifts_inside_test() {
        let mesh = ClosedSurface::cuboid(DVec3::splat(-0.5), DVec3::splat(0.5));
        let extent = Extent::new(-1, 1, -1, 1, -1, 1);
        assert_eq!(count_inside(&mesh, extent, DVec3::ZERO), 1);
        assert_eq!(count_inside(&mesh, extent, DVec3::splat(0.25)), 1);
        assert_eq!(count_inside(&mesh, extent, DVec3::splat(0.75)), 1);
    }

    #[test]
    fn test_inverted_mesh_still_fills() {
        let mut mesh = ClosedSurface::cuboid(DVec3::ZERO, DVec3::splat(2.0));
        mesh.flip_winding();
        assert_eq!(count_inside(&mesh, Extent::new(0, 2, 0, 2, 0, 2), DVec3::ZERO), 8);
    }
}
