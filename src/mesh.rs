//! Closed surface meshes
//!
//! [`ClosedSurface`] is the mesh payload of the closed-surface
//! representation: a triangle soup over shared points in world coordinates,
//! with optional per-point normals.

use glam::{DMat3, DMat4, DVec3};

use crate::error::{Result, SegError};

/// Triangle mesh in world coordinates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClosedSurface {
    points: Vec<DVec3>,
    triangles: Vec<[u32; 3]>,
    normals: Option<Vec<DVec3>>,
}

impl ClosedSurface {
    /// Create a mesh, validating triangle indices
    pub fn new(points: Vec<DVec3>, triangles: Vec<[u32; 3]>) -> Result<Self> {
        let count = points.len();
        if let Some(bad) = triangles
            .iter()
            .find(|t| t.iter().any(|&index| index as usize >= count))
        {
            return Err(SegError::invalid(format!(
                "triangle {:?} references a point beyond {}",
                bad, count
            )));
        }
        Ok(Self {
            points,
            triangles,
            normals: None,
        })
    }

    /// Mesh with no points and no polygons
    pub fn empty() -> Self {
        Self::default()
    }

    /// Axis-aligned box with outward-facing triangles
    pub fn cuboid(min: DVec3, max: DVec3) -> Self {
        let points = vec![
            DVec3::new(min.x, min.y, min.z),
            DVec3::new(max.x, min.y, min.z),
            DVec3::new(max.x, max.y, min.z),
            DVec3::new(min.x, max.y, min.z),
            DVec3::new(min.x, min.y, max.z),
            DVec3::new(max.x, min.y, max.z),
            DVec3::new(max.x, max.y, max.z),
            DVec3::new(min.x, max.y, max.z),
        ];
        let triangles = vec![
            [0, 2, 1],
            [0, 3, 2],
            [4, 5, 6],
            [4, 6, 7],
            [0, 1, 5],
            [0, 5, 4],
            [3, 6, 2],
            [3, 7, 6],
            [0, 4, 7],
            [0, 7, 3],
            [1, 2, 6],
            [1, 6, 5],
        ];
        Self {
            points,
            triangles,
            normals: None,
        }
    }

    pub fn points(&self) -> &[DVec3] {
        &self.points
    }

    pub fn triangles(&self) -> &[[u32; 3]] {
        &self.triangles
    }

    pub fn normals(&self) -> Option<&[DVec3]> {
        self.normals.as_deref()
    }

    pub fn number_of_points(&self) -> usize {
        self.points.len()
    }

    pub fn number_of_polygons(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// World bounds `[xmin, xmax, ymin, ymax, zmin, zmax]`, `None` without points
    pub fn bounds(&self) -> Option<[f64; 6]> {
        if self.points.is_empty() {
            return None;
        }
        let mut bounds = [f64::MAX, f64::MIN, f64::MAX, f64::MIN, f64::MAX, f64::MIN];
        for p in &self.points {
            for axis in 0..3 {
                bounds[axis * 2] = bounds[axis * 2].min(p[axis]);
                bounds[axis * 2 + 1] = bounds[axis * 2 + 1].max(p[axis]);
            }
        }
        Some(bounds)
    }

    #[inline]
    pub fn triangle_points(&self, triangle: &[u32; 3]) -> [DVec3; 3] {
        [
            self.points[triangle[0] as usize],
            self.points[triangle[1] as usize],
            self.points[triangle[2] as usize],
        ]
    }

    /// Enclosed volume; negative when triangles face inward
    pub fn signed_volume(&self) -> f64 {
        self.triangles
            .iter()
            .map(|t| {
                let [a, b, c] = self.triangle_points(t);
                a.dot(b.cross(c)) / 6.0
            })
            .sum()
    }

    /// Total triangle area
    pub fn surface_area(&self) -> f64 {
        self.triangles
            .iter()
            .map(|t| {
                let [a, b, c] = self.triangle_points(t);
                (b - a).cross(c - a).length() * 0.5
            })
            .sum()
    }

    /// Reverse the winding of every triangle
    pub fn flip_winding(&mut self) {
        for triangle in &mut self.triangles {
            triangle.swap(1, 2);
        }
        if let Some(normals) = &mut self.normals {
            normals.iter_mut().for_each(|n| *n = -*n);
        }
    }

    /// Make triangles face outward
    pub fn orient_outward(&mut self) {
        if self.signed_volume() < 0.0 {
            self.flip_winding();
        }
    }

    /// Apply a world-space linear transform to points and normals
    pub fn transform(&mut self, matrix: &DMat4) {
        for p in &mut self.points {
            *p = matrix.transform_point3(*p);
        }
        if let Some(normals) = &mut self.normals {
            let linear = DMat3::from_mat4(*matrix);
            let normal_matrix = if linear.determinant().abs() > f64::EPSILON {
                linear.inverse().transpose()
            } else {
                linear
            };
            for n in normals.iter_mut() {
                *n = (normal_matrix * *n).normalize_or_zero();
            }
        }
        if DMat3::from_mat4(*matrix).determinant() < 0.0 {
            self.flip_winding();
        }
    }

    /// Compute area-weighted per-point normals
    pub fn compute_normals(&mut self) {
        let mut normals = vec![DVec3::ZERO; self.points.len()];
        for t in &self.triangles {
            let [a, b, c] = self.triangle_points(t);
            let face = (b - a).cross(c - a);
            for &index in t {
                normals[index as usize] += face;
            }
        }
        for n in &mut normals {
            *n = n.normalize_or_zero();
        }
        self.normals = Some(normals);
    }

    /// Point adjacency through triangle edges
    fn point_neighbors(&self) -> Vec<Vec<u32>> {
        let mut neighbors: Vec<Vec<u32>> = vec![Vec::new(); self.points.len()];
        for t in &self.triangles {
            for edge in 0..3 {
                let a = t[edge];
                let b = t[(edge + 1) % 3];
                if !neighbors[a as usize].contains(&b) {
                    neighbors[a as usize].push(b);
                }
                if !neighbors[b as usize].contains(&a) {
                    neighbors[b as usize].push(a);
                }
            }
        }
        neighbors
    }

    fn relax(&mut self, neighbors: &[Vec<u32>], weight: f64) {
        let previous = self.points.clone();
        for (index, adjacent) in neighbors.iter().enumerate() {
            if adjacent.is_empty() {
                continue;
            }
            let centroid = adjacent
                .iter()
                .map(|&n| previous[n as usize])
                .sum::<DVec3>()
                / adjacent.len() as f64;
            self.points[index] = previous[index] + weight * (centroid - previous[index]);
        }
    }

    /// Taubin smoothing (alternating shrink and inflate Laplacian steps)
    ///
    /// Normals are dropped since they no longer match the geometry.
    pub fn smooth(&mut self, iterations: usize, lambda: f64, mu: f64) {
        if iterations == 0 || self.triangles.is_empty() {
            return;
        }
        let neighbors = self.point_neighbors();
        for _ in 0..iterations {
            self.relax(&neighbors, lambda);
            self.relax(&neighbors, mu);
        }
        self.normals = None;
    }

    /// Append another mesh
    pub fn append(&mut self, other: &ClosedSurface) {
        let offset = self.points.len() as u32;
        self.points.extend_from_slice(&other.points);
        self.triangles.extend(
            other
                .triangles
                .iter()
                .map(|t| [t[0] + offset, t[1] + offset, t[2] + offset]),
        );
        self.normals = None;
    }
}
