//! Oriented image resampling and voxel combination
//!
//! Stateless helpers used by the segmentation container and the modifier:
//! geometry comparison, extent transforms, nearest/linear resampling into a
//! reference geometry, MIN/MAX/MASK merging and effective-extent scans.
//!
//! Merging never reprojects. Callers resample first; a geometry mismatch is
//! a hard failure with no partial write.

use glam::{DMat4, DVec3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::extent::Extent;
use super::geometry::{matrices_equal, try_inverse, ImageGeometry, GEOMETRY_TOLERANCE};
use super::oriented::OrientedImage;
use crate::error::{Result, SegError};

/// Voxel combination operation for [`merge_image`] and [`modify_image`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOperation {
    /// Keep the smaller of the two values
    Minimum,
    /// Keep the larger of the two values
    Maximum,
    /// Write the fill value wherever the modifier exceeds the mask threshold
    Masking,
}

// ===== Geometry comparison =====

/// Check whether two images have the same origin, spacing and directions
pub fn do_geometries_match(a: &OrientedImage, b: &OrientedImage) -> bool {
    matrices_equal(&a.image_to_world_matrix(), &b.image_to_world_matrix())
}

/// Check whether two images have the same spacing and directions
pub fn do_geometries_match_ignore_origin(a: &OrientedImage, b: &OrientedImage) -> bool {
    let mut ma = a.image_to_world_matrix();
    let mut mb = b.image_to_world_matrix();
    ma.w_axis = glam::DVec4::W;
    mb.w_axis = glam::DVec4::W;
    matrices_equal(&ma, &mb)
}

pub fn do_extents_match(a: &OrientedImage, b: &OrientedImage) -> bool {
    a.extent() == b.extent() || (a.is_empty() && b.is_empty())
}

/// Matrix carrying voxel indices of `from` into voxel indices of `to`
pub fn transform_between_images(from: &OrientedImage, to: &OrientedImage) -> Result<DMat4> {
    Ok(to.world_to_image_matrix()? * from.image_to_world_matrix())
}

// ===== Extent and bounds arithmetic =====

/// Transform a voxel extent with an index-to-index matrix
///
/// Voxel boxes (corners at +-0.5) are transformed and the result is grown
/// to whole voxels. Values are rounded to 1e-6 first so that numerical
/// noise does not add a voxel.
pub fn transform_extent(extent: &Extent, matrix: &DMat4) -> Extent {
    if extent.is_empty() {
        return Extent::EMPTY;
    }
    let e = extent.0;
    let corners_i = [e[0] as f64 - 0.5, e[1] as f64 + 0.5];
    let corners_j = [e[2] as f64 - 0.5, e[3] as f64 + 0.5];
    let corners_k = [e[4] as f64 - 0.5, e[5] as f64 + 0.5];

    let mut bounds = [f64::MAX, f64::MIN, f64::MAX, f64::MIN, f64::MAX, f64::MIN];
    for &i in &corners_i {
        for &j in &corners_j {
            for &k in &corners_k {
                let p = matrix.transform_point3(DVec3::new(i, j, k));
                for axis in 0..3 {
                    bounds[axis * 2] = bounds[axis * 2].min(p[axis] + 0.5);
                    bounds[axis * 2 + 1] = bounds[axis * 2 + 1].max(p[axis] - 0.5);
                }
            }
        }
    }

    let mut result = [0i64; 6];
    for index in 0..6 {
        let rounded = (bounds[index] * 1e6 + 0.5).floor() / 1e6;
        result[index] = if index % 2 == 0 {
            rounded.floor() as i64
        } else {
            rounded.ceil() as i64
        };
    }
    Extent(result)
}

/// Axis-aligned bounds of a transformed box `[xmin, xmax, ymin, ymax, zmin, zmax]`
pub fn transform_bounds(bounds: &[f64; 6], matrix: &DMat4) -> [f64; 6] {
    let mut result = [f64::MAX, f64::MIN, f64::MAX, f64::MIN, f64::MAX, f64::MIN];
    for &x in &[bounds[0], bounds[1]] {
        for &y in &[bounds[2], bounds[3]] {
            for &z in &[bounds[4], bounds[5]] {
                let p = matrix.transform_point3(DVec3::new(x, y, z));
                for axis in 0..3 {
                    result[axis * 2] = result[axis * 2].min(p[axis]);
                    result[axis * 2 + 1] = result[axis * 2 + 1].max(p[axis]);
                }
            }
        }
    }
    result
}

/// Tightest extent holding every voxel whose value exceeds `threshold`
///
/// Returns [`Extent::EMPTY`] when no voxel qualifies.
pub fn calculate_effective_extent(image: &OrientedImage, threshold: f64) -> Extent {
    let mut result = [i64::MAX, i64::MIN, i64::MAX, i64::MIN, i64::MAX, i64::MIN];
    let mut found = false;
    for [i, j, k] in image.extent().iter() {
        if image.value(i, j, k) <= threshold {
            continue;
        }
        found = true;
        for (axis, v) in [i, j, k].into_iter().enumerate() {
            result[axis * 2] = result[axis * 2].min(v);
            result[axis * 2 + 1] = result[axis * 2 + 1].max(v);
        }
    }
    if found {
        Extent(result)
    } else {
        Extent::EMPTY
    }
}

// ===== Buffer helpers =====

/// Copy an image, optionally restricted to `extent`
pub fn copy_image(image: &OrientedImage, extent: Option<&Extent>) -> OrientedImage {
    match extent {
        Some(extent) => reextent(image, &image.extent().intersect(extent)),
        None => image.clone(),
    }
}

/// Copy `image` onto a new extent with the same geometry
///
/// Voxels outside the old extent become zero; voxels outside the new one are
/// dropped.
pub fn reextent(image: &OrientedImage, extent: &Extent) -> OrientedImage {
    let mut output = image.empty_like();
    output.allocate_components(*extent, image.components());
    for [i, j, k] in image.extent().intersect(extent).iter() {
        for c in 0..image.components() {
            output.set_component_value(i, j, k, c, image.component_value(i, j, k, c));
        }
    }
    output
}

/// Grow `image` so that it also covers `extent`
pub fn pad_image_to_contain_extent(image: &OrientedImage, extent: &Extent) -> OrientedImage {
    let union = image.extent().union(extent);
    if union == image.extent() {
        return image.clone();
    }
    reextent(image, &union)
}

/// Grow `image` so that it also covers the extent of `contained`
///
/// Both images must share geometry.
pub fn pad_image_to_contain_image(
    image: &OrientedImage,
    contained: &OrientedImage,
) -> Result<OrientedImage> {
    if !do_geometries_match(image, contained) {
        return Err(SegError::GeometryMismatch {
            reason: "cannot pad to an image with different geometry".to_string(),
        });
    }
    Ok(pad_image_to_contain_extent(image, &contained.extent()))
}

/// Set every voxel (optionally only inside `extent`) to `value`
pub fn fill_image(image: &mut OrientedImage, value: f64, extent: Option<&Extent>) {
    match extent {
        None => image.fill(value),
        Some(extent) => {
            for [i, j, k] in image.extent().intersect(extent).iter() {
                image.set_value(i, j, k, value);
            }
        }
    }
}

/// Promote the image scalar type so that it can hold `value`
///
/// Returns whether the type changed.
pub fn cast_image_for_value(image: &mut OrientedImage, value: f64) -> bool {
    let current = image.scalar_type();
    let promoted = current.promote_for(value);
    if promoted == current {
        return false;
    }
    debug!(from = %current, to = %promoted, value, "Promoting image scalar type");
    image.cast(promoted);
    true
}

/// Apply a world-space linear transform to the image geometry
///
/// Voxels are untouched; only the index-to-world matrix changes.
pub fn transform_oriented_image(image: &mut OrientedImage, transform: &DMat4) {
    let matrix = *transform * image.image_to_world_matrix();
    image.set_image_to_world_matrix(&matrix);
}

// ===== Merging =====

fn combine(operation: MergeOperation, base: f64, modifier: f64, threshold: f64, fill: f64) -> f64 {
    match operation {
        MergeOperation::Minimum => base.min(modifier),
        MergeOperation::Maximum => base.max(modifier),
        MergeOperation::Masking => {
            if modifier > threshold {
                fill
            } else {
                base
            }
        }
    }
}

fn merge_region(
    base: &mut OrientedImage,
    modifier: &OrientedImage,
    operation: MergeOperation,
    region: &Extent,
    mask_threshold: f64,
    fill_value: f64,
) -> bool {
    let mut modified = false;
    for [i, j, k] in region.iter() {
        let current = base.value(i, j, k);
        let value = combine(
            operation,
            current,
            modifier.value(i, j, k),
            mask_threshold,
            fill_value,
        );
        if value != current && base.set_value(i, j, k, value) {
            modified = true;
        }
    }
    modified
}

/// Merge `modifier` into a copy of `base`
///
/// The output keeps `base`'s scalar type and is padded to contain the
/// modifier. The operation is applied over the intersection of both extents,
/// further restricted to `extent` when given. Returns the merged image and
/// whether any voxel changed.
pub fn merge_image(
    base: &OrientedImage,
    modifier: &OrientedImage,
    operation: MergeOperation,
    extent: Option<&Extent>,
    mask_threshold: f64,
    fill_value: f64,
) -> Result<(OrientedImage, bool)> {
    if !do_geometries_match(base, modifier) {
        return Err(SegError::GeometryMismatch {
            reason: "merged images must share origin, spacing and directions".to_string(),
        });
    }

    let mut output = pad_image_to_contain_extent(base, &modifier.extent());
    let mut region = output.extent().intersect(&modifier.extent());
    if let Some(extent) = extent {
        region = region.intersect(extent);
    }
    let modified = merge_region(
        &mut output,
        modifier,
        operation,
        &region,
        mask_threshold,
        fill_value,
    );
    Ok((output, modified))
}

/// Merge `modifier` into `base` in place, without growing `base`
pub fn modify_image(
    base: &mut OrientedImage,
    modifier: &OrientedImage,
    operation: MergeOperation,
    extent: Option<&Extent>,
    mask_threshold: f64,
    fill_value: f64,
) -> Result<bool> {
    if !do_geometries_match(base, modifier) {
        return Err(SegError::GeometryMismatch {
            reason: "modified images must share origin, spacing and directions".to_string(),
        });
    }
    let mut region = base.extent().intersect(&modifier.extent());
    if let Some(extent) = extent {
        region = region.intersect(extent);
    }
    Ok(merge_region(
        base,
        modifier,
        operation,
        &region,
        mask_threshold,
        fill_value,
    ))
}

// ===== Resampling =====

#[inline]
fn sample_nearest(image: &OrientedImage, p: DVec3) -> f64 {
    image.value(
        (p.x + 0.5).floor() as i64,
        (p.y + 0.5).floor() as i64,
        (p.z + 0.5).floor() as i64,
    )
}

fn sample_linear(image: &OrientedImage, p: DVec3) -> f64 {
    let base = p.floor();
    let frac = p - base;
    let (i0, j0, k0) = (base.x as i64, base.y as i64, base.z as i64);
    let mut value = 0.0;
    for dk in 0..2 {
        let wk = if dk == 0 { 1.0 - frac.z } else { frac.z };
        if wk == 0.0 {
            continue;
        }
        for dj in 0..2 {
            let wj = if dj == 0 { 1.0 - frac.y } else { frac.y };
            if wj == 0.0 {
                continue;
            }
            for di in 0..2 {
                let wi = if di == 0 { 1.0 - frac.x } else { frac.x };
                if wi == 0.0 {
                    continue;
                }
                value += wi * wj * wk * image.value(i0 + di, j0 + dj, k0 + dk);
            }
        }
    }
    value
}

/// Resample `input` into a reference geometry
///
/// * `linear` - trilinear instead of nearest-neighbour interpolation
/// * `pad` - grow the reference extent so no transformed input voxel is lost
/// * `extra_transform` - world-space transform applied to the input first
pub fn resample_to_reference_geometry(
    input: &OrientedImage,
    reference: &ImageGeometry,
    linear: bool,
    pad: bool,
    extra_transform: Option<&DMat4>,
) -> Result<OrientedImage> {
    let mut output = input.empty_like();
    output.set_image_to_world_matrix(&reference.image_to_world);

    let input_to_world = match extra_transform {
        Some(transform) => *transform * input.image_to_world_matrix(),
        None => input.image_to_world_matrix(),
    };
    let input_to_reference = try_inverse(&reference.image_to_world)? * input_to_world;

    if input.is_empty() {
        output.allocate(if pad { Extent::EMPTY } else { reference.extent });
        return Ok(output);
    }

    if matrices_equal(&input_to_reference, &DMat4::IDENTITY) {
        // Same grid: plain copy or pad
        let extent = if pad {
            input.extent().union(&reference.extent)
        } else {
            reference.extent
        };
        let mut copied = reextent(input, &extent);
        copied.set_image_to_world_matrix(&reference.image_to_world);
        return Ok(copied);
    }

    let input_in_reference = transform_extent(&input.extent(), &input_to_reference);
    let output_extent = if pad {
        input_in_reference.union(&reference.extent)
    } else {
        reference.extent
    };
    debug!(
        input_extent = %input.extent(),
        output_extent = %output_extent,
        linear,
        "Resampling oriented image"
    );

    let reference_to_input = try_inverse(&input_to_reference)?;
    output.allocate(output_extent);
    // Only voxels that can receive input data need sampling
    let sampled = output_extent.intersect(&input_in_reference.padded(1));
    for [i, j, k] in sampled.iter() {
        let p = reference_to_input.transform_point3(DVec3::new(i as f64, j as f64, k as f64));
        let value = if linear {
            sample_linear(input, p)
        } else {
            sample_nearest(input, p)
        };
        if value != 0.0 {
            output.set_value(i, j, k, value);
        }
    }
    Ok(output)
}

/// Resample `input` into the geometry and extent of `reference`
pub fn resample_to_reference(
    input: &OrientedImage,
    reference: &OrientedImage,
    linear: bool,
    pad: bool,
    extra_transform: Option<&DMat4>,
) -> Result<OrientedImage> {
    resample_to_reference_geometry(input, &reference.geometry(), linear, pad, extra_transform)
}

/// Voxel volume used when picking the finest labelmap geometry
pub(crate) fn voxel_volume(image: &OrientedImage) -> f64 {
    let s = image.spacing();
    (s.x * s.y * s.z).abs().max(GEOMETRY_TOLERANCE * GEOMETRY_TOLERANCE)
}
