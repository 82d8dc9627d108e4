//! Voxel edits of one segment's binary labelmap
//!
//! The modifier works directly on the layer buffer, so segments sharing a
//! layer are handled without copying the layer. Co-layer segments listed as
//! protected are never overwritten: the edited segment is moved to its own
//! buffer first when the edit would reach them, and erosion of all segments
//! skips their voxels.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SegError};
use crate::image::resample::{
    cast_image_for_value, copy_image, do_geometries_match, pad_image_to_contain_extent,
    resample_to_reference,
};
use crate::image::{Extent, OrientedImage};
use crate::representation::BINARY_LABELMAP;
use crate::segmentation::{clear_label, Segmentation, SegmentationEvent};

/// How a new labelmap is combined with a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyMode {
    /// The segment becomes the new labelmap
    #[default]
    Replace,
    /// Union; the segment's buffer grows to hold the new labelmap
    MergeMax,
    /// Intersection; segment voxels outside the new labelmap are erased
    MergeMin,
    /// Voxels under the new labelmap join the segment, within the current
    /// buffer extent only
    Mask,
}

/// Result of a modify call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyOutcome {
    pub modified: bool,
    /// The edited segment plus co-layer segments that lost voxels
    pub modified_segment_ids: Vec<String>,
}

impl ModifyOutcome {
    fn unchanged() -> Self {
        Self::default()
    }
}

/// Stateless binary labelmap editor
pub struct Modifier;

impl Modifier {
    /// Combine `new_labelmap` with a segment's binary labelmap
    ///
    /// Non-zero voxels of `new_labelmap` mark the voxels to edit. `extent`
    /// restricts the edit, in the index space of the segment's buffer (of
    /// `new_labelmap` for a private `Replace`). With `minimum_of_all_segments`,
    /// `MergeMin` erodes every segment of the layer instead of only the
    /// edited one.
    ///
    /// Nothing is written when validation fails. Notifications are raised
    /// once, and only when a voxel changed.
    pub fn modify_binary_labelmap(
        new_labelmap: &OrientedImage,
        segmentation: &mut Segmentation,
        segment_id: &str,
        mode: ModifyMode,
        extent: Option<&Extent>,
        minimum_of_all_segments: bool,
        protected_segment_ids: &[String],
    ) -> Result<ModifyOutcome> {
        Self::modify(
            new_labelmap,
            segmentation,
            segment_id,
            mode,
            extent,
            minimum_of_all_segments,
            protected_segment_ids,
        )
        .inspect_err(|err| err.log("modify_binary_labelmap"))
    }

    fn modify(
        new_labelmap: &OrientedImage,
        segmentation: &mut Segmentation,
        segment_id: &str,
        mode: ModifyMode,
        extent: Option<&Extent>,
        minimum_of_all_segments: bool,
        protected_segment_ids: &[String],
    ) -> Result<ModifyOutcome> {
        // Validation
        let label_value = segmentation
            .segment(segment_id)
            .ok_or_else(|| SegError::segment_not_found(segment_id))?
            .label_value;
        let mut handle = segmentation.labelmap_handle(segment_id)?;
        new_labelmap.world_to_image_matrix()?;
        if let Some(extent) = extent {
            if extent.is_empty() {
                return Err(SegError::EmptyExtent {
                    reason: "modify extent selects no voxel".to_string(),
                });
            }
        }
        let label = label_value as f64;

        let mut batch = segmentation.batch();

        // Keep protected co-layer segments out of reach
        let protected: BTreeSet<i64> = batch
            .segment_ids_sharing_layer(segment_id)?
            .iter()
            .filter(|id| protected_segment_ids.contains(id))
            .filter_map(|id| batch.segment(id).map(|info| info.label_value))
            .collect();
        if !protected.is_empty() && !new_labelmap.is_empty() {
            let covered = batch.label_values_in_mask(handle, new_labelmap, extent)?;
            if !covered.is_disjoint(&protected) {
                debug!(segment = segment_id, "Edit reaches protected segments, separating layer");
                batch.separate_segment_labelmap(segment_id)?;
                handle = batch.labelmap_handle(segment_id)?;
            }
        }
        let shared = batch.segment_ids_in_layer(handle).len() > 1;

        let mut mode = mode;
        if batch.buffer(handle)?.count_value(label) == 0 {
            if mode == ModifyMode::MergeMin {
                // An empty segment stays empty under intersection
                return Ok(ModifyOutcome::unchanged());
            }
            mode = ModifyMode::Replace;
        }

        let mut touched: BTreeSet<i64> = BTreeSet::new();
        let modified = match mode {
            ModifyMode::Replace if !shared => {
                let mut replacement = copy_image(new_labelmap, extent);
                cast_image_for_value(&mut replacement, label);
                for [i, j, k] in replacement.extent().iter() {
                    if replacement.value(i, j, k) > 0.0 {
                        replacement.set_value(i, j, k, label);
                    } else {
                        replacement.set_value(i, j, k, 0.0);
                    }
                }
                *batch.buffer_mut(handle)? = replacement;
                true
            }
            ModifyMode::Replace => {
                let gate = reproject(new_labelmap, batch.buffer(handle)?)?;
                let layer = batch.buffer_mut(handle)?;
                cast_image_for_value(layer, label);
                let cleared = clear_label(layer, label);
                let painted = paint(layer, &gate, extent, label, true, &mut touched);
                cleared | painted
            }
            ModifyMode::MergeMax | ModifyMode::Mask => {
                let gate = reproject(new_labelmap, batch.buffer(handle)?)?;
                let layer = batch.buffer_mut(handle)?;
                cast_image_for_value(layer, label);
                paint(layer, &gate, extent, label, mode == ModifyMode::MergeMax, &mut touched)
            }
            ModifyMode::MergeMin => {
                let gate = reproject(new_labelmap, batch.buffer(handle)?)?;
                let layer = batch.buffer_mut(handle)?;
                erode(
                    layer,
                    &gate,
                    extent,
                    label,
                    minimum_of_all_segments,
                    &protected,
                    &mut touched,
                )
            }
        };

        if !modified {
            debug!(segment = segment_id, ?mode, "Labelmap edit changed no voxel");
            return Ok(ModifyOutcome::unchanged());
        }

        batch.shrink_segment_to_effective_extent(segment_id)?;

        let mut modified_segment_ids = vec![segment_id.to_string()];
        for id in batch.segment_ids_in_layer(handle) {
            let lost_voxels = batch
                .segment(&id)
                .is_some_and(|info| touched.contains(&info.label_value));
            if lost_voxels && !modified_segment_ids.contains(&id) {
                modified_segment_ids.push(id);
            }
        }

        if batch.master_representation_name() == BINARY_LABELMAP {
            batch.master_representation_modified(modified_segment_ids.clone());
        }
        for id in &modified_segment_ids {
            batch.emit(SegmentationEvent::RepresentationModified {
                segment_id: id.clone(),
            });
        }
        debug!(
            segment = segment_id,
            ?mode,
            segments = modified_segment_ids.len(),
            "Modified binary labelmap"
        );
        Ok(ModifyOutcome {
            modified: true,
            modified_segment_ids,
        })
    }
}

/// Bring the modifier onto the layer's grid
fn reproject(new_labelmap: &OrientedImage, layer: &OrientedImage) -> Result<OrientedImage> {
    if do_geometries_match(layer, new_labelmap) {
        Ok(new_labelmap.clone())
    } else {
        resample_to_reference(new_labelmap, layer, false, true, None)
    }
}

/// Set voxels under the gate to `label`
///
/// With `grow`, the layer is padded to hold the gate first. Labels of
/// overwritten voxels are collected in `touched`.
fn paint(
    layer: &mut OrientedImage,
    gate: &OrientedImage,
    extent: Option<&Extent>,
    label: f64,
    grow: bool,
    touched: &mut BTreeSet<i64>,
) -> bool {
    let mut gate_extent = gate.extent();
    if let Some(extent) = extent {
        gate_extent = gate_extent.intersect(extent);
    }
    if grow && !gate_extent.is_empty() && !layer.extent().contains_extent(&gate_extent) {
        *layer = pad_image_to_contain_extent(layer, &gate_extent);
    }
    let mut modified = false;
    for [i, j, k] in layer.extent().intersect(&gate_extent).iter() {
        if gate.value(i, j, k) <= 0.0 {
            continue;
        }
        let current = layer.value(i, j, k);
        if current == label {
            continue;
        }
        if current != 0.0 {
            touched.insert(current as i64);
        }
        modified |= layer.set_value(i, j, k, label);
    }
    modified
}

/// Erase voxels outside the gate
///
/// Only voxels of `label` are erased unless `all_segments` is set; voxels
/// holding a `protected` label are always kept. Voxels beyond the gate's
/// extent count as outside the gate.
fn erode(
    layer: &mut OrientedImage,
    gate: &OrientedImage,
    extent: Option<&Extent>,
    label: f64,
    all_segments: bool,
    protected: &BTreeSet<i64>,
    touched: &mut BTreeSet<i64>,
) -> bool {
    let mut region = layer.extent();
    if let Some(extent) = extent {
        region = region.intersect(extent);
    }
    let mut modified = false;
    for [i, j, k] in region.iter() {
        let current = layer.value(i, j, k);
        if current == 0.0 || (!all_segments && current != label) {
            continue;
        }
        if current != label && protected.contains(&(current as i64)) {
            continue;
        }
        if gate.value(i, j, k) > 0.0 {
            continue;
        }
        if current != label {
            touched.insert(current as i64);
        }
        modified |= layer.set_value(i, j, k, 0.0);
    }
    modified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ScalarType;
    use crate::representation::CLOSED_SURFACE;
    use crate::segmentation::Segment;
    use glam::DVec3;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn block(filled: Extent) -> OrientedImage {
        let mut image = OrientedImage::new(Extent::new(0, 9, 0, 9, 0, 9), ScalarType::U8);
        for [i, j, k] in filled.iter() {
            image.set_value(i, j, k, 1.0);
        }
        image
    }

    fn segmentation(blocks: &[(&str, Extent)]) -> Segmentation {
        let mut segmentation = Segmentation::default();
        for (id, extent) in blocks {
            segmentation
                .add_segment(
                    Segment::new(id).with_representation(BINARY_LABELMAP, block(*extent)),
                    Some(id),
                    None,
                )
                .unwrap();
        }
        segmentation
    }

    fn voxels(segmentation: &Segmentation, id: &str) -> usize {
        segmentation.segment_labelmap(id).unwrap().count_non_zero()
    }

    #[test_case(ModifyMode::Replace, 8 ; "replace")]
    #[test_case(ModifyMode::MergeMax, 64 + 8 - 1 ; "max")]
    #[test_case(ModifyMode::MergeMin, 1 ; "min")]
    fn test_private_layer_modes(mode: ModifyMode, expected: usize) {
        let mut seg = segmentation(&[("a", Extent::new(0, 3, 0, 3, 0, 3))]);
        let modifier = block(Extent::new(3, 4, 3, 4, 3, 4));
        let outcome =
            Modifier::modify_binary_labelmap(&modifier, &mut seg, "a", mode, None, false, &[]).unwrap();
        assert!(outcome.modified);
        assert_eq!(outcome.modified_segment_ids, vec!["a".to_string()]);
        assert_eq!(voxels(&seg, "a"), expected);
    }

    #[test]
    fn test_min_on_empty_segment_is_noop() {
        let mut seg = Segmentation::default();
        seg.add_empty_segment(Some("a"), None, None).unwrap();
        let events = seg.subscribe();
        let outcome = Modifier::modify_binary_labelmap(
            &block(Extent::new(0, 1, 0, 1, 0, 1)),
            &mut seg,
            "a",
            ModifyMode::MergeMin,
            None,
            false,
            &[],
        )
        .unwrap();
        assert!(!outcome.modified);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_max_on_empty_segment_replaces() {
        let mut seg = Segmentation::default();
        seg.add_empty_segment(Some("a"), None, None).unwrap();
        let modifier = block(Extent::new(0, 1, 0, 1, 0, 1)).with_spacing(DVec3::splat(0.5));
        Modifier::modify_binary_labelmap(&modifier, &mut seg, "a", ModifyMode::MergeMax, None, false, &[])
            .unwrap();
        let labelmap = seg.segment_labelmap("a").unwrap();
        assert_eq!(labelmap.count_non_zero(), 8);
        assert_eq!(labelmap.spacing(), DVec3::splat(0.5));
    }

    #[test]
    fn test_unchanged_edit_raises_nothing() {
        let mut seg = segmentation(&[("a", Extent::new(0, 3, 0, 3, 0, 3))]);
        let events = seg.subscribe();
        let outcome = Modifier::modify_binary_labelmap(
            &block(Extent::new(1, 2, 1, 2, 1, 2)),
            &mut seg,
            "a",
            ModifyMode::MergeMax,
            None,
            false,
            &[],
        )
        .unwrap();
        assert!(!outcome.modified);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_edit_raises_one_notification_pair() {
        let mut seg = segmentation(&[("a", Extent::new(0, 3, 0, 3, 0, 3))]);
        seg.create_representation(CLOSED_SURFACE, false).unwrap();
        let events = seg.subscribe();
        Modifier::modify_binary_labelmap(
            &block(Extent::new(5, 6, 5, 6, 5, 6)),
            &mut seg,
            "a",
            ModifyMode::MergeMax,
            None,
            false,
            &[],
        )
        .unwrap();
        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                SegmentationEvent::MasterRepresentationModified {
                    segment_ids: vec!["a".to_string()]
                },
                SegmentationEvent::RepresentationModified {
                    segment_id: "a".to_string()
                },
            ]
        );
        assert!(!seg.contains_representation(CLOSED_SURFACE));
    }

    #[test]
    fn test_shared_replace_keeps_neighbour() {
        let mut seg = segmentation(&[
            ("a", Extent::new(0, 1, 0, 1, 0, 1)),
            ("b", Extent::new(5, 6, 5, 6, 5, 6)),
        ]);
        seg.merge_segment_labelmaps(&["a".to_string(), "b".to_string()])
            .unwrap();
        Modifier::modify_binary_labelmap(
            &block(Extent::new(8, 9, 8, 9, 8, 9)),
            &mut seg,
            "a",
            ModifyMode::Replace,
            None,
            false,
            &[],
        )
        .unwrap();
        assert_eq!(seg.layer_handle("a"), seg.layer_handle("b"));
        assert_eq!(voxels(&seg, "a"), 8);
        assert_eq!(voxels(&seg, "b"), 8);
        assert_eq!(seg.segment_labelmap("a").unwrap().value(0, 0, 0), 0.0);
    }

    #[test]
    fn test_unprotected_neighbour_is_overwritten() {
        let mut seg = segmentation(&[
            ("a", Extent::new(0, 1, 0, 1, 0, 1)),
            ("b", Extent::new(2, 3, 2, 3, 2, 3)),
        ]);
        seg.merge_segment_labelmaps(&["a".to_string(), "b".to_string()])
            .unwrap();
        let outcome = Modifier::modify_binary_labelmap(
            &block(Extent::new(2, 2, 2, 2, 2, 2)),
            &mut seg,
            "a",
            ModifyMode::MergeMax,
            None,
            false,
            &[],
        )
        .unwrap();
        assert_eq!(outcome.modified_segment_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(voxels(&seg, "b"), 7);
        assert_eq!(voxels(&seg, "a"), 9);
    }

    #[test]
    fn test_protected_neighbour_forces_separation() {
        let mut seg = segmentation(&[
            ("a", Extent::new(0, 1, 0, 1, 0, 1)),
            ("b", Extent::new(2, 3, 2, 3, 2, 3)),
        ]);
        seg.merge_segment_labelmaps(&["a".to_string(), "b".to_string()])
            .unwrap();
        Modifier::modify_binary_labelmap(
            &block(Extent::new(2, 2, 2, 2, 2, 2)),
            &mut seg,
            "a",
            ModifyMode::MergeMax,
            None,
            false,
            &["b".to_string()],
        )
        .unwrap();
        assert_ne!(seg.layer_handle("a"), seg.layer_handle("b"));
        assert_eq!(voxels(&seg, "b"), 8);
        assert_eq!(voxels(&seg, "a"), 9);
    }

    #[test]
    fn test_min_of_all_segments_erodes_neighbours() {
        let build = || {
            let mut seg = segmentation(&[
                ("a", Extent::new(0, 1, 0, 1, 0, 1)),
                ("b", Extent::new(2, 3, 2, 3, 2, 3)),
            ]);
            seg.merge_segment_labelmaps(&["a".to_string(), "b".to_string()])
                .unwrap();
            seg
        };
        let gate = block(Extent::new(0, 0, 0, 3, 0, 3));

        let mut own = build();
        Modifier::modify_binary_labelmap(&gate, &mut own, "a", ModifyMode::MergeMin, None, false, &[])
            .unwrap();
        assert_eq!(voxels(&own, "a"), 4);
        assert_eq!(voxels(&own, "b"), 8);

        let mut all = build();
        Modifier::modify_binary_labelmap(&gate, &mut all, "a", ModifyMode::MergeMin, None, true, &[])
            .unwrap();
        assert_eq!(voxels(&all, "a"), 4);
        assert_eq!(voxels(&all, "b"), 0);
    }

    #[test]
    fn test_min_of_all_segments_keeps_protected_neighbours() {
        let mut seg = segmentation(&[
            ("a", Extent::new(0, 1, 0, 1, 0, 1)),
            ("b", Extent::new(2, 3, 2, 3, 2, 3)),
            ("c", Extent::new(5, 6, 5, 6, 5, 6)),
        ]);
        seg.merge_segment_labelmaps(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        let gate = block(Extent::new(0, 0, 0, 1, 0, 1));

        let outcome = Modifier::modify_binary_labelmap(
            &gate,
            &mut seg,
            "a",
            ModifyMode::MergeMin,
            None,
            true,
            &["b".to_string()],
        )
        .unwrap();

        assert_eq!(voxels(&seg, "a"), 4);
        assert_eq!(voxels(&seg, "b"), 8);
        assert_eq!(voxels(&seg, "c"), 0);
        assert_eq!(outcome.modified_segment_ids, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_label_value_promotes_buffer() {
        let mut seg = Segmentation::default();
        seg.add_segment(
            Segment::new("big")
                .with_label_value(1000)
                .with_representation(BINARY_LABELMAP, block(Extent::new(0, 0, 0, 0, 0, 0))),
            Some("big"),
            None,
        )
        .unwrap();
        Modifier::modify_binary_labelmap(
            &block(Extent::new(1, 1, 1, 1, 1, 1)),
            &mut seg,
            "big",
            ModifyMode::MergeMax,
            None,
            false,
            &[],
        )
        .unwrap();
        let layer = seg.layer_image(seg.layer_handle("big").unwrap()).unwrap();
        assert_eq!(layer.count_value(1000.0), 2);
    }

    #[test]
    fn test_validation_writes_nothing() {
        let mut seg = segmentation(&[("a", Extent::new(0, 1, 0, 1, 0, 1))]);
        let modifier = block(Extent::new(5, 5, 5, 5, 5, 5));
        let err = Modifier::modify_binary_labelmap(&modifier, &mut seg, "missing", ModifyMode::Replace, None, false, &[])
            .unwrap_err();
        assert_eq!(err.error_code(), "SEGMENT_NOT_FOUND");
        let err = Modifier::modify_binary_labelmap(
            &modifier,
            &mut seg,
            "a",
            ModifyMode::Replace,
            Some(&Extent::EMPTY),
            false,
            &[],
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "EMPTY_EXTENT");
        assert_eq!(voxels(&seg, "a"), 8);
    }
}
