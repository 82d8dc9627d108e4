//! Shared labelmap layers
//!
//! Several segments may keep their binary labelmap in one buffer, each
//! identified by its label value. A voxel belongs to at most one segment of
//! a layer.

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::arena::ImageHandle;
use super::container::{Segmentation, Slot};
use super::events::SegmentationEvent;
use crate::error::{Result, SegError};
use crate::image::resample::{
    calculate_effective_extent, cast_image_for_value, do_geometries_match, modify_image,
    pad_image_to_contain_extent, reextent, resample_to_reference, transform_between_images,
    transform_extent,
};
use crate::image::{Extent, MergeOperation, OrientedImage, ScalarType};
use crate::representation::BINARY_LABELMAP;

/// Make every non-zero voxel equal to `label_value`
pub(crate) fn normalize_labelmap(image: &mut OrientedImage, label_value: i64) {
    if image.is_empty() {
        return;
    }
    let label = label_value as f64;
    cast_image_for_value(image, label);
    for [i, j, k] in image.extent().iter() {
        let value = image.value(i, j, k);
        if value != 0.0 && value != label {
            image.set_value(i, j, k, label);
        }
    }
}

/// Copy of `image` holding `output` where it equals `label`, zero elsewhere
pub(crate) fn isolate_label(image: &OrientedImage, label: f64, output: f64) -> OrientedImage {
    let mut isolated = image.empty_like();
    isolated.allocate(image.extent());
    for [i, j, k] in image.extent().iter() {
        if image.value(i, j, k) == label {
            isolated.set_value(i, j, k, output);
        }
    }
    isolated
}

/// Zero every voxel equal to `label`
pub(crate) fn clear_label(image: &mut OrientedImage, label: f64) -> bool {
    let mut cleared = false;
    for [i, j, k] in image.extent().iter() {
        if image.value(i, j, k) == label {
            cleared |= image.set_value(i, j, k, 0.0);
        }
    }
    cleared
}

impl Segmentation {
    // ===== Layer queries =====

    /// Buffer holding a segment's binary labelmap
    pub fn layer_handle(&self, segment_id: &str) -> Option<ImageHandle> {
        self.labelmap_handle(segment_id).ok()
    }

    pub(crate) fn labelmap_handle(&self, segment_id: &str) -> Result<ImageHandle> {
        match self.entry(segment_id)?.slots.get(BINARY_LABELMAP) {
            Some(Slot::Raster(handle)) => Ok(*handle),
            Some(Slot::Mesh(_)) => Err(SegError::WrongRepresentationType {
                representation: BINARY_LABELMAP.to_string(),
                expected: "raster",
            }),
            None => Err(SegError::missing_representation(segment_id, BINARY_LABELMAP)),
        }
    }

    /// Distinct buffers of a representation, in display order
    pub fn layer_handles(&self, representation_name: &str) -> Vec<ImageHandle> {
        let mut handles = Vec::new();
        for id in self.segment_ids() {
            if let Ok(entry) = self.entry(id) {
                if let Some(Slot::Raster(handle)) = entry.slots.get(representation_name) {
                    if !handles.contains(handle) {
                        handles.push(*handle);
                    }
                }
            }
        }
        handles
    }

    /// Number of distinct storage layers of a representation
    ///
    /// Every mesh counts as its own layer.
    pub fn number_of_layers(&self, representation_name: &str) -> usize {
        let meshes = self
            .entries()
            .filter(|(_, entry)| matches!(entry.slots.get(representation_name), Some(Slot::Mesh(_))))
            .count();
        self.layer_handles(representation_name).len() + meshes
    }

    /// Position of a segment's layer among the binary labelmap layers
    pub fn layer_index(&self, segment_id: &str) -> Option<usize> {
        let handle = self.layer_handle(segment_id)?;
        self.layer_handles(BINARY_LABELMAP)
            .iter()
            .position(|h| *h == handle)
    }

    pub fn layer_image(&self, handle: ImageHandle) -> Option<&OrientedImage> {
        self.arena.get(handle)
    }

    /// Segments storing any representation in `handle`, in display order
    pub fn segment_ids_in_layer(&self, handle: ImageHandle) -> Vec<String> {
        self.segment_ids()
            .iter()
            .filter(|id| {
                self.entry(id).is_ok_and(|entry| {
                    entry
                        .slots
                        .values()
                        .any(|slot| matches!(slot, Slot::Raster(h) if *h == handle))
                })
            })
            .cloned()
            .collect()
    }

    /// Other segments sharing this segment's binary labelmap layer
    pub fn segment_ids_sharing_layer(&self, segment_id: &str) -> Result<Vec<String>> {
        let handle = self.labelmap_handle(segment_id)?;
        Ok(self
            .segment_ids_in_layer(handle)
            .into_iter()
            .filter(|id| id != segment_id)
            .collect())
    }

    /// Binary `U8` labelmap of one segment, independent of layer sharing
    pub fn segment_labelmap(&self, segment_id: &str) -> Result<OrientedImage> {
        let label = self.entry(segment_id)?.info.label_value as f64;
        let layer = self.buffer(self.labelmap_handle(segment_id)?)?;
        let mut labelmap = isolate_label(layer, label, 1.0);
        labelmap.cast(ScalarType::U8);
        Ok(labelmap)
    }

    /// Non-zero label values of a layer under the non-zero voxels of `mask`
    ///
    /// The mask is resampled into the layer geometry when needed.
    pub fn label_values_in_mask(
        &self,
        handle: ImageHandle,
        mask: &OrientedImage,
        extent: Option<&Extent>,
    ) -> Result<BTreeSet<i64>> {
        let layer = self.buffer(handle)?;
        let resampled;
        let mask = if do_geometries_match(layer, mask) {
            mask
        } else {
            resampled = resample_to_reference(mask, layer, false, false, None)?;
            &resampled
        };
        let mut region = layer.extent().intersect(&mask.extent());
        if let Some(extent) = extent {
            region = region.intersect(extent);
        }
        let mut labels = BTreeSet::new();
        for [i, j, k] in region.iter() {
            if mask.value(i, j, k) <= 0.0 {
                continue;
            }
            let value = layer.value(i, j, k);
            if value != 0.0 {
                labels.insert(value as i64);
            }
        }
        Ok(labels)
    }

    // ===== Layer edits =====

    /// Move the binary labelmaps of `segment_ids` into the layer of the first
    ///
    /// Colliding label values are renumbered past the layer maximum. Later
    /// segments overwrite earlier ones where they overlap. Only storage
    /// changes, so derived representations are kept.
    pub fn merge_segment_labelmaps(&mut self, segment_ids: &[String]) -> Result<()> {
        self.merge_inner(segment_ids)
            .inspect_err(|err| err.log("merge_segment_labelmaps"))
    }

    fn merge_inner(&mut self, segment_ids: &[String]) -> Result<()> {
        let Some((first, rest)) = segment_ids.split_first() else {
            return Ok(());
        };
        for id in segment_ids {
            self.labelmap_handle(id)?;
        }
        let destination = self.labelmap_handle(first)?;
        let mut used: BTreeSet<i64> = self
            .segment_ids_in_layer(destination)
            .iter()
            .filter_map(|id| self.segment(id).map(|info| info.label_value))
            .collect();

        for id in rest {
            let source = self.labelmap_handle(id)?;
            if source == destination {
                continue;
            }
            let old_label = self.entry(id)?.info.label_value;
            let mut label = old_label;
            if used.contains(&label) {
                label = used.iter().next_back().copied().unwrap_or(0) + 1;
                debug!(segment = %id, from = old_label, to = label, "Renumbering label value");
                self.entry_mut(id)?.info.label_value = label;
                self.segment_modified(id);
            }
            used.insert(label);

            let mut moved = isolate_label(self.buffer(source)?, old_label as f64, label as f64);
            if self.segment_ids_in_layer(source).len() > 1 {
                clear_label(self.buffer_mut(source)?, old_label as f64);
            }

            let layer = self.buffer(destination)?;
            if layer.is_empty() && !moved.is_empty() {
                cast_image_for_value(&mut moved, label as f64);
                *self.buffer_mut(destination)? = moved;
            } else if !moved.is_empty() {
                if !do_geometries_match(&moved, layer) {
                    moved = resample_to_reference(&moved, layer, false, true, None)?;
                }
                let layer = self.buffer_mut(destination)?;
                if !layer.extent().contains_extent(&moved.extent()) {
                    *layer = pad_image_to_contain_extent(layer, &moved.extent());
                }
                cast_image_for_value(layer, label as f64);
                modify_image(layer, &moved, MergeOperation::Masking, None, 0.0, label as f64)?;
            }

            self.entry_mut(id)?
                .slots
                .insert(BINARY_LABELMAP.to_string(), Slot::Raster(destination));
            self.release_if_unreferenced(source);
            self.emit(SegmentationEvent::RepresentationModified {
                segment_id: id.clone(),
            });
        }
        debug!(
            segments = segment_ids.len(),
            layer = %destination,
            "Merged segment labelmaps"
        );
        Ok(())
    }

    /// Give a segment its own binary labelmap buffer
    ///
    /// The new buffer is cropped to the segment's voxels. No-op when the
    /// segment is alone in its layer.
    pub fn separate_segment_labelmap(&mut self, segment_id: &str) -> Result<()> {
        let handle = self.labelmap_handle(segment_id)?;
        if self.segment_ids_in_layer(handle).len() <= 1 {
            return Ok(());
        }
        let label = self.entry(segment_id)?.info.label_value as f64;
        let isolated = isolate_label(self.buffer(handle)?, label, label);
        let private = reextent(&isolated, &calculate_effective_extent(&isolated, 0.0));
        clear_label(self.buffer_mut(handle)?, label);

        let separated = self.arena.insert(private);
        self.entry_mut(segment_id)?
            .slots
            .insert(BINARY_LABELMAP.to_string(), Slot::Raster(separated));
        debug!(segment = segment_id, from = %handle, to = %separated, "Separated segment labelmap");
        self.emit(SegmentationEvent::RepresentationModified {
            segment_id: segment_id.to_string(),
        });
        Ok(())
    }

    /// Merge binary labelmaps into as few layers as possible
    ///
    /// Segments are visited in display order. Without `force`, a segment
    /// joins the first layer whose segments' effective extents it does not
    /// overlap; with `force`, every segment goes into the first layer and
    /// later segments win on overlap.
    pub fn collapse_binary_labelmaps(&mut self, force: bool) -> Result<()> {
        self.start_modify();
        let result = self.collapse_inner(force);
        self.end_modify();
        result.inspect_err(|err| err.log("collapse_binary_labelmaps"))
    }

    fn collapse_inner(&mut self, force: bool) -> Result<()> {
        let before = self.number_of_layers(BINARY_LABELMAP);
        // Destination layer, one of its segments, occupied effective extents
        let mut destinations: Vec<(ImageHandle, String, Vec<Extent>)> = Vec::new();
        for id in self.segment_ids().to_vec() {
            let handle = self.labelmap_handle(&id)?;
            let labelmap = self.segment_labelmap(&id)?;
            let effective = calculate_effective_extent(&labelmap, 0.0);

            if let Some((_, _, extents)) = destinations.iter_mut().find(|(h, _, _)| *h == handle) {
                extents.push(effective);
                continue;
            }

            let mut target = None;
            for (index, (candidate, _, extents)) in destinations.iter().enumerate() {
                let in_candidate = transform_extent(
                    &effective,
                    &transform_between_images(&labelmap, self.buffer(*candidate)?)?,
                );
                if force || !extents.iter().any(|e| e.overlaps(&in_candidate)) {
                    target = Some((index, in_candidate));
                    break;
                }
            }
            match target {
                Some((index, in_destination)) => {
                    let representative = destinations[index].1.clone();
                    self.merge_inner(&[representative, id])?;
                    destinations[index].2.push(in_destination);
                }
                None => destinations.push((handle, id, vec![effective])),
            }
        }
        info!(
            before,
            after = self.number_of_layers(BINARY_LABELMAP),
            force,
            "Collapsed binary labelmap layers"
        );
        Ok(())
    }

    /// Crop a segment's layer to its non-zero voxels
    pub fn shrink_segment_to_effective_extent(&mut self, segment_id: &str) -> Result<()> {
        let handle = self.labelmap_handle(segment_id)?;
        let layer = self.buffer_mut(handle)?;
        let effective = calculate_effective_extent(layer, 0.0);
        if effective != layer.extent() {
            *layer = reextent(layer, &effective);
        }
        Ok(())
    }

    /// Change a segment's label value, rewriting its voxels
    ///
    /// Fails when another segment of the same layer already uses the value.
    pub fn set_segment_label_value(&mut self, segment_id: &str, label_value: i64) -> Result<()> {
        if label_value < 1 {
            return Err(SegError::invalid(format!(
                "label value must be at least 1, got {}",
                label_value
            )));
        }
        let old = self.entry(segment_id)?.info.label_value;
        if old == label_value {
            return Ok(());
        }
        if let Ok(handle) = self.labelmap_handle(segment_id) {
            let collision = self
                .segment_ids_in_layer(handle)
                .iter()
                .filter(|id| id.as_str() != segment_id)
                .any(|id| self.segment(id).is_some_and(|info| info.label_value == label_value));
            if collision {
                return Err(SegError::LayerError {
                    reason: format!(
                        "label value {} already used in the layer of segment '{}'",
                        label_value, segment_id
                    ),
                });
            }
            let layer = self.buffer_mut(handle)?;
            cast_image_for_value(layer, label_value as f64);
            for [i, j, k] in layer.extent().iter() {
                if layer.value(i, j, k) == old as f64 {
                    layer.set_value(i, j, k, label_value as f64);
                }
            }
        }
        self.entry_mut(segment_id)?.info.label_value = label_value;
        self.segment_modified(segment_id);
        Ok(())
    }
}
