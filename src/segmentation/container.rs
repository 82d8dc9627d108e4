//! Segmentation container
//!
//! Owns the segments, the conversion graph, the raster arena and the event
//! hub. Every write to a master representation goes through here so that
//! derived representations can be dropped and observers notified.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};

use crossbeam_channel::Receiver;
use glam::DMat4;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::arena::{ImageHandle, LabelmapArena};
use super::events::{EventHub, SegmentationEvent};
use super::layers::{isolate_label, normalize_labelmap};
use super::segment::{Segment, SegmentInfo, INVALID_SEGMENT_COLOR};
use crate::conversion::rules::{oversampled_geometry, REFERENCE_IMAGE_GEOMETRY};
use crate::conversion::{ConversionParameter, ConversionPath, Converter};
use crate::error::{Result, SegError};
use crate::image::resample::{
    calculate_effective_extent, transform_between_images, transform_extent,
    transform_oriented_image, voxel_volume,
};
use crate::image::{Extent, ImageGeometry, OrientedImage};
use crate::mesh::ClosedSurface;
use crate::representation::{
    Representation, RepresentationKind, RepresentationRef, BINARY_LABELMAP,
};

/// Storage of one representation inside a segmentation
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Raster(ImageHandle),
    Mesh(ClosedSurface),
}

#[derive(Debug, Clone)]
pub(crate) struct SegmentEntry {
    pub info: SegmentInfo,
    pub slots: BTreeMap<String, Slot>,
}

/// How the extent of a common labelmap geometry is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtentComputationMode {
    /// Keep the extent of the reference geometry
    ReferenceGeometry,
    /// Union of the labelmap extents
    UnionOfSegments,
    UnionOfSegmentsPadded,
    /// Union of the non-empty regions of the labelmaps
    #[default]
    UnionOfEffectiveSegments,
    UnionOfEffectiveSegmentsPadded,
}

impl ExtentComputationMode {
    fn uses_union(self) -> bool {
        !matches!(self, ExtentComputationMode::ReferenceGeometry)
    }

    fn effective(self) -> bool {
        matches!(
            self,
            ExtentComputationMode::UnionOfEffectiveSegments
                | ExtentComputationMode::UnionOfEffectiveSegmentsPadded
        )
    }

    fn padded(self) -> bool {
        matches!(
            self,
            ExtentComputationMode::UnionOfSegmentsPadded
                | ExtentComputationMode::UnionOfEffectiveSegmentsPadded
        )
    }
}

/// A set of segments sharing a master representation
#[derive(Debug)]
pub struct Segmentation {
    master_representation_name: String,
    /// Display order
    segment_ids: Vec<String>,
    segments: BTreeMap<String, SegmentEntry>,
    pub(crate) arena: LabelmapArena,
    converter: Converter,
    events: EventHub,
    id_counter: u64,
}

impl Default for Segmentation {
    fn default() -> Self {
        Self::new(BINARY_LABELMAP)
    }
}

/// Scoped modify batch
///
/// Created by [`Segmentation::batch`]. Master and representation events
/// raised while the guard lives are delivered once when the outermost
/// batch is dropped.
pub struct ModifyBatch<'a> {
    segmentation: &'a mut Segmentation,
}

impl Deref for ModifyBatch<'_> {
    type Target = Segmentation;

    fn deref(&self) -> &Segmentation {
        &*self.segmentation
    }
}

impl DerefMut for ModifyBatch<'_> {
    fn deref_mut(&mut self) -> &mut Segmentation {
        &mut *self.segmentation
    }
}

impl Drop for ModifyBatch<'_> {
    fn drop(&mut self) {
        self.segmentation.end_modify();
    }
}

impl Segmentation {
    /// Create an empty segmentation using the registered conversion rules
    pub fn new(master_representation_name: &str) -> Self {
        Self::with_converter(master_representation_name, Converter::from_registry())
    }

    /// Create an empty segmentation with an explicit rule set
    pub fn with_converter(master_representation_name: &str, converter: Converter) -> Self {
        Self {
            master_representation_name: master_representation_name.to_string(),
            segment_ids: Vec::new(),
            segments: BTreeMap::new(),
            arena: LabelmapArena::new(),
            converter,
            events: EventHub::default(),
            id_counter: 0,
        }
    }

    /// Independent copy with private buffers and no subscribers
    pub fn deep_copy(&self) -> Segmentation {
        Segmentation {
            master_representation_name: self.master_representation_name.clone(),
            segment_ids: self.segment_ids.clone(),
            segments: self.segments.clone(),
            arena: self.arena.clone(),
            converter: self.converter.clone(),
            events: EventHub::default(),
            id_counter: self.id_counter,
        }
    }

    // ===== Events =====

    /// Receive change notifications
    pub fn subscribe(&mut self) -> Receiver<SegmentationEvent> {
        self.events.subscribe()
    }

    /// Begin a modify batch; pair with [`Segmentation::end_modify`]
    pub fn start_modify(&mut self) {
        self.events.start();
    }

    /// End a modify batch, flushing queued events at the outermost level
    pub fn end_modify(&mut self) {
        self.events.end();
    }

    /// Start a batch that ends when the returned guard is dropped
    pub fn batch(&mut self) -> ModifyBatch<'_> {
        self.start_modify();
        ModifyBatch { segmentation: self }
    }

    pub fn is_modifying(&self) -> bool {
        self.events.is_batching()
    }

    pub(crate) fn emit(&mut self, event: SegmentationEvent) {
        self.events.emit(event);
    }

    // ===== Master representation =====

    pub fn master_representation_name(&self) -> &str {
        &self.master_representation_name
    }

    /// Change the master representation
    ///
    /// Every other representation is dropped. When segments exist, the new
    /// master must already be present on them.
    pub fn set_master_representation_name(&mut self, name: &str) -> Result<()> {
        if self.master_representation_name == name {
            return Ok(());
        }
        if !self.segments.is_empty() && !self.contains_representation(name) {
            let err = SegError::invalid(format!(
                "cannot make '{}' the master representation: not present in segments",
                name
            ));
            err.log("set_master_representation_name");
            return Err(err);
        }
        info!(from = %self.master_representation_name, to = name, "Changing master representation");
        self.master_representation_name = name.to_string();
        let ids = self.segment_ids.clone();
        self.master_representation_modified(ids);
        Ok(())
    }

    /// Payload kind of the master representation
    pub fn master_representation_kind(&self) -> Option<RepresentationKind> {
        match self.segment_ids.first() {
            Some(first) => self
                .segments
                .get(first)
                .and_then(|entry| entry.slots.get(&self.master_representation_name))
                .map(Slot::kind),
            None => RepresentationKind::of_name(&self.master_representation_name),
        }
    }

    /// Drop derived representations and raise a master notification
    pub(crate) fn master_representation_modified(&mut self, segment_ids: Vec<String>) {
        self.invalidate_non_master_representations();
        self.emit(SegmentationEvent::MasterRepresentationModified { segment_ids });
    }

    /// Remove every representation other than the master from all segments
    pub fn invalidate_non_master_representations(&mut self) {
        let master = self.master_representation_name.clone();
        let mut dropped = Vec::new();
        for entry in self.segments.values_mut() {
            entry.slots.retain(|name, slot| {
                if *name == master {
                    return true;
                }
                if let Slot::Raster(handle) = slot {
                    dropped.push(*handle);
                }
                false
            });
        }
        for handle in dropped {
            self.release_if_unreferenced(handle);
        }
    }

    // ===== Converter and parameters =====

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    pub fn converter_mut(&mut self) -> &mut Converter {
        &mut self.converter
    }

    pub fn conversion_parameter(&self, name: &str) -> Option<String> {
        self.converter.conversion_parameter(name)
    }

    pub fn set_conversion_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        self.converter.set_conversion_parameter(name, value)
    }

    pub fn serialize_all_conversion_parameters(&self) -> String {
        self.converter.serialize_all_conversion_parameters()
    }

    pub fn deserialize_conversion_parameters(&mut self, text: &str) -> Result<()> {
        self.converter.deserialize_conversion_parameters(text)
    }

    /// Every path from the master representation to `target`
    pub fn possible_conversions(&self, target: &str) -> Result<Vec<ConversionPath>> {
        self.converter
            .find_paths(&self.master_representation_name, target)
    }

    // ===== Segment ids and order =====

    pub fn segment_ids(&self) -> &[String] {
        &self.segment_ids
    }

    pub fn number_of_segments(&self) -> usize {
        self.segment_ids.len()
    }

    pub fn nth_segment_id(&self, index: usize) -> Option<&str> {
        self.segment_ids.get(index).map(String::as_str)
    }

    pub fn segment_index(&self, segment_id: &str) -> Option<usize> {
        self.segment_ids.iter().position(|id| id == segment_id)
    }

    pub fn contains_segment(&self, segment_id: &str) -> bool {
        self.segments.contains_key(segment_id)
    }

    /// Swap a segment into a new display position
    pub fn set_segment_index(&mut self, segment_id: &str, new_index: usize) -> Result<()> {
        if new_index >= self.segment_ids.len() {
            return Err(SegError::invalid(format!(
                "segment index {} out of range [0, {})",
                new_index,
                self.segment_ids.len()
            )));
        }
        let current = self
            .segment_index(segment_id)
            .ok_or_else(|| SegError::segment_not_found(segment_id))?;
        self.segment_ids.swap(current, new_index);
        self.emit(SegmentationEvent::SegmentsOrderModified);
        Ok(())
    }

    /// Move segments in front of `insert_before`, or to the end
    ///
    /// Unknown ids are ignored.
    pub fn reorder_segments(&mut self, segment_ids_to_move: &[String], insert_before: Option<&str>) {
        if segment_ids_to_move.is_empty() {
            return;
        }
        self.segment_ids
            .retain(|id| !segment_ids_to_move.contains(id));
        let mut position = insert_before
            .and_then(|before| self.segment_ids.iter().position(|id| id == before))
            .unwrap_or(self.segment_ids.len());
        for id in segment_ids_to_move {
            if !self.segments.contains_key(id) || self.segment_ids.contains(id) {
                continue;
            }
            self.segment_ids.insert(position, id.clone());
            position += 1;
        }
        self.emit(SegmentationEvent::SegmentsOrderModified);
    }

    /// Return `id` if unused, otherwise `id_N` with the next free counter
    pub fn generate_unique_segment_id(&mut self, id: &str) -> String {
        if !id.is_empty() && !self.segments.contains_key(id) {
            return id.to_string();
        }
        let prefix = if id.is_empty() { "Segment" } else { id };
        loop {
            self.id_counter += 1;
            let candidate = format!("{}_{}", prefix, self.id_counter);
            if !self.segments.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// First segment (display order) whose name matches, ignoring case
    pub fn segment_id_by_name(&self, name: &str) -> Option<&str> {
        let wanted = name.to_lowercase();
        self.segment_ids
            .iter()
            .find(|id| {
                self.segments
                    .get(*id)
                    .is_some_and(|entry| entry.info.name.to_lowercase() == wanted)
            })
            .map(String::as_str)
    }

    /// Segments carrying `tag`, optionally with a specific value
    pub fn segments_by_tag(&self, tag: &str, value: Option<&str>) -> Vec<String> {
        let found: Vec<String> = self
            .segment_ids
            .iter()
            .filter(|id| {
                self.segments
                    .get(*id)
                    .and_then(|entry| entry.info.tag(tag))
                    .is_some_and(|v| value.map_or(true, |wanted| wanted == v))
            })
            .cloned()
            .collect();
        if found.is_empty() {
            warn!(tag, "No segment carries the requested tag");
        }
        found
    }

    // ===== Segment metadata =====

    pub fn segment(&self, segment_id: &str) -> Option<&SegmentInfo> {
        self.segments.get(segment_id).map(|entry| &entry.info)
    }

    pub(crate) fn entry(&self, segment_id: &str) -> Result<&SegmentEntry> {
        self.segments
            .get(segment_id)
            .ok_or_else(|| SegError::segment_not_found(segment_id))
    }

    pub(crate) fn entry_mut(&mut self, segment_id: &str) -> Result<&mut SegmentEntry> {
        self.segments
            .get_mut(segment_id)
            .ok_or_else(|| SegError::segment_not_found(segment_id))
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&String, &SegmentEntry)> {
        self.segments.iter()
    }

    pub fn set_segment_name(&mut self, segment_id: &str, name: &str) -> Result<()> {
        self.entry_mut(segment_id)?.info.name = name.to_string();
        self.segment_modified(segment_id);
        Ok(())
    }

    pub fn set_segment_color(&mut self, segment_id: &str, color: [f64; 3]) -> Result<()> {
        self.entry_mut(segment_id)?.info.color = color;
        self.segment_modified(segment_id);
        Ok(())
    }

    pub fn set_segment_tag(&mut self, segment_id: &str, tag: &str, value: &str) -> Result<()> {
        self.entry_mut(segment_id)?
            .info
            .tags
            .insert(tag.to_string(), value.to_string());
        self.segment_modified(segment_id);
        Ok(())
    }

    /// Remove a tag, returning whether it was present
    pub fn remove_segment_tag(&mut self, segment_id: &str, tag: &str) -> Result<bool> {
        let removed = self.entry_mut(segment_id)?.info.tags.remove(tag).is_some();
        if removed {
            self.segment_modified(segment_id);
        } else {
            warn!(segment = segment_id, tag, "Tag to remove not found");
        }
        Ok(removed)
    }

    pub(crate) fn segment_modified(&mut self, segment_id: &str) {
        self.emit(SegmentationEvent::SegmentModified {
            segment_id: segment_id.to_string(),
        });
    }

    // ===== Adding and removing segments =====

    /// Add a segment
    ///
    /// The segment is converted to the master representation when it lacks
    /// it, then to every representation the segmentation holds; other
    /// representations are dropped. Without an explicit id, a unique id is
    /// derived from the segment name. Returns the id.
    pub fn add_segment(
        &mut self,
        segment: Segment,
        segment_id: Option<&str>,
        insert_before: Option<&str>,
    ) -> Result<String> {
        self.add_segment_inner(segment, segment_id, insert_before)
            .inspect_err(|err| err.log("add_segment"))
    }

    fn add_segment_inner(
        &mut self,
        segment: Segment,
        segment_id: Option<&str>,
        insert_before: Option<&str>,
    ) -> Result<String> {
        let (info, mut representations) = segment.into_parts();
        if info.label_value < 1 {
            return Err(SegError::invalid(format!(
                "label value must be at least 1, got {}",
                info.label_value
            )));
        }
        if let Some(id) = segment_id {
            if self.segments.contains_key(id) {
                return Err(SegError::invalid(format!("segment id '{}' already in use", id)));
            }
        }
        if let Some(Representation::Raster(labelmap)) = representations.get_mut(BINARY_LABELMAP) {
            normalize_labelmap(labelmap, info.label_value);
        }

        let required = self.required_representation_names();
        if representations.is_empty() {
            for name in &required {
                let kind = self
                    .representation_kind(name)
                    .ok_or_else(|| SegError::invalid(format!("unknown payload kind for '{}'", name)))?;
                representations.insert(name.clone(), kind.empty_payload());
            }
        } else {
            let master = self.master_representation_name.clone();
            if !representations.contains_key(&master) {
                let mut paths = Vec::new();
                for name in representations.keys() {
                    paths.extend(self.converter.find_paths(name, &master)?);
                }
                let path = Converter::cheapest_path(&paths).ok_or_else(|| {
                    SegError::NoConversionPath {
                        source_name: representations.keys().cloned().collect::<Vec<_>>().join(", "),
                        target: master.clone(),
                    }
                })?;
                self.convert_detached(&mut representations, &path)?;
                if let Some(Representation::Raster(labelmap)) = representations.get_mut(BINARY_LABELMAP) {
                    normalize_labelmap(labelmap, info.label_value);
                }
            }
            if !self.segments.is_empty() {
                for name in &required {
                    if representations.contains_key(name) {
                        continue;
                    }
                    let path = self
                        .converter
                        .cheapest_path_between(&master, name)?
                        .ok_or_else(|| SegError::NoConversionPath {
                            source_name: master.clone(),
                            target: name.clone(),
                        })?;
                    self.convert_detached(&mut representations, &path)?;
                }
                representations.retain(|name, _| required.contains(name));
            }
        }

        let id = match segment_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let name = info.name.clone();
                self.generate_unique_segment_id(&name)
            }
        };

        let mut slots = BTreeMap::new();
        for (name, representation) in representations {
            let slot = match representation {
                Representation::Raster(image) => Slot::Raster(self.arena.insert(image)),
                Representation::Mesh(mesh) => Slot::Mesh(mesh),
            };
            slots.insert(name, slot);
        }
        self.segments
            .insert(id.clone(), SegmentEntry { info, slots });
        let position = insert_before
            .and_then(|before| self.segment_index(before))
            .unwrap_or(self.segment_ids.len());
        self.segment_ids.insert(position, id.clone());

        debug!(segment = %id, "Added segment");
        self.emit(SegmentationEvent::SegmentAdded {
            segment_id: id.clone(),
        });
        Ok(id)
    }

    /// Add a segment with empty representations
    pub fn add_empty_segment(
        &mut self,
        segment_id: Option<&str>,
        name: Option<&str>,
        color: Option<[f64; 3]>,
    ) -> Result<String> {
        let id = self.generate_unique_segment_id(segment_id.unwrap_or(""));
        let segment = Segment::new(name.filter(|n| !n.is_empty()).unwrap_or(&id))
            .with_color(color.unwrap_or(INVALID_SEGMENT_COLOR));
        self.add_segment(segment, Some(&id), None)
    }

    pub fn remove_segment(&mut self, segment_id: &str) -> Result<()> {
        let Some(entry) = self.segments.remove(segment_id) else {
            let err = SegError::segment_not_found(segment_id);
            err.log("remove_segment");
            return Err(err);
        };
        self.segment_ids.retain(|id| id != segment_id);
        for slot in entry.slots.values() {
            if let Slot::Raster(handle) = slot {
                self.release_if_unreferenced(*handle);
            }
        }
        if self.segments.is_empty() {
            self.id_counter = 0;
        }
        debug!(segment = segment_id, "Removed segment");
        self.emit(SegmentationEvent::SegmentRemoved {
            segment_id: segment_id.to_string(),
        });
        Ok(())
    }

    pub fn remove_all_segments(&mut self) {
        for id in self.segment_ids.clone() {
            // Ids come from the segment list, so removal cannot miss
            let _ = self.remove_segment(&id);
        }
        self.arena.clear();
        self.id_counter = 0;
    }

    /// Owned copy of a segment with private buffers
    ///
    /// A binary labelmap holds only this segment's voxels.
    pub fn extract_segment(&self, segment_id: &str) -> Result<Segment> {
        let entry = self.entry(segment_id)?;
        let mut representations = BTreeMap::new();
        for (name, slot) in &entry.slots {
            let representation = match slot {
                Slot::Mesh(mesh) => Representation::Mesh(mesh.clone()),
                Slot::Raster(handle) => {
                    let image = self.buffer(*handle)?;
                    if name == BINARY_LABELMAP {
                        let label = entry.info.label_value as f64;
                        Representation::Raster(isolate_label(image, label, label))
                    } else {
                        Representation::Raster(image.clone())
                    }
                }
            };
            representations.insert(name.clone(), representation);
        }
        Ok(Segment::from_parts(entry.info.clone(), representations))
    }

    /// Copy or move a segment from another segmentation
    ///
    /// The reference geometry parameter is taken over when this
    /// segmentation has none. Returns the id in this segmentation.
    pub fn copy_segment_from(
        &mut self,
        source: &mut Segmentation,
        segment_id: &str,
        remove_from_source: bool,
    ) -> Result<String> {
        let segment = source
            .extract_segment(segment_id)
            .inspect_err(|err| err.log("copy_segment_from"))?;

        let target_id = self.generate_unique_segment_id(segment_id);
        if target_id != segment_id {
            warn!(
                segment = segment_id,
                new_id = %target_id,
                "Segment id already in use, generated a new one"
            );
        }

        let own = self
            .conversion_parameter(REFERENCE_IMAGE_GEOMETRY)
            .unwrap_or_default();
        let theirs = source
            .conversion_parameter(REFERENCE_IMAGE_GEOMETRY)
            .unwrap_or_default();
        if own.is_empty() && !theirs.is_empty() {
            self.set_conversion_parameter(REFERENCE_IMAGE_GEOMETRY, &theirs)?;
        }

        let id = self.add_segment(segment, Some(&target_id), None)?;
        if remove_from_source {
            source.remove_segment(segment_id)?;
        }
        Ok(id)
    }

    /// Check whether a segment holding `name` could be added
    pub fn can_accept_representation(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        if name == self.master_representation_name {
            return true;
        }
        self.converter
            .find_paths(name, &self.master_representation_name)
            .map(|paths| !paths.is_empty())
            .unwrap_or(false)
    }

    pub fn can_accept_segment(&self, segment: &Segment) -> bool {
        if self.segments.is_empty() {
            return true;
        }
        segment
            .representation_names()
            .iter()
            .any(|name| self.can_accept_representation(name))
    }

    // ===== Representation access =====

    /// Representation names of the first segment
    ///
    /// Every segment holds the same names.
    pub fn contained_representation_names(&self) -> Vec<String> {
        self.segment_ids
            .first()
            .and_then(|id| self.segments.get(id))
            .map(|entry| entry.slots.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_representation(&self, name: &str) -> bool {
        self.contained_representation_names()
            .iter()
            .any(|n| n == name)
    }

    fn required_representation_names(&self) -> Vec<String> {
        if self.segments.is_empty() {
            vec![self.master_representation_name.clone()]
        } else {
            self.contained_representation_names()
        }
    }

    /// Payload kind for a name, from existing segments or built-in names
    fn representation_kind(&self, name: &str) -> Option<RepresentationKind> {
        self.segments
            .values()
            .find_map(|entry| entry.slots.get(name).map(Slot::kind))
            .or_else(|| RepresentationKind::of_name(name))
    }

    /// Stored payload of a segment
    ///
    /// A binary labelmap in a shared layer is the whole layer buffer; use
    /// [`Segmentation::segment_labelmap`] for one segment's voxels.
    pub fn segment_representation(&self, segment_id: &str, name: &str) -> Option<RepresentationRef<'_>> {
        match self.segments.get(segment_id)?.slots.get(name)? {
            Slot::Raster(handle) => self.arena.get(*handle).map(RepresentationRef::Raster),
            Slot::Mesh(mesh) => Some(RepresentationRef::Mesh(mesh)),
        }
    }

    /// Store a representation on a segment
    ///
    /// Writing the master representation drops every derived
    /// representation and raises a master notification. A binary labelmap
    /// is normalised to the segment's label value; when the segment shares
    /// a layer it is moved to a private buffer first.
    pub fn set_segment_representation(
        &mut self,
        segment_id: &str,
        name: &str,
        representation: impl Into<Representation>,
    ) -> Result<()> {
        self.entry(segment_id)
            .inspect_err(|err| err.log("set_segment_representation"))?;
        self.store_representation(segment_id, name, representation.into())?;
        if name == self.master_representation_name {
            self.master_representation_modified(vec![segment_id.to_string()]);
        } else {
            self.emit(SegmentationEvent::RepresentationModified {
                segment_id: segment_id.to_string(),
            });
        }
        Ok(())
    }

    /// Edit a segment's binary labelmap buffer in place
    ///
    /// The closure sees the layer buffer, which other segments may share.
    /// Counts as a master write when the binary labelmap is the master.
    pub fn modify_labelmap<R>(
        &mut self,
        segment_id: &str,
        edit: impl FnOnce(&mut OrientedImage) -> R,
    ) -> Result<R> {
        let handle = self.labelmap_handle(segment_id)?;
        let image = self
            .arena
            .get_mut(handle)
            .ok_or_else(|| SegError::missing_representation(segment_id, BINARY_LABELMAP))?;
        let result = edit(image);
        if self.master_representation_name == BINARY_LABELMAP {
            let ids = self.segment_ids_in_layer(handle);
            self.master_representation_modified(ids);
        } else {
            self.emit(SegmentationEvent::RepresentationModified {
                segment_id: segment_id.to_string(),
            });
        }
        Ok(result)
    }

    pub(crate) fn store_representation(
        &mut self,
        segment_id: &str,
        name: &str,
        representation: Representation,
    ) -> Result<()> {
        let label = self.entry(segment_id)?.info.label_value;
        let previous = self.entry(segment_id)?.slots.get(name).cloned();
        let slot = match representation {
            Representation::Mesh(mesh) => Slot::Mesh(mesh),
            Representation::Raster(mut image) => {
                if name == BINARY_LABELMAP {
                    normalize_labelmap(&mut image, label);
                }
                match previous {
                    Some(Slot::Raster(handle)) if self.segment_ids_in_layer(handle).len() == 1 => {
                        self.arena.replace(handle, image);
                        Slot::Raster(handle)
                    }
                    Some(Slot::Raster(handle)) => {
                        // Leave the co-layer segments untouched
                        if name == BINARY_LABELMAP {
                            if let Some(shared) = self.arena.get_mut(handle) {
                                super::layers::clear_label(shared, label as f64);
                            }
                        }
                        Slot::Raster(self.arena.insert(image))
                    }
                    _ => Slot::Raster(self.arena.insert(image)),
                }
            }
        };
        self.entry_mut(segment_id)?
            .slots
            .insert(name.to_string(), slot);
        if let Some(Slot::Raster(old)) = previous {
            self.release_if_unreferenced(old);
        }
        Ok(())
    }

    pub(crate) fn buffer(&self, handle: ImageHandle) -> Result<&OrientedImage> {
        self.arena.get(handle).ok_or_else(|| SegError::LayerError {
            reason: format!("buffer {} no longer exists", handle),
        })
    }

    pub(crate) fn buffer_mut(&mut self, handle: ImageHandle) -> Result<&mut OrientedImage> {
        self.arena.get_mut(handle).ok_or_else(|| SegError::LayerError {
            reason: format!("buffer {} no longer exists", handle),
        })
    }

    pub(crate) fn release_if_unreferenced(&mut self, handle: ImageHandle) {
        let referenced = self.segments.values().any(|entry| {
            entry
                .slots
                .values()
                .any(|slot| matches!(slot, Slot::Raster(h) if *h == handle))
        });
        if !referenced && self.arena.remove(handle).is_some() {
            debug!(buffer = %handle, "Released raster buffer");
        }
    }

    // ===== Conversion =====

    /// Owned conversion input for one segment
    fn conversion_source(&self, segment_id: &str, name: &str) -> Result<Representation> {
        let entry = self.entry(segment_id)?;
        match entry.slots.get(name) {
            Some(Slot::Mesh(mesh)) => Ok(Representation::Mesh(mesh.clone())),
            Some(Slot::Raster(_)) if name == BINARY_LABELMAP => {
                Ok(Representation::Raster(self.segment_labelmap(segment_id)?))
            }
            Some(Slot::Raster(handle)) => Ok(Representation::Raster(self.buffer(*handle)?.clone())),
            None => Err(SegError::missing_representation(segment_id, name)),
        }
    }

    /// Run a path over the given segments
    ///
    /// `RepresentationModified` is raised for each segment as soon as its
    /// first result is stored, so segments converted before a failure are
    /// still reported.
    fn convert_segments(
        &mut self,
        segment_ids: &[String],
        path: &ConversionPath,
        overwrite: bool,
    ) -> Result<()> {
        let mut changed: Vec<String> = Vec::new();
        for &index in path.rule_indices() {
            let mut rule = self
                .converter
                .rule(index)
                .map(|rule| rule.box_clone())
                .ok_or_else(|| SegError::invalid(format!("conversion path refers to missing rule {}", index)))?;
            let source_name = rule.source_representation_name();
            let target_name = rule.target_representation_name();

            let pending: Vec<&String> = segment_ids
                .iter()
                .filter(|id| {
                    overwrite
                        || self
                            .segments
                            .get(*id)
                            .is_some_and(|entry| !entry.slots.contains_key(target_name))
                })
                .collect();
            if pending.is_empty() {
                continue;
            }

            let sources = pending
                .iter()
                .map(|id| self.conversion_source(id, source_name))
                .collect::<Result<Vec<_>>>()?;
            let views: Vec<RepresentationRef<'_>> = sources.iter().map(Representation::view).collect();
            rule.pre_convert(&views)?;
            if let Some(slot) = self.converter.rule_mut(index) {
                *slot = rule.box_clone();
            }

            for (id, source) in pending.into_iter().zip(&sources) {
                debug!(segment = %id, rule = %rule.name(), "Converting segment");
                let output = rule.convert(source.view())?;
                self.store_representation(id, target_name, output)?;
                if !changed.contains(id) {
                    changed.push(id.clone());
                    self.emit(SegmentationEvent::RepresentationModified {
                        segment_id: id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run a path on a segment that is not yet part of the segmentation
    fn convert_detached(
        &mut self,
        representations: &mut BTreeMap<String, Representation>,
        path: &ConversionPath,
    ) -> Result<()> {
        for &index in path.rule_indices() {
            let mut rule = self
                .converter
                .rule(index)
                .map(|rule| rule.box_clone())
                .ok_or_else(|| SegError::invalid(format!("conversion path refers to missing rule {}", index)))?;
            let target_name = rule.target_representation_name();
            if representations.contains_key(target_name) {
                continue;
            }
            let source_name = rule.source_representation_name();
            let source = representations
                .get(source_name)
                .ok_or_else(|| SegError::missing_representation("<new segment>", source_name))?;
            rule.pre_convert(&[source.view()])?;
            if let Some(slot) = self.converter.rule_mut(index) {
                *slot = rule.box_clone();
            }
            let output = rule.convert(source.view())?;
            representations.insert(target_name.to_string(), output);
        }
        Ok(())
    }

    /// Create `target` on every segment along the cheapest path from the master
    ///
    /// A no-op when every segment already holds `target`, unless
    /// `always_convert` is set. A failing segment fails the call; segments
    /// converted before it keep their result.
    pub fn create_representation(&mut self, target: &str, always_convert: bool) -> Result<()> {
        self.create_representation_inner(target, always_convert)
            .inspect_err(|err| err.log("create_representation"))
    }

    fn create_representation_inner(&mut self, target: &str, always_convert: bool) -> Result<()> {
        let present = self
            .segments
            .values()
            .all(|entry| entry.slots.contains_key(target));
        if present && !always_convert {
            return Ok(());
        }

        let path = self
            .converter
            .cheapest_path_between(&self.master_representation_name, target)?
            .ok_or_else(|| SegError::NoConversionPath {
                source_name: self.master_representation_name.clone(),
                target: target.to_string(),
            })?;
        debug!(
            target,
            path = ?self.converter.describe_path(&path),
            cost = path.cost(),
            "Creating representation"
        );

        let ids = self.segment_ids.clone();
        self.convert_segments(&ids, &path, always_convert)?;
        self.emit(SegmentationEvent::ContainedRepresentationNamesModified);
        Ok(())
    }

    /// Convert every segment along an explicit path with explicit parameters
    ///
    /// Existing target representations are overwritten.
    pub fn create_representation_with_path(
        &mut self,
        path: &ConversionPath,
        parameters: &[ConversionParameter],
    ) -> Result<()> {
        if path.is_empty() {
            return Err(SegError::invalid("empty conversion path"));
        }
        for parameter in parameters {
            match self.set_conversion_parameter(&parameter.name, &parameter.value) {
                Ok(()) => {}
                Err(SegError::UnknownParameter { name }) => {
                    warn!(parameter = %name, "Conversion parameter not used by any rule");
                }
                Err(err) => return Err(err),
            }
        }
        let ids = self.segment_ids.clone();
        self.convert_segments(&ids, path, true)
            .inspect_err(|err| err.log("create_representation_with_path"))?;
        self.emit(SegmentationEvent::ContainedRepresentationNamesModified);
        Ok(())
    }

    /// Reconvert one segment from the master, overwriting `target`
    pub fn convert_single_segment(&mut self, segment_id: &str, target: &str) -> Result<()> {
        self.entry(segment_id)?;
        let path = self
            .converter
            .cheapest_path_between(&self.master_representation_name, target)?
            .ok_or_else(|| SegError::NoConversionPath {
                source_name: self.master_representation_name.clone(),
                target: target.to_string(),
            })?;
        self.convert_segments(&[segment_id.to_string()], &path, true)
    }

    /// Remove a non-master representation from every segment
    pub fn remove_representation(&mut self, name: &str) -> Result<()> {
        if name == self.master_representation_name {
            return Err(SegError::invalid("the master representation cannot be removed"));
        }
        let mut dropped = Vec::new();
        for entry in self.segments.values_mut() {
            if let Some(Slot::Raster(handle)) = entry.slots.remove(name) {
                dropped.push(handle);
            }
        }
        for handle in dropped {
            self.release_if_unreferenced(handle);
        }
        self.emit(SegmentationEvent::ContainedRepresentationNamesModified);
        Ok(())
    }

    // ===== Geometry =====

    /// World bounding box of all segments
    pub fn bounds(&self) -> Option<[f64; 6]> {
        let mut result: Option<[f64; 6]> = None;
        for entry in self.segments.values() {
            for slot in entry.slots.values() {
                let bounds = match slot {
                    Slot::Mesh(mesh) => mesh.bounds(),
                    Slot::Raster(handle) => self.arena.get(*handle).and_then(OrientedImage::world_bounds),
                };
                if let Some(b) = bounds {
                    result = Some(match result {
                        None => b,
                        Some(r) => [
                            r[0].min(b[0]),
                            r[1].max(b[1]),
                            r[2].min(b[2]),
                            r[3].max(b[3]),
                            r[4].min(b[4]),
                            r[5].max(b[5]),
                        ],
                    });
                }
            }
        }
        result
    }

    /// Apply a world-space linear transform to every master representation
    ///
    /// Rasters get a new geometry matrix, meshes are transformed vertex by
    /// vertex. The reference geometry parameter follows the transform.
    pub fn apply_linear_transform(&mut self, transform: &DMat4) -> Result<()> {
        if transform.determinant().abs() < 1e-12 {
            return Err(SegError::SingularMatrix);
        }
        self.converter
            .apply_transform_on_reference_image_geometry(transform)?;

        let master = self.master_representation_name.clone();
        let mut transformed: BTreeSet<ImageHandle> = BTreeSet::new();
        for id in self.segment_ids.clone() {
            let slot = self
                .entry_mut(&id)?
                .slots
                .get_mut(&master)
                .ok_or_else(|| SegError::missing_representation(&id, &master))?;
            match slot {
                Slot::Mesh(mesh) => mesh.transform(transform),
                Slot::Raster(handle) => {
                    let handle = *handle;
                    if transformed.insert(handle) {
                        transform_oriented_image(self.buffer_mut(handle)?, transform);
                    }
                }
            }
        }
        let ids = self.segment_ids.clone();
        self.master_representation_modified(ids);
        Ok(())
    }

    /// Geometry that can hold the binary labelmaps of the given segments
    ///
    /// The reference geometry parameter (or the finest labelmap when it is
    /// unset) is oversampled to the finest labelmap spacing. `None` when all
    /// selected labelmaps are empty. An empty id list selects every segment.
    pub fn determine_common_labelmap_geometry(
        &self,
        mode: ExtentComputationMode,
        segment_ids: &[String],
    ) -> Result<Option<ImageGeometry>> {
        let ids = self.selected_ids(segment_ids);

        let mut finest: Option<&OrientedImage> = None;
        for id in &ids {
            let Some(labelmap) = self.labelmap_buffer(id) else {
                continue;
            };
            if labelmap.is_empty() {
                continue;
            }
            if finest.map_or(true, |best| voxel_volume(labelmap) < voxel_volume(best)) {
                finest = Some(labelmap);
            }
        }
        let Some(finest) = finest else {
            return Ok(None);
        };

        let reference = self
            .conversion_parameter(REFERENCE_IMAGE_GEOMETRY)
            .unwrap_or_default();
        let mut geometry = if reference.trim().is_empty() {
            finest.geometry()
        } else {
            ImageGeometry::deserialize(&reference)?
        };

        if mode.uses_union() {
            geometry.extent =
                self.determine_common_labelmap_extent(&geometry, &ids, mode.effective(), mode.padded())?;
        }

        let spacing = geometry.spacing();
        let ratio = (spacing.x * spacing.y * spacing.z).abs() / voxel_volume(finest);
        let factor = ratio.cbrt().round().max(1.0);
        Ok(Some(oversampled_geometry(&geometry, factor)))
    }

    /// Give `image` the common labelmap geometry and allocate it zeroed
    ///
    /// Returns `false` and leaves `image` untouched when there is no common
    /// geometry.
    pub fn set_image_geometry_from_common_labelmap_geometry(
        &self,
        image: &mut OrientedImage,
        mode: ExtentComputationMode,
        segment_ids: &[String],
    ) -> Result<bool> {
        let Some(geometry) = self.determine_common_labelmap_geometry(mode, segment_ids)? else {
            return Ok(false);
        };
        image.set_image_to_world_matrix(&geometry.image_to_world);
        image.allocate(geometry.extent);
        Ok(true)
    }

    /// Extent in `geometry` covering the binary labelmaps of the segments
    pub fn determine_common_labelmap_extent(
        &self,
        geometry: &ImageGeometry,
        segment_ids: &[String],
        effective: bool,
        pad: bool,
    ) -> Result<Extent> {
        let frame = OrientedImage::from_geometry(
            &ImageGeometry::new(geometry.image_to_world, Extent::EMPTY),
            crate::image::ScalarType::U8,
        );
        let mut common = Extent::EMPTY;
        for id in self.selected_ids(segment_ids) {
            let Some(labelmap) = self.labelmap_buffer(&id) else {
                continue;
            };
            if labelmap.is_empty() {
                continue;
            }
            let extent = if effective {
                calculate_effective_extent(labelmap, 0.0)
            } else {
                labelmap.extent()
            };
            if extent.is_empty() {
                continue;
            }
            let to_common = transform_between_images(labelmap, &frame)?;
            common = common.union(&transform_extent(&extent, &to_common));
        }
        Ok(if pad { common.padded(1) } else { common })
    }

    fn selected_ids(&self, segment_ids: &[String]) -> Vec<String> {
        if segment_ids.is_empty() {
            return self.segment_ids.clone();
        }
        segment_ids
            .iter()
            .filter(|id| {
                let known = self.segments.contains_key(*id);
                if !known {
                    warn!(segment = %id, "Segment not found in segmentation");
                }
                known
            })
            .cloned()
            .collect()
    }

    fn labelmap_buffer(&self, segment_id: &str) -> Option<&OrientedImage> {
        match self.segments.get(segment_id)?.slots.get(BINARY_LABELMAP)? {
            Slot::Raster(handle) => self.arena.get(*handle),
            Slot::Mesh(_) => None,
        }
    }
}

impl Slot {
    pub(crate) fn kind(&self) -> RepresentationKind {
        match self {
            Slot::Raster(_) => RepresentationKind::Raster,
            Slot::Mesh(_) => RepresentationKind::Mesh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{ConversionParameters, ConversionRule};
    use crate::image::ScalarType;
    use crate::representation::CLOSED_SURFACE;
    use glam::DVec3;
    use pretty_assertions::assert_eq;

    fn block_labelmap(filled: Extent) -> OrientedImage {
        let mut image = OrientedImage::new(Extent::new(0, 9, 0, 9, 0, 9), ScalarType::U8);
        for [i, j, k] in filled.iter() {
            image.set_value(i, j, k, 1.0);
        }
        image
    }

    fn segmentation_with(blocks: &[(&str, Extent)]) -> Segmentation {
        let mut segmentation = Segmentation::default();
        for (name, extent) in blocks {
            let segment = Segment::new(name).with_representation(BINARY_LABELMAP, block_labelmap(*extent));
            segmentation.add_segment(segment, None, None).unwrap();
        }
        segmentation
    }

    #[test]
    fn test_unique_ids_from_names() {
        let mut segmentation = Segmentation::default();
        let a = segmentation.add_empty_segment(None, Some("Tumor"), None).unwrap();
        let b = segmentation
            .add_segment(Segment::new("Tumor"), None, None)
            .unwrap();
        assert_eq!(a, "Segment_1");
        assert_eq!(b, "Tumor");
        let c = segmentation
            .add_segment(Segment::new("Tumor"), None, None)
            .unwrap();
        assert_eq!(c, "Tumor_2");
        assert_eq!(segmentation.segment_id_by_name("tumor"), Some("Segment_1"));
    }

    #[test]
    fn test_duplicate_explicit_id_rejected() {
        let mut segmentation = Segmentation::default();
        segmentation.add_empty_segment(Some("a"), None, None).unwrap();
        let err = segmentation
            .add_segment(Segment::new("x"), Some("a"), None)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_empty_segment_gets_master_payload() {
        let mut segmentation = Segmentation::default();
        let id = segmentation.add_empty_segment(None, None, None).unwrap();
        assert_eq!(segmentation.contained_representation_names(), vec![BINARY_LABELMAP.to_string()]);
        let payload = segmentation.segment_representation(&id, BINARY_LABELMAP).unwrap();
        assert!(payload.is_empty());
        assert_eq!(segmentation.segment(&id).unwrap().color, INVALID_SEGMENT_COLOR);
    }

    #[test]
    fn test_reorder_and_set_index() {
        let mut segmentation = Segmentation::default();
        for id in ["a", "b", "c", "d"] {
            segmentation.add_empty_segment(Some(id), None, None).unwrap();
        }
        segmentation.reorder_segments(&["d".to_string(), "a".to_string()], Some("b"));
        assert_eq!(segmentation.segment_ids(), ["d", "a", "b", "c"]);
        segmentation.set_segment_index("c", 0).unwrap();
        assert_eq!(segmentation.segment_ids(), ["c", "a", "b", "d"]);
        assert!(segmentation.set_segment_index("c", 9).is_err());
    }

    #[test]
    fn test_segments_by_tag() {
        let mut segmentation = Segmentation::default();
        segmentation.add_empty_segment(Some("a"), None, None).unwrap();
        segmentation.add_empty_segment(Some("b"), None, None).unwrap();
        segmentation.set_segment_tag("a", "Organ", "liver").unwrap();
        segmentation.set_segment_tag("b", "Organ", "spleen").unwrap();
        assert_eq!(segmentation.segments_by_tag("Organ", None), vec!["a", "b"]);
        assert_eq!(segmentation.segments_by_tag("Organ", Some("spleen")), vec!["b"]);
        assert!(segmentation.segments_by_tag("Missing", None).is_empty());
        assert!(segmentation.remove_segment_tag("a", "Organ").unwrap());
        assert!(!segmentation.remove_segment_tag("a", "Organ").unwrap());
    }

    #[test]
    fn test_create_representation_is_idempotent() {
        let mut segmentation = segmentation_with(&[("a", Extent::new(2, 5, 2, 5, 2, 5))]);
        segmentation.create_representation(CLOSED_SURFACE, false).unwrap();
        assert!(segmentation.contains_representation(CLOSED_SURFACE));

        let events = segmentation.subscribe();
        segmentation.create_representation(CLOSED_SURFACE, false).unwrap();
        assert!(events.try_recv().is_err());
    }

    /// Binary to surface rule that rejects segments without voxels
    #[derive(Debug, Clone)]
    struct RejectEmpty {
        parameters: ConversionParameters,
    }

    impl ConversionRule for RejectEmpty {
        crate::impl_rule_common!(BINARY_LABELMAP, CLOSED_SURFACE, 500);

        fn convert(&self, source: RepresentationRef<'_>) -> Result<Representation> {
            let labelmap = source.raster(BINARY_LABELMAP)?;
            if labelmap.count_non_zero() == 0 {
                return Err(SegError::conversion(&self.name(), "no voxels"));
            }
            Ok(Representation::Mesh(ClosedSurface::cuboid(DVec3::ZERO, DVec3::ONE)))
        }
    }

    #[test]
    fn test_failed_conversion_keeps_and_reports_earlier_segments() {
        let mut converter = Converter::new();
        converter.add_rule(Box::new(RejectEmpty {
            parameters: ConversionParameters::new(),
        }));
        let mut segmentation = Segmentation::with_converter(BINARY_LABELMAP, converter);
        segmentation
            .add_segment(
                Segment::new("s1").with_representation(BINARY_LABELMAP, block_labelmap(Extent::new(1, 2, 1, 2, 1, 2))),
                Some("s1"),
                None,
            )
            .unwrap();
        segmentation.add_empty_segment(Some("s2"), None, None).unwrap();
        let events = segmentation.subscribe();

        let err = segmentation.create_representation(CLOSED_SURFACE, false).unwrap_err();
        assert_eq!(err.error_code(), "CONVERSION_FAILED");
        assert!(segmentation.segment_representation("s1", CLOSED_SURFACE).is_some());
        assert!(segmentation.segment_representation("s2", CLOSED_SURFACE).is_none());
        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![SegmentationEvent::RepresentationModified {
                segment_id: "s1".to_string()
            }]
        );
    }

    #[test]
    fn test_master_write_invalidates_derived() {
        let mut segmentation = segmentation_with(&[
            ("a", Extent::new(1, 3, 1, 3, 1, 3)),
            ("b", Extent::new(5, 7, 5, 7, 5, 7)),
        ]);
        segmentation.create_representation(CLOSED_SURFACE, false).unwrap();
        let id = segmentation.nth_segment_id(0).unwrap().to_string();
        segmentation
            .set_segment_representation(&id, BINARY_LABELMAP, block_labelmap(Extent::new(0, 1, 0, 1, 0, 1)))
            .unwrap();
        for id in segmentation.segment_ids() {
            assert!(segmentation.segment_representation(id, CLOSED_SURFACE).is_none());
        }
        assert_eq!(segmentation.contained_representation_names(), vec![BINARY_LABELMAP.to_string()]);
    }

    #[test]
    fn test_add_surface_segment_converts_to_master() {
        let mut segmentation = Segmentation::default();
        let mesh = ClosedSurface::cuboid(DVec3::splat(-0.5), DVec3::splat(3.5));
        let id = segmentation
            .add_segment(Segment::new("cube").with_representation(CLOSED_SURFACE, mesh), None, None)
            .unwrap();
        let names = segmentation.contained_representation_names();
        assert!(names.contains(&BINARY_LABELMAP.to_string()));
        assert_eq!(segmentation.segment_labelmap(&id).unwrap().count_non_zero(), 64);
    }

    #[test]
    fn test_add_segment_matches_existing_representations() {
        let mut segmentation = segmentation_with(&[("a", Extent::new(2, 5, 2, 5, 2, 5))]);
        segmentation.create_representation(CLOSED_SURFACE, false).unwrap();
        let id = segmentation
            .add_segment(
                Segment::new("b").with_representation(BINARY_LABELMAP, block_labelmap(Extent::new(1, 2, 1, 2, 1, 2))),
                None,
                None,
            )
            .unwrap();
        assert!(segmentation.segment_representation(&id, CLOSED_SURFACE).is_some());
    }

    #[test]
    fn test_set_master_requires_present_representation() {
        let mut segmentation = segmentation_with(&[("a", Extent::new(2, 5, 2, 5, 2, 5))]);
        assert!(segmentation.set_master_representation_name(CLOSED_SURFACE).is_err());
        segmentation.create_representation(CLOSED_SURFACE, false).unwrap();
        segmentation.set_master_representation_name(CLOSED_SURFACE).unwrap();
        assert_eq!(segmentation.contained_representation_names(), vec![CLOSED_SURFACE.to_string()]);
        assert_eq!(segmentation.master_representation_kind(), Some(RepresentationKind::Mesh));
    }

    #[test]
    fn test_remove_master_representation_rejected() {
        let mut segmentation = segmentation_with(&[("a", Extent::new(2, 5, 2, 5, 2, 5))]);
        assert!(segmentation.remove_representation(BINARY_LABELMAP).is_err());
    }

    #[test]
    fn test_remove_segment_releases_buffer() {
        let mut segmentation = segmentation_with(&[("a", Extent::new(2, 5, 2, 5, 2, 5))]);
        assert_eq!(segmentation.arena.len(), 1);
        let id = segmentation.nth_segment_id(0).unwrap().to_string();
        segmentation.remove_segment(&id).unwrap();
        assert_eq!(segmentation.arena.len(), 0);
        assert!(segmentation.remove_segment(&id).is_err());
    }

    #[test]
    fn test_batch_guard_coalesces_master_events() {
        let mut segmentation = segmentation_with(&[
            ("a", Extent::new(1, 3, 1, 3, 1, 3)),
            ("b", Extent::new(5, 7, 5, 7, 5, 7)),
        ]);
        let events = segmentation.subscribe();
        {
            let mut batch = segmentation.batch();
            for id in batch.segment_ids().to_vec() {
                batch
                    .set_segment_representation(&id, BINARY_LABELMAP, block_labelmap(Extent::new(0, 0, 0, 0, 0, 0)))
                    .unwrap();
            }
            assert!(events.try_recv().is_err());
        }
        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![SegmentationEvent::MasterRepresentationModified {
                segment_ids: vec!["a".to_string(), "b".to_string()]
            }]
        );
        assert!(!segmentation.is_modifying());
    }

    #[test]
    fn test_apply_linear_transform_moves_bounds() {
        let mut segmentation = segmentation_with(&[("a", Extent::new(0, 9, 0, 9, 0, 9))]);
        let before = segmentation.bounds().unwrap();
        segmentation
            .apply_linear_transform(&DMat4::from_translation(DVec3::new(10.0, 0.0, 0.0)))
            .unwrap();
        let after = segmentation.bounds().unwrap();
        assert_eq!(after[0], before[0] + 10.0);
        assert_eq!(after[2], before[2]);
    }

    #[test]
    fn test_common_geometry_oversamples_to_finest() {
        let mut segmentation = Segmentation::default();
        let coarse = block_labelmap(Extent::new(0, 1, 0, 1, 0, 1)).with_spacing(DVec3::splat(2.0));
        let fine = block_labelmap(Extent::new(4, 5, 4, 5, 4, 5));
        segmentation
            .add_segment(Segment::new("coarse").with_representation(BINARY_LABELMAP, coarse.clone()), None, None)
            .unwrap();
        segmentation
            .add_segment(Segment::new("fine").with_representation(BINARY_LABELMAP, fine), None, None)
            .unwrap();
        segmentation
            .set_conversion_parameter(REFERENCE_IMAGE_GEOMETRY, &coarse.geometry().serialize())
            .unwrap();
        let geometry = segmentation
            .determine_common_labelmap_geometry(ExtentComputationMode::UnionOfEffectiveSegments, &[])
            .unwrap()
            .unwrap();
        assert_eq!(geometry.spacing(), DVec3::ONE);
        assert!(!geometry.extent.is_empty());
    }

    #[test]
    fn test_image_takes_common_labelmap_geometry() {
        let segmentation = segmentation_with(&[("a", Extent::new(2, 4, 2, 4, 2, 4))]);
        let mut image = OrientedImage::new(Extent::new(0, 1, 0, 1, 0, 1), ScalarType::U8)
            .with_spacing(DVec3::splat(3.0));
        image.fill(1.0);
        let applied = segmentation
            .set_image_geometry_from_common_labelmap_geometry(
                &mut image,
                ExtentComputationMode::UnionOfEffectiveSegments,
                &[],
            )
            .unwrap();
        assert!(applied);
        assert_eq!(image.spacing(), DVec3::ONE);
        assert_eq!(image.extent(), Extent::new(2, 4, 2, 4, 2, 4));
        assert_eq!(image.count_non_zero(), 0);

        let empty = Segmentation::default();
        let mut untouched = OrientedImage::new(Extent::new(0, 1, 0, 1, 0, 1), ScalarType::U8);
        assert!(!empty
            .set_image_geometry_from_common_labelmap_geometry(
                &mut untouched,
                ExtentComputationMode::UnionOfSegments,
                &[],
            )
            .unwrap());
        assert_eq!(untouched.extent(), Extent::new(0, 1, 0, 1, 0, 1));
    }

    #[test]
    fn test_common_extent_padding() {
        let segmentation = segmentation_with(&[("a", Extent::new(2, 4, 2, 4, 2, 4))]);
        let geometry = ImageGeometry::axis_aligned(DVec3::ZERO, DVec3::ONE, Extent::EMPTY);
        let effective = segmentation
            .determine_common_labelmap_extent(&geometry, &[], true, false)
            .unwrap();
        assert_eq!(effective, Extent::new(2, 4, 2, 4, 2, 4));
        let padded = segmentation
            .determine_common_labelmap_extent(&geometry, &[], true, true)
            .unwrap();
        assert_eq!(padded, Extent::new(1, 5, 1, 5, 1, 5));
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let mut segmentation = segmentation_with(&[("a", Extent::new(2, 4, 2, 4, 2, 4))]);
        let copy = segmentation.deep_copy();
        segmentation.remove_all_segments();
        assert_eq!(copy.number_of_segments(), 1);
        assert_eq!(segmentation.number_of_segments(), 0);
    }

    #[test]
    fn test_copy_segment_between_segmentations() {
        let mut source = segmentation_with(&[("a", Extent::new(2, 4, 2, 4, 2, 4))]);
        source
            .set_conversion_parameter(
                REFERENCE_IMAGE_GEOMETRY,
                &ImageGeometry::axis_aligned(DVec3::ZERO, DVec3::ONE, Extent::new(0, 9, 0, 9, 0, 9)).serialize(),
            )
            .unwrap();
        let mut target = segmentation_with(&[("a", Extent::new(0, 1, 0, 1, 0, 1))]);
        let id = target.copy_segment_from(&mut source, "a", true).unwrap();
        assert_eq!(id, "a_1");
        assert_eq!(source.number_of_segments(), 0);
        assert_eq!(target.segment_labelmap(&id).unwrap().count_non_zero(), 27);
        assert!(!target
            .conversion_parameter(REFERENCE_IMAGE_GEOMETRY)
            .unwrap()
            .is_empty());
    }
}
