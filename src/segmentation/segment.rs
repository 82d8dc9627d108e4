//! Segment metadata and detached segments

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::representation::Representation;

/// Color given to segments created without one
pub const INVALID_SEGMENT_COLOR: [f64; 3] = [0.5, 0.5, 0.5];

/// Identity metadata of a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    pub color: [f64; 3],
    /// Voxel value of the segment inside its binary labelmap layer
    pub label_value: i64,
    pub tags: BTreeMap<String, String>,
}

impl Default for SegmentInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            color: INVALID_SEGMENT_COLOR,
            label_value: 1,
            tags: BTreeMap::new(),
        }
    }
}

impl SegmentInfo {
    pub fn tag(&self, tag: &str) -> Option<&str> {
        self.tags.get(tag).map(String::as_str)
    }
}

/// A segment outside of any segmentation
///
/// Used to hand segments into [`Segmentation::add_segment`] and out of
/// [`Segmentation::extract_segment`]. Raster payloads are private copies.
///
/// [`Segmentation::add_segment`]: super::Segmentation::add_segment
/// [`Segmentation::extract_segment`]: super::Segmentation::extract_segment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segment {
    pub info: SegmentInfo,
    representations: BTreeMap<String, Representation>,
}

impl Segment {
    pub fn new(name: &str) -> Self {
        Self {
            info: SegmentInfo {
                name: name.to_string(),
                ..SegmentInfo::default()
            },
            representations: BTreeMap::new(),
        }
    }

    pub fn with_color(mut self, color: [f64; 3]) -> Self {
        self.info.color = color;
        self
    }

    pub fn with_label_value(mut self, label_value: i64) -> Self {
        self.info.label_value = label_value;
        self
    }

    pub fn with_tag(mut self, tag: &str, value: &str) -> Self {
        self.info.tags.insert(tag.to_string(), value.to_string());
        self
    }

    pub fn with_representation(mut self, name: &str, representation: impl Into<Representation>) -> Self {
        self.add_representation(name, representation);
        self
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn label_value(&self) -> i64 {
        self.info.label_value
    }

    pub fn add_representation(&mut self, name: &str, representation: impl Into<Representation>) {
        self.representations
            .insert(name.to_string(), representation.into());
    }

    pub fn representation(&self, name: &str) -> Option<&Representation> {
        self.representations.get(name)
    }

    pub fn remove_representation(&mut self, name: &str) -> Option<Representation> {
        self.representations.remove(name)
    }

    pub fn contains_representation(&self, name: &str) -> bool {
        self.representations.contains_key(name)
    }

    pub fn representation_names(&self) -> Vec<String> {
        self.representations.keys().cloned().collect()
    }

    pub fn representations(&self) -> impl Iterator<Item = (&str, &Representation)> {
        self.representations.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn into_parts(self) -> (SegmentInfo, BTreeMap<String, Representation>) {
        (self.info, self.representations)
    }

    pub(crate) fn from_parts(info: SegmentInfo, representations: BTreeMap<String, Representation>) -> Self {
        Self {
            info,
            representations,
        }
    }

    /// World bounds over every representation
    pub fn bounds(&self) -> Option<[f64; 6]> {
        self.representations
            .values()
            .filter_map(|r| r.view().bounds())
            .reduce(|a, b| {
                [
                    a[0].min(b[0]),
                    a[1].max(b[1]),
                    a[2].min(b[2]),
                    a[3].max(b[3]),
                    a[4].min(b[4]),
                    a[5].max(b[5]),
                ]
            })
    }
}
