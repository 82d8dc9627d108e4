//! Segmentations: segments, shared labelmap layers and change events

mod arena;
mod container;
mod events;
mod layers;
mod segment;

pub use arena::ImageHandle;
pub use container::{ExtentComputationMode, ModifyBatch, Segmentation};
pub use events::SegmentationEvent;
pub(crate) use layers::clear_label;
pub use segment::{Segment, SegmentInfo, INVALID_SEGMENT_COLOR};
