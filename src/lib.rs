//! segcore - Segmentation Representation Core
//!
//! A [`Segmentation`] owns named segments, each available in several
//! equivalent representations:
//! 1. Binary labelmap - voxels equal to the segment's label value
//! 2. Fractional labelmap - per-voxel inside fraction
//! 3. Closed surface - triangle mesh in world coordinates
//!
//! # Architecture
//!
//! One representation is the master; every other one is derived from it
//! along the cheapest path of the conversion graph and dropped whenever the
//! master changes. Binary labelmaps of several segments may share one voxel
//! buffer (a layer), distinguished by label value.

pub mod cli;
pub mod conversion;
pub mod error;
pub mod image;
pub mod mesh;
pub mod modifier;
pub mod representation;
pub mod segmentation;

pub use conversion::{ConversionPath, ConversionRule, Converter};
pub use error::{Result, SegError};
pub use image::{Extent, ImageGeometry, OrientedImage, ScalarType};
pub use mesh::ClosedSurface;
pub use modifier::{Modifier, ModifyMode, ModifyOutcome};
pub use representation::{
    Representation, RepresentationKind, RepresentationRef, BINARY_LABELMAP, CLOSED_SURFACE,
    FRACTIONAL_LABELMAP,
};
pub use segmentation::{
    ExtentComputationMode, ImageHandle, ModifyBatch, Segment, SegmentInfo, Segmentation,
    SegmentationEvent,
};
