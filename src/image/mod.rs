//! Oriented images and the resampler
//!
//! Raster representations are stored as [`OrientedImage`]s. The
//! [`resample`] module holds the stateless geometry and voxel algorithms
//! the segmentation container and modifier build on.

pub mod extent;
pub mod geometry;
pub mod oriented;
pub mod resample;

pub use extent::Extent;
pub use geometry::{
    deserialize_image_geometry, matrices_equal, serialize_image_geometry, ImageGeometry,
    GEOMETRY_TOLERANCE,
};
pub use oriented::{OrientedImage, ScalarType};
pub use resample::MergeOperation;

impl From<&OrientedImage> for ImageGeometry {
    fn from(image: &OrientedImage) -> Self {
        image.geometry()
    }
}
