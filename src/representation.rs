//! Representation payloads
//!
//! A segment's shape can be held in several representations at once. Each
//! payload is either a raster ([`OrientedImage`]) or a mesh
//! ([`ClosedSurface`]).

use std::fmt;

use crate::error::{Result, SegError};
use crate::image::OrientedImage;
use crate::mesh::ClosedSurface;

/// Reserved name of the binary labelmap representation
pub const BINARY_LABELMAP: &str = "Binary labelmap";
/// Name of the fractional labelmap representation
pub const FRACTIONAL_LABELMAP: &str = "Fractional labelmap";
/// Reserved name of the closed surface representation
pub const CLOSED_SURFACE: &str = "Closed surface";

/// Payload kind of a representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepresentationKind {
    Raster,
    Mesh,
}

impl RepresentationKind {
    /// Payload kind of a built-in representation name
    pub fn of_name(name: &str) -> Option<Self> {
        match name {
            BINARY_LABELMAP | FRACTIONAL_LABELMAP => Some(RepresentationKind::Raster),
            CLOSED_SURFACE => Some(RepresentationKind::Mesh),
            _ => None,
        }
    }

    /// Empty payload of this kind
    pub fn empty_payload(self) -> Representation {
        match self {
            RepresentationKind::Raster => Representation::Raster(OrientedImage::default()),
            RepresentationKind::Mesh => Representation::Mesh(ClosedSurface::empty()),
        }
    }
}

impl fmt::Display for RepresentationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepresentationKind::Raster => f.write_str("raster"),
            RepresentationKind::Mesh => f.write_str("mesh"),
        }
    }
}

/// Owned representation payload
#[derive(Debug, Clone, PartialEq)]
pub enum Representation {
    Raster(OrientedImage),
    Mesh(ClosedSurface),
}

impl Representation {
    pub fn kind(&self) -> RepresentationKind {
        match self {
            Representation::Raster(_) => RepresentationKind::Raster,
            Representation::Mesh(_) => RepresentationKind::Mesh,
        }
    }

    pub fn view(&self) -> RepresentationRef<'_> {
        match self {
            Representation::Raster(image) => RepresentationRef::Raster(image),
            Representation::Mesh(mesh) => RepresentationRef::Mesh(mesh),
        }
    }

    /// Check whether the payload holds no shape data
    pub fn is_empty(&self) -> bool {
        self.view().is_empty()
    }

    pub fn into_raster(self, name: &str) -> Result<OrientedImage> {
        match self {
            Representation::Raster(image) => Ok(image),
            Representation::Mesh(_) => Err(wrong_type(name, RepresentationKind::Raster)),
        }
    }

    pub fn into_mesh(self, name: &str) -> Result<ClosedSurface> {
        match self {
            Representation::Mesh(mesh) => Ok(mesh),
            Representation::Raster(_) => Err(wrong_type(name, RepresentationKind::Mesh)),
        }
    }
}

impl From<OrientedImage> for Representation {
    fn from(image: OrientedImage) -> Self {
        Representation::Raster(image)
    }
}

impl From<ClosedSurface> for Representation {
    fn from(mesh: ClosedSurface) -> Self {
        Representation::Mesh(mesh)
    }
}

/// Borrowed view of a representation payload
#[derive(Debug, Clone, Copy)]
pub enum RepresentationRef<'a> {
    Raster(&'a OrientedImage),
    Mesh(&'a ClosedSurface),
}

impl<'a> RepresentationRef<'a> {
    pub fn kind(&self) -> RepresentationKind {
        match self {
            RepresentationRef::Raster(_) => RepresentationKind::Raster,
            RepresentationRef::Mesh(_) => RepresentationKind::Mesh,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RepresentationRef::Raster(image) => image.is_empty() || image.count_non_zero() == 0,
            RepresentationRef::Mesh(mesh) => mesh.is_empty(),
        }
    }

    pub fn raster(&self, name: &str) -> Result<&'a OrientedImage> {
        match *self {
            RepresentationRef::Raster(image) => Ok(image),
            RepresentationRef::Mesh(_) => Err(wrong_type(name, RepresentationKind::Raster)),
        }
    }

    pub fn mesh(&self, name: &str) -> Result<&'a ClosedSurface> {
        match *self {
            RepresentationRef::Mesh(mesh) => Ok(mesh),
            RepresentationRef::Raster(_) => Err(wrong_type(name, RepresentationKind::Mesh)),
        }
    }

    pub fn to_representation(&self) -> Representation {
        match *self {
            RepresentationRef::Raster(image) => Representation::Raster(image.clone()),
            RepresentationRef::Mesh(mesh) => Representation::Mesh(mesh.clone()),
        }
    }

    /// World bounds of the payload, `None` when it holds nothing
    pub fn bounds(&self) -> Option<[f64; 6]> {
        match self {
            RepresentationRef::Raster(image) => image.world_bounds(),
            RepresentationRef::Mesh(mesh) => mesh.bounds(),
        }
    }
}

fn wrong_type(name: &str, expected: RepresentationKind) -> SegError {
    SegError::WrongRepresentationType {
        representation: name.to_string(),
        expected: match expected {
            RepresentationKind::Raster => "raster",
            RepresentationKind::Mesh => "mesh",
        },
    }
}
