//! Raster buffer arena
//!
//! Raster representations live in the arena and segments hold handles into
//! it. Two segments share a layer exactly when they hold the same handle.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::image::OrientedImage;

/// Index of a raster buffer in a segmentation's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageHandle(usize);

impl ImageHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Slot storage with free-list reuse
#[derive(Debug, Clone, Default)]
pub(crate) struct LabelmapArena {
    slots: Vec<Option<OrientedImage>>,
    free: Vec<usize>,
}

impl LabelmapArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: OrientedImage) -> ImageHandle {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(image);
                ImageHandle(index)
            }
            None => {
                self.slots.push(Some(image));
                ImageHandle(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, handle: ImageHandle) -> Option<&OrientedImage> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: ImageHandle) -> Option<&mut OrientedImage> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    /// Replace the buffer behind a live handle
    pub fn replace(&mut self, handle: ImageHandle, image: OrientedImage) -> bool {
        match self.slots.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = Some(image);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, handle: ImageHandle) -> Option<OrientedImage> {
        let image = self.slots.get_mut(handle.0)?.take()?;
        self.free.push(handle.0);
        Some(image)
    }

    /// Number of live buffers
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}
