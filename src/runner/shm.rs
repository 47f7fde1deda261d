//! Client-side mapping of the runner's shared feature segment.
//!
//! The runner creates the segment and owns its lifetime. The client opens the
//! named object under the shared-memory root, maps it, and writes feature
//! vectors into it before each `classify_shm` request. Detaching only unmaps;
//! the client never unlinks the segment.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::debug;

use super::error::EimError;
use super::model_info::{ShmDescriptor, ShmElementType};

/// A mapped view of the runner's feature segment.
#[derive(Debug)]
pub struct SharedFeatureBuffer {
    map: MmapMut,
    path: PathBuf,
    element_type: ShmElementType,
    capacity: usize,
}

impl SharedFeatureBuffer {
    /// Map the segment described by the handshake.
    pub fn attach(shm_root: &Path, desc: &ShmDescriptor) -> Result<Self, EimError> {
        let name = desc.name.trim_start_matches('/');
        if name.is_empty() || name.contains('/') {
            return Err(EimError::Protocol(format!(
                "invalid shared memory name: {:?}",
                desc.name
            )));
        }

        let path = shm_root.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                EimError::Protocol(format!(
                    "cannot open shared memory segment {}: {e}",
                    path.display()
                ))
            })?;

        let needed = desc
            .elements
            .checked_mul(desc.element_type.size_bytes())
            .ok_or_else(|| EimError::Protocol("shared memory size overflow".to_string()))?;
        let actual = file.metadata()?.len();
        if actual < needed as u64 {
            return Err(EimError::Protocol(format!(
                "shared memory segment {} is {actual} bytes, expected at least {needed}",
                path.display()
            )));
        }

        // The runner never resizes the segment while the client holds it.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            EimError::Protocol(format!("cannot map shared memory {}: {e}", path.display()))
        })?;

        debug!(
            segment = %path.display(),
            elements = desc.elements,
            element_type = ?desc.element_type,
            "Attached shared feature buffer"
        );

        Ok(Self {
            map,
            path,
            element_type: desc.element_type,
            capacity: desc.elements,
        })
    }

    /// Number of elements agreed at handshake time.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn element_type(&self) -> ShmElementType {
        self.element_type
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `features` at the start of the segment.
    ///
    /// Fails without touching the segment when the vector exceeds capacity.
    pub fn write(&mut self, features: &[f32]) -> Result<usize, EimError> {
        if features.len() > self.capacity {
            return Err(EimError::InvalidInput(format!(
                "feature vector has {} elements but the shared buffer holds {}",
                features.len(),
                self.capacity
            )));
        }

        match self.element_type {
            ShmElementType::Float32 => {
                for (slot, v) in self.map.chunks_exact_mut(4).zip(features) {
                    slot.copy_from_slice(&v.to_ne_bytes());
                }
            }
            ShmElementType::Float64 => {
                for (slot, v) in self.map.chunks_exact_mut(8).zip(features) {
                    slot.copy_from_slice(&f64::from(*v).to_ne_bytes());
                }
            }
        }
        Ok(features.len())
    }

    /// Unmap the segment. The runner keeps the underlying object.
    pub fn detach(self) {
        debug!(segment = %self.path.display(), "Detached shared feature buffer");
        drop(self.map);
    }
}
