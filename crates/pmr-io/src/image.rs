//! # Memory Image
//!
//! An addressable copy of the target file. The replay keeps one image for
//! the committed state; every candidate gets its own clone, has its plan
//! applied, and is written out as a scratch file for the checker.
//!
//! Traced addresses are file offsets unless the trace registers file
//! windows (`REGISTER_FILE`), in which case each write is translated through
//! the window containing it.

use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::Path;

use memmap2::{Mmap, MmapMut};
use thiserror::Error;

use pmr_core::{AddressRange, FileMapping, OpKind, Operation, Payload};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{op} touches {range}, outside the {len}-byte image")]
    OutOfBounds {
        op: String,
        range: AddressRange,
        len: usize,
    },

    #[error("{op} reads {range}, which no registered file window covers")]
    UnmappedSource { op: String, range: AddressRange },
}

/// A mutable byte buffer mirroring the target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryImage {
    bytes: Vec<u8>,
    windows: Vec<FileMapping>,
}

impl MemoryImage {
    /// Load the file at `path` into a fresh image.
    pub fn open(path: &Path) -> Result<Self, ImageError> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self::from_bytes(Vec::new()));
        }

        // SAFETY: read-only mapping, copied out before it is dropped. Nobody
        // else writes the target file while the image is being loaded.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self::from_bytes(map.to_vec()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            windows: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Map a window of traced addresses onto the file.
    pub fn register(&mut self, mapping: FileMapping) {
        tracing::debug!(
            "Registered {} at {:#x}+{:#x} (file offset {:#x})",
            mapping.path.display(),
            mapping.base,
            mapping.size,
            mapping.file_offset
        );
        self.windows.push(mapping);
    }

    /// Apply one operation to the buffer.
    ///
    /// Flushes, fences and markers leave the bytes untouched. Writes to
    /// addresses outside every registered window are dropped.
    pub fn apply(&mut self, op: &Operation) -> Result<(), ImageError> {
        if !op.is_write() {
            return Ok(());
        }
        let Some(range) = op.range() else {
            return Ok(());
        };
        let Some(dest) = self.resolve(op, &range)? else {
            tracing::debug!("Dropping {}: no registered file window covers it", op);
            return Ok(());
        };

        match (op.kind(), op.payload()) {
            (OpKind::Store, Payload::Bytes(bytes)) => {
                self.bytes[dest].copy_from_slice(bytes);
            }
            (OpKind::Memset, Payload::Fill(fill)) => {
                self.bytes[dest].fill(*fill);
            }
            (OpKind::Memcpy, Payload::Source(source)) => {
                let source_range = AddressRange::new(*source, range.len);
                let src = self
                    .resolve(op, &source_range)?
                    .ok_or_else(|| ImageError::UnmappedSource {
                        op: op.to_string(),
                        range: source_range,
                    })?;
                self.bytes.copy_within(src, dest.start);
            }
            _ => {}
        }
        Ok(())
    }

    /// Durably write the buffer to `path`, replacing any previous content.
    pub fn snapshot(&self, path: &Path) -> Result<(), ImageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(self.bytes.len() as u64)?;

        if !self.bytes.is_empty() {
            // SAFETY: the file was just created/truncated by us and is not
            // mapped anywhere else; the map is dropped before returning.
            let mut map = unsafe { MmapMut::map_mut(&file)? };
            map.copy_from_slice(&self.bytes);
            map.flush()?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Buffer indices for a traced range. `Ok(None)` when windows are
    /// registered and none of them covers the range.
    fn resolve(
        &self,
        op: &Operation,
        range: &AddressRange,
    ) -> Result<Option<Range<usize>>, ImageError> {
        let file_range = if self.windows.is_empty() {
            *range
        } else {
            match self.windows.iter().find_map(|w| w.translate(range)) {
                Some(translated) => translated,
                None => return Ok(None),
            }
        };

        if file_range.end() > self.bytes.len() as u64 {
            return Err(ImageError::OutOfBounds {
                op: op.to_string(),
                range: file_range,
                len: self.bytes.len(),
            });
        }
        Ok(Some(file_range.address as usize..file_range.end() as usize))
    }
}

// =============================================================================
// Kani Proofs: Order Independence
// =============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// **Proof: disjoint stores commute**
    ///
    /// Applying two single-byte stores to different addresses yields the same
    /// image in either order.
    #[kani::proof]
    #[kani::unwind(10)]
    fn verify_disjoint_stores_commute() {
        let a_addr: u64 = kani::any();
        let b_addr: u64 = kani::any();
        kani::assume(a_addr < 8 && b_addr < 8 && a_addr != b_addr);

        let a = Operation::store(0, a_addr, vec![kani::any()]);
        let b = Operation::store(1, b_addr, vec![kani::any()]);

        let mut forward = MemoryImage::from_bytes(vec![0; 8]);
        let mut backward = forward.clone();
        forward.apply(&a).unwrap();
        forward.apply(&b).unwrap();
        backward.apply(&b).unwrap();
        backward.apply(&a).unwrap();

        assert!(forward.as_bytes() == backward.as_bytes());
    }
}
