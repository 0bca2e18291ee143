//! # Operation Model
//!
//! One [`Operation`] per trace record. Operations are immutable once parsed
//! and keep their trace-order index for the whole run: reorder plans refer
//! to writes by position, descriptors refer to them by `index`.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The kind of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Store,
    Flush,
    Fence,
    Memset,
    Memcpy,
    RegionStart,
    RegionStop,
    RegisterFile,
    Marker,
}

impl OpKind {
    /// Writes are the operations a reorder engine may permute.
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Store | Self::Memset | Self::Memcpy)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Store => "STORE",
            Self::Flush => "FLUSH",
            Self::Fence => "FENCE",
            Self::Memset => "MEMSET",
            Self::Memcpy => "MEMCPY",
            Self::RegionStart => "START",
            Self::RegionStop => "STOP",
            Self::RegisterFile => "REGISTER_FILE",
            Self::Marker => "MARKER",
        };
        f.write_str(tag)
    }
}

/// A half-open address range `[address, address + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub address: u64,
    pub len: u64,
}

impl AddressRange {
    #[inline]
    pub const fn new(address: u64, len: u64) -> Self {
        Self { address, len }
    }

    /// One past the last byte. Saturates instead of wrapping.
    #[inline]
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.address < other.end() && other.address < self.end()
    }

    #[inline]
    pub fn contains(&self, other: &AddressRange) -> bool {
        self.address <= other.address && other.end() <= self.end()
    }

    /// The parts of `self` not covered by `other` (zero, one or two ranges).
    pub fn subtract(&self, other: &AddressRange) -> Vec<AddressRange> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut rest = Vec::with_capacity(2);
        if self.address < other.address {
            rest.push(AddressRange::new(self.address, other.address - self.address));
        }
        if other.end() < self.end() {
            rest.push(AddressRange::new(other.end(), self.end() - other.end()));
        }
        rest
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{:#x}", self.address, self.len)
    }
}

/// A window of traced addresses backed by a region of the target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapping {
    pub path: PathBuf,
    pub base: u64,
    pub size: u64,
    pub file_offset: u64,
}

impl FileMapping {
    /// Translate a traced range into a file range, if it lies inside the window.
    ///
    /// A window whose file offset would overflow the address space maps
    /// nothing.
    pub fn translate(&self, range: &AddressRange) -> Option<AddressRange> {
        let window = AddressRange::new(self.base, self.size);
        if !window.contains(range) {
            return None;
        }
        let address = (range.address - self.base).checked_add(self.file_offset)?;
        address.checked_add(range.len)?;
        Some(AddressRange::new(address, range.len))
    }
}

/// Operation-specific data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    /// Bytes written by a STORE, in memory order.
    Bytes(Vec<u8>),
    /// Fill byte of a MEMSET.
    Fill(u8),
    /// Source address of a MEMCPY.
    Source(u64),
    File(FileMapping),
    /// Annotation text of a MARKER.
    Text(String),
}

/// One trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    index: usize,
    kind: OpKind,
    range: Option<AddressRange>,
    payload: Payload,
}

impl Operation {
    pub fn store(index: usize, address: u64, bytes: Vec<u8>) -> Self {
        Self {
            index,
            kind: OpKind::Store,
            range: Some(AddressRange::new(address, bytes.len() as u64)),
            payload: Payload::Bytes(bytes),
        }
    }

    pub fn flush(index: usize, address: u64, len: u64) -> Self {
        Self {
            index,
            kind: OpKind::Flush,
            range: Some(AddressRange::new(address, len)),
            payload: Payload::None,
        }
    }

    pub fn fence(index: usize) -> Self {
        Self::bare(index, OpKind::Fence)
    }

    pub fn memset(index: usize, address: u64, fill: u8, len: u64) -> Self {
        Self {
            index,
            kind: OpKind::Memset,
            range: Some(AddressRange::new(address, len)),
            payload: Payload::Fill(fill),
        }
    }

    pub fn memcpy(index: usize, dest: u64, source: u64, len: u64) -> Self {
        Self {
            index,
            kind: OpKind::Memcpy,
            range: Some(AddressRange::new(dest, len)),
            payload: Payload::Source(source),
        }
    }

    pub fn region_start(index: usize) -> Self {
        Self::bare(index, OpKind::RegionStart)
    }

    pub fn region_stop(index: usize) -> Self {
        Self::bare(index, OpKind::RegionStop)
    }

    pub fn register_file(index: usize, mapping: FileMapping) -> Self {
        Self {
            index,
            kind: OpKind::RegisterFile,
            range: Some(AddressRange::new(mapping.base, mapping.size)),
            payload: Payload::File(mapping),
        }
    }

    pub fn marker(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            kind: OpKind::Marker,
            range: None,
            payload: Payload::Text(text.into()),
        }
    }

    fn bare(index: usize, kind: OpKind) -> Self {
        Self {
            index,
            kind,
            range: None,
            payload: Payload::None,
        }
    }

    /// Position of this record in the original trace.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Target address range. `None` for fences and markers.
    #[inline]
    pub fn range(&self) -> Option<AddressRange> {
        self.range
    }

    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.kind.is_write()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.index, self.kind)?;
        if let Some(range) = self.range {
            write!(f, " {}", range)?;
        }
        match &self.payload {
            Payload::Fill(b) => write!(f, " fill={:#04x}", b),
            Payload::Source(src) => write!(f, " src={:#x}", src),
            Payload::Text(text) => write!(f, " \"{}\"", text),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Kani Proofs: Flush Accounting
// =============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// **Proof: subtracting a flush never leaves flushed bytes behind**
    ///
    /// Every piece left over stays inside the original range and is disjoint
    /// from the flushed one.
    #[kani::proof]
    #[kani::unwind(3)]
    fn verify_subtract_leaves_only_unflushed_bytes() {
        let pending = AddressRange::new(kani::any(), kani::any());
        let flushed = AddressRange::new(kani::any(), kani::any());
        kani::assume(pending.address < 1 << 16 && pending.len < 1 << 16);
        kani::assume(flushed.address < 1 << 16 && flushed.len < 1 << 16);

        let rest = pending.subtract(&flushed);
        assert!(rest.len() <= 2);
        for piece in &rest {
            assert!(pending.contains(piece));
            assert!(!piece.overlaps(&flushed));
        }
    }

    /// **Proof: a covering flush clears the range**
    #[kani::proof]
    #[kani::unwind(3)]
    fn verify_covering_flush_clears() {
        let pending = AddressRange::new(kani::any(), kani::any());
        let flushed = AddressRange::new(kani::any(), kani::any());
        kani::assume(pending.address < 1 << 16 && pending.len > 0 && pending.len < 1 << 16);
        kani::assume(flushed.address < 1 << 16 && flushed.len < 1 << 17);
        kani::assume(flushed.contains(&pending));

        assert!(pending.subtract(&flushed).is_empty());
    }
}
