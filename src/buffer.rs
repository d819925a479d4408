// Author: Lukas Bower
// Purpose: Owned packet buffers and the DMA mappings that publish them to hardware.

//! Packet buffers and their DMA mappings.

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;

use cohesix_sge_wire::TX_MAX_SEGS;
use heapless::Vec as HeaplessVec;

/// Receive buffer class served by one of the two free lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// Standard MTU clusters.
    Small,
    /// Jumbo-frame clusters.
    Jumbo,
}

impl SizeClass {
    /// Both classes, in free-list order.
    pub const ALL: [SizeClass; 2] = [SizeClass::Small, SizeClass::Jumbo];

    /// Free-list index serving this class.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Small => 0,
            Self::Jumbo => 1,
        }
    }
}

/// Identifier assigned by the allocator that owns buffer storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Exclusively owned packet buffer.
///
/// A buffer moves into a free-list or send-queue slot when it is published to
/// hardware and only moves out again on the matching completion, so software
/// cannot touch it while the device owns it.
pub struct PacketBuffer {
    id: BufferId,
    data: Box<[u8]>,
    len: usize,
}

impl PacketBuffer {
    /// Creates an empty buffer with `capacity` bytes of storage.
    #[must_use]
    pub fn with_capacity(id: BufferId, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Creates a buffer holding a copy of `bytes`.
    #[must_use]
    pub fn from_slice(id: BufferId, bytes: &[u8]) -> Self {
        Self {
            id,
            data: bytes.to_vec().into_boxed_slice(),
            len: bytes.len(),
        }
    }

    /// Allocator identifier.
    #[must_use]
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Bytes of storage.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Valid payload length.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no payload.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the valid payload length, clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Valid payload.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole storage, for filling before `set_len`.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replaces the payload with `bytes`, truncating to capacity.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.data.len());
        self.data[..count].copy_from_slice(&bytes[..count]);
        self.len = count;
        count
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// One contiguous bus-address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    /// Bus address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
}

/// Device-visible address list for a mapped buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaMapping {
    segments: HeaplessVec<DmaSegment, TX_MAX_SEGS>,
    handle: u64,
}

impl DmaMapping {
    /// Builds a mapping from `segments`; `handle` is opaque to the engine and
    /// returned to the mapper on unmap.
    pub fn new(handle: u64, segments: &[DmaSegment]) -> Option<Self> {
        let segments = HeaplessVec::from_slice(segments).ok()?;
        Some(Self { segments, handle })
    }

    /// Mapper handle.
    #[must_use]
    pub const fn handle(&self) -> u64 {
        self.handle
    }

    /// Address list.
    #[must_use]
    pub fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }

    /// Segments with a non-zero length.
    #[must_use]
    pub fn nsegs(&self) -> usize {
        self.segments.iter().filter(|seg| seg.len != 0).count()
    }

    /// First non-empty segment.
    #[must_use]
    pub fn first(&self) -> Option<DmaSegment> {
        self.segments.iter().copied().find(|seg| seg.len != 0)
    }

    /// Total mapped length.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|seg| u64::from(seg.len)).sum()
    }
}

/// Bus mapping of descriptor ring memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingMapping {
    /// Bus address of slot zero.
    pub addr: u64,
    /// Bytes covered.
    pub bytes: usize,
    /// Label used in diagnostics.
    pub label: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_counts_only_non_empty_segments() {
        let segs = [
            DmaSegment { addr: 0x1000, len: 0 },
            DmaSegment { addr: 0x2000, len: 512 },
            DmaSegment { addr: 0x3000, len: 256 },
        ];
        let mapping = DmaMapping::new(7, &segs).expect("fits");
        assert_eq!(mapping.nsegs(), 2);
        assert_eq!(mapping.first(), Some(segs[1]));
        assert_eq!(mapping.total_len(), 768);
    }

    #[test]
    fn fill_truncates_to_capacity() {
        let mut buf = PacketBuffer::with_capacity(BufferId(1), 4);
        assert_eq!(buf.fill_from(b"abcdef"), 4);
        assert_eq!(buf.as_slice(), b"abcd");
        buf.set_len(99);
        assert_eq!(buf.len(), 4);
    }
}
