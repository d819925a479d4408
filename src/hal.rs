// Author: Lukas Bower
// Purpose: Collaborator traits for mapping, registers, buffers and delivery.

//! Capabilities the engine consumes from its collaborators.
//!
//! The engine never touches bus mapping, register encoding, buffer storage or
//! protocol delivery directly. A driver supplies one [`Platform`] value that
//! implements the four narrow traits below; every method takes `&self` so the
//! send path and the response path can share it from different contexts.

use core::sync::atomic::{fence, Ordering};

use heapless::Vec as HeaplessVec;

use crate::buffer::{DmaMapping, PacketBuffer, RingMapping, SizeClass};
use crate::error::MapError;
use crate::packet::RxPacket;

/// Packets gathered for one offload-class bundle delivery.
pub const RX_BUNDLE_SIZE: usize = 8;

/// Offload-class packets delivered together.
pub type RxBundle = HeaplessVec<RxPacket, RX_BUNDLE_SIZE>;

/// Turns buffers into device-visible address lists.
pub trait DmaMapper: Send + Sync {
    /// Maps `buf` for device reads or writes.
    fn map(&self, buf: &PacketBuffer) -> Result<DmaMapping, MapError>;

    /// Releases a mapping once the device no longer references it. The mapper
    /// may complete the release asynchronously.
    fn unmap(&self, mapping: DmaMapping);

    /// Makes device writes into a mapped receive buffer visible to the CPU.
    /// Coherent platforms have nothing to do.
    fn sync_for_cpu(&self, _mapping: &DmaMapping, _buf: &mut PacketBuffer) {}

    /// Maps descriptor ring memory of `bytes` bytes.
    fn map_ring(&self, label: &'static str, bytes: usize) -> Result<RingMapping, MapError>;

    /// Releases descriptor ring memory.
    fn unmap_ring(&self, ring: RingMapping);
}

/// Device register window.
pub trait RegisterAccess: Send + Sync {
    /// Reads a 32-bit register.
    fn read_reg(&self, offset: u32) -> u32;

    /// Writes a 32-bit register.
    fn write_reg(&self, offset: u32, value: u32);
}

/// Packet buffer storage.
pub trait BufferAllocator: Send + Sync {
    /// Allocates a buffer of the requested class; `None` when exhausted.
    fn alloc_buffer(&self, class: SizeClass) -> Option<PacketBuffer>;

    /// Returns a buffer to storage.
    fn free_buffer(&self, buf: PacketBuffer);
}

/// Host stack entry points for received traffic. Fire-and-forget.
pub trait DeliverySink: Send + Sync {
    /// Delivers an ordinary packet.
    fn deliver(&self, packet: RxPacket);

    /// Delivers a bundle of offload-class packets.
    fn deliver_bundle(&self, bundle: RxBundle);
}

/// Everything a queue set needs from the surrounding driver.
pub trait Platform: DmaMapper + RegisterAccess + BufferAllocator + DeliverySink {}

impl<T> Platform for T where T: DmaMapper + RegisterAccess + BufferAllocator + DeliverySink {}

/// Orders descriptor body writes before the write that hands them to hardware.
#[inline(always)]
pub(crate) fn wmb() {
    fence(Ordering::Release);
}

/// Orders the generation check before reads of the record body.
#[inline(always)]
pub(crate) fn rmb() {
    fence(Ordering::Acquire);
}

/// Hints the cache to fetch `ptr` ahead of use.
#[inline(always)]
#[allow(unsafe_code)]
pub(crate) fn prefetch<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch is a hint and never faults, even on invalid addresses.
    unsafe {
        core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_T0 }>(ptr.cast::<i8>());
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}
