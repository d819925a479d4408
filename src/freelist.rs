// Author: Lukas Bower
// Purpose: Receive free lists that keep hardware supplied with DMA buffers.

use alloc::boxed::Box;
use alloc::vec::Vec;

use cohesix_sge_wire::regs::{v_egrcntx, A_SG_KDOORBELL};
use cohesix_sge_wire::RxDesc;
use log::{debug, warn};

use crate::buffer::{DmaMapping, PacketBuffer, RingMapping, SizeClass};
use crate::hal::{wmb, Platform};
use crate::ring::{DescRing, Generation, RingRole};

/// Buffers posted by a refill attempted under receive pressure.
pub(crate) const MAX_RX_REFILL: u32 = 16;

/// Receive buffer published to hardware.
#[derive(Debug)]
struct FlEntry {
    buf: PacketBuffer,
    mapping: DmaMapping,
}

/// Point-in-time view of a free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlSnapshot {
    /// Buffer class served.
    pub class: SizeClass,
    /// Ring slots.
    pub size: u32,
    /// Buffers currently owned by hardware.
    pub credits: u32,
    /// Producer index.
    pub pidx: u32,
    /// Consumer index.
    pub cidx: u32,
    /// Generation software stamps on new entries.
    pub gen: Generation,
    /// Allocation or mapping failures seen while refilling.
    pub alloc_failed: u64,
    /// Entries handed back to hardware without delivery.
    pub recycled: u64,
}

/// Ring of receive buffers for one size class.
#[derive(Debug)]
pub(crate) struct FreeList {
    class: SizeClass,
    qset: u32,
    cntxt_id: u32,
    buf_size: u32,
    ring: DescRing<RxDesc>,
    sdesc: Box<[Option<FlEntry>]>,
    ring_map: RingMapping,
    credits: u32,
    alloc_failed: u64,
    recycled: u64,
}

impl FreeList {
    pub(crate) fn new(
        class: SizeClass,
        qset: u32,
        size: u32,
        buf_size: u32,
        ring_map: RingMapping,
    ) -> Self {
        let sdesc: Vec<Option<FlEntry>> = (0..size).map(|_| None).collect();
        Self {
            class,
            qset,
            cntxt_id: qset * 2 + class.index() as u32,
            buf_size,
            ring: DescRing::new(size, RingRole::Producer),
            sdesc: sdesc.into_boxed_slice(),
            ring_map,
            credits: 0,
            alloc_failed: 0,
            recycled: 0,
        }
    }

    pub(crate) fn size(&self) -> u32 {
        self.ring.size()
    }

    pub(crate) fn credits(&self) -> u32 {
        self.credits
    }

    /// Slots not currently holding a buffer.
    pub(crate) fn shortfall(&self) -> u32 {
        self.ring.size() - self.credits
    }

    pub(crate) fn descriptor(&self, idx: u32) -> RxDesc {
        *self.ring.slot(idx % self.ring.size())
    }

    pub(crate) fn snapshot(&self) -> FlSnapshot {
        FlSnapshot {
            class: self.class,
            size: self.ring.size(),
            credits: self.credits,
            pidx: self.ring.pidx(),
            cidx: self.ring.cidx(),
            gen: self.ring.generation(),
            alloc_failed: self.alloc_failed,
            recycled: self.recycled,
        }
    }

    /// Posts up to `n` fresh buffers. Stops early, without error, when the
    /// allocator or mapper runs dry.
    pub(crate) fn refill<P: Platform>(&mut self, platform: &P, n: u32) -> u32 {
        let n = n.min(self.shortfall());
        let mut posted = 0u32;
        while posted < n {
            let Some(buf) = platform.alloc_buffer(self.class) else {
                self.alloc_failed += 1;
                debug!(
                    target: "sge",
                    "[sge] qset{} fl{} allocator empty after {} of {}",
                    self.qset,
                    self.class.index(),
                    posted,
                    n,
                );
                break;
            };
            let mapping = match platform.map(&buf) {
                Ok(mapping) => mapping,
                Err(err) => {
                    self.alloc_failed += 1;
                    warn!(
                        target: "sge",
                        "[sge] qset{} fl{} buffer map failed: {}",
                        self.qset,
                        self.class.index(),
                        err,
                    );
                    platform.free_buffer(buf);
                    break;
                }
            };
            if mapping.nsegs() != 1 {
                self.alloc_failed += 1;
                warn!(
                    target: "sge",
                    "[sge] qset{} fl{} buffer mapped to {} segments, need 1",
                    self.qset,
                    self.class.index(),
                    mapping.nsegs(),
                );
                platform.unmap(mapping);
                platform.free_buffer(buf);
                break;
            }
            self.publish(FlEntry { buf, mapping });
            posted += 1;
        }
        if posted > 0 {
            self.ring_doorbell(platform);
        }
        posted
    }

    /// Hands the head buffer to software, trimmed to `len` bytes.
    pub(crate) fn consume<P: Platform>(&mut self, platform: &P, len: usize) -> Option<PacketBuffer> {
        let entry = self.take_head()?;
        let FlEntry { mut buf, mapping } = entry;
        platform.sync_for_cpu(&mapping, &mut buf);
        platform.unmap(mapping);
        buf.set_len(len);
        Some(buf)
    }

    /// Copies the first `len` bytes of the head buffer into `out` without
    /// giving the buffer up.
    pub(crate) fn copy_head<P: Platform>(&mut self, platform: &P, len: usize, out: &mut PacketBuffer) -> bool {
        let idx = self.ring.cidx() as usize;
        let Some(entry) = self.sdesc[idx].as_mut() else {
            return false;
        };
        platform.sync_for_cpu(&entry.mapping, &mut entry.buf);
        entry.buf.set_len(len);
        out.fill_from(entry.buf.as_slice());
        true
    }

    /// Moves the head buffer back to the producer side so hardware can reuse
    /// it, keeping its existing mapping.
    pub(crate) fn recycle_head<P: Platform>(&mut self, platform: &P) -> bool {
        let Some(entry) = self.take_head() else {
            return false;
        };
        self.publish(entry);
        self.recycled += 1;
        self.ring_doorbell(platform);
        true
    }

    /// Releases every posted buffer and the ring.
    pub(crate) fn release_all<P: Platform>(&mut self, platform: &P) {
        let mut freed = 0u32;
        for slot in self.sdesc.iter_mut() {
            if let Some(FlEntry { buf, mapping }) = slot.take() {
                platform.unmap(mapping);
                platform.free_buffer(buf);
                freed += 1;
            }
        }
        self.credits = 0;
        platform.unmap_ring(self.ring_map);
        debug!(
            target: "sge",
            "[sge] qset{} fl{} released {} buffers",
            self.qset,
            self.class.index(),
            freed,
        );
    }

    fn take_head(&mut self) -> Option<FlEntry> {
        let idx = self.ring.cidx() as usize;
        let entry = self.sdesc[idx].take();
        if entry.is_none() {
            warn!(
                target: "sge",
                "[sge] qset{} fl{} consumed empty slot {}",
                self.qset,
                self.class.index(),
                idx,
            );
            return None;
        }
        self.ring.advance_consumer();
        self.credits -= 1;
        entry
    }

    /// Address and length advertised to hardware. The length is the configured
    /// size, capped by both the buffer and its mapped segment.
    fn posted_range(&self, entry: &FlEntry) -> (u64, u32) {
        let (addr, seg_len) = entry.mapping.first().map_or((0, 0), |seg| (seg.addr, seg.len));
        let len = (entry.buf.capacity() as u32).min(self.buf_size).min(seg_len);
        (addr, len)
    }

    fn publish(&mut self, entry: FlEntry) {
        let (addr, len) = self.posted_range(&entry);
        let gen = self.ring.generation().bit();
        let idx = self.ring.pidx();
        let desc = self.ring.slot_mut(idx);
        desc.set_addr(addr);
        wmb();
        desc.set_len_gen(len, gen);
        self.sdesc[idx as usize] = Some(entry);
        self.ring.advance_producer();
        self.credits += 1;
    }

    fn ring_doorbell<P: Platform>(&self, platform: &P) {
        platform.write_reg(A_SG_KDOORBELL, v_egrcntx(self.cntxt_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SimPlatform;

    fn list(size: u32) -> FreeList {
        let ring_map = RingMapping {
            addr: 0x4000_0000,
            bytes: size as usize * 16,
            label: "fl0",
        };
        FreeList::new(SizeClass::Small, 0, size, 2048, ring_map)
    }

    #[test]
    fn refill_wraps_and_flips_generation() {
        let platform = SimPlatform::new();
        let mut fl = list(48);
        assert_eq!(fl.refill(&platform, 40), 40);
        for _ in 0..30 {
            fl.consume(&platform, 64).expect("posted buffer");
        }
        assert_eq!(fl.credits(), 10);
        assert_eq!(fl.refill(&platform, 32), 32);
        let snap = fl.snapshot();
        assert_eq!(snap.credits, 42);
        assert_eq!(snap.pidx, (40 + 32) % 48);
        assert_eq!(snap.gen, Generation::Zero);
        assert!(!fl.descriptor(0).gen1() && !fl.descriptor(0).gen2());
        assert!(fl.descriptor(47).gen1());
    }

    #[test]
    fn refill_stops_quietly_when_allocator_is_empty() {
        let platform = SimPlatform::new();
        platform.set_alloc_budget(Some(5));
        let mut fl = list(32);
        assert_eq!(fl.refill(&platform, 32), 5);
        assert_eq!(fl.credits(), 5);
        assert_eq!(fl.snapshot().alloc_failed, 1);
    }

    #[test]
    fn split_mapping_is_not_posted() {
        let platform = SimPlatform::new();
        platform.set_segment_size(Some(1024));
        let mut fl = list(32);
        assert_eq!(fl.refill(&platform, 8), 0);
        assert_eq!(fl.credits(), 0);
        assert_eq!(fl.snapshot().alloc_failed, 1);
        assert_eq!(platform.live_mappings(), 0);
        assert_eq!(platform.outstanding_buffers(), 0);

        platform.set_segment_size(Some(4096));
        assert_eq!(fl.refill(&platform, 8), 8);
        assert_eq!(fl.descriptor(0).len(), 2048);
    }

    #[test]
    fn recycled_buffer_returns_to_producer_side() {
        let platform = SimPlatform::new();
        let mut fl = list(32);
        fl.refill(&platform, 32);
        let head = fl.descriptor(0).addr();
        assert!(fl.recycle_head(&platform));
        assert_eq!(fl.credits(), 32);
        assert_eq!(fl.snapshot().cidx, 1);
        assert_eq!(fl.descriptor(0).addr(), head);
        assert!(!fl.descriptor(0).gen1(), "recycled entry carries the next lap's generation");
    }
}
