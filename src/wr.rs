// Author: Lukas Bower
// Purpose: Builds work requests into transmit descriptors.

//! Work-request writer.
//!
//! A work request is a header flit, an optional prefix (CPL words or a
//! caller-built offload header) and a body that is either inline bytes or an
//! SGL. Inline requests always fit one descriptor. SGL requests may spill into
//! continuation descriptors; the first descriptor's header and generation
//! flit are written last so hardware never sees a partially built request.

use cohesix_sge_wire::wr::{
    v_wr_bcntlflt, v_wr_gen, v_wr_len, v_wr_sglsflt, F_WR_COMPL, F_WR_DATATYPE, F_WR_EOP,
    F_WR_GEN, F_WR_SOP, M_WR_LEN,
};
use cohesix_sge_wire::{flits_to_desc, pack_sgl, sgl_len, TxDesc, WrHeader, TX_MAX_SEGS, WR_FLITS, WR_LEN};
use heapless::Vec as HeaplessVec;

use crate::buffer::DmaMapping;
use crate::hal::wmb;
use crate::ring::DescRing;

/// Flits of the largest SGL a work request can carry.
pub const SGL_MAX_FLITS: usize = sgl_len(TX_MAX_SEGS);

const HI_ENGINE_BITS: u32 = F_WR_SOP | F_WR_EOP | F_WR_COMPL | F_WR_DATATYPE | (0xf << 4) | 0xf;
const LO_ENGINE_BITS: u32 = F_WR_GEN | M_WR_LEN;

/// Payload portion of a work request.
#[derive(Debug, Clone, Copy)]
pub enum WrBody<'a> {
    /// Nothing beyond the prefix.
    Empty,
    /// Bytes copied into the descriptor.
    Immediate(&'a [u8]),
    /// Buffer described by an SGL.
    Sgl(&'a DmaMapping),
}

/// A work request ready to be written.
#[derive(Debug)]
pub struct WorkRequest<'a> {
    hi: u32,
    lo: u32,
    prefix: HeaplessVec<u8, WR_LEN>,
    body: WrBody<'a>,
}

/// Where a written request landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Index of the first descriptor.
    pub first: u32,
    /// Index of the final descriptor.
    pub last: u32,
    /// Descriptors consumed.
    pub ndesc: u32,
}

impl<'a> WorkRequest<'a> {
    /// Starts a request from a header template. Bits the writer owns (SOP,
    /// EOP, completion, SGL layout, length, generation) are discarded.
    pub fn new(template: WrHeader, body: WrBody<'a>) -> Self {
        Self {
            hi: template.hi & !HI_ENGINE_BITS,
            lo: template.lo & !LO_ENGINE_BITS,
            prefix: HeaplessVec::new(),
            body,
        }
    }

    /// Appends a big-endian prefix flit after the header.
    pub fn push_flit(&mut self, flit: u64) {
        self.push_bytes(&flit.to_be_bytes());
    }

    /// Appends raw prefix bytes after the header. Callers never exceed one
    /// descriptor of prefix.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let pushed = self.prefix.extend_from_slice(bytes).is_ok();
        debug_assert!(pushed, "work-request prefix exceeds one descriptor");
    }

    /// Flits occupied by header and prefix.
    #[must_use]
    pub fn prefix_flits(&self) -> usize {
        1 + self.prefix.len().div_ceil(8)
    }

    /// Total flits, excluding continuation headers.
    #[must_use]
    pub fn flits(&self) -> usize {
        self.prefix_flits()
            + match self.body {
                WrBody::Empty => 0,
                WrBody::Immediate(bytes) => bytes.len().div_ceil(8),
                WrBody::Sgl(mapping) => sgl_len(mapping.nsegs()),
            }
    }

    /// Descriptors the request occupies.
    #[must_use]
    pub fn ndesc(&self) -> u32 {
        match self.body {
            WrBody::Sgl(_) => flits_to_desc(self.flits()) as u32,
            WrBody::Empty | WrBody::Immediate(_) => 1,
        }
    }

    /// Writes the request at the producer index and advances it.
    ///
    /// The caller has checked that `ndesc()` descriptors are free.
    pub fn write(&self, ring: &mut DescRing<TxDesc>, compl: bool) -> Placement {
        match self.body {
            WrBody::Sgl(mapping) => self.write_sgl(ring, mapping, compl),
            WrBody::Empty => self.write_inline(ring, &[], compl),
            WrBody::Immediate(bytes) => self.write_inline(ring, bytes, compl),
        }
    }

    fn write_inline(&self, ring: &mut DescRing<TxDesc>, bytes: &[u8], compl: bool) -> Placement {
        let gen = ring.generation().bit();
        let idx = ring.pidx();
        let flits = self.flits();
        let total = self.prefix.len() + bytes.len();
        let prefix_flits = self.prefix_flits();
        let desc = ring.slot_mut(idx);
        desc.write_bytes(1, &self.prefix);
        desc.write_bytes(prefix_flits, bytes);
        let mut hi = self.hi | F_WR_SOP | F_WR_EOP | v_wr_bcntlflt((total & 7) as u32);
        if compl {
            hi |= F_WR_COMPL;
        }
        wmb();
        desc.set_header(WrHeader {
            hi,
            lo: self.lo | v_wr_len(flits as u32) | v_wr_gen(gen),
        });
        desc.set_gen2(gen);
        ring.advance_producer();
        Placement {
            first: idx,
            last: idx,
            ndesc: 1,
        }
    }

    fn write_sgl(&self, ring: &mut DescRing<TxDesc>, mapping: &DmaMapping, compl: bool) -> Placement {
        let mut sgl = [0u64; SGL_MAX_FLITS];
        let sgl_flits = pack_sgl(
            mapping.segments().iter().map(|seg| (seg.addr, seg.len)),
            &mut sgl,
        );
        let ndesc = self.ndesc();
        let sflit = self.prefix_flits();
        let ogen = ring.generation().bit();
        let first = ring.pidx();
        ring.slot_mut(first).write_bytes(1, &self.prefix);

        let mut hi = self.hi | F_WR_SOP | v_wr_sglsflt(sflit as u32);
        if compl {
            hi |= F_WR_COMPL;
        }

        if ndesc == 1 {
            let desc = ring.slot_mut(first);
            for (i, flit) in sgl[..sgl_flits].iter().enumerate() {
                desc.set_flit(sflit + i, *flit);
            }
            wmb();
            desc.set_header(WrHeader {
                hi: hi | F_WR_EOP | F_WR_DATATYPE,
                lo: self.lo | v_wr_len((sflit + sgl_flits) as u32) | v_wr_gen(ogen),
            });
            desc.set_gen2(ogen);
            ring.advance_producer();
            return Placement {
                first,
                last: first,
                ndesc: 1,
            };
        }

        let mut flits = sflit;
        let mut offset = 0usize;
        let mut remaining = sgl_flits;
        let mut last = first;
        loop {
            let avail = (WR_FLITS - flits).min(remaining);
            let idx = ring.pidx();
            let desc = ring.slot_mut(idx);
            for (i, flit) in sgl[offset..offset + avail].iter().enumerate() {
                desc.set_flit(flits + i, *flit);
            }
            offset += avail;
            remaining -= avail;
            last = idx;
            ring.advance_producer();
            if remaining == 0 {
                break;
            }
            let gen = ring.generation().bit();
            let next = ring.pidx();
            let cont = ring.slot_mut(next);
            cont.set_header(WrHeader {
                hi: self.hi | F_WR_DATATYPE | v_wr_sglsflt(1),
                lo: self.lo | v_wr_len(WR_FLITS.min(remaining + 1) as u32) | v_wr_gen(gen),
            });
            cont.set_gen2(gen);
            flits = 1;
        }

        let tail = ring.slot_mut(last);
        let mut tail_hdr = tail.header();
        tail_hdr.hi |= F_WR_EOP;
        tail.set_header(tail_hdr);
        wmb();
        let head = ring.slot_mut(first);
        head.set_header(WrHeader {
            hi,
            lo: self.lo | v_wr_len(WR_FLITS as u32) | v_wr_gen(ogen),
        });
        head.set_gen2(ogen);
        Placement {
            first,
            last,
            ndesc,
        }
    }
}
