// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Defines the SGE hardware descriptor, record, and register contract.
// Author: Lukas Bower

#![no_std]
#![deny(unsafe_code)]
#![deny(missing_docs)]

//! Bit-level contract shared between the scatter/gather engine and the NIC.
//!
//! Everything in this crate mirrors a layout the device reads or writes:
//! transmit descriptors are sixteen 64-bit flits, free-list descriptors are
//! 16 bytes and response records are 64 bytes. Multi-byte fields are stored
//! big-endian in descriptor memory; accessors convert to host order.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Flits in one transmit descriptor.
pub const TX_DESC_FLITS: usize = 16;
/// Generation bits carried by each transmit descriptor.
pub const SGE_NUM_GENBITS: usize = 2;
/// Flits of a descriptor usable by a work request.
pub const WR_FLITS: usize = TX_DESC_FLITS + 1 - SGE_NUM_GENBITS;
/// Largest work request (in bytes) that fits one descriptor.
pub const WR_LEN: usize = WR_FLITS * 8;
/// Largest payload sent as immediate data behind a two-flit header.
pub const PIO_LEN: usize = (WR_FLITS - 2) * 8;
/// Maximum DMA segments accepted for a single transmit work request.
pub const TX_MAX_SEGS: usize = 36;
/// Maximum descriptors consumed by a single work request.
pub const TX_MAX_DESC: usize = flits_to_desc(3 + sgl_len(TX_MAX_SEGS));
/// Immediate payload bytes carried inside a response record.
pub const IMMED_PKT_SIZE: usize = 47;
/// Bytes of a response record forwarded for an async notification.
pub const AN_PKT_SIZE: usize = 32;
/// Length of the CPL header that prefixes received Ethernet frames.
pub const CPL_RX_PKT_LEN: usize = 8;
/// Alignment pad inserted by hardware ahead of received Ethernet frames.
pub const RX_ETH_PAD: usize = 2;

/// CPL opcode of an Ethernet transmit request.
pub const CPL_TX_PKT: u8 = 0xb2;
/// CPL opcode of a segmentation-offload transmit request.
pub const CPL_TX_PKT_LSO: u8 = 0xb6;
/// CPL opcode of a received Ethernet frame.
pub const CPL_RX_PKT: u8 = 0xad;
/// Opcode stamped on synthesized async notification records.
pub const CPL_ASYNC_NOTIF: u8 = 0xf0;
/// Firmware work-request opcode for tunnelled Ethernet transmits.
pub const FW_WROPCODE_TUNNEL_TX_PKT: u8 = 0x0b;

const_assert_eq!(WR_FLITS, 15);
const_assert_eq!(PIO_LEN, 104);
const_assert_eq!(TX_MAX_DESC, 4);

/// Number of flits occupied by an SGL of `n` entries.
///
/// Entries are packed in pairs: one flit holding both lengths followed by
/// the two addresses. An odd trailing entry omits the second address.
#[must_use]
pub const fn sgl_len(n: usize) -> usize {
    (3 * n) / 2 + (n & 1)
}

/// Descriptors required to carry a work request of `flits` flits.
#[must_use]
pub const fn flits_to_desc(flits: usize) -> usize {
    if flits == 0 {
        0
    } else if flits <= WR_FLITS {
        1
    } else {
        1 + (flits - 2) / (WR_FLITS - 1)
    }
}

/// Packs `(address, length)` pairs into SGL flits, skipping empty segments.
///
/// Returns the number of flits written. `out` must hold at least
/// `sgl_len(n)` flits for `n` non-empty segments.
pub fn pack_sgl<I>(segments: I, out: &mut [u64]) -> usize
where
    I: IntoIterator<Item = (u64, u32)>,
{
    let mut written = 0usize;
    let mut count = 0usize;
    for (addr, len) in segments {
        if len == 0 {
            continue;
        }
        let base = (count / 2) * 3;
        if count & 1 == 0 {
            out[base] = u64::from(len) << 32;
            out[base + 1] = addr;
            written = base + 2;
        } else {
            out[base] |= u64::from(len);
            out[base + 2] = addr;
            written = base + 3;
        }
        count += 1;
    }
    written
}

/// Reads entry `idx` back out of packed SGL flits.
#[must_use]
pub fn sgl_entry(flits: &[u64], idx: usize) -> Option<(u64, u32)> {
    let base = (idx / 2) * 3;
    let lens = *flits.get(base)?;
    let addr = *flits.get(base + 1 + (idx & 1))?;
    let len = if idx & 1 == 0 {
        (lens >> 32) as u32
    } else {
        lens as u32
    };
    if len == 0 {
        return None;
    }
    Some((addr, len))
}

/// Work-request header field encoders.
pub mod wr {
    /// Shift of the firmware opcode in the header high word.
    pub const S_WR_OP: u32 = 24;
    /// Request a completion credit once this work request finishes.
    pub const F_WR_COMPL: u32 = 1 << 21;
    /// Payload is described by an SGL rather than carried inline.
    pub const F_WR_DATATYPE: u32 = 1 << 20;
    /// Last descriptor of a work request.
    pub const F_WR_EOP: u32 = 1 << 12;
    /// First descriptor of a work request.
    pub const F_WR_SOP: u32 = 1 << 11;
    /// Shift of the SGL start-flit field.
    pub const S_WR_SGLSFLT: u32 = 4;
    /// Shift of the trailing byte count field.
    pub const S_WR_BCNTLFLT: u32 = 0;
    /// Generation bit in the header low word.
    pub const F_WR_GEN: u32 = 1 << 31;
    /// Shift of the tunnel id in the header low word.
    pub const S_WR_TID: u32 = 8;
    /// Mask of the length-in-flits field in the header low word.
    pub const M_WR_LEN: u32 = 0xff;

    /// Encodes the firmware opcode.
    #[must_use]
    pub const fn v_wr_op(op: u8) -> u32 {
        (op as u32) << S_WR_OP
    }

    /// Encodes the flit at which the SGL starts.
    #[must_use]
    pub const fn v_wr_sglsflt(flit: u32) -> u32 {
        (flit & 0xf) << S_WR_SGLSFLT
    }

    /// Encodes the number of valid bytes in the final flit.
    #[must_use]
    pub const fn v_wr_bcntlflt(bytes: u32) -> u32 {
        (bytes & 0xf) << S_WR_BCNTLFLT
    }

    /// Encodes the work-request length in flits.
    #[must_use]
    pub const fn v_wr_len(flits: u32) -> u32 {
        flits & M_WR_LEN
    }

    /// Encodes the tunnel id.
    #[must_use]
    pub const fn v_wr_tid(tid: u32) -> u32 {
        (tid & 0xf_ffff) << S_WR_TID
    }

    /// Encodes the generation bit.
    #[must_use]
    pub const fn v_wr_gen(gen: bool) -> u32 {
        if gen {
            F_WR_GEN
        } else {
            0
        }
    }

    /// Decodes the length in flits.
    #[must_use]
    pub const fn g_wr_len(lo: u32) -> u32 {
        lo & M_WR_LEN
    }

    /// Decodes the firmware opcode.
    #[must_use]
    pub const fn g_wr_op(hi: u32) -> u8 {
        (hi >> S_WR_OP) as u8
    }
}

/// CPL transmit control word and LSO info encoders.
pub mod txpkt {
    /// Disable IP header checksum insertion.
    pub const F_TXPKT_IPCSUM_DIS: u32 = 1 << 16;
    /// Disable L4 checksum insertion.
    pub const F_TXPKT_L4CSUM_DIS: u32 = 1 << 17;
    /// VLAN tag field is valid.
    pub const F_TXPKT_VLAN_VLD: u32 = 1 << 18;
    /// Ethernet II encapsulation.
    pub const CPL_ETH_II: u32 = 0;
    /// Ethernet II with an 802.1Q tag.
    pub const CPL_ETH_II_VLAN: u32 = 1;
    /// LSO over IPv6.
    pub const F_LSO_IPV6: u32 = 1 << 26;

    /// Encodes the CPL opcode.
    #[must_use]
    pub const fn v_txpkt_opcode(op: u8) -> u32 {
        (op as u32) << 24
    }

    /// Encodes the egress interface.
    #[must_use]
    pub const fn v_txpkt_intf(intf: u8) -> u32 {
        ((intf as u32) & 0xf) << 20
    }

    /// Encodes the VLAN tag to insert.
    #[must_use]
    pub const fn v_txpkt_vlan(vlan: u16) -> u32 {
        vlan as u32
    }

    /// Encodes the segmentation MSS.
    #[must_use]
    pub const fn v_lso_mss(mss: u16) -> u32 {
        (mss as u32) & 0x3fff
    }

    /// Encodes the TCP header length in 32-bit words.
    #[must_use]
    pub const fn v_lso_tcphdr_words(words: u32) -> u32 {
        (words & 0xf) << 16
    }

    /// Encodes the IP header length in 32-bit words.
    #[must_use]
    pub const fn v_lso_iphdr_words(words: u32) -> u32 {
        (words & 0xf) << 20
    }

    /// Encodes the Ethernet encapsulation type.
    #[must_use]
    pub const fn v_lso_eth_type(kind: u32) -> u32 {
        (kind & 0x3) << 24
    }
}

/// Register offsets and value encoders used by the engine.
pub mod regs {
    /// Egress doorbell.
    pub const A_SG_KDOORBELL: u32 = 0x0;
    /// Response-queue index update and holdoff timer.
    pub const A_SG_GTS: u32 = 0x4;
    /// Response-queue credit return.
    pub const A_SG_RSPQ_CREDIT_RETURN: u32 = 0x8;
    /// Per-response-queue starvation status.
    pub const A_SG_RSPQ_FL_STATUS: u32 = 0x4c;

    /// Select an egress context in a doorbell write.
    pub const F_SELEGRCNTX: u32 = 1 << 31;

    /// Encodes an egress context id.
    #[must_use]
    pub const fn v_egrcntx(ctx: u32) -> u32 {
        ctx & 0xffff
    }

    /// Decodes an egress context id.
    #[must_use]
    pub const fn g_egrcntx(value: u32) -> u32 {
        value & 0xffff
    }

    /// Encodes a response-queue id.
    #[must_use]
    pub const fn v_rspq(id: u32) -> u32 {
        (id & 0x7) << 29
    }

    /// Decodes a response-queue id.
    #[must_use]
    pub const fn g_rspq(value: u32) -> u32 {
        (value >> 29) & 0x7
    }

    /// Encodes a holdoff timer value.
    #[must_use]
    pub const fn v_newtimer(ticks: u32) -> u32 {
        (ticks & 0x1fff) << 16
    }

    /// Encodes a new consumer index.
    #[must_use]
    pub const fn v_newindex(idx: u32) -> u32 {
        idx & 0xffff
    }

    /// Decodes a consumer index.
    #[must_use]
    pub const fn g_newindex(value: u32) -> u32 {
        value & 0xffff
    }

    /// Encodes a credit count.
    #[must_use]
    pub const fn v_credits(credits: u32) -> u32 {
        credits & 0xffff
    }

    /// Decodes a credit count.
    #[must_use]
    pub const fn g_credits(value: u32) -> u32 {
        value & 0xffff
    }
}

/// Decoded work-request header (first flit of every descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WrHeader {
    /// High word: opcode, SOP/EOP, SGL layout and completion request.
    pub hi: u32,
    /// Low word: length, tunnel id and generation.
    pub lo: u32,
}

impl WrHeader {
    /// Packs the header into a flit.
    #[must_use]
    pub const fn to_flit(self) -> u64 {
        ((self.hi as u64) << 32) | self.lo as u64
    }

    /// Unpacks a header flit.
    #[must_use]
    pub const fn from_flit(flit: u64) -> Self {
        Self {
            hi: (flit >> 32) as u32,
            lo: flit as u32,
        }
    }

    /// Generation recorded in the header.
    #[must_use]
    pub const fn gen(self) -> bool {
        self.lo & wr::F_WR_GEN != 0
    }

    /// Length in flits recorded in the header.
    #[must_use]
    pub const fn len_flits(self) -> u32 {
        wr::g_wr_len(self.lo)
    }

    /// Whether this descriptor starts a work request.
    #[must_use]
    pub const fn is_sop(self) -> bool {
        self.hi & wr::F_WR_SOP != 0
    }

    /// Whether this descriptor ends a work request.
    #[must_use]
    pub const fn is_eop(self) -> bool {
        self.hi & wr::F_WR_EOP != 0
    }

    /// Whether a completion was requested.
    #[must_use]
    pub const fn wants_completion(self) -> bool {
        self.hi & wr::F_WR_COMPL != 0
    }
}

/// Transmit descriptor: sixteen big-endian flits.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDesc {
    flit: [u64; TX_DESC_FLITS],
}

const_assert_eq!(core::mem::size_of::<TxDesc>(), 128);

impl Default for TxDesc {
    fn default() -> Self {
        Self::ZERO
    }
}

impl TxDesc {
    /// All-zero descriptor.
    pub const ZERO: Self = Self {
        flit: [0; TX_DESC_FLITS],
    };

    /// Reads flit `idx` in host order.
    #[must_use]
    pub fn flit(&self, idx: usize) -> u64 {
        u64::from_be(self.flit[idx])
    }

    /// Writes flit `idx` from a host-order value.
    pub fn set_flit(&mut self, idx: usize, value: u64) {
        self.flit[idx] = value.to_be();
    }

    /// Decodes the work-request header in flit 0.
    #[must_use]
    pub fn header(&self) -> WrHeader {
        WrHeader::from_flit(self.flit(0))
    }

    /// Writes the work-request header into flit 0.
    pub fn set_header(&mut self, header: WrHeader) {
        self.set_flit(0, header.to_flit());
    }

    /// Second generation bit held in the final flit.
    #[must_use]
    pub fn gen2(&self) -> bool {
        self.flit(TX_DESC_FLITS - 1) & 1 != 0
    }

    /// Writes the second generation bit.
    pub fn set_gen2(&mut self, gen: bool) {
        self.set_flit(TX_DESC_FLITS - 1, u64::from(gen));
    }

    /// Copies raw payload bytes into consecutive flits starting at `first`.
    ///
    /// Bytes keep memory order; the final flit is zero padded.
    pub fn write_bytes(&mut self, first: usize, bytes: &[u8]) {
        for (idx, chunk) in bytes.chunks(8).enumerate() {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            self.flit[first + idx] = u64::from_ne_bytes(raw);
        }
    }

    /// Copies raw payload bytes out of consecutive flits starting at `first`.
    pub fn read_bytes(&self, first: usize, out: &mut [u8]) {
        for (idx, chunk) in out.chunks_mut(8).enumerate() {
            let raw = self.flit[first + idx].to_ne_bytes();
            chunk.copy_from_slice(&raw[..chunk.len()]);
        }
    }
}

/// First generation bit in a free-list length word.
pub const F_FLD_GEN1: u32 = 1 << 31;
/// Second generation bit in a free-list descriptor.
pub const F_FLD_GEN2: u32 = 1;
/// Mask of the buffer length carried beside the first generation bit.
pub const M_FLD_LEN: u32 = 0x7fff_ffff;

/// Free-list descriptor publishing one receive buffer to hardware.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxDesc {
    addr_lo: u32,
    len_gen: u32,
    gen2: u32,
    addr_hi: u32,
}

const_assert_eq!(core::mem::size_of::<RxDesc>(), 16);

impl RxDesc {
    /// Writes the buffer bus address.
    pub fn set_addr(&mut self, addr: u64) {
        self.addr_lo = (addr as u32).to_be();
        self.addr_hi = ((addr >> 32) as u32).to_be();
    }

    /// Buffer bus address.
    #[must_use]
    pub fn addr(&self) -> u64 {
        (u64::from(u32::from_be(self.addr_hi)) << 32) | u64::from(u32::from_be(self.addr_lo))
    }

    /// Writes the length-and-generation word and the second generation bit.
    pub fn set_len_gen(&mut self, len: u32, gen: bool) {
        let gen1 = if gen { F_FLD_GEN1 } else { 0 };
        let gen2 = if gen { F_FLD_GEN2 } else { 0 };
        self.len_gen = ((len & M_FLD_LEN) | gen1).to_be();
        self.gen2 = gen2.to_be();
    }

    /// Buffer length published with the descriptor.
    #[must_use]
    pub fn len(&self) -> u32 {
        u32::from_be(self.len_gen) & M_FLD_LEN
    }

    /// Whether the published length is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First generation bit.
    #[must_use]
    pub fn gen1(&self) -> bool {
        u32::from_be(self.len_gen) & F_FLD_GEN1 != 0
    }

    /// Second generation bit.
    #[must_use]
    pub fn gen2(&self) -> bool {
        u32::from_be(self.gen2) & F_FLD_GEN2 != 0
    }
}

bitflags! {
    /// Single-bit fields of a response record's flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RspFlags: u32 {
        /// Data send queue went idle.
        const TXQ0_GTS = 1 << 7;
        /// Offload send queue went idle.
        const TXQ1_GTS = 1 << 15;
        /// Control send queue went idle.
        const TXQ2_GTS = 1 << 23;
        /// Small free list ran low.
        const FL0_GTS = 1 << 24;
        /// Jumbo free list ran low.
        const FL1_GTS = 1 << 25;
        /// Hardware reported an error for this record.
        const ERR = 1 << 26;
        /// Out-of-band async notification.
        const ASYNC_NOTIF = 1 << 27;
        /// Payload carried inline in the record.
        const IMM_DATA_VALID = 1 << 28;
        /// Record ends a packet.
        const EOP = 1 << 29;
        /// Record starts a packet.
        const SOP = 1 << 30;
    }
}

/// Sleep hints for the three send queues.
pub const RSPD_GTS_MASK: u32 =
    RspFlags::TXQ0_GTS.bits() | RspFlags::TXQ1_GTS.bits() | RspFlags::TXQ2_GTS.bits();
/// Mask of one per-queue credit field.
pub const M_RSPD_TXQ_CR: u32 = 0x7f;
/// Shift of the credit field for send queue `idx` (0 data, 1 offload, 2 control).
pub const S_RSPD_TXQ_CR: [u32; 3] = [0, 8, 16];
/// All control information carried by a response (credits and sleep hints).
pub const RSPD_CTRL_MASK: u32 = RSPD_GTS_MASK
    | (M_RSPD_TXQ_CR << S_RSPD_TXQ_CR[0])
    | (M_RSPD_TXQ_CR << S_RSPD_TXQ_CR[1])
    | (M_RSPD_TXQ_CR << S_RSPD_TXQ_CR[2]);

/// Encodes `credits` for send queue `idx` into a flags word.
#[must_use]
pub const fn v_rspd_txq_cr(idx: usize, credits: u32) -> u32 {
    (credits & M_RSPD_TXQ_CR) << S_RSPD_TXQ_CR[idx]
}

/// Decodes the credits for send queue `idx` from a flags word.
#[must_use]
pub const fn g_rspd_txq_cr(idx: usize, flags: u32) -> u32 {
    (flags >> S_RSPD_TXQ_CR[idx]) & M_RSPD_TXQ_CR
}

/// Selects the jumbo free list in a response length word.
pub const F_RSPD_FLQ: u32 = 1 << 31;
/// Mask of the payload length in a response length word.
pub const M_RSPD_LEN: u32 = 0x7fff_ffff;
/// Generation bit in a response record's trailing byte.
pub const F_RSPD_GEN2: u8 = 1;

/// Packet boundary markers carried by a response record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SopEop {
    /// Middle fragment.
    Neither,
    /// Final fragment.
    Eop,
    /// First fragment of a multi-buffer packet.
    Sop,
    /// Entire packet in one buffer.
    SopEop,
}

impl SopEop {
    /// Extracts the markers from a flags word.
    #[must_use]
    pub const fn from_flags(flags: u32) -> Self {
        let sop = flags & RspFlags::SOP.bits() != 0;
        let eop = flags & RspFlags::EOP.bits() != 0;
        match (sop, eop) {
            (true, true) => Self::SopEop,
            (true, false) => Self::Sop,
            (false, true) => Self::Eop,
            (false, false) => Self::Neither,
        }
    }

    /// Encodes the markers into flags bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::SopEop => RspFlags::SOP.bits() | RspFlags::EOP.bits(),
            Self::Sop => RspFlags::SOP.bits(),
            Self::Eop => RspFlags::EOP.bits(),
            Self::Neither => 0,
        }
    }
}

/// RSS header at the start of every response record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RssHeader {
    /// CPL opcode of the carried message.
    pub opcode: u8,
    /// CPU hint chosen by RSS.
    pub cpu_idx: u8,
    /// Hash type; zero when no hash was computed.
    pub hash_type: u8,
    rsvd: u8,
    hash_val: u32,
}

impl RssHeader {
    /// RSS hash value in host order.
    #[must_use]
    pub fn hash_val(&self) -> u32 {
        u32::from_be(self.hash_val)
    }

    /// Writes the RSS hash value.
    pub fn set_hash_val(&mut self, hash: u32) {
        self.hash_val = hash.to_be();
    }
}

/// Response-queue record written by hardware.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspDesc {
    /// RSS header.
    pub rss: RssHeader,
    flags: u32,
    len_cq: u32,
    /// Inline payload for immediate-data records.
    pub imm_data: [u8; IMMED_PKT_SIZE],
    /// Trailing byte holding the generation bit.
    pub intr_gen: u8,
}

/// Bytes in one response record.
pub const RSP_DESC_LEN: usize = 64;

const_assert_eq!(core::mem::size_of::<RspDesc>(), RSP_DESC_LEN);

impl Default for RspDesc {
    fn default() -> Self {
        Self::ZERO
    }
}

impl RspDesc {
    /// All-zero record.
    pub const ZERO: Self = Self {
        rss: RssHeader {
            opcode: 0,
            cpu_idx: 0,
            hash_type: 0,
            rsvd: 0,
            hash_val: 0,
        },
        flags: 0,
        len_cq: 0,
        imm_data: [0; IMMED_PKT_SIZE],
        intr_gen: 0,
    };

    /// Raw flags word in host order.
    #[must_use]
    pub fn raw_flags(&self) -> u32 {
        u32::from_be(self.flags)
    }

    /// Single-bit flags.
    #[must_use]
    pub fn flags(&self) -> RspFlags {
        RspFlags::from_bits_truncate(self.raw_flags())
    }

    /// Writes the raw flags word.
    pub fn set_raw_flags(&mut self, flags: u32) {
        self.flags = flags.to_be();
    }

    /// Raw length word in host order.
    #[must_use]
    pub fn len_cq(&self) -> u32 {
        u32::from_be(self.len_cq)
    }

    /// Writes the raw length word.
    pub fn set_len_cq(&mut self, len_cq: u32) {
        self.len_cq = len_cq.to_be();
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.len_cq() & M_RSPD_LEN
    }

    /// Whether the record carries no payload length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free list the payload landed in (0 small, 1 jumbo).
    #[must_use]
    pub fn free_list(&self) -> usize {
        usize::from(self.len_cq() & F_RSPD_FLQ != 0)
    }

    /// Generation bit of the record.
    #[must_use]
    pub fn gen(&self) -> bool {
        self.intr_gen & F_RSPD_GEN2 != 0
    }

    /// Writes the generation bit.
    pub fn set_gen(&mut self, gen: bool) {
        self.intr_gen = (self.intr_gen & !F_RSPD_GEN2) | u8::from(gen);
    }

    /// Packet boundary markers.
    #[must_use]
    pub fn sop_eop(&self) -> SopEop {
        SopEop::from_flags(self.raw_flags())
    }

    /// Record bytes in memory order.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RSP_DESC_LEN] {
        let mut out = [0u8; RSP_DESC_LEN];
        out[0] = self.rss.opcode;
        out[1] = self.rss.cpu_idx;
        out[2] = self.rss.hash_type;
        out[3] = self.rss.rsvd;
        out[4..8].copy_from_slice(&self.rss.hash_val.to_ne_bytes());
        out[8..12].copy_from_slice(&self.flags.to_ne_bytes());
        out[12..16].copy_from_slice(&self.len_cq.to_ne_bytes());
        out[16..16 + IMMED_PKT_SIZE].copy_from_slice(&self.imm_data);
        out[RSP_DESC_LEN - 1] = self.intr_gen;
        out
    }
}

/// CPL header prefixing a received Ethernet frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CplRxPkt {
    /// Ingress interface.
    pub iff: u8,
    /// Hardware validated the checksum field.
    pub csum_valid: bool,
    /// Frame is a management (IPMI) frame.
    pub ipmi: bool,
    /// VLAN tag was stripped into `vlan`.
    pub vlan_valid: bool,
    /// Frame is an IP fragment.
    pub fragment: bool,
    /// Hardware-computed checksum.
    pub csum: u16,
    /// Stripped VLAN tag.
    pub vlan: u16,
    /// Frame length reported by hardware.
    pub len: u16,
}

impl CplRxPkt {
    /// Parses the header from the first [`CPL_RX_PKT_LEN`] bytes.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CPL_RX_PKT_LEN || bytes[0] != CPL_RX_PKT {
            return None;
        }
        let bits = bytes[1];
        Some(Self {
            iff: bits & 0x0f,
            csum_valid: bits & 0x10 != 0,
            ipmi: bits & 0x20 != 0,
            vlan_valid: bits & 0x40 != 0,
            fragment: bits & 0x80 != 0,
            csum: u16::from_be_bytes([bytes[2], bytes[3]]),
            vlan: u16::from_be_bytes([bytes[4], bytes[5]]),
            len: u16::from_be_bytes([bytes[6], bytes[7]]),
        })
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; CPL_RX_PKT_LEN] {
        let mut bits = self.iff & 0x0f;
        if self.csum_valid {
            bits |= 0x10;
        }
        if self.ipmi {
            bits |= 0x20;
        }
        if self.vlan_valid {
            bits |= 0x40;
        }
        if self.fragment {
            bits |= 0x80;
        }
        let csum = self.csum.to_be_bytes();
        let vlan = self.vlan.to_be_bytes();
        let len = self.len.to_be_bytes();
        [
            CPL_RX_PKT, bits, csum[0], csum[1], vlan[0], vlan[1], len[0], len[1],
        ]
    }

    /// Checksum verified by hardware.
    #[must_use]
    pub fn checksum_ok(&self) -> bool {
        self.csum_valid && self.csum == 0xffff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flit_to_descriptor_map_matches_two_genbit_layout() {
        assert_eq!(flits_to_desc(1), 1);
        assert_eq!(flits_to_desc(15), 1);
        assert_eq!(flits_to_desc(16), 2);
        assert_eq!(flits_to_desc(29), 2);
        assert_eq!(flits_to_desc(30), 3);
        assert_eq!(flits_to_desc(43), 3);
        assert_eq!(flits_to_desc(44), 4);
    }

    #[test]
    fn sgl_packing_skips_empty_segments() {
        let mut flits = [0u64; 8];
        let segs = [(0x1000u64, 64u32), (0x2000, 0), (0x3000, 128), (0x4000, 32)];
        let written = pack_sgl(segs, &mut flits);
        assert_eq!(written, sgl_len(3));
        assert_eq!(sgl_entry(&flits, 0), Some((0x1000, 64)));
        assert_eq!(sgl_entry(&flits, 1), Some((0x3000, 128)));
        assert_eq!(sgl_entry(&flits, 2), Some((0x4000, 32)));
        assert_eq!(sgl_entry(&flits, 3), None);
    }

    #[test]
    fn response_credit_fields_are_independent() {
        let flags = v_rspd_txq_cr(0, 5) | v_rspd_txq_cr(1, 7) | v_rspd_txq_cr(2, 0x7f);
        assert_eq!(g_rspd_txq_cr(0, flags), 5);
        assert_eq!(g_rspd_txq_cr(1, flags), 7);
        assert_eq!(g_rspd_txq_cr(2, flags), 0x7f);
        assert_eq!(flags & !RSPD_CTRL_MASK, 0);
    }

    #[test]
    fn cpl_rx_header_survives_encoding() {
        let hdr = CplRxPkt {
            iff: 1,
            csum_valid: true,
            vlan_valid: true,
            csum: 0xffff,
            vlan: 42,
            len: 60,
            ..CplRxPkt::default()
        };
        let parsed = CplRxPkt::parse(&hdr.encode()).expect("parse");
        assert_eq!(parsed, hdr);
        assert!(parsed.checksum_ok());
    }

    #[test]
    fn response_bytes_follow_field_layout() {
        let mut rsp = RspDesc::ZERO;
        rsp.rss.opcode = CPL_RX_PKT;
        rsp.set_raw_flags(RspFlags::SOP.bits() | RspFlags::EOP.bits());
        rsp.set_len_cq(0x40);
        rsp.set_gen(true);
        let bytes = rsp.to_bytes();
        assert_eq!(bytes[0], CPL_RX_PKT);
        assert_eq!(&bytes[8..12], &(3u32 << 29).to_be_bytes());
        assert_eq!(&bytes[12..16], &0x40u32.to_be_bytes());
        assert_eq!(bytes[63], 1);
    }

    #[test]
    fn descriptor_bytes_keep_memory_order() {
        let mut desc = TxDesc::ZERO;
        let payload: [u8; 11] = *b"hello-world";
        desc.write_bytes(2, &payload);
        let mut out = [0u8; 11];
        desc.read_bytes(2, &mut out);
        assert_eq!(out, payload);
    }
}
