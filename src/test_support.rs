// Author: Lukas Bower
// Purpose: Host-side simulated platform and device model for tests and benches.

//! In-memory stand-ins for the collaborators a queue set needs.
//!
//! [`SimPlatform`] implements every collaborator trait over plain host memory
//! and records what the engine asked of it. [`HwModel`] plays the device side
//! of the response queue: it reads free-list descriptors, DMA-writes payloads
//! into the simulated bus memory and appends response records with the right
//! generation bit.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use cohesix_sge_wire::regs::A_SG_KDOORBELL;
use cohesix_sge_wire::{
    v_rspd_txq_cr, CplRxPkt, RspDesc, RspFlags, SopEop, AN_PKT_SIZE, CPL_RX_PKT, F_RSPD_FLQ,
    IMMED_PKT_SIZE, RX_ETH_PAD, TX_MAX_SEGS,
};
use spin::Mutex;

use crate::buffer::{BufferId, DmaMapping, DmaSegment, PacketBuffer, RingMapping, SizeClass};
use crate::error::MapError;
use crate::flow::TxqKind;
use crate::hal::{BufferAllocator, DeliverySink, DmaMapper, Platform, RegisterAccess, RxBundle};
use crate::packet::RxPacket;
use crate::qset::QueueSet;

/// Small-class buffer capacity handed out by the simulator.
pub const SIM_SMALL_BUF: usize = 2048;
/// Jumbo-class buffer capacity handed out by the simulator.
pub const SIM_JUMBO_BUF: usize = 9216;

const SIM_BUF_ID_BASE: u32 = 0x1000_0000;
const SIM_DMA_BASE: u64 = 0x1_0000_0000;
const SIM_RING_BASE: u64 = 0xf000_0000;
const SIM_PAGE: u64 = 4096;

#[derive(Debug, Default)]
struct SimState {
    next_id: u32,
    next_addr: u64,
    next_ring: u64,
    alloc_budget: Option<usize>,
    allocated: u64,
    live: BTreeSet<BufferId>,
    freed: Vec<BufferId>,
    segment_size: Option<usize>,
    map_failure: Option<MapError>,
    regions: BTreeMap<u64, Vec<u8>>,
    maps: usize,
    unmaps: usize,
    ring_failure: Option<&'static str>,
    rings: BTreeMap<u64, &'static str>,
    regs: BTreeMap<u32, u32>,
    reg_log: Vec<(u32, u32)>,
    delivered: Vec<RxPacket>,
    bundles: Vec<Vec<RxPacket>>,
}

/// Simulated platform backed by host memory.
#[derive(Debug, Default)]
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl SimPlatform {
    /// Creates a platform with unlimited buffers and single-segment mappings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits further buffer allocations; `None` removes the limit.
    pub fn set_alloc_budget(&self, budget: Option<usize>) {
        self.state.lock().alloc_budget = budget;
    }

    /// Splits every mapping into segments of at most `bytes`.
    pub fn set_segment_size(&self, bytes: Option<usize>) {
        self.state.lock().segment_size = bytes.filter(|&b| b > 0);
    }

    /// Makes every buffer mapping fail with `err` until cleared.
    pub fn set_map_failure(&self, err: Option<MapError>) {
        self.state.lock().map_failure = err;
    }

    /// Makes mapping of the ring labelled `label` fail.
    pub fn fail_ring(&self, label: Option<&'static str>) {
        self.state.lock().ring_failure = label;
    }

    /// Buffers handed back through `free_buffer`, in order.
    #[must_use]
    pub fn freed_buffers(&self) -> Vec<BufferId> {
        self.state.lock().freed.clone()
    }

    /// Buffers allocated so far.
    #[must_use]
    pub fn allocated_count(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Allocated buffers not yet returned.
    #[must_use]
    pub fn outstanding_buffers(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Buffer mappings created so far.
    #[must_use]
    pub fn mapped_count(&self) -> usize {
        self.state.lock().maps
    }

    /// Buffer mappings released so far.
    #[must_use]
    pub fn unmapped_count(&self) -> usize {
        self.state.lock().unmaps
    }

    /// Buffer mappings still live.
    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Ring mappings still live.
    #[must_use]
    pub fn live_rings(&self) -> usize {
        self.state.lock().rings.len()
    }

    /// Sets the value returned by reads of `offset`.
    pub fn set_reg(&self, offset: u32, value: u32) {
        self.state.lock().regs.insert(offset, value);
    }

    /// Values written to `offset`, in order.
    #[must_use]
    pub fn reg_writes(&self, offset: u32) -> Vec<u32> {
        self.state
            .lock()
            .reg_log
            .iter()
            .filter(|(reg, _)| *reg == offset)
            .map(|(_, value)| *value)
            .collect()
    }

    /// Doorbell writes, in order.
    #[must_use]
    pub fn doorbells(&self) -> Vec<u32> {
        self.reg_writes(A_SG_KDOORBELL)
    }

    /// Forgets every register write seen so far.
    pub fn clear_reg_log(&self) {
        self.state.lock().reg_log.clear();
    }

    /// Writes `bytes` into simulated bus memory at `addr`, as a device would.
    /// Returns the bytes written.
    pub fn dma_write(&self, addr: u64, bytes: &[u8]) -> usize {
        let mut state = self.state.lock();
        let Some((&base, region)) = state.regions.range_mut(..=addr).next_back() else {
            return 0;
        };
        let offset = (addr - base) as usize;
        if offset >= region.len() {
            return 0;
        }
        let count = bytes.len().min(region.len() - offset);
        region[offset..offset + count].copy_from_slice(&bytes[..count]);
        count
    }

    /// Reads `len` bytes of simulated bus memory at `addr`.
    #[must_use]
    pub fn dma_read(&self, addr: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let Some((&base, region)) = state.regions.range(..=addr).next_back() else {
            return Vec::new();
        };
        let offset = (addr - base) as usize;
        let end = (offset + len).min(region.len());
        region.get(offset..end).map(<[u8]>::to_vec).unwrap_or_default()
    }

    /// Takes the packets delivered one at a time.
    pub fn take_delivered(&self) -> Vec<RxPacket> {
        core::mem::take(&mut self.state.lock().delivered)
    }

    /// Takes the bundles delivered so far.
    pub fn take_bundles(&self) -> Vec<Vec<RxPacket>> {
        core::mem::take(&mut self.state.lock().bundles)
    }

    /// Returns every buffer of a delivered packet to storage.
    pub fn free_packet(&self, pkt: RxPacket) {
        for buf in pkt.into_fragments() {
            self.free_buffer(buf);
        }
    }
}

impl DmaMapper for SimPlatform {
    fn map(&self, buf: &PacketBuffer) -> Result<DmaMapping, MapError> {
        let mut state = self.state.lock();
        if let Some(err) = state.map_failure {
            return Err(err);
        }
        let len = if buf.is_empty() { buf.capacity() } else { buf.len() };
        let seg = state.segment_size.unwrap_or(len.max(1));
        let needed = len.div_ceil(seg).max(1);
        if needed > TX_MAX_SEGS {
            return Err(MapError::TooManySegments {
                needed,
                limit: TX_MAX_SEGS,
            });
        }
        let base = SIM_DMA_BASE + state.next_addr;
        state.next_addr += (len as u64).div_ceil(SIM_PAGE).max(1) * SIM_PAGE;
        let mut segments: heapless::Vec<DmaSegment, TX_MAX_SEGS> = heapless::Vec::new();
        let mut offset = 0usize;
        while offset < len {
            let chunk = seg.min(len - offset);
            segments
                .push(DmaSegment {
                    addr: base + offset as u64,
                    len: chunk as u32,
                })
                .map_err(|_| MapError::Exhausted)?;
            offset += chunk;
        }
        let mut region = alloc::vec![0u8; len];
        region[..buf.len()].copy_from_slice(buf.as_slice());
        state.regions.insert(base, region);
        state.maps += 1;
        DmaMapping::new(base, &segments).ok_or(MapError::Exhausted)
    }

    fn unmap(&self, mapping: DmaMapping) {
        let mut state = self.state.lock();
        state.regions.remove(&mapping.handle());
        state.unmaps += 1;
    }

    fn sync_for_cpu(&self, mapping: &DmaMapping, buf: &mut PacketBuffer) {
        let state = self.state.lock();
        if let Some(region) = state.regions.get(&mapping.handle()) {
            let storage = buf.storage_mut();
            let count = region.len().min(storage.len());
            storage[..count].copy_from_slice(&region[..count]);
        }
    }

    fn map_ring(&self, label: &'static str, bytes: usize) -> Result<RingMapping, MapError> {
        let mut state = self.state.lock();
        if state.ring_failure == Some(label) {
            return Err(MapError::Rejected("simulated ring failure"));
        }
        let addr = SIM_RING_BASE + state.next_ring;
        state.next_ring += (bytes as u64).div_ceil(SIM_PAGE).max(1) * SIM_PAGE;
        state.rings.insert(addr, label);
        Ok(RingMapping { addr, bytes, label })
    }

    fn unmap_ring(&self, ring: RingMapping) {
        self.state.lock().rings.remove(&ring.addr);
    }
}

impl RegisterAccess for SimPlatform {
    fn read_reg(&self, offset: u32) -> u32 {
        self.state.lock().regs.get(&offset).copied().unwrap_or(0)
    }

    fn write_reg(&self, offset: u32, value: u32) {
        self.state.lock().reg_log.push((offset, value));
    }
}

impl BufferAllocator for SimPlatform {
    fn alloc_buffer(&self, class: SizeClass) -> Option<PacketBuffer> {
        let mut state = self.state.lock();
        if let Some(budget) = state.alloc_budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let id = BufferId(SIM_BUF_ID_BASE + state.next_id);
        state.next_id += 1;
        state.allocated += 1;
        state.live.insert(id);
        let capacity = match class {
            SizeClass::Small => SIM_SMALL_BUF,
            SizeClass::Jumbo => SIM_JUMBO_BUF,
        };
        Some(PacketBuffer::with_capacity(id, capacity))
    }

    fn free_buffer(&self, buf: PacketBuffer) {
        let mut state = self.state.lock();
        state.live.remove(&buf.id());
        state.freed.push(buf.id());
    }
}

impl DeliverySink for SimPlatform {
    fn deliver(&self, packet: RxPacket) {
        self.state.lock().delivered.push(packet);
    }

    fn deliver_bundle(&self, bundle: RxBundle) {
        self.state.lock().bundles.push(bundle.into_iter().collect());
    }
}

/// Device side of one queue set's response queue and free lists.
#[derive(Debug)]
pub struct HwModel {
    rsp_size: u32,
    rsp_pidx: u32,
    rsp_gen: bool,
    fl_size: [u32; 2],
    fl_cidx: [u32; 2],
}

impl HwModel {
    /// Attaches to a freshly built queue set.
    #[must_use]
    pub fn new<P: Platform>(qs: &QueueSet<P>) -> Self {
        let cfg = qs.config();
        Self {
            rsp_size: cfg.rspq_size,
            rsp_pidx: 0,
            rsp_gen: true,
            fl_size: cfg.fl_size,
            fl_cidx: [0; 2],
        }
    }

    /// Next response slot the device will write.
    #[must_use]
    pub const fn rsp_pidx(&self) -> u32 {
        self.rsp_pidx
    }

    /// Appends `rsp` to the response queue with the current generation.
    pub fn push<P: Platform>(&mut self, qs: &QueueSet<P>, mut rsp: RspDesc) {
        rsp.set_gen(self.rsp_gen);
        qs.hw_write_response(self.rsp_pidx, rsp);
        self.rsp_pidx += 1;
        if self.rsp_pidx == self.rsp_size {
            self.rsp_pidx = 0;
            self.rsp_gen = !self.rsp_gen;
        }
    }

    /// Lands `bytes` in the head buffer of free list `fl` and returns the
    /// queued record describing it. Extra flag bits may be OR-ed in by the
    /// caller before [`HwModel::push`].
    pub fn land<P: Platform>(
        &mut self,
        qs: &QueueSet<P>,
        platform: &SimPlatform,
        fl: usize,
        bytes: &[u8],
        sopeop: SopEop,
        opcode: u8,
    ) -> RspDesc {
        let class = SizeClass::ALL[fl];
        let desc = qs.fl_descriptor(class, self.fl_cidx[fl]);
        platform.dma_write(desc.addr(), bytes);
        self.fl_cidx[fl] = (self.fl_cidx[fl] + 1) % self.fl_size[fl];
        let mut rsp = RspDesc::ZERO;
        rsp.rss.opcode = opcode;
        rsp.set_raw_flags(sopeop.bits());
        let flq = if fl == 1 { F_RSPD_FLQ } else { 0 };
        rsp.set_len_cq(bytes.len() as u32 | flq);
        rsp
    }

    /// Lands a whole Ethernet frame, with pad and CPL header, in free list
    /// `fl` and pushes the record.
    pub fn eth_frame<P: Platform>(
        &mut self,
        qs: &QueueSet<P>,
        platform: &SimPlatform,
        fl: usize,
        frame: &[u8],
        extra_flags: u32,
    ) {
        let bytes = eth_wire_bytes(frame, None);
        let mut rsp = self.land(qs, platform, fl, &bytes, SopEop::SopEop, CPL_RX_PKT);
        rsp.set_raw_flags(rsp.raw_flags() | extra_flags);
        self.push(qs, rsp);
    }

    /// Pushes a record carrying only credits and idle hints.
    pub fn credit<P: Platform>(&mut self, qs: &QueueSet<P>, kind: TxqKind, credits: u32, extra_flags: u32) {
        self.push(qs, credit_record(kind, credits, extra_flags));
    }
}

/// Pure credit record for send queue `kind`.
#[must_use]
pub fn credit_record(kind: TxqKind, credits: u32, extra_flags: u32) -> RspDesc {
    let mut rsp = RspDesc::ZERO;
    rsp.set_raw_flags(v_rspd_txq_cr(kind.index(), credits) | extra_flags);
    rsp
}

/// Immediate-data record carrying `bytes` for message `opcode`.
#[must_use]
pub fn imm_record(opcode: u8, bytes: &[u8]) -> RspDesc {
    let mut rsp = RspDesc::ZERO;
    rsp.rss.opcode = opcode;
    let len = bytes.len().min(IMMED_PKT_SIZE);
    rsp.imm_data[..len].copy_from_slice(&bytes[..len]);
    rsp.set_raw_flags(RspFlags::IMM_DATA_VALID.bits());
    rsp.set_len_cq(len as u32);
    rsp
}

/// Async notification record; `bytes` lands in the payload area.
#[must_use]
pub fn async_record(bytes: &[u8]) -> RspDesc {
    let mut rsp = RspDesc::ZERO;
    let len = bytes.len().min(AN_PKT_SIZE - 16);
    rsp.imm_data[..len].copy_from_slice(&bytes[..len]);
    rsp.set_raw_flags(RspFlags::ASYNC_NOTIF.bits());
    rsp
}

/// Bytes the device writes for a received frame: pad, CPL header, frame.
#[must_use]
pub fn eth_wire_bytes(frame: &[u8], vlan: Option<u16>) -> Vec<u8> {
    let cpl = CplRxPkt {
        iff: 0,
        csum_valid: true,
        ipmi: false,
        vlan_valid: vlan.is_some(),
        fragment: false,
        csum: 0xffff,
        vlan: vlan.unwrap_or(0),
        len: frame.len() as u16,
    };
    let mut out = Vec::with_capacity(RX_ETH_PAD + 8 + frame.len());
    out.extend_from_slice(&[0u8; RX_ETH_PAD]);
    out.extend_from_slice(&cpl.encode());
    out.extend_from_slice(frame);
    out
}

/// Ethernet + IP + TCP frame with `payload` bytes of data.
#[must_use]
pub fn tcp_frame(vlan: Option<u16>, ipv6: bool, payload: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(78 + payload);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    if let Some(tag) = vlan {
        frame.extend_from_slice(&crate::lso::ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&tag.to_be_bytes());
    }
    if ipv6 {
        frame.extend_from_slice(&crate::lso::ETHERTYPE_IPV6.to_be_bytes());
        let mut ip = [0u8; crate::lso::IPV6_HLEN];
        ip[0] = 0x60;
        ip[4..6].copy_from_slice(&((20 + payload) as u16).to_be_bytes());
        ip[6] = crate::lso::IPPROTO_TCP;
        ip[7] = 64;
        frame.extend_from_slice(&ip);
    } else {
        frame.extend_from_slice(&crate::lso::ETHERTYPE_IPV4.to_be_bytes());
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&((40 + payload) as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = crate::lso::IPPROTO_TCP;
        frame.extend_from_slice(&ip);
    }
    let mut tcp = [0u8; 20];
    tcp[12] = 0x50;
    frame.extend_from_slice(&tcp);
    frame.extend((0..payload).map(|i| i as u8));
    frame
}
