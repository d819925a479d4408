// Author: Lukas Bower
// Purpose: Send queue admission, work-request posting and lazy reclamation.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use cohesix_sge_wire::regs::{v_egrcntx, A_SG_KDOORBELL, F_SELEGRCNTX};
use cohesix_sge_wire::txpkt::{
    v_lso_eth_type, v_lso_iphdr_words, v_lso_mss, v_lso_tcphdr_words, v_txpkt_intf,
    v_txpkt_opcode, v_txpkt_vlan, F_LSO_IPV6, F_TXPKT_IPCSUM_DIS, F_TXPKT_L4CSUM_DIS,
    F_TXPKT_VLAN_VLD,
};
use cohesix_sge_wire::wr::{v_wr_op, v_wr_tid};
use cohesix_sge_wire::{
    TxDesc, WrHeader, CPL_TX_PKT, CPL_TX_PKT_LSO, FW_WROPCODE_TUNNEL_TX_PKT, PIO_LEN,
    TX_MAX_DESC, WR_FLITS, WR_LEN,
};
use log::{debug, info, warn};

use crate::buffer::{DmaMapping, PacketBuffer, RingMapping};
use crate::error::{MalformedReason, SendError};
use crate::flow::{should_restart, FlowControl, TxqKind, TxqState};
use crate::hal::Platform;
use crate::lso::{parse_headers, LsoHeaders};
use crate::packet::TxRequest;
use crate::ring::{DescRing, RingRole};
use crate::wr::{WorkRequest, WrBody};

/// Largest LSO frame sent inline; the LSO word takes one more flit.
const LSO_IMM_LEN: usize = PIO_LEN - 8;

/// Slots admission leaves free beyond a request's own descriptors, so the
/// producer never closes up on the consumer.
pub(crate) const TX_HEADROOM: u32 = 2;

/// What happened to an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Written to the ring and the doorbell rung.
    Posted,
    /// Parked on the pending queue; it posts when the queue restarts.
    Queued,
}

/// Per-queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxqStats {
    /// Requests written to the ring.
    pub sent: u64,
    /// Requests parked on the pending queue.
    pub queued: u64,
    /// Requests dropped as malformed or unmappable.
    pub dropped: u64,
    /// Running to stopped transitions.
    pub stops: u64,
    /// Restart passes executed.
    pub restarts: u64,
    /// Doorbell writes.
    pub doorbells: u64,
}

/// Point-in-time view of a send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxqSnapshot {
    /// Queue identity.
    pub kind: TxqKind,
    /// Ring slots.
    pub size: u32,
    /// Producer index.
    pub pidx: u32,
    /// Consumer (reclaim) index.
    pub cidx: u32,
    /// Descriptors posted and not yet reclaimed.
    pub in_use: u32,
    /// Descriptors ever posted, wrapping.
    pub posted: u32,
    /// Descriptors hardware reported complete, wrapping.
    pub processed: u32,
    /// Descriptors reclaimed, wrapping.
    pub cleaned: u32,
    /// Requests waiting on the pending queue.
    pub pending: usize,
    /// Admission state.
    pub state: TxqState,
    /// Counters.
    pub stats: TxqStats,
}

/// Buffer and mapping owned by the final descriptor of a work request.
#[derive(Debug)]
struct TxOwner {
    buf: PacketBuffer,
    mapping: Option<DmaMapping>,
}

/// Request validated and mapped, ready to post or park.
#[derive(Debug)]
struct PendingTx {
    req: TxRequest,
    mapping: Option<DmaMapping>,
    lso: Option<LsoHeaders>,
}

/// One send queue of a queue set.
#[derive(Debug)]
pub(crate) struct SendQueue {
    kind: TxqKind,
    qset: u32,
    cntxt_id: u32,
    port: u8,
    ring: DescRing<TxDesc>,
    shadow: Box<[Option<TxOwner>]>,
    ring_map: RingMapping,
    posted: u32,
    processed: u32,
    cleaned: u32,
    unacked: u32,
    compl_interval: u32,
    reclaim_thresh: u32,
    pending: VecDeque<PendingTx>,
    stats: TxqStats,
}

impl SendQueue {
    pub(crate) fn new(
        kind: TxqKind,
        qset: u32,
        size: u32,
        ring_map: RingMapping,
        port: u8,
        compl_interval: u32,
        reclaim_thresh: u32,
    ) -> Self {
        let shadow: Vec<Option<TxOwner>> = (0..size).map(|_| None).collect();
        Self {
            kind,
            qset,
            cntxt_id: qset * 3 + kind.index() as u32,
            port,
            ring: DescRing::new(size, RingRole::Producer),
            shadow: shadow.into_boxed_slice(),
            ring_map,
            posted: 0,
            processed: 0,
            cleaned: 0,
            unacked: 0,
            compl_interval,
            reclaim_thresh,
            pending: VecDeque::new(),
            stats: TxqStats::default(),
        }
    }

    /// Descriptors posted and not yet reclaimed.
    pub(crate) fn in_use(&self) -> u32 {
        self.posted.wrapping_sub(self.cleaned)
    }

    /// Descriptors hardware finished that are still held.
    pub(crate) fn reclaimable(&self) -> u32 {
        self.processed.wrapping_sub(self.cleaned)
    }

    fn free(&self) -> u32 {
        self.ring.size() - self.in_use()
    }

    /// Whether `ndesc` descriptors fit while keeping the headroom.
    fn has_room(&self, ndesc: u32) -> bool {
        self.free() >= ndesc + TX_HEADROOM
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn descriptor(&self, idx: u32) -> TxDesc {
        *self.ring.slot(idx % self.ring.size())
    }

    pub(crate) fn snapshot(&self, flow: &FlowControl) -> TxqSnapshot {
        TxqSnapshot {
            kind: self.kind,
            size: self.ring.size(),
            pidx: self.ring.pidx(),
            cidx: self.ring.cidx(),
            in_use: self.in_use(),
            posted: self.posted,
            processed: self.processed,
            cleaned: self.cleaned,
            pending: self.pending.len(),
            state: flow.state(self.kind),
            stats: self.stats,
        }
    }

    /// Credits completion of `credits` descriptors. Credits beyond what is
    /// outstanding are discarded.
    pub(crate) fn add_credits(&mut self, credits: u32) {
        let outstanding = self.in_use() - self.reclaimable();
        let accepted = if credits > outstanding {
            warn!(
                target: "sge",
                "[sge] qset{} {} credit overrun: credits={} outstanding={}",
                self.qset,
                self.kind.label(),
                credits,
                outstanding,
            );
            outstanding
        } else {
            credits
        };
        self.processed = self.processed.wrapping_add(accepted);
    }

    /// Whether the stopped queue has room to resume.
    pub(crate) fn restart_due(&self) -> bool {
        should_restart(self.ring.size(), self.in_use(), self.reclaimable())
    }

    /// Reclaims completed descriptors once enough have accumulated.
    pub(crate) fn reclaim_if_due<P: Platform>(&mut self, platform: &P) -> u32 {
        if self.reclaimable() >= self.reclaim_thresh {
            self.reclaim(platform)
        } else {
            0
        }
    }

    /// Releases every descriptor hardware has finished with, returning the
    /// number of descriptors reclaimed.
    pub(crate) fn reclaim<P: Platform>(&mut self, platform: &P) -> u32 {
        let count = self.reclaimable();
        if count == 0 {
            return 0;
        }
        if self.kind.has_shadow() {
            for _ in 0..count {
                let idx = self.ring.cidx() as usize;
                if let Some(owner) = self.shadow[idx].take() {
                    if let Some(mapping) = owner.mapping {
                        platform.unmap(mapping);
                    }
                    platform.free_buffer(owner.buf);
                }
                self.ring.advance_consumer();
            }
        } else {
            self.ring.advance_consumer_by(count);
        }
        self.cleaned = self.cleaned.wrapping_add(count);
        debug!(
            target: "sge",
            "[sge] qset{} {} reclaimed {} desc cidx={} in_use={}",
            self.qset,
            self.kind.label(),
            count,
            self.ring.cidx(),
            self.in_use(),
        );
        count
    }

    /// Validates, maps and posts or parks `req`.
    pub(crate) fn admit<P: Platform>(
        &mut self,
        platform: &P,
        flow: &FlowControl,
        req: TxRequest,
    ) -> Result<Admission, SendError> {
        self.reclaim_if_due(platform);
        let item = self.prepare(platform, req)?;

        if flow.state(self.kind) == TxqState::Stopped || self.must_follow_pending(&item) {
            self.park(item);
            return Ok(Admission::Queued);
        }

        let ndesc = wr_for(&item, self.port, self.cntxt_id).ndesc();
        if !self.has_room(ndesc) {
            self.reclaim(platform);
        }
        if !self.has_room(ndesc) {
            if flow.stop(self.kind) {
                self.stats.stops += 1;
                info!(
                    target: "sge",
                    "[sge] qset{} {} stopped: need={} free={} pending={}",
                    self.qset,
                    self.kind.label(),
                    ndesc,
                    self.free(),
                    self.pending.len() + 1,
                );
            }
            self.park(item);
            return Ok(Admission::Queued);
        }

        self.post(platform, item);
        self.ring_doorbell(platform);
        Ok(Admission::Posted)
    }

    /// Replays the pending queue in order after a restart was scheduled.
    pub(crate) fn restart<P: Platform>(&mut self, platform: &P, flow: &FlowControl) -> usize {
        self.reclaim(platform);
        self.stats.restarts += 1;
        let mut replayed = 0usize;
        while let Some(item) = self.pending.pop_front() {
            let ndesc = wr_for(&item, self.port, self.cntxt_id).ndesc();
            if !self.has_room(ndesc) {
                self.pending.push_front(item);
                if flow.stop(self.kind) {
                    self.stats.stops += 1;
                }
                break;
            }
            self.post(platform, item);
            replayed += 1;
        }
        if replayed > 0 {
            self.ring_doorbell(platform);
        }
        info!(
            target: "sge",
            "[sge] qset{} {} restart replayed={} still_pending={} state={:?}",
            self.qset,
            self.kind.label(),
            replayed,
            self.pending.len(),
            flow.state(self.kind),
        );
        replayed
    }

    /// Re-rings the doorbell when hardware went idle with work outstanding.
    pub(crate) fn kick_if_outstanding<P: Platform>(&mut self, platform: &P) -> bool {
        if self.posted == self.processed {
            return false;
        }
        self.ring_doorbell(platform);
        true
    }

    /// Releases every buffer, mapping and the ring itself.
    pub(crate) fn release_all<P: Platform>(&mut self, platform: &P) {
        let mut freed = 0usize;
        for slot in self.shadow.iter_mut() {
            if let Some(owner) = slot.take() {
                if let Some(mapping) = owner.mapping {
                    platform.unmap(mapping);
                }
                platform.free_buffer(owner.buf);
                freed += 1;
            }
        }
        let parked = self.pending.len();
        while let Some(item) = self.pending.pop_front() {
            if let Some(mapping) = item.mapping {
                platform.unmap(mapping);
            }
            if let Some(buf) = item.req.into_buffers() {
                platform.free_buffer(buf);
            }
        }
        self.cleaned = self.posted;
        self.processed = self.posted;
        platform.unmap_ring(self.ring_map);
        debug!(
            target: "sge",
            "[sge] qset{} {} released in_flight={} pending={}",
            self.qset,
            self.kind.label(),
            freed,
            parked,
        );
    }

    fn must_follow_pending(&self, item: &PendingTx) -> bool {
        match item.req.dest() {
            Some(dest) => self.pending.iter().any(|p| p.req.dest() == Some(dest)),
            None => !self.pending.is_empty(),
        }
    }

    fn park(&mut self, item: PendingTx) {
        self.stats.queued += 1;
        self.pending.push_back(item);
    }

    fn ring_doorbell<P: Platform>(&mut self, platform: &P) {
        platform.write_reg(A_SG_KDOORBELL, F_SELEGRCNTX | v_egrcntx(self.cntxt_id));
        self.stats.doorbells += 1;
    }

    fn take_compl(&mut self, ndesc: u32) -> bool {
        self.unacked += ndesc;
        if self.unacked >= self.compl_interval {
            self.unacked = 0;
            true
        } else {
            false
        }
    }

    fn post<P: Platform>(&mut self, platform: &P, item: PendingTx) {
        let wr = wr_for(&item, self.port, self.cntxt_id);
        let compl = self.take_compl(wr.ndesc());
        let placement = wr.write(&mut self.ring, compl);
        self.posted = self.posted.wrapping_add(placement.ndesc);
        self.stats.sent += 1;
        let PendingTx { req, mapping, .. } = item;
        match (req.into_buffers(), mapping) {
            (Some(buf), Some(mapping)) => {
                self.shadow[placement.last as usize] = Some(TxOwner {
                    buf,
                    mapping: Some(mapping),
                });
            }
            (Some(buf), None) => platform.free_buffer(buf),
            (None, Some(mapping)) => platform.unmap(mapping),
            (None, None) => {}
        }
    }

    fn drop_request<P: Platform>(&mut self, platform: &P, req: TxRequest, err: SendError) -> SendError {
        self.stats.dropped += 1;
        warn!(
            target: "sge",
            "[sge] qset{} {} dropped request len={}: {}",
            self.qset,
            self.kind.label(),
            req.len(),
            err,
        );
        if let Some(buf) = req.into_buffers() {
            platform.free_buffer(buf);
        }
        err
    }

    fn prepare<P: Platform>(&mut self, platform: &P, req: TxRequest) -> Result<PendingTx, SendError> {
        let lso = match validate(&req) {
            Ok(lso) => lso,
            Err(reason) => {
                return Err(self.drop_request(platform, req, SendError::Malformed(reason)));
            }
        };
        if !needs_mapping(&req) {
            return Ok(PendingTx {
                req,
                mapping: None,
                lso,
            });
        }
        let mapped = match req.dma_buffer() {
            Some(buf) => platform.map(buf),
            None => {
                return Ok(PendingTx {
                    req,
                    mapping: None,
                    lso,
                })
            }
        };
        let mapping = match mapped {
            Ok(mapping) => mapping,
            Err(err) => return Err(self.drop_request(platform, req, SendError::Mapping(err))),
        };
        let reason = if let Some(hdrs) = lso {
            let first = mapping.first().map_or(0, |seg| seg.len as usize);
            (first < hdrs.hdr_len).then_some(MalformedReason::LsoHeaderSplit)
        } else {
            None
        };
        let item = PendingTx {
            req,
            mapping: Some(mapping),
            lso,
        };
        let reason = reason.or_else(|| {
            (wr_for(&item, self.port, self.cntxt_id).ndesc() as usize > TX_MAX_DESC)
                .then_some(MalformedReason::OffloadOversized)
        });
        match reason {
            None => Ok(item),
            Some(reason) => {
                if let Some(mapping) = item.mapping {
                    platform.unmap(mapping);
                }
                Err(self.drop_request(platform, item.req, SendError::Malformed(reason)))
            }
        }
    }
}

/// Checks request shape before any resources are committed.
fn validate(req: &TxRequest) -> Result<Option<LsoHeaders>, MalformedReason> {
    match req {
        TxRequest::Data(pkt) => {
            if pkt.is_empty() {
                return Err(MalformedReason::EmptyPacket);
            }
            match pkt.tso_mss() {
                None => Ok(None),
                Some(0) => Err(MalformedReason::LsoZeroMss),
                Some(_) => parse_headers(pkt.buffer().as_slice()).map(Some),
            }
        }
        TxRequest::Offload(ofld) => {
            let prefix = ofld.prefix().len();
            if prefix < 8 || prefix % 8 != 0 {
                return Err(MalformedReason::OffloadHeaderUnaligned);
            }
            match ofld.payload() {
                None if prefix > WR_LEN => Err(MalformedReason::OffloadOversized),
                None => Ok(None),
                Some(payload) if payload.is_empty() => Err(MalformedReason::EmptyPacket),
                Some(_) if prefix / 8 >= WR_FLITS => Err(MalformedReason::OffloadOversized),
                Some(_) => Ok(None),
            }
        }
        TxRequest::Control(ctrl) => {
            if ctrl.bytes().is_empty() {
                Err(MalformedReason::EmptyPacket)
            } else if ctrl.bytes().len() > WR_LEN {
                Err(MalformedReason::ControlOversized)
            } else {
                Ok(None)
            }
        }
    }
}

fn needs_mapping(req: &TxRequest) -> bool {
    match req {
        TxRequest::Data(pkt) => {
            let limit = if pkt.tso_mss().is_some() {
                LSO_IMM_LEN
            } else {
                PIO_LEN
            };
            pkt.len() > limit
        }
        TxRequest::Offload(ofld) => ofld.payload().is_some(),
        TxRequest::Control(_) => false,
    }
}

/// Builds the work request for a prepared item.
fn wr_for(item: &PendingTx, port: u8, tid: u32) -> WorkRequest<'_> {
    match &item.req {
        TxRequest::Data(pkt) => {
            let template = WrHeader {
                hi: v_wr_op(FW_WROPCODE_TUNNEL_TX_PKT),
                lo: v_wr_tid(tid),
            };
            let mut wr = WorkRequest::new(template, body_for(item, pkt.buffer().as_slice()));
            let mut cntrl = v_txpkt_intf(port);
            if !pkt.checksum_offload() {
                cntrl |= F_TXPKT_IPCSUM_DIS | F_TXPKT_L4CSUM_DIS;
            }
            if let Some(tag) = pkt.vlan() {
                cntrl |= F_TXPKT_VLAN_VLD | v_txpkt_vlan(tag);
            }
            let len = pkt.len() as u64;
            match (item.lso, pkt.tso_mss()) {
                (Some(hdrs), Some(mss)) => {
                    cntrl |= v_txpkt_opcode(CPL_TX_PKT_LSO);
                    let mut info = v_lso_mss(mss)
                        | v_lso_eth_type(hdrs.eth_type)
                        | v_lso_iphdr_words(hdrs.ip_words)
                        | v_lso_tcphdr_words(hdrs.tcp_words);
                    if hdrs.ipv6 {
                        info |= F_LSO_IPV6;
                    }
                    wr.push_flit((u64::from(cntrl) << 32) | len);
                    wr.push_flit(u64::from(info));
                }
                _ => {
                    cntrl |= v_txpkt_opcode(CPL_TX_PKT);
                    wr.push_flit((u64::from(cntrl) << 32) | len);
                }
            }
            wr
        }
        TxRequest::Offload(ofld) => {
            let (template, rest) = split_header(ofld.prefix());
            let mut wr = WorkRequest::new(template, body_for(item, &[]));
            wr.push_bytes(rest);
            wr
        }
        TxRequest::Control(ctrl) => {
            let (template, rest) = split_header(ctrl.bytes());
            let mut wr = WorkRequest::new(template, WrBody::Empty);
            wr.push_bytes(rest);
            wr
        }
    }
}

fn body_for<'a>(item: &'a PendingTx, bytes: &'a [u8]) -> WrBody<'a> {
    match item.mapping.as_ref() {
        Some(mapping) => WrBody::Sgl(mapping),
        None if bytes.is_empty() => WrBody::Empty,
        None => WrBody::Immediate(bytes),
    }
}

/// Splits caller bytes into the header flit and what follows it.
fn split_header(bytes: &[u8]) -> (WrHeader, &[u8]) {
    let mut raw = [0u8; 8];
    let head = bytes.len().min(8);
    raw[..head].copy_from_slice(&bytes[..head]);
    (WrHeader::from_flit(u64::from_be_bytes(raw)), &bytes[head..])
}
