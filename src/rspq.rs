// Author: Lukas Bower
// Purpose: Response-queue scan that dispatches records, returns credit and feeds receive traffic upward.

//! Response-queue processing.
//!
//! Hardware writes one record per event. Each record is exactly one of an
//! async notification, inline (immediate) data, a packet landed in a free
//! list buffer, or a pure credit update. Whatever the kind, the control bits
//! of the record carry completion credit and idle hints for the three send
//! queues; those are applied before the consumer index moves on.

use core::mem;

use cohesix_sge_wire::regs::{
    v_credits, v_newindex, v_newtimer, v_rspq, A_SG_GTS, A_SG_RSPQ_CREDIT_RETURN,
};
use cohesix_sge_wire::{
    g_rspd_txq_cr, CplRxPkt, RspDesc, RspFlags, SopEop, AN_PKT_SIZE, CPL_ASYNC_NOTIF,
    CPL_RX_PKT, CPL_RX_PKT_LEN, IMMED_PKT_SIZE, RSPD_CTRL_MASK, RSPD_GTS_MASK, RX_ETH_PAD,
};
use log::{debug, warn};
use spin::Mutex;

use crate::buffer::{PacketBuffer, RingMapping, SizeClass};
use crate::config::SgeConfig;
use crate::flow::{FlowControl, TxqKind, TxqState};
use crate::freelist::{FreeList, MAX_RX_REFILL};
use crate::hal::{prefetch, rmb, Platform, RxBundle};
use crate::packet::{RxClass, RxMeta, RxPacket, RxStatus};
use crate::ring::{DescRing, Generation, RingRole, SlotState};
use crate::txq::SendQueue;

/// Holdoff requested after a pass stalls on buffer allocation.
pub const NOMEM_INTR_DELAY: u32 = 2500;

/// The four mutually exclusive record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Out-of-band event; the record itself is the payload.
    AsyncNotification,
    /// Payload carried inside the record.
    Immediate,
    /// Payload landed in a free-list buffer.
    Queued,
    /// Credit and idle hints only.
    PureCredit,
}

impl RecordKind {
    /// Classifies a record.
    #[must_use]
    pub fn classify(rsp: &RspDesc) -> Self {
        let flags = rsp.flags();
        if flags.contains(RspFlags::ASYNC_NOTIF) {
            Self::AsyncNotification
        } else if flags.contains(RspFlags::IMM_DATA_VALID) {
            Self::Immediate
        } else if rsp.len_cq() != 0 {
            Self::Queued
        } else {
            Self::PureCredit
        }
    }
}

/// Response-queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RspqStats {
    /// Pure credit records.
    pub pure_rsps: u64,
    /// Immediate-data records.
    pub imm_data: u64,
    /// Async notifications.
    pub async_notif: u64,
    /// Ethernet packets dropped under free-list pressure.
    pub rx_drops: u64,
    /// Records flagged with a hardware error.
    pub hw_errors: u64,
    /// Passes stopped for lack of packet memory.
    pub nomem: u64,
    /// Starvation reports acted on by the maintenance timer.
    pub starved: u64,
    /// Interrupts that found no new record.
    pub unhandled_irqs: u64,
    /// Continuation fragments with no open packet.
    pub orphan_frags: u64,
    /// Credit-return register writes.
    pub credit_returns: u64,
}

/// Point-in-time view of the response queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspqSnapshot {
    /// Ring slots.
    pub size: u32,
    /// Consumer index.
    pub cidx: u32,
    /// Generation expected on the next fresh record.
    pub gen: Generation,
    /// Records consumed and not yet returned to hardware.
    pub credits: u32,
    /// Holdoff written with the next index update.
    pub next_holdoff: u32,
    /// Counters.
    pub stats: RspqStats,
}

/// Summary of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Records consumed.
    pub work_done: usize,
    /// The scan ran out of fresh records before the budget.
    pub idle: bool,
    /// The scan stopped on a record that needs packet memory.
    pub nomem: bool,
}

/// Send-side state a pass touches while it applies credit.
pub(crate) struct TxSide<'a, P> {
    pub(crate) platform: &'a P,
    pub(crate) txq: &'a [Mutex<SendQueue>; 3],
    pub(crate) flow: &'a FlowControl,
    pub(crate) cfg: &'a SgeConfig,
}

/// Ring of records written by hardware.
#[derive(Debug)]
pub(crate) struct ResponseQueue {
    cntxt_id: u32,
    ring: DescRing<RspDesc>,
    ring_map: RingMapping,
    credits: u32,
    holdoff_tmr: u32,
    next_holdoff: u32,
    rx_head: Option<RxPacket>,
    stats: RspqStats,
}

impl ResponseQueue {
    pub(crate) fn new(cntxt_id: u32, size: u32, ring_map: RingMapping, holdoff_tmr: u32) -> Self {
        Self {
            cntxt_id,
            ring: DescRing::new(size, RingRole::Consumer),
            ring_map,
            credits: 0,
            holdoff_tmr,
            next_holdoff: holdoff_tmr,
            rx_head: None,
            stats: RspqStats::default(),
        }
    }

    pub(crate) fn snapshot(&self) -> RspqSnapshot {
        RspqSnapshot {
            size: self.ring.size(),
            cidx: self.ring.cidx(),
            gen: self.ring.generation(),
            credits: self.credits,
            next_holdoff: self.next_holdoff,
            stats: self.stats,
        }
    }

    /// Whether a fresh record waits at the consumer index.
    pub(crate) fn has_fresh(&self) -> bool {
        let gen = Generation::from_bit(self.ring.consumer_slot().gen());
        self.ring.slot_state(gen) == SlotState::Fresh
    }

    pub(crate) fn note_unhandled(&mut self) {
        self.stats.unhandled_irqs += 1;
    }

    /// Writes the new consumer index and the next holdoff.
    pub(crate) fn write_gts<P: Platform>(&mut self, platform: &P) {
        platform.write_reg(
            A_SG_GTS,
            v_rspq(self.cntxt_id) | v_newtimer(self.next_holdoff) | v_newindex(self.ring.cidx()),
        );
        self.next_holdoff = self.holdoff_tmr;
    }

    /// Hands one held-back credit to a queue hardware reports as starved.
    pub(crate) fn relieve_starvation<P: Platform>(&mut self, platform: &P) -> bool {
        if self.credits == 0 {
            return false;
        }
        self.credits -= 1;
        self.stats.starved += 1;
        platform.write_reg(A_SG_RSPQ_CREDIT_RETURN, v_rspq(self.cntxt_id) | v_credits(1));
        true
    }

    /// Writes a record as hardware would.
    #[cfg(any(test, feature = "test-support"))]
    pub(crate) fn hw_write(&mut self, idx: u32, rsp: RspDesc) {
        *self.ring.slot_mut(idx % self.ring.size()) = rsp;
    }

    fn return_credits<P: Platform>(&mut self, platform: &P) {
        platform.write_reg(
            A_SG_RSPQ_CREDIT_RETURN,
            v_rspq(self.cntxt_id) | v_credits(self.credits),
        );
        self.stats.credit_returns += 1;
        self.credits = 0;
    }

    fn advance<P: Platform>(&mut self, platform: &P) {
        self.ring.advance_consumer();
        prefetch(self.ring.slot_ptr(self.ring.cidx()));
        self.credits += 1;
        if self.credits >= self.ring.size() / 4 {
            self.return_credits(platform);
        }
    }

    pub(crate) fn release_all<P: Platform>(&mut self, platform: &P) {
        if let Some(open) = self.rx_head.take() {
            for buf in open.into_fragments() {
                platform.free_buffer(buf);
            }
        }
        platform.unmap_ring(self.ring_map);
    }
}

/// Outcome of handling one record's payload.
enum Handled {
    Packet(RxPacket),
    Consumed,
    NoMemory,
}

/// Receive state serialized under one lock: the response queue and both free
/// lists it draws buffers from.
#[derive(Debug)]
pub(crate) struct RxState {
    pub(crate) rspq: ResponseQueue,
    pub(crate) fl: [FreeList; 2],
}

impl RxState {
    /// Scans up to `budget` records. Never blocks.
    pub(crate) fn process<P: Platform>(&mut self, tx: &TxSide<'_, P>, budget: usize) -> PassOutcome {
        let mut outcome = PassOutcome::default();
        let mut sleeping = RspFlags::empty();
        let mut bundle = RxBundle::new();

        while outcome.work_done < budget {
            let rsp = *self.rspq.ring.consumer_slot();
            if self.rspq.ring.slot_state(Generation::from_bit(rsp.gen())) == SlotState::Stale {
                outcome.idle = true;
                break;
            }
            rmb();
            let kind = RecordKind::classify(&rsp);
            let handled = match kind {
                RecordKind::AsyncNotification => self.async_packet(tx.platform, &rsp),
                RecordKind::Immediate => self.imm_packet(tx.platform, &rsp),
                RecordKind::Queued => self.queued_packet(tx, &rsp),
                RecordKind::PureCredit => {
                    self.rspq.stats.pure_rsps += 1;
                    Handled::Consumed
                }
            };
            let packet = match handled {
                Handled::NoMemory => {
                    self.rspq.next_holdoff = NOMEM_INTR_DELAY;
                    self.rspq.stats.nomem += 1;
                    outcome.nomem = true;
                    warn!(
                        target: "sge",
                        "[sge] qset{} no memory for {:?} record at cidx={}",
                        self.rspq.cntxt_id,
                        kind,
                        self.rspq.ring.cidx(),
                    );
                    break;
                }
                Handled::Packet(pkt) => Some(pkt),
                Handled::Consumed => None,
            };

            let raw = rsp.raw_flags();
            if raw & RSPD_CTRL_MASK != 0 {
                sleeping |= RspFlags::from_bits_truncate(raw & RSPD_GTS_MASK);
                apply_credits(tx, raw);
            }
            self.rspq.advance(tx.platform);

            if let Some(mut pkt) = packet {
                if rsp.flags().contains(RspFlags::ERR) {
                    self.rspq.stats.hw_errors += 1;
                    pkt.set_status(RxStatus::HardwareError);
                    warn!(
                        target: "sge",
                        "[sge] qset{} hardware error on {:?} record len={}",
                        self.rspq.cntxt_id,
                        kind,
                        rsp.len(),
                    );
                }
                let pad = if kind == RecordKind::Queued { RX_ETH_PAD } else { 0 };
                dispatch(tx.platform, pkt, &rsp, pad, &mut bundle);
            }

            for fl in &mut self.fl {
                let n = fl.shortfall().min(tx.cfg.fl_refill_batch);
                if n > 0 {
                    fl.refill(tx.platform, n);
                }
            }
            outcome.work_done += 1;
        }

        if !bundle.is_empty() {
            tx.platform.deliver_bundle(bundle);
        }
        if outcome.idle {
            for fl in &mut self.fl {
                let n = fl.shortfall().min(tx.cfg.fl_idle_refill);
                if n > 0 {
                    fl.refill(tx.platform, n);
                }
            }
        }
        for kind in TxqKind::ALL {
            if sleeping.contains(kind.gts_flag()) && tx.txq[kind.index()].lock().kick_if_outstanding(tx.platform) {
                debug!(
                    target: "sge",
                    "[sge] qset{} {} idle with work outstanding, doorbell re-rung",
                    self.rspq.cntxt_id,
                    kind.label(),
                );
            }
        }
        outcome
    }

    fn alloc_copy<P: Platform>(&self, platform: &P, bytes: &[u8]) -> Option<PacketBuffer> {
        let mut buf = platform.alloc_buffer(SizeClass::Small)?;
        buf.fill_from(bytes);
        Some(buf)
    }

    fn async_packet<P: Platform>(&mut self, platform: &P, rsp: &RspDesc) -> Handled {
        let mut raw = rsp.to_bytes();
        raw[0] = CPL_ASYNC_NOTIF;
        let Some(buf) = self.alloc_copy(platform, &raw[..AN_PKT_SIZE]) else {
            return Handled::NoMemory;
        };
        self.rspq.stats.async_notif += 1;
        Handled::Packet(RxPacket::new(buf, RxClass::AsyncNotification))
    }

    fn imm_packet<P: Platform>(&mut self, platform: &P, rsp: &RspDesc) -> Handled {
        let len = match rsp.len() as usize {
            0 => IMMED_PKT_SIZE,
            len => len.min(IMMED_PKT_SIZE),
        };
        let Some(buf) = self.alloc_copy(platform, &rsp.imm_data[..len]) else {
            return Handled::NoMemory;
        };
        self.rspq.stats.imm_data += 1;
        Handled::Packet(RxPacket::new(buf, class_of(rsp)))
    }

    fn queued_packet<P: Platform>(&mut self, tx: &TxSide<'_, P>, rsp: &RspDesc) -> Handled {
        let platform = tx.platform;
        let fl = &mut self.fl[rsp.free_list()];
        let len = rsp.len() as usize;
        let sopeop = rsp.sop_eop();
        let drop_thresh = if rsp.rss.opcode == CPL_RX_PKT {
            tx.cfg.rx_drop_thresh
        } else {
            0
        };

        if fl.credits() < drop_thresh
            && fl.refill(platform, MAX_RX_REFILL.min(fl.shortfall().saturating_sub(1))) == 0
        {
            fl.recycle_head(platform);
            self.rspq.stats.rx_drops += 1;
            if !matches!(sopeop, SopEop::Sop | SopEop::SopEop) {
                if let Some(open) = self.rspq.rx_head.take() {
                    release(platform, open);
                }
            }
            debug!(
                target: "sge",
                "[sge] qset{} fl{} under pressure, dropped len={}",
                self.rspq.cntxt_id,
                rsp.free_list(),
                len,
            );
            return Handled::Consumed;
        }

        if sopeop == SopEop::SopEop && tx.cfg.rx_recycle && len <= tx.cfg.rx_copy_thresh as usize {
            if let Some(mut copy) = platform.alloc_buffer(SizeClass::Small) {
                if fl.copy_head(platform, len, &mut copy) && fl.recycle_head(platform) {
                    return Handled::Packet(RxPacket::new(copy, class_of(rsp)));
                }
                platform.free_buffer(copy);
            }
        }

        let Some(buf) = fl.consume(platform, len) else {
            return Handled::Consumed;
        };
        match sopeop {
            SopEop::SopEop => Handled::Packet(RxPacket::new(buf, class_of(rsp))),
            SopEop::Sop => {
                if let Some(stale) = self.rspq.rx_head.replace(RxPacket::new(buf, class_of(rsp))) {
                    self.rspq.stats.orphan_frags += 1;
                    warn!(
                        target: "sge",
                        "[sge] qset{} new packet started before previous ended, {} bytes dropped",
                        self.rspq.cntxt_id,
                        stale.len(),
                    );
                    release(platform, stale);
                }
                Handled::Consumed
            }
            SopEop::Neither | SopEop::Eop => {
                let Some(open) = self.rspq.rx_head.as_mut() else {
                    self.rspq.stats.orphan_frags += 1;
                    warn!(
                        target: "sge",
                        "[sge] qset{} continuation fragment without open packet, len={}",
                        self.rspq.cntxt_id,
                        len,
                    );
                    platform.free_buffer(buf);
                    return Handled::Consumed;
                };
                open.push_fragment(buf);
                if sopeop == SopEop::Eop {
                    match self.rspq.rx_head.take() {
                        Some(done) => Handled::Packet(done),
                        None => Handled::Consumed,
                    }
                } else {
                    Handled::Consumed
                }
            }
        }
    }

    pub(crate) fn release_all<P: Platform>(&mut self, platform: &P) {
        self.rspq.release_all(platform);
        for fl in &mut self.fl {
            fl.release_all(platform);
        }
    }
}

fn class_of(rsp: &RspDesc) -> RxClass {
    match rsp.rss.opcode {
        CPL_RX_PKT => RxClass::Ethernet,
        opcode => RxClass::Offload { opcode },
    }
}

fn release<P: Platform>(platform: &P, pkt: RxPacket) {
    for buf in pkt.into_fragments() {
        platform.free_buffer(buf);
    }
}

fn apply_credits<P: Platform>(tx: &TxSide<'_, P>, raw: u32) {
    for kind in TxqKind::ALL {
        let credits = g_rspd_txq_cr(kind.index(), raw);
        if credits == 0 {
            continue;
        }
        let mut txq = tx.txq[kind.index()].lock();
        txq.add_credits(credits);
        txq.reclaim_if_due(tx.platform);
        if tx.flow.state(kind) == TxqState::Stopped
            && txq.restart_due()
            && tx.flow.schedule_restart(kind)
        {
            debug!(
                target: "sge",
                "[sge] {} restart scheduled in_use={} reclaimable={}",
                kind.label(),
                txq.in_use(),
                txq.reclaimable(),
            );
        }
    }
}

/// Strips hardware framing from an Ethernet packet and records its metadata.
fn rx_eth(pkt: &mut RxPacket, rsp: &RspDesc, pad: usize) {
    let cpl = pkt
        .fragments()
        .first()
        .and_then(|first| first.as_slice().get(pad..))
        .and_then(CplRxPkt::parse);
    let Some(cpl) = cpl else {
        pkt.set_offset(pad);
        return;
    };
    pkt.set_offset(pad + CPL_RX_PKT_LEN);
    pkt.set_meta(RxMeta {
        iff: cpl.iff,
        checksum_ok: cpl.checksum_ok() && !cpl.fragment,
        vlan: cpl.vlan_valid.then_some(cpl.vlan),
        rss_hash: (rsp.rss.hash_type != 0).then(|| rsp.rss.hash_val()),
    });
}

fn dispatch<P: Platform>(platform: &P, mut pkt: RxPacket, rsp: &RspDesc, pad: usize, bundle: &mut RxBundle) {
    if pkt.class() == RxClass::Ethernet {
        rx_eth(&mut pkt, rsp, pad);
        platform.deliver(pkt);
        return;
    }
    match bundle.push(pkt) {
        Ok(()) if bundle.is_full() => platform.deliver_bundle(mem::take(bundle)),
        Ok(()) => {}
        Err(pkt) => platform.deliver(pkt),
    }
}
