// Author: Lukas Bower
// Purpose: Queue set construction, entry points and teardown.

//! A queue set binds one response queue, two free lists and three send
//! queues to one interrupt source.
//!
//! Each send queue sits behind its own lock. The response queue and both free
//! lists share a second, coarser lock. A response pass holds the receive lock
//! and takes send-queue locks briefly to apply credit; nothing ever takes the
//! receive lock while holding a send-queue lock. Restarts scheduled during a
//! pass run after the receive lock is released.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;

use cohesix_sge_wire::regs::A_SG_RSPQ_FL_STATUS;
use cohesix_sge_wire::{RspDesc, RxDesc, TxDesc};
use log::{debug, error, info};
use portable_atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::buffer::{RingMapping, SizeClass};
use crate::config::SgeConfig;
use crate::error::{QsetError, SendError};
use crate::flow::{FlowControl, TxqKind, TxqState};
use crate::freelist::{FlSnapshot, FreeList};
use crate::hal::Platform;
use crate::packet::TxRequest;
use crate::rspq::{ResponseQueue, RspqSnapshot, RxState, TxSide};
use crate::timer::{MaintenanceTimer, TimerReport};
use crate::txq::{Admission, SendQueue, TxqSnapshot};

const RING_LABELS: [&str; 6] = ["txq-eth", "txq-ofld", "txq-ctrl", "rspq", "fl0", "fl1"];

/// One response queue, two free lists and three send queues.
pub struct QueueSet<P: Platform> {
    platform: Arc<P>,
    cfg: SgeConfig,
    flow: FlowControl,
    txq: [Mutex<SendQueue>; 3],
    rx: Mutex<RxState>,
    lost_intr: AtomicBool,
    timer: MaintenanceTimer,
}

impl<P: Platform> QueueSet<P> {
    /// Maps every ring and fills both free lists.
    ///
    /// On failure everything acquired so far is released before returning.
    pub fn new(cfg: SgeConfig, platform: Arc<P>) -> Result<Self, QsetError> {
        cfg.validate()?;
        let qset = cfg.qset_idx;
        let sizes = [
            cfg.txq_size[0] as usize * size_of::<TxDesc>(),
            cfg.txq_size[1] as usize * size_of::<TxDesc>(),
            cfg.txq_size[2] as usize * size_of::<TxDesc>(),
            cfg.rspq_size as usize * size_of::<RspDesc>(),
            cfg.fl_size[0] as usize * size_of::<RxDesc>(),
            cfg.fl_size[1] as usize * size_of::<RxDesc>(),
        ];
        let mut rings: Vec<RingMapping> = Vec::with_capacity(RING_LABELS.len());
        for (label, bytes) in RING_LABELS.into_iter().zip(sizes) {
            match platform.map_ring(label, bytes) {
                Ok(ring) => rings.push(ring),
                Err(source) => {
                    error!(
                        target: "sge",
                        "[sge] qset{} failed to map {} ring: {}",
                        qset,
                        label,
                        source,
                    );
                    for ring in rings {
                        platform.unmap_ring(ring);
                    }
                    return Err(QsetError::RingMapping {
                        ring: label,
                        source,
                    });
                }
            }
        }

        let txq = [TxqKind::Eth, TxqKind::Offload, TxqKind::Control].map(|kind| {
            Mutex::new(SendQueue::new(
                kind,
                qset,
                cfg.txq_size[kind.index()],
                rings[kind.index()],
                cfg.port,
                cfg.compl_interval,
                cfg.tx_reclaim_thresh,
            ))
        });
        let mut rx = RxState {
            rspq: ResponseQueue::new(qset, cfg.rspq_size, rings[3], cfg.holdoff_tmr),
            fl: SizeClass::ALL.map(|class| {
                let buf_size = match class {
                    SizeClass::Small => cfg.small_buf_size,
                    SizeClass::Jumbo => cfg.jumbo_buf_size,
                };
                FreeList::new(
                    class,
                    qset,
                    cfg.fl_size[class.index()],
                    buf_size,
                    rings[4 + class.index()],
                )
            }),
        };

        for fl in &mut rx.fl {
            let size = fl.size();
            fl.refill(&*platform, size);
        }
        if let Some(index) = rx.fl.iter().position(|fl| fl.credits() == 0) {
            error!(
                target: "sge",
                "[sge] qset{} free list {} could not be populated",
                qset,
                index,
            );
            for queue in &txq {
                queue.lock().release_all(&*platform);
            }
            rx.release_all(&*platform);
            return Err(QsetError::FreeListEmpty { index });
        }

        info!(
            target: "sge",
            "[sge] qset{} up: txq={:?} rspq={} fl=[{}, {}]",
            qset,
            cfg.txq_size,
            cfg.rspq_size,
            rx.fl[0].credits(),
            rx.fl[1].credits(),
        );
        let timer = MaintenanceTimer::new(cfg.timer_period_ms);
        Ok(Self {
            platform,
            cfg,
            flow: FlowControl::new(),
            txq,
            rx: Mutex::new(rx),
            lost_intr: AtomicBool::new(false),
            timer,
        })
    }

    /// Configuration in force.
    #[must_use]
    pub fn config(&self) -> &SgeConfig {
        &self.cfg
    }

    /// Collaborators this set was built with.
    #[must_use]
    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    /// Sends `req` on the queue its variant selects.
    ///
    /// `Ok(Admission::Queued)` means the request is parked and will post on
    /// restart. An error means the request was dropped and counted; the queue
    /// is unaffected.
    pub fn submit(&self, req: impl Into<TxRequest>) -> Result<Admission, SendError> {
        let req = req.into();
        let kind = req.kind();
        self.txq[kind.index()]
            .lock()
            .admit(&*self.platform, &self.flow, req)
    }

    /// Scans up to `budget` response records, then runs any restarts the scan
    /// scheduled. Returns the records consumed.
    pub fn process(&self, budget: usize) -> usize {
        let outcome = {
            let mut rx = self.rx.lock();
            rx.process(&self.tx_side(), budget)
        };
        self.run_restarts();
        outcome.work_done
    }

    /// Interrupt entry point: processes up to one ring of records and writes
    /// the new index and holdoff.
    pub fn intr_handler(&self) -> usize {
        let work = {
            let mut rx = self.rx.lock();
            let budget = self.cfg.rspq_size as usize;
            let outcome = rx.process(&self.tx_side(), budget);
            if outcome.work_done == 0 && !outcome.nomem {
                rx.rspq.note_unhandled();
                self.lost_intr.store(true, Ordering::Release);
            } else {
                self.lost_intr.store(false, Ordering::Release);
            }
            rx.rspq.write_gts(&*self.platform);
            outcome.work_done
        };
        self.run_restarts();
        work
    }

    /// Maintenance tick. Returns `None` when the period has not elapsed.
    pub fn on_timer(&self, now_ms: u64) -> Option<TimerReport> {
        if !self.timer.claim(now_ms) {
            return None;
        }
        let platform = &*self.platform;
        let mut report = TimerReport::default();
        for kind in TxqKind::ALL {
            let mut txq = self.txq[kind.index()].lock();
            report.reclaimed += txq.reclaim(platform);
            if self.flow.state(kind) == TxqState::Stopped && txq.restart_due() {
                self.flow.schedule_restart(kind);
            }
        }
        {
            let mut rx = self.rx.lock();
            for fl in &mut rx.fl {
                let n = fl.shortfall().min(self.cfg.fl_idle_refill);
                if n > 0 {
                    report.refilled += fl.refill(platform, n);
                }
            }
            let status = platform.read_reg(A_SG_RSPQ_FL_STATUS);
            if status & (1 << self.cfg.qset_idx) != 0 {
                report.starved = rx.rspq.relieve_starvation(platform);
            }
            let suspected = self.lost_intr.swap(false, Ordering::AcqRel);
            if suspected || rx.rspq.has_fresh() {
                let outcome = rx.process(&self.tx_side(), self.cfg.rspq_size as usize);
                report.repolled = outcome.work_done;
                rx.rspq.write_gts(platform);
            }
        }
        report.restarted = self.run_restarts();
        debug!(target: "sge", "[sge] qset{} tick {:?}", self.cfg.qset_idx, report);
        Some(report)
    }

    /// Posts up to `n` buffers to the free list serving `class`.
    pub fn refill(&self, class: SizeClass, n: u32) -> u32 {
        self.rx.lock().fl[class.index()].refill(&*self.platform, n)
    }

    /// Reclaims every completed descriptor on `kind`.
    pub fn reclaim(&self, kind: TxqKind) -> u32 {
        let mut txq = self.txq[kind.index()].lock();
        let count = txq.reclaim(&*self.platform);
        if self.flow.state(kind) == TxqState::Stopped && txq.restart_due() {
            self.flow.schedule_restart(kind);
        }
        count
    }

    /// Runs every scheduled restart, returning the requests replayed.
    pub fn run_restarts(&self) -> usize {
        let mut replayed = 0;
        for kind in self.flow.take_restarts().kinds() {
            replayed += self.txq[kind.index()]
                .lock()
                .restart(&*self.platform, &self.flow);
        }
        replayed
    }

    /// Admission state of `kind`.
    #[must_use]
    pub fn txq_state(&self, kind: TxqKind) -> TxqState {
        self.flow.state(kind)
    }

    /// Snapshot of send queue `kind`.
    #[must_use]
    pub fn txq_snapshot(&self, kind: TxqKind) -> TxqSnapshot {
        self.txq[kind.index()].lock().snapshot(&self.flow)
    }

    /// Whether `kind` holds parked requests.
    #[must_use]
    pub fn has_pending(&self, kind: TxqKind) -> bool {
        self.txq[kind.index()].lock().has_pending()
    }

    /// Copy of transmit descriptor `idx` on `kind`.
    #[must_use]
    pub fn tx_descriptor(&self, kind: TxqKind, idx: u32) -> TxDesc {
        self.txq[kind.index()].lock().descriptor(idx)
    }

    /// Snapshot of the free list serving `class`.
    #[must_use]
    pub fn fl_snapshot(&self, class: SizeClass) -> FlSnapshot {
        self.rx.lock().fl[class.index()].snapshot()
    }

    /// Copy of free-list descriptor `idx`.
    #[must_use]
    pub fn fl_descriptor(&self, class: SizeClass, idx: u32) -> RxDesc {
        self.rx.lock().fl[class.index()].descriptor(idx)
    }

    /// Snapshot of the response queue.
    #[must_use]
    pub fn rspq_snapshot(&self) -> RspqSnapshot {
        self.rx.lock().rspq.snapshot()
    }

    /// Whether the last interrupt found nothing to do.
    #[must_use]
    pub fn lost_interrupt_suspected(&self) -> bool {
        self.lost_intr.load(Ordering::Acquire)
    }

    /// Writes response record `idx` the way the device does. Host builds only.
    #[cfg(any(test, feature = "test-support"))]
    #[doc(hidden)]
    pub fn hw_write_response(&self, idx: u32, rsp: RspDesc) {
        self.rx.lock().rspq.hw_write(idx, rsp);
    }

    fn tx_side(&self) -> TxSide<'_, P> {
        TxSide {
            platform: &*self.platform,
            txq: &self.txq,
            flow: &self.flow,
            cfg: &self.cfg,
        }
    }
}

impl<P: Platform> Drop for QueueSet<P> {
    fn drop(&mut self) {
        let platform = &*self.platform;
        for txq in &self.txq {
            txq.lock().release_all(platform);
        }
        self.rx.lock().release_all(platform);
        info!(target: "sge", "[sge] qset{} torn down", self.cfg.qset_idx);
    }
}
