// Author: Lukas Bower
// Purpose: Send-queue identities and the stop/restart controller shared across contexts.

//! Flow control for the three send queues of a queue set.
//!
//! A queue stops when admission finds fewer free descriptors than a request
//! needs. Reclamation on the response path checks [`should_restart`]; when it
//! holds, the queue's stopped bit is cleared and a restart is scheduled. The
//! restart itself replays the pending queue under the send-queue lock once
//! the response path has dropped its own lock.

use bitflags::bitflags;
use cohesix_sge_wire::RspFlags;
use portable_atomic::{AtomicU8, Ordering};

/// One of the three send queues in a queue set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxqKind {
    /// High-volume Ethernet data.
    Eth,
    /// Offload-class work requests.
    Offload,
    /// Control work requests, immediate data only.
    Control,
}

impl TxqKind {
    /// All queues in scheduling priority order.
    pub const ALL: [TxqKind; 3] = [TxqKind::Eth, TxqKind::Offload, TxqKind::Control];

    /// Queue index inside the set and in response credit fields.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Eth => 0,
            Self::Offload => 1,
            Self::Control => 2,
        }
    }

    /// Name used in log messages.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Eth => "eth",
            Self::Offload => "ofld",
            Self::Control => "ctrl",
        }
    }

    /// Response flag telling software the queue's fetch engine went idle.
    #[must_use]
    pub const fn gts_flag(self) -> RspFlags {
        match self {
            Self::Eth => RspFlags::TXQ0_GTS,
            Self::Offload => RspFlags::TXQ1_GTS,
            Self::Control => RspFlags::TXQ2_GTS,
        }
    }

    /// Whether descriptors on this queue own buffers that reclamation frees.
    #[must_use]
    pub const fn has_shadow(self) -> bool {
        !matches!(self, Self::Control)
    }

    const fn mask(self) -> StoppedQueues {
        match self {
            Self::Eth => StoppedQueues::ETH,
            Self::Offload => StoppedQueues::OFFLOAD,
            Self::Control => StoppedQueues::CONTROL,
        }
    }
}

/// Admission state of a send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxqState {
    /// Requests post directly to the ring.
    Running,
    /// Requests park on the pending queue until a restart.
    Stopped,
}

bitflags! {
    /// Set of send queues, one bit per [`TxqKind`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StoppedQueues: u8 {
        /// Data queue.
        const ETH = 1 << 0;
        /// Offload queue.
        const OFFLOAD = 1 << 1;
        /// Control queue.
        const CONTROL = 1 << 2;
    }
}

impl StoppedQueues {
    /// Queues in the set, in priority order.
    pub fn kinds(self) -> impl Iterator<Item = TxqKind> {
        TxqKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(kind.mask()))
    }
}

/// Restart predicate: at least half the ring is free once everything the
/// hardware has already consumed is reclaimed.
#[must_use]
pub const fn should_restart(size: u32, in_use: u32, reclaimable: u32) -> bool {
    let busy = in_use.saturating_sub(reclaimable);
    size - busy >= size / 2
}

/// Stopped and restart-scheduled bitmaps readable from any context.
#[derive(Debug, Default)]
pub struct FlowControl {
    stopped: AtomicU8,
    restarts: AtomicU8,
}

impl FlowControl {
    /// Creates a controller with every queue running.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stopped: AtomicU8::new(0),
            restarts: AtomicU8::new(0),
        }
    }

    /// Marks `kind` stopped. Returns true on the running to stopped edge.
    pub fn stop(&self, kind: TxqKind) -> bool {
        let bit = kind.mask().bits();
        self.stopped.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// State of `kind`.
    #[must_use]
    pub fn state(&self, kind: TxqKind) -> TxqState {
        if self.stopped.load(Ordering::Acquire) & kind.mask().bits() != 0 {
            TxqState::Stopped
        } else {
            TxqState::Running
        }
    }

    /// Clears the stopped bit of `kind` and schedules its restart. Returns
    /// false when the queue was not stopped, so a restart is scheduled once.
    pub fn schedule_restart(&self, kind: TxqKind) -> bool {
        let bit = kind.mask().bits();
        if self.stopped.fetch_and(!bit, Ordering::AcqRel) & bit == 0 {
            return false;
        }
        self.restarts.fetch_or(bit, Ordering::AcqRel);
        true
    }

    /// Takes every scheduled restart.
    pub fn take_restarts(&self) -> StoppedQueues {
        StoppedQueues::from_bits_truncate(self.restarts.swap(0, Ordering::AcqRel))
    }

    /// Whether any restart is waiting to run.
    #[must_use]
    pub fn restart_pending(&self) -> bool {
        self.restarts.load(Ordering::Acquire) != 0
    }
}
