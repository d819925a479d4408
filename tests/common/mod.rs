// Author: Lukas Bower
// Purpose: Shared fixtures for queue-set integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use cohesix_sge::test_support::{HwModel, SimPlatform};
use cohesix_sge::{BufferId, Destination, PacketBuffer, QueueSet, SgeConfig, TxPacket};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small rings so wrap and stop conditions are cheap to reach.
pub fn small_config() -> SgeConfig {
    SgeConfig {
        txq_size: [128, 64, 32],
        rspq_size: 64,
        fl_size: [64, 32],
        fl_idle_refill: 64,
        ..SgeConfig::default()
    }
}

pub struct Harness {
    pub platform: Arc<SimPlatform>,
    pub qs: QueueSet<SimPlatform>,
    pub hw: HwModel,
}

impl Harness {
    pub fn new(cfg: SgeConfig) -> Self {
        init_logging();
        let platform = Arc::new(SimPlatform::new());
        let qs = QueueSet::new(cfg, Arc::clone(&platform)).expect("queue set");
        let hw = HwModel::new(&qs);
        platform.clear_reg_log();
        Self { platform, qs, hw }
    }

    pub fn small() -> Self {
        Self::new(small_config())
    }

    /// Drains every delivered packet, returning buffers to the platform.
    pub fn drain_delivered(&self) -> usize {
        let delivered = self.platform.take_delivered();
        let count = delivered.len();
        for pkt in delivered {
            self.platform.free_packet(pkt);
        }
        for bundle in self.platform.take_bundles() {
            for pkt in bundle {
                self.platform.free_packet(pkt);
            }
        }
        count
    }
}

/// Frame of `len` bytes filled with the low byte of `id`.
pub fn frame(id: u32, dest: u32, len: usize) -> TxPacket {
    TxPacket::new(
        PacketBuffer::from_slice(BufferId(id), &vec![id as u8; len]),
        Destination(dest),
    )
}
