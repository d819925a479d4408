// Author: Lukas Bower
// Purpose: Exercise queue-set construction, maintenance ticks and teardown.

mod common;

use std::fs;
use std::sync::Arc;

use cohesix_sge::test_support::{credit_record, SimPlatform};
use cohesix_sge::{
    Admission, ConfigError, MapError, QsetError, QueueSet, SgeConfig, SizeClass, TxqKind,
    TxqState,
};
use cohesix_sge_wire::regs::{v_credits, v_rspq, A_SG_RSPQ_CREDIT_RETURN, A_SG_RSPQ_FL_STATUS};
use common::{frame, init_logging, small_config, Harness};
use tempfile::tempdir;

#[test]
fn ring_mapping_failure_releases_earlier_rings() {
    init_logging();
    let platform = Arc::new(SimPlatform::new());
    platform.fail_ring(Some("rspq"));
    let err = QueueSet::new(small_config(), Arc::clone(&platform))
        .err()
        .expect("ring failure");
    assert!(matches!(
        err,
        QsetError::RingMapping {
            ring: "rspq",
            source: MapError::Rejected(_)
        }
    ));
    assert_eq!(platform.live_rings(), 0);
    assert_eq!(platform.outstanding_buffers(), 0);
}

#[test]
fn empty_free_list_aborts_construction_cleanly() {
    init_logging();
    let platform = Arc::new(SimPlatform::new());
    platform.set_alloc_budget(Some(64));
    let err = QueueSet::new(small_config(), Arc::clone(&platform))
        .err()
        .expect("jumbo list empty");
    assert!(matches!(err, QsetError::FreeListEmpty { index: 1 }));
    assert_eq!(platform.live_rings(), 0);
    assert_eq!(platform.live_mappings(), 0);
    assert_eq!(platform.outstanding_buffers(), 0);
}

#[test]
fn invalid_configuration_is_rejected_before_mapping() {
    init_logging();
    let platform = Arc::new(SimPlatform::new());
    let cfg = SgeConfig {
        rspq_size: 8,
        ..small_config()
    };
    let err = QueueSet::new(cfg, Arc::clone(&platform)).err().expect("invalid");
    assert!(matches!(
        err,
        QsetError::Config(ConfigError::OutOfRange {
            field: "rspq_size",
            ..
        })
    ));
    assert_eq!(platform.live_rings(), 0);
}

#[test]
fn partially_filled_free_list_is_accepted() {
    init_logging();
    let platform = Arc::new(SimPlatform::new());
    platform.set_alloc_budget(Some(64 + 5));
    let qs = QueueSet::new(small_config(), Arc::clone(&platform)).expect("queue set");
    assert_eq!(qs.fl_snapshot(SizeClass::Small).credits, 64);
    assert_eq!(qs.fl_snapshot(SizeClass::Jumbo).credits, 5);
}

#[test]
fn configuration_file_drives_ring_sizes() {
    init_logging();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("sge.toml");
    fs::write(
        &path,
        "qset_idx = 2\ntxq_size = [64, 64, 32]\nrspq_size = 128\nfl_size = [64, 64]\n",
    )
    .expect("write config");
    let cfg = SgeConfig::load(&path).expect("load");
    let qs = QueueSet::new(cfg, Arc::new(SimPlatform::new())).expect("queue set");
    assert_eq!(qs.txq_snapshot(TxqKind::Eth).size, 64);
    assert_eq!(qs.txq_snapshot(TxqKind::Control).size, 32);
    assert_eq!(qs.rspq_snapshot().size, 128);
    assert_eq!(qs.fl_snapshot(SizeClass::Jumbo).size, 64);
}

#[test]
fn teardown_returns_every_buffer_mapping_and_ring() {
    let platform;
    {
        let mut h = Harness::small();
        platform = Arc::clone(&h.platform);
        for id in 1..=140u32 {
            h.qs.submit(frame(id, id % 3, 1500)).expect("submit");
        }
        assert!(h.qs.has_pending(TxqKind::Eth));
        for _ in 0..5 {
            h.hw.eth_frame(&h.qs, &h.platform, 0, &[0x33; 1200], 0);
        }
        h.qs.process(16);
        h.drain_delivered();
    }
    assert_eq!(platform.outstanding_buffers(), 0);
    assert_eq!(platform.live_mappings(), 0);
    assert_eq!(platform.live_rings(), 0);
    let freed = platform.freed_buffers();
    for id in 1..=140u32 {
        assert!(freed.contains(&cohesix_sge::BufferId(id)), "frame {id}");
    }
}

#[test]
fn timer_ticks_once_per_period() {
    let h = Harness::small();
    assert!(h.qs.on_timer(1_000).is_some());
    assert!(h.qs.on_timer(1_100).is_none());
    assert!(h.qs.on_timer(1_000 + h.qs.config().timer_period_ms).is_some());
}

#[test]
fn lost_interrupt_is_recovered_by_timer() {
    let mut h = Harness::small();
    assert_eq!(h.qs.intr_handler(), 0);
    assert!(h.qs.lost_interrupt_suspected());
    assert_eq!(h.qs.rspq_snapshot().stats.unhandled_irqs, 1);

    h.hw.eth_frame(&h.qs, &h.platform, 0, &[0x44; 700], 0);
    let report = h.qs.on_timer(0).expect("tick");
    assert_eq!(report.repolled, 1);
    assert!(!h.qs.lost_interrupt_suspected());
    assert_eq!(h.drain_delivered(), 1);
}

#[test]
fn timer_applies_pending_credit_and_restarts_stopped_queue() {
    let mut h = Harness::small();
    for id in 1..=130u32 {
        h.qs.submit(frame(id, 0, 64)).expect("submit");
    }
    assert_eq!(h.qs.txq_state(TxqKind::Eth), TxqState::Stopped);

    h.hw.push(&h.qs, credit_record(TxqKind::Eth, 100, 0));
    let report = h.qs.on_timer(0).expect("tick");
    assert_eq!(report.repolled, 1);
    assert_eq!(report.restarted, 4);
    assert_eq!(h.qs.txq_state(TxqKind::Eth), TxqState::Running);
    assert!(!h.qs.has_pending(TxqKind::Eth));
    assert_eq!(
        h.qs.submit(frame(131, 0, 64)).expect("submit"),
        Admission::Posted
    );
}

#[test]
fn timer_reclaims_credited_descriptors() {
    let mut h = Harness::small();
    for id in 1..=8u32 {
        h.qs.submit(frame(id, 0, 800)).expect("submit");
    }
    h.hw.credit(&h.qs, TxqKind::Eth, 8, 0);
    h.qs.process(4);
    assert_eq!(h.qs.txq_snapshot(TxqKind::Eth).in_use, 8);

    let report = h.qs.on_timer(0).expect("tick");
    assert_eq!(report.reclaimed, 8);
    assert_eq!(h.qs.txq_snapshot(TxqKind::Eth).in_use, 0);
    assert_eq!(h.platform.freed_buffers().len(), 8);
}

#[test]
fn timer_refills_short_free_list() {
    let mut h = Harness::small();
    h.platform.set_alloc_budget(Some(0));
    for _ in 0..10 {
        h.hw.eth_frame(&h.qs, &h.platform, 0, &[0x55; 900], 0);
    }
    h.qs.process(16);
    assert_eq!(h.qs.fl_snapshot(SizeClass::Small).credits, 54);

    h.platform.set_alloc_budget(None);
    let report = h.qs.on_timer(0).expect("tick");
    assert_eq!(report.refilled, 10);
    assert_eq!(h.qs.fl_snapshot(SizeClass::Small).credits, 64);
    h.drain_delivered();
}

#[test]
fn starved_response_queue_gets_one_credit_back() {
    let mut h = Harness::small();
    for _ in 0..3 {
        h.hw.push(&h.qs, credit_record(TxqKind::Offload, 0, 0));
    }
    h.qs.process(8);
    assert_eq!(h.qs.rspq_snapshot().credits, 3);

    h.platform.set_reg(A_SG_RSPQ_FL_STATUS, 1);
    h.platform.clear_reg_log();
    let report = h.qs.on_timer(0).expect("tick");
    assert!(report.starved);
    assert_eq!(h.qs.rspq_snapshot().credits, 2);
    assert_eq!(
        h.platform.reg_writes(A_SG_RSPQ_CREDIT_RETURN),
        vec![v_rspq(0) | v_credits(1)]
    );
}
