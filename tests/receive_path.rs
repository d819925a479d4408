// Author: Lukas Bower
// Purpose: Exercise response-queue dispatch, receive buffer policy and delivery.

mod common;

use std::sync::Arc;

use cohesix_sge::ring::Generation;
use cohesix_sge::test_support::{
    async_record, credit_record, eth_wire_bytes, imm_record, SimPlatform,
};
use cohesix_sge::{
    QsetError, QueueSet, RxClass, RxStatus, SizeClass, TxqKind, NOMEM_INTR_DELAY, RX_BUNDLE_SIZE,
};
use cohesix_sge_wire::regs::{
    v_credits, v_newindex, v_newtimer, v_rspq, A_SG_GTS, A_SG_RSPQ_CREDIT_RETURN,
};
use cohesix_sge_wire::{RspFlags, SopEop, CPL_ASYNC_NOTIF, CPL_RX_PKT};
use common::{init_logging, small_config, Harness};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7) as u8).collect()
}

#[test]
fn short_frame_is_copied_and_its_buffer_reposted() {
    let mut h = Harness::small();
    let head = h.qs.fl_descriptor(SizeClass::Small, 0).addr();
    let frame = payload(100);
    h.hw.eth_frame(&h.qs, &h.platform, 0, &frame, 0);
    assert_eq!(h.qs.process(8), 1);

    let delivered = h.platform.take_delivered();
    assert_eq!(delivered.len(), 1);
    let pkt = &delivered[0];
    assert_eq!(pkt.class(), RxClass::Ethernet);
    assert_eq!(pkt.status(), RxStatus::Ok);
    assert!(pkt.meta().checksum_ok);
    assert_eq!(pkt.to_vec(), frame);

    let fl = h.qs.fl_snapshot(SizeClass::Small);
    assert_eq!(fl.recycled, 1);
    assert_eq!(fl.credits, 64);
    assert_eq!(fl.cidx, 1);
    // The reposted buffer keeps its mapping at the producer slot.
    assert_eq!(h.qs.fl_descriptor(SizeClass::Small, 0).addr(), head);
}

#[test]
fn long_frame_hands_its_buffer_upward_and_refills() {
    let mut h = Harness::small();
    let frame = payload(1000);
    h.hw.eth_frame(&h.qs, &h.platform, 0, &frame, 0);
    let allocated = h.platform.allocated_count();
    assert_eq!(h.qs.process(8), 1);

    let delivered = h.platform.take_delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].fragments().len(), 1);
    assert_eq!(delivered[0].to_vec(), frame);

    let fl = h.qs.fl_snapshot(SizeClass::Small);
    assert_eq!(fl.recycled, 0);
    assert_eq!(fl.credits, 64);
    assert_eq!(h.platform.allocated_count(), allocated + 1);
}

#[test]
fn jumbo_frame_arrives_on_second_free_list() {
    let mut h = Harness::small();
    let frame = payload(8000);
    h.hw.eth_frame(&h.qs, &h.platform, 1, &frame, 0);
    h.qs.process(8);
    let delivered = h.platform.take_delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].len(), 8000);
    assert_eq!(h.qs.fl_snapshot(SizeClass::Jumbo).cidx, 1);
    assert_eq!(h.qs.fl_snapshot(SizeClass::Small).cidx, 0);
}

#[test]
fn vlan_tag_is_reported_in_metadata() {
    let mut h = Harness::small();
    let bytes = eth_wire_bytes(&payload(600), Some(42));
    let rsp = h.hw.land(&h.qs, &h.platform, 0, &bytes, SopEop::SopEop, CPL_RX_PKT);
    h.hw.push(&h.qs, rsp);
    h.qs.process(8);
    let delivered = h.platform.take_delivered();
    assert_eq!(delivered[0].meta().vlan, Some(42));
    assert_eq!(delivered[0].len(), 600);
}

#[test]
fn fragments_chain_into_one_packet() {
    let mut h = Harness::small();
    let frame = payload(3000);
    let bytes = eth_wire_bytes(&frame, None);
    let (first, rest) = bytes.split_at(1200);
    let (middle, last) = rest.split_at(1200);
    for (chunk, marker) in [
        (first, SopEop::Sop),
        (middle, SopEop::Neither),
        (last, SopEop::Eop),
    ] {
        let rsp = h.hw.land(&h.qs, &h.platform, 0, chunk, marker, CPL_RX_PKT);
        h.hw.push(&h.qs, rsp);
    }
    assert_eq!(h.qs.process(8), 3);

    let delivered = h.platform.take_delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].fragments().len(), 3);
    assert_eq!(delivered[0].to_vec(), frame);
}

#[test]
fn continuation_without_start_is_discarded() {
    let mut h = Harness::small();
    let rsp = h.hw.land(&h.qs, &h.platform, 0, &payload(500), SopEop::Eop, CPL_RX_PKT);
    h.hw.push(&h.qs, rsp);
    assert_eq!(h.qs.process(8), 1);
    assert!(h.platform.take_delivered().is_empty());
    assert_eq!(h.qs.rspq_snapshot().stats.orphan_frags, 1);
}

#[test]
fn offload_messages_are_delivered_in_bundles() {
    let mut h = Harness::small();
    for i in 0..10u8 {
        h.hw.push(&h.qs, imm_record(0x20, &[i; 24]));
    }
    assert_eq!(h.qs.process(16), 10);

    let bundles = h.platform.take_bundles();
    let sizes: Vec<usize> = bundles.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![RX_BUNDLE_SIZE, 10 - RX_BUNDLE_SIZE]);
    let first = &bundles[0][0];
    assert_eq!(first.class(), RxClass::Offload { opcode: 0x20 });
    assert_eq!(first.to_vec(), vec![0u8; 24]);
    assert_eq!(bundles[1][1].to_vec(), vec![9u8; 24]);
    assert!(h.platform.take_delivered().is_empty());
    assert_eq!(h.qs.rspq_snapshot().stats.imm_data, 10);
}

#[test]
fn async_notification_joins_the_bundle() {
    let mut h = Harness::small();
    h.hw.push(&h.qs, async_record(&[0x5a; 8]));
    assert_eq!(h.qs.process(4), 1);
    let bundles = h.platform.take_bundles();
    assert_eq!(bundles.len(), 1);
    let pkt = &bundles[0][0];
    assert_eq!(pkt.class(), RxClass::AsyncNotification);
    let bytes = pkt.to_vec();
    assert_eq!(bytes[0], CPL_ASYNC_NOTIF);
    assert_eq!(&bytes[16..24], &[0x5a; 8]);
    assert_eq!(h.qs.rspq_snapshot().stats.async_notif, 1);
}

#[test]
fn hardware_error_is_surfaced_on_the_packet() {
    let mut h = Harness::small();
    h.hw.eth_frame(&h.qs, &h.platform, 0, &payload(900), RspFlags::ERR.bits());
    h.qs.process(4);
    let delivered = h.platform.take_delivered();
    assert_eq!(delivered[0].status(), RxStatus::HardwareError);
    assert_eq!(h.qs.rspq_snapshot().stats.hw_errors, 1);
}

#[test]
fn allocation_failure_stops_scan_with_long_holdoff() {
    let mut h = Harness::small();
    h.platform.set_alloc_budget(Some(0));
    h.hw.push(&h.qs, imm_record(0x21, &[1; 16]));
    assert_eq!(h.qs.intr_handler(), 0);

    let snap = h.qs.rspq_snapshot();
    assert_eq!(snap.cidx, 0);
    assert_eq!(snap.stats.nomem, 1);
    assert!(!h.qs.lost_interrupt_suspected());
    assert_eq!(
        h.platform.reg_writes(A_SG_GTS),
        vec![v_rspq(0) | v_newtimer(NOMEM_INTR_DELAY) | v_newindex(0)]
    );

    h.platform.set_alloc_budget(None);
    assert_eq!(h.qs.intr_handler(), 1);
    let gts = h.platform.reg_writes(A_SG_GTS);
    assert_eq!(
        gts.last().copied(),
        Some(v_rspq(0) | v_newtimer(h.qs.config().holdoff_tmr) | v_newindex(1))
    );
    assert_eq!(h.platform.take_bundles().len(), 1);
}

#[test]
fn starved_free_list_drops_ethernet_and_recycles() {
    let mut h = Harness::small();
    h.platform.set_alloc_budget(Some(0));
    for _ in 0..60 {
        h.hw.eth_frame(&h.qs, &h.platform, 0, &payload(1000), 0);
    }
    assert_eq!(h.qs.process(64), 60);

    let threshold = h.qs.config().rx_drop_thresh as usize;
    let accepted = 64 - threshold + 1;
    assert_eq!(h.platform.take_delivered().len(), accepted);
    let snap = h.qs.rspq_snapshot();
    assert_eq!(snap.stats.rx_drops as usize, 60 - accepted);
    let fl = h.qs.fl_snapshot(SizeClass::Small);
    assert_eq!(fl.credits as usize, threshold - 1);
    assert_eq!(fl.recycled as usize, 60 - accepted);
}

#[test]
fn consumed_records_are_returned_in_batches() {
    let mut h = Harness::small();
    for _ in 0..20 {
        h.hw.push(&h.qs, credit_record(TxqKind::Eth, 0, 0));
    }
    assert_eq!(h.qs.process(64), 20);
    assert_eq!(
        h.platform.reg_writes(A_SG_RSPQ_CREDIT_RETURN),
        vec![v_rspq(0) | v_credits(16)]
    );
    let snap = h.qs.rspq_snapshot();
    assert_eq!(snap.credits, 4);
    assert_eq!(snap.stats.pure_rsps, 20);
}

#[test]
fn response_ring_wraps_with_generation_flip() {
    let mut h = Harness::small();
    for round in 0..3 {
        for _ in 0..40 {
            h.hw.eth_frame(&h.qs, &h.platform, 0, &payload(64), 0);
        }
        assert_eq!(h.qs.process(64), 40, "round {round}");
        assert_eq!(h.drain_delivered(), 40);
    }
    let snap = h.qs.rspq_snapshot();
    assert_eq!(snap.cidx, 120 % 64);
    assert_eq!(snap.gen, Generation::Zero);
}

#[test]
fn receive_buffers_split_by_the_mapper_are_never_posted() {
    init_logging();
    let platform = Arc::new(SimPlatform::new());
    platform.set_segment_size(Some(1024));
    let err = QueueSet::new(small_config(), Arc::clone(&platform))
        .err()
        .expect("no single-segment buffers");
    assert!(matches!(err, QsetError::FreeListEmpty { index: 0 }));
    assert_eq!(platform.live_mappings(), 0);
    assert_eq!(platform.outstanding_buffers(), 0);
    assert_eq!(platform.live_rings(), 0);
}

#[test]
fn refill_skips_split_mappings_and_recovers() {
    let mut h = Harness::small();
    h.platform.set_segment_size(Some(1024));
    for _ in 0..3 {
        h.hw.eth_frame(&h.qs, &h.platform, 0, &payload(1000), 0);
    }
    assert_eq!(h.qs.process(8), 3);
    assert_eq!(h.drain_delivered(), 3);

    let fl = h.qs.fl_snapshot(SizeClass::Small);
    assert_eq!(fl.credits, 61);
    assert!(fl.alloc_failed >= 1);
    assert_eq!(h.platform.live_mappings(), 61 + 32);
    assert_eq!(h.platform.outstanding_buffers(), 61 + 32);
    for slot in fl.cidx..fl.cidx + fl.credits {
        let desc = h.qs.fl_descriptor(SizeClass::Small, slot);
        assert_eq!(desc.len(), 2048, "slot {slot}");
    }

    h.platform.set_segment_size(None);
    let report = h.qs.on_timer(0).expect("tick");
    assert_eq!(report.refilled, 3);
    assert_eq!(h.qs.fl_snapshot(SizeClass::Small).credits, 64);
}
