// Author: Lukas Bower
// Purpose: Randomised checks of credit conservation, ordering and buffer ownership.

mod common;

use std::collections::BTreeSet;

use cohesix_sge::{BufferId, SizeClass, TxqKind, TxqState};
use common::{frame, Harness};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SEEDS: [u64; 4] = [1, 7, 42, 0xdead_beef];

fn outstanding(h: &Harness) -> u32 {
    let snap = h.qs.txq_snapshot(TxqKind::Eth);
    snap.posted.wrapping_sub(snap.processed)
}

#[test]
fn completions_release_frames_in_submission_order() {
    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut h = Harness::small();
        let total = 400u32;
        for id in 1..=total {
            let len = rng.gen_range(200..1500);
            let dest = rng.gen_range(0..4);
            h.qs.submit(frame(id, dest, len)).expect("submit");
        }
        assert_eq!(h.qs.txq_state(TxqKind::Eth), TxqState::Stopped);

        let mut rounds = 0;
        while h.qs.has_pending(TxqKind::Eth) || outstanding(&h) > 0 {
            let owed = outstanding(&h);
            if owed > 0 {
                let credits = rng.gen_range(1..=owed.min(127));
                h.hw.credit(&h.qs, TxqKind::Eth, credits, 0);
                h.qs.process(8);
            }
            rounds += 1;
            assert!(rounds < 10_000, "seed {seed} did not drain");
        }
        h.qs.reclaim(TxqKind::Eth);

        let snap = h.qs.txq_snapshot(TxqKind::Eth);
        assert_eq!(snap.in_use, 0, "seed {seed}");
        assert_eq!(snap.posted, snap.processed);
        assert_eq!(snap.processed, snap.cleaned);
        assert_eq!(snap.stats.sent, u64::from(total));
        assert_eq!(
            h.platform.freed_buffers(),
            (1..=total).map(BufferId).collect::<Vec<_>>(),
            "seed {seed}"
        );
    }
}

#[test]
fn in_use_never_exceeds_ring_and_credit_never_exceeds_posted() {
    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut h = Harness::small();
        let mut next_id = 1u32;
        for _ in 0..300 {
            if rng.gen_bool(0.6) {
                let len = rng.gen_range(1..3000);
                let _ = h.qs.submit(frame(next_id, rng.gen_range(0..8), len));
                next_id += 1;
            } else {
                let owed = outstanding(&h);
                // Overshoot on purpose: surplus credit is clamped.
                let credits = rng.gen_range(0..=(owed + 3).min(127));
                h.hw.credit(&h.qs, TxqKind::Eth, credits, 0);
                h.qs.process(4);
            }
            let snap = h.qs.txq_snapshot(TxqKind::Eth);
            assert!(snap.in_use <= snap.size, "seed {seed}");
            assert!(
                snap.processed.wrapping_sub(snap.cleaned) <= snap.in_use,
                "seed {seed}"
            );
            assert!(outstanding(&h) <= snap.in_use, "seed {seed}");
        }
    }
}

#[test]
fn free_lists_stay_supplied_under_receive_load() {
    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut h = Harness::small();
        for _ in 0..20 {
            let burst = rng.gen_range(1..40);
            for _ in 0..burst {
                let fl = usize::from(rng.gen_bool(0.2));
                let len = if fl == 1 {
                    rng.gen_range(2500..8000)
                } else {
                    rng.gen_range(60..1800)
                };
                h.hw.eth_frame(&h.qs, &h.platform, fl, &vec![0x66; len], 0);
            }
            assert_eq!(h.qs.process(64), burst);
            assert_eq!(h.drain_delivered(), burst);
            for class in SizeClass::ALL {
                let fl = h.qs.fl_snapshot(class);
                assert_eq!(fl.credits, fl.size, "seed {seed} {class:?}");
            }
        }
    }
}

#[test]
fn every_received_buffer_is_owned_exactly_once() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut h = Harness::small();
    let mut seen = BTreeSet::new();
    for _ in 0..200 {
        let len = rng.gen_range(300..1800);
        h.hw.eth_frame(&h.qs, &h.platform, 0, &vec![0x77; len], 0);
        h.qs.process(4);
        for pkt in h.platform.take_delivered() {
            for frag in pkt.fragments() {
                assert!(seen.insert(frag.id()), "buffer {:?} delivered twice", frag.id());
            }
            h.platform.free_packet(pkt);
        }
    }
    assert_eq!(seen.len(), 200);
}
