// Author: Lukas Bower
// Purpose: Fixed-size descriptor ring with generation-bit ownership handshake.

//! Circular descriptor storage shared by every SGE queue.
//!
//! Hardware and software agree on which slots hold new entries through a
//! generation bit rather than a separate valid flag. The side that writes
//! entries stamps each slot with its current generation; the generation flips
//! every time that side's index wraps. A reader compares the stamp on a slot
//! with the generation it expects and treats a mismatch as stale.

use alloc::boxed::Box;
use alloc::vec;

/// Generation value stamped on ring entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Bit clear.
    Zero,
    /// Bit set.
    One,
}

impl Generation {
    /// Builds a generation from a raw bit.
    #[must_use]
    pub const fn from_bit(bit: bool) -> Self {
        if bit {
            Self::One
        } else {
            Self::Zero
        }
    }

    /// Raw bit value.
    #[must_use]
    pub const fn bit(self) -> bool {
        matches!(self, Self::One)
    }

    /// The opposite generation.
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }
}

/// Reader-side view of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Slot still holds an entry from the previous lap.
    Stale,
    /// Slot holds an entry written during the current lap.
    Fresh,
}

/// Which index drives the generation flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRole {
    /// Software writes entries (send queues, free lists).
    Producer,
    /// Hardware writes entries and software reads them (response queues).
    Consumer,
}

/// Fixed-size circular array of hardware slots.
#[derive(Debug)]
pub struct DescRing<T> {
    slots: Box<[T]>,
    size: u32,
    pidx: u32,
    cidx: u32,
    gen: Generation,
    role: RingRole,
}

impl<T: Copy + Default> DescRing<T> {
    /// Allocates a ring of `size` zeroed slots.
    ///
    /// Producer rings start writing with generation one so that zeroed memory
    /// reads as stale to hardware; consumer rings expect generation one from
    /// hardware for the same reason.
    #[must_use]
    pub fn new(size: u32, role: RingRole) -> Self {
        debug_assert!(size >= 2, "ring must hold at least two slots");
        Self {
            slots: vec![T::default(); size as usize].into_boxed_slice(),
            size,
            pidx: 0,
            cidx: 0,
            gen: Generation::One,
            role,
        }
    }
}

impl<T> DescRing<T> {
    /// Number of slots.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Producer index.
    #[must_use]
    pub const fn pidx(&self) -> u32 {
        self.pidx
    }

    /// Consumer index.
    #[must_use]
    pub const fn cidx(&self) -> u32 {
        self.cidx
    }

    /// Generation owned by the software side of the ring.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.gen
    }

    /// Compares a stamped generation against the one this ring expects.
    #[must_use]
    pub fn slot_state(&self, stamped: Generation) -> SlotState {
        if stamped == self.gen {
            SlotState::Fresh
        } else {
            SlotState::Stale
        }
    }

    /// Slot at `idx`.
    #[must_use]
    pub fn slot(&self, idx: u32) -> &T {
        &self.slots[idx as usize]
    }

    /// Mutable slot at `idx`.
    pub fn slot_mut(&mut self, idx: u32) -> &mut T {
        &mut self.slots[idx as usize]
    }

    /// Slot at the producer index.
    pub fn producer_slot(&mut self) -> &mut T {
        let idx = self.pidx;
        self.slot_mut(idx)
    }

    /// Slot at the consumer index.
    #[must_use]
    pub fn consumer_slot(&self) -> &T {
        self.slot(self.cidx)
    }

    /// Raw pointer to slot `idx`, used for cache prefetch hints.
    #[must_use]
    pub fn slot_ptr(&self, idx: u32) -> *const T {
        &self.slots[(idx % self.size) as usize]
    }

    /// Index following `idx`.
    #[must_use]
    pub const fn next_index(&self, idx: u32) -> u32 {
        if idx + 1 == self.size {
            0
        } else {
            idx + 1
        }
    }

    /// Advances the producer index, returning true when it wrapped.
    pub fn advance_producer(&mut self) -> bool {
        self.pidx = self.next_index(self.pidx);
        let wrapped = self.pidx == 0;
        if wrapped && self.role == RingRole::Producer {
            self.gen = self.gen.flipped();
        }
        wrapped
    }

    /// Advances the consumer index, returning true when it wrapped.
    pub fn advance_consumer(&mut self) -> bool {
        self.cidx = self.next_index(self.cidx);
        let wrapped = self.cidx == 0;
        if wrapped && self.role == RingRole::Consumer {
            self.gen = self.gen.flipped();
        }
        wrapped
    }

    /// Advances the consumer index by `n` slots.
    pub fn advance_consumer_by(&mut self, n: u32) {
        for _ in 0..n {
            self.advance_consumer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_wrap_flips_generation() {
        let mut ring: DescRing<u64> = DescRing::new(4, RingRole::Producer);
        assert_eq!(ring.generation(), Generation::One);
        for _ in 0..3 {
            assert!(!ring.advance_producer());
        }
        assert!(ring.advance_producer());
        assert_eq!(ring.pidx(), 0);
        assert_eq!(ring.generation(), Generation::Zero);
        ring.advance_consumer_by(4);
        assert_eq!(ring.cidx(), 0);
        assert_eq!(ring.generation(), Generation::Zero);
    }

    #[test]
    fn consumer_ring_tracks_fresh_entries() {
        let mut ring: DescRing<u8> = DescRing::new(2, RingRole::Consumer);
        assert_eq!(ring.slot_state(Generation::Zero), SlotState::Stale);
        assert_eq!(ring.slot_state(Generation::One), SlotState::Fresh);
        ring.advance_consumer();
        ring.advance_consumer();
        assert_eq!(ring.slot_state(Generation::One), SlotState::Stale);
        assert_eq!(ring.slot_state(Generation::Zero), SlotState::Fresh);
    }

    #[test]
    fn indices_stay_in_bounds() {
        let mut ring: DescRing<u32> = DescRing::new(7, RingRole::Producer);
        for _ in 0..50 {
            ring.advance_producer();
            ring.advance_consumer();
            assert!(ring.pidx() < ring.size());
            assert!(ring.cidx() < ring.size());
        }
    }
}
