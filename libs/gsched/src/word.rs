// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![expect(
    impl_trait_overcaptures,
    reason = "mycelium_bitfield is not updated to edition 2024 yet"
)]

use crate::loom::sync::atomic::{AtomicU32, Ordering};
use core::fmt;

/// The scheduling word. Everything the blocking-call fast paths need to look at without taking
/// the scheduler lock is packed into a single atomic `u32`:
///
/// ```text
/// | 31       31 | 30       30 | 29      15 | 14   0 |
/// | gwaiting    | waitstop    | mcpumax    | mcpu   |
/// ```
///
/// `mcpu` is only ever changed with wrapping adds on the whole word, so decrementing it below
/// zero borrows out of the field and lands in the reserved range above [`MAX_WORKERS`]. That
/// range is what the "negative mcpu" checks look for.
pub(crate) struct SchedWord {
    val: AtomicU32,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of the scheduling word.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<u32> {
        /// Number of workers currently executing task code.
        pub(crate) const MCPU = 15;
        /// Maximum number of workers allowed to execute task code at once.
        pub(crate) const MCPU_MAX = 15;
        /// Somebody is sleeping on the stop note until `mcpu <= mcpumax`.
        pub(crate) const WAITSTOP: bool;
        /// The global run queue is non-empty.
        pub(crate) const GWAITING: bool;
    }
}

/// Largest permitted value for the number of simultaneously running workers. The values above
/// it are reserved so an accidental decrement of `mcpu` below zero can be caught.
pub const MAX_WORKERS: u32 = Snapshot::MCPU.raw_mask() - 10;

const MCPU_ONE: u32 = Snapshot::MCPU.first_bit();
const WAITSTOP_ONE: u32 = Snapshot::WAITSTOP.first_bit();
const GWAITING_ONE: u32 = Snapshot::GWAITING.first_bit();

static_assertions::const_assert_eq!(MCPU_ONE, 1);
static_assertions::const_assert_eq!(Snapshot::MCPU_MAX.first_bit(), 1 << 15);
static_assertions::const_assert_eq!(WAITSTOP_ONE, 1 << 30);
static_assertions::const_assert_eq!(GWAITING_ONE, 1 << 31);

impl SchedWord {
    pub(crate) fn new() -> Self {
        Self {
            val: AtomicU32::new(0),
        }
    }

    pub(crate) fn load(&self) -> Snapshot {
        Snapshot(self.val.load(Ordering::Acquire))
    }

    /// Atomically increment `mcpu`, returning the new word.
    pub(crate) fn inc_mcpu(&self) -> Snapshot {
        let prev = self.val.fetch_add(MCPU_ONE, Ordering::AcqRel);
        Snapshot(prev.wrapping_add(MCPU_ONE))
    }

    /// Atomically decrement `mcpu`, returning the new word.
    pub(crate) fn dec_mcpu(&self) -> Snapshot {
        let prev = self.val.fetch_sub(MCPU_ONE, Ordering::AcqRel);
        Snapshot(prev.wrapping_sub(MCPU_ONE))
    }

    /// Increment `mcpu` if that keeps it within `mcpumax`. Returns whether it did.
    pub(crate) fn can_add_mcpu(&self) -> bool {
        self.transition(|s| {
            let mcpu = s.mcpu();
            if mcpu >= s.mcpu_max() {
                return false;
            }
            s.set(Snapshot::MCPU, mcpu + 1);
            true
        })
    }

    pub(crate) fn set_mcpu_max(&self, n: u32) {
        debug_assert!(n <= MAX_WORKERS);
        self.transition(|s| {
            s.set(Snapshot::MCPU_MAX, n);
        });
    }

    /// Flip the run-queue-non-empty bit. Callers hold the scheduler lock, so the bit always
    /// agrees with the queue once the lock is released.
    pub(crate) fn set_gwaiting(&self, gwaiting: bool) {
        if gwaiting {
            self.val.fetch_add(GWAITING_ONE, Ordering::AcqRel);
        } else {
            self.val.fetch_sub(GWAITING_ONE, Ordering::AcqRel);
        }
    }

    /// Set `waitstop`, provided the word still reads `current`.
    pub(crate) fn try_set_waitstop(&self, current: Snapshot) -> bool {
        debug_assert!(!current.waitstop());
        self.val
            .compare_exchange(
                current.0,
                current.0 | WAITSTOP_ONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn clear_waitstop(&self) {
        self.val.fetch_sub(WAITSTOP_ONE, Ordering::AcqRel);
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load();
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for SchedWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

impl Snapshot {
    pub(crate) fn mcpu(self) -> u32 {
        Snapshot::MCPU.unpack(self.0)
    }

    pub(crate) fn mcpu_max(self) -> u32 {
        Snapshot::MCPU_MAX.unpack(self.0)
    }

    pub(crate) fn waitstop(self) -> bool {
        self.get(Snapshot::WAITSTOP)
    }

    pub(crate) fn gwaiting(self) -> bool {
        self.get(Snapshot::GWAITING)
    }

    /// Whether `mcpu` went below zero at some point.
    pub(crate) fn mcpu_negative(self) -> bool {
        self.mcpu() > MAX_WORKERS
    }

    /// Whether a blocking call that just left task code has to wake someone up.
    pub(crate) fn needs_attention(self) -> bool {
        self.gwaiting() || (self.waitstop() && self.mcpu() <= self.mcpu_max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::thread;

    #[test]
    fn layout_matches_documented_bits() {
        let word = SchedWord::new();
        word.set_mcpu_max(3);
        word.inc_mcpu();
        word.set_gwaiting(true);

        let s = word.load();
        assert_eq!(s.0, 1 | (3 << 15) | (1 << 31));
        assert!(s.gwaiting());
        assert!(!s.waitstop());
    }

    #[test]
    fn can_add_mcpu_respects_max() {
        let word = SchedWord::new();
        word.set_mcpu_max(2);
        assert!(word.can_add_mcpu());
        assert!(word.can_add_mcpu());
        assert!(!word.can_add_mcpu());
        assert_eq!(word.load().mcpu(), 2);

        word.set_mcpu_max(1);
        assert!(!word.can_add_mcpu());
        assert_eq!(word.load().mcpu(), 2);
    }

    #[test]
    fn decrement_below_zero_is_detectable() {
        let word = SchedWord::new();
        word.set_mcpu_max(4);
        let s = word.dec_mcpu();
        assert!(s.mcpu_negative());
        // the borrow must not leak into the other fields
        assert!(!s.waitstop());
        assert!(!s.gwaiting());
        // nor may it be mistaken for spare capacity
        assert!(!word.can_add_mcpu());

        let s = word.inc_mcpu();
        assert_eq!(s.mcpu(), 0);
        assert!(!s.mcpu_negative());
    }

    #[test]
    fn waitstop_requires_unchanged_word() {
        let word = SchedWord::new();
        word.set_mcpu_max(1);
        word.inc_mcpu();
        word.inc_mcpu();

        let seen = word.load();
        word.dec_mcpu();
        assert!(!word.try_set_waitstop(seen));

        let seen = word.load();
        assert!(word.try_set_waitstop(seen));
        assert!(word.load().waitstop());
        word.clear_waitstop();
        assert!(!word.load().waitstop());
    }

    #[test]
    fn needs_attention() {
        let word = SchedWord::new();
        word.set_mcpu_max(1);
        word.inc_mcpu();
        word.inc_mcpu();
        assert!(!word.load().needs_attention());

        let seen = word.load();
        assert!(word.try_set_waitstop(seen));
        // still above the maximum
        assert!(!word.load().needs_attention());
        assert!(word.dec_mcpu().needs_attention());
    }

    #[test]
    fn racing_can_add_mcpu_admits_at_most_max() {
        crate::loom::model(|| {
            let word = Arc::new(SchedWord::new());
            word.set_mcpu_max(1);

            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let word = word.clone();
                    thread::spawn(move || word.can_add_mcpu())
                })
                .collect();

            let admitted = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|ok| *ok)
                .count();

            assert_eq!(admitted, 1);
            assert_eq!(word.load().mcpu(), 1);
        });
    }

    #[test]
    fn blocking_calls_race_with_max_change() {
        crate::loom::model(|| {
            let word = Arc::new(SchedWord::new());
            word.set_mcpu_max(2);
            assert!(word.can_add_mcpu());
            assert!(word.can_add_mcpu());

            let blocking = {
                let word = word.clone();
                thread::spawn(move || {
                    word.dec_mcpu();
                    word.inc_mcpu();
                })
            };
            word.set_mcpu_max(1);
            blocking.join().unwrap();

            let s = word.load();
            assert_eq!(s.mcpu(), 2);
            assert_eq!(s.mcpu_max(), 1);
        });
    }
}
