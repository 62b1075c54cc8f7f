//! Debug-only detection of self-deadlocking nesting.
//!
//! A descriptor is only retracted when its holder finishes, so a thread
//! that admits a second descriptor whose scan blocks on its own first one
//! spins forever. The same holds for raising a fence over one's own
//! non-share descriptor, and for re-raising flag bits the thread already
//! has up. A thread-local ledger of held entries and fences catches all
//! three shapes and panics with a diagnostic; release builds skip the
//! bookkeeping entirely.

use crate::internal::cell::{Kind, Verdict};
use std::cell::RefCell;

#[derive(Copy, Clone)]
enum Held {
    Entry {
        ring:  usize,
        kind:  Kind,
        lane:  u32,
        epoch: u16,
    },
    Fence {
        ring:  usize,
        flags: u16,
    },
}

thread_local! {
    static HELD: RefCell<Vec<Held>> = const { RefCell::new(Vec::new()) };
}

/// Panics if an admission of `(kind, lane)` on `ring` would spin on a
/// descriptor this thread already holds there.
pub fn check_admit(ring: usize, kind: Kind, lane: u32, conflicts: &dyn Fn(u32, u32) -> bool) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD.with(|held| {
        for op in held.borrow().iter() {
            if let Held::Entry {
                ring: held_ring,
                kind: held_kind,
                lane: held_lane,
                ..
            } = *op
            {
                if held_ring != ring {
                    continue;
                }
                let blocked = match kind.against(held_kind) {
                    Verdict::Block => true,
                    Verdict::Lanes => conflicts(lane, held_lane),
                    Verdict::Pass => false,
                };
                assert!(
                    !blocked,
                    "admitting {:?} on lane {} would spin on this thread's own live {:?} \
                     descriptor; nested conflicting admissions deadlock",
                    kind, lane, held_kind
                );
            }
        }
    });
}

/// Panics if raising `flags` on `ring` would spin on this thread's own
/// non-share descriptor, or collide with its own raised fence bits.
pub fn check_fence(ring: usize, flags: u16) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD.with(|held| {
        for op in held.borrow().iter() {
            match *op {
                Held::Entry {
                    ring: held_ring,
                    kind,
                    ..
                } if held_ring == ring => {
                    assert!(
                        kind.is_share(),
                        "raising a fence would drain this thread's own live {:?} descriptor; \
                         only share descriptors may be held across a fence",
                        kind
                    );
                }
                Held::Fence {
                    ring: held_ring,
                    flags: held_flags,
                } if held_ring == ring => {
                    assert!(
                        held_flags & flags == 0,
                        "flag bits {:#06x} overlap a fence this thread already holds; \
                         the raise would spin forever",
                        flags
                    );
                }
                _ => {}
            }
        }
    });
}

pub fn note_admit(ring: usize, kind: Kind, lane: u32, epoch: u16) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD.with(|held| {
        held.borrow_mut().push(Held::Entry {
            ring,
            kind,
            lane,
            epoch,
        })
    });
}

pub fn forget_admit(ring: usize, epoch: u16) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        let index = held
            .iter()
            .position(|op| {
                matches!(
                    op,
                    Held::Entry { ring: r, epoch: e, .. } if *r == ring && *e == epoch
                )
            })
            .expect("retracted an entry this thread never recorded");
        let _ = held.swap_remove(index);
    });
}

pub fn note_fence(ring: usize, flags: u16) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD.with(|held| held.borrow_mut().push(Held::Fence { ring, flags }));
}

pub fn forget_fence(ring: usize, flags: u16) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        let index = held
            .iter()
            .position(|op| {
                matches!(
                    op,
                    Held::Fence { ring: r, flags: f } if *r == ring && *f == flags
                )
            })
            .expect("cleared a fence this thread never recorded");
        let _ = held.swap_remove(index);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_tracks_entries() {
        check_admit(1, Kind::LockLane, 7, &|a, b| a == b);
        note_admit(1, Kind::LockLane, 7, 0);
        // a different ring is fine
        check_admit(2, Kind::LockLane, 7, &|a, b| a == b);
        // a non-conflicting lane on the same ring is fine
        check_admit(1, Kind::LockLane, 8, &|a, b| a == b);
        forget_admit(1, 0);
        // conflicting again once the first entry is gone
        check_admit(1, Kind::LockLane, 7, &|a, b| a == b);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "deadlock")]
    fn nested_conflicting_admission_panics() {
        note_admit(3, Kind::LockLane, 7, 0);
        let result = std::panic::catch_unwind(|| {
            check_admit(3, Kind::LockLane, 7, &|a, b| a == b);
        });
        forget_admit(3, 0);
        std::panic::resume_unwind(result.unwrap_err());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "only share descriptors")]
    fn fence_over_own_writer_panics() {
        note_admit(4, Kind::OrderLane, 1, 0);
        let result = std::panic::catch_unwind(|| check_fence(4, 0b1));
        forget_admit(4, 0);
        std::panic::resume_unwind(result.unwrap_err());
    }

    #[test]
    fn fence_over_own_share_is_fine() {
        note_admit(5, Kind::ShareLane, 1, 0);
        check_fence(5, 0b1);
        forget_admit(5, 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "overlap")]
    fn overlapping_fence_bits_panic() {
        note_fence(6, 0b11);
        let result = std::panic::catch_unwind(|| check_fence(6, 0b10));
        forget_fence(6, 0b11);
        std::panic::resume_unwind(result.unwrap_err());
    }
}
