//! Ring cells: one packed descriptor word per slot, plus the conflict
//! matrix that decides how descriptors interact.

use crate::internal::header::WIDTH;
use std::{
    fmt::{self, Debug, Formatter},
    sync::atomic::{AtomicU64, Ordering::*},
};

const EPOCH_SHIFT: u32 = 48;
const KIND_SHIFT: u32 = 32;

/// Conflict semantics of a descriptor, in increasing strictness.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Kind {
    /// Raw zeroed memory; the slot has never been written.
    Zero = 0,
    /// Slot claimed in the header but the descriptor store is still in
    /// flight. Also the resting state a retraction leaves behind.
    Pending = 1,
    /// Non-ordered; excluded only by exclusive writers on a conflicting lane.
    ShareLane = 2,
    /// Non-ordered; excluded only by exclusive writers anywhere.
    ShareRing = 3,
    /// Ordered among Order/Lock on a conflicting lane; ignores shares.
    OrderLane = 4,
    /// Ordered among Order/Lock anywhere; ignores shares.
    OrderRing = 5,
    /// Exclusive over its lane.
    LockLane = 6,
    /// Exclusive over the whole ring.
    LockRing = 7,
}

/// What a scanner does about one live predecessor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Irrelevant; move to the next predecessor.
    Pass,
    /// Excludes us; reload and spin.
    Block,
    /// Conflict iff the lanes collide under the installed predicate.
    Lanes,
}

impl Kind {
    #[inline]
    fn from_bits(bits: u16) -> Kind {
        match bits {
            0 => Kind::Zero,
            1 => Kind::Pending,
            2 => Kind::ShareLane,
            3 => Kind::ShareRing,
            4 => Kind::OrderLane,
            5 => Kind::OrderRing,
            6 => Kind::LockLane,
            7 => Kind::LockRing,
            bits => unreachable!("corrupt descriptor kind: {}", bits),
        }
    }

    #[inline]
    pub fn is_share(self) -> bool {
        matches!(self, Kind::ShareLane | Kind::ShareRing)
    }

    /// Conflict decision for `self` (the scanner) against one predecessor
    /// observed at the expected epoch.
    ///
    /// A `Pending` predecessor always blocks: its slot is claimed but the
    /// descriptor is not readable yet, so its strictness is unknown.
    pub fn against(self, pred: Kind) -> Verdict {
        use Kind::*;
        use Verdict::*;
        debug_assert!(
            !matches!(self, Zero | Pending),
            "placeholder descriptors never scan"
        );
        match (self, pred) {
            (_, Zero) | (_, Pending) => Block,
            (LockRing, _) | (_, LockRing) => Block,

            (ShareLane, LockLane) => Lanes,
            (ShareLane, _) => Pass,

            (ShareRing, LockLane) => Block,
            (ShareRing, _) => Pass,

            (OrderLane, ShareLane) | (OrderLane, ShareRing) => Pass,
            (OrderLane, OrderLane) | (OrderLane, LockLane) => Lanes,
            (OrderLane, OrderRing) => Block,

            (OrderRing, ShareLane) | (OrderRing, ShareRing) => Pass,
            (OrderRing, OrderLane) | (OrderRing, OrderRing) | (OrderRing, LockLane) => Block,

            (LockLane, ShareLane) | (LockLane, OrderLane) | (LockLane, LockLane) => Lanes,
            (LockLane, ShareRing) | (LockLane, OrderRing) => Block,

            (Zero, _) | (Pending, _) => Block,
        }
    }
}

/// One decoded descriptor: `<epoch:16> <kind:16> <lane:32>`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub epoch: u16,
    pub kind:  Kind,
    pub lane:  u32,
}

impl Descriptor {
    /// The resting value a retraction leaves behind: the next epoch that
    /// will target this slot, still unwritten.
    #[inline]
    pub fn resting(epoch: u16) -> Self {
        Descriptor {
            epoch: epoch.wrapping_add(WIDTH as u16),
            kind:  Kind::Pending,
            lane:  0,
        }
    }

    #[inline]
    pub fn pack(self) -> u64 {
        (u64::from(self.epoch) << EPOCH_SHIFT)
            | (u64::from(self.kind as u16) << KIND_SHIFT)
            | u64::from(self.lane)
    }

    #[inline]
    pub fn unpack(bits: u64) -> Self {
        Descriptor {
            epoch: (bits >> EPOCH_SHIFT) as u16,
            kind:  Kind::from_bits((bits >> KIND_SHIFT) as u16),
            lane:  bits as u32,
        }
    }

    /// Whole-word zero: memory never written since construction.
    #[inline]
    pub fn is_zero(self) -> bool {
        self.kind == Kind::Zero
    }
}

pub struct AtomicCell(AtomicU64);

impl AtomicCell {
    pub const ZERO: AtomicCell = AtomicCell(AtomicU64::new(0));

    /// Acquire load pairing with the owner's release [`publish`].
    ///
    /// [`publish`]: AtomicCell::publish
    #[inline]
    pub fn load(&self) -> Descriptor {
        Descriptor::unpack(self.0.load(Acquire))
    }

    #[inline]
    pub fn publish(&self, descriptor: Descriptor) {
        self.0.store(descriptor.pack(), Release);
    }
}

impl Debug for AtomicCell {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        self.load().fmt(formatter)
    }
}
