//! The coordination log itself: [`Roundabout`].
//!
//! A roundabout is a fixed ring of 32 descriptor cells behind a single
//! packed header word. Threads publish a descriptor of the operation they
//! are about to perform, scan every earlier still-live descriptor for
//! conflicts, run, and retract. Admission order fixes a global epoch
//! ordering, so the one structure behaves as an exclusive lock, a
//! reader-writer lock, a keyed fine-grained lock, or an RCU-style fence,
//! depending on the [`Claim`] each thread publishes.
//!
//! Nothing here blocks in the OS: waiting is spinning with a pause hint
//! and bounded exponential backoff, and nothing allocates after
//! construction.

use crate::{
    conflict::{Conflict, LaneEq},
    internal::{
        cell::{AtomicCell, Descriptor, Kind, Verdict},
        header::{AtomicHeader, Header, WIDTH},
        reentry,
    },
    stats,
};
use crossbeam_utils::Backoff;
use std::{
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    mem,
};

/// What an admission intends to do, and over what scope.
///
/// Lane claims carry a 32-bit key naming the resource they touch; ring
/// claims span every lane. Strictness grows downwards: shares never order
/// among themselves, orders serialize against other orders and locks,
/// locks exclude everything that collides with them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    /// Non-ordered use of one lane; waits only for `LockLane` on a
    /// conflicting lane and for `LockRing`.
    ShareLane(u32),
    /// Non-ordered use of the whole ring; waits only for `LockLane`
    /// and `LockRing`.
    ShareRing,
    /// Serialized against `Order`/`Lock` claims on a conflicting lane;
    /// ignores shares.
    OrderLane(u32),
    /// Serialized against every `Order`/`Lock` claim; ignores shares.
    OrderRing,
    /// Exclusive over a lane: waits for any predecessor that collides with
    /// it, and blocks any such successor.
    LockLane(u32),
    /// Exclusive over everything.
    LockRing,
}

impl Claim {
    #[inline]
    fn parts(self) -> (Kind, u32) {
        match self {
            Claim::ShareLane(lane) => (Kind::ShareLane, lane),
            Claim::ShareRing => (Kind::ShareRing, 0),
            Claim::OrderLane(lane) => (Kind::OrderLane, lane),
            Claim::OrderRing => (Kind::OrderRing, 0),
            Claim::LockLane(lane) => (Kind::LockLane, lane),
            Claim::LockRing => (Kind::LockRing, 0),
        }
    }
}

/// A live admission: slot index, admission epoch, the flags seen at
/// admission, and the pre-admission occupancy snapshot (exactly the set of
/// predecessors the scan must examine).
#[derive(Copy, Clone)]
struct Slot {
    n:      usize,
    epoch:  u16,
    flags:  u16,
    kind:   Kind,
    lane:   u32,
    bitmap: u32,
}

/// A transient fence record; lives only on the raiser's stack.
#[derive(Copy, Clone)]
struct FenceRecord {
    epoch:  u16,
    raised: u16,
    merged: u16,
    bitmap: u32,
}

/// A fixed-capacity lock-free coordination log.
///
/// The zero value is the valid empty state, so construction is `const` and
/// a `static Roundabout` needs no lazy initialization. At most
/// [`CAPACITY`](Self::CAPACITY) operations can be live at once; admission
/// beyond that spins until a slot retracts.
///
/// # Examples
///
/// ```
/// use roundabout::Roundabout;
///
/// static LOG: Roundabout = Roundabout::new();
///
/// let two = LOG.lock_ring(|_epoch, _flags| 1 + 1);
/// assert_eq!(two, 2);
/// assert_eq!(LOG.epoch(), 1);
/// ```
pub struct Roundabout<C: Conflict = LaneEq> {
    header:   AtomicHeader,
    log:      [AtomicCell; WIDTH],
    conflict: C,
}

impl Roundabout<LaneEq> {
    /// A new log with exact-match lane conflicts.
    #[inline]
    pub const fn new() -> Self {
        Roundabout::with_conflict(LaneEq)
    }
}

impl Default for Roundabout<LaneEq> {
    #[inline]
    fn default() -> Self {
        Roundabout::new()
    }
}

impl<C: Conflict> Debug for Roundabout<C> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        let header = self.header.peek();
        formatter
            .debug_struct("Roundabout")
            .field("epoch", &header.epoch)
            .field("flags", &format_args!("{:016b}", header.flags))
            .field("bitmap", &format_args!("{:032b}", header.bitmap))
            .finish()
    }
}

impl<C: Conflict> Roundabout<C> {
    /// Maximum number of simultaneously live admissions.
    pub const CAPACITY: usize = WIDTH;

    /// A new log with a custom lane-conflict predicate.
    ///
    /// See [`Conflict`] for the predicate contract.
    #[inline]
    pub const fn with_conflict(conflict: C) -> Self {
        Roundabout {
            header: AtomicHeader::new(),
            log: [AtomicCell::ZERO; WIDTH],
            conflict,
        }
    }

    // ---- introspection ----

    /// The ordinal the next admission will receive. Advisory: not a
    /// consistent snapshot with anything else.
    #[inline]
    pub fn epoch(&self) -> u16 {
        self.header.peek().epoch
    }

    /// The advisory flag bits currently raised.
    #[inline]
    pub fn flags(&self) -> u16 {
        self.header.peek().flags
    }

    /// Whether the admission made at `epoch` is still live.
    ///
    /// An epoch more than [`CAPACITY`](Self::CAPACITY) admissions old can
    /// no longer be represented and reports `false`; so does the current
    /// (not-yet-admitted) epoch.
    ///
    /// ```
    /// use roundabout::{Claim, Roundabout};
    ///
    /// let log = Roundabout::new();
    /// let entry = log.acquire(Claim::ShareLane(1));
    /// assert!(log.is_active(entry.epoch()));
    /// let epoch = entry.epoch();
    /// drop(entry);
    /// assert!(!log.is_active(epoch));
    /// ```
    #[inline]
    pub fn is_active(&self, epoch: u16) -> bool {
        let header = self.header.load();
        let age = header.epoch.wrapping_sub(epoch);
        if age == 0 || age > WIDTH as u16 {
            return false;
        }
        header.bitmap & (1 << (epoch as usize % WIDTH)) != 0
    }

    // ---- scoped acquisition ----

    /// Admits `claim`, waits out every conflicting predecessor, and returns
    /// a guard. The descriptor stays published, excluding whatever the
    /// claim excludes, until the guard drops.
    ///
    /// # Examples
    ///
    /// ```
    /// use roundabout::{Claim, Roundabout};
    ///
    /// let log = Roundabout::new();
    /// let first = log.acquire(Claim::ShareLane(1));
    /// let second = log.acquire(Claim::ShareLane(2)); // shares don't conflict
    /// assert_eq!(second.epoch(), first.epoch().wrapping_add(1));
    /// ```
    ///
    /// # Deadlock
    ///
    /// Acquiring a claim that conflicts with an entry the same thread
    /// already holds spins forever; debug builds panic instead.
    pub fn acquire(&self, claim: Claim) -> Entry<'_, C> {
        let (kind, lane) = claim.parts();
        reentry::check_admit(self.key(), kind, lane, &|a, b| self.conflict.conflicts(a, b));
        let slot = self.admit(kind, lane);
        reentry::note_admit(self.key(), kind, lane, slot.epoch);
        let entry = Entry {
            ring:    self,
            slot,
            _unsend: PhantomData,
        };
        self.wait_on(&entry.slot);
        entry
    }

    /// Raises `flags` in the header, then waits for every live non-share
    /// predecessor to retract. The flags stay raised, visible to every
    /// subsequent admission, until the guard drops or
    /// [`complete`](FenceGuard::complete)s.
    ///
    /// Consumes no ring slot. Spins while any requested bit is already
    /// raised, so concurrent fences must use disjoint bits.
    pub fn raise_fence(&self, flags: u16) -> FenceGuard<'_, C> {
        reentry::check_fence(self.key(), flags);
        let record = self.raise(flags);
        reentry::note_fence(self.key(), flags);
        let fence = FenceGuard {
            ring:    self,
            record,
            _unsend: PhantomData,
        };
        self.drain(&fence.record);
        fence
    }

    // ---- closure operations ----

    /// Runs `f` exclusively over `lane`: after every conflicting
    /// predecessor of any kind has retracted, excluding every conflicting
    /// successor. Returns `f`'s result verbatim.
    #[inline]
    pub fn lock_lane<R>(&self, lane: u32, f: impl FnOnce(u16, u16) -> R) -> R {
        self.run(Claim::LockLane(lane), f)
    }

    /// Runs `f` serialized against other `Order`/`Lock` operations on a
    /// conflicting lane, while shares flow past freely.
    #[inline]
    pub fn order_lane<R>(&self, lane: u32, f: impl FnOnce(u16, u16) -> R) -> R {
        self.run(Claim::OrderLane(lane), f)
    }

    /// Runs `f` as a reader of `lane`: concurrent with everything except an
    /// exclusive writer on a conflicting lane.
    #[inline]
    pub fn share_lane<R>(&self, lane: u32, f: impl FnOnce(u16, u16) -> R) -> R {
        self.run(Claim::ShareLane(lane), f)
    }

    /// Runs `f` once every other live operation has retracted, and holds
    /// every later arrival until `f` returns. The big lock.
    ///
    /// The callback receives the admission epoch and the flags seen at
    /// admission.
    ///
    /// # Examples
    ///
    /// ```
    /// use roundabout::Roundabout;
    ///
    /// let log = Roundabout::new();
    /// let epoch = log.lock_ring(|epoch, _flags| epoch);
    /// assert_eq!(epoch, 0);
    /// ```
    #[inline]
    pub fn lock_ring<R>(&self, f: impl FnOnce(u16, u16) -> R) -> R {
        self.run(Claim::LockRing, f)
    }

    /// Runs `f` serialized against every other `Order`/`Lock` operation,
    /// ring-wide, while shares flow past freely.
    #[inline]
    pub fn order_ring<R>(&self, f: impl FnOnce(u16, u16) -> R) -> R {
        self.run(Claim::OrderRing, f)
    }

    /// Runs `f` as a ring-wide reader: concurrent with everything except
    /// exclusive writers.
    #[inline]
    pub fn share_ring<R>(&self, f: impl FnOnce(u16, u16) -> R) -> R {
        self.run(Claim::ShareRing, f)
    }

    /// Raises `flags`, waits for every live non-share predecessor to
    /// retract, runs `f`, then lowers the flags, even if `f` panics.
    ///
    /// The callback receives the epoch at which the fence was raised and
    /// the merged flag value. Shares are deliberately not drained: a fence
    /// serializes against mutators, and readers that must respect it can
    /// observe the raised bits themselves.
    ///
    /// # Examples
    ///
    /// ```
    /// use roundabout::Roundabout;
    ///
    /// let log = Roundabout::new();
    /// let seen = log.fence(0b1, |_epoch, flags| flags);
    /// assert_eq!(seen, 0b1);
    /// assert_eq!(log.flags(), 0);
    /// ```
    #[inline]
    pub fn fence<R>(&self, flags: u16, f: impl FnOnce(u16, u16) -> R) -> R {
        let fence = self.raise_fence(flags);
        f(fence.epoch(), fence.flags())
    }

    /// A fence with a post-clear notification.
    ///
    /// Raises `flags`, drains non-share predecessors, and runs `f`. If `f`
    /// succeeds, the flags are lowered and `after` receives the epoch span
    /// `(start, end)` during which they were raised, i.e. the admissions
    /// that saw the fence. If `f` fails, the flags are still lowered but `after`
    /// never runs and the error is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use roundabout::Roundabout;
    ///
    /// let log = Roundabout::new();
    /// let span = log.phase::<_, ()>(
    ///     0b10,
    ///     |_, _| {
    ///         log.lock_lane(3, |_, flags| assert_eq!(flags, 0b10));
    ///         Ok(())
    ///     },
    ///     |start, end| Ok(end.wrapping_sub(start)),
    /// );
    /// assert_eq!(span, Ok(1));
    /// ```
    pub fn phase<T, E>(
        &self,
        flags: u16,
        f: impl FnOnce(u16, u16) -> Result<(), E>,
        after: impl FnOnce(u16, u16) -> Result<T, E>,
    ) -> Result<T, E> {
        let fence = self.raise_fence(flags);
        let start = fence.epoch();
        // an early return drops the guard, clearing the flags without
        // running `after`
        f(start, fence.flags())?;
        let end = fence.complete();
        after(start, end)
    }

    #[inline]
    fn run<R>(&self, claim: Claim, f: impl FnOnce(u16, u16) -> R) -> R {
        let entry = self.acquire(claim);
        f(entry.epoch(), entry.flags())
    }

    // ---- admission ----

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as *const () as usize
    }

    /// One admission attempt. Fails if the target slot is still occupied or
    /// a competitor wins the header CAS.
    #[inline]
    fn try_admit(&self, kind: Kind, lane: u32) -> Option<Slot> {
        let header = self.header.load();
        let n = header.slot();
        let bit = 1u32 << n;
        if header.bitmap & bit != 0 {
            return None;
        }
        let next = Header {
            epoch:  header.epoch.wrapping_add(1),
            flags:  header.flags,
            bitmap: header.bitmap | bit,
        };
        if !self.header.try_replace(header, next) {
            return None;
        }
        // the CAS published slot ownership; this store publishes the
        // descriptor. Observers in between see the resting Pending value
        // (or raw zero on the first lap) and spin.
        self.log[n].publish(Descriptor {
            epoch: header.epoch,
            kind,
            lane,
        });
        Some(Slot {
            n,
            epoch: header.epoch,
            flags: header.flags,
            kind,
            lane,
            bitmap: header.bitmap,
        })
    }

    #[inline]
    fn admit(&self, kind: Kind, lane: u32) -> Slot {
        match self.try_admit(kind, lane) {
            Some(slot) => {
                stats::push_retries(0);
                slot
            }
            None => self.admit_slow(kind, lane),
        }
    }

    #[cold]
    #[inline(never)]
    fn admit_slow(&self, kind: Kind, lane: u32) -> Slot {
        let backoff = Backoff::new();
        let mut retries = 1;
        loop {
            backoff.snooze();
            if let Some(slot) = self.try_admit(kind, lane) {
                stats::push_retries(retries);
                return slot;
            }
            retries += 1;
        }
    }

    // ---- conflict scan ----

    /// Waits until no earlier live descriptor conflicts with `slot`.
    ///
    /// Walks the pre-admission snapshot oldest-first: epochs
    /// `slot.epoch - 31 ..= slot.epoch - 1`, skipping slots that were free
    /// at admission. The snapshot cannot contain anyone admitted after us,
    /// and a recycled slot is recognizable by an epoch at least one
    /// generation ahead of the expected one.
    fn wait_on(&self, slot: &Slot) {
        if slot.bitmap == 0 {
            return;
        }
        let mut spins = 0;
        let mut expected = slot.epoch.wrapping_sub(WIDTH as u16);
        // rotate our own slot down to bit 0; predecessors then pop out of
        // the low bit in epoch order
        let mut mask = slot.bitmap.rotate_right(slot.n as u32);
        for _ in 1..WIDTH {
            expected = expected.wrapping_add(1);
            mask >>= 1;
            if mask & 1 == 0 {
                continue;
            }
            self.outwait(slot, expected, &mut spins);
        }
        stats::scan_spins(spins);
    }

    /// Spins on one predecessor slot until it retires, recycles past us, or
    /// proves non-conflicting.
    fn outwait(&self, slot: &Slot, expected: u16, spins: &mut usize) {
        let cell = &self.log[expected as usize % WIDTH];
        let backoff = Backoff::new();
        loop {
            let pred = cell.load();
            if pred.is_zero() {
                // claimed before we arrived, store not yet visible
            } else if pred.epoch != expected {
                // retired, or already recycled a full generation past us
                return;
            } else {
                match slot.kind.against(pred.kind) {
                    Verdict::Pass => return,
                    Verdict::Block => {}
                    Verdict::Lanes => {
                        if !self.conflict.conflicts(slot.lane, pred.lane) {
                            return;
                        }
                    }
                }
            }
            *spins += 1;
            backoff.snooze();
        }
    }

    // ---- retraction ----

    /// Releases a slot: resting store first, then the occupancy bit clear.
    /// An admitter that wins the freed bit can therefore never race the
    /// retracter's cell write.
    fn retire(&self, slot: &Slot) {
        self.log[slot.n].publish(Descriptor::resting(slot.epoch));
        self.header.clear_slot(slot.n);
    }

    // ---- fences ----

    /// One raise attempt. Fails if a requested bit is already raised (a
    /// concurrent fence owns it) or the header CAS is lost.
    #[inline]
    fn try_raise(&self, flags: u16) -> Option<FenceRecord> {
        let header = self.header.load();
        if header.flags & flags != 0 {
            return None;
        }
        let merged = header.flags | flags;
        let next = Header {
            epoch: header.epoch,
            flags: merged,
            bitmap: header.bitmap,
        };
        if !self.header.try_replace(header, next) {
            return None;
        }
        Some(FenceRecord {
            epoch: header.epoch,
            raised: flags,
            merged,
            bitmap: header.bitmap,
        })
    }

    #[inline]
    fn raise(&self, flags: u16) -> FenceRecord {
        match self.try_raise(flags) {
            Some(record) => {
                stats::fence_retries(0);
                record
            }
            None => self.raise_slow(flags),
        }
    }

    #[cold]
    #[inline(never)]
    fn raise_slow(&self, flags: u16) -> FenceRecord {
        let backoff = Backoff::new();
        let mut retries = 1;
        loop {
            backoff.snooze();
            if let Some(record) = self.try_raise(flags) {
                stats::fence_retries(retries);
                return record;
            }
            retries += 1;
        }
    }

    /// Waits for every live non-share predecessor in the raise snapshot to
    /// retract. A fence consumes no slot, so all 32 bits are potential
    /// predecessors.
    fn drain(&self, record: &FenceRecord) {
        if record.bitmap == 0 {
            return;
        }
        let mut spins = 0;
        let mut expected = record.epoch.wrapping_sub(WIDTH as u16);
        let mut mask = record.bitmap.rotate_right((record.epoch as usize % WIDTH) as u32);
        for _ in 0..WIDTH {
            if mask & 1 != 0 {
                self.outwait_mutator(expected, &mut spins);
            }
            expected = expected.wrapping_add(1);
            mask >>= 1;
        }
        stats::fence_spins(spins);
    }

    /// Spins on one predecessor until it retires or proves to be a share.
    /// Shares never mutate; a fence only serializes against mutators.
    fn outwait_mutator(&self, expected: u16, spins: &mut usize) {
        let cell = &self.log[expected as usize % WIDTH];
        let backoff = Backoff::new();
        loop {
            let pred = cell.load();
            if pred.is_zero() {
                // claimed but not yet written; kind unknown, keep waiting
            } else if pred.epoch != expected || pred.kind.is_share() {
                return;
            }
            *spins += 1;
            backoff.snooze();
        }
    }

    /// Lowers the raised bits and reports the epoch at the moment of
    /// clearing: the end of the span during which the fence was visible.
    fn lower(&self, record: &FenceRecord) -> u16 {
        let backoff = Backoff::new();
        loop {
            let header = self.header.load();
            let next = Header {
                epoch:  header.epoch,
                flags:  header.flags ^ record.raised,
                bitmap: header.bitmap,
            };
            if self.header.try_replace(header, next) {
                return header.epoch;
            }
            backoff.spin();
        }
    }
}

/// A live admission; dropping it retracts the descriptor.
///
/// Retraction happens exactly once, on drop, including during unwinding:
/// a panicking critical section cannot pin its slot. The guard is not
/// `Send`: the descriptor belongs to the admitting thread.
#[must_use = "dropping an Entry immediately retracts it"]
pub struct Entry<'rb, C: Conflict = LaneEq> {
    ring:    &'rb Roundabout<C>,
    slot:    Slot,
    _unsend: PhantomData<*mut ()>,
}

impl<C: Conflict> Entry<'_, C> {
    /// This admission's ordinal: its position in the global operation
    /// order.
    #[inline]
    pub fn epoch(&self) -> u16 {
        self.slot.epoch
    }

    /// The advisory flag bits observed at admission.
    #[inline]
    pub fn flags(&self) -> u16 {
        self.slot.flags
    }
}

impl<C: Conflict> Debug for Entry<'_, C> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Entry")
            .field("epoch", &self.slot.epoch)
            .field("kind", &self.slot.kind)
            .field("lane", &self.slot.lane)
            .finish()
    }
}

impl<C: Conflict> Drop for Entry<'_, C> {
    #[inline]
    fn drop(&mut self) {
        self.ring.retire(&self.slot);
        reentry::forget_admit(self.ring.key(), self.slot.epoch);
    }
}

/// A raised fence; dropping it lowers the flags.
///
/// Obtained from [`Roundabout::raise_fence`], after the drain has
/// completed: by the time the guard exists, every non-share predecessor
/// has retracted.
#[must_use = "dropping a FenceGuard immediately lowers its flags"]
pub struct FenceGuard<'rb, C: Conflict = LaneEq> {
    ring:    &'rb Roundabout<C>,
    record:  FenceRecord,
    _unsend: PhantomData<*mut ()>,
}

impl<C: Conflict> FenceGuard<'_, C> {
    /// The epoch at which the fence was raised: admissions from here on
    /// saw the flags.
    #[inline]
    pub fn epoch(&self) -> u16 {
        self.record.epoch
    }

    /// The merged header flag value while this fence is up.
    #[inline]
    pub fn flags(&self) -> u16 {
        self.record.merged
    }

    /// Lowers the flags and returns the epoch at the moment of clearing.
    /// Together with [`epoch`](Self::epoch) this brackets the admissions
    /// that ran under the fence.
    #[inline]
    pub fn complete(self) -> u16 {
        let end = self.ring.lower(&self.record);
        reentry::forget_fence(self.ring.key(), self.record.raised);
        mem::forget(self);
        end
    }
}

impl<C: Conflict> Debug for FenceGuard<'_, C> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("FenceGuard")
            .field("epoch", &self.record.epoch)
            .field("raised", &format_args!("{:016b}", self.record.raised))
            .finish()
    }
}

impl<C: Conflict> Drop for FenceGuard<'_, C> {
    #[inline]
    fn drop(&mut self) {
        let _end = self.ring.lower(&self.record);
        reentry::forget_fence(self.ring.key(), self.record.raised);
    }
}
