//! # Physical page-frame allocator
//!
//! A binary buddy allocator over a table of [`FrameRecord`]s, one per frame
//! in the managed span. Runs of `2^order` frames (`order <= MAX_ORDER`) are
//! kept on one doubly-linked free list per order. The links are indices into
//! the table, so the allocator never dereferences the frames it manages.
//!
//! Runs are aligned to their own length in absolute frame numbers: the buddy
//! of the run at `pfn` with order `o` starts at `pfn ^ (1 << o)`.
//!
//! ```text
//!   order 2 ─► [8..12)
//!   order 1 ─► [2..4) ◄─► [14..16)
//!   order 0 ─► [1]
//! ```
//!
//! Requests that are not a power of two are rounded up, split, and the
//! surplus tail frames go straight back to the free lists.

use crate::addr::{Pfn, frames_within};
use crate::config::{MAX_ORDER, ORDER_COUNT};
use crate::early::EarlyAllocator;
use crate::error::AllocError;
use core::fmt;
use core::ops::Range;
use kernel_sync::{LockMode, TicketMutex};
use log::{info, trace, warn};

const NIL: u32 = u32::MAX;

/// Largest request served in one call.
pub const MAX_FRAMES_PER_REQUEST: usize = 1 << MAX_ORDER;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// Not usable memory (hole in the memory map, firmware, kernel image).
    Reserved,
    Allocated,
    /// First frame of a free run of `2^order` frames.
    Free { order: u8 },
    /// Any other frame of a free run.
    FreeTail,
}

/// One entry of the frame table.
#[derive(Copy, Clone, Debug)]
pub struct FrameRecord {
    state: FrameState,
    prev: u32,
    next: u32,
}

impl FrameRecord {
    pub const RESERVED: Self = Self {
        state: FrameState::Reserved,
        prev: NIL,
        next: NIL,
    };

    #[inline]
    #[must_use]
    pub const fn state(&self) -> FrameState {
        self.state
    }
}

impl Default for FrameRecord {
    fn default() -> Self {
        Self::RESERVED
    }
}

/// Snapshot of the frame allocator counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    /// Number of free runs on each order's list.
    pub free_runs: [usize; ORDER_COUNT],
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frames: {} free / {} total; runs", self.free, self.total)?;
        for (order, n) in self.free_runs.iter().enumerate() {
            if *n != 0 {
                write!(f, " o{order}={n}")?;
            }
        }
        Ok(())
    }
}

pub struct FrameAllocator<'a> {
    table: &'a mut [FrameRecord],
    first: Pfn,
    heads: [u32; ORDER_COUNT],
    runs: [usize; ORDER_COUNT],
    free: usize,
}

impl<'a> FrameAllocator<'a> {
    /// Covers the frames `first .. first + table.len()`, all of them reserved.
    ///
    /// # Panics
    /// If the table has more entries than a `u32` index can address.
    pub fn new(table: &'a mut [FrameRecord], first: Pfn) -> Self {
        assert!(table.len() < NIL as usize, "frame table too large");
        table.fill(FrameRecord::RESERVED);
        Self {
            table,
            first,
            heads: [NIL; ORDER_COUNT],
            runs: [0; ORDER_COUNT],
            free: 0,
        }
    }

    /// Builds a frame table for `[phys_start, phys_end)` out of early memory
    /// and releases every whole frame in that range.
    ///
    /// # Safety
    /// The early window must be mapped, writable and otherwise unused.
    pub unsafe fn init(
        early: &mut EarlyAllocator,
        phys_start: u64,
        phys_end: u64,
    ) -> FrameAllocator<'static> {
        let span = frames_within(phys_start, phys_end);
        let mut frames = unsafe { FrameAllocator::with_span(early, span.clone()) };
        frames.release_range(span);
        frames
    }

    /// Builds a table covering `span` out of early memory, all reserved.
    ///
    /// # Safety
    /// See [`init`](Self::init).
    pub unsafe fn with_span(
        early: &mut EarlyAllocator,
        span: Range<Pfn>,
    ) -> FrameAllocator<'static> {
        let len = span.start.distance_to(span.end) as usize;
        let table = unsafe { early.alloc_slice(len, FrameRecord::RESERVED) };
        FrameAllocator::new(table, span.start)
    }

    #[inline]
    #[must_use]
    pub const fn first_pfn(&self) -> Pfn {
        self.first
    }

    #[inline]
    #[must_use]
    pub const fn end_pfn(&self) -> Pfn {
        self.first.add(self.table.len() as u64)
    }

    /// Frames covered by the table, reserved ones included.
    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.table.len()
    }

    #[inline]
    #[must_use]
    pub const fn free_frames_count(&self) -> usize {
        self.free
    }

    /// Free runs currently on the list for `order`.
    #[must_use]
    pub fn free_runs(&self, order: usize) -> usize {
        self.runs.get(order).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total_frames(),
            free: self.free,
            free_runs: self.runs,
        }
    }

    /// State of `pfn`, or `None` outside the table.
    #[must_use]
    pub fn state(&self, pfn: Pfn) -> Option<FrameState> {
        self.index_of(pfn).map(|i| self.table[i].state)
    }

    /// Walks every free list, yielding `(base, order)` per run.
    pub fn iter_free_runs(&self) -> impl Iterator<Item = (Pfn, usize)> + '_ {
        (0..ORDER_COUNT).flat_map(move |order| {
            let mut at = self.heads[order];
            core::iter::from_fn(move || {
                if at == NIL {
                    return None;
                }
                let idx = at as usize;
                at = self.table[idx].next;
                Some((self.pfn_of(idx), order))
            })
        })
    }

    /// Marks the reserved frames of `range` as free. Frames outside the table
    /// are ignored. Returns the number of frames released.
    ///
    /// # Panics
    /// If a frame in the range is not reserved.
    pub fn release_range(&mut self, range: Range<Pfn>) -> usize {
        let start = range.start.max(self.first);
        let end = range.end.min(self.end_pfn());
        if start >= end {
            return 0;
        }

        let lo = self.index_of_unchecked(start);
        let count = start.distance_to(end) as usize;
        for rec in &mut self.table[lo..lo + count] {
            assert!(
                rec.state == FrameState::Reserved,
                "frame allocator: released range {start}..{end} overlaps usable memory"
            );
            rec.state = FrameState::Allocated;
        }
        self.free_range(lo, count);
        count
    }

    /// Returns the first frame of `count` contiguous frames.
    pub fn alloc_frames(&mut self, count: usize) -> Result<Pfn, AllocError> {
        if count == 0 || count > MAX_FRAMES_PER_REQUEST {
            return Err(AllocError::InvalidSize { size: count });
        }

        let order = count.next_power_of_two().trailing_zeros() as usize;
        let Some(mut have) = (order..ORDER_COUNT).find(|&o| self.heads[o] != NIL) else {
            return Err(AllocError::OutOfMemory);
        };
        let idx = self.pop(have);

        while have > order {
            have -= 1;
            let upper = idx + (1 << have);
            self.table[upper].state = FrameState::Free { order: have as u8 };
            self.push(upper, have);
        }

        for rec in &mut self.table[idx..idx + (1 << order)] {
            rec.state = FrameState::Allocated;
        }

        let surplus = (1 << order) - count;
        if surplus != 0 {
            self.free_range(idx + count, surplus);
        }
        Ok(self.pfn_of(idx))
    }

    /// Returns `count` frames starting at `base`.
    ///
    /// # Panics
    /// If any frame in the range lies outside the table or is not allocated.
    pub fn free_frames(&mut self, base: Pfn, count: usize) {
        if count == 0 {
            return;
        }
        let Some(lo) = self.index_of(base) else {
            panic!("frame allocator: freeing {base} outside {}..{}", self.first, self.end_pfn());
        };
        assert!(
            lo + count <= self.table.len(),
            "frame allocator: freeing {count} frames at {base} runs past {}",
            self.end_pfn()
        );
        for (i, rec) in self.table[lo..lo + count].iter().enumerate() {
            assert!(
                rec.state == FrameState::Allocated,
                "frame allocator: freeing {} which is {:?}",
                base.add(i as u64),
                rec.state
            );
        }
        self.free_range(lo, count);
    }

    /// Frees `[lo, lo + count)` (all currently allocated) as maximal aligned
    /// power-of-two chunks.
    fn free_range(&mut self, lo: usize, count: usize) {
        let mut idx = lo;
        let end = lo + count;
        while idx < end {
            let pfn = self.pfn_of(idx).as_u64();
            let align = if pfn == 0 { MAX_ORDER } else { pfn.trailing_zeros() as usize };
            let fit = (usize::BITS - 1 - (end - idx).leading_zeros()) as usize;
            let order = align.min(fit).min(MAX_ORDER);
            self.free_block(idx, order);
            idx += 1 << order;
        }
    }

    /// Frees one aligned run and merges it with free buddies.
    fn free_block(&mut self, idx: usize, order: usize) {
        for rec in &mut self.table[idx..idx + (1 << order)] {
            rec.state = FrameState::FreeTail;
        }

        let mut idx = idx;
        let mut order = order;
        while order < MAX_ORDER {
            let buddy_pfn = Pfn::new(self.pfn_of(idx).as_u64() ^ (1 << order));
            let Some(buddy) = self.index_of(buddy_pfn) else {
                break;
            };
            if self.table[buddy].state != (FrameState::Free { order: order as u8 }) {
                break;
            }
            self.unlink(buddy, order);
            self.table[buddy].state = FrameState::FreeTail;
            idx = idx.min(buddy);
            order += 1;
        }

        self.table[idx].state = FrameState::Free { order: order as u8 };
        self.push(idx, order);
    }

    fn push(&mut self, idx: usize, order: usize) {
        let head = self.heads[order];
        self.table[idx].prev = NIL;
        self.table[idx].next = head;
        if head != NIL {
            self.table[head as usize].prev = idx as u32;
        }
        self.heads[order] = idx as u32;
        self.runs[order] += 1;
        self.free += 1 << order;
    }

    fn pop(&mut self, order: usize) -> usize {
        let idx = self.heads[order] as usize;
        self.unlink(idx, order);
        idx
    }

    fn unlink(&mut self, idx: usize, order: usize) {
        let FrameRecord { prev, next, .. } = self.table[idx];
        if prev == NIL {
            debug_assert_eq!(self.heads[order], idx as u32);
            self.heads[order] = next;
        } else {
            self.table[prev as usize].next = next;
        }
        if next != NIL {
            self.table[next as usize].prev = prev;
        }
        self.table[idx].prev = NIL;
        self.table[idx].next = NIL;
        self.runs[order] -= 1;
        self.free -= 1 << order;
    }

    fn index_of(&self, pfn: Pfn) -> Option<usize> {
        if pfn < self.first || pfn >= self.end_pfn() {
            return None;
        }
        Some(self.index_of_unchecked(pfn))
    }

    const fn index_of_unchecked(&self, pfn: Pfn) -> usize {
        self.first.distance_to(pfn) as usize
    }

    const fn pfn_of(&self, idx: usize) -> Pfn {
        self.first.add(idx as u64)
    }
}

impl fmt::Debug for FrameAllocator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("span", &(self.first..self.end_pfn()))
            .field("free", &self.free)
            .field("runs", &self.runs)
            .finish_non_exhaustive()
    }
}

/// Anything that hands out runs of physical frames.
pub trait FrameSource {
    fn alloc_frames(&self, count: usize) -> Result<Pfn, AllocError>;

    /// # Panics
    /// If the frames were not allocated from this source.
    fn free_frames(&self, base: Pfn, count: usize);
}

impl<S: FrameSource + ?Sized> FrameSource for &S {
    fn alloc_frames(&self, count: usize) -> Result<Pfn, AllocError> {
        (**self).alloc_frames(count)
    }

    fn free_frames(&self, base: Pfn, count: usize) {
        (**self).free_frames(base, count);
    }
}

/// The frame allocator behind a ticket lock, acquired in a fixed [`LockMode`].
pub struct LockedFrameAllocator<'a> {
    inner: TicketMutex<FrameAllocator<'a>>,
    mode: LockMode,
}

impl<'a> LockedFrameAllocator<'a> {
    #[must_use]
    pub const fn new(frames: FrameAllocator<'a>) -> Self {
        Self::with_mode(frames, LockMode::Plain)
    }

    /// Use [`LockMode::IrqSave`] when frames may be requested from an
    /// interrupt handler.
    #[must_use]
    pub const fn with_mode(frames: FrameAllocator<'a>, mode: LockMode) -> Self {
        Self {
            inner: TicketMutex::new(frames),
            mode,
        }
    }

    #[inline]
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.locked(|f| f.stats())
    }

    /// Registers additional usable memory.
    pub fn release_range(&self, range: Range<Pfn>) -> usize {
        let released = self.locked(|f| f.release_range(range.clone()));
        info!("frames: released {released} frames in {}..{}", range.start, range.end);
        released
    }

    /// Direct access to the allocator, e.g. for audits in tests.
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut FrameAllocator<'a>) -> U) -> U {
        self.locked(f)
    }

    fn locked<U>(&self, f: impl FnOnce(&mut FrameAllocator<'a>) -> U) -> U {
        let mut frames = self.inner.lock_mode(self.mode);
        f(&mut frames)
    }

    pub fn into_inner(self) -> FrameAllocator<'a> {
        self.inner.into_inner()
    }
}

impl FrameSource for LockedFrameAllocator<'_> {
    fn alloc_frames(&self, count: usize) -> Result<Pfn, AllocError> {
        if count == 0 || count > MAX_FRAMES_PER_REQUEST {
            return Err(AllocError::InvalidSize { size: count });
        }
        let result = self.locked(|f| f.alloc_frames(count));
        match result {
            Ok(pfn) => trace!("frames: alloc {count} at {pfn}"),
            Err(e) => warn!("frames: alloc {count} failed: {e}"),
        }
        result
    }

    fn free_frames(&self, base: Pfn, count: usize) {
        self.locked(|f| f.free_frames(base, count));
        trace!("frames: free {count} at {base}");
    }
}

impl fmt::Debug for LockedFrameAllocator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}
