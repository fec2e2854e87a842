//! # Fixed-size object pools
//!
//! A [`Pool`] serves objects of one size out of page blocks pulled from a
//! [`FrameSource`]. Each block gets a [`PoolBlock`] record holding a slot
//! bitmap; blocks with at least one free slot are chained on the pool's
//! partial list. Records live in a caller-provided arena, so the pool never
//! writes into the objects it hands out.
//!
//! The pool lock is never held across a call into the frame source: growth
//! drops it, fetches a block, re-takes it and installs the block. Pools start
//! out with [`LockMode::Plain`]; [`Pool::with_lock_mode`] switches a pool that
//! is shared with interrupt handlers to [`LockMode::IrqSave`].

use crate::addr::{FrameMapper, Pfn};
use crate::config::{
    FRAME_SIZE, MAX_ORDER, POOL_MAX_OBJECT, POOL_MAX_SLOTS, POOL_MIN_OBJECT, POOL_MIN_SLOTS,
    ReturnPolicy,
};
use crate::error::AllocError;
use crate::frame_alloc::FrameSource;
use core::fmt;
use kernel_sync::{LockMode, TicketMutex};
use log::{debug, trace, warn};

const NIL: u32 = u32::MAX;
const WORDS: usize = POOL_MAX_SLOTS / 64;

/// Bookkeeping for one backing block.
#[derive(Copy, Clone, Debug)]
pub struct PoolBlock {
    base: Option<Pfn>,
    /// Set bits are taken slots; bits past the block's slot count stay set.
    used: [u64; WORDS],
    live: u16,
    on_partial: bool,
    prev: u32,
    next: u32,
}

impl PoolBlock {
    pub const EMPTY: Self = Self {
        base: None,
        used: [0; WORDS],
        live: 0,
        on_partial: false,
        prev: NIL,
        next: NIL,
    };

    fn install(&mut self, base: Pfn, slots: usize) {
        let mut used = [u64::MAX; WORDS];
        for slot in 0..slots {
            used[slot / 64] &= !(1 << (slot % 64));
        }
        *self = Self {
            base: Some(base),
            used,
            ..Self::EMPTY
        };
    }

    fn take_slot(&mut self) -> Option<usize> {
        let (word, bits) = self.used.iter_mut().enumerate().find(|(_, w)| **w != u64::MAX)?;
        let bit = (!*bits).trailing_zeros() as usize;
        *bits |= 1 << bit;
        self.live += 1;
        Some(word * 64 + bit)
    }

    fn is_taken(&self, slot: usize) -> bool {
        self.used[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn release_slot(&mut self, slot: usize) {
        self.used[slot / 64] &= !(1 << (slot % 64));
        self.live -= 1;
    }
}

impl Default for PoolBlock {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Snapshot of a pool's counters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub object_size: usize,
    pub blocks: usize,
    pub free_slots: usize,
    pub live: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool<{}>: {} blocks, {} live, {} free slots",
            self.object_size, self.blocks, self.live, self.free_slots
        )
    }
}

struct PoolState<'a> {
    records: &'a mut [PoolBlock],
    partial: u32,
    blocks: usize,
    live: usize,
}

impl PoolState<'_> {
    fn push_partial(&mut self, idx: usize) {
        let head = self.partial;
        let rec = &mut self.records[idx];
        rec.on_partial = true;
        rec.prev = NIL;
        rec.next = head;
        if head != NIL {
            self.records[head as usize].prev = idx as u32;
        }
        self.partial = idx as u32;
    }

    fn unlink_partial(&mut self, idx: usize) {
        let PoolBlock { prev, next, .. } = self.records[idx];
        if prev == NIL {
            self.partial = next;
        } else {
            self.records[prev as usize].next = next;
        }
        if next != NIL {
            self.records[next as usize].prev = prev;
        }
        let rec = &mut self.records[idx];
        rec.on_partial = false;
        rec.prev = NIL;
        rec.next = NIL;
    }

    /// Takes a slot from the first partial block: `(record, slot)`.
    fn take(&mut self, slots: usize) -> Option<(usize, usize)> {
        if self.partial == NIL {
            return None;
        }
        let idx = self.partial as usize;
        let slot = self.records[idx].take_slot()?;
        if usize::from(self.records[idx].live) == slots {
            self.unlink_partial(idx);
        }
        self.live += 1;
        Some((idx, slot))
    }

    fn find_block(&self, pfn: Pfn, frames: u64) -> Option<usize> {
        self.records.iter().position(|rec| {
            rec.base
                .is_some_and(|base| base <= pfn && pfn.as_u64() < base.as_u64() + frames)
        })
    }
}

/// Allocator for objects of one fixed size.
pub struct Pool<'a, S, M> {
    source: S,
    mapper: M,
    object_size: usize,
    order: usize,
    slots: usize,
    policy: ReturnPolicy,
    mode: LockMode,
    state: TicketMutex<PoolState<'a>>,
}

impl<'a, S: FrameSource, M: FrameMapper> Pool<'a, S, M> {
    /// Creates a pool for objects of `object_size` bytes (rounded up to a
    /// power of two, at least [`POOL_MIN_OBJECT`]).
    ///
    /// The pool can hold at most `records.len()` backing blocks at a time.
    pub fn create(
        object_size: usize,
        records: &'a mut [PoolBlock],
        policy: ReturnPolicy,
        source: S,
        mapper: M,
    ) -> Result<Self, AllocError> {
        if object_size == 0 || object_size > POOL_MAX_OBJECT {
            return Err(AllocError::InvalidSize { size: object_size });
        }
        let object_size = object_size.next_power_of_two().max(POOL_MIN_OBJECT);
        let order = (0..=MAX_ORDER)
            .find(|&o| (FRAME_SIZE << o) / object_size >= POOL_MIN_SLOTS)
            .ok_or(AllocError::InvalidSize { size: object_size })?;
        let slots = ((FRAME_SIZE << order) / object_size).min(POOL_MAX_SLOTS);
        if records.len() >= NIL as usize {
            return Err(AllocError::InvalidSize { size: records.len() });
        }
        records.fill(PoolBlock::EMPTY);

        debug!("pool<{object_size}>: order {order} blocks, {slots} slots each, {policy:?}");
        Ok(Self {
            source,
            mapper,
            object_size,
            order,
            slots,
            policy,
            mode: LockMode::Plain,
            state: TicketMutex::new(PoolState {
                records,
                partial: NIL,
                blocks: 0,
                live: 0,
            }),
        })
    }

    /// Acquires the pool lock in `mode` from now on.
    #[must_use]
    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    #[inline]
    #[must_use]
    pub const fn lock_mode(&self) -> LockMode {
        self.mode
    }

    #[inline]
    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    /// Buddy order of the backing blocks.
    #[inline]
    #[must_use]
    pub const fn block_order(&self) -> usize {
        self.order
    }

    #[inline]
    #[must_use]
    pub const fn slots_per_block(&self) -> usize {
        self.slots
    }

    #[inline]
    #[must_use]
    pub const fn policy(&self) -> ReturnPolicy {
        self.policy
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (blocks, live) = self.locked(|s| (s.blocks, s.live));
        PoolStats {
            object_size: self.object_size,
            blocks,
            free_slots: blocks * self.slots - live,
            live,
        }
    }

    /// Hands out one object slot.
    pub fn alloc(&self) -> Result<usize, AllocError> {
        let taken = self.locked(|s| {
            s.take(self.slots)
                .map(|(idx, slot)| (s.records[idx].base, slot))
        });
        if let Some((Some(base), slot)) = taken {
            let addr = self.slot_addr(base, slot);
            trace!("pool<{}>: alloc {addr:#x}", self.object_size);
            return Ok(addr);
        }

        let frames = self.frames_per_block();
        let base = match self.source.alloc_frames(frames) {
            Ok(base) => base,
            Err(e) => {
                warn!("pool<{}>: no block for growth: {e}", self.object_size);
                return Err(AllocError::OutOfMemory);
            }
        };

        let installed = self.locked(|s| {
            let idx = s.records.iter().position(|r| r.base.is_none())?;
            s.records[idx].install(base, self.slots);
            s.blocks += 1;
            let slot = s.records[idx].take_slot();
            s.live += 1;
            if self.slots > 1 {
                s.push_partial(idx);
            }
            slot
        });

        let Some(slot) = installed else {
            self.source.free_frames(base, frames);
            warn!("pool<{}>: block record arena is full", self.object_size);
            return Err(AllocError::ArenaFull);
        };
        debug!("pool<{}>: added block at {base}", self.object_size);

        let addr = self.slot_addr(base, slot);
        trace!("pool<{}>: alloc {addr:#x}", self.object_size);
        Ok(addr)
    }

    /// Returns the slot at `addr`.
    ///
    /// # Panics
    /// If `addr` is not a live slot of this pool.
    pub fn free(&self, addr: usize) {
        let size = self.object_size;
        let Some(pfn) = self.mapper.virt_to_frame(addr) else {
            panic!("pool<{size}>: free of unmapped address {addr:#x}");
        };
        let frames = self.frames_per_block() as u64;

        let emptied = self.locked(|s| {
            let Some(idx) = s.find_block(pfn, frames) else {
                panic!("pool<{size}>: free of foreign address {addr:#x}");
            };
            let Some(base) = s.records[idx].base else {
                unreachable!("find_block returned an empty record");
            };
            let offset = addr - self.mapper.frame_to_virt(base);
            assert!(
                offset % size == 0 && offset / size < self.slots,
                "pool<{size}>: free of {addr:#x} not on a slot boundary"
            );
            let slot = offset / size;
            assert!(
                s.records[idx].is_taken(slot),
                "pool<{size}>: double free of {addr:#x}"
            );

            s.records[idx].release_slot(slot);
            s.live -= 1;
            if !s.records[idx].on_partial {
                s.push_partial(idx);
            }

            if s.records[idx].live == 0 && self.policy == ReturnPolicy::Eager {
                s.unlink_partial(idx);
                s.records[idx] = PoolBlock::EMPTY;
                s.blocks -= 1;
                Some(base)
            } else {
                None
            }
        });

        trace!("pool<{size}>: free {addr:#x}");
        if let Some(base) = emptied {
            self.source.free_frames(base, self.frames_per_block());
            debug!("pool<{size}>: returned block at {base}");
        }
    }

    /// Returns every block without live objects to the frame source.
    /// Returns the number of blocks released.
    pub fn shrink(&self) -> usize {
        let mut released = 0;
        loop {
            let empty = self.locked(|s| {
                let idx = s
                    .records
                    .iter()
                    .position(|r| r.base.is_some() && r.live == 0)?;
                let base = s.records[idx].base;
                if s.records[idx].on_partial {
                    s.unlink_partial(idx);
                }
                s.records[idx] = PoolBlock::EMPTY;
                s.blocks -= 1;
                base
            });
            let Some(base) = empty else {
                break;
            };
            self.source.free_frames(base, self.frames_per_block());
            released += 1;
        }
        if released != 0 {
            debug!("pool<{}>: shrink returned {released} blocks", self.object_size);
        }
        released
    }

    fn locked<U>(&self, f: impl FnOnce(&mut PoolState<'a>) -> U) -> U {
        let mut state = self.state.lock_mode(self.mode);
        f(&mut state)
    }

    const fn frames_per_block(&self) -> usize {
        1 << self.order
    }

    fn slot_addr(&self, base: Pfn, slot: usize) -> usize {
        self.mapper.frame_to_virt(base) + slot * self.object_size
    }
}

impl<S, M> fmt::Debug for Pool<'_, S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("object_size", &self.object_size)
            .field("order", &self.order)
            .field("slots", &self.slots)
            .field("policy", &self.policy)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::HhdmMapper;
    use crate::frame_alloc::{FrameAllocator, FrameRecord, LockedFrameAllocator};

    const OFFSET: usize = 0xFFFF_8000_0000_0000;

    fn frames(table: &mut [FrameRecord]) -> LockedFrameAllocator<'_> {
        let len = table.len() as u64;
        let mut fa = FrameAllocator::new(table, Pfn::new(0x100));
        fa.release_range(Pfn::new(0x100)..Pfn::new(0x100 + len));
        LockedFrameAllocator::new(fa)
    }

    fn pool_of<'r, 't>(
        size: usize,
        recs: &'r mut [PoolBlock],
        policy: ReturnPolicy,
        fa: &'r LockedFrameAllocator<'t>,
    ) -> Pool<'r, &'r LockedFrameAllocator<'t>, HhdmMapper> {
        Pool::create(size, recs, policy, fa, HhdmMapper::new(OFFSET)).unwrap()
    }

    #[test]
    fn sizes_round_up_and_pick_an_order() {
        let mut table = [FrameRecord::RESERVED; 16];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 2];
        let pool = pool_of(24, &mut recs, ReturnPolicy::Eager, &fa);
        assert_eq!(pool.object_size(), 32);
        assert_eq!(pool.block_order(), 0);
        assert_eq!(pool.slots_per_block(), 128);

        let mut recs = [PoolBlock::EMPTY; 2];
        let big = pool_of(1000, &mut recs, ReturnPolicy::Eager, &fa);
        assert_eq!(big.object_size(), 1024);
        assert_eq!(big.block_order(), 1);
        assert_eq!(big.slots_per_block(), 8);

        let mut recs = [PoolBlock::EMPTY; 1];
        let tiny = pool_of(1, &mut recs, ReturnPolicy::Eager, &fa);
        assert_eq!(tiny.object_size(), POOL_MIN_OBJECT);
        assert_eq!(tiny.slots_per_block(), POOL_MAX_SLOTS);
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        let mut table = [FrameRecord::RESERVED; 1];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 1];
        assert!(matches!(
            Pool::create(0, &mut recs, ReturnPolicy::Eager, &fa, HhdmMapper::new(0)),
            Err(AllocError::InvalidSize { size: 0 })
        ));
        let mut recs = [PoolBlock::EMPTY; 1];
        let oversized = POOL_MAX_OBJECT + 1;
        assert!(
            Pool::create(oversized, &mut recs, ReturnPolicy::Eager, &fa, HhdmMapper::new(0))
                .is_err()
        );
    }

    #[test]
    fn eager_pool_returns_empty_blocks() {
        let mut table = [FrameRecord::RESERVED; 4];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 2];
        let pool = pool_of(1024, &mut recs, ReturnPolicy::Eager, &fa);

        let a = pool.alloc().unwrap();
        assert_eq!(a % 1024, 0);
        assert_eq!(fa.stats().free, 2);
        let b = pool.alloc().unwrap();
        assert_eq!(b, a + 1024);

        pool.free(a);
        assert_eq!(pool.stats().blocks, 1);
        pool.free(b);
        assert_eq!(pool.stats().blocks, 0);
        assert_eq!(fa.stats().free, 4);
    }

    #[test]
    fn retained_blocks_are_reused() {
        let mut table = [FrameRecord::RESERVED; 4];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 2];
        let pool = pool_of(2048, &mut recs, ReturnPolicy::Retain, &fa);

        let a = pool.alloc().unwrap();
        pool.free(a);
        assert_eq!(pool.stats().blocks, 1);
        assert_eq!(pool.stats().free_slots, pool.slots_per_block());
        assert_eq!(pool.alloc().unwrap(), a);
        pool.free(a);
        assert_eq!(pool.shrink(), 1);
        assert_eq!(fa.stats().free, 4);
    }

    #[test]
    fn growth_failures_are_reported() {
        let mut table = [FrameRecord::RESERVED; 2];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 1];
        let pool = pool_of(512, &mut recs, ReturnPolicy::Retain, &fa);
        for _ in 0..pool.slots_per_block() {
            pool.alloc().unwrap();
        }
        // One record only: the second block cannot be tracked.
        assert_eq!(pool.alloc(), Err(AllocError::ArenaFull));
        assert_eq!(fa.stats().free, 1);

        let mut table = [FrameRecord::RESERVED; 1];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 4];
        let pool = pool_of(4096, &mut recs, ReturnPolicy::Retain, &fa);
        assert_eq!(pool.alloc(), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn lock_mode_is_kept_across_operations() {
        let mut table = [FrameRecord::RESERVED; 2];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 1];
        let pool = pool_of(256, &mut recs, ReturnPolicy::Eager, &fa);
        assert_eq!(pool.lock_mode(), LockMode::Plain);

        let pool = pool.with_lock_mode(LockMode::IrqSave);
        assert_eq!(pool.lock_mode(), LockMode::IrqSave);
        let a = pool.alloc().unwrap();
        assert_eq!(pool.stats().live, 1);
        pool.free(a);
        assert_eq!(pool.stats().blocks, 0);
        assert!(format!("{pool:?}").contains("IrqSave"));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut table = [FrameRecord::RESERVED; 2];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 1];
        let pool = pool_of(64, &mut recs, ReturnPolicy::Retain, &fa);
        let a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        pool.free(a);
        pool.free(a);
    }

    #[test]
    #[should_panic(expected = "slot boundary")]
    fn interior_pointer_panics() {
        let mut table = [FrameRecord::RESERVED; 2];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 1];
        let pool = pool_of(64, &mut recs, ReturnPolicy::Retain, &fa);
        let a = pool.alloc().unwrap();
        pool.free(a + 8);
    }

    #[test]
    #[should_panic(expected = "foreign address")]
    fn foreign_address_panics() {
        let mut table = [FrameRecord::RESERVED; 2];
        let fa = frames(&mut table);
        let mut recs = [PoolBlock::EMPTY; 1];
        let pool = pool_of(64, &mut recs, ReturnPolicy::Retain, &fa);
        let _a = pool.alloc().unwrap();
        pool.free(OFFSET + 0x4000_0000);
    }
}
