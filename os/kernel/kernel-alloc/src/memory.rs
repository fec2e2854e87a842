//! # Bootstrap and the kernel-wide memory facade
//!
//! [`KernelMemory::bootstrap`] assembles the allocation stack in order:
//!
//! 1. an [`EarlyAllocator`] over the boot window,
//! 2. the frame table, carved from early memory, with every usable range
//!    of the memory map released into it,
//! 3. the heap's node arena, also from early memory,
//! 4. a first run of frames seeded into the heap.
//!
//! After that the early allocator is retired. The heap grows on demand by
//! pulling more frames; the heap lock is dropped before the frame lock is
//! taken.
//!
//! Both locks, and the locks of pools created through the facade, are taken
//! with interrupts disabled unless [`BootMemory::lock_mode`] says otherwise.

use crate::addr::{FrameMapper, HhdmMapper, frames_within};
use crate::config::{
    FRAME_SIZE, HEAP_GROW_MIN_FRAMES, HEAP_INITIAL_FRAMES, HEAP_MIN_BLOCK, HEAP_NODES, ReturnPolicy,
};
use crate::early::EarlyAllocator;
use crate::error::{AllocError, BootstrapError};
use crate::frame_alloc::{
    FrameAllocator, FrameSource, FrameStats, LockedFrameAllocator, MAX_FRAMES_PER_REQUEST,
};
use crate::heap::{Heap, HeapNode, HeapStats, LockedHeap};
use crate::pool::{Pool, PoolBlock};
use core::alloc::Layout;
use core::fmt;
use core::ops::Range;
use kernel_sync::LockMode;
use log::{debug, info, warn};

/// What the boot path hands to [`KernelMemory::bootstrap`].
#[derive(Clone, Debug)]
pub struct BootMemory<'m> {
    /// Virtual window for bootstrap allocations.
    pub early: Range<usize>,
    /// Usable physical ranges from the firmware memory map. The early window
    /// and the kernel image must not be part of them.
    pub usable: &'m [Range<u64>],
    pub heap_nodes: usize,
    pub heap_frames: usize,
    /// How every allocator lock of the stack is acquired.
    pub lock_mode: LockMode,
}

impl<'m> BootMemory<'m> {
    #[must_use]
    pub const fn new(early: Range<usize>, usable: &'m [Range<u64>]) -> Self {
        Self {
            early,
            usable,
            heap_nodes: HEAP_NODES,
            heap_frames: HEAP_INITIAL_FRAMES,
            lock_mode: LockMode::IrqSave,
        }
    }

    /// Overrides the heap's node arena size and its initial frame count.
    #[must_use]
    pub const fn with_heap(mut self, nodes: usize, frames: usize) -> Self {
        self.heap_nodes = nodes;
        self.heap_frames = frames;
        self
    }

    /// [`LockMode::Plain`] is only sound when no interrupt handler allocates.
    #[must_use]
    pub const fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EarlyStats {
    pub window: (usize, usize),
    pub used: usize,
}

/// Read-only summary for a diagnostics command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryStats {
    pub early: EarlyStats,
    pub frames: FrameStats,
    pub heap: HeapStats,
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (start, end) = self.early.window;
        writeln!(f, "early: {start:#x}..{end:#x}, {:#x} bytes used", self.early.used)?;
        writeln!(f, "{}", self.frames)?;
        write!(f, "{}", self.heap)
    }
}

/// The allocators of a running kernel.
pub struct KernelMemory<M = HhdmMapper> {
    frames: LockedFrameAllocator<'static>,
    heap: LockedHeap<'static>,
    mapper: M,
    early: EarlyStats,
    lock_mode: LockMode,
}

impl<M: FrameMapper> KernelMemory<M> {
    /// Builds the allocation stack from the boot memory description.
    ///
    /// # Safety
    /// The early window must be mapped, writable and unused. Every usable
    /// range must be free RAM, reachable through `mapper`.
    ///
    /// # Panics
    /// When the early window cannot hold the frame table and node arena.
    pub unsafe fn bootstrap(boot: &BootMemory<'_>, mapper: M) -> Result<Self, BootstrapError> {
        let span = boot
            .usable
            .iter()
            .map(|r| frames_within(r.start, r.end))
            .filter(|r| r.start < r.end)
            .reduce(|a, b| a.start.min(b.start)..a.end.max(b.end))
            .ok_or(BootstrapError::NoUsableMemory)?;

        let mut early = EarlyAllocator::new(boot.early.start, boot.early.end);
        let mut frames = unsafe { FrameAllocator::with_span(&mut early, span.clone()) };
        let released: usize = boot
            .usable
            .iter()
            .map(|r| frames.release_range(frames_within(r.start, r.end)))
            .sum();
        if released == 0 {
            return Err(BootstrapError::NoUsableMemory);
        }

        let nodes = unsafe { early.alloc_slice(boot.heap_nodes, HeapNode::EMPTY) };
        let mut heap = Heap::new(nodes);
        let seed = frames.alloc_frames(boot.heap_frames)?;
        let heap_start = mapper.frame_to_virt(seed);
        heap.init(heap_start, boot.heap_frames * FRAME_SIZE)?;

        let stats = EarlyStats {
            window: (boot.early.start, boot.early.end),
            used: early.used(),
        };
        let _tail = early.retire();

        info!(
            "memory: {released} usable frames in {}..{}, heap {heap_start:#x} +{:#x}",
            span.start,
            span.end,
            boot.heap_frames * FRAME_SIZE
        );
        Ok(Self {
            frames: LockedFrameAllocator::with_mode(frames, boot.lock_mode),
            heap: LockedHeap::with_mode(heap, boot.lock_mode),
            mapper,
            early: stats,
            lock_mode: boot.lock_mode,
        })
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &LockedFrameAllocator<'static> {
        &self.frames
    }

    #[inline]
    #[must_use]
    pub const fn heap(&self) -> &LockedHeap<'static> {
        &self.heap
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Heap allocation that grows the heap once when it runs dry.
    pub fn alloc(&self, layout: Layout) -> Result<usize, AllocError> {
        match self.heap.alloc_layout(layout) {
            Err(AllocError::OutOfMemory) => {
                self.grow_heap(layout)?;
                self.heap.alloc_layout(layout)
            }
            result => result,
        }
    }

    /// # Panics
    /// See [`Heap::free`].
    pub fn free(&self, addr: usize) {
        self.heap.free(addr);
    }

    /// Moves enough frames into the heap to serve `layout`.
    pub fn grow_heap(&self, layout: Layout) -> Result<(), AllocError> {
        let need = layout
            .align()
            .checked_mul(2)
            .and_then(|pad| pad.checked_add(HEAP_MIN_BLOCK))
            .and_then(|pad| pad.checked_add(layout.size()))
            .ok_or(AllocError::InvalidSize { size: layout.size() })?;
        let count = need
            .div_ceil(FRAME_SIZE)
            .max(HEAP_GROW_MIN_FRAMES)
            .next_power_of_two()
            .min(MAX_FRAMES_PER_REQUEST);
        if count * FRAME_SIZE < need {
            warn!("memory: {:#x} byte request exceeds the largest heap extension", layout.size());
            return Err(AllocError::OutOfMemory);
        }

        let base = self.frames.alloc_frames(count)?;
        let start = self.mapper.frame_to_virt(base);
        if let Err(e) = self.heap.extend(start, count * FRAME_SIZE) {
            self.frames.free_frames(base, count);
            return Err(e);
        }
        debug!("memory: heap grew by {count} frames at {start:#x}");
        Ok(())
    }

    /// A pool drawing its blocks from the kernel's frame allocator, locked in
    /// the same mode as the rest of the stack.
    pub fn create_pool<'r>(
        &'r self,
        object_size: usize,
        records: &'r mut [PoolBlock],
        policy: ReturnPolicy,
    ) -> Result<Pool<'r, &'r LockedFrameAllocator<'static>, &'r M>, AllocError> {
        Pool::create(object_size, records, policy, &self.frames, &self.mapper)
            .map(|pool| pool.with_lock_mode(self.lock_mode))
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            early: self.early,
            frames: self.frames.stats(),
            heap: self.heap.stats(),
        }
    }
}

impl<M> fmt::Debug for KernelMemory<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelMemory")
            .field("frames", &self.frames)
            .field("heap", &self.heap)
            .field("lock_mode", &self.lock_mode)
            .finish_non_exhaustive()
    }
}
