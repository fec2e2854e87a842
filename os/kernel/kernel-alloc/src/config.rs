//! Compile-time tuning of the allocation stack.

pub use kernel_sync::per_cpu::MAX_CPUS;

/// Size of one physical page frame.
pub const FRAME_SIZE: usize = 4096;

/// `log2(FRAME_SIZE)`.
pub const FRAME_SHIFT: u32 = FRAME_SIZE.trailing_zeros();

/// Largest buddy order; a run of `2^MAX_ORDER` frames is 4 MiB.
pub const MAX_ORDER: usize = 10;

/// Number of buddy free lists.
pub const ORDER_COUNT: usize = MAX_ORDER + 1;

/// Heap size and alignment unit. Two machine words, the footprint of a
/// free-block header in an in-band design.
pub const HEAP_GRANULE: usize = 2 * size_of::<usize>();

/// Smallest remainder the heap splits off as a separate free block.
pub const HEAP_MIN_BLOCK: usize = 2 * HEAP_GRANULE;

/// Frames requested at least when the heap grows on exhaustion.
pub const HEAP_GROW_MIN_FRAMES: usize = 16;

/// Default frames seeded into the heap at bootstrap (256 KiB).
pub const HEAP_INITIAL_FRAMES: usize = 64;

/// Default size of the heap's node arena, i.e. the most blocks it tracks.
pub const HEAP_NODES: usize = 1024;

/// Smallest pool slot.
pub const POOL_MIN_OBJECT: usize = 16;

/// A pool block is sized to hold at least this many slots.
pub const POOL_MIN_SLOTS: usize = 8;

/// Slot bitmap capacity of one pool block.
pub const POOL_MAX_SLOTS: usize = 256;

/// Largest object a pool serves: a maximal buddy run split into
/// [`POOL_MIN_SLOTS`] slots.
pub const POOL_MAX_OBJECT: usize = (FRAME_SIZE << MAX_ORDER) / POOL_MIN_SLOTS;

const _: () = assert!(FRAME_SIZE.is_power_of_two());
const _: () = assert!(HEAP_GRANULE.is_power_of_two());
const _: () = assert!(FRAME_SIZE / POOL_MIN_OBJECT <= POOL_MAX_SLOTS);

/// What a pool does with a block once every slot in it is free again.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ReturnPolicy {
    /// Hand the block back to the frame allocator right away.
    #[default]
    Eager,
    /// Keep the block for future allocations.
    Retain,
}

const _: () = assert!(HEAP_INITIAL_FRAMES <= 1 << MAX_ORDER);
const _: () = assert!(HEAP_GROW_MIN_FRAMES <= 1 << MAX_ORDER);
