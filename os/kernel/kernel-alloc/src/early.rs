//! # Boot-time bump allocator
//!
//! Serves the allocations the kernel needs before the frame allocator exists:
//! the frame table itself and the heap's node arena. It only moves its
//! cursor forward and has no `free`; whatever it hands out lives until the
//! machine shuts down.
//!
//! Running out of early memory is fatal. [`EarlyAllocator::alloc`] panics with
//! the request and the remaining space; [`EarlyAllocator::try_alloc`] exists
//! for callers that can recover.

use crate::addr::align_up;
use crate::error::EarlyAllocError;
use core::alloc::Layout;
use core::ops::Range;
use log::{info, trace};

/// Bump allocator over the window `[start, end)`.
///
/// # Invariants
/// `start <= cursor <= end`; the cursor never moves backwards.
#[derive(Debug)]
pub struct EarlyAllocator {
    start: usize,
    cursor: usize,
    end: usize,
    allocations: usize,
}

impl EarlyAllocator {
    /// # Panics
    /// If `end < start`.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        assert!(start <= end, "early window ends before it starts");
        Self {
            start,
            cursor: start,
            end,
            allocations: 0,
        }
    }

    /// Reserves `layout.size()` bytes at the next `layout.align()` boundary.
    pub fn try_alloc(&mut self, layout: Layout) -> Result<usize, EarlyAllocError> {
        let exhausted = EarlyAllocError::Exhausted {
            requested: layout.size(),
            remaining: self.remaining(),
        };
        let addr = align_up(self.cursor, layout.align()).ok_or(exhausted)?;
        let next = addr.checked_add(layout.size()).ok_or(exhausted)?;
        if next > self.end {
            return Err(exhausted);
        }

        self.cursor = next;
        self.allocations += 1;
        trace!(
            "early: {:#x} bytes (align {:#x}) at {addr:#x}",
            layout.size(),
            layout.align()
        );
        Ok(addr)
    }

    /// Like [`try_alloc`](Self::try_alloc), but the kernel cannot continue
    /// without its bootstrap memory.
    ///
    /// # Panics
    /// When the window cannot hold the request.
    #[track_caller]
    pub fn alloc(&mut self, layout: Layout) -> usize {
        match self.try_alloc(layout) {
            Ok(addr) => addr,
            Err(e) => panic!(
                "early allocator [{:#x}, {:#x}): {e}",
                self.start, self.end
            ),
        }
    }

    /// Carves an initialized `[T; len]` out of the window.
    ///
    /// # Safety
    /// The window must be mapped, writable memory that nothing else uses.
    ///
    /// # Panics
    /// When the window is exhausted.
    #[track_caller]
    pub unsafe fn alloc_slice<T: Clone>(&mut self, len: usize, value: T) -> &'static mut [T] {
        let Ok(layout) = Layout::array::<T>(len) else {
            panic!("early allocator: array of {len} elements overflows");
        };
        let base = self.alloc(layout) as *mut T;
        for i in 0..len {
            unsafe { base.add(i).write(value.clone()) };
        }
        unsafe { core::slice::from_raw_parts_mut(base, len) }
    }

    /// Current high-water mark.
    #[inline]
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.end - self.cursor
    }

    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.cursor - self.start
    }

    #[inline]
    #[must_use]
    pub const fn window(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Retires the allocator and hands the unused tail to the next owner.
    #[must_use]
    pub fn retire(self) -> Range<usize> {
        info!(
            "early allocator retired: {} allocations, {:#x} bytes used, {:#x} bytes left",
            self.allocations,
            self.used(),
            self.remaining()
        );
        self.cursor..self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn boot_window_scenario() {
        let mut early = EarlyAllocator::new(0x1000, 0x2000);
        assert_eq!(early.alloc(layout(16, 64)), 0x1000);
        assert_eq!(early.alloc(layout(32, 32)), 0x1020);
        assert_eq!(early.cursor(), 0x1040);
        assert_eq!(
            early.try_alloc(layout(0xFE0, 1)),
            Err(EarlyAllocError::Exhausted {
                requested: 0xFE0,
                remaining: 0xFC0
            })
        );
        // A failed attempt does not move the cursor.
        assert_eq!(early.cursor(), 0x1040);
    }

    #[test]
    fn cursor_only_moves_forward() {
        let mut early = EarlyAllocator::new(0x1003, 0x1100);
        let a = early.alloc(layout(1, 1));
        let b = early.alloc(layout(8, 8));
        assert_eq!(a, 0x1003);
        assert_eq!(b, 0x1008);
        assert_eq!(early.used(), 0x1010 - 0x1003);
        assert_eq!(early.retire(), 0x1010..0x1100);
    }

    #[test]
    fn exact_fit_is_allowed() {
        let mut early = EarlyAllocator::new(0x1000, 0x1100);
        assert_eq!(early.alloc(layout(0x100, 0x100)), 0x1000);
        assert_eq!(early.remaining(), 0);
        assert!(early.try_alloc(layout(1, 1)).is_err());
    }

    #[test]
    #[should_panic(expected = "early window exhausted")]
    fn exhaustion_is_fatal() {
        let mut early = EarlyAllocator::new(0x1000, 0x2000);
        let _ = early.alloc(layout(0x1001, 1));
    }

    #[test]
    fn alloc_slice_initializes_backing_memory() {
        let backing: &'static mut [u64] = Box::leak(vec![0u64; 64].into_boxed_slice());
        let start = backing.as_mut_ptr() as usize;
        let mut early = EarlyAllocator::new(start, start + 64 * 8);
        let table = unsafe { early.alloc_slice(10, 0xAAu32) };
        assert_eq!(table.len(), 10);
        assert!(table.iter().all(|&v| v == 0xAA));
        assert_eq!(early.used(), 40);
    }
}
