//! Frame numbers and the frame-to-virtual mapping used by the page-backed
//! allocators.

use crate::config::{FRAME_SHIFT, FRAME_SIZE};
use core::fmt;
use core::ops::Range;

/// Page-frame number: a physical address divided by [`FRAME_SIZE`].
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The frame containing physical address `pa`.
    #[inline]
    #[must_use]
    pub const fn containing(pa: u64) -> Self {
        Self(pa >> FRAME_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn phys_addr(self) -> u64 {
        self.0 << FRAME_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn add(self, frames: u64) -> Self {
        Self(self.0 + frames)
    }

    /// Frames between `self` and a later frame `end`.
    #[inline]
    #[must_use]
    pub const fn distance_to(self, end: Self) -> u64 {
        end.0 - self.0
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn {:#x}", self.0)
    }
}

/// Page-aligned frames fully inside the physical range `[start, end)`.
#[must_use]
pub const fn frames_within(start: u64, end: u64) -> Range<Pfn> {
    let first = Pfn::containing(start + (FRAME_SIZE as u64 - 1));
    let last = Pfn::containing(end);
    if first.0 >= last.0 {
        first..first
    } else {
        first..last
    }
}

/// Converts frames to addresses the kernel can use and back.
///
/// The backing pages must already be mapped readable and writable; this is
/// pure address arithmetic.
pub trait FrameMapper {
    fn frame_to_virt(&self, pfn: Pfn) -> usize;

    /// The frame behind `addr`, or `None` if `addr` is outside the mapping.
    fn virt_to_frame(&self, addr: usize) -> Option<Pfn>;
}

/// Higher-half direct map: every physical address `pa` is visible at
/// `offset + pa`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HhdmMapper {
    offset: usize,
}

impl HhdmMapper {
    #[must_use]
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl FrameMapper for HhdmMapper {
    #[inline]
    fn frame_to_virt(&self, pfn: Pfn) -> usize {
        self.offset + pfn.phys_addr() as usize
    }

    #[inline]
    fn virt_to_frame(&self, addr: usize) -> Option<Pfn> {
        let pa = addr.checked_sub(self.offset)?;
        Some(Pfn::containing(pa as u64))
    }
}

impl<M: FrameMapper + ?Sized> FrameMapper for &M {
    fn frame_to_virt(&self, pfn: Pfn) -> usize {
        (**self).frame_to_virt(pfn)
    }

    fn virt_to_frame(&self, addr: usize) -> Option<Pfn> {
        (**self).virt_to_frame(addr)
    }
}

/// Align `addr` upwards to `align` (must be a power of two).
#[inline]
pub(crate) const fn align_up(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[inline]
pub(crate) const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_within_trims_partial_pages() {
        let r = frames_within(0x1001, 0x5fff);
        assert_eq!(r.start, Pfn::new(2));
        assert_eq!(r.end, Pfn::new(5));
        let empty = frames_within(0x1800, 0x1900);
        assert_eq!(empty.start, empty.end);
    }

    #[test]
    fn hhdm_round_trips_frames() {
        let m = HhdmMapper::new(0xFFFF_8000_0000_0000);
        let pfn = Pfn::new(0x1234);
        let va = m.frame_to_virt(pfn);
        assert_eq!(va, 0xFFFF_8000_0123_4000);
        assert_eq!(m.virt_to_frame(va + 0x10), Some(pfn));
        assert_eq!(m.virt_to_frame(0x1000), None);
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
        assert_eq!(align_up(usize::MAX, 16), None);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
    }
}
