//! # Virtual address-space layout
//!
//! A [`VmSpace`] is a fixed-capacity, address-ordered list of named,
//! non-overlapping [`VmRange`]s. It describes where things live (user space,
//! the direct map, the heap window, kernel stacks) for diagnostics and for the
//! task layer; the allocators never consult it.

use crate::error::LayoutError;
use core::fmt;

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct VmRange {
    pub name: &'static str,
    pub start: usize,
    /// Exclusive.
    pub end: usize,
}

impl VmRange {
    #[must_use]
    pub const fn new(name: &'static str, start: usize, end: usize) -> Self {
        Self { name, start, end }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Debug for VmRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:#x}..{:#x})", self.name, self.start, self.end)
    }
}

impl fmt::Display for VmRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#018x}..{:#018x} {:>10} KiB  {}",
            self.start,
            self.end,
            self.len() / 1024,
            self.name
        )
    }
}

/// Up to `N` ranges kept sorted by start address.
pub struct VmSpace<const N: usize> {
    ranges: [Option<VmRange>; N],
    len: usize,
}

impl<const N: usize> Default for VmSpace<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> VmSpace<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ranges: [None; N],
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `range` at its address-ordered position.
    pub fn insert(&mut self, range: VmRange) -> Result<(), LayoutError> {
        if range.is_empty() {
            return Err(LayoutError::Empty { name: range.name });
        }
        if let Some(other) = self.iter().find(|r| r.overlaps(&range)) {
            return Err(LayoutError::Overlap {
                name: range.name,
                other: other.name,
            });
        }
        if self.len == N {
            return Err(LayoutError::Full);
        }

        let at = self.iter().position(|r| r.start > range.start).unwrap_or(self.len);
        self.ranges[at..=self.len].rotate_right(1);
        self.ranges[at] = Some(range);
        self.len += 1;
        Ok(())
    }

    /// Removes and returns the range called `name`.
    pub fn remove(&mut self, name: &str) -> Option<VmRange> {
        let at = self.iter().position(|r| r.name == name)?;
        let range = self.ranges[at].take();
        self.ranges[at..self.len].rotate_left(1);
        self.len -= 1;
        range
    }

    /// The range containing `addr`.
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<&VmRange> {
        self.iter().find(|r| r.contains(addr))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&VmRange> {
        self.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmRange> + '_ {
        self.ranges[..self.len].iter().flatten()
    }
}

impl<const N: usize> fmt::Debug for VmSpace<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<const N: usize> fmt::Display for VmSpace<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in self.iter() {
            writeln!(f, "{r}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_stay_sorted() {
        let mut space: VmSpace<4> = VmSpace::new();
        space.insert(VmRange::new("heap", 0x3000, 0x4000)).unwrap();
        space.insert(VmRange::new("user", 0x0, 0x1000)).unwrap();
        space.insert(VmRange::new("stack", 0x1000, 0x2000)).unwrap();
        let names: Vec<_> = space.iter().map(|r| r.name).collect();
        assert_eq!(names, ["user", "stack", "heap"]);
        assert_eq!(space.find(0x1fff).map(|r| r.name), Some("stack"));
        assert_eq!(space.find(0x2000), None);
    }

    #[test]
    fn rejects_overlap_empty_and_overflow() {
        let mut space: VmSpace<2> = VmSpace::new();
        space.insert(VmRange::new("a", 0x1000, 0x2000)).unwrap();
        assert_eq!(
            space.insert(VmRange::new("b", 0x1800, 0x2800)),
            Err(LayoutError::Overlap { name: "b", other: "a" })
        );
        assert_eq!(
            space.insert(VmRange::new("c", 0x3000, 0x3000)),
            Err(LayoutError::Empty { name: "c" })
        );
        space.insert(VmRange::new("d", 0x2000, 0x3000)).unwrap();
        assert_eq!(space.insert(VmRange::new("e", 0x5000, 0x6000)), Err(LayoutError::Full));
    }

    #[test]
    fn remove_keeps_order() {
        let mut space: VmSpace<3> = VmSpace::new();
        space.insert(VmRange::new("a", 0x0, 0x10)).unwrap();
        space.insert(VmRange::new("b", 0x10, 0x20)).unwrap();
        space.insert(VmRange::new("c", 0x20, 0x30)).unwrap();
        assert_eq!(space.remove("b").map(|r| r.start), Some(0x10));
        let starts: Vec<_> = space.iter().map(|r| r.start).collect();
        assert_eq!(starts, [0x0, 0x20]);
        assert!(space.get("b").is_none());
        assert_eq!(space.len(), 2);
    }
}
