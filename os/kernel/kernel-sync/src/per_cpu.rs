//! Fixed-capacity per-CPU storage.
//!
//! The array is sized for the largest supported machine at compile time;
//! [`PerCpu::set_online`] records how many entries are live once the CPU
//! count is known. A [`CpuId`] is only ever produced by [`PerCpu::cpu`], which
//! checks the index against that count.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on CPUs the kernel is built for.
pub const MAX_CPUS: usize = 64;

/// A validated logical CPU index.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// The bootstrap processor. Always online.
    pub const BOOT: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct PerCpu<T, const N: usize = MAX_CPUS> {
    slots: [T; N],
    online: AtomicUsize,
}

impl<T, const N: usize> PerCpu<T, N> {
    /// Wraps the per-CPU array. Only the bootstrap processor is online.
    pub const fn from_array(slots: [T; N]) -> Self {
        assert!(N > 0, "per-CPU storage needs at least one slot");
        Self {
            slots,
            online: AtomicUsize::new(1),
        }
    }

    /// Records the number of CPUs brought up at startup.
    ///
    /// # Panics
    /// If `count` is zero or exceeds the compiled capacity `N`, or if it would
    /// shrink the online set.
    pub fn set_online(&self, count: usize) {
        assert!(
            (1..=N).contains(&count),
            "cpu count {count} outside supported range 1..={N}"
        );
        let prev = self.online.fetch_max(count, Ordering::AcqRel);
        assert!(prev <= count, "online cpu count cannot shrink ({prev} -> {count})");
    }

    #[inline]
    pub fn online(&self) -> usize {
        self.online.load(Ordering::Acquire)
    }

    /// Validates `index` against the online CPU count.
    #[inline]
    pub fn cpu(&self, index: usize) -> Option<CpuId> {
        if index < self.online() {
            u32::try_from(index).ok().map(CpuId)
        } else {
            None
        }
    }

    #[inline]
    pub fn try_get(&self, cpu: CpuId) -> Option<&T> {
        if cpu.index() < self.online() {
            self.slots.get(cpu.index())
        } else {
            None
        }
    }

    /// # Panics
    /// If `cpu` was validated against a different, larger per-CPU table.
    #[inline]
    pub fn get(&self, cpu: CpuId) -> &T {
        match self.try_get(cpu) {
            Some(slot) => slot,
            None => panic!("{cpu} is not online (online = {})", self.online()),
        }
    }

    /// Online CPUs and their slots.
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.slots[..self.online()]
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| u32::try_from(i).ok().map(|id| (CpuId(id), slot)))
    }
}
