//! Interrupt-flag handling for interrupt-safe locking.
//!
//! # Platform
//!
//! On bare-metal `x86_64` the flag is the `IF` bit of `RFLAGS`, cleared with
//! `cli` and set with `sti`. These must run where `cli`/`sti` are legal
//! (ring 0). Hosted builds, which only exist to run the test suite, swap the
//! instructions for a process-wide emulated flag.

use crate::per_cpu::{CpuId, MAX_CPUS, PerCpu};
use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// `IF` bit in `RFLAGS`.
    const RFLAGS_IF: u64 = 1 << 9;

    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    #[must_use]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }

    #[inline]
    pub fn interrupts_enabled() -> bool {
        rflags() & RFLAGS_IF != 0
    }

    #[inline]
    pub fn disable_interrupts() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable_interrupts() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    static EMULATED_IF: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn interrupts_enabled() -> bool {
        EMULATED_IF.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn disable_interrupts() {
        EMULATED_IF.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn enable_interrupts() {
        EMULATED_IF.store(true, Ordering::SeqCst);
    }
}

pub use arch::{disable_interrupts, enable_interrupts, interrupts_enabled};

/// Interrupt state saved by [`save_and_disable`].
///
/// The key is opaque, cannot be copied and is tied to the CPU that created it
/// (`!Send`). Pass it back unmodified to [`restore`].
#[must_use = "dropping the key leaves interrupts disabled"]
pub struct IrqKey {
    were_enabled: bool,
    _cpu_bound: PhantomData<*mut ()>,
}

impl IrqKey {
    /// Whether interrupts were enabled when the key was taken.
    #[inline]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

/// Disables interrupts if they are enabled and remembers the previous state.
#[inline]
pub fn save_and_disable() -> IrqKey {
    let were_enabled = interrupts_enabled();
    if were_enabled {
        disable_interrupts();
    }
    IrqKey {
        were_enabled,
        _cpu_bound: PhantomData,
    }
}

/// Re-enables interrupts only if they were enabled when `key` was taken.
#[inline]
pub fn restore(key: IrqKey) {
    if key.were_enabled {
        enable_interrupts();
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
pub struct IrqGuard {
    were_enabled: bool,
    _cpu_bound: PhantomData<*mut ()>,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let key = save_and_disable();
        Self {
            were_enabled: key.were_enabled,
            _cpu_bound: PhantomData,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        restore(IrqKey {
            were_enabled: self.were_enabled,
            _cpu_bound: PhantomData,
        });
    }
}

/// A mutex guard that also keeps interrupts disabled while held.
///
/// Fields drop in declaration order: the mutex is released first, then the
/// interrupt flag is restored.
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    g: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.g
    }
}

impl<T, R: RawLock + RawUnlock> DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.g
    }
}

struct NestCell {
    depth: AtomicU32,
    outer_enabled: AtomicBool,
}

impl NestCell {
    const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            outer_enabled: AtomicBool::new(false),
        }
    }
}

/// Per-CPU interrupt-disable nesting depth.
///
/// The outermost [`push_off`](Self::push_off) on a CPU records whether
/// interrupts were enabled; only the matching outermost
/// [`pop_off`](Self::pop_off) turns them back on.
pub struct IrqNesting<const N: usize = MAX_CPUS> {
    cpus: PerCpu<NestCell, N>,
}

impl<const N: usize> Default for IrqNesting<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> IrqNesting<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cpus: PerCpu::from_array([const { NestCell::new() }; N]),
        }
    }

    pub fn set_online(&self, count: usize) {
        self.cpus.set_online(count);
    }

    #[inline]
    pub fn cpu(&self, index: usize) -> Option<CpuId> {
        self.cpus.cpu(index)
    }

    pub fn push_off(&self, cpu: CpuId) {
        let key = save_and_disable();
        let cell = self.cpus.get(cpu);
        if cell.depth.load(Ordering::Relaxed) == 0 {
            cell.outer_enabled.store(key.were_enabled, Ordering::Relaxed);
        }
        cell.depth.fetch_add(1, Ordering::Relaxed);
    }

    /// # Panics
    /// On a `pop_off` without a matching `push_off`.
    pub fn pop_off(&self, cpu: CpuId) {
        let cell = self.cpus.get(cpu);
        let depth = cell.depth.load(Ordering::Relaxed);
        assert!(depth > 0, "unbalanced pop_off on {cpu}");
        cell.depth.store(depth - 1, Ordering::Relaxed);
        if depth == 1 && cell.outer_enabled.load(Ordering::Relaxed) {
            enable_interrupts();
        }
    }

    #[inline]
    pub fn depth(&self, cpu: CpuId) -> u32 {
        self.cpus.get(cpu).depth.load(Ordering::Relaxed)
    }
}

/// A mutex guard paired with one level of [`IrqNesting`].
pub struct NestedIrqMutex<'a, T, R: RawLock + RawUnlock, const N: usize> {
    g: Option<MutexGuard<'a, T, R>>,
    nesting: &'a IrqNesting<N>,
    cpu: CpuId,
}

impl<T, R: RawLock + RawUnlock, const N: usize> Deref for NestedIrqMutex<'_, T, R, N> {
    type Target = T;

    fn deref(&self) -> &T {
        self.g.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T, R: RawLock + RawUnlock, const N: usize> DerefMut for NestedIrqMutex<'_, T, R, N> {
    fn deref_mut(&mut self) -> &mut T {
        self.g.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T, R: RawLock + RawUnlock, const N: usize> Drop for NestedIrqMutex<'_, T, R, N> {
    fn drop(&mut self) {
        // Release the lock before the interrupt level drops.
        drop(self.g.take());
        self.nesting.pop_off(self.cpu);
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let ig = IrqGuard::new();
        let g = self.lock();
        IrqMutex { g, _irq: ig }
    }

    /// Acquires the mutex after raising `cpu`'s interrupt-disable depth.
    #[inline]
    pub fn lock_irq_on<'a, const N: usize>(
        &'a self,
        nesting: &'a IrqNesting<N>,
        cpu: CpuId,
    ) -> NestedIrqMutex<'a, T, R, N> {
        nesting.push_off(cpu);
        let g = self.lock();
        NestedIrqMutex {
            g: Some(g),
            nesting,
            cpu,
        }
    }
}

/// How an allocator front-end acquires its lock.
///
/// `LockedHeap`, `LockedFrameAllocator` and `Pool` in `kernel-alloc` store one
/// and pass it to [`Mutex::lock_mode`] on every acquisition.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LockMode {
    /// Plain ticket acquisition; callers never run in interrupt context.
    #[default]
    Plain,
    /// Save and disable interrupts around the critical section.
    IrqSave,
}

/// Guard returned by [`Mutex::lock_mode`].
pub enum ModeGuard<'a, T, R: RawLock + RawUnlock> {
    Plain(MutexGuard<'a, T, R>),
    IrqSave(IrqMutex<'a, T, R>),
}

impl<T, R: RawLock + RawUnlock> Deref for ModeGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Self::Plain(g) => g,
            Self::IrqSave(g) => g,
        }
    }
}

impl<T, R: RawLock + RawUnlock> DerefMut for ModeGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            Self::Plain(g) => g,
            Self::IrqSave(g) => g,
        }
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    #[inline]
    pub fn lock_mode(&self, mode: LockMode) -> ModeGuard<'_, T, R> {
        match mode {
            LockMode::Plain => ModeGuard::Plain(self.lock()),
            LockMode::IrqSave => ModeGuard::IrqSave(self.lock_irq()),
        }
    }
}
