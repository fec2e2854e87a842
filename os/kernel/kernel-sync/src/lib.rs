//! # Kernel synchronization primitives
//!
//! Every allocator in the kernel serializes its state behind a [`TicketMutex`].
//! The ticket lock hands the critical section out in arrival order, so a CPU
//! spinning on the frame table or the heap is never starved by its neighbours.
//!
//! Interrupt-safe acquisition comes in two flavours:
//!
//! * [`Mutex::lock_irq`] saves and clears the interrupt flag for the guard's
//!   lifetime ([`IrqGuard`]).
//! * [`Mutex::lock_irq_on`] goes through a per-CPU [`IrqNesting`] counter so
//!   nested critical sections only restore the flag at the outermost release.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
pub mod per_cpu;
mod raw_ticket;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqKey, IrqMutex, IrqNesting, LockMode, ModeGuard, NestedIrqMutex};
pub use mutex::{Mutex, MutexGuard};
pub use per_cpu::{CpuId, PerCpu};
pub use raw_ticket::RawTicket;
pub use sync_once_cell::SyncOnceCell;

pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    unsafe fn raw_unlock(&self);
}
