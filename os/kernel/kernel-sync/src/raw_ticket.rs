use crate::irq::{self, IrqKey};
use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Fair spinlock built from two counters.
///
/// `ticket` is the next number handed to an arriving CPU, `service` is the
/// number currently allowed into the critical section. Waiters are served in
/// the order they drew their ticket.
pub struct RawTicket {
    ticket: AtomicUsize,
    service: AtomicUsize,
}

impl Default for RawTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ticket: AtomicUsize::new(0),
            service: AtomicUsize::new(0),
        }
    }

    /// Draws a ticket and spins until it is served.
    ///
    /// Returns the ticket number that now owns the lock.
    #[inline]
    pub fn take(&self) -> usize {
        let ticket = self.ticket.fetch_add(1, Ordering::Relaxed);
        // Acquire when we observe our turn
        while self.service.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
        ticket
    }

    /// Claims the lock only if nobody holds or waits for it.
    #[inline]
    pub fn try_take(&self) -> bool {
        let service = self.service.load(Ordering::Relaxed);
        let ticket = self.ticket.load(Ordering::Relaxed);
        if ticket == service {
            self.ticket
                .compare_exchange(
                    ticket,
                    ticket.wrapping_add(1),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
        } else {
            false
        }
    }

    /// Serves the next ticket.
    ///
    /// # Safety
    /// The caller must hold the lock (a matching [`take`](Self::take) or a
    /// successful [`try_take`](Self::try_take)).
    #[inline]
    pub unsafe fn give(&self) {
        debug_assert!(self.is_locked(), "ticket lock released while not held");
        // Only the holder writes `service`, so a plain load/store pair is enough.
        let served = self.service.load(Ordering::Relaxed);
        self.service
            .store(served.wrapping_add(1), Ordering::Release);
    }

    /// Saves and disables interrupts, then takes the lock.
    ///
    /// The returned key must be handed back unmodified to
    /// [`give_irq`](Self::give_irq).
    #[inline]
    #[must_use = "the key restores the interrupt state in `give_irq`"]
    pub fn take_irq(&self) -> IrqKey {
        let key = irq::save_and_disable();
        self.take();
        key
    }

    /// Releases the lock, then restores the interrupt state saved in `key`.
    ///
    /// # Safety
    /// Same contract as [`give`](Self::give); `key` must come from the
    /// matching [`take_irq`](Self::take_irq).
    #[inline]
    pub unsafe fn give_irq(&self, key: IrqKey) {
        unsafe { self.give() };
        irq::restore(key);
    }

    /// Whether some CPU currently holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.ticket.load(Ordering::Relaxed) != self.service.load(Ordering::Relaxed)
    }

    /// Number of CPUs holding or waiting for the lock.
    #[inline]
    pub fn contenders(&self) -> usize {
        self.ticket
            .load(Ordering::Relaxed)
            .wrapping_sub(self.service.load(Ordering::Relaxed))
    }
}

impl RawLock for RawTicket {
    fn raw_lock(&self) {
        self.take();
    }

    fn raw_try_lock(&self) -> bool {
        self.try_take()
    }
}

impl RawUnlock for RawTicket {
    unsafe fn raw_unlock(&self) {
        unsafe { self.give() }
    }
}
