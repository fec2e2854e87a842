//! # Kernel Memory Allocation Stack
//!
//! This crate provides every allocator the kernel uses, from the first
//! bootstrap allocation up to `alloc::boxed::Box`. All allocators keep their
//! bookkeeping in index arenas outside the memory they manage, and each one
//! serializes its state behind a single `kernel_sync::TicketMutex`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────┐   ┌─────────────────────────────┐
//! │  Heap (heap)                │   │  Pools (pool)               │
//! │  • best fit, (size, addr)   │   │  • one object size each     │
//! │  • coalescing on free       │   │  • slot bitmaps per block   │
//! └──────────────┬──────────────┘   └──────────────┬──────────────┘
//!                │ grows via                       │ blocks via
//! ┌──────────────▼─────────────────────────────────▼──────────────┐
//! │  Page Frame Allocator (frame_alloc)                            │
//! │  • binary buddy, orders 0..=MAX_ORDER                          │
//! │  • frame table carved from early memory                        │
//! └──────────────────────────────┬────────────────────────────────┘
//!                                │ metadata from
//! ┌──────────────────────────────▼────────────────────────────────┐
//! │  Early Allocator (early)                                       │
//! │  • bump pointer over the boot window, no free                  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`memory::KernelMemory`] wires the layers together at boot and is the
//! single owner of the frame allocator and the heap afterwards;
//! [`global`] publishes it for the `#[global_allocator]` shim.
//!
//! ## Locking
//!
//! No operation holds two allocator locks at once. Pool growth drops the
//! pool lock before asking the frame allocator for a block, and heap growth
//! in [`memory::KernelMemory::alloc`] drops the heap lock before taking the
//! frame lock. Sizes are validated before any lock is taken and log records
//! are emitted after it is released.
//!
//! Each locked front-end carries a [`LockMode`] fixed at construction.
//! [`LockMode::IrqSave`] keeps interrupts disabled for the length of every
//! critical section and is required for any allocator reachable from an
//! interrupt handler. [`KernelMemory`] and the global allocator use it by
//! default.
//!
//! ## Failure Model
//!
//! * Exhaustion of the early window is fatal and panics.
//! * Exhaustion of frames, pool blocks or heap space returns
//!   [`AllocError::OutOfMemory`]; nothing retries internally except the
//!   single heap growth step in `KernelMemory`.
//! * Double frees, foreign addresses and corrupt links panic with the
//!   allocator and the address involved.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::addr::Pfn;
//! use kernel_alloc::frame_alloc::{FrameAllocator, FrameRecord};
//!
//! let mut table = [FrameRecord::RESERVED; 64];
//! let mut frames = FrameAllocator::new(&mut table, Pfn::new(0x100));
//! frames.release_range(Pfn::new(0x100)..Pfn::new(0x140));
//!
//! let run = frames.alloc_frames(3).unwrap();
//! assert_eq!(frames.free_frames_count(), 61);
//! frames.free_frames(run, 3);
//! assert_eq!(frames.free_frames_count(), 64);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod addr;
pub mod config;
pub mod early;
mod error;
pub mod frame_alloc;
pub mod global;
pub mod heap;
pub mod layout;
pub mod memory;
pub mod pool;

pub use addr::{FrameMapper, HhdmMapper, Pfn};
pub use early::EarlyAllocator;
pub use error::{AllocError, BootstrapError, EarlyAllocError, LayoutError};
pub use frame_alloc::{FrameAllocator, FrameSource, LockedFrameAllocator};
pub use heap::{Heap, LockedHeap};
pub use kernel_sync::LockMode;
pub use layout::{VmRange, VmSpace};
pub use memory::{BootMemory, KernelMemory, MemoryStats};
pub use pool::Pool;
