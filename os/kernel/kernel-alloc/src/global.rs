//! # Kernel-wide allocator instance
//!
//! The boot path builds one [`KernelMemory`] and publishes it here exactly
//! once. Subsystems reach it through [`kernel_memory`]; the kernel binary
//! registers [`KernelAllocator`] as its `#[global_allocator]`:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: kernel_alloc::global::KernelAllocator = kernel_alloc::global::KernelAllocator;
//! ```

use crate::addr::HhdmMapper;
use crate::memory::KernelMemory;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;
use kernel_sync::SyncOnceCell;
use log::info;

static KERNEL_MEMORY: SyncOnceCell<KernelMemory<HhdmMapper>> = SyncOnceCell::new();

/// Publishes the kernel's allocators.
///
/// # Errors
/// Hands `memory` back if an instance was already installed.
pub fn install(
    memory: KernelMemory<HhdmMapper>,
) -> Result<&'static KernelMemory<HhdmMapper>, KernelMemory<HhdmMapper>> {
    let installed = KERNEL_MEMORY.set(memory)?;
    info!("memory: kernel allocator installed; {}", installed.heap().stats());
    Ok(installed)
}

/// The installed allocators, if bootstrap has finished.
#[inline]
pub fn kernel_memory() -> Option<&'static KernelMemory<HhdmMapper>> {
    KERNEL_MEMORY.get()
}

/// `GlobalAlloc` shim over the installed [`KernelMemory`]. Allocations fail
/// until [`install`] has run.
#[derive(Copy, Clone, Debug, Default)]
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        kernel_memory()
            .and_then(|m| m.alloc(layout).ok())
            .map_or(null_mut(), |addr| addr as *mut u8)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(memory) = kernel_memory() else {
            panic!(
                "kernel allocator: dealloc of {ptr:p} ({:#x} bytes) before install",
                layout.size()
            );
        };
        memory.free(ptr as usize);
    }
}
