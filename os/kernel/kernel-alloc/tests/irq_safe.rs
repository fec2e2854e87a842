//! Interrupt-flag behaviour of the locked allocator front-ends.
//!
//! The hosted interrupt flag is process-wide, so everything that looks at it
//! lives in this one test.

use core::alloc::Layout;
use core::cell::RefCell;
use core::ops::Range;
use kernel_alloc::config::ReturnPolicy;
use kernel_alloc::frame_alloc::{FrameAllocator, FrameRecord, FrameSource, LockedFrameAllocator};
use kernel_alloc::heap::{Heap, HeapNode, LockedHeap};
use kernel_alloc::pool::{Pool, PoolBlock};
use kernel_alloc::{BootMemory, FrameMapper, HhdmMapper, KernelMemory, Pfn};
use kernel_sync::LockMode;
use kernel_sync::irq::{disable_interrupts, enable_interrupts, interrupts_enabled};

const HHDM: usize = 0xFFFF_8000_0000_0000;

/// Records the interrupt flag on every translation the pool asks for.
struct FlagWatch {
    inner: HhdmMapper,
    seen: RefCell<Vec<bool>>,
}

impl FrameMapper for FlagWatch {
    fn frame_to_virt(&self, pfn: Pfn) -> usize {
        self.seen.borrow_mut().push(interrupts_enabled());
        self.inner.frame_to_virt(pfn)
    }

    fn virt_to_frame(&self, addr: usize) -> Option<Pfn> {
        self.inner.virt_to_frame(addr)
    }
}

fn frames(table: &mut [FrameRecord], mode: LockMode) -> LockedFrameAllocator<'_> {
    let n = table.len() as u64;
    let mut fa = FrameAllocator::new(table, Pfn::new(0x200));
    fa.release_range(Pfn::new(0x200)..Pfn::new(0x200 + n));
    LockedFrameAllocator::with_mode(fa, mode)
}

fn boot() -> KernelMemory {
    let early: &'static mut [u64] = Box::leak(vec![0u64; 8 * 1024].into_boxed_slice());
    let early = early.as_mut_ptr() as usize..early.as_mut_ptr() as usize + 64 * 1024;
    let usable: &'static [Range<u64>] = Box::leak(Box::new([0x10_0000..0x40_0000]));
    let boot = BootMemory::new(early, usable).with_heap(64, 4);
    unsafe { KernelMemory::bootstrap(&boot, HhdmMapper::new(HHDM)) }.unwrap()
}

#[test]
fn irq_save_front_ends_mask_interrupts_only_inside_the_lock() {
    assert!(interrupts_enabled());

    // Heap.
    let mut nodes = vec![HeapNode::EMPTY; 16];
    let mut heap = Heap::new(&mut nodes);
    heap.init(0x4000_0000, 0x4000).unwrap();
    let heap = LockedHeap::with_mode(heap, LockMode::IrqSave);
    assert!(!heap.with_lock(|_| interrupts_enabled()));
    assert!(interrupts_enabled());
    let a = heap.alloc(200).unwrap();
    assert!(interrupts_enabled());
    heap.free(a);
    assert!(interrupts_enabled());

    // A plain heap leaves the flag alone.
    let mut nodes = vec![HeapNode::EMPTY; 4];
    let mut plain = Heap::new(&mut nodes);
    plain.init(0x5000_0000, 0x1000).unwrap();
    let plain = LockedHeap::new(plain);
    assert_eq!(plain.mode(), LockMode::Plain);
    assert!(plain.with_lock(|_| interrupts_enabled()));

    // Frames, through both the inherent API and `FrameSource`.
    let mut table = vec![FrameRecord::RESERVED; 64];
    let fa = frames(&mut table, LockMode::IrqSave);
    assert!(!fa.with_lock(|_| interrupts_enabled()));
    let run = fa.alloc_frames(5).unwrap();
    assert!(interrupts_enabled());
    fa.free_frames(run, 5);
    assert!(interrupts_enabled());
    assert_eq!(fa.stats().free, 64);
    assert!(interrupts_enabled());

    // Pool: the slot lookup in `free` runs inside the pool lock.
    let mut records = vec![PoolBlock::EMPTY; 4];
    let watch = FlagWatch {
        inner: HhdmMapper::new(HHDM),
        seen: RefCell::new(Vec::new()),
    };
    let pool = Pool::create(128, &mut records, ReturnPolicy::Eager, &fa, &watch)
        .unwrap()
        .with_lock_mode(LockMode::IrqSave);
    let obj = pool.alloc().unwrap();
    assert!(interrupts_enabled());
    watch.seen.borrow_mut().clear();
    pool.free(obj);
    assert_eq!(*watch.seen.borrow(), [false]);
    assert!(interrupts_enabled());
    assert_eq!(pool.stats().blocks, 0);

    // Called with interrupts already off, as from a handler: they stay off.
    disable_interrupts();
    let b = heap.alloc(64).unwrap();
    heap.free(b);
    let run = fa.alloc_frames(1).unwrap();
    fa.free_frames(run, 1);
    assert!(!interrupts_enabled());
    enable_interrupts();

    // The kernel-wide stack defaults to interrupt-safe locking everywhere.
    let memory = boot();
    assert_eq!(memory.lock_mode(), LockMode::IrqSave);
    assert_eq!(memory.heap().mode(), LockMode::IrqSave);
    assert_eq!(memory.frames().mode(), LockMode::IrqSave);
    assert!(!memory.heap().with_lock(|_| interrupts_enabled()));
    assert!(!memory.frames().with_lock(|_| interrupts_enabled()));

    // Growth takes both locks one after the other.
    let big = Layout::from_size_align(64 * 1024, 16).unwrap();
    let p = memory.alloc(big).unwrap();
    assert!(interrupts_enabled());
    memory.free(p);
    assert!(interrupts_enabled());

    let mut records = vec![PoolBlock::EMPTY; 2];
    let pool = memory.create_pool(64, &mut records, ReturnPolicy::Retain).unwrap();
    assert_eq!(pool.lock_mode(), LockMode::IrqSave);
    let obj = pool.alloc().unwrap();
    pool.free(obj);
    assert!(interrupts_enabled());
}
