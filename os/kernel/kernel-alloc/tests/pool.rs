use kernel_alloc::Pfn;
use kernel_alloc::addr::HhdmMapper;
use kernel_alloc::config::ReturnPolicy;
use kernel_alloc::frame_alloc::{FrameAllocator, FrameRecord, LockedFrameAllocator};
use kernel_alloc::pool::{Pool, PoolBlock};
use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

const HHDM: usize = 0xFFFF_8000_0000_0000;

fn frames(table: &mut [FrameRecord]) -> LockedFrameAllocator<'_> {
    let n = table.len() as u64;
    let mut fa = FrameAllocator::new(table, Pfn::new(0x800));
    fa.release_range(Pfn::new(0x800)..Pfn::new(0x800 + n));
    LockedFrameAllocator::new(fa)
}

fn pool_of<'r, 't>(
    size: usize,
    records: &'r mut [PoolBlock],
    policy: ReturnPolicy,
    fa: &'r LockedFrameAllocator<'t>,
) -> Pool<'r, &'r LockedFrameAllocator<'t>, HhdmMapper> {
    Pool::create(size, records, policy, fa, HhdmMapper::new(HHDM)).unwrap()
}

#[test]
fn slots_are_unique_and_aligned() {
    for requested in [16, 24, 100, 512, 3000, 9000] {
        let mut table = vec![FrameRecord::RESERVED; 512];
        let fa = frames(&mut table);
        let mut records = vec![PoolBlock::EMPTY; 16];
        let pool = pool_of(requested, &mut records, ReturnPolicy::Eager, &fa);
        let size = pool.object_size();
        assert!(size >= requested && size.is_power_of_two());

        let count = pool.slots_per_block() * 3 + 1;
        let mut seen = HashSet::new();
        for _ in 0..count {
            let addr = pool.alloc().unwrap();
            assert_eq!(addr % size, 0, "{addr:#x} not aligned to {size}");
            assert!(seen.insert(addr), "{addr:#x} handed out twice");
        }
        assert_eq!(pool.stats().live, count);
        assert_eq!(pool.stats().blocks, 4);

        for addr in seen {
            pool.free(addr);
        }
        assert_eq!(pool.stats().blocks, 0);
        assert_eq!(fa.stats().free, 512);
    }
}

#[test]
fn freed_slots_come_back_before_new_blocks() {
    let mut table = vec![FrameRecord::RESERVED; 8];
    let fa = frames(&mut table);
    let mut records = vec![PoolBlock::EMPTY; 4];
    let pool = pool_of(256, &mut records, ReturnPolicy::Retain, &fa);

    let slots: Vec<usize> = (0..pool.slots_per_block()).map(|_| pool.alloc().unwrap()).collect();
    assert_eq!(pool.stats().blocks, 1);
    pool.free(slots[5]);
    assert_eq!(pool.alloc().unwrap(), slots[5]);
    assert_eq!(pool.stats().blocks, 1);
    assert_eq!(pool.stats().free_slots, 0);
}

#[test]
fn retained_blocks_survive_until_shrink() {
    let mut table = vec![FrameRecord::RESERVED; 8];
    let fa = frames(&mut table);
    let mut records = vec![PoolBlock::EMPTY; 4];
    let pool = pool_of(64, &mut records, ReturnPolicy::Retain, &fa);

    let all: Vec<usize> = (0..pool.slots_per_block() * 2).map(|_| pool.alloc().unwrap()).collect();
    for addr in &all {
        pool.free(*addr);
    }
    assert_eq!(pool.stats().blocks, 2);
    assert_eq!(fa.stats().free, 6);
    assert_eq!(pool.shrink(), 2);
    assert_eq!(fa.stats().free, 8);
}

#[test]
fn concurrent_allocations_are_unique() {
    let threads = 4;
    let per_thread = 300;

    let mut table = vec![FrameRecord::RESERVED; 256];
    let fa = frames(&mut table);
    let mut records = vec![PoolBlock::EMPTY; 64];
    let pool = pool_of(128, &mut records, ReturnPolicy::Eager, &fa);
    let barrier = Barrier::new(threads);

    let all: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let mut mine = Vec::with_capacity(per_thread);
                    for i in 0..per_thread {
                        mine.push(pool.alloc().unwrap());
                        if i % 3 == 0 {
                            let addr = mine.swap_remove(0);
                            pool.free(addr);
                        }
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len());
    assert_eq!(pool.stats().live, all.len());
    for addr in all {
        pool.free(addr);
    }
    assert_eq!(pool.stats().blocks, 0);
    assert_eq!(fa.stats().free, 256);
}
