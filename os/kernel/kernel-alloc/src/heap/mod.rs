//! # General-purpose kernel heap
//!
//! Blocks are described by [`HeapNode`]s in an index arena rather than by
//! headers inside the managed memory:
//!
//! ```text
//!   addr order:  [A used]─[B free]─[C used]─[D free]      prev/next links
//!   by_size:     B, D keyed (size, addr)                   free blocks only
//!   by_addr:     A, B, C, D keyed addr                     every block
//! ```
//!
//! `alloc` takes the best fit from the size tree and splits off a tail when
//! the remainder is at least [`HEAP_MIN_BLOCK`]. `free` finds the block in the
//! address tree and merges it with free neighbours that touch it, so two free
//! blocks are never adjacent.
//!
//! Running out of spare nodes degrades gracefully: a block that cannot be
//! split is handed out whole.

mod tree;

use crate::addr::{align_down, align_up};
use crate::config::{HEAP_GRANULE, HEAP_MIN_BLOCK};
use crate::error::AllocError;
use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use kernel_sync::{LockMode, TicketMutex};
use log::{debug, trace, warn};
use tree::{BY_ADDR, BY_SIZE, Links, NIL, Tree};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum NodeState {
    Spare,
    Free,
    Used,
}

/// One entry of the heap's node arena.
#[derive(Copy, Clone, Debug)]
pub struct HeapNode {
    addr: usize,
    size: usize,
    state: NodeState,
    /// Address-order neighbours; `next` also chains spare nodes.
    prev: u32,
    next: u32,
    links: [Links; 2],
}

impl HeapNode {
    pub const EMPTY: Self = Self {
        addr: 0,
        size: 0,
        state: NodeState::Spare,
        prev: NIL,
        next: NIL,
        links: [Links::EMPTY; 2],
    };

    const fn end(&self) -> usize {
        self.addr + self.size
    }
}

impl Default for HeapNode {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A block as seen from outside the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapBlock {
    pub addr: usize,
    pub size: usize,
    pub free: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes handed to the heap via `init`/`extend`.
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub largest_free: usize,
    pub free_blocks: usize,
    pub spare_nodes: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heap: {:#x} used / {:#x} total, {:#x} free in {} blocks (largest {:#x}), {} spare",
            self.used, self.total, self.free, self.free_blocks, self.largest_free, self.spare_nodes
        )
    }
}

pub struct Heap<'a> {
    nodes: &'a mut [HeapNode],
    by_size: Tree<BY_SIZE>,
    by_addr: Tree<BY_ADDR>,
    /// Lowest-address block.
    first: u32,
    spare: u32,
    spare_count: usize,
    total: usize,
    used: usize,
}

impl<'a> Heap<'a> {
    /// An empty heap whose blocks are described by `nodes`.
    ///
    /// # Panics
    /// If the arena has more entries than a `u32` index can address.
    pub fn new(nodes: &'a mut [HeapNode]) -> Self {
        assert!(nodes.len() < NIL as usize, "heap node arena too large");
        let len = nodes.len();
        for (i, n) in nodes.iter_mut().enumerate() {
            *n = HeapNode::EMPTY;
            n.next = if i + 1 < len { (i + 1) as u32 } else { NIL };
        }
        Self {
            nodes,
            by_size: Tree::new(),
            by_addr: Tree::new(),
            first: NIL,
            spare: if len == 0 { NIL } else { 0 },
            spare_count: len,
            total: 0,
            used: 0,
        }
    }

    /// Registers `[start, start + len)` as the initial free block.
    pub fn init(&mut self, start: usize, len: usize) -> Result<(), AllocError> {
        self.extend(start, len)
    }

    /// Adds `[start, start + len)` to the heap, merging it with a free block
    /// that ends at `start` or begins at its end.
    ///
    /// # Panics
    /// If the range overlaps memory the heap already manages.
    pub fn extend(&mut self, start: usize, len: usize) -> Result<(), AllocError> {
        let invalid = AllocError::InvalidSize { size: len };
        let end = start.checked_add(len).ok_or(invalid)?;
        let lo = align_up(start, HEAP_GRANULE).ok_or(invalid)?;
        let hi = align_down(end, HEAP_GRANULE);
        if hi < lo || hi - lo < HEAP_MIN_BLOCK {
            return Err(invalid);
        }
        let size = hi - lo;

        let pred = self.by_addr.floor(self.nodes, (lo, 0));
        let succ = pred.map_or(self.first, |p| self.nodes[p as usize].next);
        if let Some(p) = pred {
            let n = &self.nodes[p as usize];
            assert!(
                n.end() <= lo,
                "heap: extension {lo:#x}..{hi:#x} overlaps block {:#x}..{:#x}",
                n.addr,
                n.end()
            );
        }
        if succ != NIL {
            let n = &self.nodes[succ as usize];
            assert!(
                hi <= n.addr,
                "heap: extension {lo:#x}..{hi:#x} overlaps block {:#x}..{:#x}",
                n.addr,
                n.end()
            );
        }

        let merge_pred = pred.filter(|&p| {
            let n = &self.nodes[p as usize];
            n.state == NodeState::Free && n.end() == lo
        });
        let idx = if let Some(p) = merge_pred {
            self.by_size.remove(self.nodes, p);
            self.nodes[p as usize].size += size;
            p
        } else {
            let idx = self.take_node().ok_or(AllocError::ArenaFull)?;
            self.nodes[idx as usize] = HeapNode {
                addr: lo,
                size,
                state: NodeState::Free,
                prev: pred.unwrap_or(NIL),
                next: succ,
                links: [Links::EMPTY; 2],
            };
            match pred {
                Some(p) => self.nodes[p as usize].next = idx,
                None => self.first = idx,
            }
            if succ != NIL {
                self.nodes[succ as usize].prev = idx;
            }
            self.by_addr.insert(self.nodes, idx);
            idx
        };

        if succ != NIL && self.touches_free(idx, succ) {
            self.by_size.remove(self.nodes, succ);
            self.absorb_next(idx);
        }
        self.by_size.insert(self.nodes, idx);
        self.total += size;
        Ok(())
    }

    /// Rounds a request up to a block size, rejecting zero and overlarge sizes.
    pub fn block_size(size: usize) -> Result<usize, AllocError> {
        if size == 0 || size > isize::MAX as usize {
            return Err(AllocError::InvalidSize { size });
        }
        align_up(size, HEAP_GRANULE)
            .map(|s| s.max(HEAP_MIN_BLOCK))
            .ok_or(AllocError::InvalidSize { size })
    }

    /// Size of the free block a request for `size` bytes at `align` has to
    /// find. Alignments above the granule reserve room to slide the start
    /// forward and still leave a splittable head.
    pub fn search_size(size: usize, align: usize) -> Result<usize, AllocError> {
        let req = Self::block_size(size)?;
        if align <= HEAP_GRANULE {
            return Ok(req);
        }
        align
            .checked_mul(2)
            .and_then(|pad| req.checked_add(pad))
            .ok_or(AllocError::InvalidAlignment { align })
    }

    /// Allocates at least `size` bytes aligned to [`HEAP_GRANULE`].
    pub fn alloc(&mut self, size: usize) -> Result<usize, AllocError> {
        let req = Self::block_size(size)?;
        let idx = self.take_fit(req)?;
        self.split(idx, req);
        Ok(self.nodes[idx as usize].addr)
    }

    /// Allocates a block satisfying `layout`, including alignments above the
    /// granule.
    pub fn alloc_layout(&mut self, layout: Layout) -> Result<usize, AllocError> {
        let align = layout.align();
        if align <= HEAP_GRANULE {
            return self.alloc(layout.size());
        }
        let req = Self::block_size(layout.size())?;
        let padded = Self::search_size(layout.size(), align)?;

        let mut idx = self.take_fit(padded)?;
        let addr = self.nodes[idx as usize].addr;
        let mut pad =
            align_up(addr, align).ok_or(AllocError::InvalidAlignment { align })? - addr;
        if pad != 0 && pad < HEAP_MIN_BLOCK {
            pad += align;
        }

        if pad != 0 {
            let Some(body) = self.take_node() else {
                self.used -= self.nodes[idx as usize].size;
                self.release(idx);
                return Err(AllocError::ArenaFull);
            };
            let head = self.nodes[idx as usize];
            self.nodes[body as usize] = HeapNode {
                addr: addr + pad,
                size: head.size - pad,
                state: NodeState::Used,
                prev: idx,
                next: head.next,
                links: [Links::EMPTY; 2],
            };
            if head.next != NIL {
                self.nodes[head.next as usize].prev = body;
            }
            let h = &mut self.nodes[idx as usize];
            h.next = body;
            h.size = pad;
            h.state = NodeState::Free;
            self.used -= pad;
            self.by_addr.insert(self.nodes, body);
            self.by_size.insert(self.nodes, idx);
            idx = body;
        }

        self.split(idx, req);
        Ok(self.nodes[idx as usize].addr)
    }

    /// Returns the block starting at `addr`.
    ///
    /// # Panics
    /// If `addr` does not start a block or the block is already free.
    pub fn free(&mut self, addr: usize) {
        let Some(idx) = self.by_addr.find(self.nodes, (addr, 0)) else {
            panic!("heap: free of unknown address {addr:#x}");
        };
        let n = self.nodes[idx as usize];
        assert!(
            n.state == NodeState::Used,
            "heap: double free of {addr:#x} ({:#x} bytes)",
            n.size
        );
        self.used -= n.size;
        self.release(idx);
    }

    /// Size of the live block starting at `addr`.
    #[must_use]
    pub fn block_len(&self, addr: usize) -> Option<usize> {
        let idx = self.by_addr.find(self.nodes, (addr, 0))?;
        let n = &self.nodes[idx as usize];
        (n.state == NodeState::Used).then_some(n.size)
    }

    /// Whether `addr` lies inside memory managed by this heap.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.by_addr
            .floor(self.nodes, (addr, 0))
            .is_some_and(|i| addr < self.nodes[i as usize].end())
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total: self.total,
            used: self.used,
            free: self.total - self.used,
            largest_free: self
                .by_size
                .max(self.nodes)
                .map_or(0, |i| self.nodes[i as usize].size),
            free_blocks: self.by_size.len(),
            spare_nodes: self.spare_count,
        }
    }

    /// Every block in address order.
    pub fn blocks(&self) -> impl Iterator<Item = HeapBlock> + '_ {
        let mut at = self.first;
        core::iter::from_fn(move || {
            if at == NIL {
                return None;
            }
            let n = &self.nodes[at as usize];
            at = n.next;
            Some(HeapBlock {
                addr: n.addr,
                size: n.size,
                free: n.state == NodeState::Free,
            })
        })
    }

    /// Free blocks in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = HeapBlock> + '_ {
        self.blocks().filter(|b| b.free)
    }

    /// Cross-checks both trees against the address-ordered block list.
    ///
    /// # Panics
    /// On the first inconsistency.
    pub fn audit(&self) {
        let mut blocks = 0;
        let mut free = 0;
        let (mut total, mut used) = (0, 0);
        let mut prev = NIL;
        let mut at = self.first;
        while at != NIL {
            let n = &self.nodes[at as usize];
            assert!(n.state != NodeState::Spare, "heap: spare node {at} on block list");
            assert_eq!(n.prev, prev, "heap: broken back link at {:#x}", n.addr);
            assert_eq!(
                self.by_addr.find(self.nodes, (n.addr, 0)),
                Some(at),
                "heap: block {:#x} not indexed",
                n.addr
            );
            if prev != NIL {
                let p = &self.nodes[prev as usize];
                assert!(p.end() <= n.addr, "heap: blocks {:#x} and {:#x} overlap", p.addr, n.addr);
                let both_free = p.state == NodeState::Free && n.state == NodeState::Free;
                assert!(
                    !(both_free && p.end() == n.addr),
                    "heap: adjacent free blocks at {:#x}",
                    p.addr
                );
            }
            if n.state == NodeState::Free {
                assert_eq!(
                    self.by_size.find(self.nodes, (n.size, n.addr)),
                    Some(at),
                    "heap: free block {:#x} missing from size tree",
                    n.addr
                );
                free += 1;
            } else {
                used += n.size;
            }
            total += n.size;
            blocks += 1;
            prev = at;
            at = n.next;
        }

        assert_eq!(self.by_addr.check(self.nodes), blocks, "heap: address tree out of sync");
        assert_eq!(self.by_size.check(self.nodes), free, "heap: size tree out of sync");
        assert_eq!(total, self.total, "heap: block sizes do not add up");
        assert_eq!(used, self.used, "heap: used bytes do not add up");
    }

    /// Removes the best fit for `req` bytes from the size tree and marks it used.
    fn take_fit(&mut self, req: usize) -> Result<u32, AllocError> {
        let idx = self
            .by_size
            .lower_bound(self.nodes, (req, 0))
            .ok_or(AllocError::OutOfMemory)?;
        self.by_size.remove(self.nodes, idx);
        let n = &mut self.nodes[idx as usize];
        n.state = NodeState::Used;
        self.used += n.size;
        Ok(idx)
    }

    /// Shrinks the used block `idx` to `req` bytes; the tail becomes a free
    /// block if it is large enough and a spare node is available.
    fn split(&mut self, idx: u32, req: usize) {
        let n = self.nodes[idx as usize];
        let rest = n.size - req;
        if rest < HEAP_MIN_BLOCK {
            return;
        }
        let Some(tail) = self.take_node() else {
            return;
        };
        self.nodes[tail as usize] = HeapNode {
            addr: n.addr + req,
            size: rest,
            state: NodeState::Free,
            prev: idx,
            next: n.next,
            links: [Links::EMPTY; 2],
        };
        if n.next != NIL {
            self.nodes[n.next as usize].prev = tail;
        }
        let head = &mut self.nodes[idx as usize];
        head.next = tail;
        head.size = req;
        self.used -= rest;
        self.by_addr.insert(self.nodes, tail);
        self.by_size.insert(self.nodes, tail);
    }

    /// Marks `idx` free, merges it with touching free neighbours and indexes
    /// the result by size.
    fn release(&mut self, idx: u32) {
        self.nodes[idx as usize].state = NodeState::Free;

        let next = self.nodes[idx as usize].next;
        if next != NIL && self.touches_free(idx, next) {
            self.by_size.remove(self.nodes, next);
            self.absorb_next(idx);
        }

        let prev = self.nodes[idx as usize].prev;
        let idx = if prev != NIL && self.touches_free(prev, idx) {
            self.by_size.remove(self.nodes, prev);
            self.absorb_next(prev);
            prev
        } else {
            idx
        };
        self.by_size.insert(self.nodes, idx);
    }

    /// `a` ends where `b` begins and both are free.
    fn touches_free(&self, a: u32, b: u32) -> bool {
        let (a, b) = (&self.nodes[a as usize], &self.nodes[b as usize]);
        a.state == NodeState::Free && b.state == NodeState::Free && a.end() == b.addr
    }

    /// Folds the address successor of `idx` into it. The successor must
    /// already be out of the size tree.
    fn absorb_next(&mut self, idx: u32) {
        let next = self.nodes[idx as usize].next;
        let n = self.nodes[next as usize];
        self.by_addr.remove(self.nodes, next);
        let head = &mut self.nodes[idx as usize];
        head.size += n.size;
        head.next = n.next;
        if n.next != NIL {
            self.nodes[n.next as usize].prev = idx;
        }
        self.put_node(next);
    }

    fn take_node(&mut self) -> Option<u32> {
        if self.spare == NIL {
            return None;
        }
        let idx = self.spare;
        self.spare = self.nodes[idx as usize].next;
        self.spare_count -= 1;
        Some(idx)
    }

    fn put_node(&mut self, idx: u32) {
        self.nodes[idx as usize] = HeapNode {
            next: self.spare,
            ..HeapNode::EMPTY
        };
        self.spare = idx;
        self.spare_count += 1;
    }
}

impl fmt::Debug for Heap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap").field("stats", &self.stats()).finish_non_exhaustive()
    }
}

/// The heap behind a ticket lock, held for the whole of each operation.
///
/// Requests that can be rejected from their arguments alone fail before the
/// lock is taken.
pub struct LockedHeap<'a> {
    inner: TicketMutex<Heap<'a>>,
    mode: LockMode,
}

impl<'a> LockedHeap<'a> {
    /// A heap locked with [`LockMode::Plain`].
    #[must_use]
    pub const fn new(heap: Heap<'a>) -> Self {
        Self::with_mode(heap, LockMode::Plain)
    }

    /// A heap whose every acquisition goes through `mode`.
    #[must_use]
    pub const fn with_mode(heap: Heap<'a>, mode: LockMode) -> Self {
        Self {
            inner: TicketMutex::new(heap),
            mode,
        }
    }

    #[inline]
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn alloc(&self, size: usize) -> Result<usize, AllocError> {
        Heap::block_size(size)?;
        let result = self.locked(|h| h.alloc(size));
        Self::trace_alloc(size, HEAP_GRANULE, result);
        result
    }

    pub fn alloc_layout(&self, layout: Layout) -> Result<usize, AllocError> {
        Heap::search_size(layout.size(), layout.align())?;
        let result = self.locked(|h| h.alloc_layout(layout));
        Self::trace_alloc(layout.size(), layout.align(), result);
        result
    }

    /// # Panics
    /// See [`Heap::free`].
    pub fn free(&self, addr: usize) {
        self.locked(|h| h.free(addr));
        trace!("heap: free {addr:#x}");
    }

    pub fn extend(&self, start: usize, len: usize) -> Result<(), AllocError> {
        let result = self.locked(|h| h.extend(start, len));
        match result {
            Ok(()) => debug!("heap: extended by {len:#x} bytes at {start:#x}"),
            Err(e) => warn!("heap: extension at {start:#x} failed: {e}"),
        }
        result
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.locked(|h| h.stats())
    }

    /// Runs `f` inside the heap's critical section.
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut Heap<'a>) -> U) -> U {
        self.locked(f)
    }

    fn locked<U>(&self, f: impl FnOnce(&mut Heap<'a>) -> U) -> U {
        let mut heap = self.inner.lock_mode(self.mode);
        f(&mut heap)
    }

    fn trace_alloc(size: usize, align: usize, result: Result<usize, AllocError>) {
        match result {
            Ok(addr) => trace!("heap: alloc {size:#x} (align {align:#x}) at {addr:#x}"),
            Err(e) => warn!("heap: alloc {size:#x} (align {align:#x}) failed: {e}"),
        }
    }
}

impl fmt::Debug for LockedHeap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

unsafe impl GlobalAlloc for LockedHeap<'_> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc_layout(layout)
            .map_or(core::ptr::null_mut(), |addr| addr as *mut u8)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr as usize);
    }
}
