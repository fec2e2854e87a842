//! AVL trees threaded through the heap's node arena.
//!
//! Every [`HeapNode`] carries one [`Links`] per tree. `Tree<BY_SIZE>` orders
//! nodes by `(size, addr)`, `Tree<BY_ADDR>` by `addr`. Keys are unique within
//! a tree; inserting a duplicate or removing a missing key means the arena is
//! corrupt and panics.

use super::HeapNode;
use core::cmp::Ordering;

pub(super) const NIL: u32 = u32::MAX;

pub(super) const BY_SIZE: usize = 0;
pub(super) const BY_ADDR: usize = 1;

pub(super) type Key = (usize, usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct Links {
    left: u32,
    right: u32,
    height: u8,
}

impl Links {
    pub(super) const EMPTY: Self = Self {
        left: NIL,
        right: NIL,
        height: 0,
    };

    const LEAF: Self = Self {
        left: NIL,
        right: NIL,
        height: 1,
    };
}

#[derive(Debug)]
pub(super) struct Tree<const T: usize> {
    root: u32,
    len: usize,
}

#[inline]
fn key<const T: usize>(nodes: &[HeapNode], at: u32) -> Key {
    let n = &nodes[at as usize];
    if T == BY_SIZE { (n.size, n.addr) } else { (n.addr, 0) }
}

#[inline]
fn links<const T: usize>(nodes: &mut [HeapNode], at: u32) -> &mut Links {
    &mut nodes[at as usize].links[T]
}

#[inline]
fn height<const T: usize>(nodes: &[HeapNode], at: u32) -> u8 {
    if at == NIL { 0 } else { nodes[at as usize].links[T].height }
}

impl<const T: usize> Tree<T> {
    pub(super) const fn new() -> Self {
        Self { root: NIL, len: 0 }
    }

    pub(super) const fn len(&self) -> usize {
        self.len
    }

    pub(super) fn insert(&mut self, nodes: &mut [HeapNode], idx: u32) {
        *links::<T>(nodes, idx) = Links::LEAF;
        self.root = insert_at::<T>(nodes, self.root, idx);
        self.len += 1;
    }

    pub(super) fn remove(&mut self, nodes: &mut [HeapNode], idx: u32) {
        let k = key::<T>(nodes, idx);
        self.root = remove_at::<T>(nodes, self.root, k);
        *links::<T>(nodes, idx) = Links::EMPTY;
        self.len -= 1;
    }

    /// Node with exactly key `k`.
    pub(super) fn find(&self, nodes: &[HeapNode], k: Key) -> Option<u32> {
        let mut at = self.root;
        while at != NIL {
            let l = nodes[at as usize].links[T];
            at = match k.cmp(&key::<T>(nodes, at)) {
                Ordering::Less => l.left,
                Ordering::Greater => l.right,
                Ordering::Equal => return Some(at),
            };
        }
        None
    }

    /// Smallest node with key `>= k`.
    pub(super) fn lower_bound(&self, nodes: &[HeapNode], k: Key) -> Option<u32> {
        let mut at = self.root;
        let mut best = None;
        while at != NIL {
            let l = nodes[at as usize].links[T];
            if key::<T>(nodes, at) >= k {
                best = Some(at);
                at = l.left;
            } else {
                at = l.right;
            }
        }
        best
    }

    /// Largest node with key `<= k`.
    pub(super) fn floor(&self, nodes: &[HeapNode], k: Key) -> Option<u32> {
        let mut at = self.root;
        let mut best = None;
        while at != NIL {
            let l = nodes[at as usize].links[T];
            if key::<T>(nodes, at) <= k {
                best = Some(at);
                at = l.right;
            } else {
                at = l.left;
            }
        }
        best
    }

    pub(super) fn max(&self, nodes: &[HeapNode]) -> Option<u32> {
        if self.root == NIL {
            return None;
        }
        let mut at = self.root;
        while nodes[at as usize].links[T].right != NIL {
            at = nodes[at as usize].links[T].right;
        }
        Some(at)
    }

    /// Verifies ordering, balance and stored heights. Returns the node count.
    ///
    /// # Panics
    /// On the first violation found.
    pub(super) fn check(&self, nodes: &[HeapNode]) -> usize {
        let (count, _) = check_at::<T>(nodes, self.root, None, None);
        assert_eq!(count, self.len, "heap: tree {T} holds {count} nodes, expected {}", self.len);
        count
    }
}

fn insert_at<const T: usize>(nodes: &mut [HeapNode], at: u32, idx: u32) -> u32 {
    if at == NIL {
        return idx;
    }
    let k = key::<T>(nodes, idx);
    match k.cmp(&key::<T>(nodes, at)) {
        Ordering::Less => {
            let child = links::<T>(nodes, at).left;
            links::<T>(nodes, at).left = insert_at::<T>(nodes, child, idx);
        }
        Ordering::Greater => {
            let child = links::<T>(nodes, at).right;
            links::<T>(nodes, at).right = insert_at::<T>(nodes, child, idx);
        }
        Ordering::Equal => panic!("heap: duplicate key {k:#x?} in tree {T}"),
    }
    rebalance::<T>(nodes, at)
}

fn remove_at<const T: usize>(nodes: &mut [HeapNode], at: u32, k: Key) -> u32 {
    assert!(at != NIL, "heap: key {k:#x?} missing from tree {T}");
    match k.cmp(&key::<T>(nodes, at)) {
        Ordering::Less => {
            let child = links::<T>(nodes, at).left;
            links::<T>(nodes, at).left = remove_at::<T>(nodes, child, k);
        }
        Ordering::Greater => {
            let child = links::<T>(nodes, at).right;
            links::<T>(nodes, at).right = remove_at::<T>(nodes, child, k);
        }
        Ordering::Equal => {
            let Links { left, right, .. } = *links::<T>(nodes, at);
            if left == NIL {
                return right;
            }
            if right == NIL {
                return left;
            }
            let (rest, min) = remove_min::<T>(nodes, right);
            let l = links::<T>(nodes, min);
            l.left = left;
            l.right = rest;
            return rebalance::<T>(nodes, min);
        }
    }
    rebalance::<T>(nodes, at)
}

/// Detaches the leftmost node below `at`: `(new subtree root, detached)`.
fn remove_min<const T: usize>(nodes: &mut [HeapNode], at: u32) -> (u32, u32) {
    let Links { left, right, .. } = *links::<T>(nodes, at);
    if left == NIL {
        return (right, at);
    }
    let (rest, min) = remove_min::<T>(nodes, left);
    links::<T>(nodes, at).left = rest;
    (rebalance::<T>(nodes, at), min)
}

fn update<const T: usize>(nodes: &mut [HeapNode], at: u32) {
    let Links { left, right, .. } = *links::<T>(nodes, at);
    let h = 1 + height::<T>(nodes, left).max(height::<T>(nodes, right));
    links::<T>(nodes, at).height = h;
}

fn rotate_right<const T: usize>(nodes: &mut [HeapNode], at: u32) -> u32 {
    let pivot = links::<T>(nodes, at).left;
    links::<T>(nodes, at).left = links::<T>(nodes, pivot).right;
    links::<T>(nodes, pivot).right = at;
    update::<T>(nodes, at);
    update::<T>(nodes, pivot);
    pivot
}

fn rotate_left<const T: usize>(nodes: &mut [HeapNode], at: u32) -> u32 {
    let pivot = links::<T>(nodes, at).right;
    links::<T>(nodes, at).right = links::<T>(nodes, pivot).left;
    links::<T>(nodes, pivot).left = at;
    update::<T>(nodes, at);
    update::<T>(nodes, pivot);
    pivot
}

fn rebalance<const T: usize>(nodes: &mut [HeapNode], at: u32) -> u32 {
    update::<T>(nodes, at);
    let Links { left, right, .. } = *links::<T>(nodes, at);
    let balance = i16::from(height::<T>(nodes, left)) - i16::from(height::<T>(nodes, right));

    if balance > 1 {
        let Links { left: ll, right: lr, .. } = *links::<T>(nodes, left);
        if height::<T>(nodes, ll) < height::<T>(nodes, lr) {
            let l = rotate_left::<T>(nodes, left);
            links::<T>(nodes, at).left = l;
        }
        return rotate_right::<T>(nodes, at);
    }
    if balance < -1 {
        let Links { left: rl, right: rr, .. } = *links::<T>(nodes, right);
        if height::<T>(nodes, rr) < height::<T>(nodes, rl) {
            let r = rotate_right::<T>(nodes, right);
            links::<T>(nodes, at).right = r;
        }
        return rotate_left::<T>(nodes, at);
    }
    at
}

/// Returns `(count, height)` of the subtree at `at`.
fn check_at<const T: usize>(
    nodes: &[HeapNode],
    at: u32,
    lo: Option<Key>,
    hi: Option<Key>,
) -> (usize, u8) {
    if at == NIL {
        return (0, 0);
    }
    let k = key::<T>(nodes, at);
    assert!(lo.is_none_or(|lo| lo < k), "heap: tree {T} out of order at {k:#x?}");
    assert!(hi.is_none_or(|hi| k < hi), "heap: tree {T} out of order at {k:#x?}");

    let l = nodes[at as usize].links[T];
    let (lc, lh) = check_at::<T>(nodes, l.left, lo, Some(k));
    let (rc, rh) = check_at::<T>(nodes, l.right, Some(k), hi);
    assert!(lh.abs_diff(rh) <= 1, "heap: tree {T} unbalanced at {k:#x?}");
    let h = 1 + lh.max(rh);
    assert_eq!(l.height, h, "heap: tree {T} stale height at {k:#x?}");
    (lc + rc + 1, h)
}
