// MIT License
//
// Copyright (c) 2020 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Node lists, buckets, and the segmented bucket table.

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use parking_lot::RwLock;

/// A single entry in a bucket's singly-linked list.
///
/// The key is immutable for the lifetime of the node. The mapped value is
/// read under the owning bucket's shared lock and written under its
/// exclusive lock; the `UnsafeCell` accessors encode that contract.
pub(crate) struct Node<K, V> {
    next: AtomicPtr<Node<K, V>>,
    key: K,
    mapped: UnsafeCell<V>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(key: K, mapped: V) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            key,
            mapped: UnsafeCell::new(mapped),
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// # Safety
    ///
    /// The caller must hold at least the owning bucket's shared lock, or
    /// otherwise guarantee no concurrent writer.
    pub(crate) unsafe fn mapped(&self) -> &V {
        &*self.mapped.get()
    }

    /// # Safety
    ///
    /// The caller must hold the owning bucket's exclusive lock, or otherwise
    /// guarantee exclusive access, and must not create a second live
    /// reference to the mapped value.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn mapped_mut(&self) -> &mut V {
        &mut *self.mapped.get()
    }

    pub(crate) fn next(&self) -> *mut Node<K, V> {
        self.next.load(Ordering::Acquire)
    }

    /// Only called before the node is published or under the owning
    /// bucket's exclusive lock.
    pub(crate) fn set_next(&self, next: *mut Node<K, V>) {
        self.next.store(next, Ordering::Relaxed);
    }
}

/// A bucket: one reader-writer lock guarding a singly-linked node list.
///
/// The head pointer is atomic so that insertions can publish a new node by
/// compare-and-swap while only the shared lock is held; unlinking always
/// happens under the exclusive lock.
pub(crate) struct Bucket<K, V> {
    lock: RwLock<()>,
    head: AtomicPtr<Node<K, V>>,
}

impl<K, V> Default for Bucket<K, V> {
    fn default() -> Self {
        Self {
            lock: RwLock::new(()),
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<K, V> Bucket<K, V> {
    pub(crate) fn lock(&self) -> &RwLock<()> {
        &self.lock
    }

    pub(crate) fn head(&self) -> *mut Node<K, V> {
        self.head.load(Ordering::Acquire)
    }

    /// Only called under the exclusive lock or during rehashing, when every
    /// bucket's exclusive lock is held.
    pub(crate) fn store_head(&self, head: *mut Node<K, V>) {
        self.head.store(head, Ordering::Release);
    }

    /// Publishes `new_node` at the head of the list if the head is still
    /// `expected`, the head observed by the caller's most recent search.
    pub(crate) fn try_insert(&self, expected: *mut Node<K, V>, new_node: *mut Node<K, V>) -> bool {
        unsafe { (*new_node).set_next(expected) };

        self.head
            .compare_exchange(expected, new_node, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Walks the list from the head until `stop` looking for a key matching
    /// `pred`. Returns the matching node, if any, and the head the walk
    /// started from, for use as the next stop point.
    pub(crate) fn search<F: FnMut(&K) -> bool>(
        &self,
        mut pred: F,
        stop: *mut Node<K, V>,
    ) -> (Option<NonNull<Node<K, V>>>, *mut Node<K, V>) {
        let head = self.head();
        let mut current = head;

        while current != stop {
            let node = unsafe { &*current };

            if pred(node.key()) {
                return (NonNull::new(current), head);
            }

            current = node.next();
        }

        (None, head)
    }
}

pub(crate) const SEGMENT_COUNT: usize = usize::BITS as usize;

pub(crate) fn segment_index(bucket_index: usize) -> usize {
    let index = bucket_index | 1;

    (usize::BITS - 1 - index.leading_zeros()) as usize
}

pub(crate) fn segment_base(segment_index: usize) -> usize {
    (1_usize << segment_index) & !1
}

pub(crate) fn segment_len(segment_index: usize) -> usize {
    if segment_index == 0 {
        2
    } else {
        1 << segment_index
    }
}

/// Lazily allocated table of bucket segments.
///
/// Segment 0 holds buckets 0 and 1; segment `s >= 1` holds the `2^s`
/// buckets starting at global index `2^s`. Once a segment is published its
/// shape never changes (only the bucket lists within it do), so later
/// lookups may read the segment pointer relaxed.
pub(crate) struct SegmentTable<K, V> {
    segments: [AtomicPtr<Bucket<K, V>>; SEGMENT_COUNT],
    marker: PhantomData<*mut Node<K, V>>,
}

impl<K, V> SegmentTable<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            marker: PhantomData,
        }
    }

    /// Returns the bucket at `bucket_index`, allocating its segment if this
    /// is the first touch.
    pub(crate) fn bucket(&self, bucket_index: usize) -> &Bucket<K, V> {
        let segment = segment_index(bucket_index);
        let base = self.segment_or_allocate(segment);

        unsafe { &*base.add(bucket_index - segment_base(segment)) }
    }

    fn segment_or_allocate(&self, segment: usize) -> *mut Bucket<K, V> {
        let slot = &self.segments[segment];
        // publication is serialized by the bucket locks taken afterwards
        let current = slot.load(Ordering::Relaxed);

        if !current.is_null() {
            return current;
        }

        let buckets: Box<[Bucket<K, V>]> =
            (0..segment_len(segment)).map(|_| Bucket::default()).collect();
        let fresh = Box::into_raw(buckets) as *mut Bucket<K, V>;

        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => fresh,
            Err(winner) => {
                // another thread published this segment first
                unsafe {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                        fresh,
                        segment_len(segment),
                    )));
                }

                winner
            }
        }
    }

    pub(crate) fn for_each_bucket<F: FnMut(&Bucket<K, V>)>(&self, mut f: F) {
        for (segment, slot) in self.segments.iter().enumerate() {
            let base = slot.load(Ordering::Relaxed);

            if base.is_null() {
                continue;
            }

            let buckets = unsafe { std::slice::from_raw_parts(base, segment_len(segment)) };

            for bucket in buckets {
                f(bucket);
            }
        }
    }
}

impl<K, V> Drop for SegmentTable<K, V> {
    fn drop(&mut self) {
        for (segment, slot) in self.segments.iter_mut().enumerate() {
            let base = *slot.get_mut();

            if base.is_null() {
                continue;
            }

            let len = segment_len(segment);
            let buckets = unsafe { std::slice::from_raw_parts(base, len) };

            for bucket in buckets {
                let mut current = bucket.head.load(Ordering::Relaxed);

                while !current.is_null() {
                    let node = unsafe { Box::from_raw(current) };
                    current = node.next.load(Ordering::Relaxed);
                }
            }

            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(base, len))) };
        }
    }
}
