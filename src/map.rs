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

//! A concurrent hash map with per-bucket reader-writer locking and
//! accessor-pinned entries.

mod bucket;


use bucket::{Bucket, Node, SegmentTable};

use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash, Hasher},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default hashing algorithm: [aHash].
///
/// [aHash]: https://docs.rs/ahash
pub type DefaultHashBuilder = ahash::RandomState;

const INITIAL_BUCKET_COUNT: usize = 8;
const MAX_LOAD_FACTOR: f32 = 1.0;

/// Concurrent hash map implemented with a lazily segmented bucket table,
/// per-bucket reader-writer locks, and on-demand rehashing.
///
/// Entries live in singly-linked per-bucket lists. Rather than returning
/// clones, lookups and insertions hand back *accessors*: scoped guards that
/// keep the entry's bucket locked (shared for a [`ReadAccessor`], exclusive
/// for a [`WriteAccessor`]) while the caller inspects or mutates the pinned
/// entry. Dropping the accessor releases the lock.
///
/// A live accessor blocks rehashing and conflicting operations on its
/// bucket, so accessors should be short-lived. In particular, an accessor
/// obtained from a map must be dropped before performing another operation
/// on the same map from the same thread; otherwise that operation can
/// deadlock against the lock the accessor still holds.
///
/// When the number of entries exceeds the number of buckets after an
/// insertion, the map is marked for rehashing and the next operation doubles
/// the bucket count after briefly acquiring every bucket's exclusive lock.
///
/// The default hashing algorithm is [aHash]. It can be replaced on a
/// per-`HashMap` basis using [`with_hasher`].
///
/// [aHash]: https://docs.rs/ahash
/// [`ReadAccessor`]: struct.ReadAccessor.html
/// [`WriteAccessor`]: struct.WriteAccessor.html
/// [`with_hasher`]: #method.with_hasher
pub struct HashMap<K, V, S = DefaultHashBuilder> {
    table: SegmentTable<K, V>,
    build_hasher: S,
    bucket_count: AtomicUsize,
    len: AtomicUsize,
    rehash_required: AtomicBool,
}

unsafe impl<K: Send, V: Send, S: Send> Send for HashMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for HashMap<K, V, S> {}

impl<K, V> HashMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `HashMap` with the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K, V, S: Default> Default for HashMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty `HashMap` that will use `build_hasher` to hash keys.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self {
            table: SegmentTable::new(),
            build_hasher,
            bucket_count: AtomicUsize::new(INITIAL_BUCKET_COUNT),
            len: AtomicUsize::new(0),
            rehash_required: AtomicBool::new(false),
        }
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count.load(Ordering::Acquire)
    }

    /// Visits every entry in the map exactly once.
    ///
    /// Takes `&mut self`: this scan acquires no locks and must not run
    /// concurrently with any other operation.
    pub fn for_each<F: FnMut(&K, &mut V)>(&mut self, mut f: F) {
        self.table.for_each_bucket(|bucket| {
            let mut current = bucket.head();

            while !current.is_null() {
                let node = unsafe { &*current };
                f(node.key(), unsafe { node.mapped_mut() });
                current = node.next();
            }
        });
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> HashMap<K, V, S> {
    /// Inserts a new entry if no entry with an equal key exists.
    ///
    /// Returns `true` if the entry was inserted. An existing entry is never
    /// overwritten. The internal accessor is released before returning.
    pub fn emplace(&self, key: K, value: V) -> bool {
        let (inserted, _guard, _node): (_, RwLockReadGuard<'_, ()>, _) =
            self.internal_emplace(key, value);

        inserted
    }

    /// Inserts a new entry if no entry with an equal key exists, pinning the
    /// resulting entry under a shared lock.
    ///
    /// Returns `true` and an accessor to the new entry on insertion, or
    /// `false` and an accessor to the pre-existing entry with an equal key.
    pub fn emplace_read(&self, key: K, value: V) -> (bool, ReadAccessor<'_, K, V>) {
        let (inserted, guard, node) = self.internal_emplace(key, value);

        (inserted, ReadAccessor { _guard: guard, node })
    }

    /// Like [`emplace_read`], but pins the entry under an exclusive lock.
    ///
    /// [`emplace_read`]: #method.emplace_read
    pub fn emplace_write(&self, key: K, value: V) -> (bool, WriteAccessor<'_, K, V>) {
        let (inserted, guard, node) = self.internal_emplace(key, value);

        (inserted, WriteAccessor { _guard: guard, node })
    }

    /// Looks up the entry with a key equal to `key` and pins it under a
    /// shared lock.
    pub fn find_read<Q>(&self, key: &Q) -> Option<ReadAccessor<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (guard, node) = self.internal_find(key)?;

        Some(ReadAccessor { _guard: guard, node })
    }

    /// Looks up the entry with a key equal to `key` and pins it under an
    /// exclusive lock.
    pub fn find_write<Q>(&self, key: &Q) -> Option<WriteAccessor<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (guard, node) = self.internal_find(key)?;

        Some(WriteAccessor { _guard: guard, node })
    }

    /// Removes the entry with a key equal to `key`, if any.
    ///
    /// Returns `true` if an entry was removed.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rehash_if_necessary();

        let hashcode = self.hash(key);
        let (guard, bucket, _) = self.lock_bucket::<RwLockWriteGuard<'_, ()>>(hashcode);

        let erased = self.unlink(bucket, |_, k| k.borrow() == key);
        drop(guard);

        erased
    }

    /// Removes the entry pinned by `accessor`.
    ///
    /// The accessor must originate from this map. Its exclusive lock already
    /// protects the entry's bucket, so no rehashing check is performed; the
    /// lock is released once the entry has been destroyed.
    pub fn erase_entry(&self, accessor: WriteAccessor<'_, K, V>) {
        let node_ptr = accessor.node.as_ptr();
        let hashcode = self.hash(unsafe { accessor.node.as_ref() }.key());

        let bucket_count = self.bucket_count.load(Ordering::Acquire);
        let bucket = self.table.bucket(hashcode % bucket_count);

        let unlinked = self.unlink(bucket, |ptr, _| ptr == node_ptr);
        debug_assert!(unlinked);

        drop(accessor);
    }

    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> usize {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);

        hasher.finish() as usize
    }

    /// Acquires a lock of type `G` on the bucket `hashcode` maps to,
    /// re-acquiring whenever a rehash moved the key to a different bucket
    /// between index computation and lock acquisition.
    fn lock_bucket<'m, G: BucketGuard<'m>>(
        &'m self,
        hashcode: usize,
    ) -> (G, &'m Bucket<K, V>, usize) {
        let mut bucket_count = self.bucket_count.load(Ordering::Acquire);

        loop {
            let prev_bucket_count = bucket_count;
            let index = hashcode % bucket_count;
            let bucket = self.table.bucket(index);
            let guard = G::acquire(bucket.lock());

            bucket_count = self.bucket_count.load(Ordering::Acquire);

            if bucket_count == prev_bucket_count || hashcode % bucket_count == index {
                // either no rehashing happened while acquiring the lock, or
                // it did and this key still maps to the same bucket
                return (guard, bucket, bucket_count);
            }

            drop(guard);
        }
    }

    fn internal_emplace<'m, G: BucketGuard<'m>>(
        &'m self,
        key: K,
        value: V,
    ) -> (bool, G, NonNull<Node<K, V>>) {
        self.rehash_if_necessary();

        let hashcode = self.hash(&key);
        let new_node = Box::into_raw(Box::new(Node::new(key, value)));
        let candidate = unsafe { &*new_node };

        let (guard, bucket, bucket_count) = self.lock_bucket::<G>(hashcode);

        // lock scope
        let (mut found, mut head) = bucket.search(|k| k == candidate.key(), ptr::null_mut());

        while found.is_none() && !bucket.try_insert(head, new_node) {
            // the head moved under a racing insert; re-scan the new prefix
            // in case the racer inserted an equal key
            let (racing, new_head) = bucket.search(|k| k == candidate.key(), head);
            found = racing;
            head = new_head;
        }

        if let Some(existing) = found {
            unsafe { drop(Box::from_raw(new_node)) };

            return (false, guard, existing);
        }

        let len = self.len.fetch_add(1, Ordering::Relaxed) + 1;

        if len as f32 / bucket_count as f32 > MAX_LOAD_FACTOR {
            self.rehash_required.store(true, Ordering::Release);
        }

        (true, guard, unsafe { NonNull::new_unchecked(new_node) })
    }

    fn internal_find<'m, G: BucketGuard<'m>, Q>(
        &'m self,
        key: &Q,
    ) -> Option<(G, NonNull<Node<K, V>>)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rehash_if_necessary();

        let hashcode = self.hash(key);
        let (guard, bucket, _) = self.lock_bucket::<G>(hashcode);

        let (found, _) = bucket.search(|k| k.borrow() == key, ptr::null_mut());

        found.map(|node| (guard, node))
    }

    /// Unlinks and destroys the first node matching `pred`. The caller must
    /// hold the bucket's exclusive lock.
    fn unlink<F: FnMut(*mut Node<K, V>, &K) -> bool>(
        &self,
        bucket: &Bucket<K, V>,
        mut pred: F,
    ) -> bool {
        let mut prev: *mut Node<K, V> = ptr::null_mut();
        let mut current = bucket.head();

        while !current.is_null() {
            let node = unsafe { &*current };

            if pred(current, node.key()) {
                break;
            }

            prev = current;
            current = node.next();
        }

        if current.is_null() {
            return false;
        }

        let next = unsafe { (*current).next() };

        if prev.is_null() {
            bucket.store_head(next);
        } else {
            unsafe { (*prev).set_next(next) };
        }

        self.len.fetch_sub(1, Ordering::Relaxed);
        unsafe { drop(Box::from_raw(current)) };

        true
    }

    /// Doubles the bucket count if an insertion pushed the load factor past
    /// its threshold.
    ///
    /// Acquires every bucket's exclusive lock in index order, then re-checks
    /// the flag and the bucket count: a concurrent operation that was inside
    /// a bucket lock has either already rehashed or will observe the flag on
    /// its next operation.
    fn rehash_if_necessary(&self) {
        let bucket_count = self.bucket_count.load(Ordering::Acquire);

        if !self.rehash_required.load(Ordering::Acquire) {
            return;
        }

        let mut guards = Vec::with_capacity(bucket_count);

        for index in 0..bucket_count {
            guards.push(self.table.bucket(index).lock().write());
        }

        // every bucket is locked for writing
        if self.rehash_required.load(Ordering::Acquire)
            && self.bucket_count.load(Ordering::Acquire) == bucket_count
        {
            self.rehash(bucket_count);
            self.rehash_required.store(false, Ordering::Release);
        }
    }

    fn rehash(&self, current_bucket_count: usize) {
        let new_bucket_count = current_bucket_count * 2;
        let mut lists = Vec::with_capacity(current_bucket_count);

        for index in 0..current_bucket_count {
            let bucket = self.table.bucket(index);
            lists.push(bucket.head());
            bucket.store_head(ptr::null_mut());
        }

        for head in lists {
            let mut current = head;

            while !current.is_null() {
                let node = unsafe { &*current };
                let next = node.next();

                let index = self.hash(node.key()) % new_bucket_count;
                let target = self.table.bucket(index);
                let inserted = target.try_insert(target.head(), current);
                debug_assert!(inserted);

                current = next;
            }
        }

        self.bucket_count.store(new_bucket_count, Ordering::Release);
    }
}

/// Shared- or exclusive-mode bucket lock acquisition, selected by the
/// accessor kind an operation was asked to produce.
trait BucketGuard<'m>: Sized {
    fn acquire(lock: &'m RwLock<()>) -> Self;
}

impl<'m> BucketGuard<'m> for RwLockReadGuard<'m, ()> {
    fn acquire(lock: &'m RwLock<()>) -> Self {
        lock.read()
    }
}

impl<'m> BucketGuard<'m> for RwLockWriteGuard<'m, ()> {
    fn acquire(lock: &'m RwLock<()>) -> Self {
        lock.write()
    }
}

/// Scoped handle to an entry pinned under its bucket's shared lock.
///
/// While the accessor is live, the entry cannot be erased and the map cannot
/// rehash. Dropping the accessor releases the lock.
pub struct ReadAccessor<'m, K, V> {
    _guard: RwLockReadGuard<'m, ()>,
    node: NonNull<Node<K, V>>,
}

impl<K, V> ReadAccessor<'_, K, V> {
    /// Returns the pinned entry's key.
    pub fn key(&self) -> &K {
        unsafe { self.node.as_ref() }.key()
    }

    /// Returns the pinned entry's mapped value.
    pub fn mapped(&self) -> &V {
        let node = unsafe { self.node.as_ref() };

        unsafe { node.mapped() }
    }

    /// Returns the pinned entry as a key-value pair.
    pub fn value(&self) -> (&K, &V) {
        let node = unsafe { self.node.as_ref() };

        (node.key(), unsafe { node.mapped() })
    }

    /// Returns a mutable reference to the mapped value despite only the
    /// shared lock being held.
    ///
    /// # Safety
    ///
    /// Writing through the returned reference races with every other reader
    /// and writer of this entry unless the caller supplies its own
    /// synchronization.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn hazardous_mapped(&self) -> &mut V {
        self.node.as_ref().mapped_mut()
    }

    /// Returns the pinned entry with a mutable mapped value despite only
    /// the shared lock being held.
    ///
    /// # Safety
    ///
    /// Same contract as [`hazardous_mapped`].
    ///
    /// [`hazardous_mapped`]: #method.hazardous_mapped
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn hazardous_value(&self) -> (&K, &mut V) {
        let node = self.node.as_ref();

        (node.key(), node.mapped_mut())
    }
}

/// Scoped handle to an entry pinned under its bucket's exclusive lock.
///
/// Grants mutable access to the mapped value; the key stays immutable.
/// Dropping the accessor releases the lock.
pub struct WriteAccessor<'m, K, V> {
    _guard: RwLockWriteGuard<'m, ()>,
    node: NonNull<Node<K, V>>,
}

impl<K, V> WriteAccessor<'_, K, V> {
    /// Returns the pinned entry's key.
    pub fn key(&self) -> &K {
        unsafe { self.node.as_ref() }.key()
    }

    /// Returns the pinned entry's mapped value.
    pub fn mapped(&self) -> &V {
        let node = unsafe { self.node.as_ref() };

        unsafe { node.mapped() }
    }

    /// Returns the pinned entry's mapped value for mutation.
    pub fn mapped_mut(&mut self) -> &mut V {
        let node = unsafe { self.node.as_ref() };

        unsafe { node.mapped_mut() }
    }

    /// Returns the pinned entry as a key and a mutable mapped value.
    pub fn value_mut(&mut self) -> (&K, &mut V) {
        let node = unsafe { self.node.as_ref() };

        (node.key(), unsafe { node.mapped_mut() })
    }
}
