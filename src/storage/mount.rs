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

//! Mount bindings: lock-free singly-linked lists of (tom, path, priority)
//! records registered under a mount identifier.

use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::backoff::Backoff;

/// One binding of a mount identifier to a path within a tom.
///
/// Fields never change once the node is published to a [`MountSlot`].
///
/// [`MountSlot`]: struct.MountSlot.html
pub(crate) struct MountNode {
    tom_id: String,
    path: String,
    priority: usize,
    next: AtomicPtr<MountNode>,
}

impl MountNode {
    pub(crate) fn new(tom_id: String, path: String, priority: usize) -> Self {
        Self {
            tom_id,
            path,
            priority,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn tom_id(&self) -> &str {
        &self.tom_id
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn priority(&self) -> usize {
        self.priority
    }

    pub(crate) fn next(&self) -> *mut MountNode {
        self.next.load(Ordering::Acquire)
    }
}

/// Head of a mount identifier's binding list.
///
/// New bindings are prepended by compare-and-swap under the identifier's
/// shared bucket lock; the whole list is destroyed only under the exclusive
/// bucket lock (unmount) or during storage teardown. `MountSlot` therefore
/// has no destructor of its own: a discarded emplace candidate must not
/// free the nodes it points at.
pub(crate) struct MountSlot {
    head: AtomicPtr<MountNode>,
}

impl MountSlot {
    /// Creates a slot whose list consists of the single node `first`.
    pub(crate) fn new(first: *mut MountNode) -> Self {
        Self {
            head: AtomicPtr::new(first),
        }
    }

    /// Snapshots the list head. Also the serialization point fixing the
    /// binding set of an in-flight storage operation.
    pub(crate) fn head(&self) -> *mut MountNode {
        self.head.load(Ordering::Acquire)
    }

    /// Prepends `node` to the list.
    pub(crate) fn push(&self, node: *mut MountNode) {
        let mut backoff = Backoff::new();
        let mut expected = self.head.load(Ordering::Acquire);

        loop {
            unsafe { (*node).next.store(expected, Ordering::Relaxed) };

            match self
                .head
                .compare_exchange(expected, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => {
                    expected = actual;
                    backoff.pause();
                }
            }
        }
    }

    /// Destroys every binding in the list.
    ///
    /// `&mut self` here means the caller holds the identifier's exclusive
    /// bucket lock or has whole-storage exclusivity (teardown).
    pub(crate) fn drain(&mut self) {
        let mut current = *self.head.get_mut();
        *self.head.get_mut() = ptr::null_mut();

        while !current.is_null() {
            let node = unsafe { Box::from_raw(current) };
            current = node.next.load(Ordering::Relaxed);
        }
    }
}
