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

//! Per-document handles guarding lazily materialized tom trees.

use std::sync::atomic::AtomicUsize;

use parking_lot::Mutex;

use crate::tom::TomTree;

/// Guards one tom document.
///
/// The tree is non-`None` only while an operation holds the mutex; when
/// both pending counters read zero at the end of an operation, the tree is
/// torn down before the mutex is released, so an idle document costs no
/// memory beyond the handle itself. A racing operation that bumped its
/// counter but has not yet acquired the mutex may find the tree already
/// evicted and simply re-materializes it.
pub(crate) struct TomHandle {
    tree: Mutex<Option<TomTree>>,
    pending_readers: AtomicUsize,
    pending_writers: AtomicUsize,
}

impl TomHandle {
    pub(crate) fn new() -> Self {
        Self {
            tree: Mutex::new(None),
            pending_readers: AtomicUsize::new(0),
            pending_writers: AtomicUsize::new(0),
        }
    }

    pub(crate) fn tree(&self) -> &Mutex<Option<TomTree>> {
        &self.tree
    }

    pub(crate) fn pending_readers(&self) -> &AtomicUsize {
        &self.pending_readers
    }

    pub(crate) fn pending_writers(&self) -> &AtomicUsize {
        &self.pending_writers
    }
}
