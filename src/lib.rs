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

//! Concurrent in-process key-value infrastructure.
//!
//! Two coupled cores:
//!
//! * [`map::HashMap`], a concurrent hash map with fine-grained
//!   reader-writer locking per bucket, lock-free segment allocation, and
//!   on-demand rehashing. Lookups and insertions pin entries under scoped
//!   *accessors* instead of returning clones.
//! * [`storage::Storage`], a virtual tree-mount storage that overlays
//!   hierarchical XML-backed documents ("toms") under named mount
//!   identifiers, with fan-out reads, per-key priority resolution, and
//!   per-node lifetimes. Built on the hash map.
//!
//! The accessor protocol was inspired by the concurrent containers of
//! [oneTBB].
//!
//! [`map::HashMap`]: map/struct.HashMap.html
//! [`storage::Storage`]: storage/struct.Storage.html
//! [oneTBB]: https://github.com/oneapi-src/oneTBB

pub mod backoff;
pub mod map;
pub mod storage;
pub mod tom;

pub use map::HashMap;
pub use storage::{Storage, StorageError, StorageResult};
pub use tom::{create_empty_tom, remove_tom};
