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

//! Virtual tree-mount storage over tom documents.
//!
//! A [`Storage`] overlays one or more XML-backed toms under named mount
//! identifiers. A single identifier may bind several (tom, path) pairs at
//! different priorities: reads fan out across every binding and resolve
//! conflicts per key by priority, while modifications apply to every
//! binding holding the target node. Per-node `date_created`/`lifetime`
//! metadata makes entries appear outdated without being physically removed.
//!
//! Tom trees are materialized lazily: the first operation to touch a
//! document parses it, and the last operation to leave it quiescent tears
//! the tree back down, so an idle storage holds no parsed documents.
//!
//! [`Storage`]: struct.Storage.html

mod handle;
mod mount;


use handle::TomHandle;
use mount::{MountNode, MountSlot};

use std::{
    collections::{hash_map::Entry, HashMap as StdHashMap},
    fmt::Display,
    hash::{BuildHasher, Hash},
    iter,
    marker::PhantomData,
    str::FromStr,
    sync::atomic::Ordering,
    time::Duration,
};

use log::{debug, trace};
use thiserror::Error;
use xmltree::Element;

use crate::{
    map::{DefaultHashBuilder, HashMap, ReadAccessor},
    tom::{
        child_value, erase_child, is_outdated, now_since_epoch, set_child_value, TomTree,
        DATE_CREATED, KEY, LIFETIME, MAPPED,
    },
};

/// Errors surfaced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No prefix of the supplied path names a mounted identifier.
    #[error("no mount matches any prefix of path {path:?}")]
    UnmountedPath { path: String },

    /// Reading or writing a tom file failed.
    #[error("tom file I/O failed")]
    Io(#[from] std::io::Error),

    /// A tom file does not contain a well-formed XML document.
    #[error("tom document is not well-formed XML")]
    Parse(#[from] xmltree::ParseError),

    /// A tom document could not be serialized.
    #[error("tom document could not be serialized")]
    Write(#[from] xmltree::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Concurrent tree-mount storage of key-mapped pairs held in tom documents.
///
/// `K` and `M` are the user's key and mapped types; both travel through the
/// documents as text, so they must implement [`FromStr`] and [`Display`].
/// Unparseable or missing fields read as "no node here".
///
/// All operations take `&self` and may be called from any number of
/// threads. Operations on the same document serialize through its exclusive
/// lock; operations on the same mount identifier snapshot the binding list
/// once, so a concurrent `mount` or `unmount` never changes the set of
/// bindings an in-flight operation visits.
///
/// [`FromStr`]: https://doc.rust-lang.org/std/str/trait.FromStr.html
/// [`Display`]: https://doc.rust-lang.org/std/fmt/trait.Display.html
pub struct Storage<K, M, S = DefaultHashBuilder> {
    mounts: HashMap<String, MountSlot, S>,
    toms: HashMap<String, TomHandle, S>,
    marker: PhantomData<fn() -> (K, M)>,
}

impl<K, M> Storage<K, M, DefaultHashBuilder> {
    /// Creates a storage with no mounts.
    pub fn new() -> Self {
        Self {
            mounts: HashMap::new(),
            toms: HashMap::new(),
            marker: PhantomData,
        }
    }
}

impl<K, M> Default for Storage<K, M, DefaultHashBuilder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, M, S: BuildHasher> Storage<K, M, S> {
    /// Binds `(tom_id, path)` under `mount_id` at the default (lowest)
    /// priority.
    pub fn mount(&self, mount_id: &str, tom_id: &str, path: &str) {
        self.mount_with_priority(mount_id, tom_id, path, 0)
    }

    /// Binds `(tom_id, path)` under `mount_id`.
    ///
    /// A mount identifier may be bound any number of times, including to
    /// the same tom and path; higher priorities win during reads. The tom
    /// file itself is not touched until the first operation through this
    /// mount.
    pub fn mount_with_priority(&self, mount_id: &str, tom_id: &str, path: &str, priority: usize) {
        debug!(
            "mount {:?} -> {:?} at {:?}, priority {}",
            mount_id, tom_id, path, priority
        );

        // the document handle outlives its mounts; it is reclaimed only at
        // storage teardown since other mounts may reference the same tom
        self.toms.emplace(tom_id.to_owned(), TomHandle::new());

        let node = Box::into_raw(Box::new(MountNode::new(
            tom_id.to_owned(),
            path.to_owned(),
            priority,
        )));

        let (inserted, accessor) = self
            .mounts
            .emplace_read(mount_id.to_owned(), MountSlot::new(node));

        if !inserted {
            // already mounted; the discarded candidate slot does not own
            // the node, so prepend it to the published list
            accessor.mapped().push(node);
        }
    }

    /// Removes every binding under `mount_id`.
    ///
    /// Returns `true` if the identifier was mounted.
    pub fn unmount(&self, mount_id: &str) -> bool {
        match self.mounts.find_write(mount_id) {
            Some(mut accessor) => {
                debug!("unmount {:?}", mount_id);
                accessor.mapped_mut().drain();
                self.mounts.erase_entry(accessor);

                true
            }
            None => false,
        }
    }

    /// Returns the `(tom_id, path)` bindings under `mount_id`, most
    /// recently mounted first. An unmounted identifier yields no bindings.
    pub fn get_mounts(&self, mount_id: &str) -> Vec<(String, String)> {
        let mut mounts = Vec::new();

        if let Some(accessor) = self.mounts.find_read(mount_id) {
            let mut current = accessor.mapped().head();

            while !current.is_null() {
                let binding = unsafe { &*current };
                mounts.push((binding.tom_id().to_owned(), binding.path().to_owned()));
                current = binding.next();
            }
        }

        mounts
    }

    /// Splits `path` into the shortest mounted prefix and the remainder,
    /// returning the mount pinned under its shared lock.
    ///
    /// Mount identifiers may themselves contain `/`; the candidate prefix
    /// grows to each separator in turn and the first hit wins. The
    /// remainder is empty when the path names the mount itself.
    fn resolve(&self, path: &str) -> StorageResult<(ReadAccessor<'_, String, MountSlot>, String)> {
        let mut consumed = 0;

        loop {
            let candidate_end = match path[consumed..].find('/') {
                Some(offset) => consumed + offset,
                None => path.len(),
            };

            if let Some(accessor) = self.mounts.find_read(&path[..candidate_end]) {
                let remainder = if candidate_end == path.len() {
                    String::new()
                } else {
                    path[candidate_end + 1..].to_owned()
                };

                return Ok((accessor, remainder));
            }

            if candidate_end == path.len() {
                return Err(StorageError::UnmountedPath {
                    path: path.to_owned(),
                });
            }

            consumed = candidate_end + 1;
        }
    }

    /// Runs `body` once per binding of the resolved mount, enforcing the
    /// per-document lifecycle.
    ///
    /// The binding set is fixed by the head snapshot taken here; the mount
    /// accessor stays live across the walk so no binding can be destroyed
    /// underneath it. For each binding: bump the matching pending counter,
    /// take the document's exclusive lock, drop the counter, materialize
    /// the tree if absent, run the body against the absolute node path,
    /// serialize back if this is a write with no other writer pending, and
    /// tear the tree down if the document is quiescent.
    fn with_bindings<F>(&self, path: &str, access: Access, mut body: F) -> StorageResult<()>
    where
        F: FnMut(&mut TomTree, &str, usize),
    {
        let (mount_accessor, remainder) = self.resolve(path)?;

        let mut current = mount_accessor.mapped().head();

        while !current.is_null() {
            let binding = unsafe { &*current };
            current = binding.next();

            let handle_accessor = match self.toms.find_read(binding.tom_id()) {
                Some(accessor) => accessor,
                None => {
                    debug_assert!(false, "mounted tom has no document handle");
                    continue;
                }
            };
            let handle = handle_accessor.mapped();

            let pending = match access {
                Access::Read => handle.pending_readers(),
                Access::Write => handle.pending_writers(),
            };

            pending.fetch_add(1, Ordering::Relaxed);
            let mut tree_guard = handle.tree().lock();
            pending.fetch_sub(1, Ordering::Relaxed);

            if tree_guard.is_none() {
                trace!("materialize {:?}", binding.tom_id());
                *tree_guard = Some(TomTree::load(binding.tom_id())?);
            }

            if let Some(tree) = tree_guard.as_mut() {
                let node_path = join_node_path(binding.path(), &remainder);
                body(tree, &node_path, binding.priority());

                if access == Access::Write && handle.pending_writers().load(Ordering::Relaxed) == 0
                {
                    trace!("serialize {:?}", binding.tom_id());
                    tree.save(binding.tom_id())?;
                }
            }

            if handle.pending_readers().load(Ordering::Relaxed) == 0
                && handle.pending_writers().load(Ordering::Relaxed) == 0
            {
                // quiescent; reclaim the parsed tree
                trace!("evict {:?}", binding.tom_id());
                *tree_guard = None;
            }
        }

        Ok(())
    }
}

impl<K, M, S> Storage<K, M, S>
where
    K: Clone + Display + Eq + FromStr + Hash,
    M: Clone + Display + FromStr,
    S: BuildHasher,
{
    /// Returns every key at `path` that survives priority resolution.
    ///
    /// Duplicates are kept when several bindings at the winning priority
    /// hold the node. Outdated nodes contribute nothing.
    pub fn key(&self, path: &str) -> StorageResult<Vec<K>> {
        let mut resolved = StdHashMap::new();

        self.with_bindings(path, Access::Read, |tree, node_path, priority| {
            if let Some(node) = live_node(tree.node(node_path)) {
                if let Some(key) = child_value::<K>(node, KEY) {
                    accumulate(&mut resolved, key, None::<M>, priority);
                }
            }
        })?;

        Ok(resolved
            .into_iter()
            .flat_map(|(key, entry)| iter::repeat(key).take(entry.contributions.len()))
            .collect())
    }

    /// Returns every mapped value at `path` that survives priority
    /// resolution.
    pub fn mapped(&self, path: &str) -> StorageResult<Vec<M>> {
        let mut resolved = StdHashMap::new();

        self.with_bindings(path, Access::Read, |tree, node_path, priority| {
            if let Some(node) = live_node(tree.node(node_path)) {
                if let (Some(key), Some(mapped)) =
                    (child_value::<K>(node, KEY), child_value::<M>(node, MAPPED))
                {
                    accumulate(&mut resolved, key, Some(mapped), priority);
                }
            }
        })?;

        Ok(resolved
            .into_values()
            .flat_map(|entry| entry.contributions.into_iter().flatten())
            .collect())
    }

    /// Returns every key-mapped pair at `path` that survives priority
    /// resolution.
    pub fn value(&self, path: &str) -> StorageResult<Vec<(K, M)>> {
        let mut resolved = StdHashMap::new();

        self.with_bindings(path, Access::Read, |tree, node_path, priority| {
            if let Some(node) = live_node(tree.node(node_path)) {
                if let (Some(key), Some(mapped)) =
                    (child_value::<K>(node, KEY), child_value::<M>(node, MAPPED))
                {
                    accumulate(&mut resolved, key, Some(mapped), priority);
                }
            }
        })?;

        Ok(resolved
            .into_iter()
            .flat_map(|(key, entry)| {
                entry
                    .contributions
                    .into_iter()
                    .flatten()
                    .map(move |mapped| (key.clone(), mapped))
            })
            .collect())
    }

    /// Sets the key of the node at `path` in every binding where the node
    /// exists and is not outdated. Returns the number of modified bindings.
    pub fn set_key(&self, path: &str, key: K) -> StorageResult<usize> {
        self.modify_key_with(path, false, move |_| key.clone())
    }

    /// [`set_key`], but outdated nodes are modified too and their
    /// `date_created` is reset to now.
    ///
    /// [`set_key`]: #method.set_key
    pub fn set_key_as_new(&self, path: &str, key: K) -> StorageResult<usize> {
        self.modify_key_with(path, true, move |_| key.clone())
    }

    /// Sets the mapped value of the node at `path` in every binding where
    /// the node exists and is not outdated. Returns the number of modified
    /// bindings.
    pub fn set_mapped(&self, path: &str, mapped: M) -> StorageResult<usize> {
        self.modify_mapped_with(path, false, move |_| mapped.clone())
    }

    /// [`set_mapped`], but outdated nodes are modified too and their
    /// `date_created` is reset to now.
    ///
    /// [`set_mapped`]: #method.set_mapped
    pub fn set_mapped_as_new(&self, path: &str, mapped: M) -> StorageResult<usize> {
        self.modify_mapped_with(path, true, move |_| mapped.clone())
    }

    /// Sets both fields of the node at `path` in every binding where the
    /// node exists and is not outdated. Returns the number of modified
    /// bindings.
    pub fn set_value(&self, path: &str, value: (K, M)) -> StorageResult<usize> {
        self.modify_value_with(path, false, move |_| value.clone())
    }

    /// [`set_value`], but outdated nodes are modified too and their
    /// `date_created` is reset to now.
    ///
    /// [`set_value`]: #method.set_value
    pub fn set_value_as_new(&self, path: &str, value: (K, M)) -> StorageResult<usize> {
        self.modify_value_with(path, true, move |_| value.clone())
    }

    /// Applies `f` to the key of the node at `path` in every binding where
    /// the node exists and is not outdated. Returns the number of modified
    /// bindings.
    pub fn modify_key<F: FnMut(K) -> K>(&self, path: &str, f: F) -> StorageResult<usize> {
        self.modify_key_with(path, false, f)
    }

    /// [`modify_key`], but outdated nodes are modified too and their
    /// `date_created` is reset to now.
    ///
    /// [`modify_key`]: #method.modify_key
    pub fn modify_key_as_new<F: FnMut(K) -> K>(&self, path: &str, f: F) -> StorageResult<usize> {
        self.modify_key_with(path, true, f)
    }

    /// Applies `f` to the mapped value of the node at `path` in every
    /// binding where the node exists and is not outdated. Returns the
    /// number of modified bindings.
    pub fn modify_mapped<F: FnMut(M) -> M>(&self, path: &str, f: F) -> StorageResult<usize> {
        self.modify_mapped_with(path, false, f)
    }

    /// [`modify_mapped`], but outdated nodes are modified too and their
    /// `date_created` is reset to now.
    ///
    /// [`modify_mapped`]: #method.modify_mapped
    pub fn modify_mapped_as_new<F: FnMut(M) -> M>(&self, path: &str, f: F) -> StorageResult<usize> {
        self.modify_mapped_with(path, true, f)
    }

    /// Applies `f` to both fields of the node at `path` in every binding
    /// where the node exists and is not outdated. Returns the number of
    /// modified bindings.
    pub fn modify_value<F>(&self, path: &str, f: F) -> StorageResult<usize>
    where
        F: FnMut((K, M)) -> (K, M),
    {
        self.modify_value_with(path, false, f)
    }

    /// [`modify_value`], but outdated nodes are modified too and their
    /// `date_created` is reset to now.
    ///
    /// [`modify_value`]: #method.modify_value
    pub fn modify_value_as_new<F>(&self, path: &str, f: F) -> StorageResult<usize>
    where
        F: FnMut((K, M)) -> (K, M),
    {
        self.modify_value_with(path, true, f)
    }

    /// Writes `value` into the node at `path` in every binding where the
    /// node is absent or outdated.
    ///
    /// The node and its missing ancestors are created as needed; any stale
    /// `lifetime` child is erased so the new entry never expires. Returns
    /// `true` if at least one binding accepted the insertion.
    pub fn insert(&self, path: &str, value: (K, M)) -> StorageResult<bool> {
        self.insert_impl(path, value, None)
    }

    /// Like [`insert`], but the new entry expires `lifetime` from now:
    /// `date_created` is set to the current time and `lifetime` to the
    /// given duration in whole seconds.
    ///
    /// [`insert`]: #method.insert
    pub fn insert_with_lifetime(
        &self,
        path: &str,
        value: (K, M),
        lifetime: Duration,
    ) -> StorageResult<bool> {
        self.insert_impl(path, value, Some(lifetime))
    }

    /// Detaches the node at `path` from its parent in every binding where
    /// the node exists and is not outdated.
    ///
    /// Returns `true` if at least one binding removed the node. An outdated
    /// node is left in place and reads as absent.
    pub fn remove(&self, path: &str) -> StorageResult<bool> {
        let mut removed = false;

        self.with_bindings(path, Access::Write, |tree, node_path, _| {
            match tree.node(node_path) {
                Some(node) if !is_outdated(node, now_since_epoch()) => {}
                _ => return,
            }

            if tree.remove_node(node_path) {
                removed = true;
            }
        })?;

        Ok(removed)
    }

    fn modify_key_with<F: FnMut(K) -> K>(
        &self,
        path: &str,
        as_new: bool,
        mut f: F,
    ) -> StorageResult<usize> {
        self.modify_nodes(path, as_new, |node| match child_value::<K>(node, KEY) {
            Some(key) => {
                set_child_value(node, KEY, &f(key));
                true
            }
            None => false,
        })
    }

    fn modify_mapped_with<F: FnMut(M) -> M>(
        &self,
        path: &str,
        as_new: bool,
        mut f: F,
    ) -> StorageResult<usize> {
        self.modify_nodes(path, as_new, |node| match child_value::<M>(node, MAPPED) {
            Some(mapped) => {
                set_child_value(node, MAPPED, &f(mapped));
                true
            }
            None => false,
        })
    }

    fn modify_value_with<F>(&self, path: &str, as_new: bool, mut f: F) -> StorageResult<usize>
    where
        F: FnMut((K, M)) -> (K, M),
    {
        self.modify_nodes(path, as_new, |node| {
            match (child_value::<K>(node, KEY), child_value::<M>(node, MAPPED)) {
                (Some(key), Some(mapped)) => {
                    let (key, mapped) = f((key, mapped));
                    set_child_value(node, KEY, &key);
                    set_child_value(node, MAPPED, &mapped);

                    true
                }
                _ => false,
            }
        })
    }

    /// Shared body of the setter and modifier families: locate the node,
    /// apply the outdated gate unless `as_new`, run the mutation, and stamp
    /// `date_created` on as-new modifications.
    fn modify_nodes<F>(&self, path: &str, as_new: bool, mut mutate: F) -> StorageResult<usize>
    where
        F: FnMut(&mut Element) -> bool,
    {
        let mut modified = 0;

        self.with_bindings(path, Access::Write, |tree, node_path, _| {
            let now = now_since_epoch();

            let node = match tree.node_mut(node_path) {
                Some(node) => node,
                None => return,
            };

            if !as_new && is_outdated(node, now) {
                return;
            }

            if mutate(node) {
                if as_new {
                    set_child_value(node, DATE_CREATED, &now.as_secs());
                }

                modified += 1;
            }
        })?;

        Ok(modified)
    }

    fn insert_impl(
        &self,
        path: &str,
        value: (K, M),
        lifetime: Option<Duration>,
    ) -> StorageResult<bool> {
        let mut inserted = false;

        self.with_bindings(path, Access::Write, |tree, node_path, _| {
            let now = now_since_epoch();

            if let Some(node) = tree.node(node_path) {
                let occupied = child_value::<K>(node, KEY).is_some();

                if occupied && !is_outdated(node, now) {
                    return;
                }
            }

            let node = tree.ensure_node(node_path);
            set_child_value(node, KEY, &value.0);
            set_child_value(node, MAPPED, &value.1);

            match lifetime {
                Some(lifetime) => {
                    set_child_value(node, DATE_CREATED, &now.as_secs());
                    set_child_value(node, LIFETIME, &lifetime.as_secs());
                }
                None => {
                    erase_child(node, LIFETIME);
                }
            }

            inserted = true;
        })?;

        Ok(inserted)
    }
}

impl<K, M, S> Drop for Storage<K, M, S> {
    fn drop(&mut self) {
        // no operation is in flight once we are being dropped; every
        // binding list can be drained without locks
        self.mounts.for_each(|_, slot| slot.drain());
    }
}

/// Builds the absolute node path `tom/root/<mount_path>[/<remainder>]`.
fn join_node_path(mount_path: &str, remainder: &str) -> String {
    let mut path = String::from("tom/root");

    for part in [mount_path, remainder] {
        if !part.is_empty() {
            path.push('/');
            path.push_str(part);
        }
    }

    path
}

fn live_node<'t>(node: Option<&'t Element>) -> Option<&'t Element> {
    node.filter(|node| !is_outdated(node, now_since_epoch()))
}

struct Resolved<M> {
    priority: usize,
    contributions: Vec<Option<M>>,
}

/// Applies the incremental priority-resolution rule for one visited node:
/// a strictly higher priority replaces everything recorded under the key,
/// an equal priority adds a contribution, a lower one is dropped.
fn accumulate<K: Hash + Eq, M>(
    resolved: &mut StdHashMap<K, Resolved<M>>,
    key: K,
    mapped: Option<M>,
    priority: usize,
) {
    match resolved.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(Resolved {
                priority,
                contributions: vec![mapped],
            });
        }
        Entry::Occupied(mut slot) => {
            let entry = slot.get_mut();

            if priority > entry.priority {
                entry.priority = priority;
                entry.contributions.clear();
                entry.contributions.push(mapped);
            } else if priority == entry.priority {
                entry.contributions.push(mapped);
            }
        }
    }
}
