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

//! Tom documents: XML-backed hierarchical key-value trees.
//!
//! A tom is persisted as `<tom><root>…</root></tom>`. Every descendant
//! element of `root` is a node that may carry `<key>` and `<mapped>`
//! children (text encoding the user's types) and, optionally,
//! `<date_created>` and `<lifetime>` children holding whole seconds.

use std::{
    fmt::Display,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::Path,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use xmltree::{Element, XMLNode};

use crate::storage::StorageError;

pub(crate) const KEY: &str = "key";
pub(crate) const MAPPED: &str = "mapped";
pub(crate) const DATE_CREATED: &str = "date_created";
pub(crate) const LIFETIME: &str = "lifetime";

const TOM: &str = "tom";
const ROOT: &str = "root";

/// A parsed tom document.
pub(crate) struct TomTree {
    root: Element,
}

impl TomTree {
    /// Parses the document stored at `tom_id`.
    pub(crate) fn load(tom_id: &str) -> Result<Self, StorageError> {
        let file = File::open(tom_id)?;
        let root = Element::parse(BufReader::new(file))?;

        Ok(Self { root })
    }

    /// Serializes the document back to `tom_id`, replacing its contents.
    pub(crate) fn save(&self, tom_id: &str) -> Result<(), StorageError> {
        let mut writer = BufWriter::new(File::create(tom_id)?);
        self.root.write(&mut writer)?;
        writer.flush()?;

        Ok(())
    }

    /// Returns the node addressed by `path`, or `None` when any path
    /// component is missing.
    pub(crate) fn node(&self, path: &str) -> Option<&Element> {
        let mut parts = path.split('/');

        if parts.next() != Some(self.root.name.as_str()) {
            return None;
        }

        let mut node = &self.root;

        for part in parts {
            node = node.get_child(part)?;
        }

        Some(node)
    }

    /// Like [`node`], but for mutation.
    ///
    /// [`node`]: #method.node
    pub(crate) fn node_mut(&mut self, path: &str) -> Option<&mut Element> {
        let mut parts = path.split('/');

        if parts.next() != Some(self.root.name.as_str()) {
            return None;
        }

        let mut node = &mut self.root;

        for part in parts {
            node = node.get_mut_child(part)?;
        }

        Some(node)
    }

    /// Returns the node addressed by `path`, creating every missing
    /// component along the way.
    pub(crate) fn ensure_node(&mut self, path: &str) -> &mut Element {
        let mut parts = path.split('/');
        let first = parts.next();
        debug_assert_eq!(first, Some(self.root.name.as_str()));

        let mut node = &mut self.root;

        for part in parts {
            let position = node
                .children
                .iter()
                .position(|child| matches!(child, XMLNode::Element(e) if e.name == part));

            let index = match position {
                Some(index) => index,
                None => {
                    node.children.push(XMLNode::Element(Element::new(part)));
                    node.children.len() - 1
                }
            };

            node = match &mut node.children[index] {
                XMLNode::Element(element) => element,
                _ => unreachable!(),
            };
        }

        node
    }

    /// Detaches the node addressed by `path` from its parent.
    ///
    /// Returns `false` when the path has no parent component or does not
    /// address an existing node.
    pub(crate) fn remove_node(&mut self, path: &str) -> bool {
        let (parent_path, name) = match path.rfind('/') {
            Some(split) => (&path[..split], &path[split + 1..]),
            None => return false,
        };

        match self.node_mut(parent_path) {
            Some(parent) => parent.take_child(name).is_some(),
            None => false,
        }
    }
}

/// Reads the text of `node`'s child named `name` and parses it as `T`.
///
/// A missing child, empty text, or unparseable text all read as `None`.
pub(crate) fn child_value<T: FromStr>(node: &Element, name: &str) -> Option<T> {
    let text = node.get_child(name)?.get_text()?;

    text.trim().parse().ok()
}

/// Replaces the text of `node`'s child named `name`, creating the child if
/// it does not exist.
pub(crate) fn set_child_value<T: Display + ?Sized>(node: &mut Element, name: &str, value: &T) {
    let text = XMLNode::Text(value.to_string());

    match node.get_mut_child(name) {
        Some(child) => {
            child.children.clear();
            child.children.push(text);
        }
        None => {
            let mut child = Element::new(name);
            child.children.push(text);
            node.children.push(XMLNode::Element(child));
        }
    }
}

/// Removes `node`'s child named `name`, if present.
pub(crate) fn erase_child(node: &mut Element, name: &str) -> bool {
    node.take_child(name).is_some()
}

/// A node is outdated iff it carries both lifetime fields and its
/// expiration instant lies strictly in the past. A node missing either
/// field never expires.
///
/// `now` carries the clock's full resolution while the stored fields are
/// whole seconds, so a node expires as soon as the wall clock passes
/// `date_created + lifetime`.
pub(crate) fn is_outdated(node: &Element, now: Duration) -> bool {
    match (
        child_value::<u64>(node, DATE_CREATED),
        child_value::<u64>(node, LIFETIME),
    ) {
        (Some(date_created), Some(lifetime)) => {
            now > Duration::from_secs(date_created.saturating_add(lifetime))
        }
        _ => false,
    }
}

/// Time since the system clock's epoch at full resolution.
pub(crate) fn now_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Creates the file `tom_name` holding an empty tom, unless it already
/// exists.
///
/// Returns `true` if the file was created.
pub fn create_empty_tom(tom_name: &str) -> Result<bool, StorageError> {
    if Path::new(tom_name).exists() {
        return Ok(false);
    }

    let mut root = Element::new(TOM);
    root.children.push(XMLNode::Element(Element::new(ROOT)));

    let mut writer = BufWriter::new(File::create(tom_name)?);
    root.write(&mut writer)?;
    writer.flush()?;

    log::debug!("created empty tom {:?}", tom_name);

    Ok(true)
}

/// Deletes the file `tom_name`, if present.
///
/// Returns `true` if the file was deleted.
pub fn remove_tom(tom_name: &str) -> Result<bool, StorageError> {
    if !Path::new(tom_name).exists() {
        return Ok(false);
    }

    fs::remove_file(tom_name)?;
    log::debug!("removed tom {:?}", tom_name);

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn tom_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn create_and_remove() {
        let dir = tempdir().unwrap();
        let name = tom_path(&dir, "tom1.xml");

        assert!(create_empty_tom(&name).unwrap());
        assert!(!create_empty_tom(&name).unwrap());

        let tree = TomTree::load(&name).unwrap();
        assert!(tree.node("tom/root").is_some());
        assert!(tree.node("tom/root/a").is_none());

        assert!(remove_tom(&name).unwrap());
        assert!(!remove_tom(&name).unwrap());
    }

    #[test]
    fn ensure_and_navigate() {
        let dir = tempdir().unwrap();
        let name = tom_path(&dir, "tom1.xml");

        create_empty_tom(&name).unwrap();

        let mut tree = TomTree::load(&name).unwrap();

        {
            let node = tree.ensure_node("tom/root/a/c/d");
            set_child_value(node, KEY, &4);
            set_child_value(node, MAPPED, &400);
        }

        tree.save(&name).unwrap();

        let tree = TomTree::load(&name).unwrap();
        let node = tree.node("tom/root/a/c/d").unwrap();

        assert_eq!(child_value::<i32>(node, KEY), Some(4));
        assert_eq!(child_value::<i32>(node, MAPPED), Some(400));
        assert_eq!(child_value::<i32>(node, LIFETIME), None);
    }

    #[test]
    fn set_child_value_replaces_text() {
        let mut node = Element::new("d");

        set_child_value(&mut node, KEY, &1);
        assert_eq!(child_value::<i32>(&node, KEY), Some(1));

        set_child_value(&mut node, KEY, &2);
        assert_eq!(child_value::<i32>(&node, KEY), Some(2));
        assert_eq!(node.children.len(), 1);

        assert!(erase_child(&mut node, KEY));
        assert!(!erase_child(&mut node, KEY));
        assert_eq!(child_value::<i32>(&node, KEY), None);
    }

    #[test]
    fn remove_node_detaches_subtree() {
        let dir = tempdir().unwrap();
        let name = tom_path(&dir, "tom1.xml");

        create_empty_tom(&name).unwrap();

        let mut tree = TomTree::load(&name).unwrap();
        tree.ensure_node("tom/root/a/b");

        assert!(tree.remove_node("tom/root/a"));
        assert!(tree.node("tom/root/a").is_none());
        assert!(!tree.remove_node("tom/root/a"));
        assert!(!tree.remove_node("tom"));
    }

    #[test]
    fn outdated_requires_both_fields() {
        let mut node = Element::new("d");
        let now = now_since_epoch();

        assert!(!is_outdated(&node, now));

        set_child_value(&mut node, DATE_CREATED, &(now.as_secs() - 10));
        assert!(!is_outdated(&node, now));

        set_child_value(&mut node, LIFETIME, &5_u64);
        assert!(is_outdated(&node, now));

        set_child_value(&mut node, LIFETIME, &100_u64);
        assert!(!is_outdated(&node, now));

        erase_child(&mut node, DATE_CREATED);
        assert!(!is_outdated(&node, now));
    }
}
