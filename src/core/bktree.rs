//! BK-tree of identifiers keyed by perceptual hash.
//!
//! Every edge is labelled with the distance between the parent's hash and the
//! child's hash, and every node below an edge labelled `d` sits at exactly `d`
//! from that parent. Lookups use the triangle inequality on those labels to
//! skip subtrees that cannot contain a match.
//!
//! Identifiers are unique within a tree; hashes are not. The tree does not
//! compute hashes or distances itself: a [`HashSource`] maps identifiers to
//! hashes and a [`Metric`] compares them.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::mem;

use super::distance::{Hamming, HashValue, Metric};

/// Maps an identifier to its hash.
///
/// Must be deterministic: the same identifier has to produce the same hash on
/// every call, otherwise duplicate detection and exact lookup break down.
pub trait HashSource {
    type Error;

    fn hash_of(&self, identifier: &str) -> Result<HashValue, Self::Error>;
}

impl<F, E> HashSource for F
where
    F: Fn(&str) -> Result<HashValue, E>,
{
    type Error = E;

    fn hash_of(&self, identifier: &str) -> Result<HashValue, E> {
        self(identifier)
    }
}

/// Either an identifier to be hashed, or a hash supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query<'a> {
    Identifier(&'a str),
    Hash(HashValue),
}

impl<'a> From<&'a str> for Query<'a> {
    fn from(identifier: &'a str) -> Self {
        Query::Identifier(identifier)
    }
}

impl From<HashValue> for Query<'_> {
    fn from(hash: HashValue) -> Self {
        Query::Hash(hash)
    }
}

/// Stack headroom checked before descending one level while serializing.
const STACK_RED_ZONE: usize = 64 * 1024;
/// Size of each extra stack segment allocated when the headroom runs out.
const STACK_SEGMENT: usize = 1024 * 1024;

/// A stored entry and the subtrees hanging off it.
///
/// Deeply nested trees are valid (equal hashes chain along edge 0), so
/// serializing grows the stack on demand and dropping is iterative.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Node {
    identifier: String,
    hash: HashValue,
    #[serde(default)]
    children: BTreeMap<u32, Node>,
}

impl Node {
    fn new(identifier: String, hash: HashValue) -> Self {
        Self {
            identifier,
            hash,
            children: BTreeMap::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn hash(&self) -> HashValue {
        self.hash
    }

    /// Children keyed by their distance from this node.
    pub fn children(&self) -> &BTreeMap<u32, Node> {
        &self.children
    }

    /// Consume the node, returning every `(identifier, hash)` below it.
    /// The node's own entry is not included.
    fn into_descendants(mut self) -> Vec<(String, HashValue)> {
        let mut pending: Vec<Node> = mem::take(&mut self.children).into_values().collect();
        let mut entries = Vec::new();
        while let Some(mut node) = pending.pop() {
            pending.extend(mem::take(&mut node.children).into_values());
            entries.push((mem::take(&mut node.identifier), node.hash));
        }
        entries
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || {
            let mut state = serializer.serialize_struct("Node", 3)?;
            state.serialize_field("identifier", &self.identifier)?;
            state.serialize_field("hash", &self.hash)?;
            state.serialize_field("children", &self.children)?;
            state.end()
        })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let mut pending: Vec<Node> = mem::take(&mut self.children).into_values().collect();
        while let Some(mut node) = pending.pop() {
            pending.extend(mem::take(&mut node.children).into_values());
        }
    }
}

/// One hit from a range lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match<'a> {
    pub identifier: &'a str,
    pub distance: u32,
}

pub struct BkTree<H, M = Hamming> {
    root: Option<Node>,
    hasher: H,
    metric: M,
}

impl<H: HashSource, M: Metric> BkTree<H, M> {
    pub fn new(hasher: H, metric: M) -> Self {
        Self::from_root(None, hasher, metric)
    }

    /// Rebuild a tree around a previously stored root.
    ///
    /// The stored structure is trusted; it must have been produced by a tree
    /// using the same metric and hash source.
    pub fn from_root(root: Option<Node>, hasher: H, metric: M) -> Self {
        Self {
            root,
            hasher,
            metric,
        }
    }

    /// Root node, for persistence.
    pub fn root(&self) -> Option<&Node> {
        self.root.as_ref()
    }

    pub fn into_root(self) -> Option<Node> {
        self.root
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    pub fn metric(&self) -> &M {
        &self.metric
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Number of stored identifiers. Walks the whole tree.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Hash the query if it names an identifier.
    pub fn resolve<'q>(&self, query: impl Into<Query<'q>>) -> Result<HashValue, H::Error> {
        match query.into() {
            Query::Identifier(identifier) => self.hasher.hash_of(identifier),
            Query::Hash(hash) => Ok(hash),
        }
    }

    /// Hash `identifier` and insert it.
    ///
    /// Returns `Ok(false)` if the identifier is already present. If hashing
    /// fails the error is returned and the tree is left as it was.
    pub fn add(&mut self, identifier: &str) -> Result<bool, H::Error> {
        let hash = self.hasher.hash_of(identifier)?;
        Ok(self.insert(identifier, hash))
    }

    /// Insert an entry with a known hash. Returns `false` without modifying the
    /// tree if the identifier is met on the way down, the root included.
    pub fn insert(&mut self, identifier: impl Into<String>, hash: HashValue) -> bool {
        let identifier = identifier.into();
        let Some(mut current) = self.root.as_mut() else {
            self.root = Some(Node::new(identifier, hash));
            return true;
        };

        loop {
            if current.identifier == identifier {
                return false;
            }
            let diff = self.metric.distance(hash, current.hash);
            match current.children.entry(diff) {
                Entry::Vacant(slot) => {
                    slot.insert(Node::new(identifier, hash));
                    return true;
                }
                Entry::Occupied(slot) => current = slot.into_mut(),
            }
        }
    }

    /// Remove `identifier`, re-inserting everything that hung below it.
    ///
    /// Returns `Ok(false)` if it was not present.
    pub fn remove(&mut self, identifier: &str) -> Result<bool, H::Error> {
        let hash = self.hasher.hash_of(identifier)?;
        Ok(self.remove_hashed(identifier, hash))
    }

    /// [`BkTree::remove`] with the identifier's hash already known.
    pub fn remove_hashed(&mut self, identifier: &str, hash: HashValue) -> bool {
        let Some(path) = self.locate(identifier, hash) else {
            return false;
        };
        let Some(node) = self.detach(&path) else {
            return false;
        };

        let orphans = node.into_descendants();
        log::debug!(
            "Removed {:?}, re-inserting {} descendant(s)",
            identifier,
            orphans.len()
        );
        for (identifier, hash) in orphans {
            self.insert(identifier, hash);
        }
        true
    }

    pub fn contains(&self, identifier: &str) -> Result<bool, H::Error> {
        let hash = self.hasher.hash_of(identifier)?;
        Ok(self.contains_hashed(identifier, hash))
    }

    pub fn contains_hashed(&self, identifier: &str, hash: HashValue) -> bool {
        self.locate(identifier, hash).is_some()
    }

    /// Every entry within `tolerance` of `hash`, breadth first.
    pub fn lookup_all(&self, hash: HashValue, tolerance: u32) -> LookupAll<'_, M> {
        LookupAll {
            queue: self.root.iter().collect(),
            hash,
            tolerance,
            metric: &self.metric,
        }
    }

    /// Closest entry to `hash` and its distance, or `None` for an empty tree.
    /// Ties resolve to whichever entry is reached first.
    pub fn lookup_distance(&self, hash: HashValue) -> Option<(&str, u32)> {
        let root = self.root.as_ref()?;
        let mut best: Option<(&Node, u32)> = None;
        let mut bound = u32::MAX;
        let mut queue = VecDeque::from([root]);

        while let Some(node) = queue.pop_front() {
            let diff = self.metric.distance(hash, node.hash);
            if best.is_none() || diff < bound {
                bound = diff;
                best = Some((node, diff));
            }
            if bound == 0 {
                break;
            }
            queue.extend(
                node.children
                    .iter()
                    .filter(|&(&d, _)| d.abs_diff(diff) < bound)
                    .map(|(_, child)| child),
            );
        }

        best.map(|(node, diff)| (node.identifier.as_str(), diff))
    }

    pub fn lookup(&self, hash: HashValue) -> Option<&str> {
        self.lookup_distance(hash).map(|(identifier, _)| identifier)
    }

    /// Nearest neighbour of an identifier or hash.
    pub fn lookup_nearest<'q>(
        &self,
        query: impl Into<Query<'q>>,
    ) -> Result<Option<(&str, u32)>, H::Error> {
        let hash = self.resolve(query)?;
        Ok(self.lookup_distance(hash))
    }

    /// Pre-order walk over every identifier.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            stack: self.root.iter().collect(),
        }
    }

    /// Edge keys leading from the root to `identifier`; empty for the root.
    fn locate(&self, identifier: &str, hash: HashValue) -> Option<Vec<u32>> {
        struct Step {
            parent: Option<usize>,
            key: u32,
        }

        let root = self.root.as_ref()?;
        let mut steps: Vec<Step> = Vec::new();
        let mut queue: VecDeque<(&Node, Option<usize>)> = VecDeque::from([(root, None)]);
        let mut bound = u32::MAX;

        while let Some((node, at)) = queue.pop_front() {
            if node.identifier == identifier {
                let mut path = Vec::new();
                let mut cursor = at;
                while let Some(index) = cursor {
                    path.push(steps[index].key);
                    cursor = steps[index].parent;
                }
                path.reverse();
                return Some(path);
            }

            let diff = self.metric.distance(hash, node.hash);
            bound = bound.min(diff);
            for (&key, child) in &node.children {
                if key.abs_diff(diff) <= bound {
                    steps.push(Step { parent: at, key });
                    queue.push_back((child, Some(steps.len() - 1)));
                }
            }
        }
        None
    }

    /// Unlink the node at `path` and hand it back with its subtree.
    fn detach(&mut self, path: &[u32]) -> Option<Node> {
        let Some((last, ancestors)) = path.split_last() else {
            return self.root.take();
        };
        let mut parent = self.root.as_mut()?;
        for key in ancestors {
            parent = parent.children.get_mut(key)?;
        }
        parent.children.remove(last)
    }
}

impl<'a, H: HashSource, M: Metric> IntoIterator for &'a BkTree<H, M> {
    type Item = &'a str;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Pre-order iterator over identifiers, children in ascending distance.
pub struct Iter<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.values().rev());
        Some(&node.identifier)
    }
}

/// Lazy range query, see [`BkTree::lookup_all`].
///
/// A child on an edge labelled `d` is only visited when `|d - diff| <= tolerance`,
/// `diff` being the distance from the query to the parent. Anything under that
/// edge is at least `|d - diff|` away from the query, so no match is skipped.
pub struct LookupAll<'a, M> {
    queue: VecDeque<&'a Node>,
    hash: HashValue,
    tolerance: u32,
    metric: &'a M,
}

impl<'a, M: Metric> Iterator for LookupAll<'a, M> {
    type Item = Match<'a>;

    fn next(&mut self) -> Option<Match<'a>> {
        let tolerance = self.tolerance;
        while let Some(node) = self.queue.pop_front() {
            let diff = self.metric.distance(self.hash, node.hash);
            self.queue.extend(
                node.children
                    .iter()
                    .filter(|&(&d, _)| d.abs_diff(diff) <= tolerance)
                    .map(|(_, child)| child),
            );
            if diff <= tolerance {
                return Some(Match {
                    identifier: &node.identifier,
                    distance: diff,
                });
            }
        }
        None
    }
}
