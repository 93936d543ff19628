//! Root-to-leaf descent and ordered walks over APFS B-trees.

use crate::compare::KeyComparer;
use crate::locate::{SearchMode, locate};
use crate::parse_to_apfs_error;
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{BTreeNode, KvGeometry};
use apfs_types::{ObjectId, ObjectRef, Paddr};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{trace, warn};

/// Deepest tree (in levels below the root) a lookup will follow.
pub const DEFAULT_MAX_DEPTH: u16 = 16;

/// A decoded, checksum-verified node and the block it was read from.
#[derive(Debug, Clone)]
pub struct LoadedNode {
    pub paddr: Paddr,
    pub node: Arc<BTreeNode>,
}

/// Anything that can turn an object reference into a decoded node.
///
/// Implementations own address resolution, checksum verification, and any
/// caching; the navigator only sees verified nodes.
pub trait NodeSource {
    fn read_node(&self, reference: ObjectRef) -> Result<LoadedNode>;
}

impl<T: NodeSource + ?Sized> NodeSource for &T {
    fn read_node(&self, reference: ObjectRef) -> Result<LoadedNode> {
        (**self).read_node(reference)
    }
}

impl<T: NodeSource + ?Sized> NodeSource for Arc<T> {
    fn read_node(&self, reference: ObjectRef) -> Result<LoadedNode> {
        (**self).read_node(reference)
    }
}

/// A leaf record returned by [`BTreeNavigator::find`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// TOC index within the leaf.
    pub index: u32,
    /// Block holding the leaf.
    pub paddr: Paddr,
}

/// Walks one tree shape (one key encoding) through a [`NodeSource`].
#[derive(Debug, Clone)]
pub struct BTreeNavigator<S, C> {
    source: S,
    comparer: C,
    max_depth: u16,
}

impl<S: NodeSource, C: KeyComparer> BTreeNavigator<S, C> {
    pub fn new(source: S, comparer: C) -> Self {
        Self {
            source,
            comparer,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: u16) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Read the root of the tree at `root` and check that it is one.
    pub fn root_node(&self, root: ObjectRef) -> Result<LoadedNode> {
        let loaded = self.source.read_node(root)?;
        if !loaded.node.is_root() {
            return Err(ApfsError::CorruptObject {
                block: loaded.paddr.0,
                detail: format!("{root} is not a B-tree root node"),
            });
        }
        if loaded.node.level() > self.max_depth {
            return Err(ApfsError::TreeTooDeep {
                root: loaded.paddr.0,
                limit: self.max_depth,
            });
        }
        Ok(loaded)
    }

    /// Follow the child pointer at TOC `index` of `parent`.
    ///
    /// Children are addressed in the root's storage class (virtual children
    /// at the root's xid) and must sit exactly one level below their parent.
    pub fn child_node(
        &self,
        root: ObjectRef,
        parent: &LoadedNode,
        index: u32,
        geometry: Option<KvGeometry>,
    ) -> Result<LoadedNode> {
        let (reference, child) = self.read_child(root, parent, index, geometry)?;
        check_child_level(reference, parent, &child)?;
        Ok(child)
    }

    /// [`child_node`](Self::child_node) for a descent whose path so far is
    /// `ancestors`. A child that is already on the path closes a cycle.
    fn descend(
        &self,
        root: ObjectRef,
        root_paddr: Paddr,
        parent: &LoadedNode,
        index: u32,
        geometry: Option<KvGeometry>,
        ancestors: &HashSet<Paddr>,
    ) -> Result<LoadedNode> {
        let (reference, child) = self.read_child(root, parent, index, geometry)?;
        if ancestors.contains(&child.paddr) {
            warn!(
                root = root_paddr.0,
                parent = parent.paddr.0,
                child = child.paddr.0,
                "btree_cycle"
            );
            return Err(ApfsError::TreeTooDeep {
                root: root_paddr.0,
                limit: self.max_depth,
            });
        }
        check_child_level(reference, parent, &child)?;
        Ok(child)
    }

    fn read_child(
        &self,
        root: ObjectRef,
        parent: &LoadedNode,
        index: u32,
        geometry: Option<KvGeometry>,
    ) -> Result<(ObjectRef, LoadedNode)> {
        let oid = parent
            .node
            .child_oid_at(index, geometry)
            .map_err(|e| parse_to_apfs_error(parent.paddr.0, &e))?;
        let reference = match root {
            ObjectRef::Physical(_) => ObjectRef::Physical(Paddr(oid)),
            ObjectRef::Virtual { xid, .. } => ObjectRef::Virtual {
                oid: ObjectId(oid),
                xid,
            },
            ObjectRef::Ephemeral(_) => ObjectRef::Ephemeral(ObjectId(oid)),
        };

        let child = self.source.read_node(reference)?;
        Ok((reference, child))
    }

    /// Descend from `root` to the leaf record matching `target` under `mode`.
    ///
    /// Index nodes always use floor selection; `mode` applies at the leaf.
    /// Descent length is bounded by the root's level, which
    /// [`root_node`](Self::root_node) checks against the depth limit. A
    /// child pointing back at a node on the descent path fails with
    /// `TreeTooDeep`; any other child at the wrong level is `CorruptObject`.
    pub fn find(&self, root: ObjectRef, target: &C::Target, mode: SearchMode) -> Result<FoundEntry> {
        let root_node = self.root_node(root)?;
        let root_paddr = root_node.paddr;
        let geometry = root_node.node.geometry();
        let not_found = || ApfsError::KeyNotFound(format!("{target:?} in tree {root}"));

        let mut path = HashSet::from([root_paddr]);
        let mut current = root_node;
        let mut rightmost = true;
        loop {
            let node = &current.node;
            trace!(
                paddr = current.paddr.0,
                level = node.level(),
                nkeys = node.key_count(),
                "btree_descend"
            );

            if node.is_leaf() {
                let leaf_mode = match mode {
                    SearchMode::ClosestLower if !rightmost => SearchMode::Floor,
                    other => other,
                };
                let index = locate(node, geometry, &self.comparer, target, leaf_mode)
                    .map_err(|e| parse_to_apfs_error(current.paddr.0, &e))?
                    .ok_or_else(not_found)?;
                let key = node
                    .key_at(index, geometry)
                    .map_err(|e| parse_to_apfs_error(current.paddr.0, &e))?;
                let value = node
                    .value_at(index, geometry)
                    .map_err(|e| parse_to_apfs_error(current.paddr.0, &e))?;
                return Ok(FoundEntry {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    index,
                    paddr: current.paddr,
                });
            }

            let index = locate(node, geometry, &self.comparer, target, SearchMode::Floor)
                .map_err(|e| parse_to_apfs_error(current.paddr.0, &e))?
                .ok_or_else(not_found)?;
            rightmost &= index + 1 == node.key_count();
            current = self.descend(root, root_paddr, &current, index, geometry, &path)?;
            path.insert(current.paddr);
        }
    }

    /// Visit every leaf record in key order.
    ///
    /// Returns the number of records visited. A child that is its own
    /// ancestor aborts the walk with `TreeTooDeep`; a node reached from two
    /// parents aborts it with `CorruptObject`.
    pub fn walk<F>(&self, root: ObjectRef, visitor: &mut F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let root_node = self.root_node(root)?;
        let mut state = WalkState {
            root,
            root_paddr: root_node.paddr,
            geometry: root_node.node.geometry(),
            active_path: HashSet::new(),
            visited: HashSet::new(),
        };
        self.walk_subtree(&mut state, &root_node, visitor)
    }

    fn walk_subtree<F>(
        &self,
        state: &mut WalkState,
        current: &LoadedNode,
        visitor: &mut F,
    ) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        state.active_path.insert(current.paddr);
        if !state.visited.insert(current.paddr) {
            return Err(ApfsError::CorruptObject {
                block: current.paddr.0,
                detail: "B-tree node reachable from two parents".to_owned(),
            });
        }

        let node = &current.node;
        trace!(
            paddr = current.paddr.0,
            level = node.level(),
            nkeys = node.key_count(),
            "btree_walk"
        );
        let mut count = 0;
        for index in 0..node.key_count() {
            if node.is_leaf() {
                let key = node
                    .key_at(index, state.geometry)
                    .map_err(|e| parse_to_apfs_error(current.paddr.0, &e))?;
                let value = node
                    .value_at(index, state.geometry)
                    .map_err(|e| parse_to_apfs_error(current.paddr.0, &e))?;
                visitor(key, value)?;
                count += 1;
            } else {
                let child = self.descend(
                    state.root,
                    state.root_paddr,
                    current,
                    index,
                    state.geometry,
                    &state.active_path,
                )?;
                count += self.walk_subtree(state, &child, visitor)?;
            }
        }

        state.active_path.remove(&current.paddr);
        Ok(count)
    }
}

fn check_child_level(reference: ObjectRef, parent: &LoadedNode, child: &LoadedNode) -> Result<()> {
    let expected_level = parent.node.level().saturating_sub(1);
    if child.node.level() != expected_level || child.node.is_root() {
        return Err(ApfsError::CorruptObject {
            block: child.paddr.0,
            detail: format!(
                "child {reference} of block {} has level {} (root={}), expected level {expected_level}",
                parent.paddr,
                child.node.level(),
                child.node.is_root()
            ),
        });
    }
    Ok(())
}

struct WalkState {
    root: ObjectRef,
    root_paddr: Paddr,
    geometry: Option<KvGeometry>,
    active_path: HashSet<Paddr>,
    visited: HashSet<Paddr>,
}
