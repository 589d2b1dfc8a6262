use std::collections::HashSet;

use log::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::storage::node::{
    drop_kid, fits_merge, leaf_delete, leaf_insert, leaf_update, lookup_le, merge, replace_kids,
    replace_two_kids, split3, wants_merge,
};
use crate::storage::page::{Node, NodeType, MAX_KEY_SIZE, MAX_VAL_SIZE};
use crate::storage::store::PageStore;
use crate::transaction::commit::commit;

/// Deeper than any tree that fits in a u64 page space; hitting it means a cycle.
const MAX_DEPTH: usize = 64;

/// A copy-on-write B-tree over a [`PageStore`].
///
/// Pages are never modified in place.
///
/// On insert:
///   1. Descend from the root to the leaf covering the key (greatest key <= it).
///   2. Build a new leaf with the entry inserted or updated. It may be larger
///      than a page at this point.
///   3. On the way back up, split each rebuilt child into 1-3 pages, free the
///      old child, allocate the pieces and splice them into a rebuilt parent.
///   4. If the rebuilt root splits, a new internal root holding the pieces
///      adds a level.
///
/// On delete:
///   1. Descend to the leaf, drop the entry (not found leaves everything as is).
///   2. On the way back up, a child that shrank below a quarter page is merged
///      with its left sibling, or failing that its right one, when the result
///      fits a page.
///   3. A root left with one child is replaced by that child; a root with
///      nothing but the sentinel empties the tree.
///
/// Every operation ends with the commit protocol, which makes the new root
/// durable before any freed page can be reused.
///
/// The leftmost leaf always starts with the empty key (the sentinel), so a
/// lookup in any internal node finds a covering child. The empty key is
/// therefore reserved.
pub struct BTree<S: PageStore> {
    root: u64,
    store: S,
    poisoned: bool,
}

/// Shape of a tree as found by [`BTree::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels; 0 for an empty tree, 1 for a single leaf.
    pub height: usize,
    /// Pages reachable from the root.
    pub pages: usize,
    /// User keys, not counting the sentinel.
    pub keys: usize,
}

/// Reject entries that could not be stored in a single leaf.
pub fn check_limit(key: &[u8], val: &[u8]) -> DbResult<()> {
    if key.len() > MAX_KEY_SIZE || val.len() > MAX_VAL_SIZE {
        return Err(DbError::SizeLimitExceeded { key: key.len(), value: val.len() });
    }
    Ok(())
}

impl<S: PageStore> BTree<S> {
    /// Open the tree whose root the store currently points at.
    pub fn open(mut store: S) -> DbResult<Self> {
        let root = store.root();
        if root != 0 {
            let node = load(&mut store, root)?;
            debug!("open: root page {} is a {:?} with {} keys", root, node.node_type(), node.nkeys());
        } else {
            debug!("open: empty tree");
        }
        Ok(BTree { root, store, poisoned: false })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Look up `key`. Absent keys are `Ok(None)`.
    pub fn get(&mut self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.check_usable()?;
        if key.is_empty() || self.root == 0 {
            return Ok(None);
        }
        let res = find(&mut self.store, self.root, key);
        self.observe(res)
    }

    /// Insert `key`, or replace its value if it is already present.
    pub fn insert(&mut self, key: &[u8], val: &[u8]) -> DbResult<()> {
        self.check_usable()?;
        if key.is_empty() {
            return Err(DbError::EmptyKey);
        }
        check_limit(key, val)?;

        debug!(
            "insert() → key of {} bytes, value of {} bytes, root {}",
            key.len(),
            val.len(),
            self.root
        );
        let res = insert_into(&mut self.store, self.root, key, val)
            .and_then(|root| commit(&mut self.store, root).map(|()| root));
        self.settle(res)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> DbResult<bool> {
        self.check_usable()?;
        if key.is_empty() || self.root == 0 {
            return Ok(false);
        }

        debug!("delete() → key of {} bytes, root {}", key.len(), self.root);
        let res = match delete_from(&mut self.store, self.root, key) {
            Ok(None) => {
                debug!("  → key not found");
                return Ok(false);
            }
            Ok(Some(root)) => commit(&mut self.store, root).map(|()| root),
            Err(e) => Err(e),
        };
        self.settle(res).map(|()| true)
    }

    /// Every entry in key order.
    pub fn scan(&mut self) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_usable()?;
        let mut out = Vec::new();
        if self.root != 0 {
            let res = collect(&mut self.store, self.root, 1, &mut out);
            self.observe(res)?;
        }
        Ok(out)
    }

    /// Walk the whole tree, checking its structure on the way.
    ///
    /// Fails with `Corruption` if leaves sit at different depths, a parent
    /// key disagrees with its child's first key, a node is empty, or a page
    /// is reachable twice.
    pub fn stats(&mut self) -> DbResult<TreeStats> {
        self.check_usable()?;
        let mut walk = Walk::default();
        if self.root != 0 {
            let res = walk.visit(&mut self.store, self.root, 1, None);
            self.observe(res)?;
        }
        Ok(TreeStats {
            height: walk.leaf_depth.unwrap_or(0),
            pages: walk.seen.len(),
            keys: walk.keys,
        })
    }

    fn check_usable(&self) -> DbResult<()> {
        if self.poisoned {
            return Err(DbError::Poisoned);
        }
        Ok(())
    }

    fn observe<T>(&mut self, res: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &res {
            if e.is_fatal() {
                warn!("tree poisoned: {}", e);
                self.poisoned = true;
            }
        }
        res
    }

    /// Adopt the committed root, or undo the store's bookkeeping on failure.
    fn settle(&mut self, res: DbResult<u64>) -> DbResult<()> {
        match res {
            Ok(root) => {
                debug!("  → root {} replaced by {}", self.root, root);
                self.root = root;
                Ok(())
            }
            Err(e) => {
                self.store.rollback();
                self.observe(Err(e))
            }
        }
    }
}

fn load<S: PageStore + ?Sized>(store: &mut S, ptr: u64) -> DbResult<Node> {
    Node::decode(store.get(ptr)?)
}

fn too_deep() -> DbError {
    DbError::Corruption(format!("tree is deeper than {} levels", MAX_DEPTH))
}

fn below_first_key(node: &Node) -> DbError {
    DbError::Corruption(format!(
        "internal node with {} keys does not cover the search key",
        node.nkeys()
    ))
}

fn find<S: PageStore + ?Sized>(store: &mut S, root: u64, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
    let mut ptr = root;
    for _ in 0..MAX_DEPTH {
        let node = load(store, ptr)?;
        let idx = lookup_le(&node, key);
        match node.node_type() {
            NodeType::Leaf => {
                return Ok(idx
                    .filter(|&i| node.key(i) == key)
                    .map(|i| node.value(i).to_vec()));
            }
            NodeType::Internal => {
                let idx = idx.ok_or_else(|| below_first_key(&node))?;
                ptr = node.ptr(idx);
            }
        }
    }
    Err(too_deep())
}

/// Allocate each node and return its page pointer with its first key.
fn persist_kids<S: PageStore + ?Sized>(store: &mut S, kids: Vec<Node>) -> DbResult<Vec<(u64, Vec<u8>)>> {
    let mut out = Vec::with_capacity(kids.len());
    for kid in kids {
        assert!(kid.nkeys() > 0, "refusing to persist an empty node");
        let first = kid.key(0).to_vec();
        let ptr = store.allocate(kid.into_page())?;
        out.push((ptr, first));
    }
    Ok(out)
}

/// Persist a rebuilt root, adding a level if it had to be split.
fn promote<S: PageStore + ?Sized>(store: &mut S, node: Node) -> DbResult<u64> {
    let kids = persist_kids(store, split3(node))?;
    if let [(ptr, _)] = kids.as_slice() {
        return Ok(*ptr);
    }

    debug!("  → root split into {} nodes, adding a level", kids.len());
    let mut root = Node::new();
    root.set_header(NodeType::Internal, kids.len());
    for (i, (ptr, key)) in kids.iter().enumerate() {
        root.append_kv(i, *ptr, key, &[]);
    }
    store.allocate(root.into_page())
}

fn insert_into<S: PageStore + ?Sized>(store: &mut S, root: u64, key: &[u8], val: &[u8]) -> DbResult<u64> {
    if root == 0 {
        debug!("  → empty tree, creating a leaf root");
        let mut leaf = Node::new();
        leaf.set_header(NodeType::Leaf, 2);
        leaf.append_kv(0, 0, &[], &[]);
        leaf.append_kv(1, 0, key, val);
        return store.allocate(leaf.into_page());
    }

    let node = load(store, root)?;
    let updated = tree_insert(store, &node, key, val, 1)?;
    store.free(root)?;
    promote(store, updated)
}

/// Rebuild `node`, found at `depth`, with the entry inserted. The result may
/// exceed a page.
fn tree_insert<S: PageStore + ?Sized>(
    store: &mut S,
    node: &Node,
    key: &[u8],
    val: &[u8],
    depth: usize,
) -> DbResult<Node> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }
    let mut new = Node::scratch();
    let idx = lookup_le(node, key);
    match node.node_type() {
        NodeType::Leaf => match idx {
            Some(i) if node.key(i) == key => leaf_update(&mut new, node, i, key, val),
            Some(i) => leaf_insert(&mut new, node, i + 1, key, val),
            None => leaf_insert(&mut new, node, 0, key, val),
        },
        NodeType::Internal => {
            let idx = idx.ok_or_else(|| below_first_key(node))?;
            let kptr = node.ptr(idx);
            let kid = load(store, kptr)?;
            let updated = tree_insert(store, &kid, key, val, depth + 1)?;

            let kids = split3(updated);
            if kids.len() > 1 {
                debug!("  → child page {} split into {}", kptr, kids.len());
            }
            store.free(kptr)?;
            let kids = persist_kids(store, kids)?;
            replace_kids(&mut new, node, idx, &kids);
        }
    }
    Ok(new)
}

/// Delete from the tree rooted at `root`, returning the new root, or `None`
/// if the key is absent.
fn delete_from<S: PageStore + ?Sized>(store: &mut S, root: u64, key: &[u8]) -> DbResult<Option<u64>> {
    let node = load(store, root)?;
    let Some(updated) = tree_delete(store, &node, key, 1)? else {
        return Ok(None);
    };
    store.free(root)?;

    let new_root = match updated.node_type() {
        NodeType::Internal if updated.nkeys() == 0 => 0,
        NodeType::Internal if updated.nkeys() == 1 => collapse(store, updated.ptr(0))?,
        NodeType::Leaf if only_sentinel(&updated) => 0,
        _ => promote(store, updated)?,
    };
    if new_root == 0 {
        debug!("  → tree is now empty");
    }
    Ok(Some(new_root))
}

fn only_sentinel(node: &Node) -> bool {
    node.nkeys() == 0 || (node.nkeys() == 1 && node.key(0).is_empty())
}

/// Drop root levels that have a single child.
fn collapse<S: PageStore + ?Sized>(store: &mut S, mut ptr: u64) -> DbResult<u64> {
    for _ in 0..MAX_DEPTH {
        let node = load(store, ptr)?;
        match node.node_type() {
            NodeType::Internal if node.nkeys() == 1 => {
                debug!("  → root has a single child, dropping a level");
                store.free(ptr)?;
                ptr = node.ptr(0);
            }
            NodeType::Leaf if only_sentinel(&node) => {
                store.free(ptr)?;
                return Ok(0);
            }
            _ => return Ok(ptr),
        }
    }
    Err(too_deep())
}

fn tree_delete<S: PageStore + ?Sized>(
    store: &mut S,
    node: &Node,
    key: &[u8],
    depth: usize,
) -> DbResult<Option<Node>> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }
    match node.node_type() {
        NodeType::Leaf => match lookup_le(node, key) {
            Some(idx) if node.key(idx) == key => {
                let mut new = Node::new();
                leaf_delete(&mut new, node, idx);
                Ok(Some(new))
            }
            _ => Ok(None),
        },
        NodeType::Internal => node_delete(store, node, key, depth),
    }
}

enum Sibling {
    Left(Node),
    Right(Node),
}

fn merge_sibling<S: PageStore + ?Sized>(
    store: &mut S,
    node: &Node,
    idx: usize,
    updated: &Node,
) -> DbResult<Option<Sibling>> {
    if !wants_merge(updated) {
        return Ok(None);
    }
    if idx > 0 {
        let sibling = load(store, node.ptr(idx - 1))?;
        if fits_merge(&sibling, updated) {
            return Ok(Some(Sibling::Left(sibling)));
        }
    }
    if idx + 1 < node.nkeys() {
        let sibling = load(store, node.ptr(idx + 1))?;
        if fits_merge(&sibling, updated) {
            return Ok(Some(Sibling::Right(sibling)));
        }
    }
    Ok(None)
}

fn node_delete<S: PageStore + ?Sized>(
    store: &mut S,
    node: &Node,
    key: &[u8],
    depth: usize,
) -> DbResult<Option<Node>> {
    let idx = lookup_le(node, key).ok_or_else(|| below_first_key(node))?;
    let kptr = node.ptr(idx);
    let kid = load(store, kptr)?;
    let Some(updated) = tree_delete(store, &kid, key, depth + 1)? else {
        return Ok(None);
    };
    store.free(kptr)?;

    // The parent can outgrow a page when a child's new first key is longer
    // than the old one, so it is rebuilt in scratch space.
    let mut new = Node::scratch();
    match merge_sibling(store, node, idx, &updated)? {
        Some(Sibling::Left(sibling)) => {
            debug!("  → merging child {} into its left sibling", kptr);
            let mut merged = Node::new();
            merge(&mut merged, &sibling, &updated);
            store.free(node.ptr(idx - 1))?;
            let first = merged.key(0).to_vec();
            let ptr = store.allocate(merged.into_page())?;
            replace_two_kids(&mut new, node, idx - 1, ptr, &first);
        }
        Some(Sibling::Right(sibling)) => {
            debug!("  → merging child {} with its right sibling", kptr);
            let mut merged = Node::new();
            merge(&mut merged, &updated, &sibling);
            store.free(node.ptr(idx + 1))?;
            let first = merged.key(0).to_vec();
            let ptr = store.allocate(merged.into_page())?;
            replace_two_kids(&mut new, node, idx, ptr, &first);
        }
        None if updated.nkeys() == 0 => drop_kid(&mut new, node, idx),
        None => {
            let kids = persist_kids(store, split3(updated))?;
            replace_kids(&mut new, node, idx, &kids);
        }
    }
    Ok(Some(new))
}

fn collect<S: PageStore + ?Sized>(
    store: &mut S,
    ptr: u64,
    depth: usize,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> DbResult<()> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }
    let node = load(store, ptr)?;
    for i in 0..node.nkeys() {
        match node.node_type() {
            NodeType::Leaf => {
                if !node.key(i).is_empty() {
                    out.push((node.key(i).to_vec(), node.value(i).to_vec()));
                }
            }
            NodeType::Internal => collect(store, node.ptr(i), depth + 1, out)?,
        }
    }
    Ok(())
}

#[derive(Default)]
struct Walk {
    seen: HashSet<u64>,
    leaf_depth: Option<usize>,
    keys: usize,
}

impl Walk {
    fn visit<S: PageStore + ?Sized>(
        &mut self,
        store: &mut S,
        ptr: u64,
        depth: usize,
        first_key: Option<&[u8]>,
    ) -> DbResult<()> {
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        if !self.seen.insert(ptr) {
            return Err(DbError::Corruption(format!("page {} is reachable twice", ptr)));
        }
        let node = load(store, ptr)?;
        if node.nkeys() == 0 {
            return Err(DbError::Corruption(format!("page {} has no keys", ptr)));
        }
        if let Some(first) = first_key {
            if node.key(0) != first {
                return Err(DbError::Corruption(format!(
                    "page {} starts with a different key than its parent records",
                    ptr
                )));
            }
        }

        match node.node_type() {
            NodeType::Leaf => {
                match self.leaf_depth {
                    Some(d) if d != depth => {
                        return Err(DbError::Corruption(format!(
                            "leaf {} is at depth {}, expected {}",
                            ptr, depth, d
                        )));
                    }
                    _ => self.leaf_depth = Some(depth),
                }
                self.keys += (0..node.nkeys()).filter(|&i| !node.key(i).is_empty()).count();
            }
            NodeType::Internal => {
                for i in 0..node.nkeys() {
                    self.visit(store, node.ptr(i), depth + 1, Some(node.key(i)))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PAGE_SIZE;
    use crate::storage::store::MemoryStore;

    fn tree() -> BTree<MemoryStore> {
        BTree::open(MemoryStore::new()).unwrap()
    }

    #[test]
    fn first_insert_creates_a_sentinel_leaf() {
        let mut t = tree();
        t.insert(b"k", b"v").unwrap();
        let root = load(&mut t.store, t.root).unwrap();
        assert_eq!(root.node_type(), NodeType::Leaf);
        assert_eq!(root.nkeys(), 2);
        assert_eq!(root.key(0), b"");
        assert_eq!(root.key(1), b"k");
        assert_eq!(root.value(1), b"v");
    }

    #[test]
    fn empty_key_is_reserved() {
        let mut t = tree();
        t.insert(b"a", b"1").unwrap();
        assert!(matches!(t.insert(b"", b"x"), Err(DbError::EmptyKey)));
        assert_eq!(t.get(b"").unwrap(), None);
        assert!(!t.delete(b"").unwrap());
        assert_eq!(t.stats().unwrap().keys, 1);
    }

    #[test]
    fn size_limit_rejects_either_side() {
        assert!(check_limit(&[0; MAX_KEY_SIZE], &[0; MAX_VAL_SIZE]).is_ok());
        assert!(check_limit(&[0; MAX_KEY_SIZE + 1], b"v").is_err());
        assert!(check_limit(b"k", &[0; MAX_VAL_SIZE + 1]).is_err());
    }

    #[test]
    fn rejected_insert_changes_nothing() {
        let mut t = tree();
        t.insert(b"a", b"1").unwrap();
        let root = t.root();
        let pages = t.store().page_count();
        let err = t.insert(&[b'x'; 1000], b"v").unwrap_err();
        assert!(matches!(err, DbError::SizeLimitExceeded { key: 1000, value: 1 }));
        assert_eq!(t.root(), root);
        assert_eq!(t.store().page_count(), pages);
    }

    #[test]
    fn every_mutation_writes_a_new_root_page() {
        let mut t = tree();
        t.insert(b"a", b"1").unwrap();
        let first = t.root();
        t.insert(b"a", b"2").unwrap();
        assert_ne!(t.root(), first);
        assert_eq!(t.store().page_count(), 1);
    }

    #[test]
    fn deleting_the_last_key_empties_the_tree() {
        let mut t = tree();
        t.insert(b"a", b"1").unwrap();
        assert!(t.delete(b"a").unwrap());
        assert!(t.is_empty());
        assert_eq!(t.store().page_count(), 0);
        assert_eq!(t.stats().unwrap(), TreeStats::default());
    }

    #[test]
    fn corrupt_page_poisons_the_tree() {
        let mut t = tree();
        t.insert(b"a", b"1").unwrap();
        let root = t.root();
        let mut junk = vec![0u8; PAGE_SIZE];
        junk[0] = 7;
        t.store.overwrite(root, junk);

        assert!(matches!(t.get(b"a"), Err(DbError::Corruption(_))));
        assert!(matches!(t.get(b"a"), Err(DbError::Poisoned)));
        assert!(matches!(t.insert(b"b", b"2"), Err(DbError::Poisoned)));
    }

    /// An internal root whose only child pointer is its own page.
    fn self_referencing_root() -> BTree<MemoryStore> {
        let mut store = MemoryStore::new();
        let mut root = Node::new();
        root.set_header(NodeType::Internal, 1);
        root.append_kv(0, 1, &[], &[]);
        let ptr = store.allocate(root.into_page()).unwrap();
        assert_eq!(ptr, 1);
        store.write_pages().unwrap();
        store.write_root(ptr).unwrap();
        store.release_freed();
        BTree::open(store).unwrap()
    }

    #[test]
    fn pointer_cycle_is_corruption_for_every_operation() {
        let mut t = self_referencing_root();
        assert!(matches!(t.get(b"a"), Err(DbError::Corruption(_))));

        let mut t = self_referencing_root();
        assert!(matches!(t.insert(b"a", b"1"), Err(DbError::Corruption(_))));
        assert_eq!(t.root(), 1);
        assert!(matches!(t.get(b"a"), Err(DbError::Poisoned)));

        let mut t = self_referencing_root();
        assert!(matches!(t.delete(b"a"), Err(DbError::Corruption(_))));
        assert!(matches!(t.delete(b"a"), Err(DbError::Poisoned)));
        assert!(t.store().contains(1));
    }

    #[test]
    fn internal_node_without_sentinel_is_corruption() {
        let mut store = MemoryStore::new();
        let mut leaf = Node::new();
        leaf.set_header(NodeType::Leaf, 1);
        leaf.append_kv(0, 0, b"m", b"v");
        let kid = store.allocate(leaf.into_page()).unwrap();
        let mut root = Node::new();
        root.set_header(NodeType::Internal, 1);
        root.append_kv(0, kid, b"m", &[]);
        let ptr = store.allocate(root.into_page()).unwrap();
        store.write_pages().unwrap();
        store.write_root(ptr).unwrap();
        store.release_freed();

        let mut t = BTree::open(store).unwrap();
        assert_eq!(t.get(b"m").unwrap(), Some(b"v".to_vec()));
        assert!(matches!(t.get(b"a"), Err(DbError::Corruption(_))));
        assert!(matches!(t.get(b"m"), Err(DbError::Poisoned)));
    }

    #[test]
    fn missing_child_page_is_fatal() {
        let mut t = tree();
        for i in 0..3u8 {
            t.insert(&[b'a' + i], &[i; 1500]).unwrap();
        }
        let root = load(&mut t.store, t.root).unwrap();
        assert_eq!(root.node_type(), NodeType::Internal);

        let mut broken = MemoryStore::new();
        let copy = broken.allocate(root.into_page()).unwrap();
        broken.write_root(copy).unwrap();
        let mut t = BTree::open(broken).unwrap();
        let err = t.get(b"a").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(t.delete(b"a"), Err(DbError::Poisoned)));
    }

    #[test]
    fn open_reads_the_store_root() {
        let mut t = tree();
        t.insert(b"a", b"1").unwrap();
        let mut t = BTree::open(t.into_store()).unwrap();
        assert_eq!(t.get(b"a").unwrap(), Some(b"1".to_vec()));
    }
}
