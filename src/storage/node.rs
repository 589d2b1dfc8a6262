//! Pure algorithms over encoded nodes. None of these touch a page store; the
//! controller in `btree.rs` decides which of them to run and persists the
//! results.
//!
//! Helpers here assert instead of returning errors: they only ever see nodes
//! that passed `Node::decode` or were built by this module.

use std::cmp::Ordering;

use crate::storage::page::{Node, NodeType, HEADER_SIZE, OFFSET_SIZE, PAGE_SIZE, POINTER_SIZE};

/// Index of the last key less than or equal to `key`, or `None` when every
/// key in the node is greater.
pub fn lookup_le(node: &Node, key: &[u8]) -> Option<usize> {
    let mut found = None;
    for i in 0..node.nkeys() {
        match node.key(i).cmp(key) {
            Ordering::Equal => return Some(i),
            Ordering::Less => found = Some(i),
            Ordering::Greater => break,
        }
    }
    found
}

/// Insert a new entry at `idx`, shifting the tail right by one.
pub fn leaf_insert(new: &mut Node, old: &Node, idx: usize, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx, old.nkeys() - idx);
}

/// Replace the value of the entry at `idx`.
pub fn leaf_update(new: &mut Node, old: &Node, idx: usize, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys());
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx + 1, old.nkeys() - (idx + 1));
}

/// Drop the entry at `idx`.
pub fn leaf_delete(new: &mut Node, old: &Node, idx: usize) {
    new.set_header(NodeType::Leaf, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, old.nkeys() - (idx + 1));
}

/// Replace child `idx` of an internal node with `kids`, each given as its
/// page pointer and first key.
pub fn replace_kids(new: &mut Node, old: &Node, idx: usize, kids: &[(u64, Vec<u8>)]) {
    assert!(!kids.is_empty() && kids.len() <= 3);
    let inc = kids.len();
    new.set_header(NodeType::Internal, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, (ptr, key)) in kids.iter().enumerate() {
        new.append_kv(idx + i, *ptr, key, &[]);
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1));
}

/// Remove child `idx` of an internal node.
pub fn drop_kid(new: &mut Node, old: &Node, idx: usize) {
    new.set_header(NodeType::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, old.nkeys() - (idx + 1));
}

/// Replace the adjacent children `idx` and `idx + 1` with a single merged child.
pub fn replace_two_kids(new: &mut Node, old: &Node, idx: usize, ptr: u64, key: &[u8]) {
    new.set_header(NodeType::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, ptr, key, &[]);
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - (idx + 2));
}

/// Concatenate two siblings.
pub fn merge(new: &mut Node, left: &Node, right: &Node) {
    let node_type = if left.nkeys() > 0 { left.node_type() } else { right.node_type() };
    new.set_header(node_type, left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys());
    new.append_range(right, left.nkeys(), 0, right.nkeys());
}

/// Encoded size of the first `n` entries of `old` as a node of their own.
fn prefix_bytes(old: &Node, n: usize) -> usize {
    HEADER_SIZE + (POINTER_SIZE + OFFSET_SIZE) * n + old.offset(n)
}

/// Split `old` in two so that `right` fits a page. `left` may still overflow
/// when entries are large, which is why it should be a scratch buffer.
pub fn split2(left: &mut Node, right: &mut Node, old: &Node) {
    let nkeys = old.nkeys();
    assert!(nkeys >= 2, "cannot split a node with {} keys", nkeys);

    let mut nleft = nkeys / 2;
    while nleft > 1 && prefix_bytes(old, nleft) > PAGE_SIZE {
        nleft -= 1;
    }
    let right_bytes = |nleft: usize| old.nbytes() - prefix_bytes(old, nleft) + HEADER_SIZE;
    while nleft < nkeys - 1 && right_bytes(nleft) > PAGE_SIZE {
        nleft += 1;
    }
    let nright = nkeys - nleft;

    left.set_header(old.node_type(), nleft);
    right.set_header(old.node_type(), nright);
    left.append_range(old, 0, 0, nleft);
    right.append_range(old, 0, nleft, nright);

    assert!(right.fits_page(), "right half of a split is {} bytes", right.nbytes());
}

/// Split a node into one, two or three page-sized nodes, in key order.
pub fn split3(old: Node) -> Vec<Node> {
    if old.fits_page() {
        return vec![old];
    }

    let mut left = Node::scratch();
    let mut right = Node::new();
    split2(&mut left, &mut right, &old);
    if left.fits_page() {
        return vec![left, right];
    }

    let mut left_left = Node::new();
    let mut middle = Node::new();
    split2(&mut left_left, &mut middle, &left);
    assert!(left_left.fits_page(), "leftmost third of a split is {} bytes", left_left.nbytes());
    vec![left_left, middle, right]
}

/// Whether a node shrunk by a delete is small enough to consider merging.
pub fn wants_merge(updated: &Node) -> bool {
    updated.nbytes() <= PAGE_SIZE / 4
}

/// Whether `sibling` and `updated` fit in one page once concatenated.
pub fn fits_merge(sibling: &Node, updated: &Node) -> bool {
    sibling.nbytes() + updated.nbytes() - HEADER_SIZE <= PAGE_SIZE
}
