// ┌──────────────────────────────────────────────────────────────────────────┐
// │ Offset        │ Length      │ Description                                │
// │───────────────┼─────────────┼────────────────────────────────────────────│
// │   0           │   2         │ NODE_TYPE (1 = internal, 2 = leaf)         │
// │   2           │   2         │ NKEYS (u16)                                │
// │   4           │   8 × n     │ child page pointers (u64, zero on leaves)  │
// │   4 + 8n      │   2 × n     │ offsets: slot j holds the end of entry j   │
// │   4 + 10n     │   ...       │ key-value entries                          │
// └──────────────────────────────────────────────────────────────────────────┘
//
// ┌──────────────────────────────────────────────────┐
// │ KEY_LEN (u16) │ VAL_LEN (u16) │ KEY │ VAL        │
// └──────────────────────────────────────────────────┘
//
// Offsets are relative to the start of the key-value region. offsets[0] is
// always 0 and is not stored.

use std::fmt;

use crate::error::{DbError, DbResult};

pub const PAGE_SIZE: usize = 4096;

pub const NODE_TYPE_OFFSET: usize = 0; // 2 bytes (u16)
pub const NKEYS_OFFSET: usize     = 2; // 2 bytes (u16)
pub const HEADER_SIZE: usize      = 4;

pub const POINTER_SIZE: usize   = 8;
pub const OFFSET_SIZE: usize    = 2;
pub const KV_HEADER_SIZE: usize = 4;

/// Largest key accepted by the tree, inclusive.
pub const MAX_KEY_SIZE: usize = 999;
/// Largest value accepted by the tree, inclusive.
pub const MAX_VAL_SIZE: usize = 2999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeType {
    Internal = 1,
    Leaf = 2,
}

impl NodeType {
    pub fn from_tag(tag: u16) -> Option<NodeType> {
        match tag {
            1 => Some(NodeType::Internal),
            2 => Some(NodeType::Leaf),
            _ => None,
        }
    }
}

/// A B-tree node encoded in a byte buffer.
///
/// Persisted nodes are exactly one page. While a node is being rebuilt it may
/// live in a two-page scratch buffer and overflow a page temporarily; it must
/// be split before it is handed to a page store.
#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    data: Vec<u8>,
}

impl Node {
    /// A zeroed single-page buffer.
    pub fn new() -> Self {
        Node { data: vec![0; PAGE_SIZE] }
    }

    /// A zeroed two-page buffer for nodes that may overflow before a split.
    pub fn scratch() -> Self {
        Node { data: vec![0; 2 * PAGE_SIZE] }
    }

    /// Decode a page read from a store, checking every structural invariant
    /// the accessors rely on.
    pub fn decode(data: Vec<u8>) -> DbResult<Self> {
        if data.len() != PAGE_SIZE {
            return Err(DbError::Corruption(format!(
                "page is {} bytes, expected {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let node = Node { data };

        let tag = node.read_u16(NODE_TYPE_OFFSET);
        if NodeType::from_tag(tag).is_none() {
            return Err(DbError::Corruption(format!("bad node type {}", tag)));
        }

        let nkeys = node.nkeys();
        let region = node.kv_region_start();
        if region > PAGE_SIZE {
            return Err(DbError::Corruption(format!(
                "{} keys do not fit in a page",
                nkeys
            )));
        }

        let mut prev = 0usize;
        for i in 1..=nkeys {
            let end = node.offset(i);
            if end < prev + KV_HEADER_SIZE || region + end > PAGE_SIZE {
                return Err(DbError::Corruption(format!(
                    "offset {} of entry {} is out of bounds",
                    end,
                    i - 1
                )));
            }
            let pos = region + prev;
            let klen = node.read_u16(pos) as usize;
            let vlen = node.read_u16(pos + 2) as usize;
            if KV_HEADER_SIZE + klen + vlen != end - prev {
                return Err(DbError::Corruption(format!(
                    "entry {} lengths ({} + {}) disagree with its offsets",
                    i - 1,
                    klen,
                    vlen
                )));
            }
            prev = end;
        }

        for i in 1..nkeys {
            if node.key(i - 1) >= node.key(i) {
                return Err(DbError::Corruption(format!(
                    "keys at {} and {} are not strictly increasing",
                    i - 1,
                    i
                )));
            }
        }

        Ok(node)
    }

    fn read_u16(&self, pos: usize) -> u16 {
        u16::from_le_bytes([self.data[pos], self.data[pos + 1]])
    }

    fn write_u16(&mut self, pos: usize, val: u16) {
        self.data[pos..pos + 2].copy_from_slice(&val.to_le_bytes());
    }

    pub fn node_type(&self) -> NodeType {
        let tag = self.read_u16(NODE_TYPE_OFFSET);
        match NodeType::from_tag(tag) {
            Some(node_type) => node_type,
            None => panic!("bad node type {}", tag),
        }
    }

    pub fn nkeys(&self) -> usize {
        self.read_u16(NKEYS_OFFSET) as usize
    }

    pub fn set_header(&mut self, node_type: NodeType, nkeys: usize) {
        assert!(nkeys <= u16::MAX as usize);
        self.write_u16(NODE_TYPE_OFFSET, node_type as u16);
        self.write_u16(NKEYS_OFFSET, nkeys as u16);
    }

    pub fn ptr(&self, idx: usize) -> u64 {
        assert!(idx < self.nkeys(), "pointer {} out of {}", idx, self.nkeys());
        let pos = HEADER_SIZE + POINTER_SIZE * idx;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[pos..pos + 8]);
        u64::from_le_bytes(bytes)
    }

    pub fn set_ptr(&mut self, idx: usize, ptr: u64) {
        assert!(idx < self.nkeys(), "pointer {} out of {}", idx, self.nkeys());
        let pos = HEADER_SIZE + POINTER_SIZE * idx;
        self.data[pos..pos + 8].copy_from_slice(&ptr.to_le_bytes());
    }

    fn kv_region_start(&self) -> usize {
        HEADER_SIZE + (POINTER_SIZE + OFFSET_SIZE) * self.nkeys()
    }

    fn offset_pos(&self, idx: usize) -> usize {
        assert!(1 <= idx && idx <= self.nkeys());
        HEADER_SIZE + POINTER_SIZE * self.nkeys() + OFFSET_SIZE * (idx - 1)
    }

    /// Byte length of entries `[0, idx)` within the key-value region.
    pub fn offset(&self, idx: usize) -> usize {
        if idx == 0 {
            return 0;
        }
        self.read_u16(self.offset_pos(idx)) as usize
    }

    pub fn set_offset(&mut self, idx: usize, offset: usize) {
        assert!(offset <= u16::MAX as usize);
        let pos = self.offset_pos(idx);
        self.write_u16(pos, offset as u16);
    }

    /// Absolute position of entry `idx`; `kv_pos(nkeys())` is the end of the node.
    pub fn kv_pos(&self, idx: usize) -> usize {
        assert!(idx <= self.nkeys());
        self.kv_region_start() + self.offset(idx)
    }

    pub fn key(&self, idx: usize) -> &[u8] {
        assert!(idx < self.nkeys(), "key {} out of {}", idx, self.nkeys());
        let pos = self.kv_pos(idx);
        let klen = self.read_u16(pos) as usize;
        &self.data[pos + KV_HEADER_SIZE..pos + KV_HEADER_SIZE + klen]
    }

    pub fn value(&self, idx: usize) -> &[u8] {
        assert!(idx < self.nkeys(), "value {} out of {}", idx, self.nkeys());
        let pos = self.kv_pos(idx);
        let klen = self.read_u16(pos) as usize;
        let vlen = self.read_u16(pos + 2) as usize;
        let start = pos + KV_HEADER_SIZE + klen;
        &self.data[start..start + vlen]
    }

    /// Encoded size of the node.
    pub fn nbytes(&self) -> usize {
        self.kv_pos(self.nkeys())
    }

    pub fn fits_page(&self) -> bool {
        self.nbytes() <= PAGE_SIZE
    }

    /// Write entry `idx` and record where the next entry starts. Entries must
    /// be appended in order since each one is placed after `offset(idx)`.
    pub fn append_kv(&mut self, idx: usize, ptr: u64, key: &[u8], val: &[u8]) {
        self.set_ptr(idx, ptr);

        let pos = self.kv_pos(idx);
        self.write_u16(pos, key.len() as u16);
        self.write_u16(pos + 2, val.len() as u16);

        let start = pos + KV_HEADER_SIZE;
        self.data[start..start + key.len()].copy_from_slice(key);
        self.data[start + key.len()..start + key.len() + val.len()].copy_from_slice(val);

        let next = self.offset(idx) + KV_HEADER_SIZE + key.len() + val.len();
        self.set_offset(idx + 1, next);
    }

    /// Copy `n` entries of `old` starting at `src` into slots starting at `dst`.
    pub fn append_range(&mut self, old: &Node, dst: usize, src: usize, n: usize) {
        for i in 0..n {
            self.append_kv(dst + i, old.ptr(src + i), old.key(src + i), old.value(src + i));
        }
    }

    /// The page image of this node, trimmed to `PAGE_SIZE`.
    pub fn into_page(mut self) -> Vec<u8> {
        assert!(
            self.fits_page(),
            "node of {} bytes does not fit a page",
            self.nbytes()
        );
        self.data.truncate(PAGE_SIZE);
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::new()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("type", &NodeType::from_tag(self.read_u16(NODE_TYPE_OFFSET)))
            .field("nkeys", &self.nkeys())
            .field("nbytes", &self.nbytes())
            .finish()
    }
}
