use std::collections::HashMap;

use log::trace;

use crate::error::{DbError, DbResult};
use crate::storage::page::PAGE_SIZE;

/// The page allocator the B-tree runs against.
///
/// `get`, `allocate` and `free` are used while a tree operation rebuilds
/// pages. The remaining methods are driven by
/// [`commit`](crate::transaction::commit::commit), in order, once the new
/// root is known.
pub trait PageStore {
    /// Read a page. Unknown IDs are `PageNotFound`.
    fn get(&mut self, ptr: u64) -> DbResult<Vec<u8>>;

    /// Store a new page image and return its ID. The write need not be
    /// durable until the next commit.
    fn allocate(&mut self, page: Vec<u8>) -> DbResult<u64>;

    /// Mark a page as no longer referenced by the tree being built. The ID
    /// must not be handed out again before `release_freed`.
    fn free(&mut self, ptr: u64) -> DbResult<()>;

    /// The root pointer that was durable when the store was opened, or the
    /// last one written by `write_root`.
    fn root(&self) -> u64;

    /// Write every page allocated since the last commit.
    fn write_pages(&mut self) -> DbResult<()>;

    /// Make the written pages durable.
    fn sync_data(&mut self) -> DbResult<()>;

    /// Point the store at a new root.
    fn write_root(&mut self, root: u64) -> DbResult<()>;

    /// Make the root pointer durable.
    fn sync_meta(&mut self) -> DbResult<()>;

    /// The new root is durable: pages freed since the last commit may be reused.
    fn release_freed(&mut self);

    /// The operation failed. Pages freed since the last commit are still in
    /// use. Pages allocated since then are handed out again if the failure
    /// came before `write_root` was attempted, and abandoned otherwise.
    fn rollback(&mut self);
}

/// Page IDs handed back by the tree, held until the commit that stops
/// referencing them is durable.
#[derive(Debug, Default)]
pub struct FreeList {
    reusable: Vec<u64>,
    pending: Vec<u64>,
    /// Reusable IDs handed out since the last release.
    taken: Vec<u64>,
}

impl FreeList {
    pub fn pop(&mut self) -> Option<u64> {
        let ptr = self.reusable.pop()?;
        self.taken.push(ptr);
        Some(ptr)
    }

    pub fn push(&mut self, ptr: u64) {
        self.pending.push(ptr);
    }

    /// Move every pending ID to the reusable list and return them.
    pub fn release(&mut self) -> Vec<u64> {
        let released = std::mem::take(&mut self.pending);
        self.reusable.extend(released.iter().copied());
        self.taken.clear();
        released
    }

    /// Undo everything since the last release. Pending frees are dropped;
    /// taken IDs go back to the reusable list when `reclaim` is set and are
    /// leaked otherwise.
    pub fn abort(&mut self, reclaim: bool) {
        self.pending.clear();
        if reclaim {
            self.reusable.append(&mut self.taken);
        } else {
            self.taken.clear();
        }
    }

    pub fn pending(&self) -> &[u64] {
        &self.pending
    }

    pub fn reusable(&self) -> &[u64] {
        &self.reusable
    }
}

/// An in-memory page arena.
///
/// IDs start at 1. Freed pages stay readable until the commit that releases
/// them, which is when they are dropped from the arena.
#[derive(Debug)]
pub struct MemoryStore {
    pages: HashMap<u64, Vec<u8>>,
    next_id: u64,
    /// `next_id` as of the last commit.
    committed_id: u64,
    root: u64,
    root_written: bool,
    staged: Vec<u64>,
    free: FreeList,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            pages: HashMap::new(),
            next_id: 1,
            committed_id: 1,
            root: 0,
            root_written: false,
            staged: Vec::new(),
            free: FreeList::default(),
        }
    }

    /// Number of pages currently held by the arena.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn contains(&self, ptr: u64) -> bool {
        self.pages.contains_key(&ptr)
    }

    /// Overwrite a page in place. Only useful for simulating corruption.
    pub fn overwrite(&mut self, ptr: u64, page: Vec<u8>) {
        self.pages.insert(ptr, page);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl PageStore for MemoryStore {
    fn get(&mut self, ptr: u64) -> DbResult<Vec<u8>> {
        self.pages.get(&ptr).cloned().ok_or(DbError::PageNotFound(ptr))
    }

    fn allocate(&mut self, page: Vec<u8>) -> DbResult<u64> {
        assert_eq!(page.len(), PAGE_SIZE);
        let ptr = match self.free.pop() {
            Some(ptr) => ptr,
            None => {
                let ptr = self.next_id;
                self.next_id += 1;
                ptr
            }
        };
        trace!("memory store: allocate page {}", ptr);
        self.pages.insert(ptr, page);
        self.staged.push(ptr);
        Ok(ptr)
    }

    fn free(&mut self, ptr: u64) -> DbResult<()> {
        if !self.pages.contains_key(&ptr) {
            return Err(DbError::PageNotFound(ptr));
        }
        trace!("memory store: free page {}", ptr);
        self.free.push(ptr);
        Ok(())
    }

    fn root(&self) -> u64 {
        self.root
    }

    fn write_pages(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn sync_data(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn write_root(&mut self, root: u64) -> DbResult<()> {
        self.root_written = true;
        self.root = root;
        Ok(())
    }

    fn sync_meta(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn release_freed(&mut self) {
        for ptr in self.free.release() {
            self.pages.remove(&ptr);
        }
        self.staged.clear();
        self.committed_id = self.next_id;
        self.root_written = false;
    }

    fn rollback(&mut self) {
        let reclaim = !self.root_written;
        self.free.abort(reclaim);
        if reclaim {
            for ptr in self.staged.drain(..) {
                self.pages.remove(&ptr);
            }
            self.next_id = self.committed_id;
        } else {
            trace!("memory store: abandoning {} pages", self.staged.len());
            self.staged.clear();
        }
        self.root_written = false;
    }
}
