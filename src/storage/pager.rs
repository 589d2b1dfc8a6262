use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info, warn};

use crate::config::Config;
use crate::error::{DbError, DbResult};
use crate::storage::page::PAGE_SIZE;
use crate::storage::store::{FreeList, PageStore};

// ┌─────────────────────────────────────────────────────────────┐
// │ Meta page (page 0)                                          │
// │────────┬────────┬───────────────────────────────────────────│
// │ Offset │ Length │ Description                               │
// │   0    │   8    │ MAGIC "AEROKV01"                          │
// │   8    │   8    │ ROOT (u64): root page of the tree, 0=none │
// │   16   │   8    │ NUM_PAGES (u64): pages in use incl. meta  │
// └────────┴────────┴───────────────────────────────────────────┘
// Data pages follow at `page_num * PAGE_SIZE`.

pub const META_MAGIC: &[u8; 8] = b"AEROKV01";
const META_ROOT_OFFSET: usize = 8;
const META_NUM_PAGES_OFFSET: usize = 16;

/// A single 4 KiB page of data.
pub struct Page {
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new() -> Self {
        Page { data: [0; PAGE_SIZE] }
    }

    fn from_bytes(bytes: &[u8]) -> Box<Self> {
        let mut page = Box::new(Page::new());
        page.data.copy_from_slice(bytes);
        page
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::new()
    }
}

/// Pager: a file-backed [`PageStore`].
///
/// Newly allocated pages are kept in memory until the commit protocol asks
/// for them to be written; nothing on disk changes before that. Page 0 holds
/// the root pointer and is only rewritten by `write_root`.
pub struct Pager {
    file: File,
    config: Config,

    /// The root that the meta page points at.
    root: u64,

    /// Pages in use, including the meta page. New IDs come from here when
    /// the free list is empty.
    num_pages: u64,

    /// `num_pages` as of the last commit, restored by a rollback that never
    /// reached the root swap.
    committed_pages: u64,

    /// Set once `write_root` starts. After that the meta page may already
    /// name the new root, so nothing allocated since the last commit can be
    /// handed out again.
    root_written: bool,

    /// A very basic read cache: `cache[page_num] = Some(Box<Page>)` if that page is loaded.
    cache: Vec<Option<Box<Page>>>,

    /// Pages allocated since the last commit and not yet written.
    dirty: BTreeMap<u64, Box<Page>>,

    free: FreeList,
}

impl Pager {
    /// Open (or create) the database file at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Pager::open_with(path, Config::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: Config) -> DbResult<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(config.create)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let mut pager = if file_len == 0 {
            info!("creating database file {}", path.display());
            let mut pager = Pager {
                file,
                config,
                root: 0,
                num_pages: 1,
                committed_pages: 1,
                root_written: false,
                cache: Vec::new(),
                dirty: BTreeMap::new(),
                free: FreeList::default(),
            };
            pager.write_meta()?;
            pager.sync()?;
            if config.fsync {
                sync_parent_dir(path)?;
            }
            pager
        } else {
            let mut meta = [0u8; PAGE_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut meta)
                .map_err(|e| corrupt_if_short(e, "meta page is truncated"))?;
            let (root, num_pages) = decode_meta(&meta)?;
            if num_pages == 0 || root >= num_pages {
                return Err(DbError::Corruption(format!(
                    "meta page points at root {} of {} pages",
                    root, num_pages
                )));
            }
            info!(
                "opened database file {} (root {}, {} pages)",
                path.display(),
                root,
                num_pages
            );
            Pager {
                file,
                config,
                root,
                num_pages,
                committed_pages: num_pages,
                root_written: false,
                cache: Vec::new(),
                dirty: BTreeMap::new(),
                free: FreeList::default(),
            }
        };
        pager.cache.resize_with(pager.num_pages as usize, || None);
        Ok(pager)
    }

    /// How many pages the pager knows about right now, including the meta page.
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    fn write_meta(&mut self) -> io::Result<()> {
        let mut meta = Page::new();
        meta.data[0..8].copy_from_slice(META_MAGIC);
        meta.data[META_ROOT_OFFSET..META_ROOT_OFFSET + 8].copy_from_slice(&self.root.to_le_bytes());
        meta.data[META_NUM_PAGES_OFFSET..META_NUM_PAGES_OFFSET + 8]
            .copy_from_slice(&self.num_pages.to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&meta.data)?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        if self.config.fsync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn read_from_disk(&mut self, page_num: u64) -> DbResult<Box<Page>> {
        let mut page = Box::new(Page::new());
        let offset = page_num * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .read_exact(&mut page.data)
            .map_err(|e| corrupt_if_short(e, "data page is truncated"))?;
        Ok(page)
    }
}

impl PageStore for Pager {
    fn get(&mut self, ptr: u64) -> DbResult<Vec<u8>> {
        if ptr == 0 || ptr >= self.num_pages {
            return Err(DbError::PageNotFound(ptr));
        }
        if let Some(page) = self.dirty.get(&ptr) {
            return Ok(page.data.to_vec());
        }

        let idx = ptr as usize;
        if self.cache.len() <= idx {
            self.cache.resize_with(idx + 1, || None);
        }
        if self.cache[idx].is_none() {
            let page = self.read_from_disk(ptr)?;
            self.cache[idx] = Some(page);
        }
        match &self.cache[idx] {
            Some(page) => Ok(page.data.to_vec()),
            None => Err(DbError::PageNotFound(ptr)),
        }
    }

    fn allocate(&mut self, page: Vec<u8>) -> DbResult<u64> {
        assert_eq!(page.len(), PAGE_SIZE);
        let ptr = match self.free.pop() {
            Some(ptr) => ptr,
            None => {
                let ptr = self.num_pages;
                self.num_pages += 1;
                ptr
            }
        };
        if let Some(slot) = self.cache.get_mut(ptr as usize) {
            *slot = None;
        }
        self.dirty.insert(ptr, Page::from_bytes(&page));
        Ok(ptr)
    }

    fn free(&mut self, ptr: u64) -> DbResult<()> {
        if ptr == 0 || ptr >= self.num_pages {
            return Err(DbError::PageNotFound(ptr));
        }
        self.free.push(ptr);
        Ok(())
    }

    fn root(&self) -> u64 {
        self.root
    }

    fn write_pages(&mut self) -> DbResult<()> {
        debug!("pager: writing {} pages", self.dirty.len());
        let dirty = std::mem::take(&mut self.dirty);
        if self.cache.len() < self.num_pages as usize {
            self.cache.resize_with(self.num_pages as usize, || None);
        }
        for (ptr, page) in dirty {
            let offset = ptr * PAGE_SIZE as u64;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&page.data)?;
            self.cache[ptr as usize] = Some(page);
        }
        self.file.flush()?;
        Ok(())
    }

    fn sync_data(&mut self) -> DbResult<()> {
        self.sync()?;
        Ok(())
    }

    fn write_root(&mut self, root: u64) -> DbResult<()> {
        self.root_written = true;
        self.root = root;
        self.write_meta()?;
        Ok(())
    }

    fn sync_meta(&mut self) -> DbResult<()> {
        self.sync()?;
        Ok(())
    }

    fn release_freed(&mut self) {
        let released = self.free.release();
        for ptr in released {
            if let Some(slot) = self.cache.get_mut(ptr as usize) {
                *slot = None;
            }
        }
        self.committed_pages = self.num_pages;
        self.root_written = false;
    }

    fn rollback(&mut self) {
        let reclaim = !self.root_written;
        self.free.abort(reclaim);
        self.dirty.clear();
        if reclaim {
            self.num_pages = self.committed_pages;
        } else {
            warn!(
                "pager: root swap may have reached disk, abandoning pages up to {}",
                self.num_pages
            );
        }
        self.root_written = false;
    }
}

fn decode_meta(meta: &[u8]) -> DbResult<(u64, u64)> {
    if &meta[0..8] != META_MAGIC {
        return Err(DbError::Corruption("meta page has a bad magic number".into()));
    }
    let mut root = [0u8; 8];
    root.copy_from_slice(&meta[META_ROOT_OFFSET..META_ROOT_OFFSET + 8]);
    let mut num_pages = [0u8; 8];
    num_pages.copy_from_slice(&meta[META_NUM_PAGES_OFFSET..META_NUM_PAGES_OFFSET + 8]);
    Ok((u64::from_le_bytes(root), u64::from_le_bytes(num_pages)))
}

fn corrupt_if_short(err: io::Error, what: &str) -> DbError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        DbError::Corruption(what.to_string())
    } else {
        DbError::Io(err)
    }
}

/// Make the directory entry of a newly created file durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
