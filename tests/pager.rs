use aerokv::storage::page::PAGE_SIZE;
use aerokv::storage::store::PageStore;
use aerokv::transaction::commit::CommitPhase;
use aerokv::{BTree, Config, DbError, DbResult, Pager};
use std::fs;
use std::io;
use std::path::Path;
use tempfile::tempdir;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_tree(path: &Path) -> BTree<Pager> {
    init();
    let pager = Pager::open_with(path, Config::default().fsync(false)).unwrap();
    BTree::open(pager).unwrap()
}

fn key(i: u32) -> Vec<u8> {
    format!("user:{:05}", i).into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("payload-{}-", i).repeat(1 + (i % 7) as usize).into_bytes()
}

#[test]
fn data_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.aerokv");
    {
        let mut tree = open_tree(&path);
        for i in 0..500 {
            tree.insert(&key(i), &value(i)).unwrap();
        }
        for i in (0..500).step_by(5) {
            assert!(tree.delete(&key(i)).unwrap());
        }
    }

    let mut tree = open_tree(&path);
    for i in 0..500 {
        let expected = if i % 5 == 0 { None } else { Some(value(i)) };
        assert_eq!(tree.get(&key(i)).unwrap(), expected);
    }
    let stats = tree.stats().unwrap();
    assert_eq!(stats.keys, 400);
    assert!(stats.height >= 2);
}

#[test]
fn default_config_fsyncs_and_reopens() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable.aerokv");
    {
        let mut tree = BTree::open(Pager::open(&path).unwrap()).unwrap();
        tree.insert(b"k", b"v").unwrap();
    }
    let mut tree = BTree::open(Pager::open(&path).unwrap()).unwrap();
    assert_eq!(tree.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn freed_pages_are_reused() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reuse.aerokv");
    let mut tree = open_tree(&path);
    for round in 0..100u32 {
        tree.insert(b"counter", round.to_string().as_bytes()).unwrap();
    }
    assert_eq!(tree.get(b"counter").unwrap(), Some(b"99".to_vec()));
    assert!(tree.store().num_pages() <= 3, "{} pages", tree.store().num_pages());
}

#[test]
fn emptied_tree_reopens_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.aerokv");
    {
        let mut tree = open_tree(&path);
        tree.insert(b"only", b"one").unwrap();
        assert!(tree.delete(b"only").unwrap());
        assert!(tree.is_empty());
    }
    let mut tree = open_tree(&path);
    assert!(tree.is_empty());
    assert_eq!(tree.get(b"only").unwrap(), None);
}

#[test]
fn truncated_meta_page_is_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("short.aerokv");
    fs::write(&path, b"AEROKV01").unwrap();
    assert!(matches!(Pager::open(&path), Err(DbError::Corruption(_))));
}

#[test]
fn garbage_data_page_poisons_the_tree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.aerokv");
    let root = {
        let mut tree = open_tree(&path);
        tree.insert(b"a", b"1").unwrap();
        tree.root()
    };

    let mut bytes = fs::read(&path).unwrap();
    let start = root as usize * PAGE_SIZE;
    bytes[start] = 9;
    fs::write(&path, bytes).unwrap();

    init();
    let pager = Pager::open_with(&path, Config::default().fsync(false)).unwrap();
    assert!(matches!(BTree::open(pager), Err(DbError::Corruption(_))));
}

/// Wraps a pager and refuses to move the root pointer, as if the process
/// died between writing the data pages and swapping the root.
struct Torn(Pager);

impl PageStore for Torn {
    fn get(&mut self, ptr: u64) -> DbResult<Vec<u8>> {
        self.0.get(ptr)
    }
    fn allocate(&mut self, page: Vec<u8>) -> DbResult<u64> {
        self.0.allocate(page)
    }
    fn free(&mut self, ptr: u64) -> DbResult<()> {
        self.0.free(ptr)
    }
    fn root(&self) -> u64 {
        self.0.root()
    }
    fn write_pages(&mut self) -> DbResult<()> {
        self.0.write_pages()
    }
    fn sync_data(&mut self) -> DbResult<()> {
        self.0.sync_data()
    }
    fn write_root(&mut self, _root: u64) -> DbResult<()> {
        Err(DbError::Io(io::Error::new(io::ErrorKind::Other, format!("crash before {}", CommitPhase::SwapRoot))))
    }
    fn sync_meta(&mut self) -> DbResult<()> {
        self.0.sync_meta()
    }
    fn release_freed(&mut self) {
        self.0.release_freed()
    }
    fn rollback(&mut self) {
        self.0.rollback()
    }
}

#[test]
fn torn_commit_reopens_at_the_old_root() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("torn.aerokv");
    let old_root = {
        let mut tree = open_tree(&path);
        for i in 0..50 {
            tree.insert(&key(i), &value(i)).unwrap();
        }
        tree.root()
    };

    {
        let pager = Pager::open_with(&path, Config::default().fsync(false)).unwrap();
        let pages = pager.num_pages();
        let mut tree = BTree::open(Torn(pager)).unwrap();
        for _ in 0..3 {
            assert!(tree.insert(&key(1000), b"lost").is_err());
            assert!(tree.delete(&key(3)).is_err());
        }
        assert_eq!(tree.root(), old_root);
        assert_eq!(tree.store().0.num_pages(), pages);
    }

    let mut tree = open_tree(&path);
    assert_eq!(tree.root(), old_root);
    assert_eq!(tree.get(&key(1000)).unwrap(), None);
    assert_eq!(tree.get(&key(3)).unwrap(), Some(value(3)));
    assert_eq!(tree.stats().unwrap().keys, 50);
}
