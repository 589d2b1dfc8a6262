pub mod page;
pub mod node;
pub mod store;
pub mod pager;
pub mod btree;

pub use btree::{BTree, TreeStats};
pub use pager::Pager;
pub use store::{MemoryStore, PageStore};
