pub mod storage;
pub mod transaction;
pub mod error;
pub mod config;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use storage::{BTree, MemoryStore, PageStore, Pager, TreeStats};
