use thiserror::Error;
use std::io;

use crate::storage::page::{MAX_KEY_SIZE, MAX_VAL_SIZE};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("entry too large: key is {key} bytes (max {MAX_KEY_SIZE}), value is {value} bytes (max {MAX_VAL_SIZE})")]
    SizeLimitExceeded { key: usize, value: usize },
    #[error("the empty key is reserved")]
    EmptyKey,
    #[error("page {0} not found")]
    PageNotFound(u64),
    #[error("corrupt tree: {0}")]
    Corruption(String),
    #[error("tree is unusable after an earlier corruption error")]
    Poisoned,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DbError {
    /// True when the tree's own invariants can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Corruption(_) | DbError::PageNotFound(_) | DbError::Poisoned)
    }
}

pub type DbResult<T> = Result<T, DbError>;
