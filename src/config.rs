/// Options for opening a file-backed [`Pager`](crate::storage::pager::Pager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Issue real `fsync` calls during commit. Turning this off keeps the
    /// write ordering but gives up durability; useful for tests.
    pub fsync: bool,
    /// Create the database file if it does not exist yet.
    pub create: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config { fsync: true, create: true }
    }
}

impl Config {
    pub fn fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }
}
