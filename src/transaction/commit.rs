use std::fmt;

use log::{debug, warn};

use crate::error::DbResult;
use crate::storage::store::PageStore;

/// The steps of a commit, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    StagePages,
    FsyncData,
    SwapRoot,
    FsyncMeta,
}

impl CommitPhase {
    pub const ALL: [CommitPhase; 4] = [
        CommitPhase::StagePages,
        CommitPhase::FsyncData,
        CommitPhase::SwapRoot,
        CommitPhase::FsyncMeta,
    ];
}

impl fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitPhase::StagePages => "STAGE_PAGES",
            CommitPhase::FsyncData => "FSYNC_DATA",
            CommitPhase::SwapRoot => "SWAP_ROOT",
            CommitPhase::FsyncMeta => "FSYNC_META",
        };
        f.write_str(name)
    }
}

/// Make `root` the durable root of `store`.
///
/// Data pages are written and synced before the root pointer is touched, so a
/// crash before `SWAP_ROOT` leaves the old root intact with the new pages as
/// unreachable garbage. Pages freed by the operation become reusable only
/// after the last phase succeeds.
pub fn commit<S: PageStore + ?Sized>(store: &mut S, root: u64) -> DbResult<()> {
    for phase in CommitPhase::ALL {
        let res = match phase {
            CommitPhase::StagePages => store.write_pages(),
            CommitPhase::FsyncData => store.sync_data(),
            CommitPhase::SwapRoot => store.write_root(root),
            CommitPhase::FsyncMeta => store.sync_meta(),
        };
        if let Err(e) = res {
            warn!("commit of root {} failed at {}: {}", root, phase, e);
            return Err(e);
        }
        debug!("commit: {} done (root {})", phase, root);
    }
    store.release_freed();
    Ok(())
}
