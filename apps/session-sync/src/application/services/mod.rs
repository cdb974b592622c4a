//! Application Services
//!
//! Long-running background services: the session poller, the per-source
//! manager that pairs it with a realtime feed, and the top-level sync
//! manager.

mod session_poller;
mod source_manager;
mod sync_manager;

pub use session_poller::{PollerConfig, SessionCallback, SessionPoller};
pub use source_manager::{
    ManagedSource, SourceManager, SourceManagerConfig, SourceManagerError, SourceStatus,
};
pub use sync_manager::{SyncCompleteCallback, SyncManager, SyncManagerConfig, SyncManagerError};
