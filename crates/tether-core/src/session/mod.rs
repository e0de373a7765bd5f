//! Session state, persistence, titles and lifecycle.
//!
//! [`SessionManager`] wires these together with the sync service and is the
//! entry point for hosts.

pub mod lifecycle;
pub mod manager;
pub mod persistence;
pub mod state;
pub mod title;

pub use lifecycle::SessionLifecycleService;
pub use manager::{PeriodicSync, SessionManager};
pub use persistence::{LastSession, SessionPersistenceManager, WorkspaceSessionState};
pub use state::{SessionStateManager, PENDING_TITLE};
pub use title::SessionTitleService;
