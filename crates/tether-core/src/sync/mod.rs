//! Queue draining.
//!
//! [`SyncQueue`] collects pending uploads as local files change;
//! [`SessionSyncService`] drains it in passes that never overlap.

pub mod queue;
pub mod service;

pub use queue::{FlushHandler, SyncQueue};
pub use service::{SessionSyncService, SkipReason, SyncReport};
