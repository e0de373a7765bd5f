//! # Tether Core Library
//!
//! `tether-core` mirrors local, file-backed conversation sessions to a remote
//! store so work can be resumed from any device.
//!
//! ## Features
//!
//! - **Coalescing sync loop**: concurrent sync requests share one in-flight pass
//! - **Deduplicated upload queue**: one outstanding upload per task and blob
//! - **High-water-mark timestamps**: stale upload confirmations are ignored
//! - **Git snapshots**: head, branch and working-tree patch captured and restored
//! - **Session titles**: derived from the first message or generated by the host
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`git`] - Git working-tree capture and best-effort restore
//! - [`model`] - Remote session, blob and git state types
//! - [`ports`] - Capability traits implemented by the host
//! - [`session`] - State cache, persistence, titles, lifecycle and the facade
//! - [`sync`] - Upload queue and the sync orchestrator
//! - [`token`] - Auth token validity cache
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_core::session::SessionManager;
//!
//! let manager = SessionManager::new(config, remote, paths, host, tasks);
//! manager.handle_file_saved("task-1", BlobKind::UiMessages, path).await;
//! let report = manager.sync().await;
//! println!("synced {} tasks", report.tasks_synced);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod git;
pub mod model;
pub mod ports;
pub mod session;
pub mod sync;
pub mod token;

pub use error::{Error, Result};

/// Schema version of remote session records written by this library
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Default queue length that triggers an early flush
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10;

/// Default maximum size of a captured git patch (5 MiB)
pub const DEFAULT_MAX_PATCH_BYTES: usize = 5 * 1024 * 1024;

/// Default timeout for title generation in seconds
pub const DEFAULT_TITLE_TIMEOUT_SECS: u64 = 30;

/// Default interval between periodic sync passes in seconds
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
