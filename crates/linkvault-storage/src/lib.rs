//! Storage backends for linkvault.
//!
//! Two implementations of [`LinkRepository`](linkvault_core::LinkRepository)
//! live here: [`InMemoryRepository`], optionally mirrored to a [`LinkLog`],
//! and [`MySqlRepository`] with its [`DeletionReconciler`]. [`Repository`]
//! picks one of them at startup.

mod batch;

pub mod backend;
pub mod log;
pub mod memory;
pub mod mysql;
pub mod pool;
pub mod reconciler;

pub use backend::{Repository, StorageConfig, StorageKind};
pub use log::{LinkLog, LinkLogError, LogEntry};
pub use memory::InMemoryRepository;
pub use mysql::MySqlRepository;
pub use pool::{ErrorClass, ResilientPool, RetryPolicy};
pub use reconciler::{DeletionReconciler, ReconciledBatch, ReconcilerConfig, ReconcilerHandle};
