//! Core types and traits for the linkvault URL shortener.
//!
//! This crate provides the shared vocabulary used by the storage backends
//! and the shortener service: short codes, owners, link records, the
//! repository contract and the error taxonomy.

pub mod error;
pub mod repository;
pub mod shortcode;
pub mod shortener;
pub mod url;

pub use error::{RepositoryError, Result};
pub use repository::{BatchItem, BatchLink, LinkRecord, LinkRepository, OwnedLink, OwnerId};
pub use shortcode::ShortCode;
pub use shortener::Shortener;
