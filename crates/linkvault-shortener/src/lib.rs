//! URL shortener service implementation.
//!
//! [`LinkService`] turns raw caller input into repository calls: it
//! validates URLs, generates candidate codes and parses short codes.
//! Core types are re-exported from `linkvault_core`.

pub mod service;

pub use linkvault_core::{RepositoryError, Result, Shortener};
pub use service::{LinkService, DEFAULT_CANDIDATES};
