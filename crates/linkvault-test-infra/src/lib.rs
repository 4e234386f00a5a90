//! Disposable containers for linkvault integration tests.

mod error;
pub mod mysql;

pub use error::{Result, TestInfraError};
