//! Core types shared across the cutflow workspace.

pub mod error;

pub use error::{Error, Result};

/// Crate version, recorded in emitted artifacts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
