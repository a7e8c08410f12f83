//! Shared configuration for the tickward workspace.

pub mod config;
pub mod error;

pub use config::TickwardConfig;
pub use error::{CoreError, Result};
