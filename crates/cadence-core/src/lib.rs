//! `cadence-core`: configuration and error types shared by every Cadence crate.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
