//! # mixd-core
//!
//! Core types, tunables, and error handling for the mixd audio server.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use types::*;
