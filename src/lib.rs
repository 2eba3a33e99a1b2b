//! Snapshot and switch engine for keeping several identities of a
//! single-account desktop application.
//!
//! - `store`: snapshot index and payload directories
//! - `process`: finding, stopping and relaunching the host application
//! - `engine`: the switch sequence and automatic safety backups

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod logging;
pub mod platform;
pub mod process;
pub mod store;

pub use error::{Error, Result};
