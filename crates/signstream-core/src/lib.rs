//! Signstream Core - shared types, wire protocol, errors, configuration

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;
