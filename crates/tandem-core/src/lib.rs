//! Tandem Core - Shared wire types, errors, and configuration
//!
//! This crate contains the foundational types used by the Tandem rendezvous
//! server and its clients. It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod ids;
pub mod protocol;

pub use config::{Config, ConfigError, IceConfig, MatchmakingConfig, RelayConfig, ServerConfig};
pub use error::*;
pub use protocol::*;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Maximum occupants of a signaling room
pub const MAX_ROOM_OCCUPANTS: usize = 2;
