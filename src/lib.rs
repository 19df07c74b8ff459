//! Precursors Game Server Library
//!
//! This library provides the core functionality for the Precursors game server:
//! live entities composed from capability layers, throttled state replication,
//! a fixed-rate physics loop, and the session state machine binding a WebSocket
//! connection to an account, a character and an inhabited entity.
//!
//! ## Modules
//!
//! - `auth` - Credential verification (Argon2)
//! - `chat` - Chat rooms
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions
//! - `game` - Entities, capabilities, powers, the entity manager and persistence
//! - `net` - Network handling and session management
//! - `physics` - Rigid-body simulation, controller and physics loop

pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod game;
pub mod net;
pub mod physics;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{PrecursorsError, Result};
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
