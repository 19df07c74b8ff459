//! Networking module
//!
//! This module handles all network-related functionality for the Precursors server:
//! - WebSocket handling for browser clients
//! - JSON message envelopes
//! - Session management and the logged-in accounts registry
//! - Connection lifecycle

pub mod handler;
pub mod message;
pub mod session;

pub use handler::ConnectionHandler;
pub use message::{Inbound, MessageKind, Outbound};
pub use session::{EntityChange, Session, SessionId, SessionManager, SessionState};
