//! Error handling module
//!
//! Defines custom error types for the Precursors server, and the machine-readable
//! `reason` strings clients receive in `{confirm: false, reason, message}` responses.

use std::io;

use thiserror::Error;

/// Main error type for the Precursors server
#[derive(Error, Debug)]
pub enum PrecursorsError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Persistence errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Entity lifecycle and behavior errors
    #[error("Entity error: {0}")]
    Entity(#[from] EntityError),

    /// Chat errors
    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Too many connections ({0})")]
    TooManyConnections(usize),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Write buffer full")]
    WriteBufferFull,
}

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid payload for '{message}': {reason}")]
    InvalidPayload { message: String, reason: String },

    #[error("Unrecognized message: {0}")]
    UnrecognizedMessage(String),
}

/// Authentication-specific errors
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("No account specified")]
    BadAccount,

    #[error("Account already logged in")]
    AccountInUse,

    #[error("Incorrect password")]
    BadPassword,

    #[error("Account not found")]
    NotFound,

    #[error("Malformed credential record: {0}")]
    MalformedRecord(String),

    #[error("Password hashing failed: {0}")]
    Hashing(String),
}

/// Persistence-specific errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Combat resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CombatError {
    #[error("Attack range is empty: all attacker and defender stats are zero")]
    DegenerateRange,

    #[error("Roll {roll} outside of attack range [1, {range}]")]
    RollOutOfRange { roll: u64, range: u64 },
}

/// Chat room errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Invalid room name")]
    InvalidRoom,

    #[error("Room does not exist: {0}")]
    NoSuchRoom(String),

    #[error("Not a member of room: {0}")]
    NotMember(String),
}

/// Entity lifecycle and behavior errors
#[derive(Error, Debug)]
pub enum EntityError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error(
        "Failed to create entity from template '{template}' (owner: {owner:?}, state: {initial_state})"
    )]
    CreateFailed {
        template: String,
        owner: Option<String>,
        initial_state: String,
        #[source]
        source: Box<EntityError>,
    },

    #[error("Unrecognized request: {0}")]
    UnrecognizedRequest(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown power: {0}")]
    UnknownPower(String),

    #[error("Entity '{0}' lacks the {1} capability")]
    MissingCapability(String, &'static str),

    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Combat(#[from] CombatError),
}

impl EntityError {
    /// Whether the root cause is a missing record or template
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::TemplateNotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            Self::CreateFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Machine-readable failure reason sent to clients
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) | Self::TemplateNotFound(_) => reason::NOT_FOUND,
            Self::Store(e) if e.is_not_found() => reason::NOT_FOUND,
            Self::CreateFailed { .. } => reason::CREATE_FAILED,
            Self::UnrecognizedRequest(_) => reason::UNRECOGNIZED_REQUEST,
            Self::Validation(_) => reason::VALIDATION_FAILED,
            _ => reason::ERROR,
        }
    }
}

impl AuthError {
    /// Machine-readable failure reason sent to clients
    pub fn reason(&self) -> &'static str {
        match self {
            Self::BadAccount => reason::BAD_ACCOUNT,
            Self::AccountInUse => reason::ACCOUNT_IN_USE,
            Self::BadPassword => reason::BAD_PASSWORD,
            Self::NotFound => reason::NOT_FOUND,
            Self::MalformedRecord(_) | Self::Hashing(_) => reason::ERROR,
        }
    }
}

/// Failure reasons carried in `confirm: false` responses
pub mod reason {
    pub const BAD_ACCOUNT: &str = "bad_account";
    pub const ACCOUNT_IN_USE: &str = "account_in_use";
    pub const BAD_PASSWORD: &str = "bad_password";
    pub const NOT_FOUND: &str = "not_found";
    pub const NOT_IMPLEMENTED: &str = "not_implemented";
    pub const UNRECOGNIZED_REQUEST: &str = "unrecognized_request";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const CREATE_FAILED: &str = "create_failed";
    pub const SAVE_FAILED: &str = "save_failed";
    pub const JOIN_ROOM_FAILED: &str = "join_room_failed";
    pub const LEAVE_ROOM_FAILED: &str = "leave_room_failed";
    pub const NOT_IN_ROOM: &str = "not_in_room";
    pub const ERROR: &str = "error";
}

/// Result type alias for Precursors operations
pub type Result<T> = std::result::Result<T, PrecursorsError>;
