//! Session management module
//!
//! Manages client sessions including:
//! - Session state machine (unauthenticated -> authenticated -> character selected)
//! - Per-message handler slots (one-shot or permanent)
//! - Per-session data (account, character, inhabited entity)
//! - The logged-in accounts registry
//! - Fan-out of entity notifications to sessions in the world, holding back
//!   changes that do not fit the outbound buffer until it drains

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::message::{names, MessageKind, Outbound};
use crate::error::NetworkError;
use crate::game::entity::{Entity, EntityId};
use crate::game::manager::EntityListener;
use crate::game::persistence::{AccountRecord, CharacterRecord};

/// Unique session identifier
pub type SessionId = u64;

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connected, waiting for `login`
    Unauthenticated,
    /// Logged in, waiting for `select character`
    Authenticated,
    /// Inhabiting an entity
    CharacterSelected,
    /// Transport gone; every handler is inert
    Disconnected,
}

impl SessionState {
    /// Check if the session is still active
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }

    /// Check if the session receives entity replication
    pub fn in_world(&self) -> bool {
        matches!(self, SessionState::CharacterSelected)
    }

    /// Get a human-readable name for the state
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "Unauthenticated",
            SessionState::Authenticated => "Authenticated",
            SessionState::CharacterSelected => "CharacterSelected",
            SessionState::Disconnected => "Disconnected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Registration state of one inbound message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerSlot {
    /// Messages of this kind are not accepted
    #[default]
    Unregistered,
    /// Accepted once; taking it unregisters the slot
    OneShot,
    /// Accepted until unbound
    Permanent,
}

/// A replication message for one entity
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    /// Full projection (`create entity`)
    Created(Map<String, Value>),
    /// Changed fields (`update entity`)
    Updated(Map<String, Value>),
    /// `destroy entity`
    Destroyed,
}

impl EntityChange {
    pub fn created(payload: &Value) -> Self {
        EntityChange::Created(payload.as_object().cloned().unwrap_or_default())
    }

    pub fn updated(payload: &Value) -> Self {
        EntityChange::Updated(payload.as_object().cloned().unwrap_or_default())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            EntityChange::Created(_) => names::CREATE_ENTITY,
            EntityChange::Updated(_) => names::UPDATE_ENTITY,
            EntityChange::Destroyed => names::DESTROY_ENTITY,
        }
    }

    fn payload(&self, entity_id: &str) -> Value {
        let mut payload = match self {
            EntityChange::Created(fields) | EntityChange::Updated(fields) => fields.clone(),
            EntityChange::Destroyed => Map::new(),
        };
        payload.insert("id".to_string(), Value::String(entity_id.to_string()));
        Value::Object(payload)
    }

    /// Fold a later change into one still waiting to be sent
    fn merge(self, later: EntityChange) -> EntityChange {
        match (self, later) {
            (_, EntityChange::Created(fields)) => EntityChange::Created(fields),
            (_, EntityChange::Destroyed) => EntityChange::Destroyed,
            (EntityChange::Created(mut fields), EntityChange::Updated(changed)) => {
                fields.extend(changed);
                EntityChange::Created(fields)
            }
            (EntityChange::Updated(mut fields), EntityChange::Updated(changed)) => {
                fields.extend(changed);
                EntityChange::Updated(fields)
            }
            (EntityChange::Destroyed, EntityChange::Updated(_)) => EntityChange::Destroyed,
        }
    }
}

/// A connected client session
pub struct Session {
    /// Unique session identifier
    pub id: SessionId,
    /// Remote address of the client, if known
    pub address: Option<SocketAddr>,
    /// Current session state
    state: RwLock<SessionState>,
    /// Handler slot per message kind
    slots: Mutex<HashMap<MessageKind, HandlerSlot>>,
    /// Account (set after login)
    account: RwLock<Option<AccountRecord>>,
    /// Character (set after selection)
    character: RwLock<Option<CharacterRecord>>,
    /// Inhabited entity (set after selection)
    entity_id: RwLock<Option<EntityId>>,
    /// Entity changes that did not fit the outbound buffer, newest merged in
    ///
    /// Held while entering the world and while queueing any replication
    /// message, so that replication reaches the client in order.
    backlog: Mutex<HashMap<EntityId, EntityChange>>,
    /// Time of session creation
    pub created_at: Instant,
    /// Time of last activity
    last_activity: RwLock<Instant>,
    /// Outbound message channel, drained by the connection's writer task
    outbound_tx: mpsc::Sender<Outbound>,
}

impl Session {
    /// Create a new session listening once for `login` and `create account`
    pub fn new(id: SessionId, address: Option<SocketAddr>, outbound_tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        let session = Self {
            id,
            address,
            state: RwLock::new(SessionState::Unauthenticated),
            slots: Mutex::new(HashMap::new()),
            account: RwLock::new(None),
            character: RwLock::new(None),
            entity_id: RwLock::new(None),
            backlog: Mutex::new(HashMap::new()),
            created_at: now,
            last_activity: RwLock::new(now),
            outbound_tx,
        };
        session.arm_once(MessageKind::Login);
        session.arm_once(MessageKind::CreateAccount);
        session
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Set the session state; a disconnected session stays disconnected
    pub fn set_state(&self, new_state: SessionState) -> bool {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            if old == SessionState::Disconnected {
                return false;
            }
            *state = new_state;
            old
        };
        debug!(
            session_id = self.id,
            old_state = %old_state,
            new_state = %new_state,
            "Session state changed"
        );
        true
    }

    /// Check if session is active
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Transition to `Disconnected`; returns false if already there
    pub fn mark_disconnected(&self) -> bool {
        {
            let mut state = self.state.write();
            if *state == SessionState::Disconnected {
                return false;
            }
            *state = SessionState::Disconnected;
        }
        self.slots.lock().clear();
        self.backlog.lock().clear();
        debug!(session_id = self.id, "Session marked disconnected");
        true
    }

    // --- handler slots ---

    pub fn slot(&self, kind: MessageKind) -> HandlerSlot {
        if !self.is_active() {
            return HandlerSlot::Unregistered;
        }
        self.slots.lock().get(&kind).copied().unwrap_or_default()
    }

    fn set_slot(&self, kind: MessageKind, slot: HandlerSlot) {
        if !self.is_active() {
            return;
        }
        let mut slots = self.slots.lock();
        match slot {
            HandlerSlot::Unregistered => {
                slots.remove(&kind);
            }
            _ => {
                slots.insert(kind, slot);
            }
        }
    }

    /// Accept the next message of this kind only
    pub fn arm_once(&self, kind: MessageKind) {
        self.set_slot(kind, HandlerSlot::OneShot);
    }

    /// Accept messages of this kind until unbound
    pub fn bind_permanent(&self, kind: MessageKind) {
        self.set_slot(kind, HandlerSlot::Permanent);
    }

    pub fn unbind(&self, kind: MessageKind) {
        self.set_slot(kind, HandlerSlot::Unregistered);
    }

    /// Claim the slot for an incoming message, consuming it if one-shot
    pub fn take_slot(&self, kind: MessageKind) -> HandlerSlot {
        if !self.is_active() {
            return HandlerSlot::Unregistered;
        }
        let mut slots = self.slots.lock();
        match slots.get(&kind).copied().unwrap_or_default() {
            HandlerSlot::OneShot => {
                slots.remove(&kind);
                HandlerSlot::OneShot
            }
            other => other,
        }
    }

    // --- session data ---

    pub fn account(&self) -> Option<AccountRecord> {
        self.account.read().clone()
    }

    pub fn account_email(&self) -> Option<String> {
        self.account.read().as_ref().map(|a| a.email.clone())
    }

    pub fn set_account(&self, account: AccountRecord) {
        *self.account.write() = Some(account);
    }

    /// Modify the cached account in place
    pub fn with_account_mut<R>(&self, f: impl FnOnce(&mut AccountRecord) -> R) -> Option<R> {
        self.account.write().as_mut().map(f)
    }

    pub fn character(&self) -> Option<CharacterRecord> {
        self.character.read().clone()
    }

    pub fn set_character(&self, character: CharacterRecord) {
        *self.character.write() = Some(character);
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        self.entity_id.read().clone()
    }

    pub fn set_entity_id(&self, id: EntityId) {
        *self.entity_id.write() = Some(id);
    }

    pub fn take_entity_id(&self) -> Option<EntityId> {
        self.entity_id.write().take()
    }

    /// Update the last activity timestamp
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Get the duration since last activity
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    // --- outbound ---

    /// Queue a message without blocking
    pub fn send(&self, message: Outbound) -> Result<(), NetworkError> {
        if !self.is_active() {
            return Err(NetworkError::ConnectionClosed);
        }
        self.outbound_tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::WriteBufferFull,
            mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed,
        })
    }

    /// Send an asynchronous event, stamped with the current time
    pub fn send_event(&self, name: &str, payload: Value) -> Result<(), NetworkError> {
        let mut payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        payload.insert(
            "timestamp".to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        self.send(Outbound::Event {
            name: name.to_string(),
            payload: Value::Object(payload),
        })
    }

    /// Answer a request
    pub fn respond(&self, id: u64, payload: Value) -> Result<(), NetworkError> {
        self.send(Outbound::Response { id, payload })
    }

    // --- replication ---

    /// Queue `inhabit entity` and a `create entity` for every entity `history`
    /// returns, then start receiving replication
    ///
    /// `history` runs with the replication gate held. An entity that goes live
    /// concurrently is either part of it or replicated after it, never before.
    pub fn enter_world<F>(&self, inhabit: Value, history: F) -> Result<usize, NetworkError>
    where
        F: FnOnce() -> Vec<Arc<Entity>>,
    {
        let mut backlog = self.backlog.lock();
        self.send_event(names::INHABIT_ENTITY, inhabit)?;

        let own = self.entity_id();
        let mut sent = 0;
        for entity in history() {
            if own.as_deref() == Some(entity.id()) {
                continue;
            }
            let change = EntityChange::created(&entity.to_json());
            match self.send_event(change.event_name(), change.payload(entity.id())) {
                Ok(()) => sent += 1,
                Err(NetworkError::WriteBufferFull) => {
                    backlog.insert(entity.id().to_string(), change);
                }
                Err(e) => return Err(e),
            }
        }

        if !self.set_state(SessionState::CharacterSelected) {
            return Err(NetworkError::ConnectionClosed);
        }
        Ok(sent)
    }

    /// Queue a replication message; ignored unless the session is in the world
    ///
    /// A change that does not fit the outbound buffer is merged into the
    /// backlog and sent by `flush_backlog`, so the client always ends up with
    /// the latest value.
    pub fn replicate(&self, entity_id: &str, change: EntityChange) {
        let mut backlog = self.backlog.lock();
        if !self.state().in_world() {
            return;
        }
        let change = match backlog.remove(entity_id) {
            Some(held) => held.merge(change),
            None => change,
        };
        backlog.insert(entity_id.to_string(), change);
        self.drain_backlog(&mut backlog);
    }

    /// Send held-back entity changes while the outbound buffer has room
    ///
    /// Returns the number still held.
    pub fn flush_backlog(&self) -> usize {
        let mut backlog = self.backlog.lock();
        if !backlog.is_empty() {
            self.drain_backlog(&mut backlog);
        }
        backlog.len()
    }

    fn drain_backlog(&self, backlog: &mut HashMap<EntityId, EntityChange>) {
        let ids: Vec<EntityId> = backlog.keys().cloned().collect();
        for id in ids {
            let Some(change) = backlog.remove(&id) else {
                continue;
            };
            match self.send_event(change.event_name(), change.payload(&id)) {
                Ok(()) => {}
                Err(NetworkError::WriteBufferFull) => {
                    trace!(session_id = self.id, entity_id = %id, "Outbound buffer full, holding entity change");
                    backlog.insert(id, change);
                    return;
                }
                Err(e) => {
                    debug!(session_id = self.id, error = %e, "Dropping entity changes for closed session");
                    backlog.clear();
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("account", &self.account_email())
            .field("entity_id", &self.entity_id())
            .field("idle_duration", &self.idle_duration())
            .finish()
    }
}

/// Outcome of releasing a login claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Released,
    NotHeld,
    /// Another session holds the account; nothing was changed
    HeldByOther(SessionId),
}

/// Logged-in accounts: at most one session per account
#[derive(Debug, Default)]
pub struct LoginRegistry {
    accounts: DashMap<String, SessionId>,
}

impl LoginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `session` as the holder of `email`; `Err` carries the current holder
    pub fn try_claim(&self, email: &str, session: SessionId) -> Result<(), SessionId> {
        match self.accounts.entry(email.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(holder) => Err(*holder.get()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn is_logged_in(&self, email: &str) -> bool {
        self.accounts.contains_key(email)
    }

    pub fn holder(&self, email: &str) -> Option<SessionId> {
        self.accounts.get(email).map(|holder| *holder)
    }

    /// Clear `email` only if `session` holds it
    pub fn release(&self, email: &str, session: SessionId) -> Release {
        if self
            .accounts
            .remove_if(email, |_, holder| *holder == session)
            .is_some()
        {
            return Release::Released;
        }
        match self.holder(email) {
            Some(other) => Release::HeldByOther(other),
            None => Release::NotHeld,
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Thread-safe session manager
pub struct SessionManager {
    /// Map of session ID to session
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Logged-in accounts
    logins: LoginRegistry,
    /// Next session ID to assign
    next_id: AtomicU64,
    /// Maximum concurrent sessions
    max_connections: usize,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(max_connections: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            logins: LoginRegistry::new(),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Create a new session and register it
    pub fn create_session(
        &self,
        address: Option<SocketAddr>,
        outbound_tx: mpsc::Sender<Outbound>,
    ) -> Result<Arc<Session>, NetworkError> {
        if self.sessions.len() >= self.max_connections {
            warn!(
                count = self.sessions.len(),
                max = self.max_connections,
                "Connection limit reached"
            );
            return Err(NetworkError::TooManyConnections(self.max_connections));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, address, outbound_tx));
        self.sessions.insert(id, session.clone());

        info!(session_id = id, address = ?address, "Session created");
        Ok(session)
    }

    /// Get a session by ID
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|r| r.clone())
    }

    /// Remove a session
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        if let Some(session) = &removed {
            info!(
                session_id = id,
                account = ?session.account_email(),
                "Session removed"
            );
        }
        removed
    }

    pub fn logins(&self) -> &LoginRegistry {
        &self.logins
    }

    /// Get the count of sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|r| r.value().clone()).collect()
    }

    /// Queue an entity change for every in-world session except `except`
    pub fn replicate(&self, entity_id: &str, change: EntityChange, except: Option<SessionId>) {
        // The in-world check happens under each session's replication gate
        let targets: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|s| Some(s.id) != except)
            .map(|s| s.value().clone())
            .collect();

        for session in targets {
            session.replicate(entity_id, change.clone());
        }
    }
}

impl EntityListener for SessionManager {
    fn entity_loaded(&self, entity: &Arc<Entity>, cause: Option<SessionId>) {
        self.replicate(entity.id(), EntityChange::created(&entity.to_json()), cause);
    }

    fn entity_unloaded(&self, id: &str) {
        self.replicate(id, EntityChange::Destroyed, None);
    }

    fn entity_updated(&self, id: &str, payload: &Value) {
        self.replicate(id, EntityChange::updated(payload), None);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.count())
            .field("logged_in", &self.logins.len())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}
