//! Connection handler module
//!
//! Handles the lifecycle of client connections including:
//! - WebSocket upgrade and the per-connection writer task
//! - Decoding inbound frames and routing them through the session's handler slots
//! - The login / character selection state machine
//! - Config documents, chat rooms and entity traffic forwarding
//! - Graceful disconnection (entity unload, login release, room cleanup)

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use super::message::{
    confirm, decode, failure, names, ChatMessageRequest, EntityCall, Inbound, LoginRequest,
    MessageKind, Outbound, RoomRequest, SelectCharacterRequest,
};
use super::session::{HandlerSlot, Release, Session, SessionState};
use crate::error::{reason, AuthError, NetworkError, PrecursorsError, Result};
use crate::game::persistence::ConfigRecord;
use crate::game::Entity;
use crate::AppState;

/// Outbound messages buffered per connection before sends start failing
const OUTBOUND_BUFFER: usize = 256;

/// Time the writer task gets to flush after the reader ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Handlers bound for the rest of the session once login succeeds
const ACCOUNT_HANDLERS: [MessageKind; 6] = [
    MessageKind::CreateCharacter,
    MessageKind::GetConfig,
    MessageKind::SaveConfig,
    MessageKind::JoinRoom,
    MessageKind::LeaveRoom,
    MessageKind::ChatMessage,
];

/// Connection handler for processing client connections
#[derive(Clone)]
pub struct ConnectionHandler {
    /// Shared application state
    state: Arc<AppState>,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Handle a WebSocket connection until the client leaves or the server shuts down
    pub async fn handle_websocket(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling WebSocket connection");

        stream.set_nodelay(true)?;

        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| PrecursorsError::Network(NetworkError::WebSocket(e.to_string())))?;

        info!(address = %addr, "WebSocket connection established");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
        let session = self
            .state
            .session_manager
            .create_session(Some(addr), outbound_tx)?;
        let session_id = session.id;

        let (mut sink, mut source) = ws_stream.split();

        let backlog_owner = Arc::downgrade(&session);
        let mut writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                // A slot just freed up for entity changes held back on a full buffer
                if let Some(session) = backlog_owner.upgrade() {
                    session.flush_backlog();
                }
                let text = match message.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(session_id = session_id, error = %e, "Failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(session_id = session_id, error = %e, "WebSocket write failed");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                trace!(session_id = session_id, error = %e, "Error closing WebSocket");
            }
        });

        let mut shutdown_rx = self.state.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match Inbound::parse(&text) {
                                Ok(message) => self.dispatch(&session, message).await,
                                Err(e) => {
                                    warn!(session_id = session_id, error = %e, "Dropping malformed frame");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(session_id = session_id, "Client closed connection");
                            break;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            trace!(session_id = session_id, len = data.len(), "Ignoring binary frame");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(session_id = session_id, error = %e, "WebSocket read failed");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!(session_id = session_id, "Connection received shutdown signal");
                    break;
                }
            }
        }

        self.disconnect(&session).await;

        // Dropping the last sender lets the writer drain and close the socket
        drop(session);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }

        debug!(session_id = session_id, "Connection handler ending");
        Ok(())
    }

    /// Route one inbound message through the session's handler slots
    ///
    /// Requests always get a response; events never do.
    pub async fn dispatch(&self, session: &Arc<Session>, message: Inbound) {
        session.touch();
        let request_id = message.request_id();
        let (name, payload) = match message {
            Inbound::Request { name, payload, .. } | Inbound::Event { name, payload } => {
                (name, payload)
            }
        };

        let kind = match MessageKind::from_name(&name) {
            Some(kind) if session.take_slot(kind) != HandlerSlot::Unregistered => kind,
            _ => {
                debug!(
                    session_id = session.id,
                    state = %session.state(),
                    message = %name,
                    "No handler registered for message"
                );
                if let Some(id) = request_id {
                    self.respond(
                        session,
                        id,
                        failure(
                            reason::UNRECOGNIZED_REQUEST,
                            format!("Unrecognized request: {}", name),
                        ),
                    );
                }
                return;
            }
        };

        trace!(session_id = session.id, message = %kind, "Dispatching message");

        let response = match kind {
            MessageKind::Login => self.handle_login(session, payload).await,
            MessageKind::CreateAccount | MessageKind::CreateCharacter => Some(failure(
                reason::NOT_IMPLEMENTED,
                format!("'{}' is not implemented", kind),
            )),
            MessageKind::SelectCharacter => self.handle_select_character(session, payload).await,
            MessageKind::GetConfig => self.handle_get_config(session),
            MessageKind::SaveConfig => self.handle_save_config(session, payload).await,
            MessageKind::JoinRoom => self.handle_join_room(session, payload),
            MessageKind::LeaveRoom => self.handle_leave_room(session, payload),
            MessageKind::ChatMessage => self.handle_chat_message(session, payload),
            MessageKind::EntityEvent => self.handle_entity_event(session, payload).await,
            MessageKind::EntityRequest => self.handle_entity_request(session, payload).await,
        };

        if let Some(id) = request_id {
            let response = response.unwrap_or_else(|| confirm(Value::Null));
            self.respond(session, id, response);
        }
    }

    fn respond(&self, session: &Session, id: u64, payload: Value) {
        if let Err(e) = session.respond(id, payload) {
            debug!(session_id = session.id, request_id = id, error = %e, "Failed to send response");
        }
    }

    /// Fail a login attempt and listen for the next one
    fn reject_login(&self, session: &Session, error: AuthError) -> Option<Value> {
        debug!(session_id = session.id, error = %error, "Login rejected");
        session.arm_once(MessageKind::Login);
        Some(failure(error.reason(), error.to_string()))
    }

    async fn handle_login(&self, session: &Arc<Session>, payload: Value) -> Option<Value> {
        let request = decode::<LoginRequest>(names::LOGIN, payload).ok();
        let email = match request.as_ref().and_then(|r| r.account.as_deref()) {
            Some(email) if !email.trim().is_empty() => email.trim().to_string(),
            _ => return self.reject_login(session, AuthError::BadAccount),
        };
        let password = request.map(|r| r.password).unwrap_or_default();

        let logins = self.state.session_manager.logins();
        if logins.is_logged_in(&email) {
            return self.reject_login(session, AuthError::AccountInUse);
        }

        let account = match self.state.store.account(&email).await {
            Ok(account) => account,
            Err(e) if e.is_not_found() => return self.reject_login(session, AuthError::NotFound),
            Err(e) => {
                warn!(session_id = session.id, account = %email, error = %e, "Account lookup failed");
                session.arm_once(MessageKind::Login);
                return Some(failure(reason::ERROR, e.to_string()));
            }
        };

        match self
            .state
            .credentials
            .verify(&password, &account.password)
            .await
        {
            Ok(true) => {}
            Ok(false) => return self.reject_login(session, AuthError::BadPassword),
            Err(e) => {
                warn!(session_id = session.id, account = %email, error = %e, "Credential check failed");
                return self.reject_login(session, e);
            }
        }

        if !session.is_active() {
            debug!(session_id = session.id, "Session disconnected during login");
            return None;
        }

        // A second session may have completed its login while this one was verifying
        if let Err(holder) = logins.try_claim(&email, session.id) {
            debug!(session_id = session.id, holder = holder, "Account claimed concurrently");
            return self.reject_login(session, AuthError::AccountInUse);
        }

        let characters = account.characters.clone();
        session.set_account(account);
        if !session.set_state(SessionState::Authenticated) {
            logins.release(&email, session.id);
            return None;
        }

        session.unbind(MessageKind::CreateAccount);
        session.arm_once(MessageKind::SelectCharacter);
        for kind in ACCOUNT_HANDLERS {
            session.bind_permanent(kind);
        }

        info!(
            session_id = session.id,
            account = %email,
            characters = characters.len(),
            "Login successful"
        );
        Some(confirm(json!({ "characters": characters })))
    }

    async fn handle_select_character(&self, session: &Arc<Session>, payload: Value) -> Option<Value> {
        let reject = |reason: &str, message: String| {
            session.arm_once(MessageKind::SelectCharacter);
            Some(failure(reason, message))
        };

        let character_id = match decode::<SelectCharacterRequest>(names::SELECT_CHARACTER, payload)
            .ok()
            .and_then(|r| r.character)
        {
            Some(id) => id,
            None => return reject(reason::NOT_FOUND, "No character specified".to_string()),
        };
        let email = match session.account_email() {
            Some(email) => email,
            None => return reject(reason::ERROR, "Not logged in".to_string()),
        };

        let character = match self.state.store.character(&character_id).await {
            Ok(character) if character.account_id == email => character,
            Ok(_) => {
                warn!(
                    session_id = session.id,
                    account = %email,
                    character = %character_id,
                    "Character belongs to another account"
                );
                return reject(reason::NOT_FOUND, format!("Character not found: {}", character_id));
            }
            Err(e) if e.is_not_found() => {
                return reject(reason::NOT_FOUND, format!("Character not found: {}", character_id));
            }
            Err(e) => return reject(reason::ERROR, e.to_string()),
        };

        let entity = match self
            .state
            .entities
            .load(&character.active_avatar_id, Some(session.id))
            .await
        {
            Ok(entity) => entity,
            Err(e) => {
                warn!(
                    session_id = session.id,
                    character = %character.id,
                    error = %e,
                    "Failed to load avatar"
                );
                // A character whose avatar cannot be loaded is a server-side fault
                return reject(reason::ERROR, e.to_string());
            }
        };

        if !session.is_active() {
            // Disconnect ran while the avatar loaded and could not see it
            debug!(session_id = session.id, "Session disconnected during character selection");
            self.state.entities.unload(entity.id()).await;
            return None;
        }

        self.inhabit(session, &entity);
        session.set_character(character.clone());
        let entities = &self.state.entities;
        let sent = match session.enter_world(entity.to_json(), || entities.entities()) {
            Ok(sent) => sent,
            Err(e) => {
                warn!(session_id = session.id, error = %e, "Failed to enter the world");
                if !session.is_active() {
                    return None;
                }
                return reject(reason::ERROR, e.to_string());
            }
        };

        info!(
            session_id = session.id,
            character = %character.name,
            entity_id = %entity.id(),
            known_entities = sent,
            "Character selected"
        );
        Some(confirm(json!({
            "zone": character.zone,
            "entityID": entity.id(),
        })))
    }

    /// Bind the entity's event/request surface to this session until either goes away
    fn inhabit(&self, session: &Arc<Session>, entity: &Arc<Entity>) {
        session.set_entity_id(entity.id().to_string());
        entity.set_owner_session(Some(session.id));
        session.bind_permanent(MessageKind::EntityEvent);
        session.bind_permanent(MessageKind::EntityRequest);

        let weak: Weak<Session> = Arc::downgrade(session);
        entity.on_unload(move |entity| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            if session.entity_id().as_deref() == Some(entity.id()) {
                session.take_entity_id();
                session.unbind(MessageKind::EntityEvent);
                session.unbind(MessageKind::EntityRequest);
                debug!(session_id = session.id, entity_id = %entity.id(), "Inhabited entity unloaded");
            }
        });
    }

    fn handle_get_config(&self, session: &Session) -> Option<Value> {
        let configs = session
            .account()
            .map(|account| account.configs)
            .unwrap_or_default();
        Some(confirm(json!({ "configs": configs })))
    }

    async fn handle_save_config(&self, session: &Session, payload: Value) -> Option<Value> {
        let mut document = match payload {
            Value::Object(map) => map,
            _ => {
                return Some(failure(
                    reason::VALIDATION_FAILED,
                    "Config must be an object",
                ))
            }
        };
        let email = match session.account_email() {
            Some(email) => email,
            None => return Some(failure(reason::ERROR, "Not logged in")),
        };
        document.remove("accountId");
        let id = document.remove("id").and_then(|id| id.as_str().map(str::to_string));

        let record = match id {
            Some(id) => match self.state.store.config(&id).await {
                Ok(mut existing) if existing.account_id.as_deref() == Some(email.as_str()) => {
                    existing.merge(document);
                    existing
                }
                Ok(_) => {
                    return Some(failure(reason::NOT_FOUND, format!("Config not found: {}", id)));
                }
                Err(e) if e.is_not_found() => {
                    return Some(failure(reason::NOT_FOUND, format!("Config not found: {}", id)));
                }
                Err(e) => return Some(failure(reason::SAVE_FAILED, e.to_string())),
            },
            None => ConfigRecord {
                id: None,
                account_id: Some(email.clone()),
                document,
            },
        };

        let saved = match self.state.store.save_config(record).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!(session_id = session.id, account = %email, error = %e, "Failed to save config");
                return Some(failure(reason::SAVE_FAILED, e.to_string()));
            }
        };

        session.with_account_mut(|account| {
            match account.configs.iter_mut().find(|c| c.id == saved.id) {
                Some(cached) => *cached = saved.clone(),
                None => account.configs.push(saved.clone()),
            }
        });

        debug!(session_id = session.id, config_id = ?saved.id, "Config saved");
        Some(confirm(json!({ "id": saved.id })))
    }

    fn handle_join_room(&self, session: &Session, payload: Value) -> Option<Value> {
        let joined = decode::<RoomRequest>(names::JOIN_ROOM, payload)
            .map_err(|e| e.to_string())
            .and_then(|request| {
                self.state
                    .chat
                    .join(&request.room, session.id)
                    .map(|_| request.room)
                    .map_err(|e| e.to_string())
            });

        match joined {
            Ok(room) => {
                debug!(session_id = session.id, room = %room, "Joined room");
                Some(confirm(json!({ "room": room })))
            }
            Err(message) => Some(failure(reason::JOIN_ROOM_FAILED, message)),
        }
    }

    fn handle_leave_room(&self, session: &Session, payload: Value) -> Option<Value> {
        let left = decode::<RoomRequest>(names::LEAVE_ROOM, payload)
            .map_err(|e| e.to_string())
            .and_then(|request| {
                self.state
                    .chat
                    .leave(&request.room, session.id)
                    .map(|_| request.room)
                    .map_err(|e| e.to_string())
            });

        match left {
            Ok(room) => {
                debug!(session_id = session.id, room = %room, "Left room");
                Some(confirm(json!({ "room": room })))
            }
            Err(message) => Some(failure(reason::LEAVE_ROOM_FAILED, message)),
        }
    }

    fn handle_chat_message(&self, session: &Session, payload: Value) -> Option<Value> {
        let request = match decode::<ChatMessageRequest>(names::CHAT_MESSAGE, payload) {
            Ok(request) => request,
            Err(e) => return Some(failure(reason::VALIDATION_FAILED, e.to_string())),
        };
        if !self.state.chat.is_member(&request.room, session.id) {
            return Some(failure(
                reason::NOT_IN_ROOM,
                format!("Not a member of room: {}", request.room),
            ));
        }

        let from = session
            .character()
            .map(|c| c.name)
            .or_else(|| session.account_email())
            .unwrap_or_default();
        let event = json!({
            "room": request.room,
            "from": from,
            "message": request.message,
        });

        for member in self.state.chat.members(&request.room) {
            if let Some(target) = self.state.session_manager.get(member) {
                if let Err(e) = target.send_event(names::CHAT_MESSAGE, event.clone()) {
                    debug!(session_id = member, error = %e, "Failed to deliver chat message");
                }
            }
        }
        Some(confirm(Value::Null))
    }

    fn inhabited_entity(&self, session: &Session) -> Option<Arc<Entity>> {
        session
            .entity_id()
            .and_then(|id| self.state.entities.get(&id))
    }

    async fn handle_entity_event(&self, session: &Session, payload: Value) -> Option<Value> {
        let call = match decode::<EntityCall>(names::ENTITY_EVENT, payload) {
            Ok(call) => call,
            Err(e) => {
                debug!(session_id = session.id, error = %e, "Dropping malformed entity event");
                return Some(failure(reason::VALIDATION_FAILED, e.to_string()));
            }
        };
        match self.inhabited_entity(session) {
            Some(entity) => {
                entity.on_event(&call.name, call.payload).await;
                None
            }
            None => {
                debug!(session_id = session.id, event = %call.name, "No inhabited entity for event");
                Some(failure(reason::NOT_FOUND, "No inhabited entity"))
            }
        }
    }

    async fn handle_entity_request(&self, session: &Session, payload: Value) -> Option<Value> {
        let call = match decode::<EntityCall>(names::ENTITY_REQUEST, payload) {
            Ok(call) => call,
            Err(e) => return Some(failure(reason::VALIDATION_FAILED, e.to_string())),
        };
        let entity = match self.inhabited_entity(session) {
            Some(entity) => entity,
            None => return Some(failure(reason::NOT_FOUND, "No inhabited entity")),
        };

        match entity.on_request(&call.name, call.payload).await {
            Ok(Value::Object(map)) => Some(Value::Object(map)),
            Ok(Value::Null) => Some(confirm(Value::Null)),
            Ok(other) => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                Some(confirm(Value::Object(map)))
            }
            Err(e) => {
                debug!(
                    session_id = session.id,
                    entity_id = %entity.id(),
                    request = %call.name,
                    error = %e,
                    "Entity request failed"
                );
                Some(failure(e.reason(), e.to_string()))
            }
        }
    }

    /// Tear a session down: unload its entity, release its login, leave its rooms
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn disconnect(&self, session: &Session) {
        if !session.mark_disconnected() {
            return;
        }

        if let Some(entity_id) = session.take_entity_id() {
            self.state.entities.unload(&entity_id).await;
        }

        if let Some(email) = session.account_email() {
            match self
                .state
                .session_manager
                .logins()
                .release(&email, session.id)
            {
                Release::Released => {}
                Release::NotHeld => {
                    warn!(session_id = session.id, account = %email, "Logged-in record already cleared");
                }
                Release::HeldByOther(other) => {
                    warn!(
                        session_id = session.id,
                        account = %email,
                        holder = other,
                        "Logged-in record held by another session; leaving it"
                    );
                }
            }
        }

        let rooms = self.state.chat.leave_all(session.id);
        self.state.session_manager.remove(session.id);

        info!(
            session_id = session.id,
            account = ?session.account_email(),
            rooms_left = rooms,
            "Session disconnected"
        );
    }

    /// Disconnect every session
    pub async fn disconnect_all(&self) -> usize {
        let sessions = self.state.session_manager.sessions();
        let count = sessions.len();
        for session in sessions {
            self.disconnect(&session).await;
        }
        count
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("sessions", &self.state.session_manager.count())
            .finish()
    }
}
