//! Integration tests for the session state machine and entity replication
//!
//! These tests drive `ConnectionHandler::dispatch` against an in-memory store,
//! without sockets, and verify the end-to-end behavior of:
//! - Login (success, bad input, duplicate logins, retries)
//! - Character selection and entity inhabitation
//! - Replication of created / destroyed entities to other sessions
//! - Disconnect cleanup
//! - Config documents, chat rooms and entity traffic forwarding

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};

use precursors_server::auth::Argon2Credentials;
use precursors_server::config::ServerConfig;
use precursors_server::game::persistence::{
    CharacterRecord, EntityRecord, MemoryStore, Store, WorldSeed,
};
use precursors_server::game::{BehaviorKind, Template};
use precursors_server::net::handler::ConnectionHandler;
use precursors_server::net::message::{Inbound, Outbound};
use precursors_server::net::session::{Session, SessionState};
use precursors_server::physics::Vec3;
use precursors_server::state::AppState;

struct TestServer {
    state: Arc<AppState>,
    handler: ConnectionHandler,
    store: Arc<MemoryStore>,
}

struct Client {
    session: Arc<Session>,
    rx: mpsc::Receiver<Outbound>,
    events: Vec<(String, Value)>,
    next_id: u64,
}

async fn server() -> TestServer {
    let credentials = Argon2Credentials::new(64);
    let store = Arc::new(MemoryStore::new());

    store.insert_template(Template::new(
        "Ares",
        BehaviorKind::Ship,
        json!({
            "hitpoints": 300,
            "maxHitpoints": 300,
            "turnRate": 90.0,
            "maxSpeed": { "x": 100.0, "y": 50.0, "z": 50.0 },
            "stats": { "hit": 10, "crit": 5, "block": 5, "dodge": 5 },
            "powers": { "basic_attack": {} },
        }),
    ));

    for (email, password, character, name, avatar) in [
        ("a@x.com", "right", "c-1", "Nova", "e-nova"),
        ("b@x.com", "other", "c-2", "Vega", "e-vega"),
    ] {
        store.insert_account(email, credentials.hash(password, 1).unwrap());
        store.insert_character(CharacterRecord {
            id: character.to_string(),
            name: name.to_string(),
            account_id: email.to_string(),
            zone: Some("Sol".to_string()),
            active_avatar_id: avatar.to_string(),
        });
        store
            .insert_entity(EntityRecord::new("Ares", Some(email.to_string()), Map::new()).with_id(avatar))
            .await
            .unwrap();
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let state = Arc::new(AppState::new(
        ServerConfig::default(),
        store.clone(),
        Arc::new(credentials),
        shutdown_tx,
    ));

    TestServer {
        handler: ConnectionHandler::new(state.clone()),
        state,
        store,
    }
}

impl TestServer {
    fn connect(&self) -> Client {
        self.connect_with_buffer(64)
    }

    fn connect_with_buffer(&self, capacity: usize) -> Client {
        let (tx, rx) = mpsc::channel(capacity);
        let session = self.state.session_manager.create_session(None, tx).unwrap();
        Client {
            session,
            rx,
            events: Vec::new(),
            next_id: 1,
        }
    }

    async fn login(&self, client: &mut Client, account: &str, password: &str) -> Value {
        client
            .request(
                &self.handler,
                "login",
                json!({ "account": account, "password": password }),
            )
            .await
    }

    /// Log in and select the account's only character
    async fn enter_world(&self, client: &mut Client, account: &str, password: &str, character: &str) -> Value {
        let login = self.login(client, account, password).await;
        assert_eq!(login["confirm"], true);
        client
            .request(&self.handler, "select character", json!({ "character": character }))
            .await
    }
}

impl Client {
    async fn request(&mut self, handler: &ConnectionHandler, name: &str, payload: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        handler
            .dispatch(
                &self.session,
                Inbound::Request {
                    id,
                    name: name.to_string(),
                    payload,
                },
            )
            .await;

        loop {
            match self.rx.try_recv() {
                Ok(Outbound::Response { id: got, payload }) if got == id => return payload,
                Ok(Outbound::Response { id: got, .. }) => panic!("response to unexpected request {}", got),
                Ok(Outbound::Event { name, payload }) => self.events.push((name, payload)),
                Err(e) => panic!("no response to '{}': {:?}", name, e),
            }
        }
    }

    async fn event(&mut self, handler: &ConnectionHandler, name: &str, payload: Value) {
        handler
            .dispatch(
                &self.session,
                Inbound::Event {
                    name: name.to_string(),
                    payload,
                },
            )
            .await;
    }

    /// Move queued events into `events`
    fn drain(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            if let Outbound::Event { name, payload } = message {
                self.events.push((name, payload));
            }
        }
    }

    fn events_named(&mut self, name: &str) -> Vec<Value> {
        self.drain();
        self.events
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

/// A correct login is confirmed with the account's characters
#[tokio::test]
async fn test_login_success() {
    let server = server().await;
    let mut client = server.connect();

    let response = server.login(&mut client, "a@x.com", "right").await;
    assert_eq!(response["confirm"], true);
    let characters = response["characters"].as_array().unwrap();
    assert_eq!(characters.len(), 1);
    assert_eq!(characters[0]["name"], "Nova");

    assert_eq!(client.session.state(), SessionState::Authenticated);
    assert!(server.state.session_manager.logins().is_logged_in("a@x.com"));
}

/// A second session cannot log into an account that is already logged in
#[tokio::test]
async fn test_duplicate_login_is_rejected() {
    let server = server().await;
    let mut first = server.connect();
    let mut second = server.connect();

    assert_eq!(server.login(&mut first, "a@x.com", "right").await["confirm"], true);
    let response = server.login(&mut second, "a@x.com", "right").await;

    assert_eq!(response["confirm"], false);
    assert_eq!(response["reason"], "account_in_use");
    assert_eq!(second.session.state(), SessionState::Unauthenticated);
    assert_eq!(
        server.state.session_manager.logins().holder("a@x.com"),
        Some(first.session.id)
    );

    // The rejected session may log into another account
    assert_eq!(server.login(&mut second, "b@x.com", "other").await["confirm"], true);
}

/// Failed logins report a reason and leave the session able to retry
#[tokio::test]
async fn test_failed_login_can_be_retried() {
    let server = server().await;
    let mut client = server.connect();

    let response = server.login(&mut client, "a@x.com", "wrong").await;
    assert_eq!(response["reason"], "bad_password");

    let response = server.login(&mut client, "nobody@x.com", "right").await;
    assert_eq!(response["reason"], "not_found");

    let response = client
        .request(&server.handler, "login", json!({ "password": "right" }))
        .await;
    assert_eq!(response["reason"], "bad_account");

    assert_eq!(client.session.state(), SessionState::Unauthenticated);
    assert!(server.state.session_manager.logins().is_empty());

    let response = server.login(&mut client, "a@x.com", "right").await;
    assert_eq!(response["confirm"], true);

    // Login is one-shot once it has succeeded
    let response = server.login(&mut client, "a@x.com", "right").await;
    assert_eq!(response["reason"], "unrecognized_request");
}

/// Messages that need a login are unrecognized before it
#[tokio::test]
async fn test_handlers_require_login() {
    let server = server().await;
    let mut client = server.connect();

    for name in ["get config", "select character", "join room", "request"] {
        let response = client.request(&server.handler, name, json!({})).await;
        assert_eq!(response["reason"], "unrecognized_request", "{}", name);
    }

    let response = client.request(&server.handler, "create account", json!({})).await;
    assert_eq!(response["reason"], "not_implemented");
}

/// Selecting a character loads and inhabits its entity
#[tokio::test]
async fn test_select_character_inhabits_entity() {
    let server = server().await;
    let mut client = server.connect();

    let response = server.enter_world(&mut client, "a@x.com", "right", "c-1").await;
    assert_eq!(response["confirm"], true);
    assert_eq!(response["zone"], "Sol");
    assert_eq!(response["entityID"], "e-nova");

    assert_eq!(client.session.state(), SessionState::CharacterSelected);
    assert_eq!(client.session.entity_id().as_deref(), Some("e-nova"));
    assert!(server.state.entities.contains("e-nova"));

    let inhabit = client.events_named("inhabit entity");
    assert_eq!(inhabit.len(), 1);
    assert_eq!(inhabit[0]["id"], "e-nova");
    assert_eq!(inhabit[0]["hitpoints"], 300);
    assert!(inhabit[0]["timestamp"].as_i64().is_some());

    // A session never receives `create entity` for its own avatar
    assert!(client.events_named("create entity").is_empty());
}

/// An unknown character is reported and the selection can be retried
#[tokio::test]
async fn test_select_unknown_character() {
    let server = server().await;
    let mut client = server.connect();
    assert_eq!(server.login(&mut client, "a@x.com", "right").await["confirm"], true);

    let response = client
        .request(&server.handler, "select character", json!({ "character": "c-404" }))
        .await;
    assert_eq!(response["confirm"], false);
    assert_eq!(response["reason"], "not_found");
    assert_eq!(client.session.state(), SessionState::Authenticated);

    // Another account's character is just as unknown
    let response = client
        .request(&server.handler, "select character", json!({ "character": "c-2" }))
        .await;
    assert_eq!(response["reason"], "not_found");
    assert!(!server.state.entities.contains("e-vega"));

    let response = client
        .request(&server.handler, "select character", json!({ "character": "c-1" }))
        .await;
    assert_eq!(response["confirm"], true);
}

/// A character whose avatar cannot be loaded is a server error, not an unknown character
#[tokio::test]
async fn test_select_character_with_missing_avatar() {
    let server = server().await;
    server.store.insert_character(CharacterRecord {
        id: "c-3".to_string(),
        name: "Orphan".to_string(),
        account_id: "a@x.com".to_string(),
        zone: None,
        active_avatar_id: "e-missing".to_string(),
    });
    let mut client = server.connect();
    assert_eq!(server.login(&mut client, "a@x.com", "right").await["confirm"], true);

    let response = client
        .request(&server.handler, "select character", json!({ "character": "c-3" }))
        .await;
    assert_eq!(response["confirm"], false);
    assert_eq!(response["reason"], "error");
    assert_eq!(client.session.state(), SessionState::Authenticated);

    let response = client
        .request(&server.handler, "select character", json!({ "character": "c-1" }))
        .await;
    assert_eq!(response["confirm"], true);
}

/// Sessions in the world learn about each other's entities
#[tokio::test]
async fn test_entities_replicate_between_sessions() {
    let server = server().await;
    let mut alice = server.connect();
    let mut bob = server.connect();

    server.enter_world(&mut alice, "a@x.com", "right", "c-1").await;
    server.enter_world(&mut bob, "b@x.com", "other", "c-2").await;

    let seen_by_alice = alice.events_named("create entity");
    assert_eq!(seen_by_alice.len(), 1);
    assert_eq!(seen_by_alice[0]["id"], "e-vega");

    // Bob receives the world as it was when he arrived
    let seen_by_bob = bob.events_named("create entity");
    assert_eq!(seen_by_bob.len(), 1);
    assert_eq!(seen_by_bob[0]["id"], "e-nova");
}

/// A session entering the world hears about its own entity first, then the
/// entities already there, and only then their changes
#[tokio::test]
async fn test_world_entry_event_order() {
    let server = server().await;
    let mut alice = server.connect();
    let mut bob = server.connect();
    server.enter_world(&mut alice, "a@x.com", "right", "c-1").await;
    let nova = server.state.entities.get("e-nova").unwrap();

    assert_eq!(server.login(&mut bob, "b@x.com", "other").await["confirm"], true);
    nova.set("hitpoints", json!(250));
    nova.update(Some(&["hitpoints"][..]));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(bob.events_named("update entity").is_empty());

    let response = bob
        .request(&server.handler, "select character", json!({ "character": "c-2" }))
        .await;
    assert_eq!(response["confirm"], true);

    nova.set("hitpoints", json!(200));
    nova.update(Some(&["hitpoints"][..]));
    tokio::time::sleep(Duration::from_millis(250)).await;
    bob.drain();

    let names: Vec<&str> = bob.events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names[0], "inhabit entity");
    assert_eq!(names[1], "create entity");
    assert_eq!(bob.events[1].1["id"], "e-nova");
    assert!(names.len() > 2);
    assert!(names[2..].iter().all(|name| *name == "update entity"));
    assert_eq!(bob.events.last().unwrap().1["hitpoints"], 200);
}

/// A change that meets a full outbound buffer is delivered once it drains
#[tokio::test]
async fn test_replication_survives_full_buffer() {
    let server = server().await;
    let mut alice = server.connect();
    let mut bob = server.connect_with_buffer(3);
    server.enter_world(&mut alice, "a@x.com", "right", "c-1").await;
    server.enter_world(&mut bob, "b@x.com", "other", "c-2").await;
    bob.drain();
    bob.events.clear();

    for _ in 0..3 {
        bob.session.send_event("chat message", json!({ "message": "spam" })).unwrap();
    }

    let nova = server.state.entities.get("e-nova").unwrap();
    nova.set("hitpoints", json!(0));
    nova.update(Some(&["hitpoints"][..]));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(bob.session.flush_backlog(), 1);

    // What the connection's writer does after taking a message off the queue
    bob.rx.try_recv().unwrap();
    assert_eq!(bob.session.flush_backlog(), 0);

    let updates = bob.events_named("update entity");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["id"], "e-nova");
    assert_eq!(updates[0]["hitpoints"], 0);
}

/// Disconnecting releases the entity, the login and the rooms
#[tokio::test]
async fn test_disconnect_cleans_up() {
    let server = server().await;
    let mut alice = server.connect();
    let mut bob = server.connect();

    server.enter_world(&mut alice, "a@x.com", "right", "c-1").await;
    server.enter_world(&mut bob, "b@x.com", "other", "c-2").await;
    assert_eq!(
        bob.request(&server.handler, "join room", json!({ "room": "general" })).await["confirm"],
        true
    );

    server.handler.disconnect(&bob.session).await;

    assert!(!server.state.entities.contains("e-vega"));
    assert!(!server.state.session_manager.logins().is_logged_in("b@x.com"));
    assert!(server.state.session_manager.get(bob.session.id).is_none());
    assert!(server.state.chat.members("general").is_empty());
    assert_eq!(bob.session.state(), SessionState::Disconnected);

    let destroyed = alice.events_named("destroy entity");
    assert_eq!(destroyed.len(), 1);
    assert_eq!(destroyed[0]["id"], "e-vega");

    // Disconnect is idempotent
    server.handler.disconnect(&bob.session).await;
    assert_eq!(alice.events_named("destroy entity").len(), 1);

    // The avatar's final state was saved and the account can log in again
    assert!(server.store.entity("e-vega").await.is_ok());
    let mut again = server.connect();
    let response = server.enter_world(&mut again, "b@x.com", "other", "c-2").await;
    assert_eq!(response["confirm"], true);
}

/// Config documents are created, merged and listed per account
#[tokio::test]
async fn test_config_documents() {
    let server = server().await;
    let mut client = server.connect();
    server.login(&mut client, "a@x.com", "right").await;

    let saved = client
        .request(&server.handler, "save config", json!({ "keybinds": { "fire": "space" } }))
        .await;
    assert_eq!(saved["confirm"], true);
    let id = saved["id"].as_str().unwrap().to_string();

    let merged = client
        .request(&server.handler, "save config", json!({ "id": id, "volume": 0.5 }))
        .await;
    assert_eq!(merged["id"], id.as_str());

    let listed = client.request(&server.handler, "get config", Value::Null).await;
    let configs = listed["configs"].as_array().unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0]["keybinds"]["fire"], "space");
    assert_eq!(configs[0]["volume"], 0.5);
    assert_eq!(configs[0]["accountId"], "a@x.com");

    let missing = client
        .request(&server.handler, "save config", json!({ "id": "nope" }))
        .await;
    assert_eq!(missing["reason"], "not_found");

    server.store.set_read_only(true);
    let failed = client
        .request(&server.handler, "save config", json!({ "theme": "dark" }))
        .await;
    assert_eq!(failed["reason"], "save_failed");
}

/// Chat rooms relay messages to their members only
#[tokio::test]
async fn test_chat_rooms() {
    let server = server().await;
    let mut alice = server.connect();
    let mut bob = server.connect();
    server.login(&mut alice, "a@x.com", "right").await;
    server.login(&mut bob, "b@x.com", "other").await;

    alice.request(&server.handler, "join room", json!({ "room": "general" })).await;
    bob.request(&server.handler, "join room", json!({ "room": "general" })).await;

    let sent = alice
        .request(
            &server.handler,
            "chat message",
            json!({ "room": "general", "message": "hello" }),
        )
        .await;
    assert_eq!(sent["confirm"], true);

    let received = bob.events_named("chat message");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["message"], "hello");
    assert_eq!(received[0]["from"], "a@x.com");

    let left = bob.request(&server.handler, "leave room", json!({ "room": "general" })).await;
    assert_eq!(left["confirm"], true);
    let again = bob.request(&server.handler, "leave room", json!({ "room": "general" })).await;
    assert_eq!(again["reason"], "leave_room_failed");

    let outsider = bob
        .request(
            &server.handler,
            "chat message",
            json!({ "room": "general", "message": "still here?" }),
        )
        .await;
    assert_eq!(outsider["reason"], "not_in_room");

    let malformed = bob.request(&server.handler, "join room", json!({})).await;
    assert_eq!(malformed["reason"], "join_room_failed");
}

/// Entity traffic reaches the inhabited entity's handlers
#[tokio::test]
async fn test_entity_traffic_is_forwarded() {
    let server = server().await;
    let mut client = server.connect();
    server.enter_world(&mut client, "a@x.com", "right", "c-1").await;

    client
        .event(
            &server.handler,
            "event",
            json!({ "name": "throttle", "payload": { "value": 20.0 } }),
        )
        .await;

    let entity = server.state.entities.get("e-nova").unwrap();
    let proxy = entity.physical().unwrap().proxy().unwrap();
    assert_eq!(proxy.target_linear_velocity(), Vec3::new(20.0, 0.0, 0.0));
    assert!(entity.is_unsaved());

    let response = client
        .request(&server.handler, "request", json!({ "name": "warp", "payload": {} }))
        .await;
    assert_eq!(response["confirm"], false);
    assert_eq!(response["reason"], "unrecognized_request");
}

/// Unloading the inhabited entity detaches its traffic from the session
#[tokio::test]
async fn test_unloaded_entity_detaches_from_session() {
    let server = server().await;
    let mut client = server.connect();
    server.enter_world(&mut client, "a@x.com", "right", "c-1").await;

    assert!(server.state.entities.unload("e-nova").await);
    assert!(client.session.entity_id().is_none());

    let response = client
        .request(&server.handler, "request", json!({ "name": "status" }))
        .await;
    assert_eq!(response["reason"], "unrecognized_request");
}

/// The bundled world seed loads, logs in and builds every seeded entity
#[tokio::test]
async fn test_sample_world_seed() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("data/world.json");
    let seed = WorldSeed::load(&path).await.unwrap();
    let credentials = Argon2Credentials::new(64);
    let store = Arc::new(MemoryStore::from_seed(seed, &credentials, 1).unwrap());

    let (shutdown_tx, _) = broadcast::channel(1);
    let state = Arc::new(AppState::new(
        ServerConfig::default(),
        store.clone(),
        Arc::new(credentials),
        shutdown_tx,
    ));
    let server = TestServer {
        handler: ConnectionHandler::new(state.clone()),
        state,
        store,
    };

    let mut client = server.connect();
    let response = server
        .enter_world(&mut client, "pilot@precursors.test", "changeme", "c-pilot")
        .await;
    assert_eq!(response["entityID"], "e-pilot");

    for id in ["e-sentry", "e-beacon"] {
        server.state.entities.load(id, None).await.unwrap();
    }
    assert_eq!(server.state.entities.count(), 3);
    assert_eq!(server.state.physics.proxy_count(), 2);
    assert_eq!(client.events_named("create entity").len(), 2);
}
