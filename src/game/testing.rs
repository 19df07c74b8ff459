//! Shared fixtures for game module tests

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::entity::Entity;
use super::manager::{EntityListener, EntityManager};
use super::persistence::MemoryStore;
use super::powers::PowerRegistry;
use super::template::{BehaviorKind, Template};
use crate::net::session::SessionId;
use crate::physics::PhysicsLoop;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Loaded(String, Option<SessionId>),
    Unloaded(String),
    Updated(Value),
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingListener {
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub fn updates(&self) -> Vec<Value> {
        self.seen
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Updated(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl EntityListener for RecordingListener {
    fn entity_loaded(&self, entity: &Arc<Entity>, cause: Option<SessionId>) {
        self.seen
            .lock()
            .push(Notification::Loaded(entity.id().to_string(), cause));
    }

    fn entity_unloaded(&self, id: &str) {
        self.seen.lock().push(Notification::Unloaded(id.to_string()));
    }

    fn entity_updated(&self, _id: &str, payload: &Value) {
        self.seen.lock().push(Notification::Updated(payload.clone()));
    }
}

pub struct Harness {
    pub manager: Arc<EntityManager>,
    pub store: Arc<MemoryStore>,
    pub physics: Arc<PhysicsLoop>,
    pub listener: Arc<RecordingListener>,
}

pub fn templates() -> Vec<Template> {
    vec![
        Template::new("Buoy", BehaviorKind::Base, json!({ "color": "red", "size": 3 })),
        Template::new("Crate", BehaviorKind::Physical, json!({ "mass": 2.0 })),
        Template::new(
            "Drone",
            BehaviorKind::Actor,
            json!({
                "hitpoints": 50,
                "maxHitpoints": 50,
                "stats": { "hit": 10, "crit": 0, "block": 0, "dodge": 0 },
                "powers": { "basic_attack": {}, "basic_heal": {} },
            }),
        ),
        Template::new(
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
        ),
    ]
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    for template in templates() {
        store.insert_template(template);
    }

    let physics = Arc::new(PhysicsLoop::new(60));
    let manager = Arc::new(EntityManager::new(
        store.clone(),
        physics.clone(),
        Arc::new(PowerRegistry::with_defaults()),
        Duration::from_millis(100),
    ));

    let listener = Arc::new(RecordingListener::default());
    let weak = Arc::downgrade(&listener);
    manager.subscribe(weak);

    Harness {
        manager,
        store,
        physics,
        listener,
    }
}
