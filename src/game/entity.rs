//! Entity module
//!
//! An entity is one live simulated object: identity, template, layered state and
//! a table of named event and request handlers. Behavior comes from capability
//! layers installed at construction (see `capability`), not from subtyping.
//!
//! Entities never talk to sessions. State changes reach the outside world only
//! through `update()`, which throttles and hands payloads to the entity listeners.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::capability::{Actor, ActorView, Capability, Physical, Ship};
use super::manager::{Listeners, LiveEntities};
use super::overlay::StateOverlay;
use super::persistence::{EntityRecord, Store};
use super::powers::PowerRegistry;
use super::sync::{self, PendingUpdate, Throttle, UpdateAccumulator};
use super::template::{BehaviorKind, Template};
use crate::error::{EntityError, StoreError};
use crate::net::session::SessionId;
use crate::physics::proxy::PhysicalSetup;
use crate::physics::PhysicsLoop;

/// Globally unique entity id (UUID string)
pub type EntityId = String;

/// Boxed event handler
pub type EventHandler =
    Arc<dyn Fn(Arc<Entity>, Value) -> BoxFuture<'static, Result<(), EntityError>> + Send + Sync>;

/// Boxed request handler
pub type RequestHandler =
    Arc<dyn Fn(Arc<Entity>, Value) -> BoxFuture<'static, Result<Value, EntityError>> + Send + Sync>;

type UnloadHook = Box<dyn FnOnce(&Entity) + Send>;

/// Collaborators every entity of a manager shares
#[derive(Clone)]
pub struct EntityContext {
    pub store: Arc<dyn Store>,
    pub physics: Arc<PhysicsLoop>,
    pub powers: Arc<PowerRegistry>,
    pub listeners: Arc<Listeners>,
    pub live: Weak<LiveEntities>,
    pub replication_window: Duration,
}

/// A live game object
pub struct Entity {
    id: EntityId,
    template: Arc<Template>,
    owner_id: Option<String>,
    state: RwLock<StateOverlay>,
    updates: Mutex<UpdateAccumulator>,
    event_handlers: RwLock<HashMap<String, EventHandler>>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    physical: Option<Physical>,
    actor: Option<Actor>,
    ship: Option<Ship>,
    owner_session: Mutex<Option<SessionId>>,
    unsaved: AtomicBool,
    unloaded: AtomicBool,
    unload_hooks: Mutex<Vec<UnloadHook>>,
    ctx: EntityContext,
    this: Weak<Entity>,
}

impl Entity {
    /// Construct an entity and install its capability layers
    ///
    /// Everything that can fail (state validation, power resolution) happens before
    /// the entity exists, so a failed build leaves nothing attached.
    pub(crate) fn build(
        record: EntityRecord,
        template: Arc<Template>,
        ctx: EntityContext,
    ) -> Result<Arc<Entity>, EntityError> {
        let id = record
            .id
            .clone()
            .ok_or_else(|| EntityError::Validation("entity record has no id".to_string()))?;
        let kind = template.behavior;
        let state = StateOverlay::new(template.clone(), record.state);

        let physical = if kind.is_physical() {
            Some(Physical::new(PhysicalSetup::read(&state)?))
        } else {
            None
        };
        let actor = if kind.is_actor() {
            Some(Actor::resolve(&state, &ctx.powers)?)
        } else {
            None
        };
        let ship = kind.is_ship().then(Ship::new);

        let window = ctx.replication_window;
        let entity = Arc::new_cyclic(|this| Entity {
            id,
            template,
            owner_id: record.owner_id,
            state: RwLock::new(state),
            updates: Mutex::new(UpdateAccumulator::new(window)),
            event_handlers: RwLock::new(HashMap::new()),
            request_handlers: RwLock::new(HashMap::new()),
            physical,
            actor,
            ship,
            owner_session: Mutex::new(None),
            unsaved: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
            unload_hooks: Mutex::new(Vec::new()),
            ctx,
            this: this.clone(),
        });

        for capability in entity.capabilities() {
            if let Err(e) = capability.install(&entity) {
                entity.teardown();
                return Err(e);
            }
        }

        debug!(
            entity_id = %entity.id,
            template = %entity.template.name,
            behavior = %kind,
            "Entity constructed"
        );
        Ok(entity)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    pub fn behavior(&self) -> BehaviorKind {
        self.template.behavior
    }

    /// Account that owns the backing record, if any
    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub(crate) fn context(&self) -> &EntityContext {
        &self.ctx
    }

    /// Weak handle to this entity
    pub fn downgrade(&self) -> Weak<Entity> {
        self.this.clone()
    }

    fn capabilities(&self) -> Vec<&dyn Capability> {
        let mut layers: Vec<&dyn Capability> = Vec::with_capacity(3);
        if let Some(physical) = &self.physical {
            layers.push(physical);
        }
        if let Some(actor) = &self.actor {
            layers.push(actor);
        }
        if let Some(ship) = &self.ship {
            layers.push(ship);
        }
        layers
    }

    // --- state ---

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, EntityError> {
        self.state
            .read()
            .get_as(key)
            .map_err(|e| EntityError::Validation(format!("field '{}': {}", key, e)))
    }

    /// Write one field into the instance layer
    ///
    /// Does not replicate; call `update` once the change is complete.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.state.write().set(key, value);
        self.mark_unsaved();
    }

    pub fn set_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), EntityError> {
        let value = serde_json::to_value(value)
            .map_err(|e| EntityError::Validation(format!("field '{}': {}", key, e)))?;
        self.set(key, value);
        Ok(())
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&StateOverlay) -> R) -> R {
        f(&self.state.read())
    }

    /// Mutate state in place; marks the entity unsaved
    ///
    /// `update` must not be called from inside `f`.
    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut StateOverlay) -> R) -> R {
        let result = f(&mut self.state.write());
        self.mark_unsaved();
        result
    }

    /// Projection sent in full updates: every visible field plus id and behavior
    pub fn to_json(&self) -> Value {
        let mut projection = self.state.read().merged();
        projection.insert("id".to_string(), Value::String(self.id.clone()));
        projection.insert(
            "behavior".to_string(),
            Value::String(self.behavior().name().to_string()),
        );
        Value::Object(projection)
    }

    /// Backing record with the instance layer only
    pub fn to_record(&self) -> EntityRecord {
        EntityRecord {
            id: Some(self.id.clone()),
            template: self.template.name.clone(),
            owner_id: self.owner_id.clone(),
            state: self.state.read().overrides().clone(),
        }
    }

    // --- persistence ---

    pub fn mark_unsaved(&self) {
        self.unsaved.store(true, Ordering::SeqCst);
    }

    pub fn is_unsaved(&self) -> bool {
        self.unsaved.load(Ordering::SeqCst)
    }

    /// Write the instance layer back to the store
    pub async fn save(&self) -> Result<(), StoreError> {
        let record = self.to_record();
        self.unsaved.store(false, Ordering::SeqCst);

        if let Err(e) = self.ctx.store.save_entity(&record).await {
            self.mark_unsaved();
            return Err(e);
        }
        Ok(())
    }

    // --- replication ---

    /// Request replication of the given fields, or of everything when `None`
    ///
    /// At most one message per replication window leaves an entity. Changes made
    /// inside a window are merged and sent on its trailing edge.
    pub fn update(&self, fields: Option<&[&str]>) {
        if self.is_unloaded() {
            return;
        }

        let mut updates = self.updates.lock();
        match fields {
            None => updates.mark_full(),
            Some(fields) => updates.mark_fields(fields.iter().copied()),
        }

        match updates.poll(Instant::now()) {
            Throttle::Ready(pending) => self.emit(&pending),
            Throttle::Defer(delay) => {
                if !self.schedule_flush(delay) {
                    updates.cancel_flush();
                }
            }
            Throttle::Idle | Throttle::Scheduled => {}
        }
    }

    /// Trailing-edge send of whatever accumulated during the window
    pub fn flush_updates(&self) {
        let mut updates = self.updates.lock();
        if self.is_unloaded() {
            updates.cancel_flush();
            return;
        }
        if let Some(pending) = updates.flush(Instant::now()) {
            self.emit(&pending);
        }
    }

    fn schedule_flush(&self, delay: Duration) -> bool {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return false,
        };

        let this = self.this.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(entity) = this.upgrade() {
                entity.flush_updates();
            }
        });
        true
    }

    // Runs with the accumulator locked so sends of one entity keep their order
    fn emit(&self, pending: &PendingUpdate) {
        let payload = match pending {
            PendingUpdate::Full => self.to_json(),
            PendingUpdate::Fields(fields) => {
                let state = self.state.read();
                sync::delta_payload(&self.id, &state, fields)
            }
        };
        self.ctx.listeners.updated(&self.id, &payload);
    }

    // --- handlers ---

    /// Bind an event handler; replaces any handler of the same name
    pub fn register_event_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Entity>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EntityError>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |entity, payload| handler(entity, payload).boxed());
        self.event_handlers.write().insert(name.into(), handler);
    }

    /// Bind a request handler; replaces any handler of the same name
    pub fn register_request_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Entity>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, EntityError>> + Send + 'static,
    {
        let handler: RequestHandler =
            Arc::new(move |entity, payload| handler(entity, payload).boxed());
        self.request_handlers.write().insert(name.into(), handler);
    }

    pub fn remove_event_handler(&self, name: &str) -> bool {
        self.event_handlers.write().remove(name).is_some()
    }

    pub fn remove_request_handler(&self, name: &str) -> bool {
        self.request_handlers.write().remove(name).is_some()
    }

    pub fn has_event_handler(&self, name: &str) -> bool {
        self.event_handlers.read().contains_key(name)
    }

    pub fn has_request_handler(&self, name: &str) -> bool {
        self.request_handlers.read().contains_key(name)
    }

    /// Deliver an event; failures and panics are logged, never returned
    pub async fn on_event(&self, name: &str, payload: Value) {
        let handler = self.event_handlers.read().get(name).cloned();
        let (handler, this) = match (handler, self.this.upgrade()) {
            (Some(handler), Some(this)) => (handler, this),
            (None, _) => {
                debug!(entity_id = %self.id, event = name, "No handler for entity event");
                return;
            }
            (Some(_), None) => return,
        };

        match AssertUnwindSafe(handler(this, payload)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(entity_id = %self.id, event = name, error = %e, "Entity event handler failed");
            }
            Err(panic) => {
                error!(
                    entity_id = %self.id,
                    event = name,
                    panic = %panic_message(panic.as_ref()),
                    "Entity event handler panicked"
                );
            }
        }
    }

    /// Answer a request through its registered handler
    pub async fn on_request(&self, name: &str, payload: Value) -> Result<Value, EntityError> {
        let handler = self
            .request_handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EntityError::UnrecognizedRequest(name.to_string()))?;
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| EntityError::NotFound(self.id.clone()))?;

        match AssertUnwindSafe(handler(this, payload)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    entity_id = %self.id,
                    request = name,
                    panic = %message,
                    "Entity request handler panicked"
                );
                Err(EntityError::HandlerPanicked(message))
            }
        }
    }

    // --- capabilities ---

    pub fn physical(&self) -> Option<&Physical> {
        self.physical.as_ref()
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn ship(&self) -> Option<&Ship> {
        self.ship.as_ref()
    }

    pub fn as_actor(&self) -> Option<ActorView<'_>> {
        self.actor.as_ref().map(|actor| ActorView::new(self, actor))
    }

    pub fn require_actor(&self) -> Result<ActorView<'_>, EntityError> {
        self.as_actor()
            .ok_or_else(|| EntityError::MissingCapability(self.id.clone(), "actor"))
    }

    // --- liveness ---

    /// Another live entity of the same manager
    pub fn lookup(&self, id: &str) -> Option<Arc<Entity>> {
        self.ctx
            .live
            .upgrade()
            .and_then(|live| live.get(id).map(|entry| entry.value().clone()))
    }

    /// Whether this exact instance is still registered in the live table
    pub fn is_live(&self) -> bool {
        if self.is_unloaded() {
            return false;
        }
        self.ctx
            .live
            .upgrade()
            .and_then(|live| {
                live.get(&self.id)
                    .map(|entry| std::ptr::eq(entry.value().as_ref(), self))
            })
            .unwrap_or(false)
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::SeqCst)
    }

    pub fn owner_session(&self) -> Option<SessionId> {
        *self.owner_session.lock()
    }

    pub fn set_owner_session(&self, session: Option<SessionId>) {
        *self.owner_session.lock() = session;
    }

    /// Run `hook` when the entity is unloaded, or now if it already was
    pub fn on_unload<F>(&self, hook: F)
    where
        F: FnOnce(&Entity) + Send + 'static,
    {
        let mut hooks = self.unload_hooks.lock();
        if self.is_unloaded() {
            drop(hooks);
            hook(self);
            return;
        }
        hooks.push(Box::new(hook));
    }

    /// Detach capabilities, drop handlers and run unload hooks
    ///
    /// Returns false if the entity was already torn down.
    pub(crate) fn teardown(&self) -> bool {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return false;
        }

        for capability in self.capabilities().into_iter().rev() {
            capability.teardown(self);
        }

        self.event_handlers.write().clear();
        self.request_handlers.write().clear();
        self.updates.lock().cancel_flush();

        let hooks = std::mem::take(&mut *self.unload_hooks.lock());
        for hook in hooks {
            hook(self);
        }
        *self.owner_session.lock() = None;

        debug!(entity_id = %self.id, "Entity torn down");
        true
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("template", &self.template.name)
            .field("behavior", &self.behavior())
            .field("owner_session", &self.owner_session())
            .field("unloaded", &self.is_unloaded())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Instance state from a JSON value; anything but an object is treated as empty
pub fn state_from_value(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
