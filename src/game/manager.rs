//! Entity manager
//!
//! The sole authority over which entities are live. It:
//! - creates, loads, unloads and deletes entities against the store
//! - guarantees one live instance per id
//! - notifies listeners of `loaded` / `unloaded` / `updated`
//! - periodically saves entities whose state changed since their last save
//!
//! Listeners are the only coupling to the session layer.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::entity::{Entity, EntityContext, EntityId};
use super::persistence::{EntityRecord, Store};
use super::powers::PowerRegistry;
use crate::error::{EntityError, StoreError};
use crate::net::session::SessionId;
use crate::physics::PhysicsLoop;

/// Live entities by id
pub type LiveEntities = DashMap<EntityId, Arc<Entity>>;

/// Receives entity lifecycle and replication notifications
pub trait EntityListener: Send + Sync {
    /// `cause` is the session whose action loaded the entity, if any
    fn entity_loaded(&self, entity: &Arc<Entity>, cause: Option<SessionId>);

    fn entity_unloaded(&self, id: &str);

    /// `payload` is either a full projection or `{id, ..dirty fields}`
    fn entity_updated(&self, id: &str, payload: &Value);
}

/// Weakly held listener list
#[derive(Default)]
pub struct Listeners {
    inner: RwLock<Vec<Weak<dyn EntityListener>>>,
}

impl Listeners {
    pub fn subscribe(&self, listener: Weak<dyn EntityListener>) {
        self.inner.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.read().iter().filter(|l| l.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn EntityListener>> {
        let listeners: Vec<_> = self.inner.read().iter().filter_map(Weak::upgrade).collect();
        if listeners.len() != self.inner.read().len() {
            self.inner.write().retain(|l| l.strong_count() > 0);
        }
        listeners
    }

    pub fn loaded(&self, entity: &Arc<Entity>, cause: Option<SessionId>) {
        for listener in self.snapshot() {
            listener.entity_loaded(entity, cause);
        }
    }

    pub fn unloaded(&self, id: &str) {
        for listener in self.snapshot() {
            listener.entity_unloaded(id);
        }
    }

    pub fn updated(&self, id: &str, payload: &Value) {
        for listener in self.snapshot() {
            listener.entity_updated(id, payload);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}

/// Owner of the live entity table
pub struct EntityManager {
    live: Arc<LiveEntities>,
    ctx: EntityContext,
}

impl EntityManager {
    pub fn new(
        store: Arc<dyn Store>,
        physics: Arc<PhysicsLoop>,
        powers: Arc<PowerRegistry>,
        replication_window: Duration,
    ) -> Self {
        let live = Arc::new(LiveEntities::new());
        let ctx = EntityContext {
            store,
            physics,
            powers,
            listeners: Arc::new(Listeners::default()),
            live: Arc::downgrade(&live),
            replication_window,
        };
        Self { live, ctx }
    }

    pub fn subscribe(&self, listener: Weak<dyn EntityListener>) {
        self.ctx.listeners.subscribe(listener);
    }

    pub fn listeners(&self) -> &Arc<Listeners> {
        &self.ctx.listeners
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.ctx.store
    }

    /// Persist a new record and load it
    ///
    /// Any failure comes back as `CreateFailed` carrying the call's parameters.
    pub async fn create(
        &self,
        template: &str,
        owner: Option<String>,
        initial_state: Map<String, Value>,
    ) -> Result<Arc<Entity>, EntityError> {
        let wrap = |source: EntityError| EntityError::CreateFailed {
            template: template.to_string(),
            owner: owner.clone(),
            initial_state: Value::Object(initial_state.clone()).to_string(),
            source: Box::new(source),
        };

        if let Err(e) = self.ctx.store.template(template).await {
            return Err(wrap(template_error(template, e)));
        }

        let record = EntityRecord::new(template, owner.clone(), initial_state.clone());
        let record = self
            .ctx
            .store
            .insert_entity(record)
            .await
            .map_err(|e| wrap(e.into()))?;
        let id = record
            .id
            .clone()
            .ok_or_else(|| wrap(EntityError::Validation("store assigned no id".to_string())))?;

        match self.load(&id, None).await {
            Ok(entity) => Ok(entity),
            Err(e) => {
                if let Err(cleanup) = self.ctx.store.delete_entity(&id).await {
                    warn!(entity_id = %id, error = %cleanup, "Failed to remove orphaned entity record");
                }
                Err(wrap(e))
            }
        }
    }

    /// Return the live entity for `id`, constructing it from the store if needed
    pub async fn load(
        &self,
        id: &str,
        cause: Option<SessionId>,
    ) -> Result<Arc<Entity>, EntityError> {
        if let Some(entity) = self.get(id) {
            return Ok(entity);
        }

        let mut record = self.ctx.store.entity(id).await.map_err(|e| {
            if e.is_not_found() {
                EntityError::NotFound(id.to_string())
            } else {
                EntityError::Store(e)
            }
        })?;
        let template = self
            .ctx
            .store
            .template(&record.template)
            .await
            .map_err(|e| template_error(&record.template, e))?;
        record.id = Some(id.to_string());

        // A concurrent load may have won while the store was being read
        let entity = match self.live.entry(id.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let entity = Entity::build(record, template, self.ctx.clone())?;
                slot.insert(entity.clone());
                entity
            }
        };

        info!(
            entity_id = %id,
            template = %entity.template().name,
            behavior = %entity.behavior(),
            "Entity loaded"
        );
        self.ctx.listeners.loaded(&entity, cause);
        Ok(entity)
    }

    /// Remove an entity from the live table, tear it down and save its final state
    ///
    /// Returns false if it was not live.
    pub async fn unload(&self, id: &str) -> bool {
        self.unload_entity(id, true).await
    }

    async fn unload_entity(&self, id: &str, persist: bool) -> bool {
        let entity = match self.live.remove(id) {
            Some((_, entity)) => entity,
            None => {
                debug!(entity_id = %id, "Unload of entity that is not live");
                return false;
            }
        };

        entity.teardown();
        info!(entity_id = %id, "Entity unloaded");
        self.ctx.listeners.unloaded(id);

        if persist && entity.is_unsaved() {
            if let Err(e) = entity.save().await {
                warn!(entity_id = %id, error = %e, "Failed to save unloaded entity");
            }
        }
        true
    }

    /// Delete the backing record, then unload
    pub async fn delete(&self, id: &str) -> Result<(), EntityError> {
        self.ctx.store.delete_entity(id).await.map_err(|e| {
            if e.is_not_found() {
                EntityError::NotFound(id.to_string())
            } else {
                EntityError::Store(e)
            }
        })?;
        self.unload_entity(id, false).await;
        info!(entity_id = %id, "Entity deleted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Entity>> {
        self.live.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.live.contains_key(id)
    }

    pub fn entities(&self) -> Vec<Arc<Entity>> {
        self.live.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.live.len()
    }

    /// Save every entity modified since its last save; returns how many were written
    pub async fn save_dirty(&self) -> usize {
        let dirty: Vec<_> = self
            .entities()
            .into_iter()
            .filter(|e| e.is_unsaved())
            .collect();

        let mut saved = 0;
        for entity in dirty {
            match entity.save().await {
                Ok(()) => saved += 1,
                Err(e) => warn!(entity_id = %entity.id(), error = %e, "Autosave failed"),
            }
        }
        saved
    }

    /// Unload every live entity, saving each
    pub async fn unload_all(&self) -> usize {
        let ids: Vec<EntityId> = self.live.iter().map(|entry| entry.key().clone()).collect();
        let mut unloaded = 0;
        for id in ids {
            if self.unload(&id).await {
                unloaded += 1;
            }
        }
        unloaded
    }

    /// Spawn the periodic autosave task
    pub fn start_autosave(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Starting autosave task");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let saved = manager.save_dirty().await;
                        if saved > 0 {
                            debug!(saved = saved, "Autosave complete");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Autosave task received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("live", &self.count())
            .field("listeners", &self.ctx.listeners)
            .finish()
    }
}

fn template_error(name: &str, e: StoreError) -> EntityError {
    if e.is_not_found() {
        EntityError::TemplateNotFound(name.to_string())
    } else {
        EntityError::Store(e)
    }
}
