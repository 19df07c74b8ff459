//! Application state module
//!
//! Contains the shared state used across all server connections.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::auth::{Argon2Credentials, CredentialService};
use crate::chat::ChatRooms;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::game::persistence::{MemoryStore, Store, WorldSeed};
use crate::game::powers::PowerRegistry;
use crate::game::EntityManager;
use crate::net::session::SessionManager;
use crate::physics::PhysicsLoop;

/// Argon2 memory cost used for seed passwords in development mode
const DEV_PASSWORD_MEMORY_KIB: u32 = 1024;

/// Application state shared across all connections
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Session manager for tracking connected clients
    pub session_manager: Arc<SessionManager>,
    /// Live entity table
    pub entities: Arc<EntityManager>,
    /// Physics simulation
    pub physics: Arc<PhysicsLoop>,
    /// Backing store for accounts, characters, templates and entities
    pub store: Arc<dyn Store>,
    /// Password verification
    pub credentials: Arc<dyn CredentialService>,
    /// Chat rooms
    pub chat: ChatRooms,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Wire every component around an existing store
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn Store>,
        credentials: Arc<dyn CredentialService>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let physics = Arc::new(PhysicsLoop::new(config.physics_rate_hz));
        let entities = Arc::new(EntityManager::new(
            store.clone(),
            physics.clone(),
            Arc::new(PowerRegistry::with_defaults()),
            config.replication_window(),
        ));

        let session_manager = Arc::new(SessionManager::new(config.max_connections));
        let listener = Arc::downgrade(&session_manager);
        entities.subscribe(listener);

        Self {
            config,
            session_manager,
            entities,
            physics,
            store,
            credentials,
            chat: ChatRooms::new(),
            shutdown_tx,
        }
    }

    /// Build the state from the configured world seed, backed by an in-memory store
    pub async fn from_config(config: ServerConfig, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let world_path = config.world_path();
        let seed = WorldSeed::load(&world_path).await?;
        info!(path = %world_path.display(), "World seed read");

        let (memory_kib, iterations) = if config.dev_mode {
            info!("Development mode: seed passwords hashed with minimal cost");
            (DEV_PASSWORD_MEMORY_KIB, 1)
        } else {
            (config.password_memory_kib, config.password_iterations)
        };
        let credentials = Argon2Credentials::new(memory_kib);
        let store = MemoryStore::from_seed(seed, &credentials, iterations)?;

        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(credentials),
            shutdown_tx,
        ))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("server_name", &self.config.server_name)
            .field("session_manager", &self.session_manager)
            .field("entities", &self.entities)
            .finish()
    }
}
