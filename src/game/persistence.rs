//! Persistence module
//!
//! The storage collaborator behind accounts, characters, entities, templates and
//! client config documents:
//! - `Store` - the async interface the rest of the server consumes
//! - record types, serialized in the camelCase form clients and seed files use
//! - `MemoryStore` - in-process implementation, seeded from a JSON world file
//!
//! Account ids are the account's email address.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::entity::EntityId;
use super::template::Template;
use crate::auth::{Argon2Credentials, PasswordRecord};
use crate::error::{AuthError, PrecursorsError, Result, StoreError};

/// Backing record of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    /// Assigned on insert when absent
    #[serde(default)]
    pub id: Option<EntityId>,
    pub template: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Instance overrides only; template defaults are never copied in
    #[serde(default)]
    pub state: Map<String, Value>,
}

impl EntityRecord {
    pub fn new(template: impl Into<String>, owner_id: Option<String>, state: Map<String, Value>) -> Self {
        Self {
            id: None,
            template: template.into(),
            owner_id,
            state,
        }
    }

    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A playable character belonging to an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRecord {
    pub id: String,
    pub name: String,
    pub account_id: String,
    #[serde(default)]
    pub zone: Option<String>,
    /// Entity the character inhabits on selection
    pub active_avatar_id: EntityId,
}

/// A free-form client config document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(flatten)]
    pub document: Map<String, Value>,
}

impl ConfigRecord {
    /// Overwrite document fields with those of `other`; ids are left alone
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (key, value) in other {
            self.document.insert(key, value);
        }
    }
}

/// An account joined with its characters and config documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub email: String,
    pub password: PasswordRecord,
    #[serde(default)]
    pub characters: Vec<CharacterRecord>,
    #[serde(default)]
    pub configs: Vec<ConfigRecord>,
}

/// Storage collaborator
#[async_trait]
pub trait Store: Send + Sync {
    async fn account(&self, email: &str) -> std::result::Result<AccountRecord, StoreError>;

    async fn character(&self, id: &str) -> std::result::Result<CharacterRecord, StoreError>;

    async fn template(&self, name: &str) -> std::result::Result<Arc<Template>, StoreError>;

    async fn entity(&self, id: &str) -> std::result::Result<EntityRecord, StoreError>;

    /// Insert a new entity record, assigning an id if it has none
    async fn insert_entity(&self, record: EntityRecord) -> std::result::Result<EntityRecord, StoreError>;

    /// Overwrite an existing entity record
    async fn save_entity(&self, record: &EntityRecord) -> std::result::Result<(), StoreError>;

    async fn delete_entity(&self, id: &str) -> std::result::Result<(), StoreError>;

    async fn config(&self, id: &str) -> std::result::Result<ConfigRecord, StoreError>;

    /// Insert or overwrite a config document, assigning an id if it has none
    async fn save_config(&self, record: ConfigRecord) -> std::result::Result<ConfigRecord, StoreError>;
}

/// Seed account, with a plaintext password hashed at load time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAccount {
    pub email: String,
    pub password: String,
}

/// Contents of the world seed file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldSeed {
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub accounts: Vec<SeedAccount>,
    #[serde(default)]
    pub characters: Vec<CharacterRecord>,
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub configs: Vec<ConfigRecord>,
}

impl WorldSeed {
    /// Read a seed file; a missing file yields an empty world
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "World seed not found, starting with an empty world");
                Ok(Self::default())
            }
            Err(e) => Err(PrecursorsError::Io(e)),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredAccount {
    email: String,
    password: PasswordRecord,
}

/// In-memory `Store`
#[derive(Debug, Default)]
pub struct MemoryStore {
    templates: DashMap<String, Arc<Template>>,
    accounts: DashMap<String, StoredAccount>,
    characters: DashMap<String, CharacterRecord>,
    entities: DashMap<EntityId, EntityRecord>,
    configs: DashMap<String, ConfigRecord>,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a seed, hashing every seed password
    pub fn from_seed(
        seed: WorldSeed,
        credentials: &Argon2Credentials,
        iterations: u32,
    ) -> std::result::Result<Self, AuthError> {
        let store = Self::new();

        for template in seed.templates {
            store.insert_template(template);
        }
        for account in seed.accounts {
            let password = credentials.hash(&account.password, iterations)?;
            store.insert_account(account.email, password);
        }
        for character in seed.characters {
            store.insert_character(character);
        }
        for mut entity in seed.entities {
            let id = entity
                .id
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone();
            store.entities.insert(id, entity);
        }
        for mut config in seed.configs {
            let id = config
                .id
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone();
            store.configs.insert(id, config);
        }

        info!(
            templates = store.templates.len(),
            accounts = store.accounts.len(),
            characters = store.characters.len(),
            entities = store.entities.len(),
            "World seed loaded"
        );
        Ok(store)
    }

    pub fn insert_template(&self, template: Template) {
        self.templates
            .insert(template.name.clone(), Arc::new(template));
    }

    pub fn insert_account(&self, email: impl Into<String>, password: PasswordRecord) {
        let email = email.into();
        self.accounts
            .insert(email.clone(), StoredAccount { email, password });
    }

    pub fn insert_character(&self, character: CharacterRecord) {
        self.characters.insert(character.id.clone(), character);
    }

    /// Make every write fail with a backend error
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn check_writable(&self) -> std::result::Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store is read-only".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn account(&self, email: &str) -> std::result::Result<AccountRecord, StoreError> {
        let account = self
            .accounts
            .get(email)
            .map(|a| a.clone())
            .ok_or_else(|| StoreError::not_found("account", email))?;

        let characters = self
            .characters
            .iter()
            .filter(|c| c.account_id == account.email)
            .map(|c| c.clone())
            .collect();
        let configs = self
            .configs
            .iter()
            .filter(|c| c.account_id.as_deref() == Some(account.email.as_str()))
            .map(|c| c.clone())
            .collect();

        Ok(AccountRecord {
            email: account.email,
            password: account.password,
            characters,
            configs,
        })
    }

    async fn character(&self, id: &str) -> std::result::Result<CharacterRecord, StoreError> {
        self.characters
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| StoreError::not_found("character", id))
    }

    async fn template(&self, name: &str) -> std::result::Result<Arc<Template>, StoreError> {
        self.templates
            .get(name)
            .map(|t| t.clone())
            .ok_or_else(|| StoreError::not_found("template", name))
    }

    async fn entity(&self, id: &str) -> std::result::Result<EntityRecord, StoreError> {
        self.entities
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| StoreError::not_found("entity", id))
    }

    async fn insert_entity(&self, mut record: EntityRecord) -> std::result::Result<EntityRecord, StoreError> {
        self.check_writable()?;
        let id = record
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        self.entities.insert(id.clone(), record.clone());
        debug!(entity_id = %id, template = %record.template, "Entity record inserted");
        Ok(record)
    }

    async fn save_entity(&self, record: &EntityRecord) -> std::result::Result<(), StoreError> {
        self.check_writable()?;
        let id = record
            .id
            .as_ref()
            .ok_or_else(|| StoreError::Backend("cannot save an entity without an id".to_string()))?;
        let mut stored = self
            .entities
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("entity", id.clone()))?;
        *stored = record.clone();
        Ok(())
    }

    async fn delete_entity(&self, id: &str) -> std::result::Result<(), StoreError> {
        self.check_writable()?;
        self.entities
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("entity", id))
    }

    async fn config(&self, id: &str) -> std::result::Result<ConfigRecord, StoreError> {
        self.configs
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| StoreError::not_found("config", id))
    }

    async fn save_config(&self, mut record: ConfigRecord) -> std::result::Result<ConfigRecord, StoreError> {
        self.check_writable()?;
        let id = record
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        self.configs.insert(id, record.clone());
        Ok(record)
    }
}
