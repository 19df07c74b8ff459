//! Game module
//!
//! The entity lifecycle and synchronization layer:
//! - Templates and layered entity state
//! - Entities and their capability layers (physical, actor, ship)
//! - Combat resolution and powers
//! - The entity manager and its listener notifications
//! - Throttled state replication
//! - Persistence

pub mod capability;
pub mod combat;
pub mod entity;
pub mod manager;
pub mod overlay;
pub mod persistence;
pub mod powers;
pub mod sync;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;

pub use entity::{Entity, EntityId};
pub use manager::{EntityListener, EntityManager};
pub use template::{BehaviorKind, Template};
