//! Capability layers
//!
//! Each behavior kind is the Base entity plus an ordered stack of layers:
//!
//! | kind | layers |
//! |---|---|
//! | base | - |
//! | physical | `Physical` |
//! | actor | `Physical`, `Actor` |
//! | ship | `Physical`, `Actor`, `Ship` |
//!
//! A layer owns the state fields it reads, installs its handlers through the
//! entity's public registration surface and undoes its side effects on teardown.
//! Layers are installed in order and torn down in reverse.

pub mod actor;
pub mod physical;
pub mod ship;

pub use actor::{Actor, ActorView};
pub use physical::Physical;
pub use ship::Ship;

use super::entity::Entity;
use crate::error::EntityError;

/// One composable behavior layer
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attach resources and register handlers on a freshly built entity
    fn install(&self, entity: &Entity) -> Result<(), EntityError>;

    /// Release what `install` acquired; handlers are cleared by the entity
    fn teardown(&self, _entity: &Entity) {}
}
