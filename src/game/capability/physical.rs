//! Physical capability: a body in the shared physics simulation

use std::sync::Arc;

use parking_lot::RwLock;

use super::Capability;
use crate::error::EntityError;
use crate::game::entity::Entity;
use crate::physics::proxy::{PhysicalSetup, PhysicsProxy};

pub struct Physical {
    setup: PhysicalSetup,
    proxy: RwLock<Option<Arc<PhysicsProxy>>>,
}

impl Physical {
    pub fn new(setup: PhysicalSetup) -> Self {
        Self {
            setup,
            proxy: RwLock::new(None),
        }
    }

    /// The attached proxy; `None` before install and after teardown
    pub fn proxy(&self) -> Option<Arc<PhysicsProxy>> {
        self.proxy.read().clone()
    }

    pub fn require_proxy(&self, entity: &Entity) -> Result<Arc<PhysicsProxy>, EntityError> {
        self.proxy()
            .ok_or_else(|| EntityError::MissingCapability(entity.id().to_string(), "physics body"))
    }
}

impl Capability for Physical {
    fn name(&self) -> &'static str {
        "physical"
    }

    fn install(&self, entity: &Entity) -> Result<(), EntityError> {
        let proxy = entity.context().physics.attach(
            entity.id().to_string(),
            entity.downgrade(),
            &self.setup,
        );
        *self.proxy.write() = Some(proxy);
        Ok(())
    }

    fn teardown(&self, entity: &Entity) {
        let proxy = self.proxy.write().take();
        if let Some(proxy) = proxy {
            entity.context().physics.detach(&proxy);
        }
    }
}

impl std::fmt::Debug for Physical {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Physical")
            .field("body", &self.proxy().map(|p| p.body_id()))
            .finish()
    }
}
