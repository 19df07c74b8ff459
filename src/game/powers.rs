//! Powers
//!
//! A power is an ability an actor declares in `state.powers`. Each declared name is
//! resolved once, when the actor is built, to a module in the `PowerRegistry`.
//! Cooldowns live in the actor's state as `powers.<name>.coolDownEnds` (epoch ms),
//! so they persist with the entity and replicate like any other field.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::combat::{resolve_attack, CombatStats, Outcome};
use super::entity::{Entity, EntityId};
use crate::error::EntityError;

pub const BASIC_ATTACK: &str = "basic_attack";
pub const BASIC_HEAL: &str = "basic_heal";

/// Damage or healing per tier before severity scaling
const BASE_AMOUNT: f64 = 10.0;

/// Healing another actor is less effective than healing yourself
const HEAL_OTHER_FACTOR: f64 = 0.75;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// What an activation did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum Activation {
    Applied {
        outcome: Outcome,
        severity: f64,
        amount: f64,
        target: EntityId,
    },
    CoolingDown {
        remaining_ms: u64,
    },
    /// Missing, self-targeted or non-actor target
    InvalidTarget,
    /// The user was unloaded while the activation was in flight
    Abandoned,
}

/// An activatable ability
#[async_trait]
pub trait Power: Send + Sync {
    /// Key under `state.powers`
    fn name(&self) -> &'static str;

    fn cooldown(&self) -> Duration;

    async fn activate(
        &self,
        user: &Arc<Entity>,
        target: Option<Arc<Entity>>,
    ) -> Result<Activation, EntityError>;
}

/// Power modules by name
#[derive(Default)]
pub struct PowerRegistry {
    powers: HashMap<String, Arc<dyn Power>>,
}

impl PowerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in powers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BasicAttack));
        registry.register(Arc::new(BasicHeal));
        registry
    }

    pub fn register(&mut self, power: Arc<dyn Power>) {
        self.powers.insert(power.name().to_string(), power);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Power>> {
        self.powers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.powers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.powers.is_empty()
    }
}

impl std::fmt::Debug for PowerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.powers.keys()).finish()
    }
}

fn cooling_down(user: &Entity, power: &str, now: i64) -> Result<Option<Activation>, EntityError> {
    let remaining = user.require_actor()?.cooldown_remaining(power, now);
    Ok((remaining > 0).then(|| Activation::CoolingDown {
        remaining_ms: remaining,
    }))
}

/// Persist the target, then record the cooldown if the user survived the wait
async fn finish(
    power: &dyn Power,
    user: &Arc<Entity>,
    target: &Arc<Entity>,
    now: i64,
) -> Result<bool, EntityError> {
    if let Err(e) = target.save().await {
        warn!(entity_id = %target.id(), error = %e, "Failed to save power target");
    }

    if !user.is_live() {
        warn!(
            entity_id = %user.id(),
            power = power.name(),
            "User unloaded during power activation"
        );
        return Ok(false);
    }

    let ends = now + i64::try_from(power.cooldown().as_millis()).unwrap_or(i64::MAX);
    user.require_actor()?.start_cooldown(power.name(), ends)?;
    Ok(true)
}

/// Single-target attack
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAttack;

#[async_trait]
impl Power for BasicAttack {
    fn name(&self) -> &'static str {
        BASIC_ATTACK
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(1000)
    }

    async fn activate(
        &self,
        user: &Arc<Entity>,
        target: Option<Arc<Entity>>,
    ) -> Result<Activation, EntityError> {
        let now = now_millis();
        if let Some(cooling) = cooling_down(user, self.name(), now)? {
            return Ok(cooling);
        }

        let target = match target {
            Some(target) if target.id() != user.id() && target.as_actor().is_some() => target,
            _ => return Ok(Activation::InvalidTarget),
        };

        let (outcome, severity, amount) = {
            let attacker = user.require_actor()?;
            let defender = target.require_actor()?;
            let base = BASE_AMOUNT * f64::from(attacker.tier());

            let result = {
                let mut rng = rand::thread_rng();
                resolve_attack(&attacker.stats(), &defender.stats(), &mut rng)?
            };
            let amount = match result.outcome {
                Outcome::Crit => base + base * result.severity,
                Outcome::Hit => base,
                Outcome::Block => base * result.severity,
                Outcome::Dodge => 0.0,
            };
            defender.damage(amount);
            (result.outcome, result.severity, amount)
        };

        debug!(
            user = %user.id(),
            target = %target.id(),
            outcome = %outcome,
            amount = amount,
            "Basic attack resolved"
        );

        if !finish(self, user, &target, now).await? {
            return Ok(Activation::Abandoned);
        }
        Ok(Activation::Applied {
            outcome,
            severity,
            amount,
            target: target.id().to_string(),
        })
    }
}

/// Single-target heal, defaulting to the user
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicHeal;

#[async_trait]
impl Power for BasicHeal {
    fn name(&self) -> &'static str {
        BASIC_HEAL
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(3000)
    }

    async fn activate(
        &self,
        user: &Arc<Entity>,
        target: Option<Arc<Entity>>,
    ) -> Result<Activation, EntityError> {
        let now = now_millis();
        if let Some(cooling) = cooling_down(user, self.name(), now)? {
            return Ok(cooling);
        }

        let target = target.unwrap_or_else(|| user.clone());
        if target.as_actor().is_none() {
            return Ok(Activation::InvalidTarget);
        }

        let (outcome, severity, amount) = {
            let healer = user.require_actor()?;
            let patient = target.require_actor()?;
            let mut base = BASE_AMOUNT * f64::from(healer.tier());
            if target.id() != user.id() {
                base *= HEAL_OTHER_FACTOR;
            }

            // Healing cannot be blocked or dodged
            let result = {
                let mut rng = rand::thread_rng();
                resolve_attack(&healer.stats(), &CombatStats::default(), &mut rng)?
            };
            let amount = match result.outcome {
                Outcome::Crit => base + base * result.severity,
                Outcome::Hit => base,
                Outcome::Block | Outcome::Dodge => 0.0,
            };
            patient.heal(amount);
            (result.outcome, result.severity, amount)
        };

        debug!(
            user = %user.id(),
            target = %target.id(),
            outcome = %outcome,
            amount = amount,
            "Basic heal resolved"
        );

        if !finish(self, user, &target, now).await? {
            return Ok(Activation::Abandoned);
        }
        Ok(Activation::Applied {
            outcome,
            severity,
            amount,
            target: target.id().to_string(),
        })
    }
}
