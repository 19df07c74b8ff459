//! Physics module
//!
//! Runs the shared rigid-body simulation on its own fixed clock, independent of
//! network I/O and of the replication window.
//!
//! Each tick, in order:
//! 1. pull - every proxy copies logical state into its body and drives its controller
//! 2. step - the engine advances by the wall-clock time since the previous tick
//! 3. push - every proxy copies the simulated state back into its entity

pub mod controller;
pub mod engine;
pub mod math;
pub mod proxy;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::game::entity::{Entity, EntityId};
use engine::{BodyId, PhysicsEngine};
use proxy::{PhysicalSetup, PhysicsProxy};

pub use math::{Quat, Vec3};

/// Physics loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Created, not yet ticking
    Idle,
    /// Ticking on the fixed interval
    Running,
}

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Idle => "Idle",
            LoopState::Running => "Running",
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Fixed-interval driver for the physics engine and its proxies
pub struct PhysicsLoop {
    engine: Mutex<PhysicsEngine>,
    proxies: RwLock<HashMap<BodyId, Arc<PhysicsProxy>>>,
    state: RwLock<LoopState>,
    tick: AtomicU64,
    tick_interval: Duration,
}

impl PhysicsLoop {
    /// Create a loop for an engine running at `simulation_rate` Hz
    pub fn new(simulation_rate: u32) -> Self {
        let engine = PhysicsEngine::new(simulation_rate);
        let tick_interval = Duration::from_secs_f64(1.0 / f64::from(engine.simulation_rate()));

        Self {
            engine: Mutex::new(engine),
            proxies: RwLock::new(HashMap::new()),
            state: RwLock::new(LoopState::Idle),
            tick: AtomicU64::new(0),
            tick_interval,
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Interval between ticks, derived from the simulation rate
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn tick_count(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn body_count(&self) -> usize {
        self.engine.lock().body_count()
    }

    /// Create a body for an entity and register its proxy
    pub fn attach(
        &self,
        entity_id: EntityId,
        entity: Weak<Entity>,
        setup: &PhysicalSetup,
    ) -> Arc<PhysicsProxy> {
        let body = self.engine.lock().add_body(setup.body);
        let proxy = Arc::new(PhysicsProxy::new(entity_id, entity, body, setup));
        self.proxies.write().insert(body, proxy.clone());

        debug!(
            entity_id = %proxy.entity_id(),
            body_id = body,
            "Physics proxy attached"
        );
        proxy
    }

    /// Remove a proxy and its body; returns false if it was not attached
    pub fn detach(&self, proxy: &PhysicsProxy) -> bool {
        let removed = self.proxies.write().remove(&proxy.body_id()).is_some();
        self.engine.lock().remove_body(proxy.body_id());

        if removed {
            debug!(
                entity_id = %proxy.entity_id(),
                body_id = proxy.body_id(),
                "Physics proxy detached"
            );
        }
        removed
    }

    /// Run one pull / step / push cycle
    ///
    /// A proxy whose pull fails or panics is not pushed this tick; one whose push
    /// fails is skipped. The others still run.
    pub fn tick(&self, elapsed: Duration) {
        let dt = elapsed.as_secs_f64();
        let proxies: Vec<Arc<PhysicsProxy>> = self.proxies.read().values().cloned().collect();

        let mut orphaned = Vec::new();
        let mut pulled = Vec::with_capacity(proxies.len());
        let snapshots = {
            let mut engine = self.engine.lock();

            for proxy in &proxies {
                if !proxy.is_bound() {
                    orphaned.push(proxy.clone());
                    continue;
                }
                match catch_unwind(AssertUnwindSafe(|| proxy.sync_to_body(&mut engine, dt))) {
                    Ok(Ok(())) => pulled.push(proxy.clone()),
                    Ok(Err(e)) => {
                        warn!(
                            entity_id = %proxy.entity_id(),
                            error = %e,
                            "Physics pull failed"
                        );
                    }
                    Err(_) => {
                        error!(entity_id = %proxy.entity_id(), "Physics pull panicked");
                    }
                }
            }

            let reset = engine.step(dt);
            if !reset.is_empty() {
                warn!(count = reset.len(), "Bodies reset after non-finite step");
            }

            // A proxy that failed its pull would push stale body state over its entity
            pulled
                .into_iter()
                .filter(|p| p.is_bound())
                .filter_map(|p| p.snapshot(&engine).map(|k| (p, k)))
                .collect::<Vec<_>>()
        };

        for (proxy, kinematics) in snapshots {
            match catch_unwind(AssertUnwindSafe(|| proxy.sync_to_model(kinematics))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        entity_id = %proxy.entity_id(),
                        error = %e,
                        "Physics push failed"
                    );
                }
                Err(_) => {
                    error!(entity_id = %proxy.entity_id(), "Physics push panicked");
                }
            }
        }

        for proxy in orphaned {
            warn!(
                entity_id = %proxy.entity_id(),
                "Detaching body whose entity no longer exists"
            );
            self.detach(&proxy);
        }

        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        if tick % 3600 == 0 {
            debug!(tick = tick, proxies = proxies.len(), "Physics tick milestone");
        }
    }

    /// Transition `Idle -> Running` and spawn the tick task
    ///
    /// Returns `None` if the loop is already running.
    pub fn start(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        {
            let mut state = self.state.write();
            if *state == LoopState::Running {
                warn!("Physics loop already running");
                return None;
            }
            *state = LoopState::Running;
        }

        let this = self.clone();
        Some(tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            this.run(&mut shutdown_rx).await;
        }))
    }

    async fn run(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            "Starting physics loop"
        );

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_tick);
                    last_tick = now;

                    if catch_unwind(AssertUnwindSafe(|| self.tick(elapsed))).is_err() {
                        error!(tick = self.tick_count(), "Physics tick panicked");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Physics loop received shutdown signal");
                    break;
                }
            }
        }

        info!(total_ticks = self.tick_count(), "Physics loop stopped");
    }
}

impl std::fmt::Debug for PhysicsLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsLoop")
            .field("state", &self.state())
            .field("tick", &self.tick_count())
            .field("proxies", &self.proxy_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::manager::EntityListener;
    use crate::game::testing::harness;
    use crate::net::session::SessionId;
    use serde_json::{json, Map, Value};

    /// Panics whenever one entity replicates
    struct PanicOn(String);

    impl EntityListener for PanicOn {
        fn entity_loaded(&self, _entity: &Arc<Entity>, _cause: Option<SessionId>) {}

        fn entity_unloaded(&self, _id: &str) {}

        fn entity_updated(&self, id: &str, _payload: &Value) {
            if id == self.0 {
                panic!("listener failure for {}", id);
            }
        }
    }

    fn teleport(entity: &Entity, x: f64, speed: f64) {
        entity.set("position", json!({ "x": x, "y": 0.0, "z": 0.0 }));
        entity.set("linearVelocity", json!({ "x": speed, "y": 0.0, "z": 0.0 }));
    }

    fn position(entity: &Entity) -> Vec3 {
        entity.get_as("position").unwrap().unwrap()
    }

    #[test]
    fn test_tick_interval_from_rate() {
        let physics = PhysicsLoop::new(50);
        assert_eq!(physics.tick_interval(), Duration::from_millis(20));
        assert_eq!(physics.state(), LoopState::Idle);
    }

    #[test]
    fn test_orphaned_proxy_is_detached() {
        let physics = PhysicsLoop::new(60);
        let setup = PhysicalSetup {
            body: engine::BodyDesc::default(),
            params: controller::ControllerParams::default(),
            target_linear: Vec3::ZERO,
            target_angular: Vec3::ZERO,
        };
        physics.attach("ghost".to_string(), Weak::new(), &setup);
        assert_eq!(physics.proxy_count(), 1);

        physics.tick(Duration::from_millis(16));
        assert_eq!(physics.proxy_count(), 0);
        assert_eq!(physics.body_count(), 0);
        assert_eq!(physics.tick_count(), 1);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let physics = Arc::new(PhysicsLoop::new(60));
        let (tx, _) = broadcast::channel(1);

        let handle = physics.start(tx.subscribe());
        assert!(handle.is_some());
        assert!(physics.is_running());
        assert!(physics.start(tx.subscribe()).is_none());

        tx.send(()).unwrap();
        handle.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_pulls_teleport_and_pushes_result() {
        let h = harness();
        let entity = h.manager.create("Crate", None, Map::new()).await.unwrap();
        h.listener.clear();

        teleport(&entity, 50.0, 10.0);
        h.physics.tick(Duration::from_millis(100));

        // Controller closes 20% of the velocity error, then the body moves at the new speed
        let velocity: Vec3 = entity.get_as("linearVelocity").unwrap().unwrap();
        assert!(velocity.approx_eq(Vec3::new(8.0, 0.0, 0.0), 1e-9));
        assert!(position(&entity).approx_eq(Vec3::new(50.8, 0.0, 0.0), 1e-9));

        let updates = h.listener.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["id"], entity.id());
        assert!((updates[0]["position"]["x"].as_f64().unwrap() - 50.8).abs() < 1e-9);
        assert!((updates[0]["linearVelocity"]["x"].as_f64().unwrap() - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_malformed_state_skips_only_its_proxy() {
        let h = harness();
        let broken = h.manager.create("Crate", None, Map::new()).await.unwrap();
        let healthy = h.manager.create("Crate", None, Map::new()).await.unwrap();
        h.listener.clear();

        broken.set("position", json!("bad"));
        teleport(&healthy, 5.0, 10.0);
        h.physics.tick(Duration::from_millis(100));

        assert_eq!(broken.get("position"), Some(json!("bad")));
        assert!(position(&healthy).approx_eq(Vec3::new(5.8, 0.0, 0.0), 1e-9));

        let updates = h.listener.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["id"], healthy.id());
    }

    #[tokio::test]
    async fn test_panicking_push_skips_only_its_proxy() {
        let h = harness();
        let doomed = h.manager.create("Crate", None, Map::new()).await.unwrap();
        let healthy = h.manager.create("Crate", None, Map::new()).await.unwrap();

        let panicker = Arc::new(PanicOn(doomed.id().to_string()));
        let weak = Arc::downgrade(&panicker);
        h.manager.subscribe(weak);

        teleport(&doomed, 0.0, 10.0);
        teleport(&healthy, 0.0, 10.0);
        h.physics.tick(Duration::from_millis(100));

        assert!(position(&healthy).approx_eq(Vec3::new(0.8, 0.0, 0.0), 1e-9));
        assert!(h
            .listener
            .updates()
            .iter()
            .any(|payload| payload["id"] == healthy.id()));
        assert_eq!(h.physics.tick_count(), 1);

        // The failing entity keeps simulating on later ticks
        h.physics.tick(Duration::from_millis(100));
        assert!(position(&doomed).x > 0.8);
    }

    #[tokio::test]
    async fn test_controller_tuning_applies_at_runtime() {
        let h = harness();
        let entity = h.manager.create("Crate", None, Map::new()).await.unwrap();
        let proxy = entity.physical().unwrap().proxy().unwrap();

        entity.set("targetLinearVelocity", json!({ "x": 50.0, "y": 0.0, "z": 0.0 }));
        h.physics.tick(Duration::from_millis(16));
        assert_eq!(proxy.target_linear_velocity(), Vec3::new(50.0, 0.0, 0.0));

        entity.set("maxSpeed", json!({ "x": 20.0, "y": 50.0, "z": 50.0 }));
        entity.set("turnRate", json!(45.0));
        h.physics.tick(Duration::from_millis(16));

        let params = proxy.controller_params();
        assert_eq!(params.max_speed, Vec3::new(20.0, 50.0, 50.0));
        assert_eq!(params.turn_rate, 45.0);
        assert_eq!(proxy.target_linear_velocity(), Vec3::new(20.0, 0.0, 0.0));
    }
}
