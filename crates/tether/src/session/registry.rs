//! Registry of live session actors.
//!
//! One single-writer actor per session id, created on demand. Callers post
//! commands through `ActorHandle`; per-session serialization comes from
//! actor identity, not database locks.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::bus::EventBus;
use crate::sandbox::SandboxSupervisor;

use super::actor::{self, ActorHandle, ActorTiming};
use super::repository::SessionRepository;

/// Bounded actor inbox; overflow surfaces `BUSY` to callers.
const ACTOR_QUEUE_CAPACITY: usize = 64;

/// Shared dependencies handed to every actor.
#[derive(Clone)]
pub(crate) struct ActorDeps {
    pub repo: SessionRepository,
    pub bus: Arc<EventBus>,
    pub supervisor: Arc<SandboxSupervisor>,
    pub timing: ActorTiming,
}

/// Maps session id -> live actor handle, spawning on first use.
#[derive(Clone)]
pub struct SessionRegistry {
    actors: Arc<DashMap<String, ActorHandle>>,
    deps: ActorDeps,
}

impl SessionRegistry {
    pub fn new(
        repo: SessionRepository,
        bus: Arc<EventBus>,
        supervisor: Arc<SandboxSupervisor>,
    ) -> Self {
        Self::with_timing(repo, bus, supervisor, ActorTiming::default())
    }

    pub fn with_timing(
        repo: SessionRepository,
        bus: Arc<EventBus>,
        supervisor: Arc<SandboxSupervisor>,
        timing: ActorTiming,
    ) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            deps: ActorDeps { repo, bus, supervisor, timing },
        }
    }

    /// Handle for the session's actor, spawning it if absent or dead.
    pub fn handle(&self, session_id: &str) -> ActorHandle {
        if let Some(existing) = self.actors.get(session_id) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        // Entry may exist but point at a finished task (e.g. a terminated
        // session); respawn so callers get a live responder.
        let handle = self.spawn(session_id);
        self.actors.insert(session_id.to_string(), handle.clone());
        handle
    }

    fn spawn(&self, session_id: &str) -> ActorHandle {
        let (tx, rx) = mpsc::channel(ACTOR_QUEUE_CAPACITY);
        let handle = ActorHandle::new(session_id.to_string(), tx, self.deps.timing.call_deadline);
        tokio::spawn(actor::run(self.deps.clone(), session_id.to_string(), rx));
        handle
    }

    pub fn live_actor_count(&self) -> usize {
        self.actors.iter().filter(|e| !e.value().is_closed()).count()
    }
}

impl Default for ActorTiming {
    fn default() -> Self {
        Self {
            call_deadline: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            terminate_grace: Duration::from_secs(2),
        }
    }
}
