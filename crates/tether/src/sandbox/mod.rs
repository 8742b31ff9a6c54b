//! Sandbox provisioning: the interface the control plane consumes, the
//! supervisor that enforces health and naming discipline, and the backends.

mod http;
mod local;
mod supervisor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpSandbox;
pub use local::LocalSandbox;
pub use supervisor::{SandboxSupervisor, SupervisorConfig};

/// Request to create (or look up) a named sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    /// Deterministic handle derived from the session id, so lookups after a
    /// control-plane restart need no external bookkeeping.
    pub handle: String,
    pub image: String,
    pub command: String,
    pub port: u16,
    /// Token the runner presents when dialing back to the control plane.
    pub callback_token: String,
    /// Efficiency hint only; correctness never depends on it.
    pub idle_timeout_ms: u64,
    /// Provisioning deadline.
    pub timeout_ms: u64,
}

/// Addressable endpoint of a provisioned sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEndpoint {
    pub sandbox_id: String,
    pub tunnel_url: String,
}

/// Provisioner interface. Implementations create, address, and terminate
/// remote sandboxes; everything behind this trait is out of scope for the
/// control plane.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    /// Idempotent per handle: an existing live sandbox is returned as-is.
    async fn get_or_create(&self, request: CreateSandboxRequest)
        -> anyhow::Result<SandboxEndpoint>;

    async fn terminate(&self, handle: &str) -> anyhow::Result<()>;

    async fn is_healthy(&self, tunnel_url: &str) -> bool;
}

/// Inert backend for tests: always healthy, records nothing but the handles
/// it has seen.
#[derive(Debug, Default)]
pub struct StubSandbox {
    created: dashmap::DashSet<String>,
}

impl StubSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_created(&self, handle: &str) -> bool {
        self.created.contains(handle)
    }
}

#[async_trait]
impl SandboxApi for StubSandbox {
    async fn get_or_create(
        &self,
        request: CreateSandboxRequest,
    ) -> anyhow::Result<SandboxEndpoint> {
        self.created.insert(request.handle.clone());
        Ok(SandboxEndpoint {
            sandbox_id: format!("stub-{}", request.handle),
            tunnel_url: format!("stub://{}", request.handle),
        })
    }

    async fn terminate(&self, handle: &str) -> anyhow::Result<()> {
        self.created.remove(handle);
        Ok(())
    }

    async fn is_healthy(&self, _tunnel_url: &str) -> bool {
        true
    }
}
