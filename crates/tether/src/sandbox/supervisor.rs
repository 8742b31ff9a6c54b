//! Sandbox supervisor: naming discipline, health probing, teardown.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

use super::{CreateSandboxRequest, SandboxApi, SandboxEndpoint};

/// Supervisor policy knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub image: String,
    pub command: String,
    pub port: u16,
    pub idle_timeout_ms: u64,
    /// Total window for the post-provision health probe.
    pub start_timeout: Duration,
    /// Number of probes spread across the window.
    pub health_polls: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            image: "tether-runner:latest".to_string(),
            command: "tether-runner serve".to_string(),
            port: 8420,
            idle_timeout_ms: 15 * 60 * 1000,
            start_timeout: Duration::from_secs(60),
            health_polls: 5,
        }
    }
}

/// Supervises sandbox lifecycles on behalf of session actors.
pub struct SandboxSupervisor {
    api: Arc<dyn SandboxApi>,
    config: SupervisorConfig,
}

impl SandboxSupervisor {
    pub fn new(api: Arc<dyn SandboxApi>, config: SupervisorConfig) -> Self {
        Self { api, config }
    }

    /// Deterministic sandbox handle for a session.
    pub fn handle_for(session_id: &str) -> String {
        format!("sbx-{session_id}")
    }

    /// Provision (or re-attach to) the session's sandbox and wait for it to
    /// come healthy within the configured window.
    pub async fn provision(
        &self,
        session_id: &str,
        callback_token: &str,
    ) -> CoreResult<SandboxEndpoint> {
        let handle = Self::handle_for(session_id);
        let request = CreateSandboxRequest {
            handle: handle.clone(),
            image: self.config.image.clone(),
            command: self.config.command.clone(),
            port: self.config.port,
            callback_token: callback_token.to_string(),
            idle_timeout_ms: self.config.idle_timeout_ms,
            timeout_ms: self.config.start_timeout.as_millis() as u64,
        };

        let endpoint = self.api.get_or_create(request).await?;
        info!(
            session_id,
            sandbox_id = %endpoint.sandbox_id,
            "sandbox provisioned, probing health"
        );

        let polls = self.config.health_polls.max(1);
        let interval = self.config.start_timeout / polls;
        for attempt in 1..=polls {
            if self.api.is_healthy(&endpoint.tunnel_url).await {
                return Ok(endpoint);
            }
            if attempt < polls {
                tokio::time::sleep(interval).await;
            }
        }

        warn!(session_id, handle, "sandbox failed health probe, tearing down");
        if let Err(err) = self.api.terminate(&handle).await {
            warn!(handle, error = %err, "teardown after failed probe also failed");
        }

        Err(CoreError::SandboxUnhealthy(format!(
            "sandbox for session {session_id} not healthy after {polls} probes over {:?}",
            self.config.start_timeout
        )))
    }

    pub async fn terminate(&self, session_id: &str) -> CoreResult<()> {
        let handle = Self::handle_for(session_id);
        self.api.terminate(&handle).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::StubSandbox;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NeverHealthy {
        probes: AtomicU32,
    }

    #[async_trait]
    impl SandboxApi for NeverHealthy {
        async fn get_or_create(
            &self,
            request: CreateSandboxRequest,
        ) -> anyhow::Result<SandboxEndpoint> {
            Ok(SandboxEndpoint {
                sandbox_id: request.handle,
                tunnel_url: "http://127.0.0.1:1".to_string(),
            })
        }

        async fn terminate(&self, _handle: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn is_healthy(&self, _tunnel_url: &str) -> bool {
            self.probes.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            start_timeout: Duration::from_millis(50),
            health_polls: 3,
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn handles_are_deterministic() {
        assert_eq!(SandboxSupervisor::handle_for("ses_a"), "sbx-ses_a");
        assert_eq!(
            SandboxSupervisor::handle_for("ses_a"),
            SandboxSupervisor::handle_for("ses_a")
        );
    }

    #[tokio::test]
    async fn provision_returns_endpoint_when_healthy() {
        let supervisor =
            SandboxSupervisor::new(Arc::new(StubSandbox::new()), fast_config());
        let endpoint = supervisor.provision("ses_ok", "tok").await.unwrap();
        assert_eq!(endpoint.sandbox_id, "stub-sbx-ses_ok");
    }

    #[tokio::test]
    async fn probe_exhaustion_is_sandbox_unhealthy() {
        let api = Arc::new(NeverHealthy { probes: AtomicU32::new(0) });
        let supervisor = SandboxSupervisor::new(api.clone(), fast_config());

        let err = supervisor.provision("ses_bad", "tok").await.unwrap_err();
        assert_eq!(err.code(), "SANDBOX_UNHEALTHY");
        assert_eq!(api.probes.load(Ordering::Relaxed), 3);
    }
}
