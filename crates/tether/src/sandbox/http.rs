//! HTTP backend driving a remote sandbox provisioner.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{CreateSandboxRequest, SandboxApi, SandboxEndpoint};

/// Sandbox backend speaking to a remote provisioner service.
pub struct HttpSandbox {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    sandbox_id: String,
    tunnel_url: String,
}

impl HttpSandbox {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .context("building sandbox HTTP client")?;
        Ok(Self { base_url: base_url.into(), client })
    }
}

#[async_trait]
impl SandboxApi for HttpSandbox {
    async fn get_or_create(
        &self,
        request: CreateSandboxRequest,
    ) -> Result<SandboxEndpoint> {
        let url = format!("{}/sandboxes", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("requesting sandbox")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("provisioner refused sandbox: {status} - {body}");
        }

        let body: ProvisionResponse =
            response.json().await.context("decoding provisioner response")?;
        Ok(SandboxEndpoint {
            sandbox_id: body.sandbox_id,
            tunnel_url: body.tunnel_url,
        })
    }

    async fn terminate(&self, handle: &str) -> Result<()> {
        let url = format!("{}/sandboxes/{handle}", self.base_url);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .context("terminating sandbox")?;

        // Already gone counts as terminated.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            anyhow::bail!("provisioner failed to terminate {handle}: {}", response.status());
        }
        Ok(())
    }

    async fn is_healthy(&self, tunnel_url: &str) -> bool {
        let url = format!("{}/healthz", tunnel_url.trim_end_matches('/'));
        match self.client.get(&url).timeout(Duration::from_secs(5)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
