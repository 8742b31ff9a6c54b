//! Production step effects: steps act through workflow-owned sessions.
//!
//! Each execution gets a deterministic workspace; the session behind it is
//! created hibernated and woken only when a step needs it. Awaited steps
//! poll the durable message log for the runner's finalized reply, so an
//! engine restart mid-wait loses nothing.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::session::SessionService;

use super::engine::{EffectContext, StepEffects};

const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct SessionStepEffects {
    sessions: Arc<SessionService>,
}

impl SessionStepEffects {
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self { sessions }
    }

    async fn ensure_session(&self, ctx: &EffectContext) -> anyhow::Result<String> {
        if let Some(existing) = self
            .sessions
            .find_workflow_session(&ctx.user_id, &ctx.workspace)
            .await?
        {
            return Ok(existing.id);
        }

        let session = self
            .sessions
            .create_workflow_session(
                &ctx.user_id,
                ctx.workspace.clone(),
                format!("workflow {}", ctx.workflow_id),
            )
            .await?;
        debug!(
            session_id = %session.id,
            execution_id = %ctx.execution_id,
            "created workflow-owned session"
        );
        Ok(session.id)
    }

    async fn deliver(
        &self,
        ctx: &EffectContext,
        content: &str,
        await_response: bool,
        timeout_ms: u64,
    ) -> anyhow::Result<Option<String>> {
        let session_id = self.ensure_session(ctx).await?;
        let message_id = self
            .sessions
            .session_message(&ctx.user_id, &session_id, content, None, false)
            .await?;

        if !await_response {
            return Ok(None);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(reply) = self.sessions.find_reply(&message_id).await? {
                return Ok(Some(reply));
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "no agent response to {message_id} within {timeout_ms}ms"
                );
            }
            tokio::time::sleep(REPLY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl StepEffects for SessionStepEffects {
    async fn invoke_tool(
        &self,
        ctx: &EffectContext,
        tool: &str,
        args: &Value,
    ) -> anyhow::Result<Value> {
        let content = format!("Invoke tool `{tool}` with arguments:\n{args}");
        let reply = self.deliver(ctx, &content, true, 60_000).await?;
        Ok(json!({ "tool": tool, "output": reply }))
    }

    async fn send_agent_message(
        &self,
        ctx: &EffectContext,
        content: &str,
        await_response: bool,
        timeout_ms: u64,
    ) -> anyhow::Result<Option<String>> {
        self.deliver(ctx, content, await_response, timeout_ms).await
    }
}
