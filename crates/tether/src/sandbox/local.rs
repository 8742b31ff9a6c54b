//! Local sandbox backend for development and tests.
//!
//! Instead of provisioning a remote VM, this backend spawns an in-process
//! stub runner that dials the control plane's runner WebSocket and echoes
//! prompts back, exercising the full wire protocol.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_protocol::{decode_control_frame, AgentStatus, ControlFrame, ModelInfo, RunnerFrame};

use super::{CreateSandboxRequest, SandboxApi, SandboxEndpoint};

/// Reconnect backoff: exponential from 500 ms, capped at 30 s, ±20% jitter.
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;

pub struct LocalSandbox {
    /// WebSocket base of the control plane, e.g. `ws://127.0.0.1:4180`.
    plane_ws_base: String,
    runners: DashMap<String, CancellationToken>,
}

impl LocalSandbox {
    pub fn new(plane_ws_base: impl Into<String>) -> Self {
        Self {
            plane_ws_base: plane_ws_base.into(),
            runners: DashMap::new(),
        }
    }

    fn session_id_of(handle: &str) -> &str {
        handle.strip_prefix("sbx-").unwrap_or(handle)
    }
}

#[async_trait]
impl SandboxApi for LocalSandbox {
    async fn get_or_create(
        &self,
        request: CreateSandboxRequest,
    ) -> Result<SandboxEndpoint> {
        let handle = request.handle.clone();

        if !self.runners.contains_key(&handle) {
            let cancel = CancellationToken::new();
            self.runners.insert(handle.clone(), cancel.clone());

            let session_id = Self::session_id_of(&handle).to_string();
            let url = format!(
                "{}/api/runner/ws/{}?token={}",
                self.plane_ws_base, session_id, request.callback_token
            );
            tokio::spawn(run_stub_runner(url, session_id, cancel));
        }

        Ok(SandboxEndpoint {
            sandbox_id: format!("local-{handle}"),
            tunnel_url: format!("local://{handle}"),
        })
    }

    async fn terminate(&self, handle: &str) -> Result<()> {
        if let Some((_, cancel)) = self.runners.remove(handle) {
            cancel.cancel();
        }
        Ok(())
    }

    async fn is_healthy(&self, _tunnel_url: &str) -> bool {
        true
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(6)).min(BACKOFF_CAP_MS);
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Dial the control plane and behave like a minimal echo agent, reconnecting
/// with backoff until cancelled.
async fn run_stub_runner(url: String, session_id: String, cancel: CancellationToken) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match connect_async(&url).await {
            Ok((stream, _response)) => {
                attempt = 0;
                info!(session_id, "stub runner connected");
                if serve_connection(stream, &session_id, &cancel).await {
                    return;
                }
            }
            Err(err) => {
                debug!(session_id, error = %err, "stub runner dial failed");
            }
        }

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Returns true when the runner should stop for good.
async fn serve_connection<S>(
    stream: tokio_tungstenite::WebSocketStream<S>,
    session_id: &str,
    cancel: &CancellationToken,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();

    let hello = [
        RunnerFrame::Models {
            models: vec![ModelInfo {
                id: "echo".to_string(),
                display_name: Some("Echo".to_string()),
                is_default: true,
            }],
        },
        RunnerFrame::AgentStatus { status: AgentStatus::Idle, detail: None },
    ];
    for frame in hello {
        if send_frame(&mut sink, &frame).await.is_err() {
            return false;
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return true;
            }

            maybe = source.next() => {
                let msg = match maybe {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        debug!(session_id, error = %err, "stub runner socket error");
                        return false;
                    }
                    None => return false,
                };

                let text = match msg {
                    Message::Text(text) => text.to_string(),
                    Message::Close(_) => return false,
                    Message::Ping(_) | Message::Pong(_) => continue,
                    _ => continue,
                };

                let frame = match decode_control_frame(&text) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        warn!(session_id, "stub runner ignoring unknown control frame");
                        continue;
                    }
                    Err(err) => {
                        warn!(session_id, error = %err, "stub runner got malformed frame");
                        continue;
                    }
                };

                match frame {
                    ControlFrame::Prompt { message_id, content, .. } => {
                        let replies = [
                            RunnerFrame::AgentStatus {
                                status: AgentStatus::Responding,
                                detail: None,
                            },
                            RunnerFrame::Stream {
                                message_id: message_id.clone(),
                                content: format!("echo: {content}"),
                            },
                            RunnerFrame::Result {
                                message_id,
                                content: format!("echo: {content}"),
                            },
                            RunnerFrame::Complete,
                            RunnerFrame::AgentStatus {
                                status: AgentStatus::Idle,
                                detail: None,
                            },
                        ];
                        for reply in replies {
                            if send_frame(&mut sink, &reply).await.is_err() {
                                return false;
                            }
                        }
                    }
                    ControlFrame::Answer { .. } => {}
                    ControlFrame::Abort => {
                        let replies = [
                            RunnerFrame::Aborted,
                            RunnerFrame::AgentStatus {
                                status: AgentStatus::Idle,
                                detail: None,
                            },
                        ];
                        for reply in replies {
                            if send_frame(&mut sink, &reply).await.is_err() {
                                return false;
                            }
                        }
                    }
                    ControlFrame::Stop => {
                        let _ = sink.send(Message::Close(None)).await;
                        return true;
                    }
                    ControlFrame::Revert { message_id } => {
                        let reply = RunnerFrame::Reverted { message_ids: vec![message_id] };
                        if send_frame(&mut sink, &reply).await.is_err() {
                            return false;
                        }
                    }
                    ControlFrame::Diff { request_id } => {
                        let reply = RunnerFrame::Diff { request_id, data: String::new() };
                        if send_frame(&mut sink, &reply).await.is_err() {
                            return false;
                        }
                    }
                    ControlFrame::Ping => {
                        if send_frame(&mut sink, &RunnerFrame::Pong).await.is_err() {
                            return false;
                        }
                    }
                }
            }
        }
    }
}

async fn send_frame<S>(
    sink: &mut futures::stream::SplitSink<tokio_tungstenite::WebSocketStream<S>, Message>,
    frame: &RunnerFrame,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let early = backoff_delay(0);
        assert!(early >= Duration::from_millis(400) && early <= Duration::from_millis(600));

        let late = backoff_delay(20);
        assert!(late <= Duration::from_millis(36_000));
        assert!(late >= Duration::from_millis(24_000));
    }

    #[test]
    fn handle_maps_back_to_session_id() {
        assert_eq!(LocalSandbox::session_id_of("sbx-ses_42"), "ses_42");
        assert_eq!(LocalSandbox::session_id_of("bare"), "bare");
    }
}
