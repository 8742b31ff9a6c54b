//! Per-session actor: the single writer for one session's state.
//!
//! All mutation of a session (status, message log, runner link) funnels
//! through its actor task. Callers post commands over a bounded mailbox and
//! await typed replies; the runner WebSocket posts decoded frames the same
//! way. Prompts are served strictly FIFO, and an interrupting prompt is held
//! until the runner acknowledges the abort.

use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_protocol::{AgentStatus, ControlFrame, RunnerFrame};

use crate::bus::BusEvent;
use crate::error::{CoreError, CoreResult};
use crate::ids::{new_id, now_ts};

use super::models::{can_transition, Message, MessageRole, Session, SessionStatus};
use super::registry::ActorDeps;

type Reply<T> = oneshot::Sender<CoreResult<T>>;

/// Actor timing knobs; tests shrink these.
#[derive(Debug, Clone, Copy)]
pub struct ActorTiming {
    pub call_deadline: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub terminate_grace: Duration,
}

/// A prompt to deliver to this session's runner.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub content: String,
    pub model: Option<String>,
    pub interrupt: bool,
    pub channel_type: String,
    pub channel_id: Option<String>,
}

impl PromptRequest {
    pub fn chat(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: None,
            interrupt: false,
            channel_type: "chat".to_string(),
            channel_id: None,
        }
    }

    /// A user-role message delivered from another session.
    pub fn from_session(content: impl Into<String>, from: &str, interrupt: bool) -> Self {
        Self {
            content: content.into(),
            model: None,
            interrupt,
            channel_type: "session".to_string(),
            channel_id: Some(from.to_string()),
        }
    }
}

/// Commands a session actor processes serially.
pub enum SessionCommand {
    Start { reply: Reply<()> },
    Prompt { request: PromptRequest, reply: Reply<String> },
    Answer { question_id: String, value: String, reply: Reply<()> },
    Forward { from: String, limit: i64, after: Option<String>, reply: Reply<usize> },
    Hibernate { reply: Reply<()> },
    Terminate { reply: Reply<()> },
    Heartbeat { reply: Reply<()> },
    Status { reply: Reply<SessionStatus> },
    Revert { message_id: String, reply: Reply<()> },
    RequestDiff { request_id: String, reply: Reply<()> },
    RunnerAttached { sender: mpsc::Sender<ControlFrame>, reply: Reply<()> },
    RunnerClosed,
    RunnerFrame { frame: RunnerFrame },
}

/// Addressable handle to a session actor.
#[derive(Clone)]
pub struct ActorHandle {
    session_id: String,
    tx: mpsc::Sender<SessionCommand>,
    call_deadline: Duration,
}

impl ActorHandle {
    pub(crate) fn new(
        session_id: String,
        tx: mpsc::Sender<SessionCommand>,
        call_deadline: Duration,
    ) -> Self {
        Self { session_id, tx, call_deadline }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> CoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.try_send(build(reply_tx)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                CoreError::Busy(format!("session {} actor queue full", self.session_id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                CoreError::internal(format!("session {} actor is gone", self.session_id))
            }
        })?;

        match tokio::time::timeout(self.call_deadline, reply_rx).await {
            Err(_) => Err(CoreError::Timeout(format!(
                "session {} actor call exceeded {:?}",
                self.session_id, self.call_deadline
            ))),
            Ok(Err(_)) => Err(CoreError::internal(format!(
                "session {} actor dropped its reply",
                self.session_id
            ))),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn start(&self) -> CoreResult<()> {
        self.call(|reply| SessionCommand::Start { reply }).await
    }

    /// Enqueue a prompt; returns the message id it will be written under.
    pub async fn prompt(&self, request: PromptRequest) -> CoreResult<String> {
        self.call(|reply| SessionCommand::Prompt { request, reply }).await
    }

    pub async fn answer(&self, question_id: String, value: String) -> CoreResult<()> {
        self.call(|reply| SessionCommand::Answer { question_id, value, reply }).await
    }

    /// Copy messages from another session into this one. Returns the number
    /// of new rows written.
    pub async fn forward_from(
        &self,
        from: String,
        limit: i64,
        after: Option<String>,
    ) -> CoreResult<usize> {
        self.call(|reply| SessionCommand::Forward { from, limit, after, reply }).await
    }

    pub async fn hibernate(&self) -> CoreResult<()> {
        self.call(|reply| SessionCommand::Hibernate { reply }).await
    }

    pub async fn terminate(&self) -> CoreResult<()> {
        self.call(|reply| SessionCommand::Terminate { reply }).await
    }

    pub async fn heartbeat(&self) -> CoreResult<()> {
        self.call(|reply| SessionCommand::Heartbeat { reply }).await
    }

    pub async fn status(&self) -> CoreResult<SessionStatus> {
        self.call(|reply| SessionCommand::Status { reply }).await
    }

    /// Ask the runner to roll the workspace back past a message. The runner
    /// acknowledges with a `reverted` frame.
    pub async fn revert(&self, message_id: String) -> CoreResult<()> {
        self.call(|reply| SessionCommand::Revert { message_id, reply }).await
    }

    /// Request a workspace diff; the reply arrives as a `diff` frame on the
    /// bus.
    pub async fn request_diff(&self, request_id: String) -> CoreResult<()> {
        self.call(|reply| SessionCommand::RequestDiff { request_id, reply }).await
    }

    /// Attach a (re)connected runner link.
    pub async fn attach_runner(&self, sender: mpsc::Sender<ControlFrame>) -> CoreResult<()> {
        self.call(|reply| SessionCommand::RunnerAttached { sender, reply }).await
    }

    /// Post a decoded runner frame. Applies backpressure to the socket read
    /// loop when the actor is saturated.
    pub async fn post_frame(&self, frame: RunnerFrame) -> CoreResult<()> {
        self.tx
            .send(SessionCommand::RunnerFrame { frame })
            .await
            .map_err(|_| CoreError::internal(format!("session {} actor is gone", self.session_id)))
    }

    pub fn runner_closed(&self) {
        let _ = self.tx.try_send(SessionCommand::RunnerClosed);
    }
}

struct PendingPrompt {
    message_id: String,
    content: String,
    model: Option<String>,
    channel_type: String,
    channel_id: Option<String>,
    written: bool,
}

struct SessionActor {
    deps: ActorDeps,
    session: Session,
    queue: VecDeque<PendingPrompt>,
    /// Dispatched to the runner, awaiting its result.
    in_flight: Option<PendingPrompt>,
    /// Interrupting prompt parked until the `aborted` frame arrives.
    held_for_abort: Option<PendingPrompt>,
    agent_status: AgentStatus,
    runner_tx: Option<mpsc::Sender<ControlFrame>>,
    last_runner_activity: Option<Instant>,
    pending_questions: HashMap<String, String>,
    stream_buffers: HashMap<String, String>,
}

/// Actor entry point; owns the session until terminated or the registry is
/// dropped.
pub(crate) async fn run(
    deps: ActorDeps,
    session_id: String,
    mut rx: mpsc::Receiver<SessionCommand>,
) {
    let session = match deps.repo.get(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            reject_all(&mut rx, || CoreError::not_found(format!("session {session_id}"))).await;
            return;
        }
        Err(err) => {
            warn!(session_id, error = %err, "failed to load session for actor");
            reject_all(&mut rx, || CoreError::internal("failed to load session")).await;
            return;
        }
    };

    let mut actor = SessionActor {
        deps,
        session,
        queue: VecDeque::new(),
        in_flight: None,
        held_for_abort: None,
        agent_status: AgentStatus::Idle,
        runner_tx: None,
        last_runner_activity: None,
        pending_questions: HashMap::new(),
        stream_buffers: HashMap::new(),
    };

    let mut tick = tokio::time::interval(actor.deps.timing.heartbeat_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            maybe_cmd = rx.recv() => {
                match maybe_cmd {
                    Some(cmd) => {
                        if actor.handle_command(cmd).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tick.tick() => actor.on_tick().await,
        }
    }

    debug!(session_id = %actor.session.id, "session actor stopped");
}

async fn reject_all(rx: &mut mpsc::Receiver<SessionCommand>, err: impl Fn() -> CoreError) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            SessionCommand::Start { reply } => { let _ = reply.send(Err(err())); }
            SessionCommand::Prompt { reply, .. } => { let _ = reply.send(Err(err())); }
            SessionCommand::Answer { reply, .. } => { let _ = reply.send(Err(err())); }
            SessionCommand::Forward { reply, .. } => { let _ = reply.send(Err(err())); }
            SessionCommand::Hibernate { reply } => { let _ = reply.send(Err(err())); }
            SessionCommand::Terminate { reply } => { let _ = reply.send(Err(err())); }
            SessionCommand::Heartbeat { reply } => { let _ = reply.send(Err(err())); }
            SessionCommand::Status { reply } => { let _ = reply.send(Err(err())); }
            SessionCommand::Revert { reply, .. } => { let _ = reply.send(Err(err())); }
            SessionCommand::RequestDiff { reply, .. } => { let _ = reply.send(Err(err())); }
            SessionCommand::RunnerAttached { reply, .. } => { let _ = reply.send(Err(err())); }
            SessionCommand::RunnerClosed | SessionCommand::RunnerFrame { .. } => {}
        }
    }
}

impl SessionActor {
    async fn handle_command(&mut self, cmd: SessionCommand) -> ControlFlow<()> {
        match cmd {
            SessionCommand::Start { reply } => {
                let result = self.do_start().await;
                let _ = reply.send(result);
            }
            SessionCommand::Prompt { request, reply } => {
                let result = self.do_prompt(request).await;
                let _ = reply.send(result);
            }
            SessionCommand::Answer { question_id, value, reply } => {
                let result = self.do_answer(question_id, value).await;
                let _ = reply.send(result);
            }
            SessionCommand::Forward { from, limit, after, reply } => {
                let result = self.do_forward(&from, limit, after.as_deref()).await;
                let _ = reply.send(result);
            }
            SessionCommand::Hibernate { reply } => {
                let result = self.do_hibernate().await;
                let _ = reply.send(result);
            }
            SessionCommand::Terminate { reply } => {
                let result = self.do_terminate().await;
                let terminated = result.is_ok();
                let _ = reply.send(result);
                if terminated {
                    return ControlFlow::Break(());
                }
            }
            SessionCommand::Heartbeat { reply } => {
                // Watch heartbeat from a human viewer; defers sandbox idle
                // teardown but never affects correctness.
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(Ok(self.session.status));
            }
            SessionCommand::Revert { message_id, reply } => {
                let result = self.send_control(ControlFrame::Revert { message_id }).await;
                let _ = reply.send(result);
            }
            SessionCommand::RequestDiff { request_id, reply } => {
                let result = self.send_control(ControlFrame::Diff { request_id }).await;
                let _ = reply.send(result);
            }
            SessionCommand::RunnerAttached { sender, reply } => {
                let result = self.do_attach_runner(sender).await;
                let _ = reply.send(result);
            }
            SessionCommand::RunnerClosed => {
                if self.runner_tx.take().is_some() {
                    info!(session_id = %self.session.id, "runner link closed");
                    // Start the missed-heartbeat countdown from the close.
                    self.last_runner_activity = Some(Instant::now());
                }
            }
            SessionCommand::RunnerFrame { frame } => {
                if let Err(err) = self.handle_frame(frame).await {
                    warn!(
                        session_id = %self.session.id,
                        error = %err,
                        "failed to process runner frame"
                    );
                }
            }
        }
        ControlFlow::Continue(())
    }

    async fn do_start(&mut self) -> CoreResult<()> {
        match self.session.status {
            SessionStatus::Terminated => {
                return Err(CoreError::conflict("session already terminated"))
            }
            SessionStatus::Starting | SessionStatus::Running | SessionStatus::Idle => {
                return Ok(())
            }
            SessionStatus::Error => {
                return Err(CoreError::conflict(
                    "session is in error state; terminate it and spawn a new one",
                ))
            }
            SessionStatus::Pending | SessionStatus::Hibernated => {}
        }

        self.transition(SessionStatus::Starting, None).await?;

        let token = self.ensure_callback_token().await?;
        match self.deps.supervisor.provision(&self.session.id, &token).await {
            Ok(endpoint) => {
                info!(
                    session_id = %self.session.id,
                    sandbox_id = %endpoint.sandbox_id,
                    "sandbox ready, waiting for runner handshake"
                );
                Ok(())
            }
            Err(err) => {
                let detail = err.to_string();
                self.transition(SessionStatus::Error, Some(detail.clone())).await?;
                Err(err)
            }
        }
    }

    async fn do_prompt(&mut self, request: PromptRequest) -> CoreResult<String> {
        if self.session.status.is_terminal() {
            return Err(CoreError::conflict("session already terminated"));
        }
        if self.session.status == SessionStatus::Error {
            return Err(CoreError::conflict("session is in error state"));
        }

        let message_id = new_id("msg");
        let mut pending = PendingPrompt {
            message_id: message_id.clone(),
            content: request.content,
            model: request.model.or_else(|| self.session.model_pref.clone()),
            channel_type: request.channel_type,
            channel_id: request.channel_id,
            written: false,
        };

        let runner_busy = self.runner_tx.is_some() && self.agent_status.is_busy();
        if request.interrupt && runner_busy && self.held_for_abort.is_none() {
            // The interrupting message is persisted only once the runner
            // confirms the abort, so the log shows it after the aborted
            // tool's final write.
            self.send_control(ControlFrame::Abort).await?;
            self.held_for_abort = Some(pending);
        } else {
            self.write_user_message(&mut pending).await?;
            self.queue.push_back(pending);
            self.maybe_dispatch().await?;
        }

        Ok(message_id)
    }

    async fn do_answer(&mut self, question_id: String, value: String) -> CoreResult<()> {
        if self.pending_questions.remove(&question_id).is_none() {
            return Err(CoreError::not_found(format!("question {question_id}")));
        }
        self.send_control(ControlFrame::Answer { question_id, answer: value }).await
    }

    async fn do_forward(
        &mut self,
        from: &str,
        limit: i64,
        after: Option<&str>,
    ) -> CoreResult<usize> {
        if self.session.status.is_terminal() {
            return Err(CoreError::conflict("session already terminated"));
        }

        // Snapshot read of the source; the source log is never modified.
        let source_messages = self.deps.repo.list_messages(from, limit, after).await?;

        let mut inserted = 0usize;
        for source in &source_messages {
            let copy = Message {
                // Deterministic per (source message, target session) so
                // re-forwarding the same range is a no-op.
                id: format!("{}.f.{}", source.id, self.session.id),
                session_id: self.session.id.clone(),
                role: source.role,
                content: source.content.clone(),
                channel_type: source.channel_type.clone(),
                channel_id: source.channel_id.clone(),
                tool_call: source.tool_call.clone(),
                forward_from: Some(from.to_string()),
                edit_of: None,
                created_at: now_ts(),
            };
            if self.deps.repo.insert_message(&copy).await? {
                inserted += 1;
            }
        }

        self.publish(BusEvent::session(
            "forwarded",
            &self.session.id,
            json!({ "sourceSessionId": from, "count": inserted }),
        ));

        Ok(inserted)
    }

    async fn do_hibernate(&mut self) -> CoreResult<()> {
        if self.session.status == SessionStatus::Hibernated {
            return Ok(());
        }
        if !can_transition(self.session.status, SessionStatus::Hibernated) {
            return Err(CoreError::conflict(format!(
                "cannot hibernate a {} session",
                self.session.status
            )));
        }

        if let Err(err) = self.deps.supervisor.terminate(&self.session.id).await {
            warn!(session_id = %self.session.id, error = %err, "sandbox release failed");
        }
        self.runner_tx = None;
        self.last_runner_activity = None;
        self.transition(SessionStatus::Hibernated, None).await
    }

    async fn do_terminate(&mut self) -> CoreResult<()> {
        if self.session.status.is_terminal() {
            return Ok(());
        }

        if self.runner_tx.is_some() {
            if let Err(err) = self.send_control(ControlFrame::Stop).await {
                debug!(session_id = %self.session.id, error = %err, "stop frame not delivered");
            }
            tokio::time::sleep(self.deps.timing.terminate_grace).await;
        }

        if let Err(err) = self.deps.supervisor.terminate(&self.session.id).await {
            warn!(session_id = %self.session.id, error = %err, "sandbox teardown failed");
        }

        self.runner_tx = None;
        self.last_runner_activity = None;
        self.queue.clear();
        self.in_flight = None;
        self.held_for_abort = None;
        self.pending_questions.clear();
        self.transition(SessionStatus::Terminated, None).await
    }

    async fn do_attach_runner(
        &mut self,
        sender: mpsc::Sender<ControlFrame>,
    ) -> CoreResult<()> {
        if self.session.status.is_terminal() {
            return Err(CoreError::conflict("session already terminated"));
        }

        let reconnect = self.runner_tx.is_some();
        self.runner_tx = Some(sender);
        self.last_runner_activity = Some(Instant::now());

        match self.session.status {
            SessionStatus::Starting => {
                self.transition(SessionStatus::Running, None).await?;
            }
            SessionStatus::Error => {
                self.transition(SessionStatus::Running, None).await?;
            }
            _ => {}
        }

        info!(session_id = %self.session.id, reconnect, "runner link attached");

        // Re-deliver the in-flight prompt; the runner treats repeated
        // message ids as no-ops.
        if let Some(in_flight) = self.in_flight.take() {
            self.send_control(ControlFrame::Prompt {
                message_id: in_flight.message_id.clone(),
                content: in_flight.content.clone(),
                model: in_flight.model.clone(),
            })
            .await?;
            self.in_flight = Some(in_flight);
        } else {
            self.maybe_dispatch().await?;
        }

        Ok(())
    }

    async fn handle_frame(&mut self, frame: RunnerFrame) -> CoreResult<()> {
        if self.session.status.is_terminal() {
            warn!(
                session_id = %self.session.id,
                frame = ?frame_kind(&frame),
                "dropping runner frame for terminated session"
            );
            return Ok(());
        }

        self.last_runner_activity = Some(Instant::now());

        match frame {
            RunnerFrame::Stream { message_id, content } => {
                self.stream_buffers
                    .entry(message_id.clone())
                    .or_default()
                    .push_str(&content);
                self.publish(BusEvent::session(
                    "stream",
                    &self.session.id,
                    json!({ "messageId": message_id, "delta": content }),
                ));
            }

            RunnerFrame::Result { message_id, content } => {
                // The final result is authoritative; discard any partial
                // stream accumulation.
                self.stream_buffers.remove(&message_id);
                let message = Message {
                    id: format!("{message_id}.r"),
                    session_id: self.session.id.clone(),
                    role: MessageRole::Assistant,
                    content: content.clone(),
                    channel_type: "chat".to_string(),
                    channel_id: None,
                    tool_call: None,
                    forward_from: None,
                    edit_of: None,
                    created_at: now_ts(),
                };
                self.deps.repo.insert_message(&message).await?;
                if self
                    .in_flight
                    .as_ref()
                    .is_some_and(|p| p.message_id == message_id)
                {
                    self.in_flight = None;
                }
                self.publish(BusEvent::session(
                    "message",
                    &self.session.id,
                    json!({ "messageId": message_id, "role": "assistant" }),
                ));
            }

            RunnerFrame::Tool { call_id, tool_name, status, args, result, content } => {
                use tether_protocol::ToolStatus;
                if matches!(status, ToolStatus::Completed | ToolStatus::Error) {
                    let message = Message {
                        id: format!("{call_id}.t"),
                        session_id: self.session.id.clone(),
                        role: MessageRole::Tool,
                        content: content.unwrap_or_default(),
                        channel_type: "chat".to_string(),
                        channel_id: None,
                        tool_call: Some(
                            json!({
                                "callId": call_id,
                                "toolName": tool_name,
                                "status": status,
                                "args": args,
                                "result": result,
                            })
                            .to_string(),
                        ),
                        forward_from: None,
                        edit_of: None,
                        created_at: now_ts(),
                    };
                    self.deps.repo.insert_message(&message).await?;
                }
                self.publish(BusEvent::session(
                    "tool",
                    &self.session.id,
                    json!({ "callId": call_id, "toolName": tool_name, "status": status }),
                ));
            }

            RunnerFrame::Question { question_id, text, options } => {
                self.pending_questions.insert(question_id.clone(), text.clone());
                self.publish(BusEvent::session(
                    "question",
                    &self.session.id,
                    json!({ "questionId": question_id, "text": text, "options": options }),
                ));
            }

            RunnerFrame::AgentStatus { status, detail } => {
                self.agent_status = status;
                self.publish(BusEvent::session(
                    "agent_status",
                    &self.session.id,
                    json!({ "status": status, "detail": detail }),
                ));
                if status.is_busy() {
                    if self.session.status == SessionStatus::Idle {
                        self.transition(SessionStatus::Running, None).await?;
                    }
                } else {
                    if self.session.status == SessionStatus::Running {
                        self.transition(SessionStatus::Idle, None).await?;
                    }
                    self.maybe_dispatch().await?;
                }
            }

            RunnerFrame::Complete => {
                self.agent_status = AgentStatus::Idle;
                self.in_flight = None;
                if self.session.status == SessionStatus::Running {
                    self.transition(SessionStatus::Idle, None).await?;
                }
                self.maybe_dispatch().await?;
            }

            RunnerFrame::Aborted => {
                self.agent_status = AgentStatus::Idle;
                self.in_flight = None;
                self.publish(BusEvent::session(
                    "aborted",
                    &self.session.id,
                    json!({}),
                ));
                if let Some(mut held) = self.held_for_abort.take() {
                    // Now that the abort is confirmed, the interrupting
                    // message enters the log and jumps the queue.
                    self.write_user_message(&mut held).await?;
                    self.queue.push_front(held);
                }
                self.maybe_dispatch().await?;
            }

            RunnerFrame::Error { message_id, error } => {
                if self
                    .in_flight
                    .as_ref()
                    .is_some_and(|p| p.message_id == message_id)
                {
                    self.in_flight = None;
                }
                self.agent_status = AgentStatus::Idle;
                self.publish(BusEvent::session(
                    "agent_error",
                    &self.session.id,
                    json!({ "messageId": message_id, "error": error }),
                ));
                self.maybe_dispatch().await?;
            }

            RunnerFrame::Screenshot { description, .. } => {
                self.publish(BusEvent::session(
                    "screenshot",
                    &self.session.id,
                    json!({ "description": description }),
                ));
            }

            RunnerFrame::CreatePr { branch, title, body, base } => {
                self.publish(BusEvent::session(
                    "create_pr",
                    &self.session.id,
                    json!({ "branch": branch, "title": title, "body": body, "base": base }),
                ));
            }

            RunnerFrame::Models { models } => {
                self.publish(BusEvent::session(
                    "models",
                    &self.session.id,
                    json!({ "models": models }),
                ));
            }

            RunnerFrame::Reverted { message_ids } => {
                self.publish(BusEvent::session(
                    "reverted",
                    &self.session.id,
                    json!({ "messageIds": message_ids }),
                ));
            }

            RunnerFrame::Diff { request_id, data } => {
                self.publish(BusEvent::session(
                    "diff",
                    &self.session.id,
                    json!({ "requestId": request_id, "data": data }),
                ));
            }

            RunnerFrame::Pong => {}
        }

        Ok(())
    }

    async fn on_tick(&mut self) {
        if let Some(tx) = &self.runner_tx {
            if tx.try_send(ControlFrame::Ping).is_err() {
                debug!(session_id = %self.session.id, "keepalive not delivered");
            }
        }

        let watchdog_applies = self.session.status.is_linked();
        if !watchdog_applies {
            return;
        }

        let stale = self
            .last_runner_activity
            .is_some_and(|at| at.elapsed() > self.deps.timing.heartbeat_timeout);
        if stale {
            warn!(
                session_id = %self.session.id,
                "runner heartbeats missed, marking session errored"
            );
            self.runner_tx = None;
            self.last_runner_activity = None;
            if let Err(err) = self
                .transition(SessionStatus::Error, Some("runner heartbeat lost".to_string()))
                .await
            {
                warn!(session_id = %self.session.id, error = %err, "error transition failed");
            }
        }
    }

    /// Forward the next queued prompt when the runner is attached and idle.
    async fn maybe_dispatch(&mut self) -> CoreResult<()> {
        let ready = self.runner_tx.is_some()
            && self.session.status.is_linked()
            && !self.agent_status.is_busy()
            && self.in_flight.is_none()
            && self.held_for_abort.is_none();
        if !ready {
            return Ok(());
        }

        let Some(mut next) = self.queue.pop_front() else {
            return Ok(());
        };

        self.write_user_message(&mut next).await?;
        self.send_control(ControlFrame::Prompt {
            message_id: next.message_id.clone(),
            content: next.content.clone(),
            model: next.model.clone(),
        })
        .await?;
        self.in_flight = Some(next);
        Ok(())
    }

    async fn write_user_message(&mut self, pending: &mut PendingPrompt) -> CoreResult<()> {
        if pending.written {
            return Ok(());
        }
        let message = Message {
            id: pending.message_id.clone(),
            session_id: self.session.id.clone(),
            role: MessageRole::User,
            content: pending.content.clone(),
            channel_type: pending.channel_type.clone(),
            channel_id: pending.channel_id.clone(),
            tool_call: None,
            forward_from: None,
            edit_of: None,
            created_at: now_ts(),
        };
        self.deps.repo.insert_message(&message).await?;
        pending.written = true;
        self.publish(BusEvent::session(
            "message",
            &self.session.id,
            json!({ "messageId": pending.message_id, "role": "user" }),
        ));
        Ok(())
    }

    async fn send_control(&mut self, frame: ControlFrame) -> CoreResult<()> {
        let Some(tx) = &self.runner_tx else {
            return Err(CoreError::RunnerDisconnected(format!(
                "session {} has no runner link",
                self.session.id
            )));
        };
        if tx.send(frame).await.is_err() {
            self.runner_tx = None;
            return Err(CoreError::RunnerDisconnected(format!(
                "runner link for session {} went away",
                self.session.id
            )));
        }
        Ok(())
    }

    async fn transition(
        &mut self,
        to: SessionStatus,
        error_message: Option<String>,
    ) -> CoreResult<()> {
        if self.session.status == to {
            return Ok(());
        }
        if !can_transition(self.session.status, to) {
            return Err(CoreError::conflict(format!(
                "invalid session transition {} -> {}",
                self.session.status, to
            )));
        }

        self.deps
            .repo
            .update_status(&self.session.id, to, error_message.as_deref())
            .await?;
        self.session.status = to;
        self.session.error_message = error_message;

        self.publish(BusEvent::session(
            &to.to_string(),
            &self.session.id,
            json!({ "sessionId": self.session.id, "status": to }),
        ));
        Ok(())
    }

    fn publish(&self, event: BusEvent) {
        self.deps.bus.publish(&self.session.user_id, event);
    }

    async fn ensure_callback_token(&mut self) -> CoreResult<String> {
        let mut metadata: serde_json::Value =
            serde_json::from_str(&self.session.metadata).unwrap_or_else(|_| json!({}));
        if !metadata.is_object() {
            metadata = json!({});
        }

        if let Some(token) = metadata.get("callback_token").and_then(|v| v.as_str()) {
            return Ok(token.to_string());
        }

        let token = crate::ids::callback_token();
        metadata["callback_token"] = json!(token);
        let serialized = metadata.to_string();
        self.deps.repo.update_metadata(&self.session.id, &serialized).await?;
        self.session.metadata = serialized;
        Ok(token)
    }
}

fn frame_kind(frame: &RunnerFrame) -> &'static str {
    match frame {
        RunnerFrame::Stream { .. } => "stream",
        RunnerFrame::Result { .. } => "result",
        RunnerFrame::Tool { .. } => "tool",
        RunnerFrame::Question { .. } => "question",
        RunnerFrame::Screenshot { .. } => "screenshot",
        RunnerFrame::Error { .. } => "error",
        RunnerFrame::Complete => "complete",
        RunnerFrame::AgentStatus { .. } => "agent_status",
        RunnerFrame::CreatePr { .. } => "create_pr",
        RunnerFrame::Models { .. } => "models",
        RunnerFrame::Aborted => "aborted",
        RunnerFrame::Reverted { .. } => "reverted",
        RunnerFrame::Diff { .. } => "diff",
        RunnerFrame::Pong => "pong",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::db::Database;
    use crate::sandbox::{SandboxSupervisor, StubSandbox, SupervisorConfig};
    use crate::session::models::SessionPurpose;
    use crate::session::{SessionRegistry, SessionRepository};
    use std::sync::Arc;

    async fn registry_with_db() -> (SessionRegistry, SessionRepository) {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        let bus = Arc::new(EventBus::new());
        let supervisor = Arc::new(SandboxSupervisor::new(
            Arc::new(StubSandbox::new()),
            SupervisorConfig {
                start_timeout: Duration::from_millis(20),
                health_polls: 1,
                ..SupervisorConfig::default()
            },
        ));
        let timing = ActorTiming {
            call_deadline: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(25),
            heartbeat_timeout: Duration::from_millis(120),
            terminate_grace: Duration::from_millis(5),
        };
        let registry = SessionRegistry::with_timing(repo.clone(), bus, supervisor, timing);
        (registry, repo)
    }

    async fn seed_session(repo: &SessionRepository, id: &str) {
        let ts = now_ts();
        let session = Session {
            id: id.to_string(),
            user_id: "u1".to_string(),
            parent_id: None,
            workspace: "svc".to_string(),
            title: "t".to_string(),
            status: SessionStatus::Pending,
            purpose: SessionPurpose::Interactive,
            model_pref: None,
            metadata: "{}".to_string(),
            error_message: None,
            created_at: ts.clone(),
            updated_at: ts,
        };
        repo.create(&session, None).await.unwrap();
    }

    /// Start, attach a fake runner, and return its control-frame receiver.
    async fn start_and_attach(
        registry: &SessionRegistry,
        id: &str,
    ) -> (ActorHandle, mpsc::Receiver<ControlFrame>) {
        let handle = registry.handle(id);
        handle.start().await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        handle.attach_runner(tx).await.unwrap();
        (handle, rx)
    }

    async fn next_non_ping(rx: &mut mpsc::Receiver<ControlFrame>) -> ControlFrame {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for control frame")
                .expect("runner channel closed");
            if !matches!(frame, ControlFrame::Ping) {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn start_then_attach_reaches_running() {
        let (registry, repo) = registry_with_db().await;
        seed_session(&repo, "ses_run").await;

        let (handle, _rx) = start_and_attach(&registry, "ses_run").await;
        assert_eq!(handle.status().await.unwrap(), SessionStatus::Running);
    }

    #[tokio::test]
    async fn prompt_is_dispatched_and_persisted() {
        let (registry, repo) = registry_with_db().await;
        seed_session(&repo, "ses_p").await;
        let (handle, mut rx) = start_and_attach(&registry, "ses_p").await;

        let message_id = handle.prompt(PromptRequest::chat("hello")).await.unwrap();

        match next_non_ping(&mut rx).await {
            ControlFrame::Prompt { message_id: sent, content, .. } => {
                assert_eq!(sent, message_id);
                assert_eq!(content, "hello");
            }
            other => panic!("expected prompt frame, got {other:?}"),
        }

        let messages = repo.list_messages("ses_p", 10, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, message_id);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn prompts_queue_fifo_while_agent_busy() {
        let (registry, repo) = registry_with_db().await;
        seed_session(&repo, "ses_q").await;
        let (handle, mut rx) = start_and_attach(&registry, "ses_q").await;

        let first = handle.prompt(PromptRequest::chat("one")).await.unwrap();
        match next_non_ping(&mut rx).await {
            ControlFrame::Prompt { message_id, .. } => assert_eq!(message_id, first),
            other => panic!("expected prompt, got {other:?}"),
        }

        // Runner goes busy; further prompts must queue.
        handle
            .post_frame(RunnerFrame::AgentStatus {
                status: AgentStatus::Thinking,
                detail: None,
            })
            .await
            .unwrap();

        let second = handle.prompt(PromptRequest::chat("two")).await.unwrap();
        let third = handle.prompt(PromptRequest::chat("three")).await.unwrap();

        handle
            .post_frame(RunnerFrame::Result { message_id: first.clone(), content: "ok".into() })
            .await
            .unwrap();
        handle.post_frame(RunnerFrame::Complete).await.unwrap();

        match next_non_ping(&mut rx).await {
            ControlFrame::Prompt { message_id, .. } => assert_eq!(message_id, second),
            other => panic!("expected second prompt, got {other:?}"),
        }

        handle
            .post_frame(RunnerFrame::Result { message_id: second.clone(), content: "ok".into() })
            .await
            .unwrap();
        handle.post_frame(RunnerFrame::Complete).await.unwrap();

        match next_non_ping(&mut rx).await {
            ControlFrame::Prompt { message_id, .. } => assert_eq!(message_id, third),
            other => panic!("expected third prompt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupt_waits_for_aborted_ack() {
        let (registry, repo) = registry_with_db().await;
        seed_session(&repo, "ses_i").await;
        let (handle, mut rx) = start_and_attach(&registry, "ses_i").await;

        handle
            .post_frame(RunnerFrame::AgentStatus {
                status: AgentStatus::ToolCalling,
                detail: None,
            })
            .await
            .unwrap();

        let interrupting = handle
            .prompt(PromptRequest::from_session("urgent", "ses_other", true))
            .await
            .unwrap();

        match next_non_ping(&mut rx).await {
            ControlFrame::Abort => {}
            other => panic!("expected abort, got {other:?}"),
        }

        // Not yet in the log: the abort is unacknowledged.
        assert!(repo.list_messages("ses_i", 10, None).await.unwrap().is_empty());

        // The aborted tool writes its final trace, then acks the abort.
        handle
            .post_frame(RunnerFrame::Tool {
                call_id: "call_1".into(),
                tool_name: "bash".into(),
                status: tether_protocol::ToolStatus::Error,
                args: None,
                result: None,
                content: Some("aborted".into()),
            })
            .await
            .unwrap();
        handle.post_frame(RunnerFrame::Aborted).await.unwrap();

        match next_non_ping(&mut rx).await {
            ControlFrame::Prompt { message_id, .. } => assert_eq!(message_id, interrupting),
            other => panic!("expected interrupting prompt, got {other:?}"),
        }

        // The user message lands strictly after the tool's final write.
        let messages = repo.list_messages("ses_i", 10, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "call_1.t");
        assert_eq!(messages[1].id, interrupting);
        assert!(messages[0].created_at <= messages[1].created_at);
    }

    #[tokio::test]
    async fn terminated_session_drops_runner_frames() {
        let (registry, repo) = registry_with_db().await;
        seed_session(&repo, "ses_t").await;
        let (handle, _rx) = start_and_attach(&registry, "ses_t").await;

        handle.terminate().await.unwrap();
        // Give the terminated actor task a beat to wind down.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Actor task ended; the registry respawns a fresh actor that loads
        // the terminated row and refuses work.
        let handle = registry.handle("ses_t");
        assert_eq!(handle.status().await.unwrap(), SessionStatus::Terminated);
        let err = handle.prompt(PromptRequest::chat("late")).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        handle
            .post_frame(RunnerFrame::AgentStatus { status: AgentStatus::Idle, detail: None })
            .await
            .unwrap();
        assert_eq!(handle.status().await.unwrap(), SessionStatus::Terminated);
        assert!(repo.list_messages("ses_t", 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missed_heartbeats_error_the_session() {
        let (registry, repo) = registry_with_db().await;
        seed_session(&repo, "ses_hb").await;
        let (handle, mut rx) = start_and_attach(&registry, "ses_hb").await;
        assert_eq!(handle.status().await.unwrap(), SessionStatus::Running);

        // Swallow pings but never answer; the watchdog should fire.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handle.status().await.unwrap(), SessionStatus::Error);

        // A reconnect restores the link.
        let (tx, _rx2) = mpsc::channel(16);
        handle.attach_runner(tx).await.unwrap();
        assert_eq!(handle.status().await.unwrap(), SessionStatus::Running);
    }

    #[tokio::test]
    async fn answer_rejects_unknown_question() {
        let (registry, repo) = registry_with_db().await;
        seed_session(&repo, "ses_ans").await;
        let (handle, mut rx) = start_and_attach(&registry, "ses_ans").await;

        let err = handle
            .answer("q_missing".to_string(), "yes".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        handle
            .post_frame(RunnerFrame::Question {
                question_id: "q_1".into(),
                text: "continue?".into(),
                options: None,
            })
            .await
            .unwrap();

        handle.answer("q_1".to_string(), "yes".to_string()).await.unwrap();
        match next_non_ping(&mut rx).await {
            ControlFrame::Answer { question_id, answer } => {
                assert_eq!(question_id, "q_1");
                assert_eq!(answer, "yes");
            }
            other => panic!("expected answer frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_copies_messages_with_attribution() {
        let (registry, repo) = registry_with_db().await;
        seed_session(&repo, "ses_src").await;
        seed_session(&repo, "ses_dst").await;

        for n in 0..3 {
            let msg = Message {
                id: format!("msg_s{n}"),
                session_id: "ses_src".to_string(),
                role: MessageRole::Assistant,
                content: format!("note {n}"),
                channel_type: "chat".to_string(),
                channel_id: None,
                tool_call: None,
                forward_from: None,
                edit_of: None,
                created_at: now_ts(),
            };
            repo.insert_message(&msg).await.unwrap();
        }

        let handle = registry.handle("ses_dst");
        let count = handle
            .forward_from("ses_src".to_string(), 20, None)
            .await
            .unwrap();
        assert_eq!(count, 3);

        // Re-forwarding is a no-op.
        let again = handle
            .forward_from("ses_src".to_string(), 20, None)
            .await
            .unwrap();
        assert_eq!(again, 0);

        let copies = repo.list_messages("ses_dst", 10, None).await.unwrap();
        assert_eq!(copies.len(), 3);
        assert!(copies.iter().all(|m| m.forward_from.as_deref() == Some("ses_src")));

        // Source untouched.
        let source = repo.list_messages("ses_src", 10, None).await.unwrap();
        assert_eq!(source.len(), 3);
        assert!(source.iter().all(|m| m.forward_from.is_none()));
    }
}
