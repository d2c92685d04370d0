//! Turn orchestration.
//!
//! One task per turn multiplexes three sources with `select!`: the abort
//! signal, permission resolutions and the backend stream. Every event it lets
//! through is checked against the tool state machine and stamped with the
//! turn's next index, so subscribers see one totally ordered stream.

use std::sync::Arc;
use tokio::time::Instant;

use super::{Message, MessageRole, Session, TurnState};
use crate::backends::{
    AgentConnection, BackendError, PermissionAsk, PermissionReply, SessionSettings, Translated,
};
use crate::events::{SessionEvent, ToolStatus, ToolType, UnifiedEvent};
use crate::permissions::{determine_permission, PermissionDecision, PermissionOutcome, Resolution};
use crate::turn::TurnContext;

enum Phase {
    Streaming,
    /// Interrupt sent; waiting for the backend to wind down.
    Aborting { deadline: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Aborted,
    DrainTimedOut,
    Failed,
}

enum Step {
    Abort,
    DrainTimeout,
    Resolution(Resolution),
    Native(Result<Option<Vec<Translated>>, BackendError>),
}

struct Turn {
    session: Arc<Session>,
    ctx: TurnContext,
    conn: Option<Box<dyn AgentConnection>>,
    settings: SessionSettings,
    phase: Phase,
    assistant_text: String,
}

pub(super) async fn run_turn(session: Arc<Session>, turn_id: String, message: String, settings: SessionSettings) {
    let mut turn = Turn {
        session,
        ctx: TurnContext::new(turn_id),
        conn: None,
        settings,
        phase: Phase::Streaming,
        assistant_text: String::new(),
    };

    let outcome = match turn.connect(&message).await {
        Ok(()) => turn.drive().await,
        Err(e) => {
            log::error!("[{}] failed to start turn: {e}", turn.session.id);
            turn.admit(UnifiedEvent::error(e.to_string(), false));
            Outcome::Failed
        }
    };
    turn.finish(outcome).await;
}

impl Turn {
    /// Takes the session's adapter handle, starting a new one if the last
    /// turn dropped it, and sends the user message.
    async fn connect(&mut self, message: &str) -> Result<(), BackendError> {
        let existing = self.session.connection.lock().take();
        let mut conn = match existing {
            Some(conn) => conn,
            None => {
                log::info!("[{}] starting new {} connection", self.session.id, self.session.backend.kind());
                self.session.backend.start(self.session.adapter_config()).await?
            }
        };

        if let Err(e) = conn.send(message, &self.settings).await {
            self.session.remember_token(conn.resume_token());
            conn.disconnect().await;
            return Err(e);
        }
        self.conn = Some(conn);
        Ok(())
    }

    async fn drive(&mut self) -> Outcome {
        loop {
            let Some(conn) = self.conn.as_mut() else {
                return Outcome::Failed;
            };
            let session = &self.session;
            let ctx = &mut self.ctx;

            let step = match self.phase {
                Phase::Streaming => tokio::select! {
                    biased;
                    _ = session.abort.triggered() => Step::Abort,
                    Some(resolution) = session.permissions.next_resolution() => Step::Resolution(resolution),
                    next = conn.next_translated(ctx) => Step::Native(next),
                },
                Phase::Aborting { deadline } => tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(deadline) => Step::DrainTimeout,
                    Some(resolution) = session.permissions.next_resolution() => Step::Resolution(resolution),
                    next = conn.next_translated(ctx) => Step::Native(next),
                },
            };

            match step {
                Step::Abort => self.begin_abort().await,
                Step::DrainTimeout => {
                    log::warn!(
                        "[{}] backend still streaming {:?} after interrupt, dropping connection",
                        self.session.id,
                        self.session.drain_timeout
                    );
                    self.admit(UnifiedEvent::error(
                        "Backend did not stop after interrupt; connection was reset",
                        true,
                    ));
                    self.drop_connection().await;
                    return Outcome::DrainTimedOut;
                }
                Step::Resolution(resolution) => {
                    if let Some(outcome) = self.resolve(resolution).await {
                        return outcome;
                    }
                }
                Step::Native(Ok(Some(batch))) => {
                    for item in batch {
                        if let Some(outcome) = self.handle(item).await {
                            return outcome;
                        }
                    }
                }
                Step::Native(Ok(None)) => return self.stream_ended().await,
                Step::Native(Err(e)) if e.recoverable() => {
                    log::warn!("[{}] skipping native record: {e}", self.session.id);
                }
                Step::Native(Err(e)) => return self.backend_failed(e).await,
            }
        }
    }

    async fn begin_abort(&mut self) {
        log::info!("[{}] interrupting turn {}", self.session.id, self.ctx.turn_id());
        *self.session.state.lock() = TurnState::Aborting;
        self.phase = Phase::Aborting {
            deadline: Instant::now() + self.session.drain_timeout,
        };
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.interrupt().await {
                log::warn!("[{}] interrupt failed: {e}", self.session.id);
            }
        }
        let denied = self.session.permissions.deny_all(PermissionOutcome::Aborted);
        if denied > 0 {
            log::debug!("[{}] denied {denied} open permission requests", self.session.id);
        }
    }

    async fn handle(&mut self, item: Translated) -> Option<Outcome> {
        match item {
            Translated::Permission(ask) => self.gate(ask).await,
            Translated::Event(UnifiedEvent::Complete) => match self.phase {
                Phase::Streaming => {
                    if let Some(outcome) = self.settle(PermissionOutcome::TurnEnded).await {
                        return Some(outcome);
                    }
                    self.admit(UnifiedEvent::Complete);
                    Some(Outcome::Completed)
                }
                // AbortComplete takes its place.
                Phase::Aborting { .. } => Some(Outcome::Aborted),
            },
            Translated::Event(event @ UnifiedEvent::Error { recoverable: false, .. }) => {
                self.admit(event);
                Some(match self.phase {
                    Phase::Streaming => Outcome::Failed,
                    Phase::Aborting { .. } => Outcome::Aborted,
                })
            }
            Translated::Event(event) => {
                self.admit(event);
                None
            }
        }
    }

    /// Decides a permission ask by policy, or opens a request for the user.
    async fn gate(&mut self, ask: PermissionAsk) -> Option<Outcome> {
        if let Phase::Aborting { .. } = self.phase {
            self.admit(UnifiedEvent::status(&ask.tool_id, ToolStatus::Denied));
            return self
                .reply(&ask.reply, false, PermissionOutcome::Aborted.reason())
                .await;
        }

        let tool_type = self
            .ctx
            .tools()
            .get(&ask.tool_id)
            .map_or(ToolType::Generic, |tool| tool.tool_type);
        let decision = determine_permission(
            self.settings.permission_policy,
            &ask.tool_name,
            tool_type,
            &ask.input,
            self.session.user_settings.as_deref(),
        );

        match decision {
            PermissionDecision::Allow(reason) => {
                log::debug!("[{}] allowing {}: {reason}", self.session.id, ask.tool_name);
                self.admit(UnifiedEvent::status(&ask.tool_id, ToolStatus::Running));
                self.reply(&ask.reply, true, &reason).await
            }
            PermissionDecision::Deny(reason) => {
                log::info!("[{}] denying {}: {reason}", self.session.id, ask.tool_name);
                self.admit(UnifiedEvent::status(&ask.tool_id, ToolStatus::Denied));
                self.reply(&ask.reply, false, &reason).await
            }
            PermissionDecision::PromptUser => {
                let request = self.session.permissions.open(self.ctx.turn_id(), &ask);
                log::info!(
                    "[{}] waiting for permission {} ({})",
                    self.session.id,
                    request.id,
                    ask.description
                );
                self.admit(UnifiedEvent::ToolStatusUpdate {
                    tool_id: ask.tool_id,
                    status: ToolStatus::AwaitingPermission,
                    permission_request_id: Some(request.id),
                });
                None
            }
        }
    }

    async fn resolve(&mut self, resolution: Resolution) -> Option<Outcome> {
        let Resolution {
            request,
            reply,
            outcome,
        } = resolution;
        if request.turn_id != self.ctx.turn_id() {
            log::debug!("[{}] dropping resolution for stale turn {}", self.session.id, request.turn_id);
            return None;
        }

        let allowed = outcome.allowed();
        self.admit(UnifiedEvent::ToolStatusUpdate {
            tool_id: request.tool_id,
            status: if allowed {
                ToolStatus::Running
            } else {
                ToolStatus::Denied
            },
            permission_request_id: Some(request.id),
        });
        self.reply(&reply, allowed, outcome.reason()).await
    }

    /// Resolves every open request with `outcome` and applies the results.
    async fn settle(&mut self, outcome: PermissionOutcome) -> Option<Outcome> {
        self.session.permissions.deny_all(outcome);
        while let Some(resolution) = self.session.permissions.try_next_resolution() {
            if let Some(outcome) = self.resolve(resolution).await {
                return Some(outcome);
            }
        }
        None
    }

    async fn reply(&mut self, reply: &PermissionReply, allowed: bool, reason: &str) -> Option<Outcome> {
        let conn = self.conn.as_mut()?;
        match conn.reply_permission(reply, allowed, reason).await {
            Ok(()) => None,
            Err(e) => Some(self.backend_failed(e).await),
        }
    }

    async fn stream_ended(&mut self) -> Outcome {
        match self.phase {
            Phase::Aborting { .. } => Outcome::Aborted,
            Phase::Streaming => {
                log::warn!("[{}] backend stream ended mid-turn", self.session.id);
                self.admit(UnifiedEvent::error(
                    "Backend stream ended before the turn completed",
                    false,
                ));
                self.drop_connection().await;
                Outcome::Failed
            }
        }
    }

    async fn backend_failed(&mut self, e: BackendError) -> Outcome {
        self.drop_connection().await;
        match self.phase {
            Phase::Streaming => {
                log::error!("[{}] backend failed: {e}", self.session.id);
                self.admit(UnifiedEvent::error(e.to_string(), false));
                Outcome::Failed
            }
            Phase::Aborting { .. } => {
                log::warn!("[{}] backend failed while aborting: {e}", self.session.id);
                Outcome::Aborted
            }
        }
    }

    async fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            self.session.remember_token(conn.resume_token());
            conn.disconnect().await;
        }
    }

    /// Validates `event` against the tool state machine and publishes it.
    fn admit(&mut self, event: UnifiedEvent) {
        match &event {
            UnifiedEvent::ToolStatusUpdate {
                tool_id,
                status,
                permission_request_id,
            } => {
                if !self.advance(tool_id, *status) {
                    return;
                }
                self.ctx
                    .tools_mut()
                    .set_permission_request(tool_id, permission_request_id.clone());
            }
            UnifiedEvent::ToolEnd { tool_id, status, .. } => {
                let pending = self.ctx.tools().get(tool_id).map(|tool| tool.status) == Some(ToolStatus::Pending);
                if pending && matches!(status, ToolStatus::Completed | ToolStatus::Error) {
                    self.admit(UnifiedEvent::status(tool_id, ToolStatus::Running));
                }
                if !self.advance(tool_id, *status) {
                    return;
                }
            }
            UnifiedEvent::Text { content } => self.assistant_text.push_str(content),
            _ => {}
        }

        let index = self.ctx.next_index();
        self.session.events.emit(SessionEvent::Turn {
            turn_id: self.ctx.turn_id().to_string(),
            index,
            event,
        });
    }

    fn advance(&mut self, tool_id: &str, next: ToolStatus) -> bool {
        match self.ctx.tools_mut().transition(tool_id, next) {
            Ok(_) => true,
            Err(Some(current)) => {
                log::debug!("[{}] dropping {current} -> {next} for {tool_id}", self.session.id);
                false
            }
            Err(None) => {
                log::debug!("[{}] dropping {next} for unknown tool {tool_id}", self.session.id);
                false
            }
        }
    }

    async fn finish(mut self, outcome: Outcome) {
        // A turn that failed after an abort was requested still owes the
        // caller its AbortComplete.
        let aborted = match outcome {
            Outcome::Completed => false,
            Outcome::Failed => self.session.abort.is_triggered(),
            Outcome::Aborted | Outcome::DrainTimedOut => true,
        };
        let leftover = if aborted {
            PermissionOutcome::Aborted
        } else {
            PermissionOutcome::TurnEnded
        };
        self.settle(leftover).await;

        if aborted {
            for tool_id in self.ctx.tools().open_ids() {
                self.admit(UnifiedEvent::ToolEnd {
                    tool_id,
                    status: ToolStatus::Aborted,
                    output: None,
                });
            }
            self.session.events.emit(SessionEvent::AbortComplete {
                session_id: self.session.id.clone(),
            });
        }

        let session = Arc::clone(&self.session);
        if !self.assistant_text.is_empty() {
            let text = std::mem::take(&mut self.assistant_text);
            session.messages.lock().push(Message::new(MessageRole::Assistant, text));
        }
        if let Some(conn) = self.conn.take() {
            session.remember_token(conn.resume_token());
            *session.connection.lock() = Some(conn);
        }
        *session.state.lock() = TurnState::Idle;
        log::info!(
            "[{}] turn {} finished: {outcome:?} ({} tools)",
            session.id,
            self.ctx.turn_id(),
            self.ctx.tools().len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::testing::{ScriptHandle, ScriptedBackend, Step};
    use crate::backends::{BackendKind, BackendRegistry};
    use crate::config::CoreConfig;
    use crate::error::SessionError;
    use crate::events::EventStream;
    use crate::permissions::PermissionPolicy;
    use crate::session::{SessionConfig, SessionRegistry};
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Harness {
        registry: SessionRegistry,
        id: String,
        events: EventStream,
    }

    impl Harness {
        async fn new(script: &ScriptHandle, policy: PermissionPolicy) -> Self {
            let mut backends = BackendRegistry::new();
            backends.register(Arc::new(ScriptedBackend::new(BackendKind::Claude, script)));
            let config = CoreConfig {
                user_settings_path: Some(PathBuf::from("/nonexistent/settings.json")),
                ..CoreConfig::default()
            };
            let registry = SessionRegistry::with_backends(config, backends);
            let created = registry
                .create_session(SessionConfig {
                    folder: PathBuf::from("/tmp/project"),
                    permission_policy: policy,
                    ..SessionConfig::default()
                })
                .await
                .unwrap();
            Self {
                registry,
                id: created.session_id,
                events: created.events,
            }
        }

        fn session(&self) -> Arc<Session> {
            self.registry.get(&self.id).unwrap()
        }

        fn send(&self, text: &str) -> String {
            self.registry.send_message(&self.id, text).unwrap()
        }

        /// Reads until the turn's terminal event.
        async fn turn(&mut self) -> Vec<SessionEvent> {
            let mut seen = Vec::new();
            while let Some(event) = self.events.recv().await {
                let done = matches!(
                    &event,
                    SessionEvent::AbortComplete { .. }
                        | SessionEvent::Turn {
                            event: UnifiedEvent::Complete | UnifiedEvent::Error { recoverable: false, .. },
                            ..
                        }
                );
                seen.push(event);
                if done {
                    break;
                }
            }
            seen
        }

        async fn next_unified(&mut self) -> UnifiedEvent {
            loop {
                if let Some(SessionEvent::Turn { event, .. }) = self.events.recv().await {
                    return event;
                }
            }
        }

        /// Waits for the turn task so the session is back to idle.
        async fn settled(&self) {
            let task = self.session().turn_task.lock().take();
            if let Some(task) = task {
                task.await.unwrap();
            }
            assert_eq!(self.session().state(), TurnState::Idle);
        }
    }

    fn unified(events: &[SessionEvent]) -> Vec<UnifiedEvent> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Turn { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn tool(id: &'static str, tool_type: ToolType, target: &'static str) -> Step {
        Step::Tool { id, tool_type, target }
    }

    fn done(id: &'static str) -> Step {
        Step::End {
            id,
            status: ToolStatus::Completed,
        }
    }

    fn bash_ask(id: &'static str) -> Step {
        Step::Ask {
            id,
            tool: "Bash",
            input: json!({"command": "cargo test"}),
        }
    }

    #[tokio::test]
    async fn tool_sequence_streams_in_order_with_dense_indices() {
        let script = ScriptHandle::new();
        script.turn(vec![
            Step::Text("Looking around. "),
            tool("t1", ToolType::FileRead, "src/lib.rs"),
            done("t1"),
            tool("t2", ToolType::FileWrite, "src/new.rs"),
            done("t2"),
            tool("t3", ToolType::Bash, "cargo test"),
            done("t3"),
            Step::Text("Done."),
            Step::Complete,
        ]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;
        let turn_id = h.send("add a module");
        let events = h.turn().await;

        let indices: Vec<u64> = events
            .iter()
            .map(|event| match event {
                SessionEvent::Turn { turn_id: t, index, .. } => {
                    assert_eq!(t, &turn_id);
                    *index
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(indices, (0..events.len() as u64).collect::<Vec<_>>());

        let lifecycle: Vec<(String, &str)> = unified(&events)
            .into_iter()
            .filter_map(|event| match event {
                UnifiedEvent::ToolStart { tool_id, .. } => Some((tool_id, "start")),
                UnifiedEvent::ToolEnd { tool_id, .. } => Some((tool_id, "end")),
                _ => None,
            })
            .collect();
        assert_eq!(
            lifecycle,
            [
                ("t1".to_string(), "start"),
                ("t1".to_string(), "end"),
                ("t2".to_string(), "start"),
                ("t2".to_string(), "end"),
                ("t3".to_string(), "start"),
                ("t3".to_string(), "end"),
            ]
        );
        assert_eq!(unified(&events).last(), Some(&UnifiedEvent::Complete));

        h.settled().await;
        let messages = h.registry.get_messages(&h.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].content, "Looking around. Done.");
    }

    #[tokio::test]
    async fn tool_end_without_running_gets_a_running_update_first() {
        let script = ScriptHandle::new();
        script.turn(vec![tool("t1", ToolType::FileRead, "a.rs"), done("t1"), Step::Complete]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;
        h.send("read");
        let events = unified(&h.turn().await);
        assert_eq!(events[1], UnifiedEvent::status("t1", ToolStatus::Running));
        assert!(matches!(
            events[2],
            UnifiedEvent::ToolEnd {
                status: ToolStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn approved_permission_runs_then_completes() {
        let script = ScriptHandle::new();
        script.turn(vec![
            bash_ask("toolu_1"),
            Step::AwaitReplies(1),
            done("toolu_1"),
            Step::Complete,
        ]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;
        h.send("run the tests");

        assert!(matches!(h.next_unified().await, UnifiedEvent::ToolStart { .. }));
        let request_id = match h.next_unified().await {
            UnifiedEvent::ToolStatusUpdate {
                status: ToolStatus::AwaitingPermission,
                permission_request_id: Some(id),
                ..
            } => id,
            other => panic!("expected awaiting_permission, got {other:?}"),
        };
        assert_eq!(h.session().pending_permissions().len(), 1);

        h.registry.respond_permission(&h.id, &request_id, true).unwrap();
        let rest = unified(&h.turn().await);
        assert_eq!(
            rest,
            [
                UnifiedEvent::ToolStatusUpdate {
                    tool_id: "toolu_1".into(),
                    status: ToolStatus::Running,
                    permission_request_id: Some(request_id.clone()),
                },
                UnifiedEvent::ToolEnd {
                    tool_id: "toolu_1".into(),
                    status: ToolStatus::Completed,
                    output: None,
                },
                UnifiedEvent::Complete,
            ]
        );
        assert_eq!(script.replies().len(), 1);
        assert!(script.replies()[0].allowed);
        assert_eq!(script.replies()[0].reason, "User approved");

        // Already resolved: a second answer finds nothing.
        assert_eq!(
            h.registry.respond_permission(&h.id, &request_id, false),
            Err(SessionError::PermissionNotFound(request_id))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_permission_times_out_as_one_denial() {
        let script = ScriptHandle::new();
        script.turn(vec![
            bash_ask("toolu_1"),
            Step::AwaitReplies(1),
            done("toolu_1"),
            Step::Complete,
        ]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;
        let started = tokio::time::Instant::now();
        h.send("run the tests");
        let events = unified(&h.turn().await);

        assert!(started.elapsed() >= Duration::from_secs(60));
        let denials = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    UnifiedEvent::ToolStatusUpdate {
                        status: ToolStatus::Denied,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(denials, 1);
        // Denied is terminal: the late tool result is not forwarded.
        assert!(!events.iter().any(|event| matches!(event, UnifiedEvent::ToolEnd { .. })));
        assert_eq!(events.last(), Some(&UnifiedEvent::Complete));

        let replies = script.replies();
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].allowed);
        assert_eq!(replies[0].reason, "Permission request timed out");
    }

    #[tokio::test]
    async fn policy_decisions_skip_the_prompt() {
        let script = ScriptHandle::new();
        script.turn(vec![
            Step::Ask {
                id: "w1",
                tool: "Write",
                input: json!({"file_path": "a.txt"}),
            },
            Step::Ask {
                id: "q1",
                tool: "AskUserQuestion",
                input: json!({}),
            },
            done("w1"),
            Step::Complete,
        ]);
        let mut h = Harness::new(&script, PermissionPolicy::AutoEdit).await;
        h.send("write it");
        let events = unified(&h.turn().await);

        assert!(events.contains(&UnifiedEvent::status("w1", ToolStatus::Running)));
        assert!(events.contains(&UnifiedEvent::status("q1", ToolStatus::Denied)));
        assert!(!events.iter().any(|event| matches!(
            event,
            UnifiedEvent::ToolStatusUpdate {
                status: ToolStatus::AwaitingPermission,
                ..
            }
        )));
        let replies = script.replies();
        assert_eq!(
            replies.iter().map(|r| (r.request_id.as_str(), r.allowed)).collect::<Vec<_>>(),
            [("hook-w1", true), ("hook-q1", false)]
        );
        assert!(h.session().pending_permissions().is_empty());
    }

    #[tokio::test]
    async fn abort_drains_to_abort_complete_and_keeps_the_adapter() {
        let script = ScriptHandle::new();
        script
            .turn(vec![tool("t1", ToolType::Bash, "sleep 100"), Step::Text("running")])
            .on_interrupt(vec![Step::Error {
                message: "interrupted",
                recoverable: true,
            }, Step::Complete]);
        script.turn(vec![Step::Text("again"), Step::Complete]);
        let mut h = Harness::new(&script, PermissionPolicy::Unrestricted).await;

        h.send("long job");
        assert!(matches!(h.next_unified().await, UnifiedEvent::ToolStart { .. }));
        assert_eq!(h.next_unified().await, UnifiedEvent::text("running"));

        h.registry.abort_session(&h.id).unwrap();
        let events = h.turn().await;
        assert_eq!(
            events.last(),
            Some(&SessionEvent::AbortComplete { session_id: h.id.clone() })
        );
        let events = unified(&events);
        assert!(events.contains(&UnifiedEvent::error("interrupted", true)));
        assert!(!events.contains(&UnifiedEvent::Complete));
        assert!(events.contains(&UnifiedEvent::ToolEnd {
            tool_id: "t1".into(),
            status: ToolStatus::Aborted,
            output: None,
        }));
        assert_eq!(script.interrupts(), 1);

        h.settled().await;
        h.send("try again");
        let next = unified(&h.turn().await);
        assert_eq!(next, [UnifiedEvent::text("again"), UnifiedEvent::Complete]);
        assert_eq!(script.starts(), 1);
        assert_eq!(script.disconnects(), 0);
    }

    #[tokio::test]
    async fn abort_denies_open_permission_requests() {
        let script = ScriptHandle::new();
        script.turn(vec![bash_ask("toolu_1")]).on_interrupt(vec![Step::Close]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;
        h.send("rm things");

        assert!(matches!(h.next_unified().await, UnifiedEvent::ToolStart { .. }));
        assert!(matches!(
            h.next_unified().await,
            UnifiedEvent::ToolStatusUpdate {
                status: ToolStatus::AwaitingPermission,
                ..
            }
        ));

        h.registry.abort_session(&h.id).unwrap();
        let events = h.turn().await;
        assert!(matches!(events.last(), Some(SessionEvent::AbortComplete { .. })));
        let events = unified(&events);
        assert!(matches!(
            &events[0],
            UnifiedEvent::ToolStatusUpdate {
                status: ToolStatus::Denied,
                permission_request_id: Some(_),
                ..
            }
        ));
        // Denied is already terminal, so no aborted ToolEnd follows.
        assert_eq!(events.len(), 1);
        assert_eq!(script.replies()[0].reason, "Session aborted");
        assert!(h.session().pending_permissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_resets_the_connection() {
        let script = ScriptHandle::new();
        script.turn(vec![Step::Text("stuck")]);
        script.turn(vec![Step::Complete]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;
        h.send("hang");
        assert_eq!(h.next_unified().await, UnifiedEvent::text("stuck"));

        let started = tokio::time::Instant::now();
        h.registry.abort_session(&h.id).unwrap();
        let events = h.turn().await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(matches!(
            unified(&events).as_slice(),
            [UnifiedEvent::Error {
                recoverable: true,
                ..
            }]
        ));
        assert!(matches!(events.last(), Some(SessionEvent::AbortComplete { .. })));
        assert_eq!(script.disconnects(), 1);

        h.settled().await;
        h.send("retry");
        assert_eq!(unified(&h.turn().await), [UnifiedEvent::Complete]);
        assert_eq!(script.start_tokens(), [None, Some("scripted-1".to_string())]);
        assert_eq!(h.registry.resume_token(&h.id).unwrap().as_deref(), Some("scripted-1"));
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_busy() {
        let script = ScriptHandle::new();
        script.turn(vec![Step::Text("thinking")]).on_interrupt(vec![Step::Close]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;

        h.send("first");
        assert!(matches!(
            h.registry.send_message(&h.id, "second"),
            Err(SessionError::SessionBusy(_))
        ));
        assert_eq!(h.session().state(), TurnState::Streaming);

        h.registry.abort_session(&h.id).unwrap();
        h.turn().await;
        h.settled().await;
        assert_eq!(script.sends().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_sends_start_exactly_one_turn() {
        let script = ScriptHandle::new();
        script.turn(vec![Step::Text("only one")]).on_interrupt(vec![Step::Close]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;

        let attempts: Vec<_> = (0..8)
            .map(|n| {
                let registry = h.registry.clone();
                let id = h.id.clone();
                tokio::spawn(async move { registry.send_message(&id, &format!("msg {n}")) })
            })
            .collect();
        let mut accepted = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert!(matches!(e, SessionError::SessionBusy(_))),
            }
        }
        assert_eq!(accepted, 1);

        h.registry.abort_session(&h.id).unwrap();
        h.turn().await;
        h.settled().await;
    }

    #[tokio::test]
    async fn colliding_native_ids_become_distinct_tools() {
        let script = ScriptHandle::new();
        script.turn(vec![
            tool("call_1", ToolType::FileRead, "a.rs"),
            done("call_1"),
            tool("call_1", ToolType::FileRead, "b.rs"),
            done("call_1"),
            Step::Complete,
        ]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;
        h.send("read both");
        let starts: Vec<(String, String)> = unified(&h.turn().await)
            .into_iter()
            .filter_map(|event| match event {
                UnifiedEvent::ToolStart { tool_id, target, .. } => Some((tool_id, target)),
                _ => None,
            })
            .collect();
        assert_eq!(
            starts,
            [
                ("call_1".to_string(), "a.rs".to_string()),
                ("call_1#2".to_string(), "b.rs".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn malformed_record_is_skipped() {
        let script = ScriptHandle::new();
        script.turn(vec![
            Step::Text("a"),
            Step::Malformed,
            Step::Text("b"),
            Step::Complete,
        ]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;
        h.send("go");
        assert_eq!(
            unified(&h.turn().await),
            [UnifiedEvent::text("a"), UnifiedEvent::text("b"), UnifiedEvent::Complete]
        );
    }

    #[tokio::test]
    async fn send_failure_is_fatal_for_the_turn_only() {
        let script = ScriptHandle::new();
        script.fail_next_send(BackendError::SpawnFailed {
            backend: BackendKind::Claude,
            message: "No such file or directory".into(),
        });
        script.turn(vec![Step::Text("recovered"), Step::Complete]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;

        h.send("first");
        let events = unified(&h.turn().await);
        assert!(matches!(
            events.as_slice(),
            [UnifiedEvent::Error {
                recoverable: false,
                ..
            }]
        ));
        h.settled().await;

        h.send("second");
        assert_eq!(
            unified(&h.turn().await),
            [UnifiedEvent::text("recovered"), UnifiedEvent::Complete]
        );
        assert_eq!(script.starts(), 2);
    }

    #[tokio::test]
    async fn abort_before_a_failed_send_still_completes_the_abort() {
        let script = ScriptHandle::new();
        script.fail_next_send(BackendError::SpawnFailed {
            backend: BackendKind::Claude,
            message: "No such file or directory".into(),
        });
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;

        h.send("first");
        h.registry.abort_session(&h.id).unwrap();
        h.settled().await;

        let mut events = Vec::new();
        while let Some(event) = h.events.try_next() {
            events.push(event);
        }
        assert!(matches!(
            events.as_slice(),
            [
                SessionEvent::Turn {
                    event: UnifiedEvent::Error {
                        recoverable: false,
                        ..
                    },
                    ..
                },
                SessionEvent::AbortComplete { .. },
            ]
        ));
    }

    #[tokio::test]
    async fn broken_stream_fails_the_turn_and_drops_the_adapter() {
        let script = ScriptHandle::new();
        script.turn(vec![Step::Text("partial"), Step::Fail]);
        script.turn(vec![Step::Text("partial"), Step::Close]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;

        for _ in 0..2 {
            h.send("go");
            let events = unified(&h.turn().await);
            assert_eq!(events[0], UnifiedEvent::text("partial"));
            assert!(matches!(
                events[1],
                UnifiedEvent::Error {
                    recoverable: false,
                    ..
                }
            ));
            h.settled().await;
        }
        assert_eq!(script.disconnects(), 2);
        assert_eq!(script.starts(), 2);
    }

    #[tokio::test]
    async fn backend_reported_failure_keeps_the_adapter() {
        let script = ScriptHandle::new();
        script.turn(vec![Step::Error {
            message: "model overloaded",
            recoverable: false,
        }]);
        script.turn(vec![Step::Complete]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;

        h.send("go");
        assert_eq!(
            unified(&h.turn().await),
            [UnifiedEvent::error("model overloaded", false)]
        );
        h.settled().await;
        h.send("again");
        assert_eq!(unified(&h.turn().await), [UnifiedEvent::Complete]);
        assert_eq!(script.starts(), 1);
    }

    #[tokio::test]
    async fn settings_apply_from_the_next_turn() {
        let script = ScriptHandle::new();
        script.turn(vec![Step::Complete]);
        script.turn(vec![Step::Complete]);
        let mut h = Harness::new(&script, PermissionPolicy::Restrictive).await;

        h.send("one");
        h.turn().await;
        h.settled().await;
        h.registry.set_model(&h.id, "opus").unwrap();
        h.registry
            .set_permission_policy(&h.id, PermissionPolicy::Unrestricted)
            .unwrap();
        h.send("two");
        h.turn().await;

        let sends = script.sends();
        assert_eq!(sends[0].1.model, "sonnet");
        assert_eq!(sends[1].1.model, "opus");
        assert_eq!(sends[1].1.permission_policy, PermissionPolicy::Unrestricted);
    }
}
