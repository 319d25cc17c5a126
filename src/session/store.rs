//! Authoritative session state and typed event fan-out.
//!
//! The store is the only shared mutable structure in the engine. Each
//! session's state lives behind its own lock; a mutation and its event
//! append happen atomically under that lock, and the event is then handed
//! to a per-session dispatcher task that delivers it to subscribers in
//! order, outside the lock.
//!
//! Backpressure rule: each subscriber has a bounded buffer. A subscriber
//! that falls behind is disconnected with a final overflow notice rather
//! than silently losing events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ModelSelection;
use crate::error::EngineError;
use crate::session::event::{Event, EventPayload, StepToolCall};
use crate::session::flow::{FlowGraph, derive_flow};
use crate::session::model::{
    AgentRecord, AgentStatus, ORCHESTRATOR_AGENT_ID, PlanStep, PlanStepStatus, Session,
    SessionStatus, ToolCallRecord, ToolCallStatus,
};

/// Bounded buffer capacity per subscriber.
const SUBSCRIBER_BUFFER: usize = 256;
/// Deadline for a new subscriber to absorb its backlog.
const BACKLOG_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages consumed by a session's dispatcher task.
///
/// Both events and subscriber registrations flow through the same ordered
/// channel, which is what makes backlog + live delivery gapless: a
/// registration enqueued under the session lock sits at a fixed position
/// in the event order, and its backlog snapshot contains exactly the
/// events before that position.
enum DispatchMsg {
    Event(Event),
    Subscribe {
        backlog: Vec<Event>,
        tx: mpsc::Sender<Event>,
    },
}

struct Inner {
    session: Session,
    events: Vec<Event>,
    dispatch_tx: Option<mpsc::UnboundedSender<DispatchMsg>>,
}

/// Per-session state, lock, notifications, and cancellation.
pub struct SessionHandle {
    session_id: String,
    inner: Mutex<Inner>,
    /// Signalled on every agent status change; `wait_for_agents` parks here.
    agent_notify: Notify,
    cancel: CancellationToken,
    subscriber_count: watch::Sender<usize>,
}

/// A live event subscription: the backlog at subscription time followed by
/// all subsequent events, ending when the session reaches a terminal
/// status or the subscriber is disconnected on overflow.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    _guard: SubscriberGuard,
}

impl EventStream {
    /// Receives the next event, or `None` when the stream has ended.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for EventStream {
    type Item = Event;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

struct SubscriberGuard {
    handle: Arc<SessionHandle>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.handle.subscriber_count.send_modify(|n| {
            *n = n.saturating_sub(1);
        });
    }
}

impl SessionHandle {
    /// The session's UUID.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The session-level cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits until the next agent status change.
    pub async fn agent_status_changed(&self) {
        self.agent_notify.notified().await;
    }

    /// Watch channel tracking the live subscriber count.
    #[must_use]
    pub fn subscriber_watch(&self) -> watch::Receiver<usize> {
        self.subscriber_count.subscribe()
    }

    /// Returns a consistent snapshot of the session.
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.locked(|inner| inner.session.clone())
    }

    /// Number of events logged so far.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.locked(|inner| inner.events.len())
    }

    /// Derives the current flow graph.
    #[must_use]
    pub fn flow_data(&self) -> FlowGraph {
        self.locked(|inner| derive_flow(&inner.session))
    }

    /// Snapshot of one agent, if it exists.
    #[must_use]
    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.locked(|inner| inner.session.agents.get(agent_id).cloned())
    }

    /// Subscribes to the session's event stream.
    ///
    /// The stream yields a `connected` frame, then every event already
    /// logged, then every subsequent event, with no gap and no duplicate.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> EventStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscriber_count.send_modify(|n| *n += 1);

        let connected = Event::now(EventPayload::Connected {
            session_id: self.session_id.clone(),
        });

        {
            let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut backlog = Vec::with_capacity(inner.events.len() + 1);
            backlog.push(connected);
            backlog.extend(inner.events.iter().cloned());
            if let Some(dispatch_tx) = &inner.dispatch_tx {
                let _ = dispatch_tx.send(DispatchMsg::Subscribe { backlog, tx });
            } else {
                // Terminal session: deliver the backlog from a detached task,
                // then let the sender drop to end the stream.
                tokio::spawn(async move {
                    for event in backlog {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }

        EventStream {
            rx,
            _guard: SubscriberGuard {
                handle: Arc::clone(self),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Mutations. Each holds the lock for the state change + event append.
    // -----------------------------------------------------------------------

    /// Moves the session to a new status and emits `session_status_change`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] if the session is already
    /// terminal.
    pub fn update_status(&self, status: SessionStatus) -> Result<(), EngineError> {
        self.mutate(|session| {
            if session.status.is_terminal() {
                return Err(EngineError::Orchestration {
                    message: format!(
                        "session {} is terminal ({}); refusing transition to {status}",
                        session.session_id, session.status
                    ),
                });
            }
            session.status = status;
            Ok(EventPayload::SessionStatusChange {
                status: status.to_string(),
            })
        })?;
        if status.is_terminal() {
            self.close();
            self.agent_notify.notify_waiters();
        }
        Ok(())
    }

    /// Registers a new agent and emits `agent_spawned`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] if the agent ID already exists.
    pub fn add_agent(&self, agent: AgentRecord) -> Result<(), EngineError> {
        self.mutate(|session| {
            if session.agents.contains_key(&agent.agent_id) {
                return Err(EngineError::Orchestration {
                    message: format!("agent {} already exists", agent.agent_id),
                });
            }
            let payload = EventPayload::AgentSpawned {
                agent_id: agent.agent_id.clone(),
                task: agent.task.clone(),
                description: agent.description.clone(),
            };
            session.agents.insert(agent.agent_id.clone(), agent);
            session.flow = derive_flow(session);
            Ok(payload)
        })
    }

    /// Allocates the next generated agent ID.
    #[must_use]
    pub fn allocate_agent_id(&self) -> String {
        self.locked(|inner| inner.session.allocate_agent_id())
    }

    /// Number of non-orchestrator agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.locked(|inner| inner.session.agent_count())
    }

    /// Moves an agent to a new status and emits `agent_status_change`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AgentNotFound`] for unknown agents and
    /// [`EngineError::Orchestration`] for transitions out of a terminal
    /// status.
    pub fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let result = self.mutate(|session| {
            let agent =
                session
                    .agents
                    .get_mut(agent_id)
                    .ok_or_else(|| EngineError::AgentNotFound {
                        id: agent_id.to_string(),
                    })?;
            if agent.status.is_terminal() {
                return Err(EngineError::Orchestration {
                    message: format!(
                        "agent {agent_id} is terminal ({}); refusing transition to {status}",
                        agent.status
                    ),
                });
            }
            let now = Utc::now();
            agent.status = status;
            agent.updated_at = now;
            agent.last_activity = now;
            if status == AgentStatus::Retrying {
                agent.retry_count += 1;
            }
            if let Some(ref e) = error {
                agent.error = Some(e.clone());
            }
            Ok(EventPayload::AgentStatusChange {
                agent_id: agent_id.to_string(),
                status: status.to_string(),
                error,
                retry_count: (agent.retry_count > 0).then_some(agent.retry_count),
            })
        });
        // Wake wait_for_agents regardless of transition outcome.
        self.agent_notify.notify_waiters();
        result
    }

    /// Records the start of a tool call and emits `tool_call`.
    ///
    /// A missing `tool_call_id` is generated; a duplicate within the agent
    /// is made unique by suffixing, preserving uniqueness per agent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AgentNotFound`] for unknown agents.
    pub fn add_tool_call(
        &self,
        agent_id: &str,
        mut record: ToolCallRecord,
    ) -> Result<String, EngineError> {
        let mut stored_id = record.tool_call_id.clone();
        self.mutate(|session| {
            let agent =
                session
                    .agents
                    .get_mut(agent_id)
                    .ok_or_else(|| EngineError::AgentNotFound {
                        id: agent_id.to_string(),
                    })?;
            if record.tool_call_id.is_empty() {
                record.tool_call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
            }
            if agent
                .tool_calls
                .iter()
                .any(|c| c.tool_call_id == record.tool_call_id)
            {
                record.tool_call_id =
                    format!("{}_{}", record.tool_call_id, agent.tool_calls.len());
            }
            stored_id = record.tool_call_id.clone();
            let now = Utc::now();
            agent.last_activity = now;
            agent.updated_at = now;
            let payload = EventPayload::ToolCall {
                agent_id: agent_id.to_string(),
                tool_call_id: record.tool_call_id.clone(),
                tool_name: record.tool_name.clone(),
                input: record.input.clone(),
                step_number: record.step_number,
                index_in_step: record.index_in_step,
                started_at: record.started_at.to_rfc3339(),
                description: record.description.clone(),
            };
            agent.tool_calls.push(record.clone());
            session.flow = derive_flow(session);
            Ok(payload)
        })?;
        Ok(stored_id)
    }

    /// Completes a tool call and emits `tool_result`.
    ///
    /// A call's status and result may be updated from executing to a
    /// terminal status exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] if the call is unknown or
    /// already terminal.
    pub fn update_tool_call(
        &self,
        agent_id: &str,
        tool_call_id: &str,
        status: ToolCallStatus,
        result: Option<serde_json::Value>,
        input: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        self.mutate(|session| {
            let agent =
                session
                    .agents
                    .get_mut(agent_id)
                    .ok_or_else(|| EngineError::AgentNotFound {
                        id: agent_id.to_string(),
                    })?;
            let call = agent
                .tool_calls
                .iter_mut()
                .find(|c| c.tool_call_id == tool_call_id)
                .ok_or_else(|| EngineError::Orchestration {
                    message: format!("unknown tool call {tool_call_id} on agent {agent_id}"),
                })?;
            if call.status.is_terminal() {
                return Err(EngineError::Orchestration {
                    message: format!("tool call {tool_call_id} already terminal"),
                });
            }
            let now = Utc::now();
            call.status = status;
            call.result = result.clone();
            if let Some(full_input) = input {
                call.input = full_input;
            }
            call.completed_at = Some(now);
            let duration = (now - call.started_at).num_milliseconds().max(0);
            call.duration_ms = Some(duration.unsigned_abs());
            agent.last_activity = now;
            agent.updated_at = now;
            Ok(EventPayload::ToolResult {
                agent_id: agent_id.to_string(),
                tool_call_id: tool_call_id.to_string(),
                tool_name: call.tool_name.clone(),
                status: match status {
                    ToolCallStatus::Failed => "failed".to_string(),
                    _ => "completed".to_string(),
                },
                result,
                started_at: call.started_at.to_rfc3339(),
                completed_at: now.to_rfc3339(),
                duration_ms: duration.unsigned_abs(),
                step_number: call.step_number,
                index_in_step: call.index_in_step,
            })
        })
    }

    /// Records one orchestrator turn and emits `orchestrator_step`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] if the session is terminal.
    pub fn add_orchestrator_step(
        &self,
        step_number: usize,
        tool_calls: Vec<StepToolCall>,
    ) -> Result<(), EngineError> {
        self.mutate(|_session| {
            Ok(EventPayload::OrchestratorStep {
                step_number,
                tool_calls,
            })
        })
    }

    /// Replaces or appends plan steps and emits `plan_update`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] if the session is terminal.
    pub fn update_plan(
        &self,
        descriptions: Vec<String>,
        replace: bool,
    ) -> Result<Vec<PlanStep>, EngineError> {
        let mut updated = Vec::new();
        self.mutate(|session| {
            if replace {
                session.plan.clear();
            }
            let base = session.plan.len();
            let now = Utc::now();
            for (i, description) in descriptions.into_iter().enumerate() {
                let step_id = session.allocate_step_id();
                session.plan.insert(
                    step_id.clone(),
                    PlanStep {
                        step_id,
                        description,
                        status: PlanStepStatus::Pending,
                        agent_ids: Vec::new(),
                        created_at: now,
                        updated_at: now,
                        order: Some(base + i),
                    },
                );
            }
            let steps = session.ordered_plan();
            updated = steps.clone();
            Ok(EventPayload::PlanUpdate {
                total_steps: steps.len(),
                steps,
            })
        })?;
        Ok(updated)
    }

    /// Stores the planner's strategic perspective (no event; surfaced via
    /// the plan file and `plan_update`).
    pub fn set_strategic_perspective(&self, text: String) {
        self.locked(|inner| {
            inner.session.strategic_perspective = Some(text);
            inner.session.updated_at = Utc::now();
        });
    }

    /// Emits an `error` event without mutating entity state.
    pub fn emit_error(&self, source: &str, error: String, agent_id: Option<String>) {
        let _ = self.mutate(|_| {
            Ok(EventPayload::Error {
                source: source.to_string(),
                error,
                stack: None,
                agent_id,
            })
        });
    }

    /// Emits an `agent_failed` event.
    pub fn emit_agent_failed(&self, agent_id: &str, error: String, error_type: &str, attempts: u32) {
        let _ = self.mutate(|_| {
            Ok(EventPayload::AgentFailed {
                agent_id: agent_id.to_string(),
                error,
                error_type: error_type.to_string(),
                attempts,
            })
        });
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn locked<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut inner)
    }

    /// Runs a mutation and appends its event atomically.
    ///
    /// Refuses mutations on terminal sessions: the event log must not grow
    /// after the terminal event.
    fn mutate(
        &self,
        f: impl FnOnce(&mut Session) -> Result<EventPayload, EngineError>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.dispatch_tx.is_none() {
            return Err(EngineError::Orchestration {
                message: format!("session {} is closed", self.session_id),
            });
        }
        let payload = f(&mut inner.session)?;
        inner.session.updated_at = Utc::now();
        let event = Event::now(payload);
        inner.events.push(event.clone());
        if let Some(tx) = &inner.dispatch_tx {
            let _ = tx.send(DispatchMsg::Event(event));
        }
        Ok(())
    }

    /// Ends event dispatch: queued events drain to subscribers, then their
    /// streams close.
    fn close(&self) {
        self.locked(|inner| inner.dispatch_tx = None);
    }
}

/// Dispatcher task: forwards events to subscribers in log order.
async fn run_dispatcher(session_id: String, mut rx: mpsc::UnboundedReceiver<DispatchMsg>) {
    let mut subscribers: Vec<mpsc::Sender<Event>> = Vec::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            DispatchMsg::Subscribe { backlog, tx } => {
                // A subscriber that cannot absorb its own backlog promptly
                // would stall delivery to everyone else; give it a deadline.
                let delivery = async {
                    for event in backlog {
                        if tx.send(event).await.is_err() {
                            return false;
                        }
                    }
                    true
                };
                let delivered = tokio::time::timeout(BACKLOG_DELIVERY_TIMEOUT, delivery).await;
                match delivered {
                    Ok(true) => subscribers.push(tx),
                    Ok(false) => {}
                    Err(_) => {
                        warn!(%session_id, "subscriber too slow to take its backlog, dropping");
                    }
                }
            }
            DispatchMsg::Event(event) => {
                let mut dropped = Vec::new();
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped.push(tx.clone());
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
                for tx in dropped {
                    warn!(%session_id, "disconnecting slow subscriber on overflow");
                    let sid = session_id.clone();
                    tokio::spawn(async move {
                        let notice = Event::now(EventPayload::Error {
                            source: "system".to_string(),
                            error: "subscriber disconnected: event buffer overflow".to_string(),
                            stack: None,
                            agent_id: None,
                        });
                        let _ = tx.send(notice).await;
                        debug!(session_id = %sid, "overflow notice delivered");
                    });
                }
            }
        }
    }
}

/// Table of live sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session in `initializing` status with the orchestrator
    /// pseudo-agent seeded in `running` status, and starts its dispatcher.
    ///
    /// Must be called within a tokio runtime.
    pub fn create(
        &self,
        query: String,
        clarification: Option<String>,
        models: ModelSelection,
    ) -> Arc<SessionHandle> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut agents = HashMap::new();
        agents.insert(
            ORCHESTRATOR_AGENT_ID.to_string(),
            AgentRecord::new(
                ORCHESTRATOR_AGENT_ID,
                "Coordinate research and assemble the final report",
                AgentStatus::Running,
            ),
        );

        let mut session = Session {
            session_id: session_id.clone(),
            query,
            clarification,
            models,
            status: SessionStatus::Initializing,
            created_at: now,
            updated_at: now,
            agents,
            plan: HashMap::new(),
            strategic_perspective: None,
            flow: FlowGraph::default(),
            next_agent_seq: 0,
            next_step_seq: 0,
        };
        session.flow = derive_flow(&session);

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(session_id.clone(), dispatch_rx));

        let handle = Arc::new(SessionHandle {
            session_id: session_id.clone(),
            inner: Mutex::new(Inner {
                session,
                events: Vec::new(),
                dispatch_tx: Some(dispatch_tx),
            }),
            agent_notify: Notify::new(),
            cancel: CancellationToken::new(),
            subscriber_count: watch::channel(0).0,
        });

        // The creation mutation itself: initializing status appears in the log.
        let _ = handle.mutate(|session| {
            Ok(EventPayload::SessionStatusChange {
                status: session.status.to_string(),
            })
        });

        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session_id, Arc::clone(&handle));
        handle
    }

    /// Looks up a session.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionNotFound`] for unknown IDs.
    pub fn get(&self, session_id: &str) -> Result<Arc<SessionHandle>, EngineError> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound {
                id: session_id.to_string(),
            })
    }

    /// IDs of all live sessions.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Removes terminal sessions whose last update is older than `max_age`.
    /// Returns the number removed.
    pub fn cleanup_old(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, handle| {
            let snapshot = handle.snapshot();
            !(snapshot.status.is_terminal() && snapshot.updated_at < cutoff)
        });
        before - sessions.len()
    }
}
