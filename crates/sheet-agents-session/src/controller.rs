//! Session controller: owns the session table and routes commands, agent
//! completions and events.
//!
//! Each session gets a worker task draining an unbounded inbound queue. The
//! worker handles client commands and agent completions strictly in queue
//! order and is the only publisher to the session's [`Outbound`], which gives
//! per-session FIFO delivery without holding locks across store calls.
//!
//! Lock order is `sessions` then the scheduler's table; the scheduler never
//! touches `sessions`.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use sheet_agents_core::{
    AddressError, AgentReply, CellAddr, CellRange, Command, ControllerError, Envelope, Event,
    EventReceiver, Outbound, RefKind, SheetBounds, SpreadsheetRef, SpreadsheetStore, Value,
    traits::{AgentRuntime, InvocationId, SessionId},
};
use sheet_agents_executor::{
    ApprovalError, ApprovalHandler, ApprovalStatus, WritePreview, to_commands,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    context::{SessionContext, SessionInput, SessionState},
    scheduler::{Completion, Outcome, Scheduler, SchedulerConfig, SchedulerError},
};

/// Default ceiling on concurrently open sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Default wait for an approval decision on agent writes.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub max_sessions: usize,
    pub scheduler: SchedulerConfig,
    /// How long an approval handler may take before the plan is denied.
    pub approval_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            scheduler: SchedulerConfig::default(),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub const fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    #[must_use]
    pub const fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub const fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }
}

/// A freshly created session and the consumer end of its event channel.
pub struct SessionHandle {
    pub id: SessionId,
    pub events: EventReceiver,
}

/// Point-in-time controller counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub sessions: usize,
    pub running: usize,
    pub pending: usize,
    /// Completions whose session was already gone.
    pub dropped: u64,
}

struct Inner {
    config: ControllerConfig,
    store: Arc<dyn SpreadsheetStore>,
    scheduler: Scheduler,
    approvals: Arc<dyn ApprovalHandler>,
    sessions: Mutex<HashMap<SessionId, SessionContext>>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Coordination core between sessions, the store and the agent scheduler.
///
/// Cheap to clone; all clones drive the same session table. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    #[must_use]
    pub fn new(
        store: Arc<dyn SpreadsheetStore>,
        runtime: Arc<dyn AgentRuntime>,
        approvals: Arc<dyn ApprovalHandler>,
        config: ControllerConfig,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            store,
            scheduler: Scheduler::new(runtime, config.scheduler, completions_tx),
            approvals,
            sessions: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(pump_completions(Arc::downgrade(&inner), completions_rx));
        Self { inner }
    }

    #[must_use]
    pub fn config(&self) -> ControllerConfig {
        self.inner.config
    }

    /// Open a session.
    ///
    /// # Errors
    /// Returns [`ControllerError::ResourceExhausted`] when the session table is
    /// full or the controller has shut down.
    pub fn create_context(&self) -> Result<SessionHandle, ControllerError> {
        let limit = self.inner.config.max_sessions;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ControllerError::ResourceExhausted { limit });
        }

        let id = Uuid::new_v4();
        let (outbound, events) = Outbound::channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        {
            let mut sessions = self.inner.lock();
            if sessions.len() >= limit {
                tracing::warn!("Refusing session: {} of {limit} open", sessions.len());
                return Err(ControllerError::ResourceExhausted { limit });
            }
            let mut ctx = SessionContext::new(id, outbound, inbound_tx);
            ctx.transition(SessionState::Active);
            sessions.insert(id, ctx);
        }

        tokio::spawn(run_worker(Arc::downgrade(&self.inner), id, inbound_rx));
        tracing::info!("Session {id} created");
        Ok(SessionHandle { id, events })
    }

    /// Queue a command for `session_id`.
    ///
    /// Only routing can fail here; every other failure is reported to the
    /// session as an [`Event::Error`] in command order.
    ///
    /// # Errors
    /// Returns [`ControllerError::UnknownSession`] if the session does not exist
    /// or is closed.
    pub fn dispatch(&self, session_id: SessionId, envelope: Envelope) -> Result<(), ControllerError> {
        let sessions = self.inner.lock();
        let ctx = sessions
            .get(&session_id)
            .filter(|ctx| ctx.state() != SessionState::Closed)
            .ok_or(ControllerError::UnknownSession(session_id))?;
        ctx.inbound
            .send(SessionInput::Command(envelope))
            .map_err(|_| ControllerError::UnknownSession(session_id))
    }

    /// Forward an agent completion to its session's queue.
    ///
    /// Completions for sessions that are gone are released and counted as
    /// dropped.
    pub fn execute_from_agent(&self, completion: Completion) {
        self.inner.execute_from_agent(completion);
    }

    /// Tear a session down after a disconnect.
    ///
    /// Cancels every invocation of the session, publishes
    /// [`Event::Disconnected`] and closes the outbound channel. The session
    /// stays `Draining` until its in-flight invocations are terminal. Tearing
    /// down a draining session again is a no-op.
    ///
    /// # Errors
    /// Returns [`ControllerError::UnknownSession`] if the session is gone.
    pub fn teardown_context(&self, session_id: SessionId, reason: &str) -> Result<(), ControllerError> {
        let mut sessions = self.inner.lock();
        let ctx = sessions
            .get_mut(&session_id)
            .ok_or(ControllerError::UnknownSession(session_id))?;
        if !ctx.transition(SessionState::Draining) {
            return Ok(());
        }

        ctx.cancel.cancel();
        ctx.outbound.push(Event::Disconnected {
            reason: reason.to_string(),
        });
        ctx.outbound.close();
        tracing::info!(
            "Session {session_id} torn down ({reason}), {} invocations in flight",
            ctx.active.len()
        );

        if ctx.is_drained() {
            close_session(&mut sessions, session_id);
        }
        Ok(())
    }

    /// Lifecycle state, or `None` once the session is closed and removed.
    #[must_use]
    pub fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.inner.lock().get(&session_id).map(SessionContext::state)
    }

    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        let sessions = self.inner.lock().len();
        ControllerStats {
            sessions,
            running: self.inner.scheduler.running(),
            pending: self.inner.scheduler.pending(),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Tear down every session and stop the scheduler.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<SessionId> = self.inner.lock().keys().copied().collect();
        tracing::info!("Controller shutting down, {} sessions open", ids.len());
        for id in ids {
            if let Err(e) = self.teardown_context(id, "server shutting down") {
                tracing::debug!("Shutdown teardown of {id}: {e}");
            }
        }
        self.inner.scheduler.shutdown();
    }
}

async fn pump_completions(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Completion>) {
    while let Some(completion) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.execute_from_agent(completion);
    }
    tracing::debug!("Completion pump stopped");
}

async fn run_worker(
    inner: Weak<Inner>,
    session_id: SessionId,
    mut rx: mpsc::UnboundedReceiver<SessionInput>,
) {
    while let Some(input) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match input {
            SessionInput::Command(envelope) => inner.handle_command(session_id, envelope).await,
            SessionInput::AgentFinished(completion) => {
                inner.handle_completion(session_id, completion).await;
            }
        }
    }
    tracing::debug!("Worker for session {session_id} stopped");
}

fn close_session(sessions: &mut HashMap<SessionId, SessionContext>, session_id: SessionId) {
    if let Some(mut ctx) = sessions.remove(&session_id) {
        ctx.transition(SessionState::Closed);
        tracing::info!("Session {session_id} closed");
    }
}

fn wrong_kind(expected: RefKind, found: SpreadsheetRef) -> ControllerError {
    AddressError::WrongKind {
        expected,
        found: found.to_string(),
    }
    .into()
}

fn len_u32(len: usize) -> Result<u32, ControllerError> {
    u32::try_from(len).map_err(|_| ControllerError::InvalidCommand(format!("{len} values")))
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionContext>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute_from_agent(&self, completion: Completion) {
        let session_id = completion.session_id;
        let invocation_id = completion.invocation_id;

        let delivered = {
            let sessions = self.lock();
            sessions.get(&session_id).is_some_and(|ctx| {
                ctx.inbound
                    .send(SessionInput::AgentFinished(completion))
                    .is_ok()
            })
        };

        if !delivered {
            tracing::debug!("Dropping completion of {invocation_id}: session {session_id} is gone");
            self.scheduler.release(invocation_id);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publish to the session if it is active, otherwise to its discard sink.
    fn deliver(&self, session_id: SessionId, event: Event) {
        let sessions = self.lock();
        match sessions.get(&session_id) {
            Some(ctx) if ctx.state() == SessionState::Active => {
                ctx.outbound.push(event);
            }
            Some(ctx) => ctx.outbound.discard(&event),
            None => tracing::trace!("Session {session_id} closed, not delivering {event:?}"),
        }
    }

    async fn handle_command(&self, session_id: SessionId, envelope: Envelope) {
        if !self.lock().contains_key(&session_id) {
            return;
        }

        let Envelope {
            request_id,
            command,
        } = envelope;
        let name = command.name();
        let event = match self.execute(session_id, command, request_id.clone()).await {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("Session {session_id}: {name} failed: {err}");
                Event::error(request_id, &err)
            }
        };
        self.deliver(session_id, event);
    }

    async fn handle_completion(&self, session_id: SessionId, completion: Completion) {
        let invocation_id = completion.invocation_id;
        let active = self
            .lock()
            .get(&session_id)
            .is_some_and(|ctx| ctx.state() == SessionState::Active);

        if active {
            let event = self.agent_event(session_id, completion).await;
            self.deliver(session_id, event);
        } else {
            tracing::debug!("Session {session_id} draining, discarding result of {invocation_id}");
            self.deliver(session_id, Event::AgentCancelled { invocation_id });
        }

        {
            let mut sessions = self.lock();
            if let Some(ctx) = sessions.get_mut(&session_id) {
                ctx.active.remove(&invocation_id);
                if ctx.is_drained() {
                    close_session(&mut sessions, session_id);
                }
            }
        }
        self.scheduler.release(invocation_id);
    }

    /// Terminal event for a finished invocation, applying its tool calls.
    async fn agent_event(&self, session_id: SessionId, completion: Completion) -> Event {
        let invocation_id = completion.invocation_id;
        if completion.cancel_requested {
            return Event::AgentCancelled { invocation_id };
        }
        match completion.outcome {
            Outcome::Cancelled => Event::AgentCancelled { invocation_id },
            Outcome::Failed(message) => Event::AgentError {
                invocation_id,
                message,
            },
            Outcome::Completed(reply) => {
                match self.apply_reply(session_id, invocation_id, reply).await {
                    Ok(output) => Event::AgentOutput {
                        invocation_id,
                        output,
                    },
                    Err(err) => Event::AgentError {
                        invocation_id,
                        message: err.to_string(),
                    },
                }
            }
        }
    }

    /// Run the reply's tool calls through the command handler.
    ///
    /// Each call's result is published with the call id as `request_id`. The
    /// first failing call stops the plan.
    async fn apply_reply(
        &self,
        session_id: SessionId,
        invocation_id: InvocationId,
        reply: AgentReply,
    ) -> Result<String, ControllerError> {
        if reply.tool_calls.is_empty() {
            return Ok(reply.output);
        }

        let commands = to_commands(&reply.tool_calls)
            .map_err(|e| ControllerError::InvalidCommand(e.to_string()))?;

        let preview = WritePreview::summarize(commands.iter().map(|(_, command)| command));
        if preview.writes > 0 {
            let review = self.approvals.review(invocation_id, &preview);
            let status = tokio::time::timeout(self.config.approval_timeout, review)
                .await
                .unwrap_or(Err(ApprovalError::TimedOut));
            match status {
                Ok(ApprovalStatus::Approved) => {}
                Ok(ApprovalStatus::Denied { reason }) => {
                    return Err(ControllerError::Denied(reason));
                }
                Err(e) => {
                    tracing::warn!("Approval for invocation {invocation_id} failed: {e}");
                    return Err(ControllerError::Denied(e.to_string()));
                }
            }
        }

        tracing::debug!(
            "Invocation {invocation_id} applying {} tool calls",
            commands.len()
        );
        for (call_id, command) in commands {
            match self.execute(session_id, command, call_id.clone()).await {
                Ok(event) => self.deliver(session_id, event),
                Err(err) => {
                    self.deliver(session_id, Event::error(call_id, &err));
                    return Err(err);
                }
            }
        }
        Ok(reply.output)
    }

    async fn bounds(&self) -> Result<SheetBounds, ControllerError> {
        Ok(self.store.bounds().await?)
    }

    /// Parse `address` as `kind` and check it against the sheet.
    async fn resolve(&self, kind: RefKind, address: &str) -> Result<SpreadsheetRef, ControllerError> {
        let target = SpreadsheetRef::parse_as(kind, address)?;
        self.bounds().await?.check(&target)?;
        Ok(target)
    }

    async fn cell(&self, address: &str) -> Result<CellAddr, ControllerError> {
        match self.resolve(RefKind::Cell, address).await? {
            SpreadsheetRef::Cell(cell) => Ok(cell),
            other => Err(wrong_kind(RefKind::Cell, other)),
        }
    }

    async fn row(&self, address: &str) -> Result<u32, ControllerError> {
        match self.resolve(RefKind::Row, address).await? {
            SpreadsheetRef::Row(row) => Ok(row),
            other => Err(wrong_kind(RefKind::Row, other)),
        }
    }

    async fn column(&self, address: &str) -> Result<u32, ControllerError> {
        match self.resolve(RefKind::Column, address).await? {
            SpreadsheetRef::Column(col) => Ok(col),
            other => Err(wrong_kind(RefKind::Column, other)),
        }
    }

    async fn range(&self, address: &str) -> Result<CellRange, ControllerError> {
        match self.resolve(RefKind::Range, address).await? {
            SpreadsheetRef::Range(range) => Ok(range),
            other => Err(wrong_kind(RefKind::Range, other)),
        }
    }

    /// Check that a row/column write of `len` values stays inside the sheet.
    async fn check_region(&self, region: CellRange) -> Result<(), ControllerError> {
        self.bounds().await?.check_range(region)?;
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    async fn execute(
        &self,
        session_id: SessionId,
        command: Command,
        request_id: Option<String>,
    ) -> Result<Event, ControllerError> {
        command.check_limits()?;
        let store = &self.store;
        match command {
            Command::GetCell { address } => {
                let cell = self.cell(&address).await?;
                let value = store.get_cell(cell).await?;
                Ok(Event::CellValue {
                    request_id,
                    address: cell.to_string(),
                    value,
                })
            }
            Command::GetRow { address } => {
                let row = self.row(&address).await?;
                let values = store.get_row(row).await?;
                Ok(Event::QueryResult {
                    request_id,
                    value: Value::List(values),
                })
            }
            Command::GetColumn { address } => {
                let col = self.column(&address).await?;
                let values = store.get_column(col).await?;
                Ok(Event::QueryResult {
                    request_id,
                    value: Value::List(values),
                })
            }
            Command::GetRange { address } => {
                let range = self.range(&address).await?;
                let grid = store.get_range(range).await?;
                Ok(Event::QueryResult {
                    request_id,
                    value: Value::Grid(grid),
                })
            }
            Command::SetCell { address, value } => {
                let cell = self.cell(&address).await?;
                store.set_cell(cell, value).await?;
                Ok(Event::WriteAck {
                    request_id,
                    address: cell.to_string(),
                    cells: 1,
                })
            }
            Command::SetRow { address, values } => {
                let row = self.row(&address).await?;
                let len = len_u32(values.len())?;
                if len > 0 {
                    self.check_region(CellRange::row_prefix(row, len)).await?;
                    store.set_row(row, values).await?;
                }
                Ok(Event::WriteAck {
                    request_id,
                    address: SpreadsheetRef::Row(row).to_string(),
                    cells: u64::from(len),
                })
            }
            Command::SetColumn { address, values } => {
                let col = self.column(&address).await?;
                let len = len_u32(values.len())?;
                if len > 0 {
                    self.check_region(CellRange::column_prefix(col, len)).await?;
                    store.set_column(col, values).await?;
                }
                Ok(Event::WriteAck {
                    request_id,
                    address: SpreadsheetRef::Column(col).to_string(),
                    cells: u64::from(len),
                })
            }
            Command::SetRange { address, values } => {
                let range = self.range(&address).await?;
                let (height, width) = (range.height() as usize, range.width() as usize);
                if values.len() != height || values.iter().any(|row| row.len() != width) {
                    return Err(ControllerError::InvalidCommand(format!(
                        "{range} needs a {height}x{width} grid"
                    )));
                }
                store.set_range(range, values).await?;
                Ok(Event::WriteAck {
                    request_id,
                    address: range.to_string(),
                    cells: u64::from(range.height()) * u64::from(range.width()),
                })
            }
            Command::ExecuteFunction { query } => {
                let value = store.execute_function(&query).await?;
                Ok(Event::QueryResult {
                    request_id,
                    value: Value::Scalar(value),
                })
            }
            Command::ScheduleAgent { input } => {
                let invocation_id = self.schedule(session_id, input)?;
                Ok(Event::AgentScheduled {
                    request_id,
                    invocation_id,
                })
            }
            Command::CancelAgent { invocation_id } => {
                self.cancel(session_id, invocation_id)?;
                Ok(Event::CancelRequested {
                    request_id,
                    invocation_id,
                })
            }
        }
    }

    /// Admit an invocation while holding the session table, so it is in the
    /// session's active set before its completion can be routed.
    fn schedule(&self, session_id: SessionId, input: String) -> Result<InvocationId, ControllerError> {
        let mut sessions = self.lock();
        let ctx = sessions
            .get_mut(&session_id)
            .ok_or(ControllerError::UnknownSession(session_id))?;
        if !ctx.state().accepts_work() {
            return Err(ControllerError::SessionClosing(session_id));
        }

        let invocation_id = self
            .scheduler
            .schedule(session_id, input, &ctx.cancel)
            .map_err(|e| match e {
                SchedulerError::Overloaded { pending } => ControllerError::Overloaded { pending },
                SchedulerError::ShuttingDown | SchedulerError::NotFound(_) => {
                    ControllerError::SessionClosing(session_id)
                }
            })?;
        ctx.active.insert(invocation_id);
        tracing::info!("Session {session_id} scheduled invocation {invocation_id}");
        Ok(invocation_id)
    }

    fn cancel(&self, session_id: SessionId, invocation_id: InvocationId) -> Result<(), ControllerError> {
        let owned = self
            .lock()
            .get(&session_id)
            .is_some_and(|ctx| ctx.active.contains(&invocation_id));
        if !owned {
            return Err(ControllerError::UnknownInvocation(invocation_id));
        }

        let outcome = self
            .scheduler
            .cancel(session_id, invocation_id)
            .map_err(|_| ControllerError::UnknownInvocation(invocation_id))?;
        tracing::debug!("Cancel of {invocation_id}: {outcome:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sheet_agents_core::{CellValue, ErrorCode, MAX_FORMULA_LEN, MAX_TEXT_LEN};
    use sheet_agents_executor::{AutoApproveHandler, CellLimitHandler, PlanAgent};

    use super::*;
    use crate::{
        storage::MemoryStore,
        test_support::{GatedAgent, within},
    };

    fn controller_with(
        runtime: Arc<dyn AgentRuntime>,
        approvals: Arc<dyn ApprovalHandler>,
        config: ControllerConfig,
    ) -> Controller {
        let store = Arc::new(MemoryStore::new(SheetBounds::new(10, 5)));
        Controller::new(store, runtime, approvals, config)
    }

    fn controller(runtime: Arc<dyn AgentRuntime>, config: ControllerConfig) -> Controller {
        controller_with(runtime, Arc::new(AutoApproveHandler), config)
    }

    async fn next(events: &mut EventReceiver) -> Event {
        within(events.recv()).await.expect("event channel closed")
    }

    fn send(controller: &Controller, id: SessionId, request_id: &str, command: Command) {
        controller
            .dispatch(id, Envelope::with_request_id(command, request_id))
            .unwrap();
    }

    async fn scheduled(events: &mut EventReceiver) -> InvocationId {
        match next(events).await {
            Event::AgentScheduled { invocation_id, .. } => invocation_id,
            other => panic!("expected agent_scheduled, got {other:?}"),
        }
    }

    fn error_code(event: &Event) -> Option<ErrorCode> {
        match event {
            Event::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_set_then_get_cell() {
        let controller = controller(GatedAgent::open(), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "1", Command::SetCell {
            address: "A1".into(),
            value: CellValue::Number(5.0),
        });
        send(&controller, id, "2", Command::GetCell {
            address: "a1".into(),
        });

        assert_eq!(
            next(&mut events).await,
            Event::WriteAck {
                request_id: Some("1".into()),
                address: "A1".into(),
                cells: 1,
            }
        );
        assert_eq!(
            next(&mut events).await,
            Event::CellValue {
                request_id: Some("2".into()),
                address: "A1".into(),
                value: CellValue::Number(5.0),
            }
        );
    }

    #[tokio::test]
    async fn test_commands_answered_in_order() {
        let controller = controller(GatedAgent::open(), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        for i in 0..50 {
            let command = if i % 7 == 0 {
                Command::GetRow { address: "B2".into() }
            } else {
                Command::SetCell {
                    address: format!("A{}", i % 10 + 1),
                    value: CellValue::Number(f64::from(i)),
                }
            };
            send(&controller, id, &i.to_string(), command);
        }

        for i in 0..50 {
            let event = next(&mut events).await;
            assert_eq!(event.request_id(), Some(i.to_string().as_str()));
            assert_eq!(error_code(&event).is_some(), i % 7 == 0);
        }
    }

    #[tokio::test]
    async fn test_reads_return_rows_columns_and_ranges() {
        let controller = controller(GatedAgent::open(), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "w", Command::SetRange {
            address: "A1:B2".into(),
            values: vec![vec![1.0.into(), 2.0.into()], vec![3.0.into(), 4.0.into()]],
        });
        send(&controller, id, "row", Command::GetRow { address: "2".into() });
        send(&controller, id, "col", Command::GetColumn { address: "B".into() });
        send(&controller, id, "sum", Command::ExecuteFunction {
            query: "=SUM(A1:B2)".into(),
        });

        assert!(matches!(next(&mut events).await, Event::WriteAck { cells: 4, .. }));
        let Event::QueryResult { value: Value::List(row), .. } = next(&mut events).await else {
            panic!("expected a row");
        };
        assert_eq!(row.len(), 5);
        assert_eq!(row[1], CellValue::Number(4.0));
        let Event::QueryResult { value: Value::List(col), .. } = next(&mut events).await else {
            panic!("expected a column");
        };
        assert_eq!(col.len(), 10);
        assert_eq!(
            next(&mut events).await,
            Event::QueryResult {
                request_id: Some("sum".into()),
                value: Value::Scalar(CellValue::Number(10.0)),
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_and_out_of_bounds_addresses() {
        let controller = controller(GatedAgent::open(), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "1", Command::GetRow { address: "A1".into() });
        send(&controller, id, "2", Command::SetCell {
            address: "F1".into(),
            value: CellValue::Number(1.0),
        });
        send(&controller, id, "3", Command::SetRow {
            address: "1".into(),
            values: vec![CellValue::Empty; 6],
        });
        send(&controller, id, "4", Command::GetCell { address: "!!".into() });
        send(&controller, id, "5", Command::SetRange {
            address: "A1:B2".into(),
            values: vec![vec![1.0.into()]],
        });

        for _ in 0..4 {
            assert_eq!(
                error_code(&next(&mut events).await),
                Some(ErrorCode::InvalidAddress)
            );
        }
        assert_eq!(
            error_code(&next(&mut events).await),
            Some(ErrorCode::InvalidCommand)
        );
    }

    #[tokio::test]
    async fn test_oversized_text_and_formula_rejected() {
        let controller = controller(GatedAgent::open(), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "1", Command::SetCell {
            address: "A1".into(),
            value: CellValue::Text("x".repeat(MAX_TEXT_LEN + 1)),
        });
        send(&controller, id, "2", Command::ExecuteFunction {
            query: format!("=SUM({})", "A1,".repeat(MAX_FORMULA_LEN / 3)),
        });
        send(&controller, id, "3", Command::GetCell { address: "A1".into() });

        for request_id in ["1", "2"] {
            let event = next(&mut events).await;
            assert_eq!(event.request_id(), Some(request_id));
            assert_eq!(error_code(&event), Some(ErrorCode::InvalidCommand));
        }
        assert!(matches!(next(&mut events).await, Event::CellValue { value: CellValue::Empty, .. }));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let controller = controller(GatedAgent::open(), ControllerConfig::default());
        let ghost = Uuid::new_v4();

        let err = controller
            .dispatch(ghost, Command::GetCell { address: "A1".into() }.into())
            .unwrap_err();
        assert!(matches!(err, ControllerError::UnknownSession(id) if id == ghost));
        assert!(controller.teardown_context(ghost, "gone").is_err());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let config = ControllerConfig::default().with_max_sessions(1);
        let controller = controller(GatedAgent::open(), config);

        let first = controller.create_context().unwrap();
        let Err(err) = controller.create_context() else {
            panic!("second session admitted");
        };
        assert!(matches!(err, ControllerError::ResourceExhausted { limit: 1 }));

        controller.teardown_context(first.id, "bye").unwrap();
        assert!(controller.create_context().is_ok());
    }

    #[tokio::test]
    async fn test_agent_output_delivered() {
        let controller = controller(GatedAgent::open(), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "a", Command::ScheduleAgent { input: "hello".into() });
        send(&controller, id, "b", Command::ScheduleAgent { input: "fail".into() });
        let ok = scheduled(&mut events).await;
        let failing = scheduled(&mut events).await;

        let mut outputs = HashMap::new();
        for _ in 0..2 {
            let event = next(&mut events).await;
            outputs.insert(event.invocation_id().unwrap(), event);
        }
        assert_eq!(
            outputs[&ok],
            Event::AgentOutput {
                invocation_id: ok,
                output: "done: hello".into(),
            }
        );
        assert!(matches!(outputs[&failing], Event::AgentError { .. }));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(controller.stats().running + controller.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_full_scheduler_defers_admission() {
        let agent = GatedAgent::closed();
        let config = ControllerConfig::default()
            .with_scheduler(SchedulerConfig::default().with_concurrency(1));
        let controller = controller(agent.clone(), config);
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "1", Command::ScheduleAgent { input: "first".into() });
        send(&controller, id, "2", Command::ScheduleAgent { input: "second".into() });
        let first = scheduled(&mut events).await;
        let second = scheduled(&mut events).await;

        within(async {
            while controller.stats().running != 1 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert_eq!(controller.stats().pending, 1);

        agent.release(1);
        assert_eq!(next(&mut events).await.invocation_id(), Some(first));
        agent.release(1);
        assert_eq!(
            next(&mut events).await,
            Event::AgentOutput {
                invocation_id: second,
                output: "done: second".into(),
            }
        );
        assert_eq!(agent.max_concurrent(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_agents_start_in_dispatch_order() {
        let agent = GatedAgent::open();
        let config = ControllerConfig::default()
            .with_scheduler(SchedulerConfig::default().with_concurrency(1));
        let controller = controller(agent.clone(), config);
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        for i in 0..8 {
            send(&controller, id, &i.to_string(), Command::ScheduleAgent {
                input: i.to_string(),
            });
        }

        let mut outputs = Vec::new();
        while outputs.len() < 8 {
            if let Event::AgentOutput { output, .. } = next(&mut events).await {
                outputs.push(output);
            }
        }
        let expected: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        assert_eq!(agent.started(), expected);
        assert_eq!(
            outputs,
            expected.iter().map(|i| format!("done: {i}")).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_queue_ceiling_reports_overloaded() {
        let agent = GatedAgent::closed();
        let config = ControllerConfig::default().with_scheduler(
            SchedulerConfig::default()
                .with_concurrency(1)
                .with_max_queue_depth(1),
        );
        let controller = controller(agent, config);
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "1", Command::ScheduleAgent { input: "a".into() });
        scheduled(&mut events).await;
        within(async {
            while controller.stats().running != 1 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        send(&controller, id, "2", Command::ScheduleAgent { input: "b".into() });
        send(&controller, id, "3", Command::ScheduleAgent { input: "c".into() });

        scheduled(&mut events).await;
        assert_eq!(
            error_code(&next(&mut events).await),
            Some(ErrorCode::Overloaded)
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_and_foreign() {
        let agent = GatedAgent::closed();
        let config = ControllerConfig::default()
            .with_scheduler(SchedulerConfig::default().with_concurrency(1));
        let controller = controller(agent.clone(), config);
        let SessionHandle { id, mut events } = controller.create_context().unwrap();
        let other = controller.create_context().unwrap();

        send(&controller, id, "1", Command::ScheduleAgent { input: "busy".into() });
        send(&controller, id, "2", Command::ScheduleAgent { input: "queued".into() });
        let busy = scheduled(&mut events).await;
        let queued = scheduled(&mut events).await;

        send(&controller, other.id, "x", Command::CancelAgent { invocation_id: busy });
        send(&controller, id, "3", Command::CancelAgent { invocation_id: queued });

        assert_eq!(
            next(&mut events).await,
            Event::CancelRequested {
                request_id: Some("3".into()),
                invocation_id: queued,
            }
        );
        assert_eq!(
            next(&mut events).await,
            Event::AgentCancelled { invocation_id: queued }
        );

        let mut other_events = other.events;
        assert_eq!(
            error_code(&next(&mut other_events).await),
            Some(ErrorCode::UnknownInvocation)
        );

        agent.release(1);
        assert!(matches!(next(&mut events).await, Event::AgentOutput { invocation_id, .. } if invocation_id == busy));
        assert_eq!(agent.invocations(), 1);
    }

    #[tokio::test]
    async fn test_result_after_cancel_is_discarded() {
        let agent = GatedAgent::stubborn();
        let controller = controller(agent.clone(), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "1", Command::ScheduleAgent { input: "slow".into() });
        let invocation_id = scheduled(&mut events).await;
        within(async {
            while controller.stats().running != 1 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;

        send(&controller, id, "2", Command::CancelAgent { invocation_id });
        assert!(matches!(next(&mut events).await, Event::CancelRequested { .. }));
        agent.release(1);
        assert_eq!(
            next(&mut events).await,
            Event::AgentCancelled { invocation_id }
        );
    }

    #[tokio::test]
    async fn test_disconnect_while_running() {
        let agent = GatedAgent::stubborn();
        let controller = controller(agent.clone(), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "1", Command::ScheduleAgent { input: "slow".into() });
        let invocation_id = scheduled(&mut events).await;
        within(async {
            while controller.stats().running != 1 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;

        controller.teardown_context(id, "client went away").unwrap();
        controller.teardown_context(id, "again").unwrap();
        assert_eq!(controller.session_state(id), Some(SessionState::Draining));
        assert!(controller.dispatch(id, Command::ScheduleAgent { input: "late".into() }.into()).is_ok());

        assert_eq!(
            next(&mut events).await,
            Event::Disconnected {
                reason: "client went away".into(),
            }
        );
        assert!(within(events.recv()).await.is_none());

        agent.release(1);
        within(async {
            while controller.session_state(id).is_some() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(controller.inner.scheduler.get(invocation_id).is_none());
        assert!(controller.dispatch(id, Command::GetCell { address: "A1".into() }.into()).is_err());
        assert_eq!(controller.stats().dropped, 0);
        assert_eq!(agent.invocations(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_aware_agent_stops_on_disconnect() {
        let agent = GatedAgent::closed();
        let controller = controller(agent.clone(), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "1", Command::ScheduleAgent { input: "slow".into() });
        let invocation_id = scheduled(&mut events).await;
        controller.teardown_context(id, "bye").unwrap();

        within(async {
            while controller.session_state(id).is_some() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(controller.inner.scheduler.get(invocation_id).is_none());
    }

    #[tokio::test]
    async fn test_tool_calls_write_through_command_handler() {
        let controller = controller(Arc::new(PlanAgent), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        let plan = json!({
            "description": "Fill header",
            "tool_calls": [
                {"id": "t1", "name": "set_cell_text", "arguments": {"address": "A1", "text": "42"}},
                {"id": "t2", "name": "set_row_values", "arguments": {"address": "2", "values": ["x", 1]}},
                {"id": "t3", "name": "execute_function", "arguments": {"query": "=SUM(A1:B2)"}}
            ]
        });
        send(&controller, id, "p", Command::ScheduleAgent { input: plan.to_string() });
        let invocation_id = scheduled(&mut events).await;

        assert!(matches!(next(&mut events).await, Event::WriteAck { request_id: Some(r), .. } if r == "t1"));
        assert!(matches!(next(&mut events).await, Event::WriteAck { cells: 2, .. }));
        assert_eq!(
            next(&mut events).await,
            Event::QueryResult {
                request_id: Some("t3".into()),
                value: Value::Scalar(CellValue::Number(43.0)),
            }
        );
        assert_eq!(
            next(&mut events).await,
            Event::AgentOutput {
                invocation_id,
                output: "Fill header".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_failing_tool_call_stops_plan() {
        let controller = controller(Arc::new(PlanAgent), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        let plan = json!({
            "description": "Overflow",
            "tool_calls": [
                {"id": "t1", "name": "set_cell_text", "arguments": {"address": "Z99", "text": "x"}},
                {"id": "t2", "name": "set_cell_text", "arguments": {"address": "A1", "text": "y"}}
            ]
        });
        send(&controller, id, "p", Command::ScheduleAgent { input: plan.to_string() });
        scheduled(&mut events).await;

        let event = next(&mut events).await;
        assert_eq!(event.request_id(), Some("t1"));
        assert_eq!(error_code(&event), Some(ErrorCode::InvalidAddress));
        assert!(matches!(next(&mut events).await, Event::AgentError { .. }));

        send(&controller, id, "g", Command::GetCell { address: "A1".into() });
        assert!(matches!(next(&mut events).await, Event::CellValue { value: CellValue::Empty, .. }));
    }

    #[tokio::test]
    async fn test_oversized_tool_call_text_stops_plan() {
        let controller = controller(Arc::new(PlanAgent), ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        let plan = json!({
            "description": "Paste essay",
            "tool_calls": [
                {"id": "t1", "name": "set_cell_text", "arguments": {"address": "A1", "text": "x".repeat(MAX_TEXT_LEN + 1)}},
                {"id": "t2", "name": "set_cell_text", "arguments": {"address": "A2", "text": "y"}}
            ]
        });
        send(&controller, id, "p", Command::ScheduleAgent { input: plan.to_string() });
        scheduled(&mut events).await;

        let event = next(&mut events).await;
        assert_eq!(event.request_id(), Some("t1"));
        assert_eq!(error_code(&event), Some(ErrorCode::InvalidCommand));
        let Event::AgentError { message, .. } = next(&mut events).await else {
            panic!("expected agent_error");
        };
        assert!(message.contains("Text too long"));

        send(&controller, id, "g", Command::GetCell { address: "A2".into() });
        assert!(matches!(next(&mut events).await, Event::CellValue { value: CellValue::Empty, .. }));
    }

    #[tokio::test]
    async fn test_denied_plan_writes_nothing() {
        let controller = controller_with(
            Arc::new(PlanAgent),
            Arc::new(CellLimitHandler::new(1)),
            ControllerConfig::default(),
        );
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        let plan = json!({
            "description": "Too big",
            "tool_calls": [
                {"name": "set_range_values", "arguments": {"range": "A1:B1", "values": [[1, 2]]}}
            ]
        });
        send(&controller, id, "p", Command::ScheduleAgent { input: plan.to_string() });
        scheduled(&mut events).await;

        let Event::AgentError { message, .. } = next(&mut events).await else {
            panic!("expected agent_error");
        };
        assert!(message.contains("LARGE_OPERATION"));

        send(&controller, id, "g", Command::GetCell { address: "A1".into() });
        assert!(matches!(next(&mut events).await, Event::CellValue { value: CellValue::Empty, .. }));
    }

    /// Never answers, or fails outright.
    struct BrokenApprovals {
        hang: bool,
    }

    #[async_trait::async_trait]
    impl ApprovalHandler for BrokenApprovals {
        async fn review(
            &self,
            _invocation_id: InvocationId,
            _preview: &WritePreview,
        ) -> Result<ApprovalStatus, ApprovalError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(ApprovalError::RequestFailed("approver offline".into()))
        }
    }

    #[tokio::test]
    async fn test_approval_failure_or_timeout_denies_plan() {
        let plan = json!({
            "description": "Write one cell",
            "tool_calls": [
                {"name": "set_cell_text", "arguments": {"address": "A1", "text": "x"}}
            ]
        });

        for (hang, expected) in [(true, "timed out"), (false, "approver offline")] {
            let controller = controller_with(
                Arc::new(PlanAgent),
                Arc::new(BrokenApprovals { hang }),
                ControllerConfig::default().with_approval_timeout(Duration::from_millis(50)),
            );
            let SessionHandle { id, mut events } = controller.create_context().unwrap();

            send(&controller, id, "p", Command::ScheduleAgent { input: plan.to_string() });
            scheduled(&mut events).await;
            let Event::AgentError { message, .. } = next(&mut events).await else {
                panic!("expected agent_error");
            };
            assert!(message.contains(expected), "{message}");

            send(&controller, id, "g", Command::GetCell { address: "A1".into() });
            assert!(matches!(next(&mut events).await, Event::CellValue { value: CellValue::Empty, .. }));
        }
    }

    #[tokio::test]
    async fn test_completion_for_unknown_session_is_dropped() {
        let controller = controller(GatedAgent::open(), ControllerConfig::default());
        controller.execute_from_agent(Completion {
            session_id: Uuid::new_v4(),
            invocation_id: Uuid::new_v4(),
            outcome: Outcome::Cancelled,
            cancel_requested: false,
        });
        assert_eq!(controller.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let agent = GatedAgent::closed();
        let controller = controller(agent, ControllerConfig::default());
        let SessionHandle { id, mut events } = controller.create_context().unwrap();

        send(&controller, id, "1", Command::ScheduleAgent { input: "slow".into() });
        let invocation_id = scheduled(&mut events).await;
        controller.shutdown();

        assert!(matches!(next(&mut events).await, Event::Disconnected { .. }));
        within(async {
            while controller.stats().sessions != 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(controller.inner.scheduler.get(invocation_id).is_none());
        assert!(controller.create_context().is_err());
    }
}
