//! Bounded-concurrency scheduler for agent invocations.
//!
//! # Invariants
//!
//! - At most `concurrency` invocations are `Running` at any instant: an
//!   invocation only enters `Running` while holding a semaphore permit, and
//!   reaches its terminal state before the permit is released.
//! - Every invocation reaches exactly one terminal state. Terminal writes go
//!   through [`Scheduler::finish`] under the table lock and are refused once
//!   the state is terminal, so exactly one [`Completion`] is emitted.
//! - Pending invocations start in the order they were scheduled. A single
//!   admission task owns the wait for free slots and hands each permit to the
//!   oldest invocation that is still pending.
//! - An invocation is only visible to, and cancellable by, its owning session.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use sheet_agents_core::{
    AgentReply,
    traits::{AgentFailure, AgentRuntime, Invocation, InvocationId, InvocationState, SessionId},
};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default number of concurrently running invocations.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default ceiling on pending invocations.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 256;

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum invocations in `Running` at once (at least 1).
    pub concurrency: usize,
    /// Maximum invocations waiting in `Pending`; beyond it `schedule` fails.
    pub max_queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }
}

/// Scheduler error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler overloaded: {pending} invocations pending")]
    Overloaded { pending: usize },
    #[error("Scheduler is shutting down")]
    ShuttingDown,
    #[error("Invocation not found: {0}")]
    NotFound(InvocationId),
}

/// How an invocation ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(AgentReply),
    Failed(String),
    Cancelled,
}

/// Terminal notification sent to the controller, once per invocation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub session_id: SessionId,
    pub invocation_id: InvocationId,
    pub outcome: Outcome,
    /// Cancellation was requested before the agent finished; a reply or
    /// failure in `outcome` must not be delivered.
    pub cancel_requested: bool,
}

impl Completion {
    #[must_use]
    pub const fn state(&self) -> InvocationState {
        match self.outcome {
            Outcome::Completed(_) => InvocationState::Completed,
            Outcome::Failed(_) => InvocationState::Failed,
            Outcome::Cancelled => InvocationState::Cancelled,
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was pending; now cancelled without running.
    Cancelled,
    /// Is running; the agent has been signalled.
    Requested,
    /// Already terminal; nothing to do.
    AlreadyFinished,
}

struct Entry {
    invocation: Invocation,
    cancel: CancellationToken,
    /// Hand-off for the slot permit; taken by the admission task.
    start: Option<oneshot::Sender<OwnedSemaphorePermit>>,
}

struct Inner {
    runtime: Arc<dyn AgentRuntime>,
    config: SchedulerConfig,
    slots: Arc<Semaphore>,
    table: Mutex<HashMap<InvocationId, Entry>>,
    completions: mpsc::UnboundedSender<Completion>,
    /// Ids in scheduling order, consumed by [`admit`].
    admissions: mpsc::UnboundedSender<InvocationId>,
    closed: AtomicBool,
}

/// Bounded-concurrency scheduler.
///
/// Cheap to clone; clones share the same invocation table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler delivering completions on `completions`.
    ///
    /// Must be called inside a Tokio runtime; it spawns the admission task.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        config: SchedulerConfig,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let config = SchedulerConfig {
            concurrency: config.concurrency.max(1),
            ..config
        };
        let slots = Arc::new(Semaphore::new(config.concurrency));
        let (admissions, queue) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            runtime,
            slots: Arc::clone(&slots),
            config,
            table: Mutex::new(HashMap::new()),
            completions,
            admissions,
            closed: AtomicBool::new(false),
        });
        tokio::spawn(admit(Arc::downgrade(&inner), slots, queue));
        Self { inner }
    }

    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.inner.config
    }

    /// Admit an invocation for `session_id`.
    ///
    /// The invocation's cancellation token is a child of `scope`, so
    /// cancelling the scope cancels it. If every slot is busy it stays
    /// `Pending` until one frees.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Overloaded`] when the pending queue is at its
    /// ceiling and [`SchedulerError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    pub fn schedule(
        &self,
        session_id: SessionId,
        input: impl Into<String>,
        scope: &CancellationToken,
    ) -> Result<InvocationId, SchedulerError> {
        let id = Uuid::new_v4();
        let input = input.into();
        let cancel = scope.child_token();
        let (start, started) = oneshot::channel();

        {
            let mut table = self.inner.lock();
            // Checked under the lock so shutdown either sees this entry or we see it.
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(SchedulerError::ShuttingDown);
            }
            let pending = table
                .values()
                .filter(|e| e.invocation.state == InvocationState::Pending)
                .count();
            if pending >= self.inner.config.max_queue_depth {
                tracing::warn!("Rejecting invocation for session {session_id}: {pending} pending");
                return Err(SchedulerError::Overloaded { pending });
            }
            table.insert(
                id,
                Entry {
                    invocation: Invocation {
                        id,
                        session_id,
                        input: input.clone(),
                        state: InvocationState::Pending,
                        result: None,
                    },
                    cancel: cancel.clone(),
                    start: Some(start),
                },
            );
            // Queued under the table lock so queue order is scheduling order.
            if self.inner.admissions.send(id).is_err() {
                tracing::debug!("Admission task gone, invocation {id} waits for cancellation");
            }
        }

        tracing::debug!("Invocation {id} pending for session {session_id}");
        tokio::spawn(Arc::clone(&self.inner).run(id, input, cancel, started));
        Ok(id)
    }

    /// Cancel an invocation owned by `session_id`.
    ///
    /// # Errors
    /// Returns [`SchedulerError::NotFound`] if the id is unknown or belongs to
    /// another session.
    pub fn cancel(
        &self,
        session_id: SessionId,
        id: InvocationId,
    ) -> Result<CancelOutcome, SchedulerError> {
        let mut table = self.inner.lock();
        let entry = table
            .get_mut(&id)
            .filter(|e| e.invocation.session_id == session_id)
            .ok_or(SchedulerError::NotFound(id))?;

        match entry.invocation.state {
            InvocationState::Pending => {
                entry.cancel.cancel();
                self.inner.finish_locked(&mut table, id, Outcome::Cancelled);
                Ok(CancelOutcome::Cancelled)
            }
            InvocationState::Running => {
                entry.cancel.cancel();
                tracing::debug!("Cancellation requested for running invocation {id}");
                Ok(CancelOutcome::Requested)
            }
            _ => Ok(CancelOutcome::AlreadyFinished),
        }
    }

    /// Drop a terminal invocation from the table once it has been delivered.
    pub fn release(&self, id: InvocationId) {
        let mut table = self.inner.lock();
        if table
            .get(&id)
            .is_some_and(|e| e.invocation.state.is_terminal())
        {
            table.remove(&id);
        }
    }

    /// Snapshot of an invocation.
    #[must_use]
    pub fn get(&self, id: InvocationId) -> Option<Invocation> {
        self.inner.lock().get(&id).map(|e| e.invocation.clone())
    }

    /// Invocations currently `Running`.
    #[must_use]
    pub fn running(&self) -> usize {
        self.count(InvocationState::Running)
    }

    /// Invocations currently `Pending`.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.count(InvocationState::Pending)
    }

    fn count(&self, state: InvocationState) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|e| e.invocation.state == state)
            .count()
    }

    /// Refuse new work and cancel every live invocation.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.slots.close();
        let table = self.inner.lock();
        let live = table
            .values()
            .filter(|e| !e.invocation.state.is_terminal())
            .inspect(|e| e.cancel.cancel())
            .count();
        tracing::info!("Scheduler shutting down, cancelled {live} live invocations");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<InvocationId, Entry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(
        self: Arc<Self>,
        id: InvocationId,
        input: String,
        cancel: CancellationToken,
        started: oneshot::Receiver<OwnedSemaphorePermit>,
    ) {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = started => permit.ok(),
        };
        let Some(permit) = permit else {
            self.finish(id, Outcome::Cancelled);
            return;
        };

        if !self.mark_running(id, &cancel) {
            return;
        }

        let result = self.runtime.invoke(&input, cancel.clone()).await;
        let outcome = match result {
            Ok(reply) => Outcome::Completed(reply),
            Err(AgentFailure::Cancelled) => Outcome::Cancelled,
            Err(e) => Outcome::Failed(e.to_string()),
        };
        self.finish(id, outcome);
        drop(permit);
    }

    /// Pending -> Running. Returns false if the invocation must not run.
    fn mark_running(&self, id: InvocationId, cancel: &CancellationToken) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.get_mut(&id) else {
            return false;
        };
        if entry.invocation.state != InvocationState::Pending {
            return false;
        }
        if cancel.is_cancelled() {
            self.finish_locked(&mut table, id, Outcome::Cancelled);
            return false;
        }
        entry.invocation.state = InvocationState::Running;
        tracing::debug!("Invocation {id} running");
        true
    }

    fn finish(&self, id: InvocationId, outcome: Outcome) -> bool {
        let mut table = self.lock();
        self.finish_locked(&mut table, id, outcome)
    }

    /// Write the terminal state and emit the completion, at most once.
    fn finish_locked(
        &self,
        table: &mut HashMap<InvocationId, Entry>,
        id: InvocationId,
        outcome: Outcome,
    ) -> bool {
        let Some(entry) = table.get_mut(&id) else {
            return false;
        };
        if entry.invocation.state.is_terminal() {
            return false;
        }
        entry.start = None;

        let completion = Completion {
            session_id: entry.invocation.session_id,
            invocation_id: id,
            cancel_requested: entry.cancel.is_cancelled(),
            outcome,
        };
        entry.invocation.state = completion.state();
        entry.invocation.result = match &completion.outcome {
            Outcome::Completed(reply) => Some(reply.output.clone()),
            Outcome::Failed(reason) => Some(reason.clone()),
            Outcome::Cancelled => None,
        };

        tracing::debug!("Invocation {id} finished: {:?}", entry.invocation.state);
        if self.completions.send(completion).is_err() {
            tracing::debug!("Completion for {id} dropped, controller is gone");
        }
        true
    }
}

/// Hand free slots to pending invocations in scheduling order.
///
/// Exits when the semaphore is closed or the scheduler is dropped. A permit
/// whose invocation is already finished or gone goes to the next id.
async fn admit(
    scheduler: Weak<Inner>,
    slots: Arc<Semaphore>,
    mut queue: mpsc::UnboundedReceiver<InvocationId>,
) {
    while let Ok(permit) = Arc::clone(&slots).acquire_owned().await {
        let mut permit = Some(permit);
        while let Some(free) = permit.take() {
            let Some(id) = queue.recv().await else {
                return;
            };
            let Some(inner) = scheduler.upgrade() else {
                return;
            };
            let start = inner.lock().get_mut(&id).and_then(|e| e.start.take());
            permit = match start {
                Some(start) => start.send(free).err(),
                None => Some(free),
            };
        }
    }
    tracing::debug!("Admission task stopped");
}
