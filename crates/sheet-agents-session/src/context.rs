//! Per-session state held by the controller.

use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};
use sheet_agents_core::{
    Envelope, Outbound,
    traits::{InvocationId, SessionId},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Completion;

/// Session lifecycle.
///
/// `Created -> Active -> Draining -> Closed`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    /// Accepting commands and scheduling agents.
    Active,
    /// Torn down; waiting for in-flight invocations to reach a terminal state.
    Draining,
    Closed,
}

impl SessionState {
    /// Whether new agent invocations may be admitted.
    #[must_use]
    pub const fn accepts_work(self) -> bool {
        matches!(self, Self::Active)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Active => 1,
            Self::Draining => 2,
            Self::Closed => 3,
        }
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

/// Work item for a session's worker, processed strictly in arrival order.
#[derive(Debug)]
pub enum SessionInput {
    Command(Envelope),
    AgentFinished(Completion),
}

/// Everything the controller tracks for one session.
pub struct SessionContext {
    pub id: SessionId,
    state: SessionState,
    pub outbound: Arc<Outbound>,
    pub inbound: mpsc::UnboundedSender<SessionInput>,
    /// Invocations owned by this session that have not been delivered yet.
    pub active: HashSet<InvocationId>,
    /// Parent of every invocation token of this session.
    pub cancel: CancellationToken,
}

impl SessionContext {
    #[must_use]
    pub fn new(
        id: SessionId,
        outbound: Arc<Outbound>,
        inbound: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            id,
            state: SessionState::Created,
            outbound,
            inbound,
            active: HashSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Move forward in the lifecycle. Returns false if `next` is not ahead.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        tracing::debug!("Session {} {:?} -> {next:?}", self.id, self.state);
        self.state = next;
        true
    }

    /// Draining with nothing left in flight.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.state == SessionState::Draining && self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_lifecycle_only_moves_forward() {
        let (outbound, _rx) = Outbound::channel();
        let (tx, _inbound) = mpsc::unbounded_channel();
        let mut ctx = SessionContext::new(Uuid::new_v4(), outbound, tx);

        assert_eq!(ctx.state(), SessionState::Created);
        assert!(ctx.transition(SessionState::Active));
        assert!(ctx.state().accepts_work());
        assert!(ctx.transition(SessionState::Draining));
        assert!(!ctx.transition(SessionState::Active));
        assert!(!ctx.transition(SessionState::Draining));
        assert!(ctx.is_drained());

        ctx.active.insert(Uuid::new_v4());
        assert!(!ctx.is_drained());
        assert!(ctx.transition(SessionState::Closed));
        assert!(!ctx.state().accepts_work());
    }
}
