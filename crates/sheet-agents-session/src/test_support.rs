//! Deterministic fakes for scheduler and controller tests.

use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use sheet_agents_core::{
    AgentReply,
    traits::{AgentFailure, AgentRuntime},
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Await `fut`, failing the test if it takes longer than a few seconds.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// Agent that blocks until the test releases it, counting concurrency.
///
/// Replies `done: <input>`. Input `fail` makes it fail instead.
pub struct GatedAgent {
    gate: Option<Semaphore>,
    honors_cancel: bool,
    current: AtomicUsize,
    max: AtomicUsize,
    calls: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl GatedAgent {
    fn build(gate: Option<Semaphore>, honors_cancel: bool) -> Arc<Self> {
        Arc::new(Self {
            gate,
            honors_cancel,
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        })
    }

    /// Replies immediately.
    pub fn open() -> Arc<Self> {
        Self::build(None, true)
    }

    /// Waits for [`release`](Self::release); stops early when cancelled.
    pub fn closed() -> Arc<Self> {
        Self::build(Some(Semaphore::new(0)), true)
    }

    /// Waits for [`release`](Self::release) and ignores cancellation.
    pub fn stubborn() -> Arc<Self> {
        Self::build(Some(Semaphore::new(0)), false)
    }

    /// Let `n` waiting (or future) invocations finish.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Inputs in the order their invocations started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    async fn wait(&self, cancel: &CancellationToken) -> Result<(), AgentFailure> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };
        let permit = if self.honors_cancel {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AgentFailure::Cancelled),
                permit = gate.acquire() => permit,
            }
        } else {
            gate.acquire().await
        };
        permit
            .map_err(|e| AgentFailure::Failed(e.to_string()))?
            .forget();
        Ok(())
    }
}

#[async_trait]
impl AgentRuntime for GatedAgent {
    async fn invoke(
        &self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<AgentReply, AgentFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(input.to_string());
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);

        let result = self.wait(&cancel).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result?;

        if input == "fail" {
            return Err(AgentFailure::Failed("agent exploded".to_string()));
        }
        Ok(AgentReply::text(format!("done: {input}")))
    }
}
