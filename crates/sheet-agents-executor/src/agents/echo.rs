//! Echo agent: replies with its input after a delay.

use std::time::Duration;

use async_trait::async_trait;
use sheet_agents_core::{
    AgentReply,
    traits::{AgentFailure, AgentRuntime},
};
use tokio_util::sync::CancellationToken;

/// Agent that echoes its input back.
///
/// Useful as a default backend and for exercising the scheduler: the delay
/// simulates a slow model, and cancellation is honoured while waiting.
#[derive(Debug, Clone)]
pub struct EchoAgent {
    delay: Duration,
}

impl EchoAgent {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoAgent {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

#[async_trait]
impl AgentRuntime for EchoAgent {
    async fn invoke(
        &self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<AgentReply, AgentFailure> {
        tracing::debug!("Processing message: {input}");
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AgentFailure::Cancelled),
            () = tokio::time::sleep(self.delay) => {
                Ok(AgentReply::text(format!("You sent '{input}'")))
            }
        }
    }
}
