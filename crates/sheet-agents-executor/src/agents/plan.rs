//! Plan agent: executes a pre-computed execution plan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sheet_agents_core::{
    AgentReply, ToolCall,
    traits::{AgentFailure, AgentRuntime},
};
use tokio_util::sync::CancellationToken;

/// A planned batch of spreadsheet tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// Agent whose input is a JSON [`ExecutionPlan`].
///
/// The reply output is the plan description; the plan's tool calls are
/// handed back for the controller to apply.
#[derive(Debug, Clone, Default)]
pub struct PlanAgent;

#[async_trait]
impl AgentRuntime for PlanAgent {
    async fn invoke(
        &self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<AgentReply, AgentFailure> {
        if cancel.is_cancelled() {
            return Err(AgentFailure::Cancelled);
        }

        let plan: ExecutionPlan = serde_json::from_str(input)
            .map_err(|e| AgentFailure::InvalidInput(format!("not an execution plan: {e}")))?;

        tracing::debug!(
            "Plan {:?} with {} tool calls",
            plan.id,
            plan.tool_calls.len()
        );

        Ok(AgentReply {
            output: plan.description,
            tool_calls: plan.tool_calls,
        })
    }
}
