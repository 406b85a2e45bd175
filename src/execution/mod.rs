//! Execution engine for agent decisions
//!
//! Runs the tool calls a policy decided on, in order, against the agent's
//! own registry. No policy is consulted here.

use crate::error::WorkflowError;
use crate::models::ToolInput;
use crate::policy::ToolCall;
use crate::tools::ToolRegistry;
use crate::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};

/// Maximum tool calls allowed per decision
const MAX_CALLS_PER_DECISION: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_output: Value,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
}

/// Outcome of running one decision. Execution stops at the first failure,
/// which is kept with its original error.
#[derive(Debug)]
pub struct ExecutionReport {
    pub observations: Vec<Observation>,
    pub failure: Option<WorkflowError>,
}

/// Executes tool calls step-by-step deterministically
pub struct ExecutionEngine {
    tool_registry: ToolRegistry,
}

impl ExecutionEngine {
    pub fn new(tool_registry: ToolRegistry) -> Self {
        Self { tool_registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.tool_registry
    }

    /// Execute calls in order on behalf of `user_id` (fail-fast).
    ///
    /// The user id is written into every call's parameters, so a policy
    /// cannot act for another user.
    pub async fn execute_calls(&self, calls: &[ToolCall], user_id: &str) -> Result<ExecutionReport> {
        if calls.len() > MAX_CALLS_PER_DECISION {
            return Err(WorkflowError::PolicyViolation(format!(
                "Decision exceeds maximum allowed tool calls ({})",
                MAX_CALLS_PER_DECISION
            )));
        }

        let mut observations = Vec::with_capacity(calls.len());

        for (index, call) in calls.iter().enumerate() {
            debug!(
                step = index + 1,
                tool_name = %call.tool_name,
                "Processing tool call"
            );

            let mut parameters = call.parameters.clone();
            if let Some(object) = parameters.as_object_mut() {
                object.insert("userId".to_string(), json!(user_id));
            }

            let tool_input = ToolInput {
                tool_name: call.tool_name.clone(),
                parameters,
            };

            let Some(tool) = self.tool_registry.get(&call.tool_name) else {
                warn!(tool_name = %call.tool_name, "Tool not registered");

                observations.push(Observation {
                    tool_name: call.tool_name.clone(),
                    tool_input: tool_input.parameters,
                    tool_output: json!({"error": "Tool not registered"}),
                    status: ExecutionStatus::Skipped,
                    execution_time_ms: 0,
                });

                return Ok(ExecutionReport {
                    observations,
                    failure: Some(WorkflowError::ToolNotFound(call.tool_name.clone())),
                });
            };

            let start = Instant::now();
            let result = tool.execute(&tool_input).await;
            let execution_time_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    observations.push(Observation {
                        tool_name: call.tool_name.clone(),
                        tool_input: tool_input.parameters,
                        tool_output: output.data,
                        status: ExecutionStatus::Success,
                        execution_time_ms,
                    });
                }
                Err(e) => {
                    warn!(
                        step = index + 1,
                        tool_name = %call.tool_name,
                        error = %e,
                        "Tool execution failed - halting decision"
                    );

                    observations.push(Observation {
                        tool_name: call.tool_name.clone(),
                        tool_input: tool_input.parameters,
                        tool_output: json!({"error": e.to_string()}),
                        status: ExecutionStatus::Failed,
                        execution_time_ms,
                    });

                    return Ok(ExecutionReport {
                        observations,
                        failure: Some(e),
                    });
                }
            }
        }

        debug!(observation_count = observations.len(), "Decision execution completed");

        Ok(ExecutionReport {
            observations,
            failure: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{SendSuggestionTool, SEND_SUGGESTION};
    use std::sync::Arc;

    fn engine() -> ExecutionEngine {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SendSuggestionTool));
        ExecutionEngine::new(registry)
    }

    fn call(tool_name: &str, parameters: Value) -> ToolCall {
        ToolCall {
            tool_name: tool_name.to_string(),
            parameters,
        }
    }

    #[tokio::test]
    async fn test_user_id_is_injected() {
        let report = engine()
            .execute_calls(
                &[call(SEND_SUGGESTION, json!({"message": "hi", "userId": "someone-else"}))],
                "u1",
            )
            .await
            .unwrap();

        assert!(report.failure.is_none());
        assert_eq!(report.observations.len(), 1);
        assert_eq!(report.observations[0].status, ExecutionStatus::Success);
        assert_eq!(report.observations[0].tool_output["userId"], "u1");
    }

    #[tokio::test]
    async fn test_fail_fast_keeps_error() {
        let report = engine()
            .execute_calls(
                &[
                    call(SEND_SUGGESTION, json!({})),
                    call(SEND_SUGGESTION, json!({"message": "never sent"})),
                ],
                "u1",
            )
            .await
            .unwrap();

        assert_eq!(report.observations.len(), 1);
        assert_eq!(report.observations[0].status, ExecutionStatus::Failed);
        assert!(matches!(report.failure, Some(WorkflowError::InvalidToolInput(_))));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_call_limit() {
        let report = engine()
            .execute_calls(&[call("execute_budget", json!({}))], "u1")
            .await
            .unwrap();
        assert_eq!(report.observations[0].status, ExecutionStatus::Skipped);
        assert!(matches!(report.failure, Some(WorkflowError::ToolNotFound(_))));

        let calls: Vec<ToolCall> = (0..9)
            .map(|_| call(SEND_SUGGESTION, json!({"message": "spam"})))
            .collect();
        let err = engine().execute_calls(&calls, "u1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::PolicyViolation(_)));
    }
}
