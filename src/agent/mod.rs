//! Agent: a policy bound to a fixed tool set
//!
//! One invocation runs DECIDE → CHECK → EXECUTE:
//! the policy picks tool calls (bounded by a timeout), the calls are checked
//! against the task, then run in order through the agent's own registry.

use crate::error::WorkflowError;
use crate::execution::{ExecutionEngine, ExecutionStatus, Observation};
use crate::models::ProposalType;
use crate::policy::{AgentTask, Decision, Policy, TaskEvent};
use crate::tools::{execute_tool_name, submit_tool_name, SEND_SUGGESTION};
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one invocation produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub agent: ProposalType,
    pub reply: String,
    /// Pending proposal created by this invocation, if any.
    pub submitted: Option<Uuid>,
    /// Proposal executed by this invocation, if any.
    pub executed: Option<Uuid>,
    pub suggestions: Vec<String>,
    pub observations: Vec<Observation>,
}

pub struct Agent {
    kind: ProposalType,
    policy: Arc<dyn Policy>,
    engine: ExecutionEngine,
    timeout: Duration,
}

impl Agent {
    pub fn new(
        kind: ProposalType,
        policy: Arc<dyn Policy>,
        engine: ExecutionEngine,
        timeout: Duration,
    ) -> Self {
        Self {
            kind,
            policy,
            engine,
            timeout,
        }
    }

    pub fn kind(&self) -> ProposalType {
        self.kind
    }

    pub async fn invoke(&self, task: AgentTask) -> Result<AgentReply> {
        let start = Instant::now();

        info!(
            agent = %self.kind,
            policy = self.policy.name(),
            user_id = %task.user_id,
            "Agent invoked"
        );

        // === DECIDE ===
        let specs = self.engine.registry().specs();
        let decision = match tokio::time::timeout(self.timeout, self.policy.decide(&task, &specs)).await
        {
            Ok(decision) => decision?,
            Err(_) => {
                let ms = self.timeout.as_millis() as u64;
                warn!(agent = %self.kind, user_id = %task.user_id, timeout_ms = ms, "Agent decision timed out");
                return Err(WorkflowError::AgentTimeout(ms));
            }
        };

        // === CHECK ===
        self.check(&task, &decision)?;

        // === EXECUTE ===
        let report = self.engine.execute_calls(&decision.calls, &task.user_id).await?;
        if let Some(failure) = report.failure {
            warn!(
                agent = %self.kind,
                user_id = %task.user_id,
                error = %failure,
                "Agent tool call failed"
            );
            return Err(failure);
        }

        let reply = self.summarize(decision.reply, report.observations);

        debug!(
            agent = %self.kind,
            submitted = ?reply.submitted,
            executed = ?reply.executed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Agent invocation complete"
        );

        Ok(reply)
    }

    /// Refuse a decision before any tool runs: at most one submit, and an
    /// execute only for the proposal whose approval this task relays.
    fn check(&self, task: &AgentTask, decision: &Decision) -> Result<()> {
        let submit = submit_tool_name(self.kind);
        let execute = execute_tool_name(self.kind);

        let submits = decision
            .calls
            .iter()
            .filter(|call| call.tool_name == submit)
            .count();
        if submits > 1 {
            return Err(WorkflowError::PolicyViolation(format!(
                "{} agent submitted {} proposals in one decision",
                self.kind, submits
            )));
        }

        for call in decision.calls.iter().filter(|call| call.tool_name == execute) {
            let approved = match &task.event {
                TaskEvent::ProposalApproved { proposal_id } => Some(*proposal_id),
                _ => None,
            };
            let requested = call
                .parameters
                .get("proposalId")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Uuid>().ok());

            if approved.is_none() || requested != approved {
                return Err(WorkflowError::PolicyViolation(format!(
                    "{} agent tried to execute a proposal without a relayed approval",
                    self.kind
                )));
            }
        }

        Ok(())
    }

    fn summarize(&self, reply: String, observations: Vec<Observation>) -> AgentReply {
        let submit = submit_tool_name(self.kind);
        let execute = execute_tool_name(self.kind);

        let mut submitted = None;
        let mut executed = None;
        let mut suggestions = Vec::new();

        for obs in observations
            .iter()
            .filter(|obs| obs.status == ExecutionStatus::Success)
        {
            let proposal_id = || {
                obs.tool_output
                    .get("proposalId")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<Uuid>().ok())
            };

            if obs.tool_name == submit {
                submitted = proposal_id();
            } else if obs.tool_name == execute {
                executed = proposal_id();
            } else if obs.tool_name == SEND_SUGGESTION {
                if let Some(message) = obs.tool_output.get("message").and_then(|v| v.as_str()) {
                    suggestions.push(message.to_string());
                }
            }
        }

        AgentReply {
            agent: self.kind,
            reply,
            submitted,
            executed,
            suggestions,
            observations,
        }
    }
}
