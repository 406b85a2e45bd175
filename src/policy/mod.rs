//! Agent policies
//!
//! A policy is the agent's opaque decision function: given a task and the
//! tools it may use, it returns the tool calls to make and a reply text.
//! Rule-based and LLM-backed policies share this interface.

use crate::context::ContextSnapshot;
use crate::models::{Proposal, ProposalType};
use crate::tools::{execute_tool_name, submit_tool_name, ToolSpec, SEND_SUGGESTION};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub mod llm;
pub mod rules;

pub use llm::LlmPolicy;
pub use rules::{BudgetRulePolicy, BudgetSplit, DebtAvalanchePolicy, InvestingPriorityPolicy};

/// The structured event a task was rendered from.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TaskEvent {
    Paycheck {
        amount: Decimal,
    },
    Overspend,
    Onboard {
        income: Decimal,
    },
    /// Downstream dispatch after a budget is executed.
    BudgetApproved {
        budget_proposal_id: Uuid,
        allocation: Decimal,
    },
    ProposalApproved {
        proposal_id: Uuid,
    },
    ProposalRejected {
        proposal_id: Uuid,
        reason: String,
        previous: Box<Proposal>,
        /// Zero on the first re-invocation after the rejection.
        attempt: u32,
        /// Why the previous revision attempt was refused, if it was.
        refusal: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct AgentTask {
    pub kind: ProposalType,
    pub user_id: String,
    pub event: TaskEvent,
    pub context: ContextSnapshot,
    /// Natural-language framing of the event plus the serialized snapshot.
    pub text: String,
}

impl AgentTask {
    pub fn new(kind: ProposalType, event: TaskEvent, context: ContextSnapshot) -> Self {
        let user_id = context.user_id.clone();
        let text = render_task_text(kind, &user_id, &event, &context);
        Self {
            kind,
            user_id,
            event,
            context,
            text,
        }
    }
}

fn render_task_text(
    kind: ProposalType,
    user_id: &str,
    event: &TaskEvent,
    context: &ContextSnapshot,
) -> String {
    let submit = submit_tool_name(kind);
    let snapshot = context.render();

    match event {
        TaskEvent::Paycheck { amount } => format!(
            "Paycheck of ${} received for user {}. {}Analyse their spending and propose a budget allocation. Submit your proposal via {}.",
            amount, user_id, snapshot, submit
        ),
        TaskEvent::Overspend => format!(
            "Critical overspend detected for user {}. {}Re-evaluate the budget with spending cuts. Submit your revised proposal via {}.",
            user_id, snapshot, submit
        ),
        TaskEvent::Onboard { income } => format!(
            "Create an initial budget for user {}. Income: ${}/month. {}Propose a budget allocation. Submit your proposal via {}.",
            user_id, income, snapshot, submit
        ),
        TaskEvent::BudgetApproved { allocation, .. } => format!(
            "Budget approved for user {}. {} allocation: ${} per pay period. {}Calculate the best allocation and submit your proposal via {}.",
            user_id,
            capitalized(kind.as_str()),
            allocation,
            snapshot,
            submit
        ),
        TaskEvent::ProposalApproved { proposal_id } => format!(
            "Proposal {} for user {} has been APPROVED. Execute it now using {}.",
            proposal_id,
            user_id,
            execute_tool_name(kind)
        ),
        TaskEvent::ProposalRejected {
            proposal_id,
            reason,
            previous,
            refusal,
            ..
        } => {
            let mut text = format!(
                "Your {} proposal {} for user {} has been REJECTED. Reason: \"{}\". Rejected payload: {}. {}Address the user's concern and submit a revised proposal via {}.",
                kind,
                proposal_id,
                user_id,
                reason,
                serde_json::to_string(&previous.payload).unwrap_or_default(),
                snapshot,
                submit
            );
            if let Some(refusal) = refusal {
                text.push_str(&format!(
                    " Your last revision was refused: {}. The new proposal must differ from the rejected one.",
                    refusal
                ));
            }
            text
        }
    }
}

fn capitalized(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(alias = "tool", alias = "tool_name")]
    pub tool_name: String,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    json!({})
}

/// Tool calls to make, in order, and the agent's reply text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub calls: Vec<ToolCall>,
    #[serde(default)]
    pub reply: String,
}

impl Decision {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            calls: Vec::new(),
            reply: text.into(),
        }
    }

    pub fn submit<P: Serialize>(
        kind: ProposalType,
        summary: impl Into<String>,
        rationale: impl Into<String>,
        payload: &P,
    ) -> Result<Self> {
        let summary = summary.into();
        Ok(Self {
            calls: vec![ToolCall {
                tool_name: submit_tool_name(kind).to_string(),
                parameters: json!({
                    "summary": summary,
                    "rationale": rationale.into(),
                    "payload": serde_json::to_value(payload)?,
                }),
            }],
            reply: summary,
        })
    }

    pub fn execute(kind: ProposalType, proposal_id: Uuid) -> Self {
        Self {
            calls: vec![ToolCall {
                tool_name: execute_tool_name(kind).to_string(),
                parameters: json!({ "proposalId": proposal_id }),
            }],
            reply: format!("Executing approved {} proposal {}", kind, proposal_id),
        }
    }

    pub fn with_suggestion(mut self, message: impl Into<String>) -> Self {
        self.calls.push(ToolCall {
            tool_name: SEND_SUGGESTION.to_string(),
            parameters: json!({ "message": message.into() }),
        });
        self
    }
}

/// Trait for agent decision making
#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn decide(&self, task: &AgentTask, tools: &[ToolSpec]) -> Result<Decision>;
}
