//! Tool trait and registry
//!
//! Each agent is bound to exactly three tools: submit a proposal of its type,
//! execute an approved proposal of its type, and send the user a suggestion.
//! Executors read amounts from the stored proposal, never from call arguments.

use crate::error::WorkflowError;
use crate::lifecycle::{NewProposal, ProposalLifecycle};
use crate::models::{
    round_cents, Proposal, ProposalPayload, ProposalType, ToolInput, ToolOutput, ACCOUNT_401K,
    ACCOUNT_IRA,
};
use crate::state::BalanceMutation;
use crate::Result;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const SUBMIT_BUDGET_PROPOSAL: &str = "submit_budget_proposal";
pub const EXECUTE_BUDGET: &str = "execute_budget";
pub const SUBMIT_DEBT_ALLOCATION: &str = "submit_debt_allocation";
pub const EXECUTE_DEBT_PAYMENTS: &str = "execute_debt_payments";
pub const SUBMIT_INVESTMENT_ALLOCATION: &str = "submit_investment_allocation";
pub const EXECUTE_INVESTMENT_CONTRIBUTIONS: &str = "execute_investment_contributions";
pub const SEND_SUGGESTION: &str = "send_suggestion";

pub fn submit_tool_name(kind: ProposalType) -> &'static str {
    match kind {
        ProposalType::Budget => SUBMIT_BUDGET_PROPOSAL,
        ProposalType::Debt => SUBMIT_DEBT_ALLOCATION,
        ProposalType::Investing => SUBMIT_INVESTMENT_ALLOCATION,
    }
}

pub fn execute_tool_name(kind: ProposalType) -> &'static str {
    match kind {
        ProposalType::Budget => EXECUTE_BUDGET,
        ProposalType::Debt => EXECUTE_DEBT_PAYMENTS,
        ProposalType::Investing => EXECUTE_INVESTMENT_CONTRIBUTIONS,
    }
}

pub fn is_submit_tool(name: &str) -> bool {
    matches!(
        name,
        SUBMIT_BUDGET_PROPOSAL | SUBMIT_DEBT_ALLOCATION | SUBMIT_INVESTMENT_ALLOCATION
    )
}

pub fn is_execute_tool(name: &str) -> bool {
    matches!(
        name,
        EXECUTE_BUDGET | EXECUTE_DEBT_PAYMENTS | EXECUTE_INVESTMENT_CONTRIBUTIONS
    )
}

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// Shape of the `parameters` object, shown to LLM policies.
    fn parameters(&self) -> &'static str;
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

/// What a policy is told about a tool it may call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: &'static str,
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name(),
                description: tool.description(),
                parameters: tool.parameters(),
            })
            .collect();
        specs.sort_by_key(|spec| spec.name);
        specs
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Parameter parsing =================
//

fn ensure_object_parameters(input: &ToolInput) -> Result<()> {
    if input.parameters.is_object() {
        Ok(())
    } else {
        Err(WorkflowError::InvalidToolInput(format!(
            "{}: parameters must be a JSON object",
            input.tool_name
        )))
    }
}

fn parse_parameters<T: DeserializeOwned>(input: &ToolInput) -> Result<T> {
    ensure_object_parameters(input)?;
    serde_json::from_value(input.parameters.clone())
        .map_err(|e| WorkflowError::InvalidToolInput(format!("{}: {}", input.tool_name, e)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitParameters {
    user_id: String,
    summary: String,
    #[serde(default)]
    rationale: String,
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteParameters {
    user_id: String,
    proposal_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuggestionParameters {
    user_id: String,
    message: String,
}

fn payload_for(kind: ProposalType, raw: Value) -> serde_json::Result<ProposalPayload> {
    Ok(match kind {
        ProposalType::Budget => ProposalPayload::Budget(serde_json::from_value(raw)?),
        ProposalType::Debt => ProposalPayload::Debt(serde_json::from_value(raw)?),
        ProposalType::Investing => ProposalPayload::Investing(serde_json::from_value(raw)?),
    })
}

//
// ================= Submit =================
//

/// `submit_*`: store exactly one new pending proposal.
pub struct SubmitProposalTool {
    kind: ProposalType,
    lifecycle: Arc<ProposalLifecycle>,
}

impl SubmitProposalTool {
    pub fn new(kind: ProposalType, lifecycle: Arc<ProposalLifecycle>) -> Self {
        Self { kind, lifecycle }
    }
}

#[async_trait::async_trait]
impl Tool for SubmitProposalTool {
    fn name(&self) -> &'static str {
        submit_tool_name(self.kind)
    }

    fn description(&self) -> &'static str {
        match self.kind {
            ProposalType::Budget => {
                "Submit a budget proposal for user approval. Stored with status pending."
            }
            ProposalType::Debt => {
                "Submit a per-paycheck debt allocation proposal for user approval. Stored with status pending."
            }
            ProposalType::Investing => {
                "Submit an investment allocation proposal for user approval. Stored with status pending."
            }
        }
    }

    fn parameters(&self) -> &'static str {
        match self.kind {
            ProposalType::Budget => {
                r#"{"summary": str, "rationale": str, "payload": {"income": num, "needs": {category: num}, "wants": {category: num}, "debtAllocation": num, "investingAllocation": num, "emergencyFundMonthly": num, "savingsGoalsMonthly": num, "smartGoals": [str], "violations": [str]}}"#
            }
            ProposalType::Debt => {
                r#"{"summary": str, "rationale": str, "payload": {"orderedDebts": [{"debtId": str, "name": str, "balance": num, "interestRate": num, "minimumPayment": num, "paymentAmount": num}], "totalAllocation": num}}"#
            }
            ProposalType::Investing => {
                r#"{"summary": str, "rationale": str, "payload": {"k401Monthly": num, "iraMonthly": num, "iraType": "roth_ira"|"traditional_ira"|"backdoor_roth"|"partial_roth_ira", "fundAllocation": {fund: num}, "totalAllocation": num}}"#
            }
        }
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let params: SubmitParameters = parse_parameters(input)?;
        let payload = payload_for(self.kind, params.payload)
            .map_err(|e| WorkflowError::InvalidToolInput(format!("{}: {}", self.name(), e)))?;

        let proposal = self
            .lifecycle
            .create(NewProposal {
                kind: self.kind,
                user_id: params.user_id,
                payload,
                rationale: params.rationale,
                summary: params.summary,
            })
            .await?;

        let mut data = json!({
            "proposalId": proposal.proposal_id,
            "userId": proposal.user_id,
            "type": proposal.kind,
            "status": proposal.status,
            "summary": proposal.summary,
            "totalAllocation": round_cents(proposal.total_allocation),
            "createdAt": proposal.created_at,
        });
        if let Some(budget) = proposal.budget() {
            data["debtAllocation"] = json!(round_cents(budget.debt_allocation));
            data["investingAllocation"] = json!(round_cents(budget.investing_allocation));
        }

        Ok(ToolOutput {
            success: true,
            data,
            error: None,
        })
    }
}

//
// ================= Execute =================
//

/// `execute_*`: apply an approved proposal's effects and mark it executed.
pub struct ExecuteProposalTool {
    kind: ProposalType,
    lifecycle: Arc<ProposalLifecycle>,
}

impl ExecuteProposalTool {
    pub fn new(kind: ProposalType, lifecycle: Arc<ProposalLifecycle>) -> Self {
        Self { kind, lifecycle }
    }
}

/// Balance changes implied by an executed proposal.
pub fn execution_mutations(proposal: &Proposal) -> Vec<BalanceMutation> {
    match &proposal.payload {
        ProposalPayload::Budget(_) => Vec::new(),
        ProposalPayload::Debt(debt) => debt
            .ordered_debts
            .iter()
            .map(|line| (line, round_cents(line.payment_amount)))
            .filter(|(_, amount)| *amount > Decimal::ZERO)
            .map(|(line, amount)| BalanceMutation::DebtPayment {
                debt_id: line.debt_id.clone(),
                amount,
            })
            .collect(),
        ProposalPayload::Investing(investing) => {
            let mut mutations = Vec::with_capacity(2);
            let k401 = round_cents(investing.k401_monthly);
            if k401 > Decimal::ZERO {
                mutations.push(BalanceMutation::Contribution {
                    account_id: ACCOUNT_401K.to_string(),
                    amount: k401,
                    ira_type: None,
                });
            }
            let ira = round_cents(investing.ira_monthly);
            if ira > Decimal::ZERO {
                mutations.push(BalanceMutation::Contribution {
                    account_id: ACCOUNT_IRA.to_string(),
                    amount: ira,
                    ira_type: Some(investing.ira_type),
                });
            }
            mutations
        }
    }
}

fn execution_report(proposal: &Proposal, mutation_count: usize) -> Value {
    let mut data = json!({
        "success": true,
        "userId": proposal.user_id,
        "proposalId": proposal.proposal_id,
        "status": proposal.status,
        "executedAt": proposal.updated_at,
    });

    match &proposal.payload {
        ProposalPayload::Budget(budget) => {
            data["debtAllocation"] = json!(round_cents(budget.debt_allocation));
            data["investingAllocation"] = json!(round_cents(budget.investing_allocation));
        }
        ProposalPayload::Debt(debt) => {
            let paid: Decimal = debt.ordered_debts.iter().map(|l| l.payment_amount).sum();
            data["paymentsProcessed"] = json!(mutation_count);
            data["totalPaid"] = json!(round_cents(paid));
        }
        ProposalPayload::Investing(investing) => {
            data["k401Contributed"] = json!(round_cents(investing.k401_monthly));
            data["iraContributed"] = json!(round_cents(investing.ira_monthly));
            data["iraType"] = json!(investing.ira_type);
            data["totalContributed"] =
                json!(round_cents(investing.k401_monthly + investing.ira_monthly));
        }
    }

    data
}

#[async_trait::async_trait]
impl Tool for ExecuteProposalTool {
    fn name(&self) -> &'static str {
        execute_tool_name(self.kind)
    }

    fn description(&self) -> &'static str {
        match self.kind {
            ProposalType::Budget => {
                "Execute an approved budget. ONLY call this after the user has approved the proposal."
            }
            ProposalType::Debt => {
                "Execute an approved debt allocation: deduct each payment from its debt. ONLY call this after approval."
            }
            ProposalType::Investing => {
                "Execute an approved investment allocation: credit 401k and IRA contributions. ONLY call this after approval."
            }
        }
    }

    fn parameters(&self) -> &'static str {
        r#"{"proposalId": uuid}"#
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let params: ExecuteParameters = parse_parameters(input)?;
        let proposal = self.lifecycle.get(params.proposal_id).await?;

        if proposal.kind != self.kind {
            return Err(WorkflowError::ProposalMismatch(format!(
                "{} cannot execute {} proposal {}",
                self.name(),
                proposal.kind,
                proposal.proposal_id
            )));
        }
        if proposal.user_id != params.user_id {
            return Err(WorkflowError::ProposalMismatch(format!(
                "Proposal {} does not belong to user {}",
                proposal.proposal_id, params.user_id
            )));
        }

        let mutations = execution_mutations(&proposal);
        let executed = self
            .lifecycle
            .execute(proposal.proposal_id, &mutations)
            .await?;

        Ok(ToolOutput {
            success: true,
            data: execution_report(&executed, mutations.len()),
            error: None,
        })
    }
}

//
// ================= Suggestion =================
//

/// `send_suggestion`: acknowledgement only, no state change.
pub struct SendSuggestionTool;

#[async_trait::async_trait]
impl Tool for SendSuggestionTool {
    fn name(&self) -> &'static str {
        SEND_SUGGESTION
    }

    fn description(&self) -> &'static str {
        "Send a suggestion, SMART goal or motivation message to the user."
    }

    fn parameters(&self) -> &'static str {
        r#"{"message": str}"#
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let params: SuggestionParameters = parse_parameters(input)?;

        info!(user_id = %params.user_id, "Suggestion sent");

        Ok(ToolOutput {
            success: true,
            data: json!({
                "sent": true,
                "userId": params.user_id,
                "message": params.message,
            }),
            error: None,
        })
    }
}

/// Registry holding the three tools bound to the agent of `kind`.
pub fn create_agent_registry(kind: ProposalType, lifecycle: Arc<ProposalLifecycle>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SubmitProposalTool::new(kind, Arc::clone(&lifecycle))));
    registry.register(Arc::new(ExecuteProposalTool::new(kind, lifecycle)));
    registry.register(Arc::new(SendSuggestionTool));
    registry
}
