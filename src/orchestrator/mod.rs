//! Workflow orchestrator
//!
//! Entry point for pay-period events and proposal responses:
//! EVENT → SNAPSHOT → AGENT → PROPOSAL → (approval) → EXECUTE → FAN-OUT
//!
//! A budget approval executes the budget, reads the executed allocations
//! back, then runs the Debt and Investing agents on two spawned tasks and
//! joins both. Each branch succeeds or fails on its own, and its outcome is
//! recorded so a failed branch can be re-run by re-sending the approval.

pub mod cycle;

pub use cycle::{Branch, BranchState, CycleState};

use crate::agent::{Agent, AgentReply};
use crate::audit::{compute_context_hash, AuditLog, AuditRecord, DEFAULT_AUDIT_CAPACITY};
use crate::context::ContextSnapshot;
use crate::error::WorkflowError;
use crate::execution::ExecutionEngine;
use crate::lifecycle::{ProposalLifecycle, ResubmissionGuard};
use crate::models::{
    require_amount, round_cents, BranchDispatch, Goals, Proposal, ProposalStatus, ProposalType,
};
use crate::policy::{
    AgentTask, BudgetRulePolicy, DebtAvalanchePolicy, InvestingPriorityPolicy, LlmPolicy, Policy,
    TaskEvent,
};
use crate::state::{invalid_transition, RecordStore};
use crate::tools::create_agent_registry;
use crate::verification::create_default_verification_engine;
use crate::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Decision functions for the three agents.
#[derive(Clone)]
pub struct AgentPolicies {
    pub budget: Arc<dyn Policy>,
    pub debt: Arc<dyn Policy>,
    pub investing: Arc<dyn Policy>,
}

impl AgentPolicies {
    /// Deterministic rule policies.
    pub fn rules() -> Self {
        Self {
            budget: Arc::new(BudgetRulePolicy::new()),
            debt: Arc::new(DebtAvalanchePolicy),
            investing: Arc::new(InvestingPriorityPolicy::new()),
        }
    }

    /// Gemini-backed policies sharing one API key.
    pub fn llm(api_key: &str) -> Result<Self> {
        Ok(Self {
            budget: Arc::new(LlmPolicy::new(ProposalType::Budget, api_key.to_string())?),
            debt: Arc::new(LlmPolicy::new(ProposalType::Debt, api_key.to_string())?),
            investing: Arc::new(LlmPolicy::new(ProposalType::Investing, api_key.to_string())?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// Bound on each agent decision step.
    pub agent_timeout: Duration,
    pub resubmission_tolerance: Decimal,
    /// Agent invocations allowed to produce a revision after a rejection.
    pub max_revision_attempts: u32,
    /// Audit records kept in process before the oldest are evicted.
    pub audit_capacity: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(60),
            resubmission_tolerance: Decimal::ZERO,
            max_revision_attempts: 2,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

//
// ================= Requests / Responses =================
//

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondRequest {
    pub proposal_id: Uuid,
    pub user_id: String,
    /// Raw type string; parsed before anything is read or written.
    #[serde(rename = "type")]
    pub kind: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Result of a trigger event or a single-agent response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResponse {
    pub stage: &'static str,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    pub result: AgentReply,
}

/// One joined branch of the budget fan-out.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamOutcome {
    pub ok: bool,
    /// Not re-run: the branch already has an outcome for this budget.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Re-sending the budget approval re-runs this branch.
    pub retryable: bool,
}

type Joined = std::result::Result<Result<AgentReply>, JoinError>;

impl DownstreamOutcome {
    fn from_join(kind: ProposalType, joined: Joined) -> Self {
        match joined {
            Ok(Ok(reply)) => Self {
                ok: true,
                skipped: false,
                result: Some(reply),
                error: None,
                retryable: false,
            },
            Ok(Err(e)) => {
                warn!(agent = %kind, error = %e, "Downstream agent failed");
                Self {
                    ok: false,
                    skipped: false,
                    result: None,
                    retryable: e.is_retryable(),
                    error: Some(e.to_string()),
                }
            }
            Err(e) => {
                error!(agent = %kind, error = %e, "Downstream agent task aborted");
                Self {
                    ok: false,
                    skipped: false,
                    result: None,
                    error: Some(format!("{} agent task aborted: {}", kind, e)),
                    retryable: true,
                }
            }
        }
    }

    fn skipped() -> Self {
        Self {
            ok: true,
            skipped: true,
            result: None,
            error: None,
            retryable: false,
        }
    }

    fn submitted(&self) -> Option<Uuid> {
        self.result.as_ref().and_then(|r| r.submitted)
    }

    fn dispatch_record(&self, budget: &Proposal, kind: ProposalType) -> BranchDispatch {
        BranchDispatch {
            budget_proposal_id: budget.proposal_id,
            user_id: budget.user_id.clone(),
            kind,
            succeeded: self.ok,
            proposal_id: self.submitted(),
            error: self.error.clone(),
            recorded_at: Utc::now(),
        }
    }
}

async fn join_branch(handle: Option<JoinHandle<Result<AgentReply>>>) -> Option<Joined> {
    match handle {
        Some(handle) => Some(handle.await),
        None => None,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutResponse {
    pub stage: &'static str,
    pub proposal_id: Uuid,
    pub debt_allocation: Decimal,
    pub investing_allocation: Decimal,
    /// Absent when only downstream branches were re-run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_result: Option<AgentReply>,
    pub debt_result: DownstreamOutcome,
    pub investing_result: DownstreamOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RespondResponse {
    Single(WorkflowResponse),
    FanOut(Box<FanOutResponse>),
}

impl RespondResponse {
    fn touched(&self) -> Vec<Uuid> {
        match self {
            RespondResponse::Single(r) => r
                .proposal_id
                .into_iter()
                .chain(r.result.submitted)
                .collect(),
            RespondResponse::FanOut(f) => std::iter::once(f.proposal_id)
                .chain(f.debt_result.submitted())
                .chain(f.investing_result.submitted())
                .collect(),
        }
    }
}

//
// ================= Orchestrator =================
//

pub struct WorkflowOrchestrator {
    store: Arc<dyn RecordStore>,
    lifecycle: Arc<ProposalLifecycle>,
    budget: Arc<Agent>,
    debt: Arc<Agent>,
    investing: Arc<Agent>,
    audit_log: AuditLog,
    max_revision_attempts: u32,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        policies: AgentPolicies,
        settings: WorkflowSettings,
    ) -> Self {
        let lifecycle = Arc::new(ProposalLifecycle::new(
            Arc::clone(&store),
            create_default_verification_engine(),
            ResubmissionGuard::new(settings.resubmission_tolerance),
        ));

        let agent = |kind: ProposalType, policy: Arc<dyn Policy>| {
            Arc::new(Agent::new(
                kind,
                policy,
                ExecutionEngine::new(create_agent_registry(kind, Arc::clone(&lifecycle))),
                settings.agent_timeout,
            ))
        };

        let budget = agent(ProposalType::Budget, policies.budget);
        let debt = agent(ProposalType::Debt, policies.debt);
        let investing = agent(ProposalType::Investing, policies.investing);

        Self {
            store,
            lifecycle,
            budget,
            debt,
            investing,
            audit_log: AuditLog::with_capacity(settings.audit_capacity),
            max_revision_attempts: settings.max_revision_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    fn agent(&self, kind: ProposalType) -> &Arc<Agent> {
        match kind {
            ProposalType::Budget => &self.budget,
            ProposalType::Debt => &self.debt,
            ProposalType::Investing => &self.investing,
        }
    }

    async fn snapshot(&self, user_id: &str, kind: ProposalType) -> Result<ContextSnapshot> {
        ContextSnapshot::load(self.store.as_ref(), user_id, kind).await
    }

    /// New paycheck: the Budget Agent proposes an allocation for it.
    pub async fn paycheck(&self, user_id: &str, amount: Decimal) -> Result<WorkflowResponse> {
        require_user(user_id)?;
        require_amount("amount", amount)?;

        let context = self.snapshot(user_id, ProposalType::Budget).await?;
        self.trigger("paycheck", TaskEvent::Paycheck { amount }, context)
            .await
    }

    /// Critical overspend: the Budget Agent re-evaluates with cuts.
    pub async fn overspend(&self, user_id: &str) -> Result<WorkflowResponse> {
        require_user(user_id)?;

        let context = self.snapshot(user_id, ProposalType::Budget).await?;
        self.trigger("overspend", TaskEvent::Overspend, context).await
    }

    /// First budget for a new user. Goals given here are shown to the agent
    /// but not written back.
    pub async fn onboard(
        &self,
        user_id: &str,
        income: Decimal,
        goals: Option<Goals>,
    ) -> Result<WorkflowResponse> {
        require_user(user_id)?;
        require_amount("income", income)?;

        let mut context = self.snapshot(user_id, ProposalType::Budget).await?;
        if let Some(goals) = goals {
            context = context.with_goals(goals);
        }
        self.trigger("onboard", TaskEvent::Onboard { income }, context)
            .await
    }

    async fn trigger(
        &self,
        event: &'static str,
        task_event: TaskEvent,
        context: ContextSnapshot,
    ) -> Result<WorkflowResponse> {
        let start = Instant::now();
        let user_id = context.user_id.clone();
        let context_hash = compute_context_hash(&context);

        info!(user_id = %user_id, event = event, "Workflow event received");

        let task = AgentTask::new(ProposalType::Budget, task_event, context);
        let outcome = self.budget.invoke(task).await.map(|reply| WorkflowResponse {
            stage: "budget_proposed",
            user_id: user_id.clone(),
            proposal_id: reply.submitted,
            approved: None,
            result: reply,
        });

        let touched = outcome
            .as_ref()
            .map(|r| r.proposal_id.into_iter().collect())
            .unwrap_or_default();
        self.audit(&user_id, event.to_string(), context_hash, touched, &outcome, start)
            .await;

        outcome
    }

    /// Apply a human decision to a proposal.
    pub async fn respond(&self, request: RespondRequest) -> Result<RespondResponse> {
        let start = Instant::now();
        let kind: ProposalType = request.kind.parse()?;

        let proposal = self.lifecycle.get(request.proposal_id).await?;
        if proposal.kind != kind {
            return Err(WorkflowError::ProposalMismatch(format!(
                "Proposal {} is a {} proposal, not {}",
                proposal.proposal_id, proposal.kind, kind
            )));
        }
        if proposal.user_id != request.user_id {
            return Err(WorkflowError::ProposalMismatch(format!(
                "Proposal {} does not belong to user {}",
                proposal.proposal_id, request.user_id
            )));
        }

        let context = self.snapshot(&proposal.user_id, kind).await?;
        let context_hash = compute_context_hash(&context);

        info!(
            proposal_id = %proposal.proposal_id,
            user_id = %proposal.user_id,
            kind = %kind,
            approved = request.approved,
            "Proposal response received"
        );

        let outcome = if request.approved {
            self.approve(proposal, context).await
        } else {
            let reason = request.reason.unwrap_or_default();
            self.reject(proposal, reason, context).await
        };

        let event = format!(
            "respond:{}:{}",
            kind,
            if request.approved { "approved" } else { "rejected" }
        );
        let touched = match &outcome {
            Ok(response) => response.touched(),
            Err(_) => vec![request.proposal_id],
        };
        self.audit(&request.user_id, event, context_hash, touched, &outcome, start)
            .await;

        outcome
    }

    async fn approve(&self, proposal: Proposal, context: ContextSnapshot) -> Result<RespondResponse> {
        let kind = proposal.kind;
        let proposal_id = proposal.proposal_id;

        match proposal.status {
            // The agent failed after approval: resume at execution.
            ProposalStatus::Approved => {
                info!(proposal_id = %proposal_id, "Resuming execution of approved proposal");
            }
            // Executed budget: re-run any downstream branch that never finished.
            ProposalStatus::Executed if kind == ProposalType::Budget => {
                return self.redispatch(proposal).await;
            }
            _ => {
                self.lifecycle
                    .transition(proposal_id, ProposalStatus::Approved, None)
                    .await?;
            }
        }

        let task = AgentTask::new(kind, TaskEvent::ProposalApproved { proposal_id }, context);
        let reply = self.agent(kind).invoke(task).await?;

        let executed = self.lifecycle.get(proposal_id).await?;
        if executed.status != ProposalStatus::Executed {
            return Err(WorkflowError::AgentError(format!(
                "{} agent did not execute approved proposal {}",
                kind, proposal_id
            )));
        }

        if kind == ProposalType::Budget {
            return self
                .fan_out(executed, Some(reply), &[ProposalType::Debt, ProposalType::Investing])
                .await;
        }

        Ok(RespondResponse::Single(WorkflowResponse {
            stage: "proposal_executed",
            user_id: executed.user_id,
            proposal_id: Some(proposal_id),
            approved: Some(true),
            result: reply,
        }))
    }

    /// Re-run the branches of an executed budget that have no recorded
    /// outcome. Refused once every branch has proposed or declined, or when
    /// a newer budget has replaced this one.
    async fn redispatch(&self, budget: Proposal) -> Result<RespondResponse> {
        let proposals = self.store.list_proposals(&budget.user_id, None).await?;
        let dispatches = self.store.list_dispatches(budget.proposal_id).await?;

        let is_latest = cycle::latest_budget(&proposals)
            .map_or(false, |latest| latest.proposal_id == budget.proposal_id);
        let pending = if is_latest {
            cycle::undispatched(&budget, &proposals, &dispatches)
        } else {
            Vec::new()
        };

        if pending.is_empty() {
            return Err(invalid_transition(
                budget.proposal_id,
                budget.status,
                ProposalStatus::Approved,
            ));
        }

        info!(
            proposal_id = %budget.proposal_id,
            user_id = %budget.user_id,
            branches = ?pending,
            "Re-dispatching downstream agents"
        );

        self.fan_out(budget, None, &pending).await
    }

    /// Run the listed downstream agents concurrently on the executed budget's
    /// amounts and record each branch's outcome.
    async fn fan_out(
        &self,
        budget: Proposal,
        budget_reply: Option<AgentReply>,
        branches: &[ProposalType],
    ) -> Result<RespondResponse> {
        let payload = budget.budget().ok_or_else(|| {
            WorkflowError::StoreError(format!(
                "Budget proposal {} has a non-budget payload",
                budget.proposal_id
            ))
        })?;
        let debt_allocation = round_cents(payload.debt_allocation);
        let investing_allocation = round_cents(payload.investing_allocation);

        info!(
            proposal_id = %budget.proposal_id,
            user_id = %budget.user_id,
            debt_allocation = %debt_allocation,
            investing_allocation = %investing_allocation,
            branches = ?branches,
            "Budget executed - dispatching downstream agents"
        );

        // Both tasks are spawned before either is awaited.
        let debt = branches.contains(&ProposalType::Debt).then(|| {
            self.spawn_downstream(
                ProposalType::Debt,
                budget.user_id.clone(),
                budget.proposal_id,
                debt_allocation,
            )
        });
        let investing = branches.contains(&ProposalType::Investing).then(|| {
            self.spawn_downstream(
                ProposalType::Investing,
                budget.user_id.clone(),
                budget.proposal_id,
                investing_allocation,
            )
        });

        let (debt, investing) = tokio::join!(join_branch(debt), join_branch(investing));

        let debt_result = self.settle(&budget, ProposalType::Debt, debt).await;
        let investing_result = self.settle(&budget, ProposalType::Investing, investing).await;

        Ok(RespondResponse::FanOut(Box::new(FanOutResponse {
            stage: if budget_reply.is_some() {
                "budget_approved_downstream_triggered"
            } else {
                "downstream_redispatched"
            },
            proposal_id: budget.proposal_id,
            debt_allocation,
            investing_allocation,
            budget_result: budget_reply,
            debt_result,
            investing_result,
        })))
    }

    /// Turn a joined branch into its outcome and record it. A branch that
    /// was not run is reported as skipped and nothing is recorded.
    async fn settle(
        &self,
        budget: &Proposal,
        kind: ProposalType,
        joined: Option<Joined>,
    ) -> DownstreamOutcome {
        let Some(joined) = joined else {
            return DownstreamOutcome::skipped();
        };

        let outcome = DownstreamOutcome::from_join(kind, joined);
        let dispatch = outcome.dispatch_record(budget, kind);
        if let Err(e) = self.store.record_dispatch(&dispatch).await {
            // An unrecorded decline reads as undispatched and is re-run on a re-send.
            warn!(
                budget_proposal_id = %budget.proposal_id,
                kind = %kind,
                error = %e,
                "Failed to record branch dispatch"
            );
        }
        outcome
    }

    fn spawn_downstream(
        &self,
        kind: ProposalType,
        user_id: String,
        budget_proposal_id: Uuid,
        allocation: Decimal,
    ) -> JoinHandle<Result<AgentReply>> {
        let agent = Arc::clone(self.agent(kind));
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let context = ContextSnapshot::load(store.as_ref(), &user_id, kind).await?;
            let task = AgentTask::new(
                kind,
                TaskEvent::BudgetApproved {
                    budget_proposal_id,
                    allocation,
                },
                context,
            );
            agent.invoke(task).await
        })
    }

    async fn reject(
        &self,
        proposal: Proposal,
        reason: String,
        context: ContextSnapshot,
    ) -> Result<RespondResponse> {
        let rejected = self
            .lifecycle
            .transition(proposal.proposal_id, ProposalStatus::Rejected, Some(reason.clone()))
            .await?;

        let reply = self.revise(&rejected, &reason, context).await?;

        Ok(RespondResponse::Single(WorkflowResponse {
            stage: "revised_proposal_submitted",
            user_id: rejected.user_id,
            proposal_id: Some(rejected.proposal_id),
            approved: Some(false),
            result: reply,
        }))
    }

    /// Re-invoke the originating agent until it submits a revision.
    /// A refused revision (duplicate or invalid) is fed back on the next attempt.
    async fn revise(
        &self,
        rejected: &Proposal,
        reason: &str,
        context: ContextSnapshot,
    ) -> Result<AgentReply> {
        let kind = rejected.kind;
        let mut context = Some(context);
        let mut refusal: Option<String> = None;

        for attempt in 0..self.max_revision_attempts {
            let context = match context.take() {
                Some(context) => context,
                None => self.snapshot(&rejected.user_id, kind).await?,
            };

            let task = AgentTask::new(
                kind,
                TaskEvent::ProposalRejected {
                    proposal_id: rejected.proposal_id,
                    reason: reason.to_string(),
                    previous: Box::new(rejected.clone()),
                    attempt,
                    refusal: refusal.take(),
                },
                context,
            );

            match self.agent(kind).invoke(task).await {
                Ok(reply) if reply.submitted.is_some() => return Ok(reply),
                Ok(_) => {
                    refusal = Some("no revised proposal was submitted".to_string());
                }
                Err(e @ (WorkflowError::DuplicateProposal(_) | WorkflowError::PreconditionFailed(_))) => {
                    refusal = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }

            warn!(
                proposal_id = %rejected.proposal_id,
                kind = %kind,
                attempt = attempt + 1,
                refusal = ?refusal,
                "Revision attempt produced no new proposal"
            );
        }

        Err(WorkflowError::NoRevisedProposal(self.max_revision_attempts))
    }

    pub async fn get_proposal(&self, proposal_id: Uuid) -> Result<Proposal> {
        self.lifecycle.get(proposal_id).await
    }

    pub async fn list_proposals(
        &self,
        user_id: &str,
        kind: Option<ProposalType>,
    ) -> Result<Vec<Proposal>> {
        self.store.list_proposals(user_id, kind).await
    }

    pub async fn cycle_state(&self, user_id: &str) -> Result<CycleState> {
        let proposals = self.store.list_proposals(user_id, None).await?;
        let dispatches = match cycle::latest_budget(&proposals) {
            Some(budget) if budget.status == ProposalStatus::Executed => {
                self.store.list_dispatches(budget.proposal_id).await?
            }
            _ => Vec::new(),
        };
        Ok(cycle::derive(&proposals, &dispatches))
    }

    async fn audit<T>(
        &self,
        user_id: &str,
        event: String,
        context_snapshot_hash: String,
        proposal_ids: Vec<Uuid>,
        outcome: &Result<T>,
        start: Instant,
    ) {
        let record = AuditRecord {
            audit_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            event,
            context_snapshot_hash,
            proposal_ids,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
            created_at: Utc::now(),
            execution_time_ms: start.elapsed().as_millis() as u64,
        };

        if let Err(e) = self.audit_log.record(record).await {
            warn!(user_id = %user_id, error = %e, "Failed to write audit record");
        }
    }
}

fn require_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(WorkflowError::PreconditionFailed("userId is required".to_string()));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DebtRecord, ACCOUNT_401K, ACCOUNT_IRA};
    use crate::policy::rules::FUND_BONDS;
    use crate::policy::{BudgetSplit, Decision};
    use crate::state::InMemoryRecordStore;
    use crate::tools::ToolSpec;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Barrier;

    /// Fails the first `failures` decisions (optionally only approvals),
    /// then defers to `inner`.
    struct Flaky {
        inner: Arc<dyn Policy>,
        failures: AtomicU32,
        approvals_only: bool,
    }

    #[async_trait]
    impl Policy for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn decide(&self, task: &AgentTask, tools: &[ToolSpec]) -> Result<Decision> {
            let applies = !self.approvals_only
                || matches!(task.event, TaskEvent::ProposalApproved { .. });
            if applies && self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(WorkflowError::LlmError("model unavailable".to_string()));
            }
            self.inner.decide(task, tools).await
        }
    }

    struct Stalled;

    #[async_trait]
    impl Policy for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn decide(&self, _task: &AgentTask, _tools: &[ToolSpec]) -> Result<Decision> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Decision::reply("late"))
        }
    }

    /// Holds each downstream allocation at a shared barrier; fails if the
    /// other branch does not arrive in time.
    struct Rendezvous {
        inner: Arc<dyn Policy>,
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl Policy for Rendezvous {
        fn name(&self) -> &'static str {
            "rendezvous"
        }

        async fn decide(&self, task: &AgentTask, tools: &[ToolSpec]) -> Result<Decision> {
            if matches!(task.event, TaskEvent::BudgetApproved { .. }) {
                tokio::time::timeout(Duration::from_millis(300), self.barrier.wait())
                    .await
                    .map_err(|_| {
                        WorkflowError::AgentError("other downstream agent never started".into())
                    })?;
            }
            self.inner.decide(task, tools).await
        }
    }

    fn flaky(inner: Arc<dyn Policy>, failures: u32, approvals_only: bool) -> Arc<dyn Policy> {
        Arc::new(Flaky {
            inner,
            failures: AtomicU32::new(failures),
            approvals_only,
        })
    }

    fn orchestrator(policies: AgentPolicies) -> (Arc<InMemoryRecordStore>, WorkflowOrchestrator) {
        let store = Arc::new(InMemoryRecordStore::new());
        let settings = WorkflowSettings {
            agent_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let orchestrator = WorkflowOrchestrator::new(store.clone(), policies, settings);
        (store, orchestrator)
    }

    async fn seed_debt(
        store: &InMemoryRecordStore,
        debt_id: &str,
        balance: Decimal,
        rate: Decimal,
        minimum: Decimal,
    ) {
        store
            .put_debt(DebtRecord {
                user_id: "u1".into(),
                debt_id: debt_id.into(),
                name: debt_id.to_uppercase(),
                balance,
                interest_rate: rate,
                minimum_payment: minimum,
                last_payment_date: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn seed_visa(store: &InMemoryRecordStore, balance: Decimal) {
        seed_debt(store, "visa", balance, dec!(24.99), dec!(35)).await;
    }

    /// Onboard at 5000 and approve, returning the budget and the fan-out.
    async fn approved_budget(orchestrator: &WorkflowOrchestrator) -> (Uuid, FanOutResponse) {
        let budget_id = orchestrator
            .onboard("u1", dec!(5000), None)
            .await
            .unwrap()
            .proposal_id
            .unwrap();
        let fan = fan_out(
            orchestrator
                .respond(respond(budget_id, "budget", true, None))
                .await
                .unwrap(),
        );
        (budget_id, fan)
    }

    fn single(response: RespondResponse) -> WorkflowResponse {
        match response {
            RespondResponse::Single(r) => r,
            other => panic!("expected single response, got {:?}", other),
        }
    }

    fn respond(proposal_id: Uuid, kind: &str, approved: bool, reason: Option<&str>) -> RespondRequest {
        RespondRequest {
            proposal_id,
            user_id: "u1".into(),
            kind: kind.into(),
            approved,
            reason: reason.map(str::to_string),
        }
    }

    fn fan_out(response: RespondResponse) -> FanOutResponse {
        match response {
            RespondResponse::FanOut(f) => *f,
            other => panic!("expected fan-out, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_onboard_to_executed_cycle() {
        let (store, orchestrator) = orchestrator(AgentPolicies::rules());
        seed_visa(&store, dec!(1200)).await;

        let onboarded = orchestrator.onboard("u1", dec!(5000), None).await.unwrap();
        let budget_id = onboarded.proposal_id.unwrap();
        let budget = orchestrator.get_proposal(budget_id).await.unwrap();
        let payload = budget.budget().unwrap();
        assert_eq!(payload.needs_total(), dec!(2500));
        assert_eq!(payload.wants_total(), dec!(1000));
        assert_eq!(payload.debt_allocation, dec!(500));
        assert_eq!(payload.investing_allocation, dec!(1000));

        let fan = fan_out(
            orchestrator
                .respond(respond(budget_id, "budget", true, None))
                .await
                .unwrap(),
        );
        assert!(fan.debt_result.ok && fan.investing_result.ok);
        let debt_id = fan.debt_result.submitted().unwrap();
        let investing_id = fan.investing_result.submitted().unwrap();
        assert!(matches!(
            orchestrator.cycle_state("u1").await.unwrap(),
            CycleState::AwaitingDownstreamDecisions { .. }
        ));

        orchestrator
            .respond(respond(debt_id, "debt", true, None))
            .await
            .unwrap();
        assert_eq!(store.list_debts("u1").await.unwrap()[0].balance, dec!(700));
        assert!(store.list_investments("u1").await.unwrap().is_empty());

        orchestrator
            .respond(respond(investing_id, "investing", true, None))
            .await
            .unwrap();
        let accounts = store.list_investments("u1").await.unwrap();
        let balance = |id: &str| accounts.iter().find(|a| a.account_id == id).unwrap().balance;
        assert_eq!(balance(ACCOUNT_401K), dec!(416.67));
        assert_eq!(balance(ACCOUNT_IRA), dec!(583.33));
        assert_eq!(store.list_debts("u1").await.unwrap()[0].balance, dec!(700));

        assert_eq!(
            orchestrator.cycle_state("u1").await.unwrap(),
            CycleState::CycleComplete {
                budget_proposal_id: budget_id
            }
        );

        let audit = orchestrator.audit_log().list_for_user("u1").await.unwrap();
        assert_eq!(audit.len(), 4);
        assert!(audit.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_fan_out_routes_each_allocation() {
        let split = BudgetSplit {
            needs: dec!(50),
            wants: dec!(26),
            debt: dec!(10),
            investing: dec!(14),
        };
        let policies = AgentPolicies {
            budget: Arc::new(BudgetRulePolicy::with_split(split).unwrap()),
            ..AgentPolicies::rules()
        };
        let (store, orchestrator) = orchestrator(policies);
        seed_visa(&store, dec!(1200)).await;

        let budget_id = orchestrator
            .onboard("u1", dec!(5000), None)
            .await
            .unwrap()
            .proposal_id
            .unwrap();
        let fan = fan_out(
            orchestrator
                .respond(respond(budget_id, "budget", true, None))
                .await
                .unwrap(),
        );
        assert_eq!(fan.debt_allocation, dec!(500));
        assert_eq!(fan.investing_allocation, dec!(700));

        let debt = orchestrator
            .get_proposal(fan.debt_result.submitted().unwrap())
            .await
            .unwrap();
        let investing = orchestrator
            .get_proposal(fan.investing_result.submitted().unwrap())
            .await
            .unwrap();
        assert_eq!(debt.total_allocation, dec!(500));
        assert_eq!(debt.status, ProposalStatus::Pending);
        assert_eq!(investing.total_allocation, dec!(700));
        assert_eq!(investing.status, ProposalStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejection_produces_changed_revision() {
        let (_store, orchestrator) = orchestrator(AgentPolicies::rules());

        let first = orchestrator
            .onboard("u1", dec!(5000), None)
            .await
            .unwrap()
            .proposal_id
            .unwrap();
        let response = orchestrator
            .respond(respond(first, "budget", false, Some("wants too high")))
            .await
            .unwrap();

        let RespondResponse::Single(single) = response else {
            panic!("expected single response");
        };
        let revised_id = single.result.submitted.unwrap();
        assert_ne!(revised_id, first);

        let rejected = orchestrator.get_proposal(first).await.unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("wants too high"));

        let revised = orchestrator.get_proposal(revised_id).await.unwrap();
        assert_eq!(revised.status, ProposalStatus::Pending);
        assert!(revised.budget().unwrap().wants_total() < dec!(1000));

        // The rejected proposal can no longer be approved.
        let err = orchestrator
            .respond(respond(first, "budget", true, None))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_type_mutates_nothing() {
        let (_store, orchestrator) = orchestrator(AgentPolicies::rules());
        let id = orchestrator
            .onboard("u1", dec!(5000), None)
            .await
            .unwrap()
            .proposal_id
            .unwrap();

        let err = orchestrator
            .respond(respond(id, "savings", true, None))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownProposalType(_)));

        let err = orchestrator
            .respond(respond(id, "debt", true, None))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ProposalMismatch(_)));

        assert_eq!(
            orchestrator.get_proposal(id).await.unwrap().status,
            ProposalStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_invalid_trigger_input() {
        let (_store, orchestrator) = orchestrator(AgentPolicies::rules());
        assert!(matches!(
            orchestrator.paycheck("u1", dec!(0)).await,
            Err(WorkflowError::PreconditionFailed(_))
        ));
        assert!(matches!(
            orchestrator.onboard("", dec!(100), None).await,
            Err(WorkflowError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_proposal() {
        let policies = AgentPolicies {
            budget: Arc::new(Stalled),
            ..AgentPolicies::rules()
        };
        let (store, orchestrator) = orchestrator(policies);

        let err = orchestrator.paycheck("u1", dec!(2400)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::AgentTimeout(500)));
        assert!(err.is_retryable());
        assert!(store.list_proposals("u1", None).await.unwrap().is_empty());

        let audit = orchestrator.audit_log().list_for_user("u1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].success);
    }

    #[tokio::test]
    async fn test_branch_failure_is_isolated() {
        let policies = AgentPolicies {
            investing: flaky(Arc::new(InvestingPriorityPolicy::new()), 1, false),
            ..AgentPolicies::rules()
        };
        let (store, orchestrator) = orchestrator(policies);
        seed_visa(&store, dec!(1200)).await;

        let budget_id = orchestrator
            .onboard("u1", dec!(5000), None)
            .await
            .unwrap()
            .proposal_id
            .unwrap();
        let fan = fan_out(
            orchestrator
                .respond(respond(budget_id, "budget", true, None))
                .await
                .unwrap(),
        );

        assert!(fan.debt_result.ok);
        assert!(fan.debt_result.submitted().is_some());
        assert!(!fan.investing_result.ok);
        assert!(fan.investing_result.retryable);
        assert!(orchestrator
            .list_proposals("u1", Some(ProposalType::Investing))
            .await
            .unwrap()
            .is_empty());

        // Settling the debt branch does not complete a cycle missing its investing branch.
        orchestrator
            .respond(respond(fan.debt_result.submitted().unwrap(), "debt", true, None))
            .await
            .unwrap();
        assert!(matches!(
            orchestrator.cycle_state("u1").await.unwrap(),
            CycleState::AwaitingDownstreamDispatch { ref pending, .. }
                if pending == &vec![ProposalType::Investing]
        ));
    }

    #[tokio::test]
    async fn test_resent_budget_approval_reruns_failed_branch() {
        let policies = AgentPolicies {
            investing: flaky(Arc::new(InvestingPriorityPolicy::new()), 1, false),
            ..AgentPolicies::rules()
        };
        let (store, orchestrator) = orchestrator(policies);
        seed_visa(&store, dec!(1200)).await;

        let (budget_id, fan) = approved_budget(&orchestrator).await;
        assert!(!fan.investing_result.ok);
        let debt_id = fan.debt_result.submitted().unwrap();

        let retried = fan_out(
            orchestrator
                .respond(respond(budget_id, "budget", true, None))
                .await
                .unwrap(),
        );
        assert_eq!(retried.stage, "downstream_redispatched");
        assert!(retried.budget_result.is_none());
        assert!(retried.debt_result.skipped);
        assert!(retried.investing_result.ok);
        let investing_id = retried.investing_result.submitted().unwrap();

        let investing = orchestrator
            .list_proposals("u1", Some(ProposalType::Investing))
            .await
            .unwrap();
        assert_eq!(investing.len(), 1);
        assert_eq!(investing[0].proposal_id, investing_id);
        assert_eq!(investing[0].total_allocation, dec!(1000));
        // The debt branch was not run twice.
        assert_eq!(
            orchestrator
                .list_proposals("u1", Some(ProposalType::Debt))
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.list_dispatches(budget_id).await.unwrap().len(), 3);

        // Nothing left to re-run.
        let err = orchestrator
            .respond(respond(budget_id, "budget", true, None))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

        for (id, kind) in [(debt_id, "debt"), (investing_id, "investing")] {
            orchestrator.respond(respond(id, kind, true, None)).await.unwrap();
        }
        assert_eq!(
            orchestrator.cycle_state("u1").await.unwrap(),
            CycleState::CycleComplete {
                budget_proposal_id: budget_id
            }
        );
    }

    #[tokio::test]
    async fn test_downstream_agents_run_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let policies = AgentPolicies {
            debt: Arc::new(Rendezvous {
                inner: Arc::new(DebtAvalanchePolicy),
                barrier: Arc::clone(&barrier),
            }),
            investing: Arc::new(Rendezvous {
                inner: Arc::new(InvestingPriorityPolicy::new()),
                barrier,
            }),
            ..AgentPolicies::rules()
        };
        let (store, orchestrator) = orchestrator(policies);
        seed_visa(&store, dec!(1200)).await;

        // Run one after the other, the first branch would time out at the barrier.
        let (_, fan) = approved_budget(&orchestrator).await;
        assert!(fan.debt_result.ok, "{:?}", fan.debt_result.error);
        assert!(fan.investing_result.ok, "{:?}", fan.investing_result.error);
        assert!(fan.debt_result.submitted().is_some());
        assert!(fan.investing_result.submitted().is_some());
    }

    #[tokio::test]
    async fn test_debt_rejection_reorders_payoff() {
        let (store, orchestrator) = orchestrator(AgentPolicies::rules());
        seed_visa(&store, dec!(1200)).await;
        seed_debt(&store, "car", dec!(800), dec!(6.5), dec!(50)).await;

        let (_, fan) = approved_budget(&orchestrator).await;
        let original_id = fan.debt_result.submitted().unwrap();
        let original = orchestrator.get_proposal(original_id).await.unwrap();
        assert_eq!(original.debt().unwrap().ordered_debts[0].debt_id, "visa");

        let response = single(
            orchestrator
                .respond(respond(
                    original_id,
                    "debt",
                    false,
                    Some("pay off the smallest balance first"),
                ))
                .await
                .unwrap(),
        );
        let revised_id = response.result.submitted.unwrap();
        assert_ne!(revised_id, original_id);

        let rejected = orchestrator.get_proposal(original_id).await.unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);
        assert_eq!(
            rejected.rejection_reason.as_deref(),
            Some("pay off the smallest balance first")
        );

        let revised = orchestrator.get_proposal(revised_id).await.unwrap();
        assert_eq!(revised.status, ProposalStatus::Pending);
        let lines = &revised.debt().unwrap().ordered_debts;
        assert_eq!(lines[0].debt_id, "car");
        assert_eq!(lines[0].payment_amount, dec!(465));
        assert_eq!(revised.total_allocation, dec!(500));

        assert!(matches!(
            orchestrator.cycle_state("u1").await.unwrap(),
            CycleState::AwaitingDownstreamDecisions {
                debt: Some(BranchState { proposal_id, status: ProposalStatus::Pending }),
                ..
            } if proposal_id == revised_id
        ));
    }

    #[tokio::test]
    async fn test_investing_rejection_raises_bonds() {
        let (store, orchestrator) = orchestrator(AgentPolicies::rules());
        seed_visa(&store, dec!(1200)).await;

        let (_, fan) = approved_budget(&orchestrator).await;
        let original_id = fan.investing_result.submitted().unwrap();
        let original = orchestrator.get_proposal(original_id).await.unwrap();
        let original_bonds = original.investing().unwrap().fund_allocation[FUND_BONDS];

        let response = single(
            orchestrator
                .respond(respond(original_id, "investing", false, Some("too risky")))
                .await
                .unwrap(),
        );
        let revised_id = response.result.submitted.unwrap();
        assert_ne!(revised_id, original_id);

        let rejected = orchestrator.get_proposal(original_id).await.unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("too risky"));

        let revised = orchestrator.get_proposal(revised_id).await.unwrap();
        assert_eq!(revised.status, ProposalStatus::Pending);
        let payload = revised.investing().unwrap();
        assert!(payload.fund_allocation[FUND_BONDS] > original_bonds);
        assert_eq!(payload.total_allocation, dec!(1000));
        assert!(store.list_investments("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_huge_amounts_are_refused() {
        let (store, orchestrator) = orchestrator(AgentPolicies::rules());

        for result in [
            orchestrator.onboard("u1", Decimal::MAX, None).await,
            orchestrator.paycheck("u1", Decimal::MAX).await,
        ] {
            assert!(matches!(result, Err(WorkflowError::PreconditionFailed(_))));
        }
        assert!(store.list_proposals("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approval_resumes_after_agent_failure() {
        let policies = AgentPolicies {
            budget: flaky(Arc::new(BudgetRulePolicy::new()), 1, true),
            ..AgentPolicies::rules()
        };
        let (store, orchestrator) = orchestrator(policies);
        seed_visa(&store, dec!(1200)).await;

        let budget_id = orchestrator
            .onboard("u1", dec!(5000), None)
            .await
            .unwrap()
            .proposal_id
            .unwrap();

        let err = orchestrator
            .respond(respond(budget_id, "budget", true, None))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            orchestrator.get_proposal(budget_id).await.unwrap().status,
            ProposalStatus::Approved
        );
        assert_eq!(
            orchestrator.cycle_state("u1").await.unwrap(),
            CycleState::AwaitingBudgetExecution {
                proposal_id: budget_id
            }
        );

        // Sending the same approval again resumes at execution.
        let fan = fan_out(
            orchestrator
                .respond(respond(budget_id, "budget", true, None))
                .await
                .unwrap(),
        );
        assert!(fan.debt_result.ok && fan.investing_result.ok);
        assert_eq!(
            orchestrator.get_proposal(budget_id).await.unwrap().status,
            ProposalStatus::Executed
        );
    }
}
