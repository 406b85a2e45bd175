//! Proposal lifecycle manager
//!
//! Owns the proposal state machine:
//! pending → approved → executed, or pending → rejected.
//! Approval is recorded by the orchestrator; execution is committed by the
//! owning agent's executor, which re-checks approval through the store.

use crate::error::WorkflowError;
use crate::models::{Proposal, ProposalPayload, ProposalStatus, ProposalType};
use crate::state::{invalid_transition, BalanceMutation, RecordStore, StatusChange};
use crate::verification::VerificationEngine;
use crate::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Fields an agent supplies when submitting a proposal.
#[derive(Debug, Clone)]
pub struct NewProposal {
    pub kind: ProposalType,
    pub user_id: String,
    pub payload: ProposalPayload,
    pub rationale: String,
    pub summary: String,
}

/// Refuses a proposal that repeats the user's latest rejected one.
///
/// Two payloads are the same when every numeric field is within `tolerance`
/// and the structural choices (debt ordering, IRA type) match. Free text
/// such as SMART goals does not count as a change.
#[derive(Debug, Clone, Copy)]
pub struct ResubmissionGuard {
    tolerance: Decimal,
}

impl ResubmissionGuard {
    pub fn new(tolerance: Decimal) -> Self {
        Self {
            tolerance: tolerance.abs(),
        }
    }

    pub fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    pub fn is_resubmission(&self, previous: &ProposalPayload, candidate: &ProposalPayload) -> bool {
        if previous.kind() != candidate.kind() || structure(previous) != structure(candidate) {
            return false;
        }

        let before = previous.money_fields();
        let after = candidate.money_fields();
        if !before.keys().eq(after.keys()) {
            return false;
        }

        before
            .values()
            .zip(after.values())
            .all(|(a, b)| (*a - *b).abs() <= self.tolerance)
    }
}

impl Default for ResubmissionGuard {
    fn default() -> Self {
        Self::new(Decimal::ZERO)
    }
}

fn structure(payload: &ProposalPayload) -> Vec<String> {
    match payload {
        ProposalPayload::Budget(_) => Vec::new(),
        ProposalPayload::Debt(d) => d.ordered_debts.iter().map(|l| l.debt_id.clone()).collect(),
        ProposalPayload::Investing(i) => vec![i.ira_type.to_string()],
    }
}

pub struct ProposalLifecycle {
    store: Arc<dyn RecordStore>,
    verifier: VerificationEngine,
    guard: ResubmissionGuard,
}

impl ProposalLifecycle {
    pub fn new(
        store: Arc<dyn RecordStore>,
        verifier: VerificationEngine,
        guard: ResubmissionGuard,
    ) -> Self {
        Self {
            store,
            verifier,
            guard,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Verify and store a new pending proposal.
    pub async fn create(&self, new: NewProposal) -> Result<Proposal> {
        if new.payload.kind() != new.kind {
            return Err(WorkflowError::ProposalMismatch(format!(
                "{} payload submitted as {} proposal",
                new.payload.kind(),
                new.kind
            )));
        }

        let verification = self.verifier.verify(&new.payload)?;
        if !verification.verified {
            warn!(
                user_id = %new.user_id,
                kind = %new.kind,
                issues = ?verification.issues,
                "Proposal failed verification"
            );
            return Err(WorkflowError::PreconditionFailed(verification.issues.join("; ")));
        }

        if let Some(previous) = self.latest(&new.user_id, new.kind).await? {
            if previous.status == ProposalStatus::Rejected
                && self.guard.is_resubmission(&previous.payload, &new.payload)
            {
                return Err(WorkflowError::DuplicateProposal(format!(
                    "{} proposal repeats rejected proposal {}",
                    new.kind, previous.proposal_id
                )));
            }
        }

        let now = Utc::now();
        let proposal = Proposal {
            proposal_id: Uuid::new_v4(),
            user_id: new.user_id,
            kind: new.kind,
            status: ProposalStatus::Pending,
            summary: new.summary,
            rationale: new.rationale,
            total_allocation: new.payload.total_allocation(),
            payload: new.payload,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_proposal(&proposal).await?;

        info!(
            proposal_id = %proposal.proposal_id,
            user_id = %proposal.user_id,
            kind = %proposal.kind,
            total_allocation = %proposal.total_allocation,
            "Proposal created"
        );

        Ok(proposal)
    }

    pub async fn get(&self, proposal_id: Uuid) -> Result<Proposal> {
        self.store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Proposal {} not found", proposal_id)))
    }

    /// Most recent proposal of a type for a user.
    pub async fn latest(&self, user_id: &str, kind: ProposalType) -> Result<Option<Proposal>> {
        Ok(self
            .store
            .list_proposals(user_id, Some(kind))
            .await?
            .into_iter()
            .last())
    }

    /// Record the human decision. Only a pending proposal can be decided.
    pub async fn transition(
        &self,
        proposal_id: Uuid,
        target: ProposalStatus,
        reason: Option<String>,
    ) -> Result<Proposal> {
        if !matches!(target, ProposalStatus::Approved | ProposalStatus::Rejected) {
            let current = self.get(proposal_id).await?;
            return Err(invalid_transition(proposal_id, current.status, target));
        }

        let proposal = self
            .store
            .transition_proposal(
                proposal_id,
                StatusChange {
                    expected: ProposalStatus::Pending,
                    next: target,
                    rejection_reason: if target == ProposalStatus::Rejected {
                        Some(reason.unwrap_or_default())
                    } else {
                        None
                    },
                    at: Utc::now(),
                },
            )
            .await?;

        info!(
            proposal_id = %proposal_id,
            status = %proposal.status,
            "Proposal decided"
        );

        Ok(proposal)
    }

    /// Mark an approved proposal executed without balance changes.
    pub async fn mark_executed(&self, proposal_id: Uuid) -> Result<Proposal> {
        self.execute(proposal_id, &[]).await
    }

    /// Apply the executor's mutations and mark executed, all or nothing.
    pub async fn execute(
        &self,
        proposal_id: Uuid,
        mutations: &[BalanceMutation],
    ) -> Result<Proposal> {
        let proposal = self
            .store
            .commit_execution(proposal_id, mutations, Utc::now())
            .await?;

        info!(
            proposal_id = %proposal_id,
            kind = %proposal.kind,
            mutation_count = mutations.len(),
            "Proposal executed"
        );

        Ok(proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BudgetPayload, InvestingPayload, IraType};
    use crate::state::InMemoryRecordStore;
    use crate::verification::create_default_verification_engine;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use tokio_test::{assert_err, assert_ok};

    fn lifecycle() -> ProposalLifecycle {
        ProposalLifecycle::new(
            Arc::new(InMemoryRecordStore::new()),
            create_default_verification_engine(),
            ResubmissionGuard::default(),
        )
    }

    fn budget(wants: Decimal, investing: Decimal) -> ProposalPayload {
        ProposalPayload::Budget(BudgetPayload {
            income: dec!(5000),
            needs: BTreeMap::from([("essentials".to_string(), dec!(2500))]),
            wants: BTreeMap::from([("discretionary".to_string(), wants)]),
            debt_allocation: dec!(500),
            investing_allocation: investing,
            emergency_fund_monthly: Decimal::ZERO,
            savings_goals_monthly: Decimal::ZERO,
            smart_goals: vec![],
            violations: vec![],
        })
    }

    fn new_budget(payload: ProposalPayload) -> NewProposal {
        NewProposal {
            kind: ProposalType::Budget,
            user_id: "u1".to_string(),
            payload,
            rationale: "50/20/30 split".to_string(),
            summary: "Monthly budget".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_sets_pending() {
        let lifecycle = lifecycle();
        let proposal = lifecycle
            .create(new_budget(budget(dec!(1000), dec!(1000))))
            .await
            .unwrap();

        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert_eq!(proposal.total_allocation, dec!(1500));
        assert_eq!(proposal.created_at, proposal.updated_at);
        assert_eq!(lifecycle.get(proposal.proposal_id).await.unwrap(), proposal);
    }

    #[tokio::test]
    async fn test_create_rejects_kind_mismatch_and_bad_payload() {
        let lifecycle = lifecycle();

        let mut mismatched = new_budget(budget(dec!(1000), dec!(1000)));
        mismatched.kind = ProposalType::Debt;
        let err = lifecycle.create(mismatched).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ProposalMismatch(_)));

        let err = lifecycle
            .create(new_budget(budget(dec!(3000), dec!(1000))))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::PreconditionFailed(_)));
        assert!(lifecycle.store().list_proposals("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_stores_reason_and_blocks_approval() {
        let lifecycle = lifecycle();
        let proposal = lifecycle
            .create(new_budget(budget(dec!(1000), dec!(1000))))
            .await
            .unwrap();

        let rejected = lifecycle
            .transition(
                proposal.proposal_id,
                ProposalStatus::Rejected,
                Some("wants too high".into()),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("wants too high"));
        assert!(rejected.updated_at >= rejected.created_at);
        assert_eq!(rejected.payload, proposal.payload);

        let err = lifecycle
            .transition(proposal.proposal_id, ProposalStatus::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_transition_unknown_proposal() {
        let lifecycle = lifecycle();
        let err = lifecycle
            .transition(Uuid::new_v4(), ProposalStatus::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_requires_approval_and_is_terminal() {
        let lifecycle = lifecycle();
        let proposal = lifecycle
            .create(new_budget(budget(dec!(1000), dec!(1000))))
            .await
            .unwrap();

        assert_err!(lifecycle.mark_executed(proposal.proposal_id).await);
        let stored = lifecycle.get(proposal.proposal_id).await.unwrap();
        assert_eq!(stored, proposal);

        assert_ok!(
            lifecycle
                .transition(proposal.proposal_id, ProposalStatus::Approved, None)
                .await
        );
        let executed = lifecycle.mark_executed(proposal.proposal_id).await.unwrap();
        assert_eq!(executed.status, ProposalStatus::Executed);

        let err = lifecycle.mark_executed(proposal.proposal_id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_transition_target_must_be_a_decision() {
        let lifecycle = lifecycle();
        let proposal = lifecycle
            .create(new_budget(budget(dec!(1000), dec!(1000))))
            .await
            .unwrap();

        let err = lifecycle
            .transition(proposal.proposal_id, ProposalStatus::Executed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        assert_eq!(
            lifecycle.get(proposal.proposal_id).await.unwrap().status,
            ProposalStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_resubmission_after_rejection_is_refused() {
        let lifecycle = lifecycle();
        let first = lifecycle
            .create(new_budget(budget(dec!(1000), dec!(1000))))
            .await
            .unwrap();
        lifecycle
            .transition(first.proposal_id, ProposalStatus::Rejected, Some("no".into()))
            .await
            .unwrap();

        let err = lifecycle
            .create(new_budget(budget(dec!(1000), dec!(1000))))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateProposal(_)));

        let revised = lifecycle
            .create(new_budget(budget(dec!(900), dec!(1100))))
            .await
            .unwrap();
        assert_ne!(revised.proposal_id, first.proposal_id);
    }

    #[test]
    fn test_guard_tolerance_and_structure() {
        let guard = ResubmissionGuard::new(dec!(25));
        assert!(guard.is_resubmission(
            &budget(dec!(1000), dec!(1000)),
            &budget(dec!(990), dec!(1010))
        ));
        assert!(!guard.is_resubmission(
            &budget(dec!(1000), dec!(1000)),
            &budget(dec!(950), dec!(1050))
        ));

        let investing = |ira_type| {
            ProposalPayload::Investing(InvestingPayload {
                k401_monthly: dec!(500),
                ira_monthly: dec!(500),
                ira_type,
                fund_allocation: BTreeMap::new(),
                total_allocation: dec!(1000),
            })
        };
        assert!(!guard.is_resubmission(
            &investing(IraType::RothIra),
            &investing(IraType::TraditionalIra)
        ));
    }
}
