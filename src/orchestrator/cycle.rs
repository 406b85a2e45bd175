//! Per-user pay-cycle state, derived from proposal history
//!
//! Nothing is stored beyond the records themselves: the state is read off
//! the latest budget proposal, the debt and investing proposals created
//! after it was executed, and the recorded outcome of each fan-out branch.

use crate::models::{BranchDispatch, Proposal, ProposalStatus, ProposalType};
use serde::Serialize;
use uuid::Uuid;

const DOWNSTREAM: [ProposalType; 2] = [ProposalType::Debt, ProposalType::Investing];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchState {
    pub proposal_id: Uuid,
    pub status: ProposalStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CycleState {
    AwaitingBudgetProposal {
        /// Set when the last budget was rejected and no revision exists yet.
        rejected_proposal_id: Option<Uuid>,
    },
    AwaitingBudgetDecision {
        proposal_id: Uuid,
    },
    /// Approved, but the Budget Agent has not executed it yet.
    AwaitingBudgetExecution {
        proposal_id: Uuid,
    },
    /// A downstream agent failed before producing an outcome.
    /// Re-sending the budget approval re-runs the `pending` branches.
    AwaitingDownstreamDispatch {
        budget_proposal_id: Uuid,
        pending: Vec<ProposalType>,
        debt: Option<BranchState>,
        investing: Option<BranchState>,
    },
    AwaitingDownstreamDecisions {
        budget_proposal_id: Uuid,
        debt: Option<BranchState>,
        investing: Option<BranchState>,
    },
    CycleComplete {
        budget_proposal_id: Uuid,
    },
}

/// Where one downstream branch of an executed budget stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Latest proposal of the branch's type for this cycle.
    Proposed(BranchState),
    /// The agent finished without proposing (nothing owed, nothing to invest).
    Declined,
    /// No successful run recorded for this budget.
    Undispatched,
}

impl Branch {
    fn state(&self) -> Option<BranchState> {
        match self {
            Branch::Proposed(state) => Some(*state),
            Branch::Declined | Branch::Undispatched => None,
        }
    }

    fn resolved(&self) -> bool {
        match self {
            Branch::Proposed(state) => state.status == ProposalStatus::Executed,
            Branch::Declined => true,
            Branch::Undispatched => false,
        }
    }
}

/// Latest budget proposal in a user's history, oldest-first input.
pub fn latest_budget(proposals: &[Proposal]) -> Option<&Proposal> {
    proposals
        .iter()
        .rev()
        .find(|p| p.kind == ProposalType::Budget)
}

/// State of the `kind` branch of an executed `budget`.
pub fn branch(
    kind: ProposalType,
    budget: &Proposal,
    proposals: &[Proposal],
    dispatches: &[BranchDispatch],
) -> Branch {
    if let Some(p) = proposals
        .iter()
        .rev()
        .find(|p| p.kind == kind && p.created_at >= budget.updated_at)
    {
        return Branch::Proposed(BranchState {
            proposal_id: p.proposal_id,
            status: p.status,
        });
    }

    match dispatches
        .iter()
        .rev()
        .find(|d| d.budget_proposal_id == budget.proposal_id && d.kind == kind)
    {
        Some(dispatch) if dispatch.succeeded => Branch::Declined,
        _ => Branch::Undispatched,
    }
}

/// Downstream branches of an executed budget that still need an agent run.
pub fn undispatched(
    budget: &Proposal,
    proposals: &[Proposal],
    dispatches: &[BranchDispatch],
) -> Vec<ProposalType> {
    DOWNSTREAM
        .into_iter()
        .filter(|kind| branch(*kind, budget, proposals, dispatches) == Branch::Undispatched)
        .collect()
}

/// Derive the cycle state from a user's proposals, oldest first, and the
/// branch outcomes recorded for the latest budget.
pub fn derive(proposals: &[Proposal], dispatches: &[BranchDispatch]) -> CycleState {
    let Some(budget) = latest_budget(proposals) else {
        return CycleState::AwaitingBudgetProposal {
            rejected_proposal_id: None,
        };
    };

    match budget.status {
        ProposalStatus::Pending => CycleState::AwaitingBudgetDecision {
            proposal_id: budget.proposal_id,
        },
        ProposalStatus::Rejected => CycleState::AwaitingBudgetProposal {
            rejected_proposal_id: Some(budget.proposal_id),
        },
        ProposalStatus::Approved => CycleState::AwaitingBudgetExecution {
            proposal_id: budget.proposal_id,
        },
        ProposalStatus::Executed => {
            let debt = branch(ProposalType::Debt, budget, proposals, dispatches);
            let investing = branch(ProposalType::Investing, budget, proposals, dispatches);

            let pending: Vec<ProposalType> = DOWNSTREAM
                .into_iter()
                .zip([debt, investing])
                .filter(|(_, b)| *b == Branch::Undispatched)
                .map(|(kind, _)| kind)
                .collect();

            if !pending.is_empty() {
                CycleState::AwaitingDownstreamDispatch {
                    budget_proposal_id: budget.proposal_id,
                    pending,
                    debt: debt.state(),
                    investing: investing.state(),
                }
            } else if debt.resolved() && investing.resolved() {
                CycleState::CycleComplete {
                    budget_proposal_id: budget.proposal_id,
                }
            } else {
                CycleState::AwaitingDownstreamDecisions {
                    budget_proposal_id: budget.proposal_id,
                    debt: debt.state(),
                    investing: investing.state(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DebtPayload, ProposalPayload};
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    fn proposal(kind: ProposalType, status: ProposalStatus, offset_secs: i64) -> Proposal {
        let at = Utc::now() + Duration::seconds(offset_secs);
        Proposal {
            proposal_id: Uuid::new_v4(),
            user_id: "u1".into(),
            kind,
            status,
            summary: String::new(),
            rationale: String::new(),
            payload: ProposalPayload::Debt(DebtPayload {
                ordered_debts: vec![],
                total_allocation: Decimal::ZERO,
            }),
            total_allocation: Decimal::ZERO,
            rejection_reason: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_budget_states() {
        assert_eq!(
            derive(&[], &[]),
            CycleState::AwaitingBudgetProposal {
                rejected_proposal_id: None
            }
        );

        let rejected = proposal(ProposalType::Budget, ProposalStatus::Rejected, 0);
        assert_eq!(
            derive(&[rejected.clone()], &[]),
            CycleState::AwaitingBudgetProposal {
                rejected_proposal_id: Some(rejected.proposal_id)
            }
        );

        let revised = proposal(ProposalType::Budget, ProposalStatus::Pending, 1);
        assert_eq!(
            derive(&[rejected, revised.clone()], &[]),
            CycleState::AwaitingBudgetDecision {
                proposal_id: revised.proposal_id
            }
        );
    }

    #[test]
    fn test_downstream_states() {
        let budget = proposal(ProposalType::Budget, ProposalStatus::Executed, 0);
        let stale_debt = proposal(ProposalType::Debt, ProposalStatus::Pending, -60);
        let mut debt = proposal(ProposalType::Debt, ProposalStatus::Pending, 1);
        let investing = proposal(ProposalType::Investing, ProposalStatus::Executed, 1);

        let state = derive(&[stale_debt, budget.clone(), debt.clone(), investing.clone()], &[]);
        assert_eq!(
            state,
            CycleState::AwaitingDownstreamDecisions {
                budget_proposal_id: budget.proposal_id,
                debt: Some(BranchState {
                    proposal_id: debt.proposal_id,
                    status: ProposalStatus::Pending
                }),
                investing: Some(BranchState {
                    proposal_id: investing.proposal_id,
                    status: ProposalStatus::Executed
                }),
            }
        );

        debt.status = ProposalStatus::Executed;
        assert_eq!(
            derive(&[budget.clone(), debt, investing], &[]),
            CycleState::CycleComplete {
                budget_proposal_id: budget.proposal_id
            }
        );
    }

    fn dispatch(budget: &Proposal, kind: ProposalType, succeeded: bool) -> BranchDispatch {
        BranchDispatch {
            budget_proposal_id: budget.proposal_id,
            user_id: "u1".into(),
            kind,
            succeeded,
            proposal_id: None,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_failed_branch_is_not_complete() {
        let budget = proposal(ProposalType::Budget, ProposalStatus::Executed, 0);
        let debt = proposal(ProposalType::Debt, ProposalStatus::Executed, 1);
        let proposals = [budget.clone(), debt.clone()];

        // Investing agent failed: the branch is waiting on a re-dispatch.
        let failed = [dispatch(&budget, ProposalType::Investing, false)];
        assert_eq!(
            derive(&proposals, &failed),
            CycleState::AwaitingDownstreamDispatch {
                budget_proposal_id: budget.proposal_id,
                pending: vec![ProposalType::Investing],
                debt: Some(BranchState {
                    proposal_id: debt.proposal_id,
                    status: ProposalStatus::Executed
                }),
                investing: None,
            }
        );
        assert_eq!(
            undispatched(&budget, &proposals, &failed),
            vec![ProposalType::Investing]
        );

        // Nothing recorded at all reads the same way.
        assert!(matches!(
            derive(&proposals, &[]),
            CycleState::AwaitingDownstreamDispatch { .. }
        ));

        // A later successful run with nothing to propose resolves the branch.
        let declined = [
            dispatch(&budget, ProposalType::Investing, false),
            dispatch(&budget, ProposalType::Investing, true),
        ];
        assert_eq!(
            derive(&proposals, &declined),
            CycleState::CycleComplete {
                budget_proposal_id: budget.proposal_id
            }
        );
        assert!(undispatched(&budget, &proposals, &declined).is_empty());
    }

    #[test]
    fn test_state_serialization() {
        let state = CycleState::AwaitingBudgetDecision {
            proposal_id: Uuid::nil(),
        };
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({"state": "awaiting_budget_decision", "proposalId": Uuid::nil()})
        );
    }
}
