//! Record store layer
//!
//! Keyed storage for users, goals, debts, investment accounts and proposals.
//! Pure CRUD plus the two conditional operations the workflow relies on:
//! compare-and-set status transitions and all-or-nothing execution commits.

use crate::error::WorkflowError;
use crate::models::{
    BranchDispatch, DebtRecord, Goals, InvestmentAccount, IraType, Proposal, ProposalStatus,
    ProposalType, UserProfile,
};
use crate::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub mod postgres;
pub use postgres::PgRecordStore;

/// A balance change applied as part of executing a proposal.
/// Always an additive delta against the stored value, never an absolute set.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceMutation {
    /// Subtract `amount` from a debt's balance and stamp the payment date.
    DebtPayment { debt_id: String, amount: Decimal },
    /// Add `amount` to an investment account, creating it at zero if absent.
    Contribution {
        account_id: String,
        amount: Decimal,
        ira_type: Option<IraType>,
    },
}

/// Conditional status update request.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub expected: ProposalStatus,
    pub next: ProposalStatus,
    pub rejection_reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Trait for record persistence
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_user(&self, user: UserProfile) -> Result<()>;
    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>>;

    async fn put_goals(&self, user_id: &str, goals: Goals) -> Result<()>;
    /// Missing goals read as an empty document.
    async fn get_goals(&self, user_id: &str) -> Result<Goals>;

    async fn put_debt(&self, debt: DebtRecord) -> Result<()>;
    async fn list_debts(&self, user_id: &str) -> Result<Vec<DebtRecord>>;

    async fn put_investment(&self, account: InvestmentAccount) -> Result<()>;
    async fn list_investments(&self, user_id: &str) -> Result<Vec<InvestmentAccount>>;

    async fn insert_proposal(&self, proposal: &Proposal) -> Result<()>;
    async fn get_proposal(&self, proposal_id: Uuid) -> Result<Option<Proposal>>;
    /// Proposals for a user, oldest first, optionally filtered by type.
    async fn list_proposals(
        &self,
        user_id: &str,
        kind: Option<ProposalType>,
    ) -> Result<Vec<Proposal>>;

    /// Set `next` only if the stored status equals `change.expected`.
    /// Fails with `NotFound` or `InvalidTransition` and leaves the record untouched otherwise.
    async fn transition_proposal(&self, proposal_id: Uuid, change: StatusChange)
        -> Result<Proposal>;

    /// Atomically: require status `approved`, apply every mutation, mark `executed`.
    /// Any failure leaves both the proposal and all balances unchanged.
    async fn commit_execution(
        &self,
        proposal_id: Uuid,
        mutations: &[BalanceMutation],
        at: DateTime<Utc>,
    ) -> Result<Proposal>;

    /// Append the outcome of one fan-out branch.
    async fn record_dispatch(&self, dispatch: &BranchDispatch) -> Result<()>;
    /// Branch outcomes recorded for a budget proposal, oldest first.
    async fn list_dispatches(&self, budget_proposal_id: Uuid) -> Result<Vec<BranchDispatch>>;
}

pub(crate) fn invalid_transition(
    proposal_id: Uuid,
    from: ProposalStatus,
    to: ProposalStatus,
) -> WorkflowError {
    WorkflowError::InvalidTransition {
        proposal_id,
        from: from.to_string(),
        to: to.to_string(),
    }
}

pub(crate) fn proposal_not_found(proposal_id: Uuid) -> WorkflowError {
    WorkflowError::NotFound(format!("Proposal {} not found", proposal_id))
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, UserProfile>,
    goals: HashMap<String, Goals>,
    debts: HashMap<(String, String), DebtRecord>,
    investments: HashMap<(String, String), InvestmentAccount>,
    proposals: HashMap<Uuid, Proposal>,
    dispatches: HashMap<Uuid, Vec<BranchDispatch>>,
}

/// In-memory record store for development and tests.
///
/// All tables sit behind one lock so conditional updates and execution
/// commits observe and modify a consistent view.
pub struct InMemoryRecordStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put_user(&self, user: UserProfile) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.users.insert(user.user_id.clone(), user);
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let tables = self.tables.read().await;
        Ok(tables.users.get(user_id).cloned())
    }

    async fn put_goals(&self, user_id: &str, goals: Goals) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.goals.insert(user_id.to_string(), goals);
        Ok(())
    }

    async fn get_goals(&self, user_id: &str) -> Result<Goals> {
        let tables = self.tables.read().await;
        Ok(tables.goals.get(user_id).cloned().unwrap_or_default())
    }

    async fn put_debt(&self, debt: DebtRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .debts
            .insert((debt.user_id.clone(), debt.debt_id.clone()), debt);
        Ok(())
    }

    async fn list_debts(&self, user_id: &str) -> Result<Vec<DebtRecord>> {
        let tables = self.tables.read().await;
        let mut debts: Vec<DebtRecord> = tables
            .debts
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        debts.sort_by(|a, b| a.debt_id.cmp(&b.debt_id));
        Ok(debts)
    }

    async fn put_investment(&self, account: InvestmentAccount) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.investments.insert(
            (account.user_id.clone(), account.account_id.clone()),
            account,
        );
        Ok(())
    }

    async fn list_investments(&self, user_id: &str) -> Result<Vec<InvestmentAccount>> {
        let tables = self.tables.read().await;
        let mut accounts: Vec<InvestmentAccount> = tables
            .investments
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(accounts)
    }

    async fn insert_proposal(&self, proposal: &Proposal) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.proposals.contains_key(&proposal.proposal_id) {
            return Err(WorkflowError::StoreError(format!(
                "Proposal {} already exists",
                proposal.proposal_id
            )));
        }
        tables
            .proposals
            .insert(proposal.proposal_id, proposal.clone());
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: Uuid) -> Result<Option<Proposal>> {
        let tables = self.tables.read().await;
        Ok(tables.proposals.get(&proposal_id).cloned())
    }

    async fn list_proposals(
        &self,
        user_id: &str,
        kind: Option<ProposalType>,
    ) -> Result<Vec<Proposal>> {
        let tables = self.tables.read().await;
        let mut items: Vec<Proposal> = tables
            .proposals
            .values()
            .filter(|p| p.user_id == user_id)
            .filter(|p| kind.map_or(true, |k| p.kind == k))
            .cloned()
            .collect();

        items.sort_by_key(|p| p.created_at);
        Ok(items)
    }

    async fn transition_proposal(
        &self,
        proposal_id: Uuid,
        change: StatusChange,
    ) -> Result<Proposal> {
        let mut tables = self.tables.write().await;
        let proposal = tables
            .proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| proposal_not_found(proposal_id))?;

        if proposal.status != change.expected {
            return Err(invalid_transition(proposal_id, proposal.status, change.next));
        }

        proposal.status = change.next;
        if change.next == ProposalStatus::Rejected {
            proposal.rejection_reason = Some(change.rejection_reason.unwrap_or_default());
        }
        proposal.updated_at = proposal.updated_at.max(change.at);

        debug!(
            proposal_id = %proposal_id,
            status = %proposal.status,
            "Proposal status updated"
        );

        Ok(proposal.clone())
    }

    async fn commit_execution(
        &self,
        proposal_id: Uuid,
        mutations: &[BalanceMutation],
        at: DateTime<Utc>,
    ) -> Result<Proposal> {
        let mut tables = self.tables.write().await;

        let (user_id, status) = {
            let proposal = tables
                .proposals
                .get(&proposal_id)
                .ok_or_else(|| proposal_not_found(proposal_id))?;
            (proposal.user_id.clone(), proposal.status)
        };

        if status != ProposalStatus::Approved {
            return Err(invalid_transition(
                proposal_id,
                status,
                ProposalStatus::Executed,
            ));
        }

        // Validate everything before touching anything.
        for mutation in mutations {
            if let BalanceMutation::DebtPayment { debt_id, .. } = mutation {
                if !tables.debts.contains_key(&(user_id.clone(), debt_id.clone())) {
                    return Err(WorkflowError::NotFound(format!(
                        "Debt {} not found for user {}",
                        debt_id, user_id
                    )));
                }
            }
        }

        for mutation in mutations {
            match mutation {
                BalanceMutation::DebtPayment { debt_id, amount } => {
                    if let Some(debt) = tables.debts.get_mut(&(user_id.clone(), debt_id.clone())) {
                        debt.balance -= *amount;
                        debt.last_payment_date = Some(at);
                        debt.updated_at = at;
                    }
                }
                BalanceMutation::Contribution {
                    account_id,
                    amount,
                    ira_type,
                } => {
                    let account = tables
                        .investments
                        .entry((user_id.clone(), account_id.clone()))
                        .or_insert_with(|| InvestmentAccount {
                            user_id: user_id.clone(),
                            account_id: account_id.clone(),
                            balance: Decimal::ZERO,
                            ira_type: None,
                            last_contribution_date: None,
                            updated_at: at,
                        });
                    account.balance += *amount;
                    if ira_type.is_some() {
                        account.ira_type = *ira_type;
                    }
                    account.last_contribution_date = Some(at);
                    account.updated_at = at;
                }
            }
        }

        let proposal = tables
            .proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| proposal_not_found(proposal_id))?;
        proposal.status = ProposalStatus::Executed;
        proposal.updated_at = proposal.updated_at.max(at);

        debug!(
            proposal_id = %proposal_id,
            mutation_count = mutations.len(),
            "Execution committed"
        );

        Ok(proposal.clone())
    }

    async fn record_dispatch(&self, dispatch: &BranchDispatch) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .dispatches
            .entry(dispatch.budget_proposal_id)
            .or_default()
            .push(dispatch.clone());
        Ok(())
    }

    async fn list_dispatches(&self, budget_proposal_id: Uuid) -> Result<Vec<BranchDispatch>> {
        let tables = self.tables.read().await;
        Ok(tables
            .dispatches
            .get(&budget_proposal_id)
            .cloned()
            .unwrap_or_default())
    }
}
