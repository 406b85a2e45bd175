//! Record snapshots handed to agents
//!
//! Each agent sees a fresh read of the records it owns: the Budget Agent
//! reads debts alongside the profile, the Debt Agent its debts, the
//! Investing Agent its accounts.

use crate::models::{DebtRecord, Goals, InvestmentAccount, ProposalType, UserProfile};
use crate::state::RecordStore;
use crate::Result;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub user_id: String,
    pub user: Option<UserProfile>,
    pub goals: Goals,
    pub debts: Vec<DebtRecord>,
    pub investments: Vec<InvestmentAccount>,
}

impl ContextSnapshot {
    /// Load the records the agent of `kind` works from.
    pub async fn load(store: &dyn RecordStore, user_id: &str, kind: ProposalType) -> Result<Self> {
        let user = store.get_user(user_id).await?;
        let goals = store.get_goals(user_id).await?;

        let debts = match kind {
            ProposalType::Budget | ProposalType::Debt => store.list_debts(user_id).await?,
            ProposalType::Investing => Vec::new(),
        };
        let investments = match kind {
            ProposalType::Investing => store.list_investments(user_id).await?,
            ProposalType::Budget | ProposalType::Debt => Vec::new(),
        };

        Ok(Self {
            user_id: user_id.to_string(),
            user,
            goals,
            debts,
            investments,
        })
    }

    pub fn with_goals(mut self, goals: Goals) -> Self {
        self.goals = goals;
        self
    }

    /// Text block appended to agent task framing.
    pub fn render(&self) -> String {
        let mut out = format!("User profile: {}. ", json(&self.user));
        out.push_str(&format!("Goals: {}. ", json(&self.goals)));
        if !self.debts.is_empty() {
            out.push_str(&format!("Current debts: {}. ", json(&self.debts)));
        }
        if !self.investments.is_empty() {
            out.push_str(&format!("Current investments: {}. ", json(&self.investments)));
        }
        out
    }
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}
