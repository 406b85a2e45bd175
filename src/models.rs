//! Core data models for the financial agent workflow

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::WorkflowError;

/// Free-form goals document owned by onboarding (targets, life context, preferences).
pub type Goals = serde_json::Map<String, serde_json::Value>;

/// Largest single amount accepted for an income, balance or allocation.
/// Keeps every sum the workflow computes far inside `Decimal` range and
/// inside the store's `NUMERIC(14, 2)` columns.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// Round a monetary amount to cent precision for response boundaries.
pub fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Require `0 < value <= MAX_AMOUNT`.
pub fn require_amount(field: &str, value: Decimal) -> Result<Decimal, WorkflowError> {
    if value <= Decimal::ZERO || value > MAX_AMOUNT {
        return Err(WorkflowError::PreconditionFailed(format!(
            "{} must be positive and at most {}, got {}",
            field, MAX_AMOUNT, value
        )));
    }
    Ok(value)
}

/// Sum of `amounts`, or `None` if the sum leaves `Decimal` range.
pub fn checked_total<I>(amounts: I) -> Option<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    amounts
        .into_iter()
        .try_fold(Decimal::ZERO, |total, amount| total.checked_add(amount))
}

pub fn amount_overflow(what: impl fmt::Display) -> WorkflowError {
    WorkflowError::PreconditionFailed(format!("amount overflow computing {}", what))
}

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProposalType {
    Budget,
    Debt,
    Investing,
}

impl ProposalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalType::Budget => "budget",
            ProposalType::Debt => "debt",
            ProposalType::Investing => "investing",
        }
    }
}

impl FromStr for ProposalType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "budget" => Ok(ProposalType::Budget),
            "debt" => Ok(ProposalType::Debt),
            "investing" => Ok(ProposalType::Investing),
            other => Err(WorkflowError::UnknownProposalType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Executed => "executed",
        }
    }

    /// The only legal edges: pending→approved, pending→rejected, approved→executed.
    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (ProposalStatus::Pending, ProposalStatus::Approved)
                | (ProposalStatus::Pending, ProposalStatus::Rejected)
                | (ProposalStatus::Approved, ProposalStatus::Executed)
        )
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ProposalStatus::Rejected | ProposalStatus::Executed)
    }
}

impl FromStr for ProposalStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "approved" => Ok(ProposalStatus::Approved),
            "rejected" => Ok(ProposalStatus::Rejected),
            "executed" => Ok(ProposalStatus::Executed),
            other => Err(WorkflowError::StoreError(format!(
                "unrecognised proposal status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IraType {
    RothIra,
    TraditionalIra,
    BackdoorRoth,
    PartialRothIra,
}

impl IraType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IraType::RothIra => "roth_ira",
            IraType::TraditionalIra => "traditional_ira",
            IraType::BackdoorRoth => "backdoor_roth",
            IraType::PartialRothIra => "partial_roth_ira",
        }
    }
}

impl FromStr for IraType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "roth_ira" => Ok(IraType::RothIra),
            "traditional_ira" => Ok(IraType::TraditionalIra),
            "backdoor_roth" => Ok(IraType::BackdoorRoth),
            "partial_roth_ira" => Ok(IraType::PartialRothIra),
            other => Err(WorkflowError::PreconditionFailed(format!(
                "unknown IRA type '{}'",
                other
            ))),
        }
    }
}

//
// ================= Proposal Payloads =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetPayload {
    pub income: Decimal,
    pub needs: BTreeMap<String, Decimal>,
    pub wants: BTreeMap<String, Decimal>,
    pub debt_allocation: Decimal,
    pub investing_allocation: Decimal,
    #[serde(default)]
    pub emergency_fund_monthly: Decimal,
    #[serde(default)]
    pub savings_goals_monthly: Decimal,
    #[serde(default)]
    pub smart_goals: Vec<String>,
    #[serde(default)]
    pub violations: Vec<String>,
}

impl BudgetPayload {
    pub fn needs_total(&self) -> Decimal {
        self.needs.values().copied().sum()
    }

    pub fn wants_total(&self) -> Decimal {
        self.wants.values().copied().sum()
    }

    /// Everything the budget hands out across all categories.
    /// `None` when an unverified payload sums past `Decimal` range.
    pub fn allocated_total(&self) -> Option<Decimal> {
        checked_total(
            self.needs
                .values()
                .chain(self.wants.values())
                .copied()
                .chain([
                    self.debt_allocation,
                    self.investing_allocation,
                    self.emergency_fund_monthly,
                    self.savings_goals_monthly,
                ]),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebtLine {
    pub debt_id: String,
    pub name: String,
    pub balance: Decimal,
    pub interest_rate: Decimal,
    pub minimum_payment: Decimal,
    pub payment_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebtPayload {
    pub ordered_debts: Vec<DebtLine>,
    pub total_allocation: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvestingPayload {
    pub k401_monthly: Decimal,
    pub ira_monthly: Decimal,
    pub ira_type: IraType,
    pub fund_allocation: BTreeMap<String, Decimal>,
    pub total_allocation: Decimal,
}

/// Type-specific proposal body. The variant shapes are disjoint, so the
/// stored JSON carries no tag of its own; the proposal's `type` names it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProposalPayload {
    Budget(BudgetPayload),
    Debt(DebtPayload),
    Investing(InvestingPayload),
}

impl ProposalPayload {
    pub fn kind(&self) -> ProposalType {
        match self {
            ProposalPayload::Budget(_) => ProposalType::Budget,
            ProposalPayload::Debt(_) => ProposalType::Debt,
            ProposalPayload::Investing(_) => ProposalType::Investing,
        }
    }

    /// Headline allocation stored alongside the proposal.
    /// For a budget this is the amount forwarded to the downstream agents.
    pub fn total_allocation(&self) -> Decimal {
        match self {
            ProposalPayload::Budget(b) => {
                round_cents(b.debt_allocation.saturating_add(b.investing_allocation))
            }
            ProposalPayload::Debt(d) => d.total_allocation,
            ProposalPayload::Investing(i) => i.total_allocation,
        }
    }

    /// Every numeric field keyed by its path, e.g. `wants.dining` or
    /// `orderedDebts[visa].paymentAmount`.
    pub fn money_fields(&self) -> BTreeMap<String, Decimal> {
        let mut fields = BTreeMap::new();

        match self {
            ProposalPayload::Budget(b) => {
                fields.insert("income".to_string(), b.income);
                for (category, amount) in &b.needs {
                    fields.insert(format!("needs.{}", category), *amount);
                }
                for (category, amount) in &b.wants {
                    fields.insert(format!("wants.{}", category), *amount);
                }
                fields.insert("debtAllocation".to_string(), b.debt_allocation);
                fields.insert("investingAllocation".to_string(), b.investing_allocation);
                fields.insert("emergencyFundMonthly".to_string(), b.emergency_fund_monthly);
                fields.insert("savingsGoalsMonthly".to_string(), b.savings_goals_monthly);
            }
            ProposalPayload::Debt(d) => {
                for line in &d.ordered_debts {
                    fields.insert(format!("orderedDebts[{}].balance", line.debt_id), line.balance);
                    fields.insert(
                        format!("orderedDebts[{}].interestRate", line.debt_id),
                        line.interest_rate,
                    );
                    fields.insert(
                        format!("orderedDebts[{}].minimumPayment", line.debt_id),
                        line.minimum_payment,
                    );
                    fields.insert(
                        format!("orderedDebts[{}].paymentAmount", line.debt_id),
                        line.payment_amount,
                    );
                }
                fields.insert("totalAllocation".to_string(), d.total_allocation);
            }
            ProposalPayload::Investing(i) => {
                fields.insert("k401Monthly".to_string(), i.k401_monthly);
                fields.insert("iraMonthly".to_string(), i.ira_monthly);
                for (fund, amount) in &i.fund_allocation {
                    fields.insert(format!("fundAllocation.{}", fund), *amount);
                }
                fields.insert("totalAllocation".to_string(), i.total_allocation);
            }
        }

        fields
    }
}

//
// ================= Proposal =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub proposal_id: Uuid,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: ProposalType,
    pub status: ProposalStatus,
    pub summary: String,
    pub rationale: String,
    pub payload: ProposalPayload,
    pub total_allocation: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn budget(&self) -> Option<&BudgetPayload> {
        match &self.payload {
            ProposalPayload::Budget(b) => Some(b),
            _ => None,
        }
    }

    pub fn debt(&self) -> Option<&DebtPayload> {
        match &self.payload {
            ProposalPayload::Debt(d) => Some(d),
            _ => None,
        }
    }

    pub fn investing(&self) -> Option<&InvestingPayload> {
        match &self.payload {
            ProposalPayload::Investing(i) => Some(i),
            _ => None,
        }
    }
}

//
// ================= User Records =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub monthly_income: Option<Decimal>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub household_size: Option<u32>,
    /// Monthly employer 401k contribution needed to capture the full match.
    #[serde(default)]
    pub employer_match_monthly: Option<Decimal>,
    /// Known recurring costs by category (rent, vehicle, groceries, ...).
    #[serde(default)]
    pub fixed_expenses: BTreeMap<String, Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebtRecord {
    pub user_id: String,
    pub debt_id: String,
    pub name: String,
    pub balance: Decimal,
    pub interest_rate: Decimal,
    pub minimum_payment: Decimal,
    #[serde(default)]
    pub last_payment_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentAccount {
    pub user_id: String,
    pub account_id: String,
    pub balance: Decimal,
    #[serde(default)]
    pub ira_type: Option<IraType>,
    #[serde(default)]
    pub last_contribution_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

pub const ACCOUNT_401K: &str = "401k";
pub const ACCOUNT_IRA: &str = "ira";

//
// ================= Fan-out Dispatch =================
//

/// Outcome of running one downstream agent for an executed budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchDispatch {
    pub budget_proposal_id: Uuid,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: ProposalType,
    /// False when the agent failed or its task aborted before finishing.
    pub succeeded: bool,
    /// Submitted proposal. `None` on success means the agent had nothing to propose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: serde_json::Value,
    pub error: Option<String>,
}

impl fmt::Display for ProposalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for IraType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
