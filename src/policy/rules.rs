//! Deterministic rule policies for the three agents
//!
//! Budget: fixed percentage split, housing and vehicle caps, wants cuts on
//! overspend or rejection. Debt: minimums first, surplus by avalanche
//! (snowball on revision). Investing: employer match, IRA up to the cap,
//! remainder to the 401k, three-fund split by age.

use super::{AgentTask, Decision, Policy, TaskEvent};
use crate::error::WorkflowError;
use crate::models::{
    amount_overflow, require_amount, round_cents, BudgetPayload, DebtLine, DebtPayload, DebtRecord,
    InvestingPayload, IraType, Proposal, ProposalType, UserProfile, MAX_AMOUNT,
};
use crate::tools::ToolSpec;
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use tracing::debug;

const HOUSING_CAP_PERCENT: Decimal = Decimal::from_parts(30, 0, 0, false, 0);
const VEHICLE_CAP_PERCENT: Decimal = Decimal::from_parts(15, 0, 0, false, 0);
const MAX_WANTS_CUT_PERCENT: Decimal = Decimal::from_parts(25, 0, 0, false, 0);
const GROCERIES_PER_PERSON: Decimal = Decimal::from_parts(300, 0, 0, false, 0);
const REVISION_STEP_PERCENT: Decimal = Decimal::from_parts(10, 0, 0, false, 0);

pub const FUND_DOMESTIC: &str = "total_stock_market";
pub const FUND_INTERNATIONAL: &str = "international_stock";
pub const FUND_BONDS: &str = "total_bond";

fn percent_of(amount: Decimal, percent: Decimal) -> Result<Decimal> {
    amount
        .checked_mul(percent)
        .and_then(|scaled| scaled.checked_div(dec!(100)))
        .map(round_cents)
        .ok_or_else(|| amount_overflow(format!("{}% of {}", percent, amount)))
}

fn share_of(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        Decimal::ZERO
    } else {
        (part * dec!(100) / whole).round_dp(1)
    }
}

/// Revision step for attempt `n`: 10%, 20%, then capped at 25%.
fn revision_step(attempt: u32) -> Decimal {
    (REVISION_STEP_PERCENT * Decimal::from(attempt + 1)).min(MAX_WANTS_CUT_PERCENT)
}

fn previous_payload<'a, T>(
    previous: &'a Proposal,
    pick: fn(&Proposal) -> Option<&T>,
    kind: ProposalType,
) -> Result<&'a T> {
    pick(previous).ok_or_else(|| {
        WorkflowError::PolicyViolation(format!(
            "{} agent asked to revise a {} proposal",
            kind, previous.kind
        ))
    })
}

fn unexpected(kind: ProposalType, event: &TaskEvent) -> WorkflowError {
    WorkflowError::PolicyViolation(format!("{} agent cannot handle {:?}", kind, event))
}

//
// ================= Budget =================
//

/// Percent split of income across the four budget buckets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSplit {
    pub needs: Decimal,
    pub wants: Decimal,
    pub debt: Decimal,
    pub investing: Decimal,
}

impl Default for BudgetSplit {
    fn default() -> Self {
        Self {
            needs: dec!(50),
            wants: dec!(20),
            debt: dec!(10),
            investing: dec!(20),
        }
    }
}

pub struct BudgetRulePolicy {
    split: BudgetSplit,
}

impl BudgetRulePolicy {
    pub fn new() -> Self {
        Self {
            split: BudgetSplit::default(),
        }
    }

    pub fn with_split(split: BudgetSplit) -> Result<Self> {
        let parts = [split.needs, split.wants, split.debt, split.investing];
        if parts.iter().any(|p| *p < Decimal::ZERO)
            || parts.iter().copied().sum::<Decimal>() != dec!(100)
        {
            return Err(WorkflowError::ConfigError(format!(
                "budget split must be non-negative and sum to 100: {:?}",
                split
            )));
        }
        Ok(Self { split })
    }

    fn base_payload(&self, income: Decimal, profile: Option<&UserProfile>) -> Result<BudgetPayload> {
        let income = require_amount("income", income)?;
        let needs_target = percent_of(income, self.split.needs)?;
        let mut wants = percent_of(income, self.split.wants)?;
        let mut debt = percent_of(income, self.split.debt)?;
        let mut investing = income - needs_target - wants - debt;

        let mut needs = BTreeMap::new();
        let mut violations = Vec::new();
        let mut fixed_total = Decimal::ZERO;

        for (category, amount) in profile.map(|p| &p.fixed_expenses).into_iter().flatten() {
            require_amount(category, *amount)?;
            let lowered = category.to_lowercase();
            let share = share_of(*amount, income);

            if (lowered.contains("rent") || lowered.contains("mortgage"))
                && *amount > percent_of(income, HOUSING_CAP_PERCENT)?
            {
                violations.push(format!(
                    "{} is {}% of income; the limit is {}%",
                    category, share, HOUSING_CAP_PERCENT
                ));
            }
            let is_vehicle = lowered.contains("vehicle")
                || lowered
                    .split(|c: char| !c.is_alphanumeric())
                    .any(|word| word == "car" || word == "auto");
            if is_vehicle && *amount > percent_of(income, VEHICLE_CAP_PERCENT)? {
                violations.push(format!(
                    "{} is {}% of income; the limit is {}%",
                    category, share, VEHICLE_CAP_PERCENT
                ));
            }

            if lowered.contains("grocer") {
                let household = profile.and_then(|p| p.household_size).unwrap_or(1).max(1);
                let limit = GROCERIES_PER_PERSON * Decimal::from(household);
                if *amount > limit {
                    violations.push(format!(
                        "{} of ${} exceeds ${} for a household of {}",
                        category, amount, limit, household
                    ));
                }
            }

            fixed_total = fixed_total
                .checked_add(*amount)
                .ok_or_else(|| amount_overflow("fixed expenses"))?;
            needs.insert(category.clone(), *amount);
        }

        if fixed_total < needs_target {
            needs.insert("essentials".to_string(), needs_target - fixed_total);
        }

        // Fixed costs above the needs target come out of wants, then investing, then debt.
        let mut overflow = (fixed_total - needs_target).max(Decimal::ZERO);
        for bucket in [&mut wants, &mut investing, &mut debt] {
            let take = overflow.min(*bucket);
            *bucket -= take;
            overflow -= take;
        }

        Ok(BudgetPayload {
            income,
            needs,
            wants: BTreeMap::from([("discretionary".to_string(), wants)]),
            debt_allocation: debt,
            investing_allocation: investing,
            emergency_fund_monthly: Decimal::ZERO,
            savings_goals_monthly: Decimal::ZERO,
            smart_goals: Vec::new(),
            violations,
        })
    }

    fn propose(&self, income: Decimal, profile: Option<&UserProfile>, label: &str) -> Result<Decision> {
        if income <= Decimal::ZERO {
            return Err(WorkflowError::PolicyViolation(format!(
                "cannot budget non-positive income {}",
                income
            )));
        }

        let payload = self.base_payload(income, profile)?;
        let decision = Decision::submit(
            ProposalType::Budget,
            budget_summary(label, &payload),
            format!(
                "{}/{}/{}/{} split of needs, wants, debt and investing",
                self.split.needs, self.split.wants, self.split.debt, self.split.investing
            ),
            &payload,
        )?;

        Ok(payload
            .violations
            .iter()
            .fold(decision, |d, v| d.with_suggestion(v.clone())))
    }

    fn overspend(&self, task: &AgentTask) -> Result<Decision> {
        let profile = task.context.user.as_ref();
        let Some(income) = profile.and_then(|p| p.monthly_income) else {
            return Ok(Decision::reply("No income on file; cannot re-evaluate the budget")
                .with_suggestion("Connect an income source so the budget can be re-evaluated"));
        };

        let mut payload = self.base_payload(income, profile)?;
        let cut = cut_wants(&mut payload, MAX_WANTS_CUT_PERCENT)?;
        payload.emergency_fund_monthly += cut;
        payload.smart_goals.push(format!(
            "Cut discretionary spending by ${} this month and rebuild the emergency fund with it",
            cut
        ));

        Decision::submit(
            ProposalType::Budget,
            budget_summary("Overspend re-evaluation", &payload),
            format!("Wants cut by {}% after a critical overspend", MAX_WANTS_CUT_PERCENT),
            &payload,
        )
    }

    fn revise(&self, previous: &Proposal, reason: &str, attempt: u32) -> Result<Decision> {
        let mut payload = previous_payload(previous, Proposal::budget, ProposalType::Budget)?.clone();
        let step = revision_step(attempt);
        let before = payload.wants_total();
        let cut = cut_wants(&mut payload, step)?;

        if cut.is_zero() {
            return Ok(Decision::reply("Wants are already at zero; nothing left to cut"));
        }

        let lowered = reason.to_lowercase();
        let destination = if lowered.contains("debt") {
            payload.debt_allocation += cut;
            "debt payoff"
        } else if ["invest", "retire", "401k", "ira"].iter().any(|k| lowered.contains(k)) {
            payload.investing_allocation += cut;
            "investing"
        } else if lowered.contains("sav") || lowered.contains("goal") {
            payload.savings_goals_monthly += cut;
            "savings goals"
        } else {
            payload.emergency_fund_monthly += cut;
            "the emergency fund"
        };

        payload.smart_goals.push(format!(
            "Reduce wants from ${} to ${} per month and send the ${} difference to {}",
            before,
            payload.wants_total(),
            cut,
            destination
        ));

        Decision::submit(
            ProposalType::Budget,
            budget_summary("Revised budget", &payload),
            format!("Addressing \"{}\": wants cut by {}%", reason, step),
            &payload,
        )
    }
}

impl Default for BudgetRulePolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Scale every wants category down by `percent`, returning the amount freed.
fn cut_wants(payload: &mut BudgetPayload, percent: Decimal) -> Result<Decimal> {
    let before = payload.wants_total();
    let keep = dec!(100) - percent;
    for amount in payload.wants.values_mut() {
        *amount = percent_of(*amount, keep)?;
    }
    Ok(before - payload.wants_total())
}

fn budget_summary(label: &str, payload: &BudgetPayload) -> String {
    format!(
        "{}: needs ${}, wants ${}, debt ${}, investing ${}",
        label,
        payload.needs_total(),
        payload.wants_total(),
        payload.debt_allocation,
        payload.investing_allocation
    )
}

#[async_trait]
impl Policy for BudgetRulePolicy {
    fn name(&self) -> &'static str {
        "budget_rules"
    }

    async fn decide(&self, task: &AgentTask, _tools: &[ToolSpec]) -> Result<Decision> {
        debug!(user_id = %task.user_id, "Budget rules deciding");

        match &task.event {
            TaskEvent::Paycheck { amount } => {
                self.propose(*amount, task.context.user.as_ref(), "Paycheck budget")
            }
            TaskEvent::Onboard { income } => {
                self.propose(*income, task.context.user.as_ref(), "Initial budget")
            }
            TaskEvent::Overspend => self.overspend(task),
            TaskEvent::ProposalApproved { proposal_id } => {
                Ok(Decision::execute(ProposalType::Budget, *proposal_id))
            }
            TaskEvent::ProposalRejected {
                previous,
                reason,
                attempt,
                ..
            } => self.revise(previous, reason, *attempt),
            event @ TaskEvent::BudgetApproved { .. } => Err(unexpected(ProposalType::Budget, event)),
        }
    }
}

//
// ================= Debt =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoffStrategy {
    /// Highest interest rate first.
    Avalanche,
    /// Smallest balance first.
    Snowball,
    /// Surplus split across debts by remaining balance.
    Proportional,
}

impl PayoffStrategy {
    fn label(&self) -> &'static str {
        match self {
            PayoffStrategy::Avalanche => "avalanche",
            PayoffStrategy::Snowball => "snowball",
            PayoffStrategy::Proportional => "proportional",
        }
    }

    fn order(&self, debts: &mut [DebtRecord]) {
        match self {
            PayoffStrategy::Snowball => debts.sort_by(|a, b| {
                a.balance
                    .cmp(&b.balance)
                    .then(b.interest_rate.cmp(&a.interest_rate))
            }),
            PayoffStrategy::Avalanche | PayoffStrategy::Proportional => debts.sort_by(|a, b| {
                b.interest_rate
                    .cmp(&a.interest_rate)
                    .then(a.balance.cmp(&b.balance))
            }),
        }
    }
}

pub struct DebtAvalanchePolicy;

impl DebtAvalanchePolicy {
    fn allocate(
        &self,
        debts: &[DebtRecord],
        amount: Decimal,
        strategy: PayoffStrategy,
        rationale: String,
    ) -> Result<Decision> {
        let mut ordered: Vec<DebtRecord> = debts
            .iter()
            .filter(|d| d.balance > Decimal::ZERO)
            .cloned()
            .collect();

        if ordered.is_empty() {
            return Ok(Decision::reply("No outstanding debts on file").with_suggestion(format!(
                "No outstanding debts: consider moving the ${} debt allocation to the emergency fund",
                amount
            )));
        }

        if amount > MAX_AMOUNT
            || ordered
                .iter()
                .any(|d| d.balance > MAX_AMOUNT || d.minimum_payment > MAX_AMOUNT)
        {
            return Err(WorkflowError::PreconditionFailed(format!(
                "debt amounts must be at most {}",
                MAX_AMOUNT
            )));
        }

        strategy.order(&mut ordered);

        let minimums: Vec<Decimal> = ordered
            .iter()
            .map(|d| d.minimum_payment.min(d.balance).max(Decimal::ZERO))
            .collect();
        let total_minimums: Decimal = minimums.iter().copied().sum();

        let mut payments = vec![Decimal::ZERO; ordered.len()];
        let mut remaining = amount;
        for (payment, minimum) in payments.iter_mut().zip(&minimums) {
            let pay = remaining.min(*minimum);
            *payment = pay;
            remaining -= pay;
        }

        if remaining > Decimal::ZERO {
            match strategy {
                PayoffStrategy::Avalanche | PayoffStrategy::Snowball => {
                    for (payment, debt) in payments.iter_mut().zip(&ordered) {
                        let extra = remaining.min(debt.balance - *payment);
                        *payment += extra;
                        remaining -= extra;
                    }
                }
                PayoffStrategy::Proportional => {
                    let outstanding: Decimal = ordered
                        .iter()
                        .zip(&payments)
                        .map(|(d, p)| d.balance - *p)
                        .sum();
                    let surplus = remaining;
                    if outstanding > Decimal::ZERO {
                        for (payment, debt) in payments.iter_mut().zip(&ordered) {
                            let headroom = debt.balance - *payment;
                            let extra = round_cents(surplus * headroom / outstanding)
                                .min(headroom)
                                .min(remaining);
                            *payment += extra;
                            remaining -= extra;
                        }
                    }
                    // Rounding residue goes to the first debt with headroom.
                    for (payment, debt) in payments.iter_mut().zip(&ordered) {
                        let extra = remaining.min(debt.balance - *payment);
                        *payment += extra;
                        remaining -= extra;
                    }
                }
            }
        }

        let payload = DebtPayload {
            ordered_debts: ordered
                .iter()
                .zip(&payments)
                .map(|(d, payment)| DebtLine {
                    debt_id: d.debt_id.clone(),
                    name: d.name.clone(),
                    balance: d.balance,
                    interest_rate: d.interest_rate,
                    minimum_payment: d.minimum_payment,
                    payment_amount: *payment,
                })
                .collect(),
            total_allocation: amount,
        };

        let summary = format!(
            "Debt plan ({}): {}",
            strategy.label(),
            payload
                .ordered_debts
                .iter()
                .map(|l| format!("{} ${}", l.name, l.payment_amount))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut decision = Decision::submit(ProposalType::Debt, summary, rationale, &payload)?;

        if amount < total_minimums {
            decision = decision.with_suggestion(format!(
                "Allocation ${} is below total minimum payments ${}; contact lenders about hardship programs",
                amount, total_minimums
            ));
        } else if remaining > Decimal::ZERO {
            decision = decision.with_suggestion(format!(
                "${} is left over after paying every balance; move it to savings",
                remaining
            ));
        }

        Ok(decision)
    }

    fn revision_strategy(reason: &str, attempt: u32) -> PayoffStrategy {
        let lowered = reason.to_lowercase();
        if lowered.contains("interest") || lowered.contains("avalanche") {
            PayoffStrategy::Avalanche
        } else if attempt == 0 || lowered.contains("smallest") || lowered.contains("snowball") {
            PayoffStrategy::Snowball
        } else {
            PayoffStrategy::Proportional
        }
    }
}

#[async_trait]
impl Policy for DebtAvalanchePolicy {
    fn name(&self) -> &'static str {
        "debt_avalanche"
    }

    async fn decide(&self, task: &AgentTask, _tools: &[ToolSpec]) -> Result<Decision> {
        match &task.event {
            TaskEvent::BudgetApproved { allocation, .. } => self.allocate(
                &task.context.debts,
                *allocation,
                PayoffStrategy::Avalanche,
                "Minimums first, surplus to the highest interest rate".to_string(),
            ),
            TaskEvent::ProposalApproved { proposal_id } => {
                Ok(Decision::execute(ProposalType::Debt, *proposal_id))
            }
            TaskEvent::ProposalRejected {
                previous,
                reason,
                attempt,
                ..
            } => {
                let rejected = previous_payload(previous, Proposal::debt, ProposalType::Debt)?;
                let strategy = Self::revision_strategy(reason, *attempt);
                self.allocate(
                    &task.context.debts,
                    rejected.total_allocation,
                    strategy,
                    format!("Addressing \"{}\" with {} ordering", reason, strategy.label()),
                )
            }
            event => Err(unexpected(ProposalType::Debt, event)),
        }
    }
}

//
// ================= Investing =================
//

pub struct InvestingPriorityPolicy {
    ira_monthly_cap: Decimal,
    roth_income_limit: Decimal,
    roth_phase_out_end: Decimal,
}

impl InvestingPriorityPolicy {
    pub fn new() -> Self {
        Self {
            ira_monthly_cap: dec!(583.33),
            roth_income_limit: dec!(150000),
            roth_phase_out_end: dec!(165000),
        }
    }

    fn ira_type(&self, profile: Option<&UserProfile>) -> IraType {
        match profile.and_then(|p| p.monthly_income).map(|m| m * dec!(12)) {
            Some(annual) if annual >= self.roth_phase_out_end => IraType::BackdoorRoth,
            Some(annual) if annual >= self.roth_income_limit => IraType::PartialRothIra,
            _ => IraType::RothIra,
        }
    }

    fn base_bond_percent(profile: Option<&UserProfile>) -> Decimal {
        let age = profile.and_then(|p| p.age).unwrap_or(30);
        Decimal::from(age.saturating_sub(30)).min(dec!(100))
    }

    fn payload(
        &self,
        amount: Decimal,
        k401: Decimal,
        ira: Decimal,
        ira_type: IraType,
        bond_percent: Decimal,
    ) -> Result<InvestingPayload> {
        let contributed = k401
            .checked_add(ira)
            .ok_or_else(|| amount_overflow("investing contributions"))?;
        let bonds = percent_of(contributed, bond_percent.clamp(Decimal::ZERO, dec!(100)))?;
        let stocks = contributed - bonds;
        let domestic = percent_of(stocks, dec!(80))?;
        let international = stocks - domestic;

        Ok(InvestingPayload {
            k401_monthly: k401,
            ira_monthly: ira,
            ira_type,
            fund_allocation: BTreeMap::from([
                (FUND_DOMESTIC.to_string(), domestic),
                (FUND_INTERNATIONAL.to_string(), international),
                (FUND_BONDS.to_string(), bonds),
            ]),
            total_allocation: amount,
        })
    }

    fn allocate(&self, amount: Decimal, profile: Option<&UserProfile>) -> Result<Decision> {
        if amount <= Decimal::ZERO {
            return Ok(Decision::reply("Nothing allocated to investing this period"));
        }
        require_amount("investing allocation", amount)?;

        let match_need = profile
            .and_then(|p| p.employer_match_monthly)
            .unwrap_or_default()
            .clamp(Decimal::ZERO, amount);
        let after_match = amount - match_need;
        let ira = after_match.min(self.ira_monthly_cap);
        let k401 = match_need + (after_match - ira);
        let ira_type = self.ira_type(profile);

        let payload = self.payload(amount, k401, ira, ira_type, Self::base_bond_percent(profile))?;

        Decision::submit(
            ProposalType::Investing,
            investing_summary(&payload),
            format!(
                "Employer match ${} first, {} up to ${}/month, remainder to the 401k",
                match_need, ira_type, self.ira_monthly_cap
            ),
            &payload,
        )
    }

    fn revise(&self, previous: &Proposal, reason: &str, attempt: u32, profile: Option<&UserProfile>) -> Result<Decision> {
        let rejected = previous_payload(previous, Proposal::investing, ProposalType::Investing)?;
        let step = revision_step(attempt);
        let contributed = rejected.k401_monthly + rejected.ira_monthly;
        let bond_percent = share_of(
            rejected.fund_allocation.get(FUND_BONDS).copied().unwrap_or_default(),
            contributed,
        );

        let lowered = reason.to_lowercase();
        let wants_safety = ["risk", "safe", "conservative", "bond", "volatil"]
            .iter()
            .any(|k| lowered.contains(k));

        let match_floor = profile
            .and_then(|p| p.employer_match_monthly)
            .unwrap_or_default()
            .min(rejected.k401_monthly);
        let shift = percent_of(contributed, step)?;

        let (k401, ira, bonds, change) = if wants_safety {
            (
                rejected.k401_monthly,
                rejected.ira_monthly,
                (bond_percent + step).min(dec!(100)),
                format!("bonds raised to {}%", (bond_percent + step).min(dec!(100))),
            )
        } else if rejected.ira_monthly > Decimal::ZERO {
            let moved = shift.min(rejected.ira_monthly);
            (
                rejected.k401_monthly + moved,
                rejected.ira_monthly - moved,
                bond_percent,
                format!("${} moved from the IRA to the 401k", moved),
            )
        } else {
            let room = (self.ira_monthly_cap - rejected.ira_monthly).max(Decimal::ZERO);
            let moved = shift.min(rejected.k401_monthly - match_floor).min(room);
            (
                rejected.k401_monthly - moved,
                rejected.ira_monthly + moved,
                bond_percent,
                format!("${} moved from the 401k to the IRA", moved),
            )
        };

        let payload = self.payload(rejected.total_allocation, k401, ira, rejected.ira_type, bonds)?;

        Decision::submit(
            ProposalType::Investing,
            investing_summary(&payload),
            format!("Addressing \"{}\": {}", reason, change),
            &payload,
        )
    }
}

impl Default for InvestingPriorityPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn investing_summary(payload: &InvestingPayload) -> String {
    format!(
        "401k ${}/month, {} ${}/month, funds {}",
        payload.k401_monthly,
        payload.ira_type,
        payload.ira_monthly,
        payload
            .fund_allocation
            .iter()
            .map(|(fund, amount)| format!("{} ${}", fund, amount))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

#[async_trait]
impl Policy for InvestingPriorityPolicy {
    fn name(&self) -> &'static str {
        "investing_priority"
    }

    async fn decide(&self, task: &AgentTask, _tools: &[ToolSpec]) -> Result<Decision> {
        let profile = task.context.user.as_ref();

        match &task.event {
            TaskEvent::BudgetApproved { allocation, .. } => self.allocate(*allocation, profile),
            TaskEvent::ProposalApproved { proposal_id } => {
                Ok(Decision::execute(ProposalType::Investing, *proposal_id))
            }
            TaskEvent::ProposalRejected {
                previous,
                reason,
                attempt,
                ..
            } => self.revise(previous, reason, *attempt, profile),
            event => Err(unexpected(ProposalType::Investing, event)),
        }
    }
}
