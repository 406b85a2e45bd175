//! Verification engine for proposal payloads
//!
//! Rules-based checks run before a proposal is stored.
//! Deterministic enforcement; nothing here calls an agent.

use crate::models::{checked_total, ProposalPayload, MAX_AMOUNT};
use crate::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

/// Slack allowed when comparing sums of rounded cent amounts.
const CENT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// `total <= limit` within a cent. A sum that overflowed never fits.
fn fits_within(total: Option<Decimal>, limit: Decimal) -> bool {
    match (total, limit.checked_add(CENT_TOLERANCE)) {
        (Some(total), Some(limit)) => total <= limit,
        _ => false,
    }
}

fn show(total: Option<Decimal>) -> String {
    total.map_or_else(|| "overflow".to_string(), |t| t.to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceCheck {
    pub rule_name: String,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub risk_level: RiskLevel,
    pub compliance_checks: Vec<ComplianceCheck>,
    pub issues: Vec<String>,
    pub verified_at: DateTime<Utc>,
}

/// Trait for verification rules
pub trait VerificationRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Risk severity if this rule fails
    fn risk_level(&self) -> RiskLevel;

    fn verify(&self, payload: &ProposalPayload) -> VerificationCheckResult;
}

pub struct VerificationCheckResult {
    pub passed: bool,
    pub details: String,
}

impl VerificationCheckResult {
    fn pass(details: impl Into<String>) -> Self {
        Self {
            passed: true,
            details: details.into(),
        }
    }

    fn fail(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

/// Verification engine that enforces rules
pub struct VerificationEngine {
    rules: Vec<Box<dyn VerificationRule>>,
}

impl VerificationEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn VerificationRule>) {
        self.rules.push(rule);
    }

    /// Verify a proposal payload (sync, no await)
    pub fn verify(&self, payload: &ProposalPayload) -> Result<VerificationResult> {
        let mut compliance_checks = Vec::with_capacity(self.rules.len());
        let mut issues = Vec::new();
        let mut max_risk = RiskLevel::Low;

        for rule in &self.rules {
            let result = rule.verify(payload);

            if !result.passed {
                issues.push(format!("{}: {}", rule.name(), result.details));
                max_risk = std::cmp::max(max_risk, rule.risk_level());
            }

            compliance_checks.push(ComplianceCheck {
                rule_name: rule.name().to_string(),
                passed: result.passed,
                details: result.details,
            });
        }

        let verified = issues.is_empty();

        debug!(
            kind = %payload.kind(),
            rule_count = self.rules.len(),
            verified = verified,
            "Proposal verification completed"
        );

        Ok(VerificationResult {
            verified,
            risk_level: max_risk,
            compliance_checks,
            issues,
            verified_at: Utc::now(),
        })
    }
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= RiskLevel Ordering =================
//

impl PartialOrd for RiskLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RiskLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl RiskLevel {
    fn rank(&self) -> u8 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
            RiskLevel::Critical => 3,
        }
    }
}

//
// ================= Rules =================
//

/// Rule: every amount in the payload lies in `0..=MAX_AMOUNT`
pub struct AmountRangeRule;

impl VerificationRule for AmountRangeRule {
    fn name(&self) -> &'static str {
        "amounts_in_range"
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Critical
    }

    fn verify(&self, payload: &ProposalPayload) -> VerificationCheckResult {
        let fields = payload.money_fields();
        let negative: Vec<&str> = fields
            .iter()
            .filter(|(_, amount)| **amount < Decimal::ZERO)
            .map(|(path, _)| path.as_str())
            .collect();
        let oversized: Vec<&str> = fields
            .iter()
            .filter(|(_, amount)| **amount > MAX_AMOUNT)
            .map(|(path, _)| path.as_str())
            .collect();

        match (negative.is_empty(), oversized.is_empty()) {
            (true, true) => VerificationCheckResult::pass("All amounts in range"),
            (false, _) => {
                VerificationCheckResult::fail(format!("Negative amounts: {}", negative.join(", ")))
            }
            (true, false) => VerificationCheckResult::fail(format!(
                "Amounts above {}: {}",
                MAX_AMOUNT,
                oversized.join(", ")
            )),
        }
    }
}

/// Rule: a budget never hands out more than the income it splits
pub struct BudgetWithinIncomeRule;

impl VerificationRule for BudgetWithinIncomeRule {
    fn name(&self) -> &'static str {
        "budget_within_income"
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn verify(&self, payload: &ProposalPayload) -> VerificationCheckResult {
        let ProposalPayload::Budget(budget) = payload else {
            return VerificationCheckResult::pass("Not a budget");
        };

        let allocated = budget.allocated_total();
        if fits_within(allocated, budget.income) {
            VerificationCheckResult::pass(format!(
                "Allocated {} of {} income",
                show(allocated),
                budget.income
            ))
        } else {
            VerificationCheckResult::fail(format!(
                "Allocated {} exceeds income {}",
                show(allocated),
                budget.income
            ))
        }
    }
}

/// Rule: debt payments stay inside the allocation and name each debt once
pub struct DebtPaymentsWithinAllocationRule;

impl VerificationRule for DebtPaymentsWithinAllocationRule {
    fn name(&self) -> &'static str {
        "debt_payments_within_allocation"
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn verify(&self, payload: &ProposalPayload) -> VerificationCheckResult {
        let ProposalPayload::Debt(debt) = payload else {
            return VerificationCheckResult::pass("Not a debt allocation");
        };

        let mut seen = HashSet::new();
        if let Some(dup) = debt
            .ordered_debts
            .iter()
            .find(|line| !seen.insert(line.debt_id.as_str()))
        {
            return VerificationCheckResult::fail(format!("Debt {} listed twice", dup.debt_id));
        }

        let paid = checked_total(debt.ordered_debts.iter().map(|l| l.payment_amount));
        if fits_within(paid, debt.total_allocation) {
            VerificationCheckResult::pass(format!(
                "Payments {} within allocation {}",
                show(paid),
                debt.total_allocation
            ))
        } else {
            VerificationCheckResult::fail(format!(
                "Payments {} exceed allocation {}",
                show(paid),
                debt.total_allocation
            ))
        }
    }
}

/// Rule: account contributions and the fund split stay inside the allocation
pub struct InvestingWithinAllocationRule;

impl VerificationRule for InvestingWithinAllocationRule {
    fn name(&self) -> &'static str {
        "investing_within_allocation"
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn verify(&self, payload: &ProposalPayload) -> VerificationCheckResult {
        let ProposalPayload::Investing(investing) = payload else {
            return VerificationCheckResult::pass("Not an investing allocation");
        };

        let contributed = investing.k401_monthly.checked_add(investing.ira_monthly);
        if !fits_within(contributed, investing.total_allocation) {
            return VerificationCheckResult::fail(format!(
                "Contributions {} exceed allocation {}",
                show(contributed),
                investing.total_allocation
            ));
        }

        let funds = checked_total(investing.fund_allocation.values().copied());
        if !fits_within(funds, investing.total_allocation) {
            return VerificationCheckResult::fail(format!(
                "Fund split {} exceeds allocation {}",
                show(funds),
                investing.total_allocation
            ));
        }

        VerificationCheckResult::pass(format!(
            "Contributions {} within allocation {}",
            show(contributed),
            investing.total_allocation
        ))
    }
}

/// Create a default verification engine with standard rules
pub fn create_default_verification_engine() -> VerificationEngine {
    let mut engine = VerificationEngine::new();
    engine.add_rule(Box::new(AmountRangeRule));
    engine.add_rule(Box::new(BudgetWithinIncomeRule));
    engine.add_rule(Box::new(DebtPaymentsWithinAllocationRule));
    engine.add_rule(Box::new(InvestingWithinAllocationRule));
    engine
}

//
// ================= Tests =================
//

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use crate::models::{BudgetPayload, DebtLine, DebtPayload, InvestingPayload, IraType};
    use std::collections::BTreeMap;

    fn budget(income: Decimal, wants: Decimal) -> ProposalPayload {
        ProposalPayload::Budget(BudgetPayload {
            income,
            needs: BTreeMap::from([("rent".to_string(), dec!(2500))]),
            wants: BTreeMap::from([("dining".to_string(), wants)]),
            debt_allocation: dec!(500),
            investing_allocation: dec!(1000),
            emergency_fund_monthly: Decimal::ZERO,
            savings_goals_monthly: Decimal::ZERO,
            smart_goals: vec![],
            violations: vec![],
        })
    }

    #[test]
    fn test_budget_verification() {
        let engine = create_default_verification_engine();

        let ok = engine.verify(&budget(dec!(5000), dec!(1000))).unwrap();
        assert!(ok.verified);
        assert_eq!(ok.compliance_checks.len(), 4);

        let over = engine.verify(&budget(dec!(5000), dec!(1200))).unwrap();
        assert!(!over.verified);
        assert_eq!(over.risk_level, RiskLevel::High);
        assert!(over.issues[0].starts_with("budget_within_income"));
    }

    #[test]
    fn test_negative_amount_is_critical() {
        let engine = create_default_verification_engine();
        let result = engine.verify(&budget(dec!(5000), dec!(-50))).unwrap();

        assert!(!result.verified);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(result.issues.iter().any(|i| i.contains("wants.dining")));
    }

    #[test]
    fn test_oversized_amounts_fail_without_overflow() {
        let engine = create_default_verification_engine();

        let result = engine.verify(&budget(Decimal::MAX, Decimal::MAX)).unwrap();
        assert!(!result.verified);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(result
            .issues
            .iter()
            .any(|i| i.starts_with("amounts_in_range") && i.contains("income")));
        assert!(result
            .issues
            .iter()
            .any(|i| i.starts_with("budget_within_income") && i.contains("overflow")));

        let payload = ProposalPayload::Investing(InvestingPayload {
            k401_monthly: Decimal::MAX,
            ira_monthly: Decimal::MAX,
            ira_type: IraType::RothIra,
            fund_allocation: BTreeMap::from([("total_bond".to_string(), Decimal::MAX)]),
            total_allocation: Decimal::MAX,
        });
        assert!(!engine.verify(&payload).unwrap().verified);
    }

    #[test]
    fn test_debt_rules() {
        let line = |id: &str, pay: Decimal| DebtLine {
            debt_id: id.to_string(),
            name: id.to_string(),
            balance: dec!(1000),
            interest_rate: dec!(20),
            minimum_payment: dec!(25),
            payment_amount: pay,
        };
        let engine = create_default_verification_engine();

        let over = ProposalPayload::Debt(DebtPayload {
            ordered_debts: vec![line("visa", dec!(400)), line("car", dec!(200))],
            total_allocation: dec!(500),
        });
        assert!(!engine.verify(&over).unwrap().verified);

        let dup = ProposalPayload::Debt(DebtPayload {
            ordered_debts: vec![line("visa", dec!(100)), line("visa", dec!(100))],
            total_allocation: dec!(500),
        });
        let result = engine.verify(&dup).unwrap();
        assert!(result.issues.iter().any(|i| i.contains("listed twice")));
    }

    #[test]
    fn test_investing_rules() {
        let engine = create_default_verification_engine();
        let payload = ProposalPayload::Investing(InvestingPayload {
            k401_monthly: dec!(600),
            ira_monthly: dec!(500),
            ira_type: IraType::RothIra,
            fund_allocation: BTreeMap::new(),
            total_allocation: dec!(1000),
        });

        let result = engine.verify(&payload).unwrap();
        assert!(!result.verified);
        assert!(result.issues[0].contains("exceed allocation"));
    }
}
