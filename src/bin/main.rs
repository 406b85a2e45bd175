use chrono::Utc;
use financial_agent_workflow::{
    orchestrator::{RespondRequest, RespondResponse},
    state::{InMemoryRecordStore, RecordStore},
    AgentPolicies, DebtRecord, UserProfile, WorkflowOrchestrator, WorkflowSettings,
};
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const USER: &str = "demo-user";

fn respond(proposal_id: Uuid, kind: &str, approved: bool, reason: Option<&str>) -> RespondRequest {
    RespondRequest {
        proposal_id,
        user_id: USER.to_string(),
        kind: kind.to_string(),
        approved,
        reason: reason.map(str::to_string),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Financial Agent Workflow demo starting");

    let store = Arc::new(InMemoryRecordStore::new());
    store
        .put_user(UserProfile {
            user_id: USER.to_string(),
            name: Some("Demo".to_string()),
            monthly_income: Some(dec!(5000)),
            age: Some(34),
            household_size: Some(1),
            employer_match_monthly: Some(dec!(200)),
            fixed_expenses: BTreeMap::from([("rent".to_string(), dec!(1400))]),
        })
        .await?;
    for (debt_id, name, balance, rate, minimum) in [
        ("visa", "Visa", dec!(2400), dec!(24.99), dec!(60)),
        ("car", "Car loan", dec!(9000), dec!(6.5), dec!(250)),
    ] {
        store
            .put_debt(DebtRecord {
                user_id: USER.to_string(),
                debt_id: debt_id.to_string(),
                name: name.to_string(),
                balance,
                interest_rate: rate,
                minimum_payment: minimum,
                last_payment_date: None,
                updated_at: Utc::now(),
            })
            .await?;
    }

    let orchestrator = WorkflowOrchestrator::new(
        store.clone(),
        AgentPolicies::rules(),
        WorkflowSettings::default(),
    );

    // Stage 1: initial budget, rejected once, then approved.
    let onboarded = orchestrator.onboard(USER, dec!(5000), None).await?;
    let first = onboarded.proposal_id.ok_or("no budget proposed")?;
    println!("\n=== INITIAL BUDGET ===\n{}", onboarded.result.reply);

    let revised = match orchestrator
        .respond(respond(first, "budget", false, Some("wants too high, more for debt")))
        .await?
    {
        RespondResponse::Single(r) => r.result.submitted.ok_or("no revision submitted")?,
        RespondResponse::FanOut(_) => return Err("unexpected fan-out on rejection".into()),
    };
    println!("\n=== REVISED BUDGET ===\n{}", orchestrator.get_proposal(revised).await?.summary);

    // Stage 2: approval fans out to Debt and Investing.
    let RespondResponse::FanOut(fan) = orchestrator
        .respond(respond(revised, "budget", true, None))
        .await?
    else {
        return Err("expected downstream fan-out".into());
    };
    println!(
        "\n=== DOWNSTREAM ===\ndebt ${} -> {:?}\ninvesting ${} -> {:?}",
        fan.debt_allocation,
        fan.debt_result.result.as_ref().map(|r| &r.reply),
        fan.investing_allocation,
        fan.investing_result.result.as_ref().map(|r| &r.reply),
    );

    for (kind, outcome) in [("debt", &fan.debt_result), ("investing", &fan.investing_result)] {
        if let Some(id) = outcome.result.as_ref().and_then(|r| r.submitted) {
            orchestrator.respond(respond(id, kind, true, None)).await?;
        }
    }

    println!("\n=== BALANCES ===");
    for debt in store.list_debts(USER).await? {
        println!("  {:<10} ${}", debt.name, debt.balance);
    }
    for account in store.list_investments(USER).await? {
        println!("  {:<10} ${}", account.account_id, account.balance);
    }

    println!(
        "\nCycle state: {}",
        serde_json::to_string(&orchestrator.cycle_state(USER).await?)?
    );
    println!(
        "Audit records: {}",
        orchestrator.audit_log().list_for_user(USER).await?.len()
    );

    Ok(())
}
