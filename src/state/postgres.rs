//! Postgres-backed record store
//!
//! Status transitions are single conditional UPDATEs; execution commits run
//! in one transaction so balance deltas and the executed mark land together.

use super::{invalid_transition, proposal_not_found, BalanceMutation, RecordStore, StatusChange};
use crate::error::WorkflowError;
use crate::models::{
    BranchDispatch, DebtRecord, Goals, InvestmentAccount, IraType, Proposal, ProposalPayload,
    ProposalStatus, ProposalType, UserProfile,
};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
      user_id TEXT PRIMARY KEY,
      profile JSONB NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS goals (
      user_id TEXT PRIMARY KEY,
      goals JSONB NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS debts (
      user_id TEXT NOT NULL,
      debt_id TEXT NOT NULL,
      name TEXT NOT NULL,
      balance NUMERIC(14, 2) NOT NULL,
      interest_rate NUMERIC(7, 4) NOT NULL,
      minimum_payment NUMERIC(14, 2) NOT NULL,
      last_payment_date TIMESTAMPTZ,
      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      PRIMARY KEY (user_id, debt_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS investments (
      user_id TEXT NOT NULL,
      account_id TEXT NOT NULL,
      balance NUMERIC(14, 2) NOT NULL DEFAULT 0,
      ira_type TEXT,
      last_contribution_date TIMESTAMPTZ,
      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      PRIMARY KEY (user_id, account_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS proposals (
      proposal_id UUID PRIMARY KEY,
      user_id TEXT NOT NULL,
      kind TEXT NOT NULL,
      status TEXT NOT NULL,
      summary TEXT NOT NULL,
      rationale TEXT NOT NULL,
      payload JSONB NOT NULL,
      total_allocation NUMERIC(14, 2) NOT NULL,
      rejection_reason TEXT,
      created_at TIMESTAMPTZ NOT NULL,
      updated_at TIMESTAMPTZ NOT NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_proposals_user_time
    ON proposals (user_id, created_at);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS branch_dispatches (
      dispatch_id BIGSERIAL PRIMARY KEY,
      budget_proposal_id UUID NOT NULL,
      user_id TEXT NOT NULL,
      kind TEXT NOT NULL,
      succeeded BOOLEAN NOT NULL,
      proposal_id UUID,
      error TEXT,
      recorded_at TIMESTAMPTZ NOT NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_branch_dispatches_budget
    ON branch_dispatches (budget_proposal_id, dispatch_id);
    "#,
];

const PROPOSAL_COLUMNS: &str = "proposal_id, user_id, kind, status, summary, rationale, payload, \
     total_allocation, rejection_reason, created_at, updated_at";

pub struct PgRecordStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    /// Lazily connects; the schema is created on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| db_error("Failed to configure postgres pool", e))?;

        info!("Record store backend: postgres");
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| db_error("Failed to initialize record store schema", e))?;

        Ok(())
    }
}

fn db_error(context: &str, e: sqlx::Error) -> WorkflowError {
    WorkflowError::DatabaseError(format!("{}: {}", context, e))
}

fn proposal_from_row(row: &PgRow) -> Result<Proposal> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let Json(payload): Json<ProposalPayload> = row.try_get("payload")?;

    Ok(Proposal {
        proposal_id: row.try_get("proposal_id")?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse::<ProposalType>()?,
        status: status.parse::<ProposalStatus>()?,
        summary: row.try_get("summary")?,
        rationale: row.try_get("rationale")?,
        payload,
        total_allocation: row.try_get("total_allocation")?,
        rejection_reason: row.try_get("rejection_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn debt_from_row(row: &PgRow) -> Result<DebtRecord> {
    Ok(DebtRecord {
        user_id: row.try_get("user_id")?,
        debt_id: row.try_get("debt_id")?,
        name: row.try_get("name")?,
        balance: row.try_get("balance")?,
        interest_rate: row.try_get("interest_rate")?,
        minimum_payment: row.try_get("minimum_payment")?,
        last_payment_date: row.try_get("last_payment_date")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn dispatch_from_row(row: &PgRow) -> Result<BranchDispatch> {
    let kind: String = row.try_get("kind")?;

    Ok(BranchDispatch {
        budget_proposal_id: row.try_get("budget_proposal_id")?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse::<ProposalType>()?,
        succeeded: row.try_get("succeeded")?,
        proposal_id: row.try_get("proposal_id")?,
        error: row.try_get("error")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn investment_from_row(row: &PgRow) -> Result<InvestmentAccount> {
    let ira_type: Option<String> = row.try_get("ira_type")?;

    Ok(InvestmentAccount {
        user_id: row.try_get("user_id")?,
        account_id: row.try_get("account_id")?,
        balance: row.try_get("balance")?,
        ira_type: ira_type.map(|t| t.parse::<IraType>()).transpose()?,
        last_contribution_date: row.try_get("last_contribution_date")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait::async_trait]
impl RecordStore for PgRecordStore {
    async fn put_user(&self, user: UserProfile) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO users (user_id, profile) VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET profile = EXCLUDED.profile
            "#,
        )
        .bind(&user.user_id)
        .bind(Json(&user))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to store user", e))?;

        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT profile FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load user", e))?;

        match row {
            Some(row) => {
                let Json(profile): Json<UserProfile> = row.try_get("profile")?;
                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    async fn put_goals(&self, user_id: &str, goals: Goals) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO goals (user_id, goals) VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET goals = EXCLUDED.goals
            "#,
        )
        .bind(user_id)
        .bind(Json(&goals))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to store goals", e))?;

        Ok(())
    }

    async fn get_goals(&self, user_id: &str) -> Result<Goals> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT goals FROM goals WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load goals", e))?;

        match row {
            Some(row) => {
                let Json(goals): Json<Goals> = row.try_get("goals")?;
                Ok(goals)
            }
            None => Ok(Goals::new()),
        }
    }

    async fn put_debt(&self, debt: DebtRecord) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO debts
              (user_id, debt_id, name, balance, interest_rate, minimum_payment, last_payment_date, updated_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, debt_id) DO UPDATE SET
              name = EXCLUDED.name,
              balance = EXCLUDED.balance,
              interest_rate = EXCLUDED.interest_rate,
              minimum_payment = EXCLUDED.minimum_payment,
              last_payment_date = EXCLUDED.last_payment_date,
              updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&debt.user_id)
        .bind(&debt.debt_id)
        .bind(&debt.name)
        .bind(debt.balance)
        .bind(debt.interest_rate)
        .bind(debt.minimum_payment)
        .bind(debt.last_payment_date)
        .bind(debt.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to store debt", e))?;

        Ok(())
    }

    async fn list_debts(&self, user_id: &str) -> Result<Vec<DebtRecord>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT user_id, debt_id, name, balance, interest_rate, minimum_payment, last_payment_date, updated_at
            FROM debts
            WHERE user_id = $1
            ORDER BY debt_id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load debts", e))?;

        rows.iter().map(debt_from_row).collect()
    }

    async fn put_investment(&self, account: InvestmentAccount) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO investments
              (user_id, account_id, balance, ira_type, last_contribution_date, updated_at)
            VALUES
              ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, account_id) DO UPDATE SET
              balance = EXCLUDED.balance,
              ira_type = EXCLUDED.ira_type,
              last_contribution_date = EXCLUDED.last_contribution_date,
              updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&account.user_id)
        .bind(&account.account_id)
        .bind(account.balance)
        .bind(account.ira_type.map(|t| t.as_str()))
        .bind(account.last_contribution_date)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to store investment account", e))?;

        Ok(())
    }

    async fn list_investments(&self, user_id: &str) -> Result<Vec<InvestmentAccount>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT user_id, account_id, balance, ira_type, last_contribution_date, updated_at
            FROM investments
            WHERE user_id = $1
            ORDER BY account_id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load investment accounts", e))?;

        rows.iter().map(investment_from_row).collect()
    }

    async fn insert_proposal(&self, proposal: &Proposal) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO proposals
              (proposal_id, user_id, kind, status, summary, rationale, payload, total_allocation, rejection_reason, created_at, updated_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(proposal.proposal_id)
        .bind(&proposal.user_id)
        .bind(proposal.kind.as_str())
        .bind(proposal.status.as_str())
        .bind(&proposal.summary)
        .bind(&proposal.rationale)
        .bind(Json(&proposal.payload))
        .bind(proposal.total_allocation)
        .bind(&proposal.rejection_reason)
        .bind(proposal.created_at)
        .bind(proposal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert proposal", e))?;

        Ok(())
    }

    async fn get_proposal(&self, proposal_id: Uuid) -> Result<Option<Proposal>> {
        self.ensure_schema().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM proposals WHERE proposal_id = $1",
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load proposal", e))?;

        row.as_ref().map(proposal_from_row).transpose()
    }

    async fn list_proposals(
        &self,
        user_id: &str,
        kind: Option<ProposalType>,
    ) -> Result<Vec<Proposal>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM proposals \
             WHERE user_id = $1 AND ($2::TEXT IS NULL OR kind = $2) \
             ORDER BY created_at ASC",
            PROPOSAL_COLUMNS
        ))
        .bind(user_id)
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list proposals", e))?;

        rows.iter().map(proposal_from_row).collect()
    }

    async fn transition_proposal(
        &self,
        proposal_id: Uuid,
        change: StatusChange,
    ) -> Result<Proposal> {
        self.ensure_schema().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE proposals
            SET status = $3,
                rejection_reason = CASE WHEN $3 = 'rejected' THEN COALESCE($4, '') ELSE rejection_reason END,
                updated_at = GREATEST(updated_at, $5)
            WHERE proposal_id = $1 AND status = $2
            RETURNING {}
            "#,
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .bind(change.expected.as_str())
        .bind(change.next.as_str())
        .bind(&change.rejection_reason)
        .bind(change.at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update proposal status", e))?;

        if let Some(row) = row {
            debug!(proposal_id = %proposal_id, status = %change.next, "Proposal status updated");
            return proposal_from_row(&row);
        }

        // Zero rows: distinguish a missing proposal from a lost race.
        match self.get_proposal(proposal_id).await? {
            Some(current) => Err(invalid_transition(proposal_id, current.status, change.next)),
            None => Err(proposal_not_found(proposal_id)),
        }
    }

    async fn commit_execution(
        &self,
        proposal_id: Uuid,
        mutations: &[BalanceMutation],
        at: DateTime<Utc>,
    ) -> Result<Proposal> {
        self.ensure_schema().await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin execution transaction", e))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE proposals
            SET status = 'executed', updated_at = GREATEST(updated_at, $2)
            WHERE proposal_id = $1 AND status = 'approved'
            RETURNING {}
            "#,
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to mark proposal executed", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back execution", e))?;
            return match self.get_proposal(proposal_id).await? {
                Some(current) => Err(invalid_transition(
                    proposal_id,
                    current.status,
                    ProposalStatus::Executed,
                )),
                None => Err(proposal_not_found(proposal_id)),
            };
        };
        let proposal = proposal_from_row(&row)?;

        for mutation in mutations {
            match mutation {
                BalanceMutation::DebtPayment { debt_id, amount } => {
                    let result = sqlx::query(
                        r#"
                        UPDATE debts
                        SET balance = balance - $3, last_payment_date = $4, updated_at = $4
                        WHERE user_id = $1 AND debt_id = $2
                        "#,
                    )
                    .bind(&proposal.user_id)
                    .bind(debt_id)
                    .bind(*amount)
                    .bind(at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("Failed to apply debt payment", e))?;

                    if result.rows_affected() == 0 {
                        tx.rollback()
                            .await
                            .map_err(|e| db_error("Failed to roll back execution", e))?;
                        return Err(WorkflowError::NotFound(format!(
                            "Debt {} not found for user {}",
                            debt_id, proposal.user_id
                        )));
                    }
                }
                BalanceMutation::Contribution {
                    account_id,
                    amount,
                    ira_type,
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO investments
                          (user_id, account_id, balance, ira_type, last_contribution_date, updated_at)
                        VALUES
                          ($1, $2, $3, $4, $5, $5)
                        ON CONFLICT (user_id, account_id) DO UPDATE SET
                          balance = investments.balance + EXCLUDED.balance,
                          ira_type = COALESCE(EXCLUDED.ira_type, investments.ira_type),
                          last_contribution_date = EXCLUDED.last_contribution_date,
                          updated_at = EXCLUDED.updated_at
                        "#,
                    )
                    .bind(&proposal.user_id)
                    .bind(account_id)
                    .bind(*amount)
                    .bind(ira_type.map(|t| t.as_str()))
                    .bind(at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("Failed to apply contribution", e))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit execution", e))?;

        debug!(
            proposal_id = %proposal_id,
            mutation_count = mutations.len(),
            "Execution committed"
        );

        Ok(proposal)
    }

    async fn record_dispatch(&self, dispatch: &BranchDispatch) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO branch_dispatches
              (budget_proposal_id, user_id, kind, succeeded, proposal_id, error, recorded_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(dispatch.budget_proposal_id)
        .bind(&dispatch.user_id)
        .bind(dispatch.kind.as_str())
        .bind(dispatch.succeeded)
        .bind(dispatch.proposal_id)
        .bind(&dispatch.error)
        .bind(dispatch.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to record branch dispatch", e))?;

        Ok(())
    }

    async fn list_dispatches(&self, budget_proposal_id: Uuid) -> Result<Vec<BranchDispatch>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT budget_proposal_id, user_id, kind, succeeded, proposal_id, error, recorded_at
            FROM branch_dispatches
            WHERE budget_proposal_id = $1
            ORDER BY dispatch_id ASC
            "#,
        )
        .bind(budget_proposal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list branch dispatches", e))?;

        rows.iter().map(dispatch_from_row).collect()
    }
}
