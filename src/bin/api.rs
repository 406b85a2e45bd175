use financial_agent_workflow::{
    api::start_server,
    config::{AppConfig, PolicyKind},
    state::{InMemoryRecordStore, PgRecordStore, RecordStore},
    AgentPolicies, WorkflowOrchestrator,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    info!("Financial Agent Workflow - API Server");
    info!(port = config.port, policy = ?config.policy, "Configuration loaded");

    let store: Arc<dyn RecordStore> = match &config.database_url {
        Some(url) => Arc::new(PgRecordStore::connect_lazy(url)?),
        None => {
            warn!("DATABASE_URL not set - using the in-memory record store");
            Arc::new(InMemoryRecordStore::new())
        }
    };

    let policies = match (config.policy, config.gemini_api_key.as_deref()) {
        (PolicyKind::Llm, Some(key)) => AgentPolicies::llm(key)?,
        _ => AgentPolicies::rules(),
    };

    let orchestrator = Arc::new(WorkflowOrchestrator::new(store, policies, config.settings.clone()));

    info!("Orchestrator initialized");

    start_server(orchestrator, config.port).await?;

    Ok(())
}
