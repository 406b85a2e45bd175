//! Financial Agent Workflow
//!
//! Three agents (Budget, Debt, Investing) jointly manage a user's
//! personal-finance plan:
//! - Agents propose allocations; a human approves or rejects
//! - Only approved proposals are executed, via a conditional status update
//! - A budget approval fans out to the Debt and Investing agents concurrently
//! - A rejection re-invokes the originating agent with the reason
//! - Every handled event is audited
//!
//! PROPOSAL LIFECYCLE:
//! pending → approved → executed
//! pending → rejected → (revised proposal)

pub mod agent;
pub mod api;
pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod gemini;
pub mod lifecycle;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod state;
pub mod tools;
pub mod verification;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::{AgentPolicies, WorkflowOrchestrator, WorkflowSettings};
