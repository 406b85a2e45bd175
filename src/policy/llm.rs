//! Gemini-backed agent policy
//!
//! The model is shown the task text and the agent's tools and must answer
//! with a JSON decision. Nothing it returns is trusted beyond that shape:
//! the agent still validates every call before running it.

use super::{AgentTask, Decision, Policy};
use crate::error::WorkflowError;
use crate::gemini::GeminiClient;
use crate::models::ProposalType;
use crate::tools::ToolSpec;
use crate::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

pub struct LlmPolicy {
    kind: ProposalType,
    client: GeminiClient,
}

impl LlmPolicy {
    pub fn new(kind: ProposalType, api_key: String) -> Result<Self> {
        Ok(Self {
            kind,
            client: GeminiClient::new(api_key)?,
        })
    }

    pub fn with_client(kind: ProposalType, client: GeminiClient) -> Self {
        Self { kind, client }
    }

    fn build_prompt(&self, task: &AgentTask, tools: &[ToolSpec]) -> String {
        let tool_lines: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}\n  parameters: {}", t.name, t.description, t.parameters))
            .collect();

        format!(
            r#"TASK:
{}

Available tools:
{}

Rules:
- Return ONLY valid JSON, no explanation text
- Never include userId; it is filled in for you
- At most one submit call per answer
- Only call an execute tool when the task says the proposal was APPROVED
- Money amounts are plain numbers in dollars

JSON format:
{{
  "calls": [{{ "tool": "<tool name>", "parameters": {{ ... }} }}],
  "reply": "<short message for the user>"
}}
"#,
            task.text,
            tool_lines.join("\n")
        )
    }
}

fn system_prompt(kind: ProposalType) -> &'static str {
    match kind {
        ProposalType::Budget => {
            r#"You are the Budget Agent for a personal finance platform.
Split take-home income into needs, wants, debt repayment and investing.
Treat 50/30/20 as a starting point and adapt it to the user's goals.
Always allocate something to investing. Needs are never cut; wants are the lever.
Flag rent or mortgage above 30% of income, vehicle costs above 15% and groceries above $300 per person.
Recommend changes as SMART goals and never cut a category by more than 25% at once.
After a rejection, address the stated reason and never re-submit the rejected numbers."#
        }
        ProposalType::Debt => {
            r#"You are the Debt Agent for a personal finance platform.
You receive the per-pay-period debt allocation approved in the user's budget.
Pay every minimum first, then send the surplus to the highest interest rate (avalanche).
If the allocation cannot cover the minimums, propose what it can and suggest hardship options.
Payments must add up to no more than the allocation.
After a rejection, address the stated reason, e.g. switch to smallest-balance-first."#
        }
        ProposalType::Investing => {
            r#"You are the Investing Agent for a personal finance platform.
You receive the per-pay-period investing allocation approved in the user's budget.
Priority: capture the full employer 401k match, then an IRA up to $583.33 per month, then more 401k.
Pick the IRA type from annual income: Roth below $150k, partial Roth to $165k, backdoor Roth above.
Split contributions across total_stock_market, international_stock and total_bond,
with bonds at (age - 30)% and the stock portion 80/20 domestic/international.
After a rejection, address the stated reason and change the allocation."#
        }
    }
}

/// Pull a JSON object out of a model answer: a ```json fence, a bare fence,
/// or the outermost braces.
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('{') {
                    return Some(inner);
                }
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (start < end).then(|| &trimmed[start..=end])
}

pub(crate) fn parse_decision(response: &str) -> Result<Decision> {
    let json = extract_json(response).ok_or_else(|| {
        WorkflowError::LlmError(format!("No JSON decision in model response | raw={}", response))
    })?;

    serde_json::from_str(json).map_err(|e| {
        WorkflowError::LlmError(format!(
            "Failed to parse model decision: {} | raw={}",
            e, response
        ))
    })
}

#[async_trait]
impl Policy for LlmPolicy {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn decide(&self, task: &AgentTask, tools: &[ToolSpec]) -> Result<Decision> {
        let prompt = self.build_prompt(task, tools);
        let (response, confidence) = self.client.generate(&prompt, system_prompt(self.kind)).await?;

        if confidence < 0.6 {
            warn!(kind = %self.kind, confidence = confidence, "Low-confidence model decision");
        }

        let decision = parse_decision(&response)?;

        debug!(
            kind = %self.kind,
            call_count = decision.calls.len(),
            "Model decision parsed"
        );

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSnapshot;
    use crate::policy::TaskEvent;
    use rust_decimal_macros::dec;

    #[test]
    fn test_extract_from_fence() {
        let text = "Here you go:\n```json\n{\"calls\": [], \"reply\": \"ok\"}\n```\nThanks";
        assert_eq!(extract_json(text), Some("{\"calls\": [], \"reply\": \"ok\"}"));

        let bare = "```\n{\"reply\": \"x\"}\n```";
        assert_eq!(extract_json(bare), Some("{\"reply\": \"x\"}"));
    }

    #[test]
    fn test_extract_from_braces() {
        let text = "Decision: {\"calls\": [{\"tool\": \"send_suggestion\", \"parameters\": {\"message\": \"hi\"}}]} done";
        let decision = parse_decision(text).unwrap();
        assert_eq!(decision.calls.len(), 1);
        assert_eq!(decision.calls[0].tool_name, "send_suggestion");
        assert!(decision.reply.is_empty());
    }

    #[test]
    fn test_unparseable_response_is_llm_error() {
        assert!(matches!(
            parse_decision("I cannot help with that"),
            Err(WorkflowError::LlmError(_))
        ));
        assert!(matches!(
            parse_decision("{not json}"),
            Err(WorkflowError::LlmError(_))
        ));
    }

    #[test]
    fn test_prompt_lists_tools() {
        let policy = LlmPolicy::new(ProposalType::Budget, "key".to_string()).unwrap();
        let task = AgentTask::new(
            ProposalType::Budget,
            TaskEvent::Onboard { income: dec!(5000) },
            ContextSnapshot {
                user_id: "u1".into(),
                ..Default::default()
            },
        );
        let tools = [ToolSpec {
            name: "submit_budget_proposal",
            description: "Submit a budget",
            parameters: "{}",
        }];

        let prompt = policy.build_prompt(&task, &tools);
        assert!(prompt.contains("Create an initial budget for user u1"));
        assert!(prompt.contains("- submit_budget_proposal: Submit a budget"));
    }
}
