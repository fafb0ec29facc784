use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::info;

use crate::agent::Agent;
use crate::error::ToolError;
use crate::policy::ToolId;
use crate::tools::{ToolOutcome, ToolSpec};

/// Delegates a task to another agent and returns its final answer.
///
/// Only the task text goes in and only the answer text comes out; the target
/// runs against its own requirements and keeps its own transcript. The target
/// is shared behind a mutex, so concurrent handoffs to it queue up.
pub fn handoff_tool(
    name: impl Into<ToolId>,
    description: impl Into<String>,
    target: Arc<Mutex<Agent>>,
) -> ToolSpec {
    let name = name.into();
    let target_name = name.clone();

    ToolSpec::new(name, description)
        .with_builtin_schema(json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "Task for the receiving agent."}
            },
            "required": ["task"],
            "additionalProperties": false
        }))
        .with_handler(move |args, _deps| {
            let target = Arc::clone(&target);
            let tool = target_name.clone();
            let task = args
                .get("task")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            async move {
                info!(%tool, "handing off task");
                let mut agent = target.lock().await;
                agent
                    .query(task)
                    .await
                    .map(ToolOutcome::Text)
                    .map_err(|err| ToolError::Execution(format!("handoff to {tool} failed: {err}")))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelCompletion, ModelToolCall, ScriptedModel};
    use crate::policy::Requirement;
    use crate::tools::{DependencyMap, think_tool};

    fn expert(model: ScriptedModel) -> Arc<Mutex<Agent>> {
        let agent = Agent::builder()
            .model(model)
            .tool(think_tool())
            .requirement(Requirement::new("think").force_at_step(1).min_invocations(1))
            .build()
            .expect("expert builds");
        Arc::new(Mutex::new(agent))
    }

    #[tokio::test]
    async fn handoff_returns_target_answer_and_keeps_transcripts_apart() {
        let model = ScriptedModel::from_completions(vec![
            ModelCompletion::tool_call(ModelToolCall::new(
                "t1",
                "think",
                json!({"thoughts": "Kyoto temples"}),
            )),
            ModelCompletion::text("Visit Kiyomizu-dera."),
        ]);
        let target = expert(model);
        let tool = handoff_tool("destination_research", "Research destinations", target.clone());

        let outcome = tool
            .execute(json!({"task": "Temples in Kyoto"}), &DependencyMap::new())
            .await
            .expect("handoff runs");

        assert_eq!(outcome, ToolOutcome::Text("Visit Kiyomizu-dera.".to_string()));
        assert_eq!(target.lock().await.transcript().len(), 1);
    }

    #[tokio::test]
    async fn target_failure_becomes_execution_error() {
        let target = expert(ScriptedModel::default());
        let tool = handoff_tool("destination_research", "Research destinations", target);

        let err = tool
            .execute(json!({"task": "anything"}), &DependencyMap::new())
            .await
            .expect_err("target has no responses");

        assert!(matches!(
            err,
            ToolError::Execution(message) if message.contains("destination_research")
        ));
    }
}
