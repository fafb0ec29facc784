use serde_json::{Value, json};
use tracing::debug;

use crate::tools::{ToolOutcome, ToolSpec};

pub const THINK_TOOL: &str = "think";

/// Scratchpad tool: the model writes down its reasoning and planned next
/// steps. Always answers `OK`.
pub fn think_tool() -> ToolSpec {
    ToolSpec::new(THINK_TOOL, "Reason about the task and plan the next steps before acting.")
        .with_builtin_schema(json!({
            "type": "object",
            "properties": {
                "thoughts": {"type": "string", "description": "Current reasoning."},
                "next_step": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Planned next actions."
                }
            },
            "required": ["thoughts"],
            "additionalProperties": false
        }))
        .with_handler(|args, _deps| {
            let thoughts = args.get("thoughts").and_then(Value::as_str).unwrap_or_default();
            debug!(%thoughts, "think");
            async move { Ok(ToolOutcome::Text("OK".to_string())) }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::DependencyMap;

    #[tokio::test]
    async fn think_acknowledges_and_validates_input() {
        let tool = think_tool();
        assert_eq!(tool.name(), THINK_TOOL);

        let outcome = tool
            .execute(
                json!({"thoughts": "look up Kyoto", "next_step": ["wikipedia"]}),
                &DependencyMap::new(),
            )
            .await
            .expect("think runs");
        assert_eq!(outcome, ToolOutcome::Text("OK".to_string()));

        let err = tool
            .execute(json!({"next_step": []}), &DependencyMap::new())
            .await
            .expect_err("thoughts required");
        assert!(err.to_string().contains("thoughts"));
    }
}
