//! Multi-agent travel planning with requirements and handoffs.
//!
//! A coordinator delegates to a destination expert and a meteorologist. Each
//! agent must think first; research tools only open up after thinking, and
//! handoffs need approval. Models are scripted so the run is reproducible.

use std::error::Error;
use std::sync::Arc;

use agent_policy_rs::{
    Agent, AgentEvent, ModelCompletion, ModelToolCall, Requirement, ScriptedModel, ToolError,
    ToolId, ToolOutcome, ToolSpec, handoff_tool, think_tool,
};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::Mutex;

fn lookup_tool(name: &str, description: &str, answer: &'static str) -> ToolSpec {
    ToolSpec::new(name, description)
        .with_schema(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_handler(move |args, _deps| async move {
            args.get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::Execution("query missing".to_string()))?;
            Ok(ToolOutcome::Text(answer.to_string()))
        })
}

fn think(id: &str, thoughts: &str) -> ModelCompletion {
    ModelCompletion::tool_call(ModelToolCall::new(
        id,
        "think",
        json!({"thoughts": thoughts}),
    ))
}

fn call(id: &str, tool: &str, arguments: Value) -> ModelCompletion {
    ModelCompletion::tool_call(ModelToolCall::new(id, tool, arguments))
}

fn destination_expert() -> Result<Agent, Box<dyn Error>> {
    let model = ScriptedModel::from_completions(vec![
        think("d1", "Look up Kyoto's historic sites."),
        call("d2", "wikipedia", json!({"query": "Kyoto temples"})),
        ModelCompletion::text("Kyoto: Kinkaku-ji, Fushimi Inari, and the Gion district."),
    ]);

    Ok(Agent::builder()
        .model(model)
        .tool(think_tool())
        .tool(lookup_tool(
            "wikipedia",
            "Search Wikipedia",
            "Kyoto has over 1,600 temples, including Kinkaku-ji and Fushimi Inari.",
        ))
        .requirement(
            Requirement::new("think")
                .force_at_step(1)
                .min_invocations(1)
                .max_invocations(5)
                .consecutive_allowed(false),
        )
        .requirement(
            Requirement::new("wikipedia")
                .only_after(["think"])
                .min_invocations(1)
                .max_invocations(4)
                .consecutive_allowed(false),
        )
        .system_prompt("You are a destination research expert.")
        .build()?)
}

fn meteorologist() -> Result<Agent, Box<dyn Error>> {
    let model = ScriptedModel::from_completions(vec![
        think("w1", "Check the forecast for Kyoto in April."),
        call("w2", "open_meteo", json!({"query": "Kyoto April"})),
        ModelCompletion::text("April in Kyoto: 10-20°C, cherry blossoms, pack a light jacket."),
    ]);

    Ok(Agent::builder()
        .model(model)
        .tool(think_tool())
        .tool(lookup_tool(
            "open_meteo",
            "Weather forecast",
            "Kyoto, April: mean high 20°C, low 9°C, 10 rainy days.",
        ))
        .requirement(
            Requirement::new("think")
                .force_at_step(1)
                .min_invocations(1)
                .max_invocations(2),
        )
        .requirement(
            Requirement::new("open_meteo")
                .only_after(["think"])
                .min_invocations(1)
                .max_invocations(1),
        )
        .system_prompt("You are a travel meteorologist.")
        .build()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let destination = Arc::new(Mutex::new(destination_expert()?));
    let weather = Arc::new(Mutex::new(meteorologist()?));

    let coordinator_model = ScriptedModel::from_completions(vec![
        think("c1", "I need destination and weather details."),
        call("c2", "destination_research", json!({"task": "Historic sites in Kyoto"})),
        think("c3", "Now the weather."),
        call("c4", "weather_planning", json!({"task": "Kyoto weather in April"})),
        ModelCompletion::text("Plan: temples by day, Gion by night; bring a light jacket."),
    ]);

    let approve_and_log = |tool: &ToolId, args: &Value| {
        println!("approval: {tool} {args} -> yes");
        true
    };

    let mut coordinator = Agent::builder()
        .model(coordinator_model)
        .tool(think_tool())
        .tool(handoff_tool(
            "destination_research",
            "Consult the destination research expert",
            destination,
        ))
        .tool(handoff_tool(
            "weather_planning",
            "Consult the travel meteorologist",
            weather,
        ))
        .requirement(Requirement::new("think").consecutive_allowed(false))
        .ask_permission(["destination_research", "weather_planning"], approve_and_log)
        .system_prompt("You coordinate travel planning by delegating to experts.")
        .build()?;

    {
        let stream = coordinator.query_stream("Plan a spring trip to Kyoto.");
        futures_util::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event? {
                AgentEvent::StepStart {
                    step,
                    allowed,
                    forced,
                } => println!("step {step}: allowed={allowed:?} forced={forced:?}"),
                AgentEvent::Thinking { content } => println!("thinking: {content}"),
                AgentEvent::Text { content } => println!("text: {content}"),
                AgentEvent::ToolCall {
                    tool,
                    args_json,
                    tool_call_id,
                } => println!("tool call [{tool_call_id}] {tool}: {args_json}"),
                AgentEvent::ToolRejected {
                    tool,
                    tool_call_id,
                    reason,
                } => println!("tool rejected [{tool_call_id}] {tool}: {reason}"),
                AgentEvent::ToolResult {
                    tool,
                    result_text,
                    tool_call_id,
                    is_error,
                } => println!("tool result [{tool_call_id}] {tool}: {result_text} (error={is_error})"),
                AgentEvent::FinalResponse { content } => println!("final: {content}"),
            }
        }
    }

    let steps = coordinator
        .transcript()
        .records()
        .iter()
        .map(|record| format!("{}@{}", record.tool, record.step_index))
        .collect::<Vec<_>>();
    println!("coordinator transcript: {}", steps.join(", "));

    Ok(())
}
