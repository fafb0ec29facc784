//! Requirement-driven tool-calling agents.
//!
//! - `policy`: declarative tool requirements and the pure engine that turns
//!   a run's transcript into the next step's allowed/forced tools
//! - `Agent` loop that enforces those decisions, with `query` and
//!   `query_stream` entry points
//! - `Approver` gate for human-in-the-loop tool approval
//! - Tool registry with JSON schema validation, dependency injection, and the
//!   built-in `think` and handoff tools

pub mod agent;
pub mod approval;
pub mod error;
pub mod llm;
pub mod policy;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentEvent, query, query_stream};
pub use approval::{AlwaysApprove, Approver, AskPermission, StdinApprover};
pub use error::{AgentError, ConfigError, PolicyError, ProviderError, SchemaError, ToolError};
pub use llm::{
    ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolChoice, ModelToolDefinition,
    ScriptedCall, ScriptedModel,
};
pub use policy::config::RequirementsFile;
pub use policy::{
    Constraint, Decision, FIRST_STEP, InvocationRecord, PolicyEngine, Requirement, RequirementSet,
    ToolId, Transcript, evaluate,
};
pub use tools::{DependencyMap, ToolOutcome, ToolSpec, handoff_tool, think_tool};
