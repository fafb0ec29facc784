use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::policy::ToolId;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("dependency missing: {0}")]
    MissingDependency(&'static str),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
}

/// Errors raised by the tool-invocation policy engine.
///
/// Every variant except the transcript ones ([`PolicyError::TranscriptOutOfOrder`]
/// and [`PolicyError::StepOutOfRange`]) is a configuration conflict: the
/// requirement set cannot be honored as written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error(
        "configuration conflict: {tool} has min_invocations {min} greater than max_invocations {max}"
    )]
    InvalidBounds { tool: ToolId, min: u32, max: u32 },
    #[error("configuration conflict: step {step} is forced for both {first} and {second}")]
    DuplicateForcedStep {
        step: u32,
        first: ToolId,
        second: ToolId,
    },
    #[error("configuration conflict: {tool} can only run after itself")]
    SelfGated { tool: ToolId },
    #[error("configuration conflict: {tool} is forced at step {step} but max_invocations is 0")]
    ForcedButCapped { tool: ToolId, step: u32 },
    #[error("configuration conflict: {tool} is forced at step {step} but its only_after gate is closed")]
    ForcedButGated { tool: ToolId, step: u32 },
    #[error("configuration conflict: step {step} is forced for several tools via force_after: {tools:?}")]
    AmbiguousForceAfter { step: u32, tools: Vec<ToolId> },
    #[error("transcript step {step} does not follow previous step {previous}")]
    TranscriptOutOfOrder { previous: u32, step: u32 },
    #[error("transcript step {step} leaves no room for a following step")]
    StepOutOfRange { step: u32 },
}

impl PolicyError {
    pub fn is_configuration_conflict(&self) -> bool {
        !matches!(
            self,
            PolicyError::TranscriptOutOfOrder { .. } | PolicyError::StepOutOfRange { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("requirements file not found at {path:?}")]
    NotFound { path: PathBuf },
    #[error("failed to read requirements from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse requirements: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("max iterations reached ({max_iterations})")]
    MaxIterationsReached { max_iterations: u32 },
    #[error("agent stream ended without final response")]
    MissingFinalResponse,
    #[error("agent deadlocked at step {step}: {reason}")]
    Deadlock { step: u32, reason: String },
    #[error("agent configuration error: {0}")]
    Config(String),
}
