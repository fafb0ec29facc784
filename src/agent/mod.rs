use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::approval::{AlwaysApprove, Approver, AskPermission};
use crate::error::AgentError;
use crate::llm::{ChatModel, ModelCompletion, ModelMessage, ModelToolChoice, ModelToolDefinition};
use crate::policy::{Decision, PolicyEngine, Requirement, RequirementSet, ToolId, Transcript};
use crate::tools::{DependencyMap, ToolOutcome, ToolSpec};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub require_done_tool: bool,
    pub max_iterations: u32,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            require_done_tool: false,
            max_iterations: 24,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Emitted before each model call with what the policy permits.
    StepStart {
        step: u32,
        allowed: Vec<String>,
        forced: Vec<String>,
    },
    Thinking {
        content: String,
    },
    Text {
        content: String,
    },
    ToolCall {
        tool: String,
        args_json: Value,
        tool_call_id: String,
    },
    /// The call was refused by the policy or by the approver and did not run.
    ToolRejected {
        tool: String,
        tool_call_id: String,
        reason: String,
    },
    ToolResult {
        tool: String,
        result_text: String,
        tool_call_id: String,
        is_error: bool,
    },
    FinalResponse {
        content: String,
    },
}

pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
    dependencies: DependencyMap,
    dependency_overrides: DependencyMap,
    requirements: Vec<Requirement>,
    approver: Arc<dyn Approver>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            model: None,
            tools: Vec::new(),
            config: AgentConfig::default(),
            dependencies: DependencyMap::new(),
            dependency_overrides: DependencyMap::new(),
            requirements: Vec::new(),
            approver: Arc::new(AlwaysApprove),
        }
    }
}

impl AgentBuilder {
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn require_done_tool(mut self, require_done_tool: bool) -> Self {
        self.config.require_done_tool = require_done_tool;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn dependency<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(value);
        self
    }

    pub fn dependency_override<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependency_overrides.insert(value);
        self
    }

    pub fn requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn requirements(mut self, requirements: impl IntoIterator<Item = Requirement>) -> Self {
        self.requirements.extend(requirements);
        self
    }

    /// Consulted before every tool call.
    pub fn approver<A>(mut self, approver: A) -> Self
    where
        A: Approver + 'static,
    {
        self.approver = Arc::new(approver);
        self
    }

    /// Requires `approver` to accept calls to the listed tools.
    pub fn ask_permission<I, T, A>(self, tools: I, approver: A) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ToolId>,
        A: Approver + 'static,
    {
        self.approver(AskPermission::new(tools, approver))
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        let mut tool_map = HashMap::new();
        for tool in &self.tools {
            if tool_map
                .insert(tool.name().to_string(), tool.clone())
                .is_some()
            {
                return Err(AgentError::Config(format!(
                    "duplicate tool registered: {}",
                    tool.name()
                )));
            }
        }

        let requirements = RequirementSet::new(self.requirements)?;
        if let Some(missing) = requirements
            .tools()
            .into_iter()
            .find(|tool| !tool_map.contains_key(tool.as_str()))
        {
            return Err(AgentError::Config(format!(
                "requirement references unregistered tool: {missing}"
            )));
        }

        let engine = PolicyEngine::new(requirements)
            .with_tools(self.tools.iter().map(|tool| tool.id().clone()));

        Ok(Agent {
            model,
            tools: self.tools,
            tool_map,
            config: self.config,
            dependencies: self.dependencies,
            dependency_overrides: self.dependency_overrides,
            engine,
            approver: self.approver,
            history: Vec::new(),
            transcript: Transcript::new(),
        })
    }
}

/// A tool-calling agent whose tool use is governed by a requirement set.
///
/// Every `query` is one run: the transcript starts empty, the policy engine
/// is consulted before each step, and the run may only finish once every
/// requirement's minimum is met. Conversation history persists across runs.
pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: Vec<ToolSpec>,
    tool_map: HashMap<String, ToolSpec>,
    config: AgentConfig,
    dependencies: DependencyMap,
    dependency_overrides: DependencyMap,
    engine: PolicyEngine,
    approver: Arc<dyn Approver>,
    history: Vec<ModelMessage>,
    transcript: Transcript,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn messages_len(&self) -> usize {
        self.history.len()
    }

    /// Tool invocations of the current or most recent run.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn requirements(&self) -> &RequirementSet {
        self.engine.requirements()
    }

    pub async fn query(&mut self, user_message: impl Into<String>) -> Result<String, AgentError> {
        let stream = self.query_stream(user_message);
        futures_util::pin_mut!(stream);

        let mut final_response: Option<String> = None;

        while let Some(event) = stream.next().await {
            if let AgentEvent::FinalResponse { content } = event? {
                final_response = Some(content);
            }
        }

        final_response.ok_or(AgentError::MissingFinalResponse)
    }

    pub fn query_stream(
        &mut self,
        user_message: impl Into<String>,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        let user_message = user_message.into();

        try_stream! {
            if self.history.is_empty() {
                if let Some(system_prompt) = &self.config.system_prompt {
                    self.history
                        .push(ModelMessage::System(system_prompt.clone()));
                }
            }

            self.history.push(ModelMessage::User(user_message));
            self.transcript = Transcript::new();

            let mut denials = Denials::default();

            for _ in 0..self.config.max_iterations {
                let step = self.transcript.next_step();
                let decision = self.decide(step, denials.at(step))?;
                debug!(
                    step,
                    allowed = ?decision.allowed,
                    forced = ?decision.forced,
                    termination_allowed = decision.termination_allowed,
                    "policy decision"
                );

                yield AgentEvent::StepStart {
                    step,
                    allowed: names(&decision.allowed),
                    forced: names(&decision.forced),
                };

                let tool_definitions = self
                    .tools
                    .iter()
                    .filter(|tool| decision.permits(tool.name()))
                    .map(ToolSpec::definition)
                    .collect::<Vec<ModelToolDefinition>>();

                let completion = self
                    .model
                    .invoke(&self.history, &tool_definitions, tool_choice(&decision))
                    .await?;

                if let Some(thinking) = completion.thinking.clone() {
                    yield AgentEvent::Thinking { content: thinking };
                }

                self.append_assistant_message(&completion);

                if let Some(text) = completion.text.clone() {
                    if !text.is_empty() {
                        yield AgentEvent::Text {
                            content: text.clone(),
                        };
                    }
                }

                if completion.tool_calls.is_empty() {
                    if decision.termination_allowed && !self.config.require_done_tool {
                        info!(step, invocations = self.transcript.len(), "run finished");
                        let final_content = completion.text.unwrap_or_default();
                        yield AgentEvent::FinalResponse {
                            content: final_content,
                        };
                        return;
                    }
                    if !decision.termination_allowed {
                        warn!(step, "final answer attempted before requirements were met");
                        self.history
                            .push(ModelMessage::User(unmet_requirements_message(&decision)));
                    }
                    continue;
                }

                for tool_call in completion.tool_calls {
                    yield AgentEvent::ToolCall {
                        tool: tool_call.name.clone(),
                        args_json: tool_call.arguments.clone(),
                        tool_call_id: tool_call.id.clone(),
                    };

                    let step = self.transcript.next_step();
                    let decision = self.decide(step, denials.at(step))?;

                    let admission = self
                        .admit(&tool_call.name, &tool_call.arguments, &decision, step)
                        .await;

                    let execution = match admission {
                        Admission::Approved(tool) => {
                            let mut execution = self
                                .execute_tool(&tool, tool_call.arguments.clone())
                                .await;
                            self.transcript.append(tool.id())?;

                            if execution.done_message.is_some() {
                                let after = self
                                    .engine
                                    .evaluate(&self.transcript, self.transcript.next_step())?;
                                if !after.termination_allowed {
                                    warn!(
                                        step,
                                        tool = %tool.id(),
                                        "done requested before requirements were met"
                                    );
                                    execution = ToolExecutionResult {
                                        result_text: unmet_requirements_message(&after),
                                        is_error: true,
                                        done_message: None,
                                    };
                                }
                            }
                            execution
                        }
                        Admission::Rejected { reason, denied } => {
                            warn!(step, tool = %tool_call.name, %reason, "tool call rejected");
                            if denied {
                                denials.deny(step, ToolId::from(tool_call.name.as_str()));
                            }
                            yield AgentEvent::ToolRejected {
                                tool: tool_call.name.clone(),
                                tool_call_id: tool_call.id.clone(),
                                reason: reason.clone(),
                            };
                            ToolExecutionResult {
                                result_text: reason,
                                is_error: true,
                                done_message: None,
                            }
                        }
                    };

                    self.history.push(ModelMessage::ToolResult {
                        tool_call_id: tool_call.id.clone(),
                        tool_name: tool_call.name.clone(),
                        content: execution.result_text.clone(),
                        is_error: execution.is_error,
                    });

                    yield AgentEvent::ToolResult {
                        tool: tool_call.name.clone(),
                        result_text: execution.result_text.clone(),
                        tool_call_id: tool_call.id.clone(),
                        is_error: execution.is_error,
                    };

                    if let Some(done_message) = execution.done_message {
                        info!(
                            step,
                            invocations = self.transcript.len(),
                            "run finished via done tool"
                        );
                        yield AgentEvent::FinalResponse {
                            content: done_message,
                        };
                        return;
                    }
                }
            }

            Err::<(), AgentError>(AgentError::MaxIterationsReached {
                max_iterations: self.config.max_iterations,
            })?;
        }
    }

    /// Evaluates the policy for `step` with this step's denied tools withdrawn.
    fn decide(&self, step: u32, denied: &BTreeSet<ToolId>) -> Result<Decision, AgentError> {
        let mut decision = self.engine.evaluate(&self.transcript, step)?;
        let was_forced = !decision.forced.is_empty();

        for tool in denied {
            decision.deny(tool.as_str());
        }

        if was_forced && decision.forced.is_empty() {
            return Err(AgentError::Deadlock {
                step,
                reason: "every forced tool was refused approval".to_string(),
            });
        }

        if decision.is_exhausted() {
            return Err(AgentError::Deadlock {
                step,
                reason: format!(
                    "no tool is permitted while requirements are unmet ({})",
                    join(&decision.unsatisfied)
                ),
            });
        }

        Ok(decision)
    }

    async fn admit(
        &self,
        name: &str,
        arguments: &Value,
        decision: &Decision,
        step: u32,
    ) -> Admission {
        let Some(tool) = self.tool_map.get(name) else {
            return Admission::Rejected {
                reason: format!("Unknown tool '{name}'."),
                denied: false,
            };
        };

        if !decision.permits(name) {
            let reason = if decision.forced.is_empty() {
                format!("Tool '{name}' is not permitted at step {step}.")
            } else {
                format!(
                    "Tool '{name}' is not permitted at step {step}; call {} instead.",
                    join(&decision.forced)
                )
            };
            return Admission::Rejected {
                reason,
                denied: false,
            };
        }

        if !self.approver.approve(tool.id(), arguments).await {
            return Admission::Rejected {
                reason: format!("Tool '{name}' was not approved."),
                denied: true,
            };
        }

        Admission::Approved(tool.clone())
    }

    fn append_assistant_message(&mut self, completion: &ModelCompletion) {
        self.history.push(ModelMessage::Assistant {
            content: completion.text.clone(),
            tool_calls: completion.tool_calls.clone(),
        });
    }

    async fn execute_tool(&self, tool: &ToolSpec, arguments: Value) -> ToolExecutionResult {
        let runtime_dependencies = self.dependencies.merged_with(&self.dependency_overrides);

        match tool.execute(arguments, &runtime_dependencies).await {
            Ok(ToolOutcome::Text(text)) => ToolExecutionResult {
                result_text: text,
                is_error: false,
                done_message: None,
            },
            Ok(ToolOutcome::Done(message)) => ToolExecutionResult {
                result_text: format!("Task completed: {message}"),
                is_error: false,
                done_message: Some(message),
            },
            Err(err) => ToolExecutionResult {
                result_text: err.to_string(),
                is_error: true,
                done_message: None,
            },
        }
    }
}

enum Admission {
    Approved(ToolSpec),
    Rejected { reason: String, denied: bool },
}

struct ToolExecutionResult {
    result_text: String,
    is_error: bool,
    done_message: Option<String>,
}

/// Tools refused approval, valid for a single step.
#[derive(Default)]
struct Denials {
    step: u32,
    tools: BTreeSet<ToolId>,
}

impl Denials {
    fn at(&mut self, step: u32) -> &BTreeSet<ToolId> {
        if self.step != step {
            self.step = step;
            self.tools.clear();
        }
        &self.tools
    }

    fn deny(&mut self, step: u32, tool: ToolId) {
        self.at(step);
        self.tools.insert(tool);
    }
}

fn tool_choice(decision: &Decision) -> ModelToolChoice {
    if decision.forced.len() == 1 {
        if let Some(tool) = decision.forced.first() {
            return ModelToolChoice::Tool(tool.to_string());
        }
    }

    if !decision.forced.is_empty() || !decision.termination_allowed {
        ModelToolChoice::Required
    } else if decision.allowed.is_empty() {
        ModelToolChoice::None
    } else {
        ModelToolChoice::Auto
    }
}

fn unmet_requirements_message(decision: &Decision) -> String {
    if decision.forced.is_empty() {
        format!(
            "You cannot finish yet. These tools must still be used: {}.",
            join(&decision.unsatisfied)
        )
    } else {
        format!(
            "You cannot finish yet. Call {} next.",
            join(&decision.forced)
        )
    }
}

fn names(tools: &BTreeSet<ToolId>) -> Vec<String> {
    tools.iter().map(ToString::to_string).collect()
}

fn join(tools: &BTreeSet<ToolId>) -> String {
    names(tools).join(", ")
}

pub async fn query(
    agent: &mut Agent,
    user_message: impl Into<String>,
) -> Result<String, AgentError> {
    agent.query(user_message).await
}

pub fn query_stream(
    agent: &mut Agent,
    user_message: impl Into<String>,
) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
    agent.query_stream(user_message)
}
