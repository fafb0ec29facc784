use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::llm::{ChatModel, ModelCompletion, ModelMessage, ModelToolChoice, ModelToolDefinition};

/// What the agent offered the model on one call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptedCall {
    pub tools: Vec<String>,
    pub tool_choice: ModelToolChoice,
}

#[derive(Default)]
struct Script {
    responses: VecDeque<Result<ModelCompletion, ProviderError>>,
    calls: Vec<ScriptedCall>,
}

/// Replays canned completions in order and records every call it receives.
///
/// Clones share the same script, so a test can keep a handle after moving
/// the model into an agent.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    script: Arc<Mutex<Script>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<ModelCompletion, ProviderError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                responses: VecDeque::from(responses),
                calls: Vec::new(),
            })),
        }
    }

    pub fn from_completions(completions: Vec<ModelCompletion>) -> Self {
        Self::new(completions.into_iter().map(Ok).collect())
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.script
            .lock()
            .map(|script| script.calls.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script
            .lock()
            .map(|script| script.responses.len())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn invoke(
        &self,
        _messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| ProviderError::Request("scripted model lock poisoned".to_string()))?;

        script.calls.push(ScriptedCall {
            tools: tools.iter().map(|tool| tool.name.clone()).collect(),
            tool_choice,
        });

        script.responses.pop_front().unwrap_or_else(|| {
            Err(ProviderError::Response(
                "scripted model exhausted responses".to_string(),
            ))
        })
    }
}
