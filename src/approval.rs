//! Human-in-the-loop approval for tool execution.
//!
//! The agent loop consults an [`Approver`] before committing a tool call. A
//! refusal withdraws the tool for the current step only.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::policy::ToolId;

#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, tool: &ToolId, args: &Value) -> bool;
}

/// Approves every call.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysApprove;

#[async_trait]
impl Approver for AlwaysApprove {
    async fn approve(&self, _tool: &ToolId, _args: &Value) -> bool {
        true
    }
}

#[async_trait]
impl<F> Approver for F
where
    F: Fn(&ToolId, &Value) -> bool + Send + Sync,
{
    async fn approve(&self, tool: &ToolId, args: &Value) -> bool {
        self(tool, args)
    }
}

/// Asks `inner` only for the listed tools; everything else is approved.
/// An empty list gates every tool.
#[derive(Clone, Debug)]
pub struct AskPermission<A> {
    tools: BTreeSet<ToolId>,
    inner: A,
}

impl<A> AskPermission<A> {
    pub fn new<I, T>(tools: I, inner: A) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ToolId>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            inner,
        }
    }

    pub fn gates(&self, tool: &ToolId) -> bool {
        self.tools.is_empty() || self.tools.contains(tool)
    }
}

#[async_trait]
impl<A> Approver for AskPermission<A>
where
    A: Approver,
{
    async fn approve(&self, tool: &ToolId, args: &Value) -> bool {
        if !self.gates(tool) {
            return true;
        }
        self.inner.approve(tool, args).await
    }
}

/// Prompts on the terminal and reads a yes/no answer from stdin.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdinApprover;

#[async_trait]
impl Approver for StdinApprover {
    async fn approve(&self, tool: &ToolId, args: &Value) -> bool {
        let prompt = format!("Run tool '{tool}' with input {args}? [yes/no]: ");
        let mut stdout = tokio::io::stdout();
        if stdout.write_all(prompt.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return false;
        }

        let mut answer = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut answer).await {
            Ok(_) => parse_answer(&answer),
            Err(_) => false,
        }
    }
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
