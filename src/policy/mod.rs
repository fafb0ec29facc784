//! Tool-invocation policy engine.
//!
//! A [`RequirementSet`] declares when tools may or must run. Given the
//! [`Transcript`] of a run so far, [`PolicyEngine::evaluate`] derives a
//! [`Decision`] for the next step. Evaluation is a pure function of its
//! inputs: there is no state beyond the transcript itself.

pub mod config;

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Index of the first step of every run.
pub const FIRST_STEP: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolId(String);

impl ToolId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ToolId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ToolId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&ToolId> for ToolId {
    fn from(value: &ToolId) -> Self {
        value.clone()
    }
}

impl Borrow<str> for ToolId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ToolId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One completed tool call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub tool: ToolId,
    pub step_index: u32,
}

/// Ordered history of tool invocations in a run. Step indices strictly increase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Transcript {
    records: Vec<InvocationRecord>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I>(records: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = InvocationRecord>,
    {
        let mut transcript = Self::new();
        for record in records {
            transcript.push(record)?;
        }
        Ok(transcript)
    }

    /// Builds a transcript where the n-th tool ran at step `FIRST_STEP + n`.
    pub fn from_tools<I, T>(tools: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ToolId>,
    {
        let records = (FIRST_STEP..)
            .zip(tools)
            .map(|(step_index, tool)| InvocationRecord {
                tool: tool.into(),
                step_index,
            })
            .collect();
        Self { records }
    }

    /// Appends `record`. Its step must follow the last one and must not be
    /// `u32::MAX`, so [`Transcript::next_step`] always has a successor.
    pub fn push(&mut self, record: InvocationRecord) -> Result<(), PolicyError> {
        if record.step_index == u32::MAX {
            return Err(PolicyError::StepOutOfRange {
                step: record.step_index,
            });
        }
        if let Some(last) = self.records.last() {
            if record.step_index <= last.step_index {
                return Err(PolicyError::TranscriptOutOfOrder {
                    previous: last.step_index,
                    step: record.step_index,
                });
            }
        }
        self.records.push(record);
        Ok(())
    }

    /// Records `tool` at [`Transcript::next_step`].
    pub fn append(&mut self, tool: impl Into<ToolId>) -> Result<&InvocationRecord, PolicyError> {
        self.push(InvocationRecord {
            tool: tool.into(),
            step_index: self.next_step(),
        })?;
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn next_step(&self) -> u32 {
        self.records
            .last()
            .map_or(FIRST_STEP, |record| record.step_index + 1)
    }

    pub fn records(&self) -> &[InvocationRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&InvocationRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count(&self, tool: &str) -> usize {
        self.records
            .iter()
            .filter(|record| record.tool.as_str() == tool)
            .count()
    }

    /// Records strictly before `step`.
    pub fn before(&self, step: u32) -> &[InvocationRecord] {
        let end = self
            .records
            .partition_point(|record| record.step_index < step);
        &self.records[..end]
    }
}

/// A single kind of constraint a requirement can carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Constraint {
    /// Tool is mandatory at exactly this step.
    ForceAtStep(u32),
    /// Tool is mandatory right after any of these tools ran.
    ForceAfter(BTreeSet<ToolId>),
    /// Tool is forbidden until one of these tools has run.
    OnlyAfter(BTreeSet<ToolId>),
    /// Inclusive bounds on the number of invocations over the run.
    Bounds { min: Option<u32>, max: Option<u32> },
    /// Tool may not run twice in a row.
    NonConsecutive,
}

/// Declarative constraints bound to one tool.
///
/// ```
/// use agent_policy_rs::Requirement;
///
/// let think = Requirement::new("think")
///     .force_at_step(1)
///     .min_invocations(1)
///     .max_invocations(5)
///     .consecutive_allowed(false);
/// assert_eq!(think.tool().as_str(), "think");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    tool: ToolId,
    constraints: Vec<Constraint>,
}

impl Requirement {
    pub fn new(tool: impl Into<ToolId>) -> Self {
        Self {
            tool: tool.into(),
            constraints: Vec::new(),
        }
    }

    pub fn force_at_step(mut self, step: u32) -> Self {
        self.constraints
            .retain(|constraint| !matches!(constraint, Constraint::ForceAtStep(_)));
        self.constraints.push(Constraint::ForceAtStep(step));
        self
    }

    pub fn force_after<I, T>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ToolId>,
    {
        let tools = tools.into_iter().map(Into::into).collect::<BTreeSet<_>>();
        if !tools.is_empty() {
            self.constraints.push(Constraint::ForceAfter(tools));
        }
        self
    }

    pub fn only_after<I, T>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ToolId>,
    {
        let tools = tools.into_iter().map(Into::into).collect::<BTreeSet<_>>();
        if !tools.is_empty() {
            self.constraints.push(Constraint::OnlyAfter(tools));
        }
        self
    }

    pub fn min_invocations(self, min: u32) -> Self {
        let (_, max) = self.bounds();
        self.with_bounds(Some(min), max)
    }

    pub fn max_invocations(self, max: u32) -> Self {
        let (min, _) = self.bounds();
        self.with_bounds(min, Some(max))
    }

    pub fn consecutive_allowed(mut self, allowed: bool) -> Self {
        self.constraints
            .retain(|constraint| *constraint != Constraint::NonConsecutive);
        if !allowed {
            self.constraints.push(Constraint::NonConsecutive);
        }
        self
    }

    pub fn tool(&self) -> &ToolId {
        &self.tool
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn bounds(&self) -> (Option<u32>, Option<u32>) {
        self.constraints
            .iter()
            .find_map(|constraint| match constraint {
                Constraint::Bounds { min, max } => Some((*min, *max)),
                _ => None,
            })
            .unwrap_or((None, None))
    }

    pub fn forced_step(&self) -> Option<u32> {
        self.constraints.iter().find_map(|constraint| match constraint {
            Constraint::ForceAtStep(step) => Some(*step),
            _ => None,
        })
    }

    fn with_bounds(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.constraints
            .retain(|constraint| !matches!(constraint, Constraint::Bounds { .. }));
        self.constraints.push(Constraint::Bounds { min, max });
        self
    }

    fn referenced_tools(&self) -> impl Iterator<Item = &ToolId> {
        let gates = self
            .constraints
            .iter()
            .filter_map(|constraint| match constraint {
                Constraint::ForceAfter(tools) | Constraint::OnlyAfter(tools) => Some(tools),
                _ => None,
            })
            .flatten();
        std::iter::once(&self.tool).chain(gates)
    }
}

/// A validated collection of requirements.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequirementSet {
    requirements: Vec<Requirement>,
    by_tool: BTreeMap<ToolId, Vec<Constraint>>,
}

impl RequirementSet {
    /// Validates `requirements`, rejecting sets that cannot be honored.
    ///
    /// Requirements on the same tool combine, so bounds and forcing are
    /// checked on the merged constraints of each tool.
    pub fn new<I>(requirements: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = Requirement>,
    {
        let requirements = requirements.into_iter().collect::<Vec<_>>();

        let mut by_tool: BTreeMap<ToolId, Vec<Constraint>> = BTreeMap::new();
        for requirement in &requirements {
            by_tool
                .entry(requirement.tool().clone())
                .or_default()
                .extend(requirement.constraints().iter().cloned());
        }

        validate(&by_tool)?;

        Ok(Self {
            requirements,
            by_tool,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter()
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Every tool named anywhere in the set, including gate and trigger tools.
    pub fn tools(&self) -> BTreeSet<ToolId> {
        self.requirements
            .iter()
            .flat_map(|requirement| requirement.referenced_tools())
            .cloned()
            .collect()
    }

    fn constraints_for(&self, tool: &ToolId) -> &[Constraint] {
        self.by_tool.get(tool).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// What the agent loop may do at the next step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: BTreeSet<ToolId>,
    pub forced: BTreeSet<ToolId>,
    pub termination_allowed: bool,
    /// Tools whose `min_invocations` has not been reached yet.
    pub unsatisfied: BTreeSet<ToolId>,
}

impl Decision {
    pub fn permits(&self, tool: &str) -> bool {
        self.allowed.contains(tool)
    }

    /// Nothing may run and the run may not end.
    pub fn is_exhausted(&self) -> bool {
        self.forced.is_empty() && self.allowed.is_empty() && !self.termination_allowed
    }

    /// Withdraws `tool` for this step, as if it had never been permitted.
    pub fn deny(&mut self, tool: &str) {
        self.allowed.remove(tool);
        self.forced.remove(tool);
    }
}

#[derive(Default)]
struct ToolStatus {
    forced_at_step: bool,
    forced_after: bool,
    gated: bool,
    exhausted: bool,
    repeat_blocked: bool,
    unsatisfied: bool,
}

/// Checks the merged constraints of every tool for conflicts.
fn validate(by_tool: &BTreeMap<ToolId, Vec<Constraint>>) -> Result<(), PolicyError> {
    let mut forced_steps: HashMap<u32, &ToolId> = HashMap::new();
    for (tool, constraints) in by_tool {
        let merged = MergedConstraints::of(constraints);

        if let (Some(min), Some(max)) = (merged.min, merged.max) {
            if min > max {
                return Err(PolicyError::InvalidBounds {
                    tool: tool.clone(),
                    min,
                    max,
                });
            }
        }

        if merged.gates.contains(tool) {
            return Err(PolicyError::SelfGated { tool: tool.clone() });
        }

        for &step in &merged.forced_steps {
            if merged.max == Some(0) {
                return Err(PolicyError::ForcedButCapped {
                    tool: tool.clone(),
                    step,
                });
            }
            // Nothing can have run before the first step, so any gate stays closed.
            if step == FIRST_STEP && merged.gated {
                return Err(PolicyError::ForcedButGated {
                    tool: tool.clone(),
                    step,
                });
            }
            if let Some(first) = forced_steps.insert(step, tool) {
                return Err(PolicyError::DuplicateForcedStep {
                    step,
                    first: first.clone(),
                    second: tool.clone(),
                });
            }
        }
    }

    Ok(())
}

/// The constraints of every requirement on one tool, folded together.
#[derive(Default)]
struct MergedConstraints<'a> {
    min: Option<u32>,
    max: Option<u32>,
    forced_steps: BTreeSet<u32>,
    gates: BTreeSet<&'a ToolId>,
    gated: bool,
}

impl<'a> MergedConstraints<'a> {
    fn of(constraints: &'a [Constraint]) -> Self {
        let mut merged = Self::default();
        for constraint in constraints {
            match constraint {
                Constraint::ForceAtStep(step) => {
                    merged.forced_steps.insert(*step);
                }
                Constraint::OnlyAfter(gates) => {
                    merged.gated = true;
                    merged.gates.extend(gates);
                }
                Constraint::Bounds { min, max } => {
                    merged.min = merged.min.max(*min);
                    merged.max = match (merged.max, *max) {
                        (Some(current), Some(max)) => Some(current.min(max)),
                        (current, max) => current.or(max),
                    };
                }
                Constraint::ForceAfter(_) | Constraint::NonConsecutive => {}
            }
        }
        merged
    }
}

/// Evaluates a [`RequirementSet`] over a known universe of tools.
#[derive(Clone, Debug, Default)]
pub struct PolicyEngine {
    requirements: RequirementSet,
    universe: BTreeSet<ToolId>,
}

impl PolicyEngine {
    pub fn new(requirements: RequirementSet) -> Self {
        let universe = requirements.tools();
        Self {
            requirements,
            universe,
        }
    }

    /// Adds unconstrained tools to the universe the engine decides over.
    pub fn with_tools<I, T>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ToolId>,
    {
        self.universe.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn requirements(&self) -> &RequirementSet {
        &self.requirements
    }

    pub fn tools(&self) -> &BTreeSet<ToolId> {
        &self.universe
    }

    pub fn evaluate(
        &self,
        transcript: &Transcript,
        next_step: u32,
    ) -> Result<Decision, PolicyError> {
        let history = transcript.before(next_step);
        let preceding = history.last().map(|record| &record.tool);

        let mut counts: HashMap<&ToolId, u32> = HashMap::new();
        for record in history {
            *counts.entry(&record.tool).or_default() += 1;
        }

        let mut decision = Decision::default();
        let mut forced_after = Vec::new();

        for tool in &self.universe {
            let count = counts.get(tool).copied().unwrap_or(0);
            let mut status = ToolStatus::default();

            for constraint in self.requirements.constraints_for(tool) {
                match constraint {
                    Constraint::ForceAtStep(step) => {
                        status.forced_at_step |= *step == next_step;
                    }
                    Constraint::ForceAfter(triggers) => {
                        status.forced_after |=
                            preceding.is_some_and(|prev| triggers.contains(prev));
                    }
                    Constraint::OnlyAfter(gates) => {
                        status.gated |= !history.iter().any(|record| gates.contains(&record.tool));
                    }
                    Constraint::Bounds { min, max } => {
                        status.exhausted |= max.is_some_and(|max| count >= max);
                        status.unsatisfied |= min.is_some_and(|min| count < min);
                    }
                    Constraint::NonConsecutive => {
                        status.repeat_blocked |= preceding == Some(tool);
                    }
                }
            }

            if status.unsatisfied {
                decision.unsatisfied.insert(tool.clone());
            }

            let blocked = status.exhausted || status.repeat_blocked;
            if (status.forced_at_step || status.forced_after) && !blocked {
                if status.gated {
                    return Err(PolicyError::ForcedButGated {
                        tool: tool.clone(),
                        step: next_step,
                    });
                }
                if !status.forced_at_step {
                    forced_after.push(tool.clone());
                }
                decision.forced.insert(tool.clone());
            }

            if !status.gated && !blocked {
                decision.allowed.insert(tool.clone());
            }
        }

        if forced_after.len() > 1 {
            return Err(PolicyError::AmbiguousForceAfter {
                step: next_step,
                tools: forced_after,
            });
        }

        if decision.forced.is_empty() {
            decision.termination_allowed = decision.unsatisfied.is_empty();
        } else {
            decision.allowed = decision.forced.clone();
        }

        Ok(decision)
    }
}

/// Evaluates `requirements` over the tools they name.
pub fn evaluate(
    transcript: &Transcript,
    requirements: &RequirementSet,
    next_step: u32,
) -> Result<Decision, PolicyError> {
    PolicyEngine::new(requirements.clone()).evaluate(transcript, next_step)
}

#[cfg(test)]
mod tests;
