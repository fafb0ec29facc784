use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::policy::{Requirement, RequirementSet, ToolId};

fn default_consecutive_allowed() -> bool {
    true
}

/// One `[[requirements]]` table as written in a requirements file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRequirement {
    pub tool: String,
    pub force_at_step: Option<u32>,
    #[serde(default)]
    pub force_after: Vec<String>,
    #[serde(default)]
    pub only_after: Vec<String>,
    pub min_invocations: Option<u32>,
    pub max_invocations: Option<u32>,
    #[serde(default = "default_consecutive_allowed")]
    pub consecutive_allowed: bool,
}

impl From<RawRequirement> for Requirement {
    fn from(raw: RawRequirement) -> Self {
        let mut requirement = Requirement::new(raw.tool)
            .force_after(raw.force_after)
            .only_after(raw.only_after)
            .consecutive_allowed(raw.consecutive_allowed);
        if let Some(step) = raw.force_at_step {
            requirement = requirement.force_at_step(step);
        }
        if let Some(min) = raw.min_invocations {
            requirement = requirement.min_invocations(min);
        }
        if let Some(max) = raw.max_invocations {
            requirement = requirement.max_invocations(max);
        }
        requirement
    }
}

/// Requirement set plus approval-gated tools, loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequirementsFile {
    #[serde(default)]
    pub requirements: Vec<RawRequirement>,
    /// Tools whose execution needs explicit approval.
    #[serde(default)]
    pub ask_permission: Vec<String>,
}

impl RequirementsFile {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Reading requirements file");

        let content = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let file = Self::from_toml_str(&content)?;
        debug!(
            requirements = file.requirements.len(),
            ask_permission = file.ask_permission.len(),
            "Parsed requirements file"
        );
        Ok(file)
    }

    pub fn permission_tools(&self) -> Vec<ToolId> {
        self.ask_permission.iter().cloned().map(ToolId::from).collect()
    }

    pub fn into_requirement_set(self) -> Result<RequirementSet, ConfigError> {
        let requirements = self.requirements.into_iter().map(Requirement::from);
        Ok(RequirementSet::new(requirements)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolicyError;
    use crate::policy::{Constraint, FIRST_STEP, PolicyEngine, Transcript};

    const TRAVEL_COORDINATOR: &str = r#"
ask_permission = ["destination_research", "weather_planning"]

[[requirements]]
tool = "think"
force_at_step = 1
min_invocations = 1
max_invocations = 5
consecutive_allowed = false

[[requirements]]
tool = "wikipedia"
only_after = ["think"]
min_invocations = 1
max_invocations = 4
"#;

    #[test]
    fn parses_requirements_and_permissions() {
        let file = RequirementsFile::from_toml_str(TRAVEL_COORDINATOR).expect("parses");
        assert_eq!(
            file.permission_tools(),
            vec![
                ToolId::from("destination_research"),
                ToolId::from("weather_planning")
            ]
        );

        let set = file.into_requirement_set().expect("valid set");
        assert_eq!(set.len(), 2);

        let think = set.iter().next().expect("think requirement");
        assert_eq!(think.forced_step(), Some(1));
        assert_eq!(think.bounds(), (Some(1), Some(5)));
        assert!(think.constraints().contains(&Constraint::NonConsecutive));

        let wikipedia = set.iter().nth(1).expect("wikipedia requirement");
        assert!(!wikipedia.constraints().contains(&Constraint::NonConsecutive));

        let decision = PolicyEngine::new(set)
            .evaluate(&Transcript::new(), FIRST_STEP)
            .expect("evaluates");
        assert!(decision.permits("think"));
        assert!(!decision.permits("wikipedia"));
    }

    #[test]
    fn conflicting_file_surfaces_policy_error() {
        let file = RequirementsFile::from_toml_str(
            r#"
[[requirements]]
tool = "think"
force_at_step = 1

[[requirements]]
tool = "wikipedia"
force_at_step = 1
"#,
        )
        .expect("parses");

        let err = file.into_requirement_set().expect_err("must conflict");
        assert!(matches!(
            err,
            ConfigError::Policy(PolicyError::DuplicateForcedStep { .. })
        ));
    }

    #[test]
    fn unknown_fields_are_parse_errors() {
        let err = RequirementsFile::from_toml_str(
            r#"
[[requirements]]
tool = "think"
forced = true
"#,
        )
        .expect_err("must fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let err = RequirementsFile::load(Path::new("does/not/exist.toml")).expect_err("missing");
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }
}
