use std::error::Error;
use std::path::PathBuf;

use agent_policy_rs::{PolicyEngine, RequirementsFile, Transcript};
use clap::Parser;
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

/// Replays a transcript against a requirements file and prints the decision.
#[derive(Parser, Debug)]
#[command(name = "policy-check", version, about)]
struct Cli {
    /// TOML file with `[[requirements]]` tables.
    #[arg(long, short)]
    requirements: PathBuf,
    /// Additional unconstrained tools the agent has.
    #[arg(long = "tool")]
    tools: Vec<String>,
    /// Comma-separated tools already invoked, in order, starting at step 1.
    #[arg(long, value_delimiter = ',')]
    transcript: Vec<String>,
    /// Step to decide for. Defaults to the step after the transcript.
    #[arg(long)]
    next_step: Option<u32>,
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let cli = Cli::parse();
    debug!(?cli, "CLI arguments parsed");

    let file = RequirementsFile::load(&cli.requirements)?;
    let permission_tools = file.permission_tools();
    let requirements = file.into_requirement_set()?;
    info!(
        path = %cli.requirements.display(),
        requirements = requirements.len(),
        "Loaded requirements"
    );

    let engine = PolicyEngine::new(requirements)
        .with_tools(cli.tools.iter().map(String::as_str))
        .with_tools(permission_tools.iter());
    let transcript = Transcript::from_tools(
        cli.transcript
            .iter()
            .map(|tool| tool.trim())
            .filter(|tool| !tool.is_empty()),
    );
    let next_step = cli.next_step.unwrap_or_else(|| transcript.next_step());

    let decision = engine.evaluate(&transcript, next_step)?;
    info!(
        next_step,
        forced = decision.forced.len(),
        allowed = decision.allowed.len(),
        "Evaluated policy"
    );

    let output = json!({
        "next_step": next_step,
        "transcript": transcript,
        "decision": decision,
        "ask_permission": permission_tools,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
