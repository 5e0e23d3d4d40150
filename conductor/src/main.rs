//! Resumable phase workflow engine.
//!
//! Drives a phase through design, analysis, implementation and verification
//! over `.conductor/state.json`. Every command prints JSON on stdout and exits
//! with a stable code (see `conductor::exit_codes`).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;

use conductor::autofix::{AutofixDecision, AutofixStatus};
use conductor::coordinator::WorkerJob;
use conductor::core::next_action::NextAction;
use conductor::core::types::{Goal, Step, StepStatus};
use conductor::exit_codes;
use conductor::io::init::{InitOptions, init_conductor};
use conductor::lifecycle::{Engine, PhaseStart, StatusReport};
use conductor::logging;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Resumable multi-stage workflow engine"
)]
struct Cli {
    /// Project root containing `.conductor/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// More diagnostics on stderr (`-v` info, `-vv` debug); `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.conductor/` with default config and an empty state document.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Open a new phase.
    Start {
        name: String,
        /// Explicit phase id (e.g. `004`).
        #[arg(long, conflicts_with = "after")]
        id: Option<String>,
        /// Allocate an insertion slot after this phase id (e.g. `003` -> `003.1`).
        #[arg(long)]
        after: Option<String>,
        /// Goal as `ID=text`; repeatable.
        #[arg(long = "goal", value_parser = parse_goal)]
        goals: Vec<Goal>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Phase, step, task progress, health and the recommended next action.
    Status,
    /// Next eligible task.
    Next {
        /// Return the whole next parallel batch.
        #[arg(long)]
        batch: bool,
    },
    /// Mark tasks complete (or blocked).
    Mark {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        blocked: Option<String>,
    },
    /// Evaluate a quality gate.
    Gate {
        name: String,
        /// Treat every finding as blocking.
        #[arg(long)]
        strict: bool,
    },
    /// Read a state value by dot path.
    Get { path: String },
    /// Write a driver-owned state value; the value is JSON, or a plain string.
    Set { path: String, value: String },
    /// Run the bounded auto-fix loop.
    Autofix {
        #[arg(long)]
        gate: Option<String>,
    },
    /// Decide after the auto-fix budget is exhausted.
    Resolve { decision: Decision },
    /// Report the active step's status.
    StepStatus { status: StepStatus },
    /// Move back to a step.
    Reset { step: Step },
    /// Jump forward to a step whose prerequisites are met.
    SkipTo { step: Step },
    /// Ask the generator for missing design artifacts.
    Generate,
    /// Goal coverage for the current phase.
    Coverage,
    DeferTask {
        id: String,
        #[arg(long)]
        reason: String,
    },
    DeferGoal {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Show how a set of worker jobs would be batched, without running them.
    DispatchCheck {
        /// JSON array of jobs.
        #[arg(long)]
        jobs: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Decision {
    Continue,
    Abort,
}

impl From<Decision> for AutofixDecision {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Continue => AutofixDecision::Continue,
            Decision::Abort => AutofixDecision::Abort,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root;
    if let Command::Init { force } = cli.command {
        let paths = init_conductor(&root, &InitOptions { force })?;
        print_json(&serde_json::json!({ "initialized": paths.conductor_dir }))?;
        return Ok(exit_codes::OK);
    }

    let engine = Engine::open(&root)?;
    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Start {
            name,
            id,
            after,
            goals,
            branch,
        } => status_exit(&engine.start_phase(PhaseStart {
            id,
            after,
            name,
            goals,
            branch,
        })?),
        Command::Status => status_exit(&engine.status()?),
        Command::Next { batch } => {
            let next = engine.next_task(batch)?;
            print_json(&next)?;
            Ok(if next.tasks.is_empty() {
                exit_codes::EXHAUSTED
            } else {
                exit_codes::OK
            })
        }
        Command::Mark { ids, blocked } => {
            print_json(&engine.mark_task(&ids, blocked.as_deref())?)?;
            Ok(exit_codes::OK)
        }
        Command::Gate { name, strict } => {
            let report = engine.check_gate(&name, strict)?;
            print_json(&report)?;
            Ok(if report.blocking {
                exit_codes::HALTED
            } else {
                exit_codes::OK
            })
        }
        Command::Get { path } => {
            print_json(&engine.get_state(&path)?.unwrap_or(Value::Null))?;
            Ok(exit_codes::OK)
        }
        Command::Set { path, value } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            engine.set_state(&path, value)?;
            status_exit(&engine.status()?)
        }
        Command::Autofix { gate } => {
            let outcome = engine.run_auto_fix(gate.as_deref())?;
            print_json(&outcome)?;
            Ok(autofix_exit(outcome.status))
        }
        Command::Resolve { decision } => {
            let outcome = engine.resolve(decision.into())?;
            print_json(&outcome)?;
            Ok(if outcome.status == AutofixStatus::Aborted {
                exit_codes::HALTED
            } else {
                exit_codes::OK
            })
        }
        Command::StepStatus { status } => status_exit(&engine.set_step_status(status)?),
        Command::Reset { step } => status_exit(&engine.reset(step)?),
        Command::SkipTo { step } => status_exit(&engine.skip_to(step)?),
        Command::Generate => {
            let result = engine.generate()?;
            print_json(&result)?;
            Ok(if result.missing.is_empty() {
                exit_codes::OK
            } else {
                exit_codes::HALTED
            })
        }
        Command::Coverage => {
            print_json(&engine.coverage()?)?;
            Ok(exit_codes::OK)
        }
        Command::DeferTask { id, reason } => status_exit(&engine.defer_task(&id, &reason)?),
        Command::DeferGoal { id, reason } => {
            print_json(&engine.defer_goal(&id, &reason)?)?;
            Ok(exit_codes::OK)
        }
        Command::DispatchCheck { jobs } => {
            let raw = fs::read_to_string(&jobs)
                .with_context(|| format!("read {}", jobs.display()))?;
            let jobs: Vec<WorkerJob> = serde_json::from_str(&raw)
                .with_context(|| format!("parse jobs {}", jobs.display()))?;
            print_json(&engine.dispatch_preview(&jobs))?;
            Ok(exit_codes::OK)
        }
    }
}

/// `ID=text`, or a bare id that doubles as its text.
fn parse_goal(raw: &str) -> Result<Goal, String> {
    let (id, text) = match raw.split_once('=') {
        Some((id, text)) => (id.trim(), text.trim()),
        None => (raw.trim(), raw.trim()),
    };
    if id.is_empty() {
        return Err(format!("goal '{raw}' has an empty id"));
    }
    Ok(Goal {
        id: id.to_string(),
        text: text.to_string(),
    })
}

fn status_exit(report: &StatusReport) -> Result<i32> {
    print_json(report)?;
    Ok(match report.next_action {
        NextAction::AwaitHuman | NextAction::DecideAutoFix { .. } => exit_codes::AWAITING_HUMAN,
        NextAction::Recover { .. }
        | NextAction::ResolveGate { .. }
        | NextAction::ResolveBlockedTasks { .. } => exit_codes::HALTED,
        _ => exit_codes::OK,
    })
}

fn autofix_exit(status: AutofixStatus) -> i32 {
    match status {
        AutofixStatus::Clean => exit_codes::OK,
        AutofixStatus::BudgetExhausted => exit_codes::AWAITING_HUMAN,
        AutofixStatus::Aborted => exit_codes::HALTED,
    }
}

/// Pretty JSON with a trailing newline on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goals_parse_with_and_without_text() {
        let goal = parse_goal("G1=Users can log in").expect("goal");
        assert_eq!(goal.id, "G1");
        assert_eq!(goal.text, "Users can log in");
        assert_eq!(parse_goal("G2").expect("goal").text, "G2");
        assert!(parse_goal("=text").is_err());
    }

    #[test]
    fn cli_parses_steps_and_decisions() {
        let cli = Cli::try_parse_from(["conductor", "skip-to", "implement"]).expect("parse");
        assert!(matches!(cli.command, Command::SkipTo { step: Step::Implement }));
        let cli = Cli::try_parse_from(["conductor", "resolve", "abort"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::Resolve {
                decision: Decision::Abort
            }
        ));
        assert!(Cli::try_parse_from(["conductor", "reset", "deploy"]).is_err());
        let cli = Cli::try_parse_from(["conductor", "status", "-vv"]).expect("parse");
        assert_eq!(cli.verbose, 2);
    }
}
