//! CLI entrypoint for the kernsync harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use kernsync_core::KernSyncConfig;
use kernsync_harness::structured_log::validate_log_file;
use kernsync_harness::{
    HarnessError, LogEmitter, Scenario, ScenarioParams, logger, run_scenario,
};

/// Stress and contract tooling for kernsync.
#[derive(Debug, Parser)]
#[command(name = "kernsync-harness")]
#[command(about = "Stress and contract scenarios for kernsync primitives")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one scenario, or all of them, and print a JSON report.
    Run {
        /// Scenario name, or `all`.
        #[arg(long, default_value = "all", value_parser = parse_selection)]
        scenario: Selection,
        /// Worker threads per scenario.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Iterations per worker.
        #[arg(long, default_value_t = 1000)]
        iterations: u64,
        /// Virtual CPUs for irq_work scenarios.
        #[arg(long, default_value_t = 4)]
        ncpu: usize,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Output path for the JSON report (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
    /// Print the configuration resolved from the environment.
    ShowConfig {
        /// Reject unparseable values instead of falling back to defaults.
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Debug, Clone)]
struct Selection(Vec<Scenario>);

fn parse_selection(s: &str) -> Result<Selection, String> {
    if s.eq_ignore_ascii_case("all") {
        return Ok(Selection(Scenario::ALL.to_vec()));
    }
    Scenario::from_str(s, true)
        .map(|scenario| Selection(vec![scenario]))
        .map_err(|_| {
            let names: Vec<_> = Scenario::ALL.iter().map(|s| s.name()).collect();
            format!("unknown scenario '{s}', expected all|{}", names.join("|"))
        })
}

fn run_id() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{secs}-{}", std::process::id())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            scenario,
            threads,
            iterations,
            ncpu,
            log,
            output,
        } => {
            let params = ScenarioParams {
                threads,
                iterations,
                ncpu,
            };
            let run_id = run_id();
            let mut emitter = match &log {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    LogEmitter::to_file(path, &run_id)?
                }
                None => LogEmitter::to_sink(&run_id),
            };

            let mut reports = Vec::with_capacity(scenario.0.len());
            for s in scenario.0 {
                let report = run_scenario(s, &params, &mut emitter)?;
                eprintln!(
                    "[{}] {:?} ({} ms)",
                    report.name, report.outcome, report.duration_ms
                );
                reports.push(report);
            }
            emitter.flush()?;

            let body = serde_json::to_string_pretty(&serde_json::json!({
                "run_id": run_id,
                "params": params,
                "reports": reports,
            }))?;
            if let Some(path) = output {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, body)?;
            } else {
                println!("{body}");
            }

            let failed = reports.iter().filter(|r| !r.passed()).count();
            if failed > 0 {
                return Err(format!("{failed} of {} scenario(s) failed", reports.len()).into());
            }
        }
        Command::ValidateLog { log } => {
            let (total, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                let invalid: std::collections::BTreeSet<_> =
                    errors.iter().map(|e| e.line_number).collect();
                return Err(HarnessError::InvalidLog {
                    invalid: invalid.len(),
                    total,
                }
                .into());
            }
            eprintln!("{}: {total} lines valid", log.display());
        }
        Command::ShowConfig { strict } => {
            let lookup = |var: &str| std::env::var(var).ok();
            let cfg = if strict {
                KernSyncConfig::try_from_lookup(lookup).map_err(HarnessError::from)?
            } else {
                KernSyncConfig::from_lookup(lookup)
            };
            let body = serde_json::json!({
                "ncpu": cfg.ncpu,
                "softint": cfg.softint.as_str(),
                "lockobj_limit": cfg.lockobj_limit,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
