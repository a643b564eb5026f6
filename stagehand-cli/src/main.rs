mod commands;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing_subscriber::EnvFilter;

use crate::commands::Commands;
use stagehand_launcher::classify::RootCauseReport;
use stagehand_launcher::config::LauncherConfig;
use stagehand_launcher::doctor::{self, CheckStatus};
use stagehand_launcher::markers;
use stagehand_launcher::orchestrator::Orchestrator;
use stagehand_launcher::os::{HostOs, OsBackend};
use stagehand_launcher::recorder;

/// Stagehand - bootstrap and supervise a local development stack
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short = 'f', long = "file", global = true, default_value = stagehand_launcher::CONFIG_FILE)]
    file: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = cli.file.canonicalize().unwrap_or(cli.file.clone());
    let config = LauncherConfig::load(&config_path)?;
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let os: Arc<dyn OsBackend> = Arc::new(HostOs);

    match cli.command.unwrap_or(Commands::Up) {
        Commands::Up => cmd_up(config, &config_dir, os).await,
        Commands::Doctor => cmd_doctor(&config, &config_dir, os.as_ref()),
        Commands::Diagnose => cmd_diagnose(&config, &config_dir),
        Commands::Stop => cmd_stop(&config, &config_dir, os.as_ref()),
    }
}

async fn cmd_up(config: LauncherConfig, config_dir: &Path, os: Arc<dyn OsBackend>) -> anyhow::Result<i32> {
    let mut orch = Orchestrator::new(config, config_dir, os)?;

    if let Err(e) = orch.bootstrap().await {
        let report = orch.handle_failure(&e);
        print_root_cause(&report);
        return Ok(1);
    }

    println!("{}", "All services ready".green().bold());
    for handle in orch.handles() {
        let mode = if handle.reused { "reused" } else { "started" };
        println!(
            "  {}  http://127.0.0.1:{}/  ({}, pid {})",
            handle.service.cyan(),
            handle.port,
            mode,
            handle
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        );
    }
    println!("Run log: {}", orch.run_dir().display());
    println!("Press Ctrl-C to stop.");
    orch.open_browsers();

    match orch.supervise().await {
        Ok(()) => Ok(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            Ok(1)
        }
    }
}

#[derive(Tabled)]
struct FindingRow {
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Check")]
    name: String,
    #[tabled(rename = "Details")]
    details: String,
}

fn cmd_doctor(config: &LauncherConfig, config_dir: &Path, os: &dyn OsBackend) -> anyhow::Result<i32> {
    let report = doctor::run_checks(config, config_dir, os);

    let rows: Vec<FindingRow> = report
        .findings
        .iter()
        .map(|f| FindingRow {
            status: colored_status(f.status),
            name: f.name.clone(),
            details: match &f.fix {
                Some(fix) => format!("{}\nfix: {}", f.details, fix),
                None => f.details.clone(),
            },
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);

    if report.blocking() {
        println!("{}", "Preflight found blocking issues.".red().bold());
        Ok(1)
    } else {
        println!("{}", "Environment looks good.".green());
        Ok(0)
    }
}

fn colored_status(status: CheckStatus) -> String {
    match status {
        CheckStatus::Pass => status.as_str().green().to_string(),
        CheckStatus::Warn => status.as_str().yellow().to_string(),
        CheckStatus::Fail => status.as_str().red().bold().to_string(),
        CheckStatus::Info => status.as_str().blue().to_string(),
    }
}

/// Reprint the latest run's captured stderr and root cause. Read-only: no
/// process management happens here.
fn cmd_diagnose(config: &LauncherConfig, config_dir: &Path) -> anyhow::Result<i32> {
    let runs_root = config.runs_root(config_dir);
    let Some(run_dir) = recorder::latest_run_dir(&runs_root) else {
        println!("No previous run found.");
        return Ok(0);
    };

    println!("Latest run: {}", run_dir.display());

    for service in config.services.keys() {
        let tail = recorder::read_tail(
            &run_dir.join(format!("{}.stderr.log", service)),
            recorder::STDERR_TAIL_LINES,
        );
        if tail.is_empty() {
            continue;
        }
        println!("\n{} (last {} stderr lines):", service.cyan().bold(), tail.len());
        for line in tail {
            println!("  {}", line);
        }
    }

    let root_cause_path = run_dir.join("error_root_cause.json");
    match std::fs::read_to_string(&root_cause_path) {
        Ok(contents) => {
            let report: RootCauseReport = serde_json::from_str(&contents)?;
            println!();
            print_root_cause(&report);
        }
        Err(_) => println!("\nNo root-cause report; the run did not record a failure."),
    }
    Ok(0)
}

fn cmd_stop(config: &LauncherConfig, config_dir: &Path, os: &dyn OsBackend) -> anyhow::Result<i32> {
    let stopped = markers::stop_all(&config.pids_dir(config_dir), os)?;
    if stopped == 0 {
        println!("Nothing to stop.");
    } else {
        println!("Stopped {} service(s).", stopped);
    }
    Ok(0)
}

fn print_root_cause(report: &RootCauseReport) {
    println!(
        "{} {}",
        format!("[{}]", report.category.as_str()).red().bold(),
        report.message
    );
    if let Some(frame) = &report.first_local_stack_frame {
        println!("  at {}", frame.yellow());
    }
    if !report.suggested_fix_steps.is_empty() {
        println!("{}", "Suggested fixes:".bold());
        for step in &report.suggested_fix_steps {
            println!("  - {}", step);
        }
    }
    for (service, tail) in &report.stderr_tails {
        if tail.is_empty() {
            continue;
        }
        println!("{}", format!("--- {} stderr ---", service).dimmed());
        for line in tail {
            println!("  {}", line.dimmed());
        }
    }
}
