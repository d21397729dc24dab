use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Stdio};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use test_runner::catalog::scenario_program;
use test_runner::report::{render, Style};
use test_runner::{select, HandlerSettings, Status, TestHandler};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Runs cluster scenarios in parallel and summarizes the outcome.
#[derive(Debug, Parser)]
#[command(name = "test-runner", version)]
struct Cli {
    /// Scenario names or glob patterns; the base list when empty.
    scenarios: Vec<String>,
    /// Use ANSI colors and dots in output (on by default for a terminal).
    #[arg(long)]
    ansi: bool,
    /// Comma separated scenarios to leave out.
    #[arg(long, short = 'x', value_delimiter = ',')]
    exclude: Vec<String>,
    /// Also run the extended scenarios.
    #[arg(long)]
    extended: bool,
    /// How many scenarios to run in parallel.
    #[arg(long, short = 'j', default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
    jobs: u32,
    /// Only print dots, the summary and failure logs.
    #[arg(long, short = 'q')]
    quiet: bool,
    /// Root directory for the run's data directories.
    #[arg(long, short = 't')]
    tmpdirprefix: Option<PathBuf>,
    /// Stop after the first failure.
    #[arg(long)]
    failfast: bool,
    /// Regular expression selecting scenarios to run.
    #[arg(long)]
    filter: Option<String>,
    /// Directory holding the scenario executables; defaults to this binary's directory.
    #[arg(long)]
    scenario_dir: Option<PathBuf>,
    /// Arguments forwarded to every scenario.
    #[arg(last = true)]
    passthrough: Vec<String>,
}

fn init_logging(quiet: bool) {
    let fallback = if quiet { "info" } else { "debug" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .with_level(false)
        .with_writer(std::io::stdout)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("test-runner: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn default_scenario_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locating the runner executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("runner executable has no parent directory")
}

fn run(cli: Cli) -> Result<ExitCode> {
    let ansi = cli.ansi || atty::is(atty::Stream::Stdout);
    let style = Style::detect(ansi);
    let bold = style.bold();

    let selection = select(
        &cli.scenarios,
        cli.extended,
        &cli.exclude,
        cli.filter.as_deref(),
    )?;
    for name in &selection.unknown {
        println!(
            "{}WARNING!{} Scenario '{name}' not found in the scenario list.",
            bold.1, bold.0
        );
    }
    for name in &selection.unmatched_excludes {
        println!(
            "{}WARNING!{} Scenario '{name}' not found in current scenario list.",
            bold.1, bold.0
        );
    }

    let scenario_dir = match cli.scenario_dir {
        Some(dir) => dir,
        None => default_scenario_dir()?,
    };
    let mut scenarios = Vec::with_capacity(selection.scenarios.len());
    for entry in selection.scenarios {
        if scenario_dir.join(scenario_program(&entry)).is_file() {
            scenarios.push(entry);
        } else {
            println!(
                "{}WARNING!{} Scenario '{entry}' has no executable in {}.",
                bold.1,
                bold.0,
                scenario_dir.display()
            );
        }
    }
    if scenarios.is_empty() {
        println!(
            "No valid scenarios specified. Check that your scenario is in one of the \
             scenario lists of test-runner, or run test-runner with no arguments to run all scenarios"
        );
        return Ok(ExitCode::SUCCESS);
    }

    let prefix = cli.tmpdirprefix.unwrap_or_else(std::env::temp_dir);
    let run_dir = prefix.join(format!(
        "test_runner_{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating {}", run_dir.display()))?;
    debug!("Temporary test directory at {}", run_dir.display());
    warn_if_daemon_running(bold);

    let width = scenarios.iter().map(String::len).max().unwrap_or(0);
    let total = scenarios.len();
    let settings = HandlerSettings {
        jobs: cli.jobs as usize,
        flags: cli.passthrough,
        dots: ansi,
        ..HandlerSettings::new(&scenario_dir, &run_dir)
    };
    let mut handler = TestHandler::new(settings, scenarios);
    let started = Instant::now();
    let mut results = Vec::with_capacity(total);

    for done in 1..=total {
        let Some(finished) = handler.next_finished() else {
            break;
        };
        let result = finished.result;
        let done_str = format!("{done}/{total} - {}{}{}", bold.1, result.name, bold.0);
        match result.status {
            Status::Passed => debug!("{done_str} passed, Duration: {} s", result.duration),
            Status::Skipped => debug!("{done_str} skipped"),
            Status::Failed => {
                println!("{done_str} failed, Duration: {} s\n", result.duration);
                println!("{}stdout:\n{}{}\n", bold.1, bold.0, finished.stdout);
                println!("{}stderr:\n{}{}\n", bold.1, bold.0, finished.stderr);
            }
        }
        let failed = !result.status.was_successful();
        results.push(result);
        if failed && cli.failfast {
            debug!("Early exiting after test failure");
            break;
        }
    }

    print!(
        "{}",
        render(&results, width, started.elapsed().as_secs(), style)
    );
    println!();

    if fs::read_dir(&run_dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
    {
        fs::remove_dir(&run_dir).with_context(|| format!("removing {}", run_dir.display()))?;
    }

    handler.kill_and_join();
    let all_passed = results.iter().all(|result| result.status.was_successful());
    Ok(if all_passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Another daemon on this host competes for ports and CPU.
fn warn_if_daemon_running(bold: (&str, &str)) {
    let found = Command::new("pgrep")
        .args(["-x", "divid"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if found {
        println!(
            "{}WARNING!{} There is already a divid process running on this system. \
             Scenarios may fail unexpectedly due to resource contention!",
            bold.1, bold.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_runner_and_passthrough_flags() {
        let cli = Cli::try_parse_from([
            "test-runner",
            "-j",
            "2",
            "--exclude=a,b",
            "--failfast",
            "mn_*",
            "--",
            "--nocleanup",
        ])
        .unwrap();
        assert_eq!(cli.jobs, 2);
        assert_eq!(cli.exclude, vec!["a", "b"]);
        assert!(cli.failfast);
        assert_eq!(cli.scenarios, vec!["mn_*"]);
        assert_eq!(cli.passthrough, vec!["--nocleanup"]);
        assert!(Cli::try_parse_from(["test-runner", "-j", "0"]).is_err());
    }
}
