use clap::{Parser, Subcommand};
use simrun_core::{FileReporter, Reporter, RunOutcome, RunRequest, SimrunError};
use simrun_runner::{
    copy_result_files, ensure_output_directory, mark_run_start, ConsoleProgress, Supervisor,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{info, warn};

mod config;

use config::RunFile;

/// Exit status when the engine executable cannot be found.
const EXIT_EXECUTABLE_NOT_FOUND: i32 = 3;

const RUN_FILE_TEMPLATE: &str = r#"# simrun run file

model = "MyLibrary.Examples.Constants"
backend = "dymola"            # dymola | optimica | openmodelica | custom
# executable = "/path/to/engine"  # required for backend = "custom"
package_path = "."
output_dir = "results"
show_progress = true
# Placeholders such as {model}, {modified_model}, {stop_time} and
# {parameters} are filled in from this file.
args = []

[settings]
stop_time = 1.0
tolerance = 1e-6
number_of_intervals = 500
timeout_secs = 600

[parameters]
# "PID.k" = 1.0
# "const1.k" = [2, 3]
"#;

#[derive(Parser)]
#[command(name = "simrun")]
#[command(about = "Run external simulation engines under a timeout", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a model described by a TOML run file
    Run {
        /// Path to the run file
        #[arg(default_value = "simrun.toml")]
        run_file: PathBuf,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Supervise an arbitrary command
    Exec {
        /// Seconds before the process is stopped; 0 or less disables the timeout
        #[arg(short, long, default_value = "-1", allow_negative_numbers = true)]
        timeout: f64,

        /// Directory the command runs in
        #[arg(short, long, default_value = ".")]
        workdir: PathBuf,

        /// Copy files the command creates to this directory and log there
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Show a progress bar while the timeout runs
        #[arg(long)]
        progress: bool,

        /// Replace the environment with these KEY=VALUE pairs
        #[arg(short, long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Generate a run file template
    Init,
}

/// Writes run messages to the terminal.
struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn write_output(&self, text: &str) {
        println!("{}", text);
    }

    fn write_error(&self, text: &str) {
        eprintln!("*** Error: {}", text);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init => return Ok(generate_run_file_template()?),
        Commands::Run { run_file, json } => run_file_command(&run_file, json).await,
        Commands::Exec {
            timeout,
            workdir,
            output,
            progress,
            env,
            json,
            command,
        } => exec_command(timeout, &workdir, output.as_deref(), progress, env, json, &command).await,
    };

    match result {
        Ok(Some(outcome)) if outcome.succeeded() => Ok(()),
        // Not started, failed, or stopped after its timeout.
        Ok(_) => process::exit(1),
        Err(SimrunError::ExecutableNotFound(program)) => {
            eprintln!("Error: Did not find executable '{}'.", program);
            eprintln!("       Make sure it is on the PATH variable of your operating system.");
            process::exit(EXIT_EXECUTABLE_NOT_FOUND);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_file_command(path: &Path, json: bool) -> simrun_core::Result<Option<RunOutcome>> {
    let run_file = RunFile::load(path)?;
    let (mut simulator, args) = run_file.into_simulator()?;

    info!(
        model = %simulator.model_name(),
        parameters = ?simulator.parameter_declarations(),
        modifiers = ?simulator.model_modifiers(),
        "Loaded run file"
    );

    let outcome = simulator.run(&args).await?;
    report_outcome(outcome.as_ref(), json)?;
    if let Some(dir) = simulator.simulate_directory() {
        eprintln!("Working directory kept at {}", dir.display());
    }
    Ok(outcome)
}

async fn exec_command(
    timeout: f64,
    workdir: &Path,
    output: Option<&Path>,
    progress: bool,
    env: Vec<(String, String)>,
    json: bool,
    command: &[String],
) -> simrun_core::Result<Option<RunOutcome>> {
    let mut request = RunRequest::from_command(command, workdir)?.timeout_secs(timeout);
    if !env.is_empty() {
        request = request.env(env);
    }

    let output_dir = output.map(ensure_output_directory).transpose()?;
    let reporter: Arc<dyn Reporter> = match &output_dir {
        Some(dir) => Arc::new(FileReporter::in_directory(dir)?),
        None => Arc::new(ConsoleReporter),
    };

    let mut supervisor = Supervisor::new(reporter.clone());
    if progress {
        supervisor = supervisor.with_progress(Arc::new(ConsoleProgress));
    }

    let since = match &output_dir {
        Some(_) => match mark_run_start(workdir).await {
            Ok(since) => Some(since),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Falling back to the system clock for result detection");
                None
            }
        },
        None => None,
    };

    let outcome = supervisor.supervise(&request).await?;

    if let (Some(outcome), Some(dir)) = (&outcome, &output_dir) {
        let since = since.unwrap_or(outcome.started_at);
        let copied = copy_result_files(reporter.as_ref(), workdir, dir, since);
        info!(count = copied.len(), output_dir = %dir.display(), "Copied result files");
    }

    report_outcome(outcome.as_ref(), json)?;
    Ok(outcome)
}

fn report_outcome(outcome: Option<&RunOutcome>, json: bool) -> simrun_core::Result<()> {
    let Some(outcome) = outcome else {
        eprintln!("Process could not be started; see the run log.");
        return Ok(());
    };

    if json {
        let text = serde_json::to_string_pretty(outcome)
            .map_err(|e| SimrunError::ExecutionError(e.to_string()))?;
        println!("{}", text);
        return Ok(());
    }

    println!("Run: {}", outcome.run_id);
    println!("Program: {}", outcome.program);
    println!("Started: {}", outcome.started_at);
    println!("Duration: {}ms", outcome.duration_ms);
    match outcome.exit_code {
        Some(code) => println!("Exit code: {}", code),
        None => println!("Exit code: none"),
    }
    if outcome.forcibly_terminated {
        println!("Stopped after timeout ({:?})", outcome.signals);
    }
    println!("Status: {}", if outcome.succeeded() { "SUCCESS" } else { "FAILED" });
    Ok(())
}

fn generate_run_file_template() -> simrun_core::Result<()> {
    let path = "simrun.toml";
    if Path::new(path).exists() {
        eprintln!("Error: run file already exists at {}", path);
        eprintln!("Use a different filename or remove the existing file.");
        process::exit(1);
    }

    fs::write(path, RUN_FILE_TEMPLATE)?;
    println!("✓ Created run file template at {}", path);
    Ok(())
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}
