//! `logpilot` command-line driver.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;

use logpilot::config::{self, ConfigError, DiagnosisConfig};
use logpilot::pipeline::llm::{EndpointError, OpenAiCompatClient};
use logpilot::pipeline::noise_filter::{NoiseFilter, Pattern, PatternKind};
use logpilot::pipeline::router::ModelRouter;
use logpilot::pipeline::{
    DiagnosisService, DiagnosticRequest, Domain, LogDocument, PipelineOrchestrator, PipelineRun,
    RunStatus, ScenarioConfig, ServiceError,
};

/// LogPilot - equipment fault diagnosis from manuals and logs
#[derive(Parser)]
#[command(name = "logpilot")]
#[command(about = "Diagnose equipment faults by matching logs against a fault manual", long_about = None)]
#[command(version = config::APP_VERSION)]
struct Cli {
    /// Config file (overrides $LOGPILOT_CONFIG and ~/.logpilot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for one or more logs and print the run records as JSON
    Diagnose {
        /// Fault manual (plain text)
        #[arg(long)]
        manual: PathBuf,

        /// Log file; repeat to diagnose several logs in parallel
        #[arg(long, required = true)]
        log: Vec<PathBuf>,

        /// Source checkout the Code stage may read from
        #[arg(long)]
        code_root: Option<PathBuf>,

        /// Subsystem domain (BSP, CLK, SWITCH, OTHER)
        #[arg(long, default_value = "OTHER")]
        domain: Domain,

        /// Literal keyword hint; repeatable
        #[arg(long = "keyword")]
        keywords: Vec<String>,

        /// Build-server path prefix removed from source references
        #[arg(long)]
        strip_prefix: Option<String>,
    },

    /// Preview noise-filter output for a log without calling any endpoint
    Filter {
        #[arg(long)]
        log: PathBuf,

        /// Literal keyword; repeatable
        #[arg(long = "keyword")]
        keywords: Vec<String>,

        /// Regular expression; repeatable
        #[arg(long = "regex")]
        regexes: Vec<String>,

        /// Print the evidence set as JSON instead of the prompt rendering
        #[arg(long)]
        json: bool,
    },

    /// Print the configured routing table
    Endpoints,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No [[endpoints]] configured")]
    NoEndpoints,

    #[error("HTTP client setup failed: {0}")]
    Client(#[from] EndpointError),

    #[error("Invalid regex '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("JSON output failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

fn main() -> ExitCode {
    logpilot::init_tracing();
    let cli = Cli::parse();

    match execute(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` when a diagnosis run did not succeed.
fn execute(cli: Cli) -> Result<bool, CliError> {
    match cli.command {
        Commands::Diagnose {
            manual,
            log,
            code_root,
            domain,
            keywords,
            strip_prefix,
        } => {
            let config = DiagnosisConfig::load(cli.config.as_deref())?;
            let scenario = ScenarioConfig {
                domain,
                keyword_patterns: keywords,
                strip_prefix,
                ..Default::default()
            };
            let runs = diagnose(&config, &manual, &log, code_root, scenario)?;
            let all_succeeded = runs.iter().all(|r| r.status == RunStatus::Succeeded);
            let out = match runs.as_slice() {
                [single] => serde_json::to_string_pretty(single)?,
                many => serde_json::to_string_pretty(many)?,
            };
            println!("{out}");
            Ok(all_succeeded)
        }
        Commands::Filter {
            log,
            keywords,
            regexes,
            json,
        } => {
            let config = DiagnosisConfig::load(cli.config.as_deref())?;
            let mut patterns: Vec<Pattern> = keywords.iter().map(|k| Pattern::literal(k)).collect();
            for pattern in regexes {
                let compiled = Pattern::new(PatternKind::Regex, &pattern)
                    .map_err(|source| CliError::InvalidPattern { pattern, source })?;
                patterns.push(compiled);
            }

            let document = LogDocument::new(read(&log)?);
            let evidence = NoiseFilter::new(config.filter).scan(&document, &patterns).collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&evidence)?);
            } else {
                print!("{}", evidence.render());
            }
            Ok(true)
        }
        Commands::Endpoints => {
            let config = DiagnosisConfig::load(cli.config.as_deref())?;
            let router = ModelRouter::new(config.endpoints.clone(), &config.router);
            println!("{}", serde_json::to_string_pretty(&router.status())?);
            Ok(true)
        }
    }
}

fn diagnose(
    config: &DiagnosisConfig,
    manual: &Path,
    logs: &[PathBuf],
    code_root: Option<PathBuf>,
    scenario: ScenarioConfig,
) -> Result<Vec<PipelineRun>, CliError> {
    if config.endpoints.is_empty() {
        return Err(CliError::NoEndpoints);
    }
    let manual_text = read(manual)?;

    let llm = Arc::new(OpenAiCompatClient::new()?);
    let orchestrator = Arc::new(PipelineOrchestrator::from_config(config, llm));
    let workers = config.pipeline.workers.min(logs.len());
    let service = DiagnosisService::start(orchestrator, workers);

    let mut tickets = Vec::with_capacity(logs.len());
    for path in logs {
        let mut request = DiagnosticRequest::new(manual_text.as_str(), read(path)?)
            .with_scenario(scenario.clone());
        request.code_sandbox_root = code_root.clone();
        let ticket = service.submit(request);
        tracing::info!(run_id = %ticket.run_id(), log = %path.display(), "Submitted");
        tickets.push(ticket);
    }

    tickets
        .into_iter()
        .map(|ticket| ticket.wait().map_err(CliError::from))
        .collect()
}

fn read(path: &Path) -> Result<String, CliError> {
    let bytes = std::fs::read(path).map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
