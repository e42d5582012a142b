//! Entry point for `api-synth generate`: reads an OpenAPI document, plans a
//! dependency chain per operation, drives the spec's server to build a
//! baseline request flow for each, derives positive and negative scenarios
//! from that flow, and emits one replayable artifact per scenario plus the
//! run's aggregate reports.

mod artifact;
mod baseline;
mod config;
mod errors;
mod oracle;
mod orchestrator;
mod planner;
mod report;
mod scenarios;
mod sender;
mod spec;
mod telemetry;
mod values;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use config::{ProviderConfig, RunConfig, RunLimits};
use oracle::HttpOracle;
use orchestrator::{NoopRunner, Orchestrator};
use sender::RequestSender;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "api-synth")]
#[command(about = "Synthesizes black-box test suites from an OpenAPI document", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Plans, drives, and synthesizes a test suite for every operation in the spec.
    Generate {
        /// Base URL of the running target server.
        #[arg(long)]
        base_url: String,

        /// Path to the OpenAPI document (YAML or JSON).
        #[arg(long)]
        spec_path: PathBuf,

        /// Whether to synthesize structural negative scenarios.
        #[arg(long, default_value = "1")]
        structural: u8,

        /// Whether to synthesize functional negative scenarios.
        #[arg(long, default_value = "1")]
        functional: u8,

        /// Optional script to prepare the target environment before each operation.
        #[arg(long)]
        env_init_script: Option<PathBuf>,

        /// Optional free-text guidance steering the dependency planner and scenario generator.
        #[arg(long)]
        user_input: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let telemetry_config = TelemetryConfig::from_env();
    if let Err(e) = init_telemetry(telemetry_config) {
        eprintln!("failed to initialize telemetry: {}", e);
    }

    let exit_code = match &cli.command {
        Commands::Generate {
            base_url,
            spec_path,
            structural,
            functional,
            env_init_script,
            user_input,
        } => {
            run_generate(
                base_url.clone(),
                spec_path.clone(),
                *structural != 0,
                *functional != 0,
                env_init_script.clone(),
                user_input.clone(),
            )
            .await
        }
    };

    shutdown_telemetry();
    std::process::exit(exit_code);
}

async fn run_generate(
    base_url: String,
    spec_path: PathBuf,
    structural: bool,
    functional: bool,
    env_init_script: Option<PathBuf>,
    user_input: Option<String>,
) -> i32 {
    let limits = RunLimits::from_env();
    let run_config = RunConfig {
        base_url,
        spec_path,
        structural,
        functional,
        env_init_script,
        user_input,
        limits,
    };

    if let Err(e) = run_config.validate() {
        error!(error = %e, "invalid run configuration");
        return 1;
    }

    let provider = match ProviderConfig::from_env() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "no LLM provider configured");
            return 1;
        }
    };

    let model = match spec::load(&run_config.spec_path) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to load spec");
            return 1;
        }
    };
    if model.is_empty() {
        error!("spec has no operations to synthesize tests for");
        return 1;
    }

    let oracle = HttpOracle::new(provider, run_config.limits.oracle_timeout);
    let sender = RequestSender::new(run_config.base_url.clone());

    let targets: Vec<String> = model.operations().map(|op| op.op_id.clone()).collect();

    let orchestrator = Orchestrator {
        oracle: Arc::new(oracle),
        model: Arc::new(model),
        sender: Arc::new(sender),
        config: run_config.clone(),
        runner: Arc::new(NoopRunner),
    };

    let output = orchestrator.run(&targets).await;

    let spec_name = run_config
        .spec_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("spec");
    let run_dir = PathBuf::from(format!("{}.{}", spec_name, Utc::now().format("%Y%m%d_%H%M%S")));

    if let Err(e) = write_run_output(&run_dir, &output) {
        error!(error = %e, "failed to write run output to disk");
        return 1;
    }

    let summary_json = serde_json::to_string_pretty(&output.summary).unwrap_or_default();
    println!("JSON_RESULTS_START");
    println!("{}", summary_json);
    println!("JSON_RESULTS_END");

    info!(
        successful = output.summary.successful_operations,
        server_errors = output.summary.server_errors,
        tests = output.summary.total_tests,
        failed = output.summary.failed_tests,
        "generation complete"
    );

    0
}

fn write_run_output(run_dir: &PathBuf, output: &orchestrator::RunOutput) -> std::io::Result<()> {
    std::fs::create_dir_all(run_dir.join("tests"))?;
    std::fs::create_dir_all(run_dir.join("reports"))?;
    std::fs::create_dir_all(run_dir.join("combined_data"))?;
    std::fs::create_dir_all("output")?;

    for (suite_name, artifacts) in &output.artifacts {
        let suite_dir = run_dir.join("tests").join(suite_name);
        std::fs::create_dir_all(&suite_dir)?;
        let combined_dir = run_dir.join("combined_data").join(suite_name);
        std::fs::create_dir_all(&combined_dir)?;

        for artifact in artifacts {
            let artifact_path = suite_dir.join(format!("{}.postman_collection.json", artifact.name));
            let json = serde_json::to_string_pretty(artifact).unwrap_or_default();
            std::fs::write(&artifact_path, json)?;

            let combined_path = combined_dir.join(format!("{}.json", artifact.name));
            std::fs::write(&combined_path, serde_json::to_string_pretty(artifact).unwrap_or_default())?;
        }
    }

    for report in &output.reports {
        let report_path = run_dir.join("reports").join(format!("{}.json", report.suite_name));
        std::fs::write(&report_path, serde_json::to_string_pretty(report).unwrap_or_default())?;
    }

    let failed: Vec<&orchestrator::FailedMaterializationRecord> =
        output.outcomes.iter().flat_map(|o| o.failed_materializations.iter()).collect();
    if !failed.is_empty() {
        std::fs::write(
            run_dir.join("failed_testcase_value_generations.json"),
            serde_json::to_string_pretty(&failed).unwrap_or_default(),
        )?;
    }

    let summary_json = serde_json::to_string_pretty(&output.summary).unwrap_or_default();
    std::fs::write(run_dir.join("results.json"), &summary_json)?;
    std::fs::write("output/results.json", &summary_json)?;

    Ok(())
}
