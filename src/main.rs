use anyhow::{Context, Result};
use log::{info, warn};
use std::process::ExitCode;

use telco_xml_tables::bulkcm;
use telco_xml_tables::cli::{BulkCmCommand, Cli, Command, MeasCommand};
use telco_xml_tables::config::{Config, ConfigManager};
use telco_xml_tables::pipeline::{ExtractionPipeline, RunOutcome};
use telco_xml_tables::router::SinkRouter;
use telco_xml_tables::storage::LocalStorage;
use telco_xml_tables::tables::CounterTableWriter;

/// Exit status of a run stopped by Ctrl-C
const INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    env_logger::Builder::new()
        .filter_level(cli.verbosity().level_filter())
        .parse_env("TELCO_XML_LOG")
        .format_timestamp_millis()
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = ConfigManager::load_config(&cli)
        .await
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Bulkcm {
            command: BulkCmCommand::Parse(args),
        } => parse_bulkcm(args.file, &config).await,
        Command::Bulkcm {
            command: BulkCmCommand::Probe { file },
        } => {
            let report = tokio::task::spawn_blocking(move || bulkcm::probe(&file)).await??;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Meas {
            command: MeasCommand::Parse(args),
        } => parse_meas(&args.pattern, &config).await,
    }
}

async fn parse_bulkcm(file: std::path::PathBuf, config: &Config) -> Result<ExitCode> {
    let storage = LocalStorage::new(&config.output.location);
    let filter = config.element_filter();
    let source = file.clone();
    let report = tokio::task::spawn_blocking(move || bulkcm::parse_file(&file, storage, filter))
        .await?
        .with_context(|| format!("Failed to parse {}", source.display()))?;

    for sink in &report.sinks {
        info!("{}: {} rows", sink.name, sink.rows);
    }
    println!(
        "{}: {} records in {} tables, metadata in {} ({:.2?})",
        report.file.display(),
        report.stats.emitted,
        report.sinks.len(),
        report.metadata_key,
        report.duration
    );
    Ok(ExitCode::SUCCESS)
}

async fn parse_meas(pattern: &str, config: &Config) -> Result<ExitCode> {
    let storage = LocalStorage::new(&config.output.location);
    let router = SinkRouter::new(storage, config.output.format);
    let writer = CounterTableWriter::new(router, config.counter_layout());
    let pipeline = ExtractionPipeline::new(config.pipeline_options(pattern), writer);

    let interrupted = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    let report = pipeline
        .run_until(interrupted)
        .await
        .with_context(|| format!("Counter extraction from {} failed", pattern))?;

    println!(
        "{} files, {} items, {} rows in {} tables ({:.2?})",
        report.files.len(),
        report.items,
        report.rows,
        report.sinks.len(),
        report.duration
    );
    match report.outcome {
        RunOutcome::Completed => Ok(ExitCode::SUCCESS),
        RunOutcome::Cancelled => {
            eprintln!("Interrupted, open tables were flushed and closed");
            Ok(ExitCode::from(INTERRUPTED))
        }
    }
}
