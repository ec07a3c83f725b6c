use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use batchforge::aggregator::AggregateOutcome;
use batchforge::cli::{Cli, Command};
use batchforge::config::BatchConfig;
use batchforge::dispatcher::JobOutcome;
use batchforge::engine::{self, Engine};
use batchforge::error::BatchError;
use batchforge::generator::EchoGenerator;
use batchforge::input;
use batchforge::job::Payload;
use batchforge::recovery::RecoveryOutcome;
use batchforge::store::job_status;
use batchforge::ui::{JobProgress, status_line};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = BatchConfig::load()?.apply_overrides(&cli.overrides())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Command::Run {
                input,
                dry_run,
                sequence,
            } => {
                let config = if sequence {
                    config.clone().with_default_sequence()
                } else {
                    config.clone()
                };
                run(&config, &input, dry_run).await
            }
            Command::Status { job_id } => status(&config, &job_id),
            Command::Recover { job_id } => recover(&config, &job_id),
        }
    })
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "batchforge=debug" } else { "batchforge=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: &BatchConfig, path: &Path, dry_run: bool) -> Result<()> {
    let rows = input::read_rows(path)?;
    if dry_run {
        drive(Engine::start(config, EchoGenerator)?, rows).await
    } else {
        let generator = engine::http_generator(config)?;
        drive(Engine::start(config, generator)?, rows).await
    }
}

async fn drive(engine: Engine, rows: Vec<Payload>) -> Result<()> {
    let total = rows.len();
    let job_id = engine.submit(rows)?;
    println!("Job {job_id} submitted ({total} rows)");

    let progress = JobProgress::start(&job_id, total);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let wait = engine.wait(&job_id);
    tokio::pin!(wait);

    let mut cancelled = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            _ = ticker.tick() => progress.update(&engine.status(&job_id)?),
            signal = tokio::signal::ctrl_c(), if !cancelled => {
                signal?;
                progress.note("Interrupted, cancelling job");
                engine.cancel(&job_id)?;
                cancelled = true;
            }
        }
    };

    progress.complete(&engine.status(&job_id)?);
    match outcome {
        Some(JobOutcome::Finished(AggregateOutcome::Combined(report))) => {
            println!("  Artifact: {} ({})", report.artifact.path.display(), report.artifact.format);
        }
        Some(JobOutcome::Finished(AggregateOutcome::Failed { error })) => {
            println!("  Combine failed: {error}");
            println!("  Run `batchforge recover {job_id}` for a partial artifact.");
        }
        Some(JobOutcome::Incomplete { arrived, expected }) => {
            println!("  Only {arrived}/{expected} tasks reported before the join timeout.");
            println!("  Run `batchforge recover {job_id}` for a partial artifact.");
        }
        Some(JobOutcome::Cancelled) => println!("  Job cancelled."),
        None => println!("  Job outcome unavailable."),
    }

    engine.shutdown().await;
    Ok(())
}

fn status(config: &BatchConfig, job_id: &str) -> Result<()> {
    let store = engine::open_store(config)?;
    match job_status(store.as_ref(), job_id)? {
        Some(record) => {
            println!("{job_id}: {}", status_line(&record));
            Ok(())
        }
        None => Err(BatchError::JobNotFound(job_id.to_string()).into()),
    }
}

fn recover(config: &BatchConfig, job_id: &str) -> Result<()> {
    let store = engine::open_store(config)?;
    match engine::recovery_engine(config, &store).recover(job_id)? {
        RecoveryOutcome::Recovered(report) => {
            println!(
                "Recovered {} rows ({} ok, {} errors) into {}",
                report.artifact.rows,
                report.succeeded,
                report.errors,
                report.artifact.path.display()
            );
            if let Some(missing) = report.missing.filter(|m| *m > 0) {
                println!("{missing} rows had no persisted result.");
            }
            Ok(())
        }
        RecoveryOutcome::NotRecoverable(why) => bail!("not recoverable: {why}"),
    }
}
