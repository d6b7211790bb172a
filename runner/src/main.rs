mod cli;

use clap::Parser;
use cli::{Cli, Command};
use kpath_runner::{
    config::{ConfigErrors, PipelineConfig},
    executors::Schedulers,
    pipeline::{Pipeline, PipelineError},
    sync::{signals::cancel_on_signal, CancellationToken},
};
use std::{path::Path, process::ExitCode};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the configuration file if one was given, apply the flags and validate the result
fn load_config(
    path: Option<&Path>,
    submitting: bool,
    overrides: impl FnOnce(&mut PipelineConfig),
) -> Result<PipelineConfig, ConfigErrors> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    overrides(&mut config);

    if config.preflight_checks(submitting) {
        return Err(ConfigErrors::Invalid);
    }

    Ok(config)
}

fn execute(cli: Cli) -> Result<(), PipelineError> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Run { paths, polling } => {
            // before anything spawns threads, they inherit the blocked signal mask
            let cancel = CancellationToken::new();
            if let Err(error) = cancel_on_signal(cancel.clone()) {
                warn!("Failed to install signal handling, interrupting will not stop gracefully: {error}");
            }

            let config = load_config(config_path, true, |config| {
                paths.apply(config);
                polling.apply(config);
            })?;

            let scheduler = Schedulers::load(&config.scheduler)?;
            let merged = Pipeline::new(&config).run(scheduler, cancel)?;

            info!(
                rows = merged.rows,
                "Band structure written to {}",
                merged.path.display()
            );
        }
        Command::Prepare { paths } => {
            let config = load_config(config_path, false, |config| paths.apply(config))?;
            let prepared = Pipeline::new(&config).prepare()?;

            info!(
                "Submit the {} scripts, then run `kpath combine` to write {}",
                prepared.scripts.len(),
                prepared.destination().display()
            );
            for script in &prepared.scripts {
                println!("{}", script.display());
            }
        }
        Command::Combine { paths } => {
            let config = load_config(config_path, false, |config| paths.apply(config))?;
            let merged = Pipeline::new(&config).combine_existing()?;

            info!(
                rows = merged.rows,
                "Band structure written to {}",
                merged.path.display()
            );
        }
        Command::Convert { input } => {
            kpath_ingest::convert(&input)?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(stage = error.stage(), segment = ?error.segment(), "{error}");

            ExitCode::FAILURE
        }
    }
}
