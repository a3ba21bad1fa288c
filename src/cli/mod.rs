//! Command line interface for mkdmg.
//!
//! Parses arguments, merges them over an optional JSON config file and runs
//! the full build lifecycle.

mod args;

pub use args::Args;

use std::io::Write;
use std::time::Duration;

use crate::dmg::{CommandExecutor, Config, Runner, SystemExecutor};
use crate::error::{CliError, Result};

/// Main CLI entry point
pub async fn run() -> Result<i32> {
    let args = Args::parse_args();
    run_with(args).await
}

/// Runs the CLI with already-parsed arguments.
pub async fn run_with(args: Args) -> Result<i32> {
    let config = resolve_config(&args)?;

    if args.dump_config {
        dump_config(&config, std::io::stdout().lock())?;
        return Ok(0);
    }

    for (argument, value) in [("SOURCE_DIR", &config.source_dir), ("OUTPUT", &config.output_path)] {
        if value.is_empty() {
            return Err(CliError::MissingArgument {
                argument: argument.to_string(),
            }
            .into());
        }
    }

    let executor = match args.timeout {
        Some(secs) => SystemExecutor::with_timeout(Duration::from_secs(secs)),
        None => SystemExecutor::new(),
    };

    let mut runner = Runner::with_executor(config, executor);
    let result = build(&mut runner).await;
    runner.cleanup();
    result.map(|()| 0)
}

/// Loads `--config` if given and applies the command line flags.
pub fn resolve_config(args: &Args) -> Result<Config> {
    let base = match &args.config {
        Some(path) => {
            log::debug!("Loading config from {}", path.display());
            Config::load(path)?
        }
        None => Config::default(),
    };
    Ok(args.merge_into(base))
}

/// Writes the merged config as JSON.
pub fn dump_config<W: Write>(config: &Config, out: W) -> Result<()> {
    config.to_json(out)?;
    Ok(())
}

/// Runs every build stage in order, tagging failures with the stage name.
pub async fn build<E: CommandExecutor>(runner: &mut Runner<E>) -> Result<()> {
    macro_rules! stage {
        ($name:literal, $call:expr) => {
            $call.await.map_err(|source| CliError::StageFailed {
                stage: $name,
                source,
            })?
        };
    }

    // Validation errors are reported as-is rather than as a failed stage.
    runner.setup().await?;
    stage!("create", runner.start());
    stage!("attach", runner.attach_disk_image());
    if let Err(source) = runner.bless().await {
        // Leave nothing mounted over the temp dir that cleanup removes.
        if let Err(e) = runner.detach_disk_image().await {
            log::warn!("Failed to detach after bless error: {}", e);
        }
        return Err(CliError::StageFailed { stage: "bless", source }.into());
    }
    stage!("detach", runner.detach_disk_image());
    stage!("convert", runner.finalize_dmg());
    stage!("codesign", runner.codesign());
    stage!("notarize", runner.notarize());
    let checksum = stage!("checksum", runner.generate_checksum());

    if let Some(output) = runner.output_path() {
        log::info!("✓ {} ready", output.display());
    }
    if let Some(sidecar) = checksum {
        log::info!("✓ checksum at {}", sidecar.display());
    }
    Ok(())
}
