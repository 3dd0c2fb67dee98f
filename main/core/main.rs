//! The engine's entry point: parse the command line, load the configuration,
//! start logging, and run the controller.
//!
//! Exit codes: 0 on success, 1 for configuration errors, 2 for runtime
//! errors, 3 when interrupted.

use std::ffi::OsString;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use crate::core::configuration::{CliOptions, ConfigOptions};
use crate::core::controller::{Controller, SimulationOutcome};
use crate::core::logger;

const EXIT_SUCCESS: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_RUNTIME_ERROR: i32 = 2;
const EXIT_INTERRUPTED: i32 = 3;

pub fn run_umbra(args: Vec<OsString>) -> i32 {
    // parse the options from the command line
    let options = match CliOptions::try_parse_from(args) {
        Ok(options) => options,
        Err(e) => {
            // will print to either stdout or stderr with formatting
            e.print().unwrap();
            return if e.use_stderr() {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_SUCCESS
            };
        }
    };

    if options.shm_cleanup {
        return match umbra_shmem::cleanup::remove_stale_files(&umbra_shmem::shmem_dir()) {
            Ok(num_removed) => {
                eprintln!("Removed {num_removed} stale shared-memory files");
                EXIT_SUCCESS
            }
            Err(e) => {
                eprintln!("Cleaning shared memory failed: {e}");
                EXIT_RUNTIME_ERROR
            }
        };
    }

    let config = match load_config(&options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            return EXIT_CONFIG_ERROR;
        }
    };

    if options.show_config {
        eprintln!("{config:#?}");
        return EXIT_SUCCESS;
    }

    // start up the logging subsystem to handle all future messages; a second
    // invocation in the same process (tests) keeps the first logger
    let _ = logger::init(config.general.log_level.into());

    if log::LevelFilter::from(config.general.log_level) > log::STATIC_MAX_LEVEL {
        log::warn!(
            "Log level set to {:?}, but messages higher than {} have been compiled out",
            config.general.log_level,
            log::STATIC_MAX_LEVEL,
        );
    }

    // remove shared-memory files leaked by crashed runs before we create ours
    if let Err(e) = umbra_shmem::cleanup::remove_stale_files(&umbra_shmem::shmem_dir()) {
        log::warn!("Cleaning stale shared-memory files failed: {e}");
    }

    // SIGINT/SIGTERM request a clean shutdown, observed between events
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    for signal in [
        signal_hook::consts::signal::SIGINT,
        signal_hook::consts::signal::SIGTERM,
    ] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&shutdown_flag)) {
            log::warn!("Failed to register handler for signal {signal}: {e}");
        }
    }

    let controller = match Controller::new(&config, shutdown_flag) {
        Ok(controller) => controller,
        Err(e) => {
            log::error!("Configuration error: {e:#}");
            log::logger().flush();
            return EXIT_CONFIG_ERROR;
        }
    };

    let exit_code = match controller.run() {
        Ok(SimulationOutcome::Completed) => EXIT_SUCCESS,
        Ok(SimulationOutcome::Interrupted) => EXIT_INTERRUPTED,
        Err(e) => {
            log::error!("Simulation failed: {e:#}");
            EXIT_RUNTIME_ERROR
        }
    };

    // all managed processes are gone; unlink our shared-memory regions
    umbra_shmem::allocator::release_all_regions();

    log::logger().flush();
    exit_code
}

fn load_config(options: &CliOptions) -> anyhow::Result<ConfigOptions> {
    let config_path = options
        .config
        .as_deref()
        .context("No configuration file given")?;

    // read from stdin if the config filename is given as '-'
    let config_path = match config_path {
        "-" => "/dev/stdin",
        path => path,
    };

    let contents = std::fs::read_to_string(config_path)
        .with_context(|| format!("Reading configuration file {config_path}"))?;

    let mut config: ConfigOptions = serde_yaml::from_str(&contents)
        .with_context(|| format!("Parsing configuration file {config_path}"))?;

    config.apply_cli_overrides(options);
    Ok(config)
}
