mod cli;
mod commands;

use clap::Parser;
use cli::Cli;
use console::style;
use directories::ProjectDirs;
use std::fs;
use std::time::Instant;
use tracing_subscriber::fmt::time;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};
use trench_core::config::Configuration;
use trench_core::errors::{TrenchError, TrenchResult};

fn init_tracing() {
    let fmt_layer = fmt::layer()
        .pretty()
        .with_thread_ids(true)
        .with_timer(time::UtcTime::rfc_3339());

    Registry::default()
        .with(EnvFilter::from_default_env())
        .with(fmt_layer)
        .init();
}

fn main() -> TrenchResult<()> {
    let now = Instant::now();
    init_tracing();

    tracing::debug!("trenchd starting up");
    let cli = Cli::parse();

    let proj_dirs = ProjectDirs::from("dev", "trench", "trenchd")
        .ok_or_else(|| TrenchError::from("unable to determine project directories"))?;

    let config_dir = proj_dirs.config_dir();
    fs::create_dir_all(config_dir)?;

    let config = Configuration::load(&config_dir.join("trench.toml"))?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads())
        .build_global()
        .expect("set rayon pool size");

    commands::handle_command(cli.command, &config)?;

    println!(
        "{} in {:.3}s.",
        style("Finished").green().bold(),
        now.elapsed().as_secs_f32()
    );
    Ok(())
}
