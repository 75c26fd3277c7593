pub mod config;
pub mod demo;
pub mod rules;

use crate::cli::Commands;
use trench_core::config::Configuration;
use trench_core::errors::TrenchResult;

pub fn handle_command(command: Commands, active_config: &Configuration) -> TrenchResult<()> {
    match command {
        Commands::Config => config::handle(active_config),
        Commands::Rules { path } => rules::handle(&path),
        Commands::Demo => demo::handle(active_config),
    }
}
