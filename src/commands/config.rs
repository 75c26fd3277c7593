use console::style;
use trench_core::config::Configuration;
use trench_core::errors::{TrenchError, TrenchResult};

/// Prints the effective [`Configuration`] as pretty-printed TOML.
pub fn handle(config: &Configuration) -> TrenchResult<()> {
    println!("{}", style("Effective configuration").green().bold());
    let text = toml::to_string_pretty(config).map_err(|e| TrenchError::Msg(e.to_string()))?;
    println!("{text}");
    Ok(())
}
