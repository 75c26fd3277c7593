use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trenchd")]
#[command(about = "Driver CLI around the trench-core interprocedural taint fixpoint")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration (built-in defaults overlaid with
    /// the user's TOML file, if any).
    Config,

    /// Parse and validate a rules JSON document.
    Rules {
        /// Path to a rules JSON document (a list of rule definitions).
        path: String,
    },

    /// Run the fixpoint end-to-end against a small embedded program, to
    /// smoke-test that the callgraph and fixpoint are wired correctly.
    Demo,
}
