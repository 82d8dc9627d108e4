//! segcore CLI - Segmentation Representation Inspector
//!
//! Command-line interface for the segcore conversion graph and geometry
//! helpers.

use clap::Parser;
use tracing::info;

use segcore::cli::{commands, init_tracing, Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("segcore v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd) => handle_command(cmd),
        None => {
            println!("segcore v{}", env!("CARGO_PKG_VERSION"));
            println!("Use --help for available commands");
            Ok(())
        }
    }
}

fn handle_command(cmd: Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Rules => commands::list_rules(),
        Commands::Paths { from, to } => commands::show_paths(&from, &to),
        Commands::Geometry { geometry } => commands::show_geometry(&geometry),
        Commands::Params { path } => commands::check_parameters(&path),
        Commands::Demo { radius, smoothing } => commands::demo(radius, smoothing),
    }
}
