//! CLI Module
//!
//! Command-line interface for inspecting the conversion graph, geometry
//! strings and parameter files.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// segcore inspection tool
#[derive(Parser, Debug)]
#[command(name = "segcore-cli")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List registered conversion rules with costs and parameters
    #[command(name = "rules")]
    Rules,

    /// Show every conversion path between two representations
    #[command(name = "paths")]
    Paths {
        /// Source representation name
        from: String,

        /// Target representation name
        to: String,
    },

    /// Decode a serialized image geometry string
    #[command(name = "geometry")]
    Geometry {
        /// 16 matrix values and 6 extent values, ';'-separated
        geometry: String,
    },

    /// Validate a serialized conversion parameter file
    #[command(name = "params")]
    Params {
        /// File holding name|value|description& entries
        path: PathBuf,
    },

    /// Build a sphere segment, convert it and print a JSON summary
    #[command(name = "demo")]
    Demo {
        /// Sphere radius in voxels
        #[arg(short, long, default_value_t = 6.0)]
        radius: f64,

        /// Surface smoothing factor (0 to 1)
        #[arg(short, long, default_value_t = 0.5)]
        smoothing: f64,
    },
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second installation (tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
