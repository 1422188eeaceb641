use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Match a HEC-RAS model to the National Water Model network and build
/// per-reach rating curves.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON settings file; built-in defaults when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Worker threads, defaults to the number of CPUs
    #[arg(short, long, global = true)]
    pub threads: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Conflate a source model against the reference network
    Conflate {
        /// Reference network layer (GeoJSON)
        network: PathBuf,
        /// Directory holding the source model layers
        model: PathBuf,
        #[arg(short, long, default_value = "conflation.json")]
        output: PathBuf,
    },

    /// Print the processing order of a conflation file
    RunOrder { conflation: PathBuf },

    /// Resample a flow,depth CSV onto an evenly stepped depth axis
    Increment {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Depth step, overrides the configured increment
        #[arg(short, long)]
        step: Option<f64>,
    },

    /// Drive every conflated reach through the hydraulic solver
    Run {
        conflation: PathBuf,
        /// Solver executable, called as `<solver> [args..] <request.json> <output.csv>`
        #[arg(long)]
        solver: PathBuf,
        #[arg(long = "solver-arg", allow_hyphen_values = true)]
        solver_args: Vec<String>,
        #[arg(long, default_value = "solver_work")]
        work_dir: PathBuf,
        #[arg(long, default_value = "rating_curves.db")]
        db: PathBuf,
        /// Also dump every stored rating curve row to this CSV
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

pub fn get_args() -> Cli {
    Cli::parse()
}
