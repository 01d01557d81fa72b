//! CLI argument definitions: top-level `Cli` struct and `Commands` enum.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub(crate) const CLI_LONG_ABOUT: &str =
    "Verification and fence insertion for concurrent programs under weak memory models.\n\n\
    Typical usage:\n  \
    1. memorax reach program.rmm -a sb\n  \
    2. memorax fencins program.rmm -a sb --fmin subset\n  \
    3. memorax dotify program.rmm -o program.pdf\n\n\
    Programs are read from stdin when no file is given.";

#[derive(Parser)]
#[command(name = "memorax")]
#[command(about = "Verification and fence insertion for weak memory models")]
#[command(long_about = CLI_LONG_ABOUT)]
#[command(version)]
pub(crate) struct Cli {
    /// Print verbosely (-v progress, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Additionally emit one machine-readable JSON result line
    #[arg(long, global = true)]
    pub(crate) json: bool,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// The analyzed abstraction of the memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Abstraction {
    /// Single Buffer; equivalent to TSO for control-state reachability
    Sb,
    /// Predicate-abstracted TSO with bounded buffers
    Pb,
    /// TSO with one channel per process
    Pdual,
    /// VIPS-M, explicit-state forward analysis
    Vips,
}

impl Abstraction {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Abstraction::Sb => "sb",
            Abstraction::Pb => "pb",
            Abstraction::Pdual => "pdual",
            Abstraction::Vips => "vips",
        }
    }
}

/// Minimality criterion for fence insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum FMin {
    /// Locked-write universe only; greedy
    Cheap,
    /// All subset-minimal synchronization sets
    Subset,
    /// Synchronization sets of least cardinality
    Cost,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Check reachability of the forbidden control states
    #[command(display_order = 10)]
    Reach {
        /// Path to the .rmm program; stdin when omitted
        file: Option<PathBuf>,

        /// Abstraction to analyze under
        #[arg(short, long, value_enum, default_value = "sb")]
        abstraction: Abstraction,

        /// Buffer bound per process (pb only)
        #[arg(short, default_value_t = 1)]
        k: usize,

        /// Use CEGAR refinement (pb only)
        #[arg(long)]
        cegar: bool,

        /// Perform at most this many refinements (with --cegar)
        #[arg(long)]
        max_refinements: Option<usize>,

        /// Convert the program to register free form first
        #[arg(long)]
        rff: bool,
    },

    /// Compute minimal fence sets making the forbidden states unreachable
    #[command(display_order = 11)]
    Fencins {
        /// Path to the .rmm program; stdin when omitted
        file: Option<PathBuf>,

        /// Abstraction to analyze under
        #[arg(short, long, value_enum, default_value = "sb")]
        abstraction: Abstraction,

        /// Minimality criterion (default: cheap; subset for vips)
        #[arg(long = "fmin", value_enum)]
        fmin: Option<FMin>,

        /// Stop after the first sufficient, minimal fence set
        #[arg(long = "only-one", short = 'o')]
        only_one: bool,

        /// Buffer bound per process (pb only)
        #[arg(short, default_value_t = 1)]
        k: usize,

        /// Use CEGAR refinement (pb only)
        #[arg(long)]
        cegar: bool,

        /// Perform at most this many refinements (with --cegar)
        #[arg(long)]
        max_refinements: Option<usize>,

        /// Convert the program to register free form first
        #[arg(long)]
        rff: bool,
    },

    /// Render the compiled automata to a pdf via graphviz
    #[command(display_order = 12)]
    Dotify {
        /// Path to the .rmm program; stdin when omitted
        file: Option<PathBuf>,

        /// Output pdf file
        #[arg(short, long)]
        output: PathBuf,

        /// Convert the program to register free form first
        #[arg(long)]
        rff: bool,
    },
}
