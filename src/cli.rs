use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::router::OutputFormat;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    /// Only show errors
    Quiet,
    /// Show warnings and the run summary
    #[default]
    Normal,
    /// Show progress per file and sink
    Verbose,
    /// Show per-element tracing
    Debug,
}

impl VerbosityLevel {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Error,
            VerbosityLevel::Normal => LevelFilter::Warn,
            VerbosityLevel::Verbose => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
        }
    }
}

/// Flatten 3GPP BulkCM and performance-counter XML into tables
#[derive(Parser, Debug, Clone)]
#[command(name = "telco-xml-tables")]
#[command(about = "Flatten telecom XML exports into CSV and Parquet tables")]
#[command(version)]
pub struct Cli {
    /// Increase log output (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Errors only
    #[arg(short = 'q', long = "quiet", global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (TOML or JSON)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// BulkCM configuration files (TS 32.615)
    Bulkcm {
        #[command(subcommand)]
        command: BulkCmCommand,
    },
    /// Performance-counter files (TS 32.401 mdc, TS 32.435 measCollec)
    Meas {
        #[command(subcommand)]
        command: MeasCommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum BulkCmCommand {
    /// Flatten one file into CSV tables
    Parse(BulkCmParseArgs),
    /// Count SubNetworks and network elements
    Probe {
        file: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct BulkCmParseArgs {
    pub file: PathBuf,

    /// Output directory
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Element types to emit (comma-separated)
    #[arg(short = 'i', long = "include", value_delimiter = ',', action = ArgAction::Append)]
    pub include: Vec<String>,

    /// Element types to skip, `*` for all not included
    #[arg(short = 'e', long = "exclude", value_delimiter = ',', action = ArgAction::Append)]
    pub exclude: Vec<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum MeasCommand {
    /// Extract counter tables from every file matching a glob pattern
    Parse(MeasParseArgs),
}

#[derive(Args, Debug, Clone)]
pub struct MeasParseArgs {
    /// Glob pattern, e.g. 'data/mdc*.xml'
    pub pattern: String,

    /// Output directory
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Let `**` descend into subdirectories
    #[arg(short = 'r', long = "recursive")]
    pub recursive: bool,

    #[arg(short = 'f', long = "format", value_enum)]
    pub format: Option<FormatArg>,

    #[arg(long = "layout", value_enum)]
    pub layout: Option<LayoutArg>,

    /// Drop NEDN pairs before the last occurrence of this type
    #[arg(long = "nedn-ignore-before")]
    pub nedn_ignore_before: Option<String>,

    /// Drop LDN pairs before the last occurrence of this type
    #[arg(long = "ldn-ignore-before")]
    pub ldn_ignore_before: Option<String>,

    /// NEDN type whose id becomes the Node column
    #[arg(long = "node-key")]
    pub node_key: Option<String>,

    /// Put the node id into the Parquet partition path
    #[arg(long = "partition-by-node")]
    pub partition_by_node: bool,

    /// Items buffered between scanner and writer
    #[arg(long = "channel-capacity")]
    pub channel_capacity: Option<usize>,

    /// Cancel the run after this many seconds
    #[arg(long = "deadline")]
    pub deadline: Option<u64>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Csv,
    Parquet,
}

impl From<FormatArg> for OutputFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Csv => OutputFormat::Csv,
            FormatArg::Parquet => OutputFormat::Parquet,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutArg {
    Plain,
    NaturalKey,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        if self.quiet {
            return VerbosityLevel::Quiet;
        }
        match self.verbose {
            0 => VerbosityLevel::Normal,
            1 => VerbosityLevel::Verbose,
            _ => VerbosityLevel::Debug,
        }
    }
}
