//! Command Line Interface (CLI) arguments.

use crate::bypass::{BypassSwitch, DEFAULT_SWITCH};
use crate::filehandlers::FileOptions;
use crate::project::ProjectSettings;
use crate::shepherd::ShepherdMode;

use clap::Parser;
use expanduser::expanduser;
use std::io;
use std::path::PathBuf;

/// Operations of the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Operation {
    /// Create the projects of a group from an input file
    Init,
    /// Sample the source files of each project
    Scan,
    /// Build the cloud product of each project
    Compute,
    /// Compare each cloud product with its source
    Validate,
    /// Summarise the last status of every project in a group
    Status,
    /// Summarise data volumes and formats in a group
    Summarise,
    /// Assign the projects of a group to job arrays
    Allocate,
    /// Advance every group of a flock directory through the pipeline
    Shepherd,
}

/// padocc command line interface
#[derive(Clone, Debug, Parser)]
#[command(version, about = "Run a pipeline step for a group of datasets")]
pub struct CommandLineArgs {
    /// Operation to run
    #[arg(value_enum)]
    pub operation: Operation,
    /// Working directory of the pipeline
    #[arg(short, long, default_value = ".", env = "PADOCC_WORKDIR")]
    pub workdir: String,
    /// Group identifier
    #[arg(short = 'G', long = "group", env = "PADOCC_GROUP")]
    pub group_id: Option<String>,
    /// Single project, by code or index within the selected subset
    #[arg(short, long)]
    pub proj_code: Option<String>,
    /// Subset of project codes to run over
    #[arg(short, long, default_value = "main")]
    pub repeat_id: String,
    /// Number of projects per job when splitting a subset
    #[arg(short, long)]
    pub subset: Option<usize>,
    /// Index of the slice to run when splitting a subset
    #[arg(long, default_value_t = 0, env = "SLURM_ARRAY_TASK_ID")]
    pub subset_id: usize,
    /// Cloud format to pin: kerchunk, zarr or CFA
    #[arg(short = 'C', long = "cloud-format")]
    pub mode: Option<String>,
    /// Input file for init: .csv manifest, .txt list of paths or .json project config
    #[arg(short, long)]
    pub input: Option<PathBuf>,
    /// Bypass switch letters, see the switch help below
    #[arg(
        short,
        long = "bypass-errs",
        default_value = DEFAULT_SWITCH,
        env = "PADOCC_BYPASS",
        long_help = BypassSwitch::help()
    )]
    pub bypass: String,
    /// Perform a dry run, no files are written
    #[arg(short, long, default_value_t = false)]
    pub dryrun: bool,
    /// Overwrite existing products
    #[arg(short, long, default_value_t = false)]
    pub forceful: bool,
    /// Start from scratch, ignoring cached intermediate products
    #[arg(short = 'T', long, default_value_t = false)]
    pub thorough: bool,
    /// Create a new version when a product already exists
    #[arg(short, long, default_value_t = false)]
    pub new_version: bool,
    /// Memory allowance for rechunking (e.g. "2GB")
    #[arg(short = 'M', long, default_value = "100MB")]
    pub memory: String,
    /// Batch job identifier recorded in the status log
    #[arg(long, env = "SLURM_JOB_ID")]
    pub job_id: Option<String>,
    /// Record failures as a tally instead of stopping the run
    #[arg(long, default_value_t = false)]
    pub subset_bypass: bool,
    /// Rewrite pending jobs older than a day as cancelled when summarising status
    #[arg(short = 'W', long, default_value_t = false)]
    pub write: bool,
    /// Phase to allocate jobs for
    #[arg(long, default_value = "compute")]
    pub allocate_phase: String,
    /// Bin-pack projects with time estimates
    #[arg(short = 'A', long = "alloc-bins", default_value_t = false)]
    pub binpack: bool,
    /// Allow band increases relative to the previous run
    #[arg(long = "allow-band-increase", default_value_t = false)]
    pub band_increase: bool,
    /// Shepherd YAML configuration
    #[arg(short = 'c', long = "conf", env = "PADOCC_SHEPHERD_CONF")]
    pub conf: Option<PathBuf>,
    /// Shepherd deployment mode
    #[arg(long, value_enum, default_value = "batch")]
    pub shepherd_mode: ShepherdMode,
    /// Verbosity, repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl CommandLineArgs {
    /// Working directory with `~` expanded.
    pub fn workdir(&self) -> io::Result<PathBuf> {
        expanduser(&self.workdir)
    }

    /// `(size, id)` slice of the subset, if splitting.
    pub fn subset(&self) -> Option<(usize, usize)> {
        self.subset.map(|size| (size, self.subset_id))
    }

    /// Project settings from the run flags.
    pub fn settings(&self) -> ProjectSettings {
        ProjectSettings {
            options: FileOptions {
                dryrun: self.dryrun,
                forceful: self.forceful,
            },
            thorough: self.thorough,
            bypass: BypassSwitch::new(&self.bypass),
            job_id: self.job_id.clone(),
            new_version: self.new_version,
            mem_allowed: self.memory.clone(),
            ..Default::default()
        }
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
