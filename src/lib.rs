//! This crate provides padocc, a pipeline that aggregates collections of archived data files into
//! cloud-optimised products. Each collection is a *project*; projects are organised in *groups*
//! and taken through four phases:
//!
//! * `init` creates the project files from a manifest of file patterns.
//! * `scan` converts a sample of the source files and estimates the size and run time of the
//!   full conversion.
//! * `compute` builds the product: a kerchunk reference file or store, a rechunked zarr store or
//!   a CFA aggregation file.
//! * `validate` compares the product against its source files.
//!
//! All state lives on the filesystem, under a working directory:
//!
//! ```text
//! <workdir>/groups/<group_id>/{datasets.csv, faultlist.csv, proj_codes/}
//! <workdir>/in_progress/<group_id>/<proj_code>/
//! <workdir>/complete/<group_id>/
//! ```
//!
//! The pipeline is built on top of a number of open source components.
//!
//! * [Tokio](tokio) runs the shepherd, which repeatedly advances the projects of many groups.
//! * [Serde](serde) performs (de)serialisation of JSON and YAML files.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays used when
//!   comparing products with their source data.
//! * [clap] parses the command line and [tracing](::tracing) provides logging.

pub mod allocate;
pub mod app;
pub mod array;
pub mod bypass;
pub mod cfa;
pub mod cli;
pub mod combine;
pub mod compression;
pub mod dataset;
pub mod drivers;
pub mod error;
pub mod filehandlers;
pub mod filters;
pub mod group;
pub mod metrics;
pub mod models;
pub mod phases;
pub mod project;
pub mod rechunk;
pub mod references;
pub mod shepherd;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
pub mod utils;
