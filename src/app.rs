//! Dispatch of command line operations.

use crate::allocate::{self, AllocateOptions};
use crate::cli::{CommandLineArgs, Operation};
use crate::error::PadoccError;
use crate::group::{GroupOperation, RunOptions};
use crate::project::{CloudFormat, Phase, ProjectOperation};
use crate::shepherd::{Shepherd, ShepherdConfig};

use std::path::Path;
use tracing::info;

/// Run the operation selected on the command line.
pub async fn run(args: &CommandLineArgs) -> Result<(), PadoccError> {
    let workdir = args.workdir()?;
    let mode = args
        .mode
        .as_deref()
        .map(str::parse::<CloudFormat>)
        .transpose()?;

    match args.operation {
        Operation::Init => {
            let input = args.input.as_deref().ok_or_else(|| {
                PadoccError::InvalidConfig("an input file is required for init".to_string())
            })?;
            group(args, &workdir)?.init_from_file(input)
        }
        Operation::Scan => run_phase(args, &workdir, Phase::Scan, mode),
        Operation::Compute => run_phase(args, &workdir, Phase::Compute, mode),
        Operation::Validate => run_phase(args, &workdir, Phase::Validate, mode),
        Operation::Status => {
            let report = group(args, &workdir)?.summarise_status(&args.repeat_id, args.write)?;
            println!("{}", report);
            Ok(())
        }
        Operation::Summarise => {
            let summary = group(args, &workdir)?.summarise_data(&args.repeat_id)?;
            println!("{}", summary);
            Ok(())
        }
        Operation::Allocate => {
            let phase: Phase = args.allocate_phase.parse()?;
            let options = AllocateOptions {
                band_increase: args.band_increase,
                binpack: args.binpack,
            };
            let mut group = group(args, &workdir)?;
            for allocation in
                allocate::assemble_allocations(&mut group, phase, &args.repeat_id, options)?
            {
                println!(
                    "{}: {} jobs of {}",
                    allocation.label, allocation.count, allocation.time
                );
            }
            Ok(())
        }
        Operation::Shepherd => {
            let conf = args.conf.as_deref().ok_or_else(|| {
                PadoccError::InvalidConfig("a shepherd config file is required".to_string())
            })?;
            let shepherd = Shepherd::new(ShepherdConfig::load(conf)?, args.settings());
            let cycles = shepherd.activate(args.shepherd_mode).await?;
            info!("Shepherd finished after {} cycles", cycles);
            Ok(())
        }
    }
}

fn group(args: &CommandLineArgs, workdir: &Path) -> Result<GroupOperation, PadoccError> {
    let group_id = args.group_id.as_deref().ok_or_else(|| {
        PadoccError::InvalidConfig(format!("a group is required for {:?}", args.operation))
    })?;
    GroupOperation::new(group_id, workdir, args.settings())
}

/// Run a phase over a group, or over a single project outside any group.
fn run_phase(
    args: &CommandLineArgs,
    workdir: &Path,
    phase: Phase,
    mode: Option<CloudFormat>,
) -> Result<(), PadoccError> {
    if args.group_id.is_some() {
        let options = RunOptions {
            mode,
            repeat_id: args.repeat_id.clone(),
            proj_code: args.proj_code.clone(),
            subset: args.subset(),
            subset_bypass: args.subset_bypass,
            bypass: None,
        };
        let results = group(args, workdir)?.run(phase, &options)?;
        for (status, count) in results {
            println!("{}: {}", status, count);
        }
        return Ok(());
    }
    let proj_code = args.proj_code.as_deref().ok_or_else(|| {
        PadoccError::InvalidConfig("either a group or a project code is required".to_string())
    })?;
    let mut project = ProjectOperation::new(proj_code, workdir, None, args.settings());
    let status = project.run(phase, mode, false)?;
    println!("{}: {}", proj_code, status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::group::MAIN;
    use crate::project::ProjectSettings;
    use clap::Parser;
    use std::fs;

    fn args(argv: &[&str]) -> CommandLineArgs {
        CommandLineArgs::try_parse_from(argv).unwrap()
    }

    #[tokio::test]
    async fn init_then_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = tmp.path().to_string_lossy().into_owned();
        let workdir = workdir.as_str();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("a.nc"), "").unwrap();
        let listing = data.join("a.txt");
        fs::write(&listing, data.join("a.nc").to_string_lossy().as_bytes()).unwrap();
        let input = tmp.path().join("input.csv");
        fs::write(&input, format!("a,{},,\n", listing.display())).unwrap();

        let input = input.to_string_lossy().into_owned();
        let input = input.as_str();
        run(&args(&["padocc", "init", "-w", workdir, "-G", "g1", "-i", input]))
            .await
            .unwrap();
        run(&args(&["padocc", "scan", "-w", workdir, "-G", "g1"]))
            .await
            .unwrap();

        let mut group = GroupOperation::new("g1", tmp.path(), ProjectSettings::default()).unwrap();
        assert_eq!(vec!["a"], group.get_codes(MAIN).unwrap());
        let last = group.get_project("a").get_last_status().unwrap().unwrap();
        assert_eq!("scan", last[0]);
    }

    #[tokio::test]
    async fn missing_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = tmp.path().to_string_lossy().into_owned();
        let workdir = workdir.as_str();
        for argv in [
            vec!["padocc", "init", "-w", workdir, "-G", "g1"],
            vec!["padocc", "status", "-w", workdir],
            vec!["padocc", "scan", "-w", workdir],
            vec!["padocc", "shepherd", "-w", workdir],
            vec!["padocc", "scan", "-w", workdir, "-p", "a", "-C", "netcdf"],
        ] {
            assert!(run(&args(&argv)).await.is_err());
        }
    }
}
