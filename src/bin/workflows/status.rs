use anyhow::Result;
use package_build::runs::{latest_run, latest_successful_run_id, package_runs_dir};
use package_build::Manifest;

use crate::ManifestArgs;

pub(crate) fn status(args: &ManifestArgs, json: bool) -> Result<()> {
    let manifest = Manifest::load(&args.config_path(), &args.work_dir)?;

    for package in manifest.select(&args.only)? {
        let runs_dir = package_runs_dir(&args.work_dir, &package.name);
        let Some(run) = latest_run(&runs_dir)? else {
            if !json {
                println!("{}: never built", package.name);
            }
            continue;
        };

        if json {
            println!("{}", serde_json::to_string_pretty(&run)?);
            continue;
        }

        println!(
            "{}: {} ({}) run {}",
            package.name,
            run.status,
            run.state.current(),
            run.run_id
        );
        println!(
            "  started {}  finished {}",
            run.created_at_utc,
            run.finished_at_utc.as_deref().unwrap_or("-")
        );
        if let Some(version) = &run.version {
            println!("  version {version}");
        }
        for patch in &run.patches {
            println!("  patch   {} {}", short_digest(&patch.sha256), patch.name);
        }
        for artifact in &run.artifacts {
            println!("  output  {artifact}");
        }
        for check in run.state.preconditions().iter().filter(|c| !c.satisfied) {
            println!("  missing {}", check.subject);
        }
        if let Some(failure) = run.state.failure() {
            println!("  failure {failure}");
        }
        if !run.is_success() {
            match latest_successful_run_id(&runs_dir)? {
                Some(id) => println!("  last ok {id}"),
                None => println!("  last ok -"),
            }
        }
    }
    Ok(())
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
