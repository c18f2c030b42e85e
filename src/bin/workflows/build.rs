use anyhow::{Context, Result};
use package_build::deps;
use package_build::runs::WorkspaceLock;
use package_build::{BuildOptions, Manifest, Orchestrator};

use crate::BuildArgs;

pub(crate) fn build(args: &BuildArgs) -> Result<()> {
    let work_dir = &args.manifest.work_dir;
    let manifest = Manifest::load(&args.manifest.config_path(), work_dir)?;
    let selected = manifest.select(&args.manifest.only)?;

    let orchestrator = Orchestrator::new(BuildOptions {
        work_dir: work_dir.clone(),
        patch_dir: work_dir.join(&args.patch_dir),
        output_dir: args
            .output_dir
            .as_ref()
            .map(|dir| work_dir.join(dir))
            .unwrap_or_else(|| work_dir.clone()),
        keep_runs: args.keep_runs,
    });
    let pending_host_deps: &[String] = if args.skip_host_deps {
        &[]
    } else {
        &manifest.host_dependencies
    };
    orchestrator.check_all(&selected, pending_host_deps)?;

    let lock = WorkspaceLock::acquire(work_dir)?;
    tracing::debug!("[build] holding {}", lock.path().display());

    if args.skip_host_deps {
        tracing::info!("[deps] skipping host dependencies");
    } else {
        deps::ensure_host_dependencies(&manifest.host_dependencies)?;
    }

    let total = selected.len();
    for (idx, package) in selected.into_iter().enumerate() {
        tracing::info!("[build] ({}/{total}) {}", idx + 1, package.name);
        let outcome = orchestrator
            .run_package(package)
            .with_context(|| format!("building package '{}'", package.name))?;
        for artifact in &outcome.artifacts {
            println!("{}", artifact.display());
        }
    }
    tracing::info!("[build] {total} package(s) built");
    Ok(())
}
