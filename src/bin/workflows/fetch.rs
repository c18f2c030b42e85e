use anyhow::Result;
use package_build::preflight::{check_required_tools, GIT_TOOLS};
use package_build::source::{self, FetchOutcome};
use package_build::Manifest;

use crate::ManifestArgs;

pub(crate) fn fetch(args: &ManifestArgs) -> Result<()> {
    let manifest = Manifest::load(&args.config_path(), &args.work_dir)?;
    let selected = manifest.select(&args.only)?;
    check_required_tools(GIT_TOOLS)?;

    let mut cloned = 0;
    for package in selected {
        if source::fetch(package)? == FetchOutcome::Cloned {
            cloned += 1;
        }
    }
    tracing::info!("[fetch] {cloned} source tree(s) cloned");
    Ok(())
}
