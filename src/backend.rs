//! Packaging backends.
//!
//! Three ways a package gets produced:
//!
//! - **Debian**: `dpkg-buildpackage` in the source tree. When the full
//!   source+binary build fails it is retried once binary-only (`-b`); some
//!   upstream trees cannot produce a source package from a patched checkout.
//! - **Command**: a `build_cmd` template run through `sh -c`.
//! - **Fpm**: an optional compile `build_cmd`, then `fpm` over a staged
//!   directory once artifacts have been placed.

use std::path::Path;

use anyhow::Result;

use crate::config::{BackendSpec, FpmSpec, PackageSpec};
use crate::error::BuildError;
use crate::preflight::{DEBIAN_TOOLS, FPM_TOOLS};
use crate::process::Cmd;
use crate::template::Vars;

pub const DPKG_FULL_BUILD: &[&str] = &["-uc", "-us", "-tc", "-F"];
pub const DPKG_BINARY_BUILD: &[&str] = &["-uc", "-us", "-tc", "-b"];

/// Host tools the package's backend shells out to.
pub fn required_tools(package: &PackageSpec) -> Vec<(&'static str, &'static str)> {
    match &package.backend {
        BackendSpec::Debian => {
            let mut tools = vec![DEBIAN_TOOLS[0]];
            if package.install_build_deps {
                tools.push(DEBIAN_TOOLS[1]);
            }
            tools
        }
        BackendSpec::Command { .. } => Vec::new(),
        BackendSpec::Fpm { .. } => FPM_TOOLS.to_vec(),
    }
}

/// Run the package's external build step in its source tree.
///
/// For the fpm backend this is only the compile command; packaging happens
/// in [`run_fpm`] after placement.
pub fn run_external_build(
    package: &PackageSpec,
    vars: &Vars,
    env: &[(String, String)],
) -> Result<()> {
    let source_dir = &package.source_dir;
    match &package.backend {
        BackendSpec::Debian => dpkg_buildpackage(&package.name, source_dir, env),
        BackendSpec::Command { build_cmd } => run_build_cmd(build_cmd, source_dir, vars, env),
        BackendSpec::Fpm {
            build_cmd: Some(build_cmd),
            ..
        } => run_build_cmd(build_cmd, source_dir, vars, env),
        BackendSpec::Fpm {
            build_cmd: None, ..
        } => Ok(()),
    }
}

fn run_build_cmd(
    template: &str,
    source_dir: &Path,
    vars: &Vars,
    env: &[(String, String)],
) -> Result<()> {
    let script = vars.render(template)?;
    tracing::info!("  running: {script}");
    Cmd::shell(&script)
        .current_dir(source_dir)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .error_msg(format!("build_cmd `{script}`"))
        .run_interactive()
}

fn dpkg_buildpackage(name: &str, source_dir: &Path, env: &[(String, String)]) -> Result<()> {
    let dpkg = |args: &[&str]| {
        Cmd::new("dpkg-buildpackage")
            .args(args)
            .current_dir(source_dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .run_interactive()
    };

    match dpkg(DPKG_FULL_BUILD) {
        Ok(()) => Ok(()),
        Err(err)
            if matches!(
                err.downcast_ref::<BuildError>(),
                Some(BuildError::CommandFailed { .. })
            ) =>
        {
            tracing::warn!(
                "[build:{name}] source package build failed ({err}); building binaries only"
            );
            dpkg(DPKG_BINARY_BUILD)
        }
        Err(err) => Err(err),
    }
}

/// Build the `fpm` invocation for a staged directory.
pub fn fpm_command(
    fpm: &FpmSpec,
    vars: &Vars,
    after_install: Option<&Path>,
    output: &Path,
) -> Result<Cmd> {
    let version = vars.get("version").unwrap_or_default();
    let arch = vars.get("arch").unwrap_or_default();

    let mut cmd = Cmd::new("fpm")
        .args(["--input-type", "dir", "--output-type", "deb"])
        .arg("--name")
        .arg(vars.render(&fpm.package_name)?)
        .arg("--version")
        .arg(version)
        .arg("--architecture")
        .arg(arch)
        .arg("--maintainer")
        .arg(vars.render(&fpm.maintainer)?)
        .arg("--description")
        .arg(vars.render(&fpm.description)?);
    if let Some(license) = &fpm.license {
        cmd = cmd.arg("--license").arg(license);
    }
    for dep in &fpm.depends {
        cmd = cmd.arg("--depends").arg(vars.render(dep)?);
    }
    for conflict in &fpm.conflicts {
        cmd = cmd.arg("--conflicts").arg(vars.render(conflict)?);
    }
    if let Some(hook) = after_install {
        cmd = cmd.arg("--after-install").arg(hook);
    }
    Ok(cmd
        .arg("--force")
        .arg("--package")
        .arg(output)
        .arg("-C")
        .arg(vars.render(&fpm.staging_dir.display().to_string())?)
        .arg("."))
}

/// Package the staged directory with `fpm`.
pub fn run_fpm(
    fpm: &FpmSpec,
    vars: &Vars,
    after_install: Option<&Path>,
    output: &Path,
    env: &[(String, String)],
) -> Result<()> {
    let cmd = fpm_command(fpm, vars, after_install, output)?;
    tracing::info!("  packaging: {}", cmd.display());
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .run_interactive()
}
