//! Per-package build sequencing.
//!
//! [`Orchestrator::run_package`] walks one package through the state
//! machine in [`crate::state`]. Preconditions are checked before anything is
//! written, so a missing source tree or kernel variable file leaves the work
//! directory untouched. From there on every step either succeeds or aborts
//! the run; the run record is rewritten with the outcome either way.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::artifacts::{self, wildcard_match};
use crate::backend;
use crate::config::{BackendSpec, PackageSpec};
use crate::deps;
use crate::kernel_vars::KernelVars;
use crate::patches::{self, PatchMethod};
use crate::preflight::{self, Precondition, GIT_TOOLS, PATCH_TOOLS};
use crate::process::Cmd;
use crate::runs::{self, RunRecord, STATUS_FAILED, STATUS_SUCCESS};
use crate::source;
use crate::state::{BuildState, StateTracker};
use crate::template::Vars;
use crate::version;

/// Output name used by the fpm backend when the package sets no `artifact`.
pub const DEFAULT_FPM_ARTIFACT: &str = "{package_name}_{version}_{arch}.deb";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub work_dir: PathBuf,
    pub patch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub keep_runs: usize,
}

impl BuildOptions {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            patch_dir: work_dir.join(crate::config::DEFAULT_PATCH_DIR),
            output_dir: work_dir.clone(),
            work_dir,
            keep_runs: runs::DEFAULT_KEEP_RUNS,
        }
    }
}

/// A finished, successful package build.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub version: String,
    pub artifacts: Vec<PathBuf>,
    pub record_path: PathBuf,
    pub history: Vec<BuildState>,
}

pub struct Orchestrator {
    options: BuildOptions,
}

impl Orchestrator {
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn runs_dir(&self, package: &str) -> PathBuf {
        runs::package_runs_dir(&self.options.work_dir, package)
    }

    /// Check everything `package` needs before any step runs.
    ///
    /// Each check is recorded on `tracker`. Returns the parsed kernel
    /// variables when the package names a variable file.
    pub fn check_preconditions(
        &self,
        package: &PackageSpec,
        tracker: &mut StateTracker,
    ) -> Result<Option<KernelVars>> {
        self.evaluate_preconditions(package, tracker, &[])
    }

    fn evaluate_preconditions(
        &self,
        package: &PackageSpec,
        tracker: &mut StateTracker,
        pending_host_deps: &[String],
    ) -> Result<Option<KernelVars>> {
        let fetch_remedy = match &package.scm_url {
            Some(_) => format!("run `package-build fetch --only {}` first", package.name),
            None => format!("check out the '{}' sources by hand", package.name),
        };

        let mut checks = vec![Precondition::dir(
            &package.source_dir,
            "source directory",
            &fetch_remedy,
        )];
        if let Some(path) = &package.kernel_vars {
            checks.push(Precondition::file(
                path,
                "kernel variable file",
                "build the linux-kernel package first; it writes this file",
            ));
        }
        for path in &package.requires {
            let check = if path.is_dir() {
                Precondition::dir(path, "required directory", "build the prior stage first")
            } else {
                Precondition::file(path, "required file", "build the prior stage first")
            };
            checks.push(check);
        }

        let mut tools: Vec<(&str, &str)> = GIT_TOOLS.to_vec();
        if package.apply_patches && package.patch_method == PatchMethod::Patch {
            tools.extend_from_slice(PATCH_TOOLS);
        }
        tools.extend(backend::required_tools(package));
        checks.extend(
            tools
                .iter()
                .filter(|(_, pkg)| !pending_host_deps.iter().any(|dep| dep == pkg))
                .map(|&(cmd, pkg)| Precondition::tool(cmd, pkg)),
        );

        preflight::evaluate(&checks, tracker)?;

        package
            .kernel_vars
            .as_deref()
            .map(KernelVars::load)
            .transpose()
    }

    /// Check the preconditions of every package in `packages` and stop at
    /// the first failure. Nothing is written.
    ///
    /// Tools whose Debian package is listed in `pending_host_deps` are left
    /// to [`Orchestrator::run_package`], which checks them again once the
    /// host dependencies are installed.
    pub fn check_all(
        &self,
        packages: &[&PackageSpec],
        pending_host_deps: &[String],
    ) -> Result<()> {
        for package in packages {
            let mut tracker = StateTracker::new();
            let checked = self.evaluate_preconditions(package, &mut tracker, pending_host_deps);
            if let Err(err) = checked {
                tracing::error!("[build:{}] precondition failed", package.name);
                return Err(err);
            }
        }
        tracing::info!("[build] preconditions satisfied for {} package(s)", packages.len());
        Ok(())
    }

    /// Build one package from START to DONE.
    pub fn run_package(&self, package: &PackageSpec) -> Result<RunOutcome> {
        let tag = format!("[build:{}]", package.name);
        let mut tracker = StateTracker::new();

        let kernel_vars = match self.check_preconditions(package, &mut tracker) {
            Ok(vars) => vars,
            Err(err) => {
                tracker.abort(format!("{err:#}"));
                tracing::error!("{tag} precondition failed; no build step ran");
                return Err(err);
            }
        };
        tracker.advance(BuildState::PreconditionsOk)?;
        tracing::info!(
            "{tag} preconditions satisfied ({} checks)",
            tracker.preconditions().len()
        );

        let runs_dir = self.runs_dir(&package.name);
        let mut record = RunRecord::new(
            runs::generate_run_id()?,
            &package.name,
            runs::now_utc_compact(),
        );
        record.state = tracker;
        runs::write_run_record(&runs_dir, &record)?;
        tracing::debug!("{tag} run {}", record.run_id);

        let build_result = self.execute(package, kernel_vars.as_ref(), &mut record);

        if let Err(err) = &build_result {
            record.state.abort(format!("{err:#}"));
            record.status = STATUS_FAILED.to_string();
        } else {
            record.status = STATUS_SUCCESS.to_string();
        }
        record.finished_at_utc = Some(runs::now_utc_compact());
        let record_path = match runs::write_run_record(&runs_dir, &record) {
            Ok(path) => path,
            Err(err) => {
                if build_result.is_ok() {
                    return Err(err);
                }
                tracing::warn!("{tag} failed to persist run record: {err:#}");
                runs::manifest_path(&runs_dir.join(&record.run_id))
            }
        };

        let artifacts = build_result?;
        let pruned = runs::prune_old_runs(&runs_dir, self.options.keep_runs)?;
        if pruned > 0 {
            tracing::debug!("{tag} pruned {pruned} old run(s)");
        }

        tracing::info!("{tag} done: {} artifact(s)", artifacts.len());
        Ok(RunOutcome {
            run_id: record.run_id.clone(),
            version: record.version.clone().unwrap_or_default(),
            artifacts,
            record_path,
            history: record.state.history().to_vec(),
        })
    }

    fn execute(
        &self,
        package: &PackageSpec,
        kernel_vars: Option<&KernelVars>,
        record: &mut RunRecord,
    ) -> Result<Vec<PathBuf>> {
        let tag = format!("[build:{}]", package.name);
        let source_dir = &package.source_dir;
        let mut env = command_env(package, None, kernel_vars);
        if let Some(kernel) = kernel_vars {
            tracing::info!(
                "{tag} building against kernel {} in {}",
                kernel.kernel_release(),
                kernel.kernel_dir().display()
            );
        }

        if let Some(hook) = package.pre_build_hook.as_deref() {
            tracing::info!("{tag} running pre-build hook");
            Cmd::shell(hook)
                .current_dir(source_dir)
                .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .error_msg("pre_build_hook")
                .run_interactive()?;
        }

        // Derived before patching: `git am` adds commits that would change
        // the describe output.
        let version = version::derive_version(source_dir, package.version_prefix)?;
        tracing::info!("{tag} version {version}");
        record.version = Some(version.clone());
        env = command_env(package, Some(&version), kernel_vars);

        if package.apply_patches {
            let patch_dir = self.options.patch_dir.join(&package.name);
            let found = patches::discover_patches(&patch_dir)?;
            if found.is_empty() {
                tracing::info!("{tag} no patches in {}", patch_dir.display());
            } else {
                tracing::info!(
                    "{tag} applying {} patches ({})",
                    found.len(),
                    package.patch_method
                );
                let applied = patches::apply_patches(source_dir, &found, package.patch_method)?;
                record.patch_set_digest = Some(patches::patch_set_digest(&applied));
                record.patches = applied;
            }
        } else {
            tracing::info!("{tag} patching disabled");
        }
        record.state.advance(BuildState::PatchesApplied)?;

        fs::create_dir_all(&self.options.output_dir).with_context(|| {
            format!(
                "creating output directory '{}'",
                self.options.output_dir.display()
            )
        })?;

        if package.tarball {
            let name = source::tarball_name(
                &package.name,
                package.commit_id.as_deref().unwrap_or(&version),
            );
            let tarball = source::create_tarball(
                source_dir,
                &package.name,
                &self.options.output_dir.join(name),
            )?;
            tracing::info!("{tag} source tarball {}", tarball.display());
            record.tarball = Some(tarball.display().to_string());
        }

        if let Some(data) = package.install_data.as_deref() {
            let install = source_dir.join("debian").join("install");
            if let Some(parent) = install.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating '{}'", parent.display()))?;
            }
            fs::write(&install, format!("{}\n", data.trim_end()))
                .with_context(|| format!("writing '{}'", install.display()))?;
            tracing::info!("{tag} wrote {}", install.display());
        }

        if matches!(package.backend, BackendSpec::Debian) && package.install_build_deps {
            if deps::install_build_deps(source_dir)? {
                tracing::info!("{tag} build dependencies installed");
            } else {
                tracing::info!("{tag} no debian/control; skipping build dependencies");
            }
        }

        let vars = template_vars(package, &version, &self.options.output_dir, kernel_vars)?;
        if let Some(staging) = vars.get("staging_dir") {
            reset_staging(Path::new(staging), package, &self.options)?;
            env.push(("STAGING_DIR".to_string(), staging.to_string()));
        }

        let deb_dirs = deb_search_dirs(source_dir);
        let search: Vec<&Path> = deb_dirs.iter().map(PathBuf::as_path).collect();
        let mut snapshot_dirs = search.clone();
        snapshot_dirs.push(self.options.output_dir.as_path());
        let before = artifacts::DebSnapshot::take(&snapshot_dirs)?;

        tracing::info!("{tag} running external build");
        backend::run_external_build(package, &vars, &env)?;
        record.state.advance(BuildState::ExternalBuildOk)?;

        let artifacts = self.place_artifacts(package, &vars, &env, &search, &before)?;
        record.artifacts = artifacts.iter().map(|p| p.display().to_string()).collect();
        record.state.advance(BuildState::ArtifactsPlaced)?;
        record.state.advance(BuildState::Done)?;
        Ok(artifacts)
    }

    fn place_artifacts(
        &self,
        package: &PackageSpec,
        vars: &Vars,
        env: &[(String, String)],
        search: &[&Path],
        before: &artifacts::DebSnapshot,
    ) -> Result<Vec<PathBuf>> {
        let tag = format!("[build:{}]", package.name);
        let source_dir = &package.source_dir;
        let output_dir = &self.options.output_dir;
        let hook = self
            .options
            .work_dir
            .join(format!("{}.postinst", package.name));
        let mut collected = Vec::new();

        match &package.backend {
            BackendSpec::Fpm { fpm, .. } => {
                let staging = PathBuf::from(vars.get("staging_dir").unwrap_or_default());
                let report = artifacts::place(&package.placement, source_dir, &staging, &hook, vars)?;
                tracing::info!(
                    "{tag} staged {} path(s), removed {} colliding file(s)",
                    report.copied.len(),
                    report.removed.len()
                );
                let output = output_dir.join(
                    vars.render(package.artifact.as_deref().unwrap_or(DEFAULT_FPM_ARTIFACT))?,
                );
                backend::run_fpm(fpm, vars, report.post_install.as_deref(), &output, env)?;
                if !output.is_file() {
                    bail!("fpm did not produce '{}'", output.display());
                }
                collected.push(output);
            }
            _ => {
                let report = artifacts::place(&package.placement, source_dir, source_dir, &hook, vars)?;
                if !report.removed.is_empty() {
                    tracing::info!(
                        "{tag} removed {} colliding file(s)",
                        report.removed.len()
                    );
                }
            }
        }

        for deb in artifacts::collect_debs(search, output_dir, before)? {
            if !collected.contains(&deb) {
                collected.push(deb);
            }
        }
        for dir in search {
            deps::cleanup_build_deps(dir)?;
        }

        if let Some(pattern) = package.artifact.as_deref() {
            let expected = vars.render(pattern)?;
            let found: Vec<PathBuf> = matching_files(output_dir, &expected)?
                .into_iter()
                .filter(|path| before.is_new(path))
                .collect();
            if found.is_empty() {
                bail!(
                    "expected artifact '{}' not found in '{}'",
                    expected,
                    output_dir.display()
                );
            }
            for path in found {
                if !collected.contains(&path) {
                    collected.push(path);
                }
            }
        }
        Ok(collected)
    }
}

/// Directories a backend may leave `.deb` files in: the source tree's parent
/// (where `dpkg-buildpackage` writes) and the source tree itself.
fn deb_search_dirs(source_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(parent) = source_dir.parent() {
        dirs.push(parent.to_path_buf());
    }
    dirs.push(source_dir.to_path_buf());
    dirs
}

/// Empty the fpm staging directory so only this build's files get packaged.
fn reset_staging(staging: &Path, package: &PackageSpec, options: &BuildOptions) -> Result<()> {
    let guarded = [&package.source_dir, &options.work_dir, &options.output_dir];
    if let Some(inside) = guarded.iter().find(|dir| dir.starts_with(staging)) {
        bail!(
            "staging dir '{}' contains '{}'; point [packages.fpm] staging_dir elsewhere",
            staging.display(),
            inside.display()
        );
    }
    if staging.exists() {
        fs::remove_dir_all(staging)
            .with_context(|| format!("clearing staging dir '{}'", staging.display()))?;
    }
    fs::create_dir_all(staging)
        .with_context(|| format!("creating staging dir '{}'", staging.display()))
}

/// Template variables for one package build.
fn template_vars(
    package: &PackageSpec,
    version: &str,
    output_dir: &Path,
    kernel_vars: Option<&KernelVars>,
) -> Result<Vars> {
    let mut vars = Vars::new();
    if let Some(kernel_vars) = kernel_vars {
        for (key, value) in kernel_vars.iter() {
            vars.set(key, value);
        }
    }
    vars.set("name", package.name.as_str())
        .set("version", version)
        .set("arch", package.arch.as_str())
        .set("source_dir", package.source_dir.display().to_string())
        .set("output_dir", output_dir.display().to_string());

    if let BackendSpec::Fpm { fpm, .. } = &package.backend {
        let staging = vars.render(&fpm.staging_dir.display().to_string())?;
        let package_name = vars.render(&fpm.package_name)?;
        vars.set("staging_dir", staging)
            .set("package_name", package_name);
    }
    Ok(vars)
}

/// Environment exported to every external command of a package build.
fn command_env(
    package: &PackageSpec,
    version: Option<&str>,
    kernel_vars: Option<&KernelVars>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = kernel_vars
        .map(|vars| {
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();
    env.push(("PACKAGE_NAME".to_string(), package.name.clone()));
    env.push(("PACKAGE_ARCH".to_string(), package.arch.clone()));
    if let Some(version) = version {
        env.push(("PACKAGE_VERSION".to_string(), version.to_string()));
    }
    env
}

fn matching_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        let path = entry
            .with_context(|| format!("iterating '{}'", dir.display()))?
            .path();
        let matched = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| wildcard_match(pattern, name));
        if matched && path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Manifest;
    use crate::error::BuildError;
    use crate::patches::tests::{patch_dir, source_tree};
    use crate::preflight::command_exists;
    use crate::runs::load_runs;
    use crate::version::tests::tagged_repo;

    const KERNEL_VARS: &str = "\
export KERNEL_DIR=/usr/src/linux-6.6.48
KERNEL_VERSION=6.6.48
KERNEL_SUFFIX='-vyos'
";

    const IXGBE_MANIFEST: &str = r#"
[[packages]]
name = "ixgbe"
kernel_vars = "kernel-vars"
patch_method = "patch"
build_cmd = "printf '%s' {KERNEL_VERSION}{KERNEL_SUFFIX} > ../{name}_{version}_{arch}.deb"
artifact = "ixgbe_{version}_{arch}.deb"
"#;

    fn options(root: &Path) -> BuildOptions {
        let mut options = BuildOptions::new(root);
        options.output_dir = root.join("out");
        options
    }

    fn have_tools() -> bool {
        if !command_exists("git") || !command_exists("patch") {
            eprintln!("skipping: git or patch not installed");
            return false;
        }
        true
    }

    #[test]
    fn clean_tree_with_two_patches_builds_versioned_package() {
        if !have_tools() {
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let src = source_tree(root);
        tagged_repo(&src, "v5.19.6");
        patch_dir(root);
        fs::write(root.join("kernel-vars"), KERNEL_VARS).unwrap();

        let manifest = Manifest::parse(IXGBE_MANIFEST, Path::new("package.toml"), root).unwrap();
        let orchestrator = Orchestrator::new(options(root));
        let outcome = orchestrator.run_package(&manifest.packages[0]).unwrap();

        assert_eq!(outcome.version, "5.19.6");
        let deb = root.join("out/ixgbe_5.19.6_amd64.deb");
        assert!(outcome.artifacts.contains(&deb));
        assert_eq!(fs::read_to_string(&deb).unwrap(), "6.6.48-vyos");
        assert!(root.join("out/ixgbe_5.19.6.tar.gz").is_file());

        let main = fs::read_to_string(src.join("src/main.c")).unwrap();
        assert!(main.contains("local_one();\n\tlocal_two();"));

        assert_eq!(
            outcome.history,
            vec![
                BuildState::Start,
                BuildState::PreconditionsOk,
                BuildState::PatchesApplied,
                BuildState::ExternalBuildOk,
                BuildState::ArtifactsPlaced,
                BuildState::Done,
            ]
        );

        let runs = load_runs(&orchestrator.runs_dir("ixgbe")).unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].is_success());
        assert_eq!(runs[0].patches.len(), 2);
        assert_eq!(runs[0].patches[0].name, "0001-first.patch");
        assert!(runs[0].patch_set_digest.is_some());
        assert!(runs[0].state.preconditions().iter().all(|p| p.satisfied));
    }

    #[test]
    fn missing_source_dir_is_fatal_without_side_effects() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(root.join("kernel-vars"), KERNEL_VARS).unwrap();
        let manifest = Manifest::parse(IXGBE_MANIFEST, Path::new("package.toml"), root).unwrap();

        let err = Orchestrator::new(options(root))
            .run_package(&manifest.packages[0])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingPrecondition { .. })
        ));
        assert!(err.to_string().contains("ixgbe"));
        assert!(!root.join(runs::STATE_DIR_NAME).exists());
        assert!(!root.join("out").exists());
    }

    #[test]
    fn missing_kernel_vars_is_fatal_without_side_effects() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let src = source_tree(root);
        let manifest = Manifest::parse(IXGBE_MANIFEST, Path::new("package.toml"), root).unwrap();

        let err = Orchestrator::new(options(root))
            .run_package(&manifest.packages[0])
            .unwrap_err();
        assert!(err.to_string().contains("kernel-vars"));
        assert!(!root.join(runs::STATE_DIR_NAME).exists());
        assert_eq!(
            fs::read_to_string(src.join("src/main.c")).unwrap(),
            crate::patches::tests::MAIN_C
        );
    }

    #[test]
    fn preconditions_are_all_recorded() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let manifest = Manifest::parse(IXGBE_MANIFEST, Path::new("package.toml"), root).unwrap();
        let mut tracker = StateTracker::new();

        let result =
            Orchestrator::new(options(root)).check_preconditions(&manifest.packages[0], &mut tracker);
        assert!(result.is_err());
        let subjects: Vec<&str> = tracker
            .preconditions()
            .iter()
            .map(|p| p.subject.as_str())
            .collect();
        assert!(subjects.iter().any(|s| s.ends_with("ixgbe")));
        assert!(subjects.iter().any(|s| s.ends_with("kernel-vars")));
        assert!(subjects.contains(&"git"));
        assert!(subjects.contains(&"patch"));
        assert!(!tracker.preconditions()[0].satisfied);
    }

    #[test]
    fn failing_build_is_recorded_as_aborted() {
        if !have_tools() {
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let src = source_tree(root);
        tagged_repo(&src, "v1.0");
        let text = "[[packages]]\nname = \"ixgbe\"\napply_patches = false\ntarball = false\nbuild_cmd = \"exit 3\"\n";
        let manifest = Manifest::parse(text, Path::new("package.toml"), root).unwrap();
        let orchestrator = Orchestrator::new(options(root));

        let err = orchestrator.run_package(&manifest.packages[0]).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 3);

        let record = runs::latest_run(&orchestrator.runs_dir("ixgbe"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, STATUS_FAILED);
        assert_eq!(record.state.current(), BuildState::Aborted);
        assert!(record
            .state
            .failure()
            .unwrap()
            .starts_with("PATCHES_APPLIED:"));
        assert_eq!(record.version.as_deref(), Some("1.0"));
    }

    #[test]
    fn missing_expected_artifact_fails() {
        if !have_tools() {
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let src = source_tree(root);
        tagged_repo(&src, "v2.0");
        let text = "[[packages]]\nname = \"ixgbe\"\napply_patches = false\ntarball = false\nbuild_cmd = \"true\"\nartifact = \"{name}_{version}_*.deb\"\n";
        let manifest = Manifest::parse(text, Path::new("package.toml"), root).unwrap();

        let err = Orchestrator::new(options(root))
            .run_package(&manifest.packages[0])
            .unwrap_err();
        assert!(err.to_string().contains("ixgbe_2.0_*.deb"));
    }

    #[test]
    fn env_carries_kernel_and_package_vars() {
        let temp = tempfile::tempdir().unwrap();
        let manifest =
            Manifest::parse(IXGBE_MANIFEST, Path::new("package.toml"), temp.path()).unwrap();
        let kernel = KernelVars::parse(KERNEL_VARS, Path::new("kernel-vars")).unwrap();
        let env = command_env(&manifest.packages[0], Some("5.19.6"), Some(&kernel));
        let get = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        assert_eq!(get("KERNEL_SUFFIX"), Some("-vyos"));
        assert_eq!(get("PACKAGE_NAME"), Some("ixgbe"));
        assert_eq!(get("PACKAGE_VERSION"), Some("5.19.6"));
    }

    #[test]
    fn earlier_debs_in_the_work_dir_are_not_reported() {
        if !have_tools() {
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let src = source_tree(root);
        tagged_repo(&src, "v1.0");
        fs::write(root.join("hsflowd_2.0_amd64.deb"), "earlier package").unwrap();
        let text = "[[packages]]\nname = \"ixgbe\"\napply_patches = false\ntarball = false\nbuild_cmd = \"printf x > ../ixgbe_{version}_{arch}.deb\"\n";
        let manifest = Manifest::parse(text, Path::new("package.toml"), root).unwrap();

        let outcome = Orchestrator::new(BuildOptions::new(root))
            .run_package(&manifest.packages[0])
            .unwrap();
        assert_eq!(outcome.artifacts, vec![root.join("ixgbe_1.0_amd64.deb")]);
    }

    #[test]
    fn check_all_stops_before_any_write() {
        if !have_tools() {
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("hsflowd")).unwrap();
        let text = "[[packages]]\nname = \"hsflowd\"\nbuild_cmd = \"true\"\n\n[[packages]]\nname = \"ixgbe\"\nbuild_cmd = \"true\"\n";
        let manifest = Manifest::parse(text, Path::new("package.toml"), root).unwrap();
        let selected = manifest.select(&[]).unwrap();

        let err = Orchestrator::new(options(root))
            .check_all(&selected, &[])
            .unwrap_err();
        assert!(err.to_string().contains("ixgbe"));
        assert!(!root.join(runs::STATE_DIR_NAME).exists());
        assert!(!root.join("out").exists());
    }

    #[test]
    fn staging_dir_may_not_hold_the_work_dir() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let text = "[[packages]]\nname = \"ixgbe\"\n\n[packages.fpm]\nmaintainer = \"m\"\ndescription = \"d\"\nstaging_dir = \".\"\n";
        let manifest = Manifest::parse(text, Path::new("package.toml"), root).unwrap();
        let package = &manifest.packages[0];

        let err = reset_staging(root, package, &options(root)).unwrap_err();
        assert!(err.to_string().contains("staging dir"));

        let staging = root.join("ixgbe-staging");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("stale.ko"), "").unwrap();
        reset_staging(&staging, package, &options(root)).unwrap();
        assert!(staging.is_dir());
        assert!(!staging.join("stale.ko").exists());
    }

    #[test]
    fn tools_from_pending_host_deps_are_deferred() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("ixgbe")).unwrap();
        let text = "[[packages]]\nname = \"ixgbe\"\napply_patches = false\n\n[packages.fpm]\nmaintainer = \"m\"\ndescription = \"d\"\n";
        let manifest = Manifest::parse(text, Path::new("package.toml"), root).unwrap();
        let orchestrator = Orchestrator::new(options(root));
        let pending = vec!["git".to_string(), "ruby-fpm".to_string()];

        let mut tracker = StateTracker::new();
        orchestrator
            .evaluate_preconditions(&manifest.packages[0], &mut tracker, &pending)
            .unwrap();
        assert!(tracker
            .preconditions()
            .iter()
            .all(|p| p.kind != crate::state::CheckKind::Tool));
    }

    #[test]
    fn stale_artifact_does_not_satisfy_the_pattern() {
        if !have_tools() {
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let src = source_tree(root);
        tagged_repo(&src, "v3.0");
        fs::create_dir_all(root.join("out")).unwrap();
        fs::write(root.join("out/ixgbe_3.0_amd64.deb"), "from an earlier run").unwrap();
        let text = "[[packages]]\nname = \"ixgbe\"\napply_patches = false\ntarball = false\nbuild_cmd = \"true\"\nartifact = \"{name}_{version}_*.deb\"\n";
        let manifest = Manifest::parse(text, Path::new("package.toml"), root).unwrap();

        let err = Orchestrator::new(options(root))
            .run_package(&manifest.packages[0])
            .unwrap_err();
        assert!(err.to_string().contains("ixgbe_3.0_*.deb"));
    }
}
