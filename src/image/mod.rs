//! ISO image targets and QEMU smoke tests.
//!
//! Image builds themselves belong to `./build-vyos-image`; this module only
//! dispatches to it, guards the smoke-test targets on the ISO from the prior
//! stage, and cleans up after live-build.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::artifacts::wildcard_match;
use crate::preflight::{self, IMAGE_TOOLS};
use crate::process::Cmd;

/// ISO produced by `./build-vyos-image`, relative to the repository root.
pub const ISO_PATH: &str = "build/live-image-amd64.hybrid.iso";

pub const IMAGE_BUILD_SCRIPT: &str = "./build-vyos-image";
pub const QEMU_INSTALL_SCRIPT: &str = "scripts/check-qemu-install";
pub const ISO_TO_OCI_SCRIPT: &str = "scripts/iso-to-oci";

/// live-build state removed by `clean`, relative to `build/`.
const CLEAN_BUILD_PATHS: &[&str] = &[
    "config/binary",
    "config/bootstrap",
    "config/chroot",
    "config/common",
    "config/source",
];

/// Image outputs removed by `clean` from the repository root.
const CLEAN_PATTERNS: &[&str] = &[
    "build.log",
    "*.iso",
    "*.img",
    "*.xz",
    "*.vhd",
    "*.raw",
    "*.tar.gz",
    "*.qcow2",
    "*.mf",
    "*.ovf",
    "*.ova",
];

const PURGE_PATHS: &[&str] = &["build", "packer_build", "packer_cache"];
const PURGE_PATTERNS: &[&str] = &["testinstall-*.img"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTarget {
    CheckIso,
    Test,
    TestNoInterfaces,
    TestInterfaces,
    TestConfig,
    TestDebug,
    TestSecureBoot,
    TestRaid,
    QemuLive,
    Oci,
    Clean,
    Purge,
    /// Anything else is an image flavor for `./build-vyos-image`.
    Build(String),
}

impl ImageTarget {
    pub fn parse(name: &str) -> Self {
        match name {
            "checkiso" => ImageTarget::CheckIso,
            "test" => ImageTarget::Test,
            "test-no-interfaces" => ImageTarget::TestNoInterfaces,
            "test-interfaces" => ImageTarget::TestInterfaces,
            "testc" => ImageTarget::TestConfig,
            "testd" => ImageTarget::TestDebug,
            "testsb" => ImageTarget::TestSecureBoot,
            "testraid" => ImageTarget::TestRaid,
            "qemu-live" => ImageTarget::QemuLive,
            "oci" => ImageTarget::Oci,
            "clean" => ImageTarget::Clean,
            "purge" => ImageTarget::Purge,
            other => ImageTarget::Build(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ImageTarget::CheckIso => "checkiso",
            ImageTarget::Test => "test",
            ImageTarget::TestNoInterfaces => "test-no-interfaces",
            ImageTarget::TestInterfaces => "test-interfaces",
            ImageTarget::TestConfig => "testc",
            ImageTarget::TestDebug => "testd",
            ImageTarget::TestSecureBoot => "testsb",
            ImageTarget::TestRaid => "testraid",
            ImageTarget::QemuLive => "qemu-live",
            ImageTarget::Oci => "oci",
            ImageTarget::Clean => "clean",
            ImageTarget::Purge => "purge",
            ImageTarget::Build(name) => name,
        }
    }

    /// Whether the target consumes the ISO from a prior image build.
    pub fn needs_iso(&self) -> bool {
        !matches!(
            self,
            ImageTarget::Clean | ImageTarget::Purge | ImageTarget::Build(_)
        )
    }

    /// The smoke-test invocation for test targets.
    pub fn smoke_test(&self, match_filter: Option<&str>) -> Option<SmokeTest> {
        let test = match self {
            ImageTarget::Test => {
                let test = SmokeTest::new(4, 8).configd().smoketest().uefi();
                match match_filter {
                    Some(filter) => test.match_filter(filter),
                    None => test,
                }
            }
            ImageTarget::TestNoInterfaces => SmokeTest::new(4, 8)
                .configd()
                .smoketest()
                .uefi()
                .mode(TestMode::NoInterfaces),
            ImageTarget::TestInterfaces => SmokeTest::new(4, 8)
                .configd()
                .match_filter("interfaces_")
                .smoketest()
                .uefi(),
            ImageTarget::TestConfig => SmokeTest::new(2, 7).configd().mode(TestMode::ConfigTest),
            ImageTarget::TestDebug => SmokeTest::new(2, 7).configd(),
            ImageTarget::TestSecureBoot => SmokeTest::new(4, 8).uefi().mode(TestMode::SecureBoot),
            ImageTarget::TestRaid => SmokeTest::new(4, 8).configd().mode(TestMode::Raid),
            _ => return None,
        };
        Some(test)
    }
}

impl fmt::Display for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Extra scenario selected on the installer test script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TestMode {
    #[default]
    Plain,
    NoInterfaces,
    ConfigTest,
    Raid,
    SecureBoot,
}

impl TestMode {
    fn flag(&self) -> Option<&'static str> {
        match self {
            TestMode::Plain => None,
            TestMode::NoInterfaces => Some("--no-interfaces"),
            TestMode::ConfigTest => Some("--configtest"),
            TestMode::Raid => Some("--raid"),
            TestMode::SecureBoot => Some("--sbtest"),
        }
    }
}

/// Builder for `scripts/check-qemu-install` invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmokeTest {
    configd: bool,
    match_filter: Option<String>,
    smoketest: bool,
    uefi: bool,
    cpu: u32,
    memory_gb: u32,
    mode: TestMode,
}

impl SmokeTest {
    pub fn new(cpu: u32, memory_gb: u32) -> Self {
        Self {
            cpu,
            memory_gb,
            ..Default::default()
        }
    }

    pub fn configd(mut self) -> Self {
        self.configd = true;
        self
    }

    pub fn match_filter(mut self, filter: &str) -> Self {
        self.match_filter = Some(filter.to_string());
        self
    }

    pub fn smoketest(mut self) -> Self {
        self.smoketest = true;
        self
    }

    pub fn uefi(mut self) -> Self {
        self.uefi = true;
        self
    }

    pub fn mode(mut self, mode: TestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(&self, iso: &Path, extra: &[String]) -> Cmd {
        let mut cmd = Cmd::new(QEMU_INSTALL_SCRIPT).arg("--debug");
        if self.configd {
            cmd = cmd.arg("--configd");
        }
        if let Some(filter) = &self.match_filter {
            cmd = cmd.arg(format!("--match={filter}"));
        }
        if self.smoketest {
            cmd = cmd.arg("--smoketest");
        }
        if self.uefi {
            cmd = cmd.arg("--uefi");
        }
        cmd = cmd
            .arg("--cpu")
            .arg(self.cpu.to_string())
            .arg("--memory")
            .arg(self.memory_gb.to_string());
        if let Some(flag) = self.mode.flag() {
            cmd = cmd.arg(flag);
        }
        cmd.arg(iso).args(extra)
    }
}

/// Fail unless the ISO from the image build exists under `root`.
pub fn checkiso(root: &Path) -> Result<PathBuf> {
    let iso = root.join(ISO_PATH);
    preflight::require_file(
        &iso,
        "image",
        "run `package-build image generic` (or another flavor) first",
    )?;
    Ok(iso)
}

/// Commands a target runs, in order. Filesystem cleanup for `clean` and
/// `purge` is not included.
pub fn plan(
    root: &Path,
    target: &ImageTarget,
    extra: &[String],
    match_filter: Option<&str>,
) -> Vec<Cmd> {
    let iso = root.join(ISO_PATH);
    if let Some(test) = target.smoke_test(match_filter) {
        return vec![test.build(&iso, extra).current_dir(root)];
    }
    match target {
        ImageTarget::QemuLive => vec![Cmd::new(QEMU_INSTALL_SCRIPT)
            .arg("--qemu-cmd")
            .arg(&iso)
            .current_dir(root)],
        ImageTarget::Oci => vec![Cmd::new(ISO_TO_OCI_SCRIPT).arg(&iso).current_dir(root)],
        ImageTarget::Clean => vec![Cmd::new("lb")
            .arg("clean")
            .current_dir(root.join("build"))],
        ImageTarget::Build(flavor) => vec![Cmd::new(IMAGE_BUILD_SCRIPT)
            .arg(flavor)
            .args(extra)
            .current_dir(root)],
        _ => Vec::new(),
    }
}

/// Run `target` from the repository at `root`.
pub fn run_target(
    root: &Path,
    target: &ImageTarget,
    extra: &[String],
    match_filter: Option<&str>,
) -> Result<()> {
    let tag = format!("[image:{target}]");
    if target.needs_iso() {
        let iso = checkiso(root)?;
        tracing::info!("{tag} using {}", iso.display());
    }

    match target {
        ImageTarget::Clean => {
            if root.join("build").is_dir() {
                preflight::check_required_tools(IMAGE_TOOLS)?;
                for cmd in plan(root, target, extra, match_filter) {
                    cmd.run_interactive()?;
                }
            }
            let removed = clean(root)?;
            tracing::info!("{tag} removed {} path(s)", removed.len());
        }
        ImageTarget::Purge => {
            let removed = purge(root)?;
            tracing::info!("{tag} removed {} path(s)", removed.len());
        }
        _ => {
            for cmd in plan(root, target, extra, match_filter) {
                tracing::info!("{tag} {}", cmd.display());
                cmd.run_interactive()?;
            }
        }
    }
    Ok(())
}

/// Remove live-build state and image outputs.
pub fn clean(root: &Path) -> Result<Vec<PathBuf>> {
    let build = root.join("build");
    let mut removed = Vec::new();
    for rel in CLEAN_BUILD_PATHS {
        let path = build.join(rel);
        if remove_path(&path)? {
            removed.push(path);
        }
    }
    removed.extend(remove_top_level(root, CLEAN_PATTERNS)?);
    Ok(removed)
}

/// Remove every build tree and installer test disk.
pub fn purge(root: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for rel in PURGE_PATHS {
        let path = root.join(rel);
        if remove_path(&path)? {
            removed.push(path);
        }
    }
    removed.extend(remove_top_level(root, PURGE_PATTERNS)?);
    Ok(removed)
}

fn remove_path(path: &Path) -> Result<bool> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(false);
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.with_context(|| format!("removing '{}'", path.display()))?;
    Ok(true)
}

fn remove_top_level(root: &Path, patterns: &[&str]) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !root.is_dir() {
        return Ok(removed);
    }
    for entry in fs::read_dir(root).with_context(|| format!("reading '{}'", root.display()))? {
        let path = entry
            .with_context(|| format!("iterating '{}'", root.display()))?
            .path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() && patterns.iter().any(|p| wildcard_match(p, name)) {
            fs::remove_file(&path).with_context(|| format!("removing '{}'", path.display()))?;
            removed.push(path);
        }
    }
    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;

    fn args(cmd: &Cmd) -> Vec<String> {
        cmd.arg_list()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn unknown_names_are_image_flavors() {
        assert_eq!(ImageTarget::parse("testraid"), ImageTarget::TestRaid);
        assert_eq!(
            ImageTarget::parse("generic"),
            ImageTarget::Build("generic".into())
        );
        assert!(!ImageTarget::parse("generic").needs_iso());
        assert!(ImageTarget::parse("oci").needs_iso());
    }

    #[test]
    fn test_target_forwards_match_and_extra_args() {
        let root = Path::new("/src/vyos-build");
        let cmds = plan(
            root,
            &ImageTarget::Test,
            &["--sound".to_string()],
            Some("system_login"),
        );
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].program(), QEMU_INSTALL_SCRIPT);
        assert_eq!(
            args(&cmds[0]),
            vec![
                "--debug",
                "--configd",
                "--match=system_login",
                "--smoketest",
                "--uefi",
                "--cpu",
                "4",
                "--memory",
                "8",
                "/src/vyos-build/build/live-image-amd64.hybrid.iso",
                "--sound",
            ]
        );
    }

    #[test]
    fn scenario_flags_follow_the_target() {
        let iso = Path::new("x.iso");
        let raid = ImageTarget::TestRaid.smoke_test(None).unwrap().build(iso, &[]);
        assert!(args(&raid).contains(&"--raid".to_string()));

        let sb = ImageTarget::TestSecureBoot
            .smoke_test(Some("ignored"))
            .unwrap()
            .build(iso, &[]);
        let sb = args(&sb);
        assert!(sb.contains(&"--sbtest".to_string()));
        assert!(!sb.iter().any(|a| a.starts_with("--match")));

        assert!(ImageTarget::Oci.smoke_test(None).is_none());
    }

    #[test]
    fn flavors_dispatch_to_image_script() {
        let cmds = plan(
            Path::new("/r"),
            &ImageTarget::Build("generic".into()),
            &["--architecture".into(), "amd64".into()],
            None,
        );
        assert_eq!(cmds[0].display(), "./build-vyos-image generic --architecture amd64");
    }

    #[test]
    fn smoke_test_without_iso_is_a_precondition_failure() {
        let temp = tempfile::tempdir().unwrap();
        let err = run_target(temp.path(), &ImageTarget::Test, &[], None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingPrecondition { .. })
        ));
        assert!(err.to_string().contains(ISO_PATH));
    }

    #[test]
    fn clean_and_purge_remove_outputs() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("build/config/chroot")).unwrap();
        fs::create_dir_all(root.join("build/config/includes.chroot")).unwrap();
        fs::write(root.join("vyos-1.5.iso"), "").unwrap();
        fs::write(root.join("disk.qcow2"), "").unwrap();
        fs::write(root.join("testinstall-20240101.img"), "").unwrap();
        fs::write(root.join("Makefile"), "").unwrap();

        clean(root).unwrap();
        assert!(!root.join("build/config/chroot").exists());
        assert!(root.join("build/config/includes.chroot").is_dir());
        assert!(!root.join("vyos-1.5.iso").exists());
        assert!(!root.join("disk.qcow2").exists());
        assert!(root.join("Makefile").is_file());

        fs::write(root.join("testinstall-20240102.img"), "").unwrap();
        let removed = purge(root).unwrap();
        assert!(!root.join("build").exists());
        assert!(!root.join("testinstall-20240102.img").exists());
        assert_eq!(removed.len(), 2);
    }
}
