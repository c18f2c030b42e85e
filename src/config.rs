//! `package.toml` manifest loading.
//!
//! ```toml
//! [dependencies]
//! packages = ["build-essential", "libelf-dev"]
//!
//! [[packages]]
//! name = "ixgbe"
//! kernel_vars = "../linux-kernel/kernel-vars"
//! patch_method = "patch"
//! build_cmd = "make -C src KSRC={KERNEL_DIR} INSTALL_MOD_PATH={staging_dir} install"
//! artifact = "vyos-intel-ixgbe_{version}_{arch}.deb"
//!
//! [packages.fpm]
//! package_name = "vyos-intel-ixgbe"
//! maintainer = "VyOS Package Maintainers <maintainers@vyos.net>"
//! description = "Vendor based driver for Intel ixgbe"
//! depends = ["linux-image-{KERNEL_VERSION}{KERNEL_SUFFIX}"]
//!
//! [packages.artifacts]
//! remove = ["modules.*"]
//! post_install = "depmod -a {KERNEL_VERSION}{KERNEL_SUFFIX}"
//! ```
//!
//! Relative paths are resolved against the work directory.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::BuildError;
use crate::patches::PatchMethod;

pub const DEFAULT_CONFIG_FILE: &str = "package.toml";
pub const DEFAULT_PATCH_DIR: &str = "patches";
pub const DEFAULT_ARCH: &str = "amd64";
pub const DEFAULT_VERSION_PREFIX: char = 'v';

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestToml {
    #[serde(default)]
    dependencies: Option<DependenciesToml>,
    arch: Option<String>,
    #[serde(default)]
    packages: Vec<PackageToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependenciesToml {
    #[serde(default)]
    packages: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageToml {
    name: String,
    source_dir: Option<String>,
    scm_url: Option<String>,
    commit_id: Option<String>,
    pre_build_hook: Option<String>,
    apply_patches: Option<bool>,
    patch_method: Option<String>,
    prepare_package: Option<bool>,
    install_data: Option<String>,
    kernel_vars: Option<String>,
    #[serde(default)]
    requires: Vec<String>,
    version_prefix: Option<String>,
    install_build_deps: Option<bool>,
    tarball: Option<bool>,
    arch: Option<String>,
    build_cmd: Option<String>,
    artifact: Option<String>,
    fpm: Option<FpmToml>,
    artifacts: Option<PlacementToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FpmToml {
    package_name: Option<String>,
    maintainer: String,
    description: String,
    license: Option<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    conflicts: Vec<String>,
    staging_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlacementToml {
    #[serde(default)]
    copy: Vec<CopyToml>,
    #[serde(default)]
    remove: Vec<String>,
    post_install: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CopyToml {
    from: String,
    to: String,
}

/// The whole manifest: host dependencies plus packages in build order.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub host_dependencies: Vec<String>,
    pub packages: Vec<PackageSpec>,
}

/// One build target.
#[derive(Debug, Clone)]
pub struct PackageSpec {
    pub name: String,
    pub source_dir: PathBuf,
    pub scm_url: Option<String>,
    pub commit_id: Option<String>,
    pub pre_build_hook: Option<String>,
    pub apply_patches: bool,
    pub patch_method: PatchMethod,
    pub install_data: Option<String>,
    pub kernel_vars: Option<PathBuf>,
    pub requires: Vec<PathBuf>,
    pub version_prefix: Option<char>,
    pub install_build_deps: bool,
    pub tarball: bool,
    pub arch: String,
    pub backend: BackendSpec,
    pub artifact: Option<String>,
    pub placement: PlacementSpec,
}

/// How the package is finally produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    /// `dpkg-buildpackage` in the source tree.
    Debian,
    /// An arbitrary command template.
    Command { build_cmd: String },
    /// Optional compile command, then `fpm` over a staged directory.
    Fpm {
        build_cmd: Option<String>,
        fpm: FpmSpec,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpmSpec {
    pub package_name: String,
    pub maintainer: String,
    pub description: String,
    pub license: Option<String>,
    pub depends: Vec<String>,
    pub conflicts: Vec<String>,
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementSpec {
    pub copy: Vec<CopyRule>,
    pub remove: Vec<String>,
    pub post_install: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRule {
    pub from: String,
    pub to: String,
}

impl Manifest {
    pub fn load(path: &Path, work_dir: &Path) -> Result<Self> {
        crate::preflight::require_file(
            path,
            "package manifest",
            "pass --config or run from the package directory",
        )?;
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading package manifest '{}'", path.display()))?;
        Self::parse(&text, path, work_dir)
    }

    pub fn parse(text: &str, path: &Path, work_dir: &Path) -> Result<Self> {
        let parsed: ManifestToml = toml::from_str(text)
            .with_context(|| format!("parsing package manifest '{}'", path.display()))?;

        let default_arch = parsed.arch.unwrap_or_else(|| DEFAULT_ARCH.to_string());
        let mut seen = BTreeSet::new();
        let mut packages = Vec::with_capacity(parsed.packages.len());
        for raw in parsed.packages {
            let spec = package_from_toml(raw, path, work_dir, &default_arch)?;
            if !seen.insert(spec.name.clone()) {
                return Err(invalid(path, format!("duplicate package '{}'", spec.name)));
            }
            packages.push(spec);
        }
        if packages.is_empty() {
            return Err(invalid(path, "no [[packages]] entries".to_string()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            host_dependencies: parsed.dependencies.map(|d| d.packages).unwrap_or_default(),
            packages,
        })
    }

    /// Packages in manifest order, optionally restricted to `only`.
    pub fn select(&self, only: &[String]) -> Result<Vec<&PackageSpec>> {
        if only.is_empty() {
            return Ok(self.packages.iter().collect());
        }
        for name in only {
            if !self.packages.iter().any(|p| &p.name == name) {
                let known = self
                    .packages
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(invalid(
                    &self.path,
                    format!("unknown package '{name}'; expected one of: {known}"),
                ));
            }
        }
        Ok(self
            .packages
            .iter()
            .filter(|p| only.contains(&p.name))
            .collect())
    }
}

fn package_from_toml(
    raw: PackageToml,
    path: &Path,
    work_dir: &Path,
    default_arch: &str,
) -> Result<PackageSpec> {
    let name = raw.name.trim().to_string();
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(invalid(path, format!("invalid package name '{}'", raw.name)));
    }

    let patch_method = match raw.patch_method.as_deref() {
        None => PatchMethod::Series,
        Some(value) => value.parse().map_err(|reason: String| invalid(path, reason))?,
    };

    let version_prefix = match raw.version_prefix.as_deref() {
        None => Some(DEFAULT_VERSION_PREFIX),
        Some("") => None,
        Some(value) => {
            let mut chars = value.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(c),
                _ => {
                    return Err(invalid(
                        path,
                        format!(
                            "package '{name}': version_prefix must be a single character, got '{value}'"
                        ),
                    ))
                }
            }
        }
    };

    let prepare_package = raw.prepare_package.unwrap_or(false);
    let install_data = raw.install_data.filter(|data| prepare_package && !data.is_empty());

    let backend = match (raw.fpm, raw.build_cmd) {
        (Some(fpm), build_cmd) => BackendSpec::Fpm {
            build_cmd,
            fpm: FpmSpec {
                package_name: fpm.package_name.unwrap_or_else(|| name.clone()),
                maintainer: fpm.maintainer,
                description: fpm.description,
                license: fpm.license,
                depends: fpm.depends,
                conflicts: fpm.conflicts,
                staging_dir: resolve(
                    work_dir,
                    fpm.staging_dir.as_deref().unwrap_or(&format!("{name}-staging")),
                ),
            },
        },
        (None, Some(build_cmd)) => BackendSpec::Command { build_cmd },
        (None, None) => BackendSpec::Debian,
    };

    let placement = raw
        .artifacts
        .map(|a| PlacementSpec {
            copy: a
                .copy
                .into_iter()
                .map(|c| CopyRule { from: c.from, to: c.to })
                .collect(),
            remove: a.remove,
            post_install: a.post_install,
        })
        .unwrap_or_default();

    if !placement.copy.is_empty() && !matches!(backend, BackendSpec::Fpm { .. }) {
        return Err(invalid(
            path,
            format!("package '{name}': [packages.artifacts] copy rules need a [packages.fpm] staging directory"),
        ));
    }

    Ok(PackageSpec {
        source_dir: resolve(work_dir, raw.source_dir.as_deref().unwrap_or(&name)),
        scm_url: raw.scm_url,
        commit_id: raw.commit_id,
        pre_build_hook: raw.pre_build_hook.filter(|hook| !hook.trim().is_empty()),
        apply_patches: raw.apply_patches.unwrap_or(true),
        patch_method,
        install_data,
        kernel_vars: raw.kernel_vars.as_deref().map(|p| resolve(work_dir, p)),
        requires: raw.requires.iter().map(|p| resolve(work_dir, p)).collect(),
        version_prefix,
        install_build_deps: raw.install_build_deps.unwrap_or(true),
        tarball: raw.tarball.unwrap_or(true),
        arch: raw.arch.unwrap_or_else(|| default_arch.to_string()),
        backend,
        artifact: raw.artifact,
        placement,
        name,
    })
}

pub(crate) fn resolve(base: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

fn invalid(path: &Path, reason: String) -> anyhow::Error {
    BuildError::Config {
        path: path.to_path_buf(),
        reason,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[dependencies]
packages = ["build-essential"]

[[packages]]
name = "hsflowd"
scm_url = "https://github.com/sflow/host-sflow"
commit_id = "v2.0.55-1"
pre_build_hook = "./prepare.sh"
prepare_package = true
install_data = "etc/hsflowd.conf etc/"

[[packages]]
name = "ixgbe"
patch_method = "patch"
kernel_vars = "/opt/kernel-vars"
requires = ["linux-kernel/linux"]
build_cmd = "make -C src"
artifact = "vyos-intel-ixgbe_{version}_{arch}.deb"

[packages.fpm]
package_name = "vyos-intel-ixgbe"
maintainer = "VyOS Package Maintainers <maintainers@vyos.net>"
description = "Vendor based driver for Intel ixgbe"
depends = ["linux-image-{KERNEL_VERSION}{KERNEL_SUFFIX}"]

[packages.artifacts]
copy = [{ from = "src/ixgbe.ko", to = "lib/modules/ixgbe.ko" }]
remove = ["modules.*"]
post_install = "depmod -a"
"#;

    fn load() -> Manifest {
        Manifest::parse(MANIFEST, Path::new("package.toml"), Path::new("/work")).unwrap()
    }

    #[test]
    fn defaults_follow_debian_backend() {
        let manifest = load();
        assert_eq!(manifest.host_dependencies, vec!["build-essential"]);
        let hsflowd = &manifest.packages[0];
        assert_eq!(hsflowd.source_dir, PathBuf::from("/work/hsflowd"));
        assert_eq!(hsflowd.backend, BackendSpec::Debian);
        assert_eq!(hsflowd.patch_method, PatchMethod::Series);
        assert!(hsflowd.apply_patches);
        assert!(hsflowd.install_build_deps);
        assert_eq!(hsflowd.arch, "amd64");
        assert_eq!(hsflowd.version_prefix, Some('v'));
        assert_eq!(hsflowd.install_data.as_deref(), Some("etc/hsflowd.conf etc/"));
    }

    #[test]
    fn fpm_package_carries_metadata_and_placement() {
        let manifest = load();
        let ixgbe = &manifest.packages[1];
        assert_eq!(ixgbe.patch_method, PatchMethod::Patch);
        assert_eq!(ixgbe.kernel_vars, Some(PathBuf::from("/opt/kernel-vars")));
        assert_eq!(ixgbe.requires, vec![PathBuf::from("/work/linux-kernel/linux")]);
        match &ixgbe.backend {
            BackendSpec::Fpm { build_cmd, fpm } => {
                assert_eq!(build_cmd.as_deref(), Some("make -C src"));
                assert_eq!(fpm.package_name, "vyos-intel-ixgbe");
                assert_eq!(fpm.staging_dir, PathBuf::from("/work/ixgbe-staging"));
            }
            other => panic!("unexpected backend {other:?}"),
        }
        assert_eq!(ixgbe.placement.remove, vec!["modules.*"]);
        assert_eq!(ixgbe.placement.copy.len(), 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = "[[packages]]\nname = \"x\"\nbuild_command = \"make\"\n";
        assert!(Manifest::parse(text, Path::new("package.toml"), Path::new("/w")).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let text = "[[packages]]\nname = \"x\"\n[[packages]]\nname = \"x\"\n";
        let err = Manifest::parse(text, Path::new("package.toml"), Path::new("/w")).unwrap_err();
        assert!(err.to_string().contains("duplicate package 'x'"));
    }

    #[test]
    fn install_data_ignored_without_prepare_package() {
        let text = "[[packages]]\nname = \"x\"\ninstall_data = \"a b\"\n";
        let manifest = Manifest::parse(text, Path::new("package.toml"), Path::new("/w")).unwrap();
        assert_eq!(manifest.packages[0].install_data, None);
    }

    #[test]
    fn empty_version_prefix_disables_stripping() {
        let text = "[[packages]]\nname = \"x\"\nversion_prefix = \"\"\n";
        let manifest = Manifest::parse(text, Path::new("package.toml"), Path::new("/w")).unwrap();
        assert_eq!(manifest.packages[0].version_prefix, None);

        let text = "[[packages]]\nname = \"x\"\nversion_prefix = \"rel\"\n";
        assert!(Manifest::parse(text, Path::new("package.toml"), Path::new("/w")).is_err());
    }

    #[test]
    fn select_keeps_manifest_order() {
        let manifest = load();
        let picked = manifest
            .select(&["ixgbe".to_string(), "hsflowd".to_string()])
            .unwrap();
        let names: Vec<&str> = picked.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["hsflowd", "ixgbe"]);
        assert!(manifest.select(&["igb".to_string()]).is_err());
    }

    #[test]
    fn missing_manifest_is_a_precondition_failure() {
        let temp = tempfile::tempdir().unwrap();
        let err = Manifest::load(&temp.path().join("package.toml"), temp.path()).unwrap_err();
        assert!(err.to_string().contains("package manifest"));
    }
}
