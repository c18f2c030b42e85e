//! Patch-and-package build orchestration for Debian packages and live ISOs.
//!
//! Each package named in `package.toml` is taken through the same sequence:
//!
//! - **Preconditions** - source tree, kernel variable file, prior-stage
//!   outputs and host tools are checked before anything is written
//! - **Patches** - applied in file-name order; the first rejection aborts
//! - **External build** - `dpkg-buildpackage`, a custom command, or `fpm`
//! - **Artifact placement** - staging, collision removal, `.deb` collection
//!
//! # Architecture
//!
//! ```text
//! package-build (binary)
//!     │
//!     ├── build ──> Orchestrator ──> preflight, patches, version,
//!     │                 │            backend, artifacts
//!     │                 └──────────> runs (record + lock), state
//!     ├── fetch ──> source
//!     ├── status ─> runs
//!     └── image ──> image (build-vyos-image dispatch, QEMU smoke tests)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use package_build::{BuildOptions, Manifest, Orchestrator};
//!
//! let manifest = Manifest::load("package.toml".as_ref(), ".".as_ref())?;
//! let orchestrator = Orchestrator::new(BuildOptions::new("."));
//! for package in manifest.select(&[])? {
//!     let outcome = orchestrator.run_package(package)?;
//!     println!("{} {}", package.name, outcome.version);
//! }
//! ```

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod deps;
pub mod error;
pub mod image;
pub mod kernel_vars;
pub mod orchestrator;
pub mod patches;
pub mod preflight;
pub mod process;
pub mod runs;
pub mod source;
pub mod state;
pub mod template;
pub mod version;

pub use config::{Manifest, PackageSpec};
pub use error::{exit_code_for, BuildError};
pub use orchestrator::{BuildOptions, Orchestrator, RunOutcome};
pub use state::{BuildState, StateTracker};
