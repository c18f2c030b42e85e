use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod workflows;

/// Patch-and-package build steps for Debian packages and live images
#[derive(Parser)]
#[command(name = "package-build")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the manifest lives and which packages to act on.
#[derive(Args, Debug, Clone)]
pub(crate) struct ManifestArgs {
    /// Package manifest (default: <work-dir>/package.toml)
    #[arg(short, long, env = "PACKAGE_BUILD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory that relative manifest paths are resolved against
    #[arg(short, long, default_value = ".")]
    pub work_dir: PathBuf,

    /// Only act on these packages (repeatable)
    #[arg(long = "only", value_name = "NAME")]
    pub only: Vec<String>,
}

impl ManifestArgs {
    pub fn config_path(&self) -> PathBuf {
        match &self.config {
            Some(path) => path.clone(),
            None => self
                .work_dir
                .join(package_build::config::DEFAULT_CONFIG_FILE),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub(crate) struct BuildArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// Patch directory holding one sub-directory per package
    #[arg(long, default_value = package_build::config::DEFAULT_PATCH_DIR)]
    pub patch_dir: PathBuf,

    /// Where built packages and tarballs are placed (default: work dir)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Do not apt-get install the manifest's [dependencies]
    #[arg(long)]
    pub skip_host_deps: bool,

    /// Run records kept per package
    #[arg(long, default_value_t = package_build::runs::DEFAULT_KEEP_RUNS)]
    pub keep_runs: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every selected package in manifest order
    Build(BuildArgs),

    /// Clone missing sources and check out pinned commits
    Fetch {
        #[command(flatten)]
        manifest: ManifestArgs,
    },

    /// Show the latest run record of each package
    Status {
        #[command(flatten)]
        manifest: ManifestArgs,

        /// Package to show (default: all)
        name: Option<String>,

        /// Print the raw run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build or test a live image (build-vyos-image flavor or fixed target)
    Image {
        /// checkiso, test, test-no-interfaces, test-interfaces, testc, testd,
        /// testsb, testraid, qemu-live, oci, clean, purge, or an image flavor
        target: String,

        /// Arguments passed through to the underlying script
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        extra: Vec<String>,

        /// Repository root holding build-vyos-image and scripts/
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Smoke-test filter forwarded as --match
        #[arg(long = "match", env = "MATCH")]
        match_filter: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build(args) => workflows::build(&args),
        Commands::Fetch { manifest } => workflows::fetch(&manifest),
        Commands::Status {
            mut manifest,
            name,
            json,
        } => {
            if let Some(name) = name {
                manifest.only.push(name);
            }
            workflows::status(&manifest, json)
        }
        Commands::Image {
            target,
            extra,
            root,
            match_filter,
        } => workflows::image(&root, &target, &extra, match_filter.as_deref()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = package_build::exit_code_for(&err).clamp(1, 255);
            ExitCode::from(code as u8)
        }
    }
}
