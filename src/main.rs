//! svn-test-driver CLI
//!
//! Runs the Subversion test suite for a finished build.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use svn_test_driver::error::EXIT_SETUP;
use svn_test_driver::{
    BuildManifest, BuildVariant, CommandHarness, ExecutionDriver, HttpdMode, RunConfig, Validate,
};

/// Run the Subversion test suite against a finished build.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to run the tests in. Executables are copied there.
    build_dir: Option<PathBuf>,

    /// TOML file with run defaults; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Build manifest describing tests and build outputs
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Source tree root
    #[arg(long)]
    src_dir: Option<PathBuf>,

    /// Test the Release configuration
    #[arg(short, long, conflicts_with = "debug")]
    release: bool,

    /// Test the Debug configuration (default)
    #[arg(short, long)]
    debug: bool,

    /// Print more information, and log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Print only unexpected results
    #[arg(short, long)]
    quiet: bool,

    /// Clean up after successful tests
    #[arg(short, long)]
    cleanup: bool,

    /// Test to run, as `<name>[#<subtests>]`; repeatable
    #[arg(short, long = "test", value_name = "TEST")]
    tests: Vec<String>,

    /// Run the tests in parallel
    #[arg(short, long)]
    parallel: bool,

    /// Base URL of the repository to test against
    #[arg(short = 'u', long = "url")]
    url: Option<String>,

    /// Comma-separated svnserve arguments; implies running svnserve
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    svnserve_args: Option<Vec<String>>,

    /// Filesystem backend (fsfs, bdb, fsx)
    #[arg(short, long)]
    fs_type: Option<String>,

    /// httpd installation; runs the DAV tests
    #[arg(long)]
    httpd_dir: Option<PathBuf>,

    /// Port for httpd (default: random)
    #[arg(long)]
    httpd_port: Option<u16>,

    /// Run httpd as a daemon instead of a service
    #[arg(long, conflicts_with = "httpd_service")]
    httpd_daemon: bool,

    /// Run httpd as a service (default)
    #[arg(long)]
    httpd_service: bool,

    /// Only log errors from httpd
    #[arg(long)]
    httpd_no_log: bool,

    /// Use short-circuit path authorization
    #[arg(long)]
    http_short_circuit: bool,

    /// Do not advertise HTTP protocol v2
    #[arg(long)]
    disable_http_v2: bool,

    /// Disable bulk updates on the server
    #[arg(long)]
    disable_bulk_updates: bool,

    /// Test the SASL authentication layer
    #[arg(long)]
    enable_sasl: bool,

    /// List the tests instead of running them
    #[arg(long)]
    list: bool,

    /// Only list tests matching this milestone regex
    #[arg(long)]
    milestone_filter: Option<String>,

    /// Only run tests of this mode (XFAIL, SKIP, PASS, ALL)
    #[arg(long)]
    mode_filter: Option<String>,

    /// Minor version of the server under test
    #[arg(long)]
    server_minor_version: Option<u32>,

    /// Use svn binaries from this directory
    #[arg(long = "bin")]
    svn_bin: Option<PathBuf>,

    /// Configuration file for the tests
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Shard size for fsfs repositories
    #[arg(long)]
    fsfs_sharding: Option<u32>,

    /// Pack fsfs repositories automatically
    #[arg(long)]
    fsfs_packing: bool,

    /// Log to stdout instead of log files
    #[arg(long)]
    log_to_stdout: bool,

    /// Log level passed to the tests
    #[arg(long)]
    log_level: Option<String>,

    /// SSL certificate to trust
    #[arg(long)]
    ssl_cert: Option<PathBuf>,
}

impl Args {
    /// Layers the flags that were given on top of `config`.
    fn apply(self, config: &mut RunConfig) {
        if self.release {
            config.variant = BuildVariant::Release;
        } else if self.debug {
            config.variant = BuildVariant::Debug;
        }

        set(&mut config.build_dir, self.build_dir);
        if let Some(manifest) = self.manifest {
            config.manifest = manifest;
        }
        if let Some(src_dir) = self.src_dir {
            config.src_dir = src_dir;
        }
        if !self.tests.is_empty() {
            config.tests = self.tests;
        }

        set(&mut config.base_url, self.url);
        set(&mut config.svnserve_args, self.svnserve_args);
        set(&mut config.fs_type, self.fs_type);
        set(&mut config.httpd.dir, self.httpd_dir);
        set(&mut config.httpd.port, self.httpd_port);
        if self.httpd_daemon {
            config.httpd.mode = HttpdMode::Daemon;
        } else if self.httpd_service {
            config.httpd.mode = HttpdMode::Service;
        }
        config.httpd.no_log |= self.httpd_no_log;
        config.httpd.short_circuit |= self.http_short_circuit;
        config.httpd.disable_v2 |= self.disable_http_v2;
        config.httpd.disable_bulk_updates |= self.disable_bulk_updates;

        config.verbose |= self.verbose;
        config.quiet |= self.quiet;
        config.cleanup |= self.cleanup;
        config.parallel |= self.parallel;
        config.enable_sasl |= self.enable_sasl;
        config.list |= self.list;
        config.fsfs_packing |= self.fsfs_packing;
        config.log_to_stdout |= self.log_to_stdout;

        set(&mut config.milestone_filter, self.milestone_filter);
        set(&mut config.mode_filter, self.mode_filter);
        set(&mut config.server_minor_version, self.server_minor_version);
        set(&mut config.svn_bin, self.svn_bin);
        set(&mut config.config_file, self.config_file);
        set(&mut config.fsfs_sharding, self.fsfs_sharding);
        set(&mut config.log_level, self.log_level);
        set(&mut config.ssl_cert, self.ssl_cert);
    }
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else if quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> svn_test_driver::Result<i32> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    args.apply(&mut config);

    let validation = config.validate();
    if !validation.is_valid() {
        for error in &validation.errors {
            eprintln!("Error: {}", error);
        }
        return Ok(EXIT_SETUP);
    }
    for warning in validation.into_result()? {
        tracing::warn!("{}", warning);
    }

    let settings = config.resolve()?;
    let manifest_path = if config.manifest.is_absolute() {
        config.manifest.clone()
    } else {
        settings.layout.src_dir.join(&config.manifest)
    };
    let manifest = BuildManifest::load(&manifest_path)?;
    let harness = CommandHarness::new(&config.harness_command)?;

    let mut driver = ExecutionDriver::new(config, settings, manifest, Arc::new(harness));
    println!("{}", driver.banner());

    let outcome = driver.run().await?;
    for warning in &outcome.warnings {
        println!("{}", warning);
    }
    if outcome.failed {
        println!("[Test runner reported failure]");
    }

    Ok(outcome.exit_code())
}
