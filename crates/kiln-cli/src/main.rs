//! Kiln CLI - Incremental Build Engine
//!
//! Commands:
//! - kiln build --manifest <file> --profile <name>   - Build a step graph
//! - kiln build ... --clean | --clean-and-delete     - Forget (and delete) previous results
//! - kiln slave --address <url> --build-dir <dir>    - Worker mode, started by a master
//! - kiln config [--set key=value]...                - Show (and change) the configuration
//!
//! Exit codes: 0 success, 1 build error, 2 fatal fault.

mod logging;
mod manifest;
mod package_builder;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln_core::{
    apply_setting, get_config_path, load_config, save_config, BuildResultCode, BuilderConfig,
    CommandRegistry, Mode,
};
use package_builder::{PackageBuilder, PackageBuilderOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{info, warn};

/// Kiln - Incremental, distributable build engine
#[derive(Parser)]
#[command(name = "kiln", version, about = "Incremental, distributable build engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the steps of a manifest
    Build {
        /// Manifest file describing the build steps
        #[arg(short, long)]
        manifest: Option<PathBuf>,
        /// Directory holding the index and build outputs
        #[arg(short, long, default_value = "build")]
        build_dir: PathBuf,
        /// Build profile (selects the index file)
        #[arg(short, long)]
        profile: String,
        /// Offload pool size (default: CPU cores)
        #[arg(short = 'j', long)]
        threads: Option<usize>,
        /// Build parameter, repeatable (e.g. --property platform=linux)
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
        /// Seconds a worker process has to report its result
        #[arg(long)]
        remote_timeout: Option<u64>,
        #[arg(long)]
        log_level: Option<String>,
        /// Forget previous results
        #[arg(long, conflicts_with = "clean_and_delete")]
        clean: bool,
        /// Forget previous results and delete their output files
        #[arg(long)]
        clean_and_delete: bool,
        /// Rewrite the index from this build only
        #[arg(long)]
        no_merge_index: bool,
    },
    /// Execute one command for a master process
    Slave {
        /// Channel address handed out by the master
        #[arg(long)]
        address: String,
        #[arg(long)]
        build_dir: PathBuf,
        #[arg(long, default_value = "default")]
        profile: String,
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Show the effective configuration
    Config {
        /// Change a setting and save the file, repeatable (e.g. --set thread_count=8)
        #[arg(long = "set", value_parser = parse_property)]
        set: Vec<(String, String)>,
    },
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code.exit_code()),
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<BuildResultCode> {
    let cwd = std::env::current_dir()?;
    let config = load_config(&cwd)?;

    match cli.command {
        Commands::Build {
            manifest,
            build_dir,
            profile,
            threads,
            properties,
            remote_timeout,
            log_level,
            clean,
            clean_and_delete,
            no_merge_index,
        } => {
            logging::init_logging(log_level.as_deref(), config.log_level.as_deref())?;

            let mut options = PackageBuilderOptions::from_config(&config);
            options.manifest = manifest;
            options.build_dir = build_dir;
            options.profile = Some(profile);
            options.thread_count = threads.or(options.thread_count);
            options.properties.extend(properties);
            if let Some(secs) = remote_timeout {
                options.remote_timeout = Duration::from_secs(secs);
            }
            options.mode = if clean_and_delete {
                Mode::CleanAndDelete
            } else if clean {
                Mode::Clean
            } else {
                Mode::Build
            };
            options.merge_index = !no_merge_index;
            options.validate()?;

            run_package_builder(options, true).await
        }

        Commands::Slave {
            address,
            build_dir,
            profile,
            log_level,
        } => {
            logging::init_logging(log_level.as_deref(), config.log_level.as_deref())?;

            let mut options = PackageBuilderOptions::from_config(&config);
            options.slave_address = Some(address);
            options.build_dir = build_dir;
            options.profile = Some(profile);
            options.validate()?;

            run_package_builder(options, false).await
        }

        Commands::Config { set } => {
            let mut config = config;
            if !set.is_empty() {
                update_config(&get_config_path(&cwd), &mut config, &set)?;
            }
            show_config(&cwd, &config)?;
            Ok(BuildResultCode::Successful)
        }
    }
}

async fn run_package_builder(
    options: PackageBuilderOptions,
    report: bool,
) -> Result<BuildResultCode> {
    let start = Instant::now();
    let builder = Arc::new(PackageBuilder::new(
        options,
        Arc::new(CommandRegistry::with_builtins()),
    ));

    let cancellation = builder.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancelling build...");
            cancellation.cancel();
        }
    });

    let runtime = Handle::current();
    let worker = builder.clone();
    let result = tokio::task::spawn_blocking(move || worker.build(runtime))
        .await
        .context("build thread panicked")??;

    if report {
        let failures = builder
            .diagnostics()
            .iter()
            .filter(|d| d.level >= kiln_core::LogLevel::Error)
            .count();
        match result {
            BuildResultCode::Successful => {
                println!("✅ Build succeeded in {:.2?}", start.elapsed())
            }
            BuildResultCode::BuildError => println!(
                "❌ Build failed in {:.2?} ({} error diagnostics)",
                start.elapsed(),
                failures
            ),
        }
    }
    info!(result = ?result, "done");
    Ok(result)
}

fn update_config(path: &Path, config: &mut BuilderConfig, settings: &[(String, String)]) -> Result<()> {
    for (key, value) in settings {
        apply_setting(config, key, value)?;
    }
    save_config(path, config)
}

fn show_config(cwd: &Path, config: &BuilderConfig) -> Result<()> {
    let path = get_config_path(cwd);
    let origin = if path.exists() { "" } else { " (not present, defaults)" };
    println!("📄 Config: {}{}", path.display(), origin);
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_property() {
        assert_eq!(
            parse_property("platform=linux").unwrap(),
            ("platform".to_string(), "linux".to_string())
        );
        assert_eq!(
            parse_property("flags=a=b").unwrap(),
            ("flags".to_string(), "a=b".to_string())
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=x").is_err());
    }

    #[test]
    fn test_cli_parses_worker_mode() {
        let cli = Cli::try_parse_from([
            "kiln",
            "slave",
            "--address",
            "http://127.0.0.1:4000/abc",
            "--build-dir",
            "/tmp/build",
            "--profile",
            "release",
        ])
        .unwrap();
        match cli.command {
            Commands::Slave { address, profile, .. } => {
                assert_eq!(address, "http://127.0.0.1:4000/abc");
                assert_eq!(profile, "release");
            }
            _ => panic!("expected slave mode"),
        }

        assert!(Cli::try_parse_from(["kiln", "build", "--profile", "p", "--clean", "--clean-and-delete"]).is_err());
    }

    #[test]
    fn test_config_set_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(kiln_core::config::PROJECT_CONFIG_FILE);
        let cli = Cli::try_parse_from([
            "kiln",
            "config",
            "--set",
            "thread_count=3",
            "--set",
            "log_level=warn",
        ])
        .unwrap();
        let Commands::Config { set } = cli.command else {
            panic!("expected config mode");
        };

        let mut config = BuilderConfig::default();
        update_config(&path, &mut config, &set).unwrap();
        let saved = kiln_core::load_config_from(&path).unwrap();
        assert_eq!(saved.thread_count, Some(3));
        assert_eq!(saved.log_level.as_deref(), Some("warn"));
        assert_eq!(saved, config);

        let unknown = [("nope".to_string(), "1".to_string())];
        assert!(update_config(&path, &mut config, &unknown).is_err());
    }
}
