use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

use clap::{Parser, Subcommand};
use zip::write::FileOptions;
use zip::CompressionMethod;

const WORKSPACE_PACKAGES: [&str; 2] = ["xacct_transfer_core", "xacct_transfer_lambda"];
const RUNTIME_PACKAGE: &str = "xacct_transfer_lambda";
const RUNTIME_BIN: &str = "transfer_runtime";

type TaskResult = Result<(), String>;

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace tasks for the cross-account transfer pipeline")]
struct Cli {
    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Formatting, lints and tests for the transfer crates.
    Ci,
    /// Builds the runtime binary and zips it as a Lambda `bootstrap`.
    ServerlessPackage {
        /// Target triple of the Lambda architecture.
        #[arg(long, env = "XACCT_LAMBDA_TARGET", default_value = "x86_64-unknown-linux-musl")]
        target: String,
        /// Build without `--release`.
        #[arg(long)]
        debug: bool,
        /// Directory that receives `runtime.zip`.
        #[arg(long, default_value = "dist")]
        out_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.task {
        Task::Ci => ci(),
        Task::ServerlessPackage {
            target,
            debug,
            out_dir,
        } => serverless_package(&target, !debug, &out_dir),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("xtask: {message}");
            ExitCode::FAILURE
        }
    }
}

fn ci() -> TaskResult {
    cargo(&["fmt", "--all", "--", "--check"])?;
    cargo(&["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
    for package in WORKSPACE_PACKAGES {
        cargo(&["test", "-p", package])?;
    }
    Ok(())
}

fn serverless_package(target: &str, release: bool, out_dir: &Path) -> TaskResult {
    let mut args = vec!["build", "-p", RUNTIME_PACKAGE, "--bin", RUNTIME_BIN, "--target", target];
    if release {
        args.push("--release");
    }
    cargo(&args)?;

    let profile_dir = if release { "release" } else { "debug" };
    let binary = workspace_root()
        .join("target")
        .join(target)
        .join(profile_dir)
        .join(RUNTIME_BIN);
    let bytes = fs::read(&binary)
        .map_err(|error| format!("reading {}: {error}", binary.display()))?;

    fs::create_dir_all(out_dir)
        .map_err(|error| format!("creating {}: {error}", out_dir.display()))?;
    let archive_path = out_dir.join("runtime.zip");
    write_bootstrap_zip(&archive_path, &bytes)?;
    println!("packaged {} ({} bytes) into {}", RUNTIME_BIN, bytes.len(), archive_path.display());
    Ok(())
}

/// The provided.al2023 runtime executes a file named `bootstrap` at the archive root.
fn write_bootstrap_zip(path: &Path, binary: &[u8]) -> TaskResult {
    let describe = |error: &dyn std::fmt::Display| format!("writing {}: {error}", path.display());
    let file = File::create(path).map_err(|error| describe(&error))?;
    let mut archive = zip::ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);
    archive
        .start_file("bootstrap", options)
        .map_err(|error| describe(&error))?;
    archive.write_all(binary).map_err(|error| describe(&error))?;
    archive.finish().map_err(|error| describe(&error))?;
    Ok(())
}

fn cargo(args: &[&str]) -> TaskResult {
    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let status = Command::new(&cargo)
        .args(args)
        .current_dir(workspace_root())
        .status()
        .map_err(|error| format!("spawning {cargo}: {error}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("`cargo {}` exited with {status}", args.join(" ")))
    }
}

fn workspace_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(manifest_dir)
}
