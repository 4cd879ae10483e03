//! Workspace automation tasks.
//!
//! Run with: `cargo xtask <command>`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask", about = "tilevault workspace automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all CI checks locally
    Ci,
    /// Validate workspace conventions
    Lint,
    /// Run the test suite
    Test {
        /// Only run the atomic-write crate's tests
        #[arg(long)]
        atomic_only: bool,
    },
    /// Generate coverage report
    Coverage,
}

/// Attributes every library crate root must carry.
const REQUIRED_CRATE_ATTRS: &[&str] = &["#![forbid(unsafe_code)]", "#![deny(missing_docs)]"];

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ci => run_ci(),
        Commands::Lint => run_lint(),
        Commands::Test { atomic_only } => run_tests(atomic_only),
        Commands::Coverage => run_coverage(),
    }
}

fn run_ci() -> Result<()> {
    println!("Running CI checks...\n");

    run_lint()?;
    run_cmd("cargo", &["fmt", "--check"])?;
    run_cmd("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
    run_tests(false)?;
    run_cmd("cargo", &["doc", "--workspace", "--no-deps"])?;

    println!("\nAll CI checks passed!");
    Ok(())
}

fn run_lint() -> Result<()> {
    println!("Validating workspace conventions...\n");

    for entry in std::fs::read_dir("crates").context("reading crates/")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("tilevault-") {
            anyhow::bail!("Crate '{name}' does not follow tilevault-* naming");
        }
        check_crate_root(&entry.path().join("src").join("lib.rs"), &name)?;
    }

    println!("All conventions validated!");
    Ok(())
}

fn check_crate_root(lib_rs: &Path, name: &str) -> Result<()> {
    let source = std::fs::read_to_string(lib_rs)
        .with_context(|| format!("reading {}", lib_rs.display()))?;
    for attr in REQUIRED_CRATE_ATTRS {
        if !source.contains(attr) {
            anyhow::bail!("Crate '{name}' is missing {attr}");
        }
    }
    Ok(())
}

fn run_tests(atomic_only: bool) -> Result<()> {
    if atomic_only {
        run_cmd("cargo", &["test", "-p", "tilevault-atomic"])
    } else {
        run_cmd("cargo", &["test", "--workspace"])
    }
}

fn run_coverage() -> Result<()> {
    run_cmd("cargo", &["llvm-cov", "--workspace", "--html"])?;
    println!("\nCoverage report: target/llvm-cov/html/index.html");
    Ok(())
}

fn run_cmd(cmd: &str, args: &[&str]) -> Result<()> {
    println!("$ {} {}", cmd, args.join(" "));
    let status = Command::new(cmd)
        .args(args)
        .status()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", cmd, args.join(" "));
    }
    Ok(())
}
