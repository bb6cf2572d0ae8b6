//! sasview Command-Line Interface
//!
//! This CLI provides tools for:
//! - Reading SAS7BDAT / XPT datasets as JSON records
//! - Reporting dataset dimensions
//! - Checking that the embedded interpreter boots and provisions its packages

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sasview_bridge::{BridgeConfig, RuntimeHandle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(name = "sasview")]
#[command(author, version, about = "Read SAS datasets through an embedded interpreter", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Bridge configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Interpreter WASM module
    #[arg(long, global = true)]
    module: Option<PathBuf>,

    /// Package repository URL
    #[arg(long, global = true)]
    repository: Option<String>,

    /// Per-query timeout in milliseconds (0 = unlimited)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print dataset records as JSON
    Read {
        /// Dataset file (.sas7bdat or .xpt)
        file: PathBuf,

        /// Row selector, e.g. "1:10"
        #[arg(long, default_value = "all")]
        rows: String,

        /// Column selector, e.g. 'c("USUBJID", "AGE")'
        #[arg(long, default_value = "all")]
        cols: String,

        /// Read at most N rows (all columns)
        #[arg(long, conflicts_with_all = ["rows", "cols"])]
        max_rows: Option<u64>,

        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Print dataset dimensions
    Shape {
        /// Dataset file (.sas7bdat or .xpt)
        file: PathBuf,
    },

    /// Initialize the interpreter and report provisioned packages
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let handle = RuntimeHandle::wasm(config);
        let result = run(&handle, cli.command).await;
        handle.teardown().await;
        result
    })
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    if let Some(module) = &cli.module {
        config.wasm.interpreter_module = Some(absolute(module)?);
    }
    if let Some(url) = &cli.repository {
        config = config.repository(url.clone());
    }
    if let Some(ms) = cli.timeout_ms {
        config = config.query_timeout_ms(ms);
    }
    Ok(config)
}

async fn run(handle: &RuntimeHandle, command: Commands) -> Result<()> {
    let start = Instant::now();
    handle
        .initialize()
        .await
        .context("Failed to initialize interpreter")?;
    info!("Interpreter ready in {:.2?}", start.elapsed());

    match command {
        Commands::Read {
            file,
            rows,
            cols,
            max_rows,
            pretty,
        } => cmd_read(handle, &file, &rows, &cols, max_rows, pretty).await,
        Commands::Shape { file } => cmd_shape(handle, &file).await,
        Commands::Check => cmd_check(handle).await,
    }
}

async fn cmd_read(
    handle: &RuntimeHandle,
    file: &Path,
    rows: &str,
    cols: &str,
    max_rows: Option<u64>,
    pretty: bool,
) -> Result<()> {
    let path = absolute(file)?;
    let start = Instant::now();

    let records = match max_rows {
        Some(n) => handle.read_dataset_limited(&path, n).await,
        None => handle.read_dataset(&path, rows, cols).await,
    }
    .with_context(|| format!("Failed to read {}", path.display()))?;
    info!("Read {} records in {:.2?}", records.len(), start.elapsed());

    let mut out = std::io::stdout().lock();
    if pretty {
        serde_json::to_writer_pretty(&mut out, &records)?;
    } else {
        serde_json::to_writer(&mut out, &records)?;
    }
    writeln!(out)?;
    Ok(())
}

async fn cmd_shape(handle: &RuntimeHandle, file: &Path) -> Result<()> {
    let path = absolute(file)?;
    let shape = handle
        .read_dataset_shape(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    println!("{} x {}", shape.rows, shape.cols);
    Ok(())
}

async fn cmd_check(handle: &RuntimeHandle) -> Result<()> {
    let config = handle.config();

    println!("=== sasview Runtime Check ===");
    println!();
    println!("Configuration:");
    match &config.wasm.interpreter_module {
        Some(module) => println!("  Module:            {}", module.display()),
        None => println!("  Module:            (none)"),
    }
    println!("  Repository:        {}", config.repository_url);
    println!("  Mount point:       {}", config.mount_point);
    match config.query_timeout() {
        Some(limit) => println!("  Query timeout:     {:?}", limit),
        None => println!("  Query timeout:     unlimited"),
    }
    println!();
    println!("Runtime:");
    println!("  State:             {:?}", handle.state());
    println!(
        "  Packages:          {}",
        handle.provisioned_packages().await.join(", ")
    );

    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .with_context(|| format!("Failed to resolve path {}", path.display()))
}
