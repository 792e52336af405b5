//! refstash CLI
//!
//! Quality-gated web fetcher with a markdown reference store. JSON results
//! go to stdout, progress lines to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use refstash::{
    fetch_links, BrowserManager, FetchOptions, FetchOutcome, FetchPipeline, RefStatus, Reference,
    ReferenceStore, SaveResult, WaitStrategy,
};

#[derive(Parser)]
#[command(name = "refstash")]
#[command(author = "RoyalBit Inc.")]
#[command(version)]
#[command(about = "Quality-gated web fetcher that stashes readable pages as markdown references")]
struct Cli {
    /// Store directory (holds temporary/ and permanent/ subdirectories)
    #[arg(long, global = true, default_value = "references")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL, score the extracted markdown, and stash it
    Fetch(FetchArgs),
    /// List stored references, newest first
    List(ListArgs),
    /// Show a stored reference, body included
    Show(ShowArgs),
    /// Move a reference into permanent storage
    Promote { ref_id: String },
    /// Delete a stored reference
    Delete { ref_id: String },
    /// List the outbound links of a stored reference
    Links { ref_id: String },
    /// Fetch every outbound link of a stored reference
    FetchLinks(FetchLinksArgs),
}

#[derive(Args)]
struct FetchArgs {
    /// URL to fetch
    url: String,

    /// Minimum acceptable quality score
    #[arg(long, default_value = "60")]
    min_score: u8,

    /// Score a simple fetch must reach to skip the browser renderer
    #[arg(long, default_value = "80")]
    fallback_threshold: u8,

    /// Skip the simple fetch and render with the browser directly
    #[arg(long)]
    force_fallback: bool,

    /// Renderer wait strategy: domcontentloaded, load, or networkidle
    #[arg(long, default_value = "networkidle")]
    wait: String,

    /// Renderer navigation timeout in milliseconds
    #[arg(long, default_value = "30000")]
    timeout: u64,

    /// Free-text tag stored with the reference
    #[arg(long)]
    query: Option<String>,

    /// Overwrite an existing reference for the same URL
    #[arg(long)]
    refetch: bool,
}

#[derive(Args)]
struct ListArgs {
    /// List the permanent store instead of the temporary one
    #[arg(long)]
    permanent: bool,

    /// Output format: json (default) or yaml
    #[arg(long, short, default_value = "json")]
    format: String,
}

#[derive(Args)]
struct ShowArgs {
    ref_id: String,

    /// Output format: json (default) or yaml
    #[arg(long, short, default_value = "json")]
    format: String,
}

#[derive(Args)]
struct FetchLinksArgs {
    ref_id: String,

    /// Minimum acceptable quality score
    #[arg(long, default_value = "60")]
    min_score: u8,

    /// Score a simple fetch must reach to skip the browser renderer
    #[arg(long, default_value = "80")]
    fallback_threshold: u8,

    /// Renderer navigation timeout in milliseconds
    #[arg(long, default_value = "30000")]
    timeout: u64,

    /// Refetch links that are already stored
    #[arg(long)]
    refetch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = ReferenceStore::open(&cli.dir);

    match cli.command {
        Commands::Fetch(args) => run_fetch(&store, args).await,
        Commands::List(args) => run_list(&store, args).await,
        Commands::Show(args) => run_show(&store, args).await,
        Commands::Promote { ref_id } => run_promote(&store, &ref_id).await,
        Commands::Delete { ref_id } => run_delete(&store, &ref_id).await,
        Commands::Links { ref_id } => run_links(&store, &ref_id).await,
        Commands::FetchLinks(args) => run_fetch_links(&store, args).await,
    }
}

#[derive(Serialize)]
struct FetchReport<'a> {
    #[serde(flatten)]
    outcome: &'a FetchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved: Option<&'a SaveResult>,
}

async fn run_fetch(store: &ReferenceStore, args: FetchArgs) -> Result<()> {
    let opts = fetch_options(
        args.min_score,
        args.fallback_threshold,
        args.force_fallback,
        &args.wait,
        args.timeout,
    )?;

    eprintln!("Fetching {}...", args.url);

    let browser = BrowserManager::new();
    let pipeline = FetchPipeline::new(browser.clone())?;
    let outcome = pipeline.fetch(&args.url, &opts).await;

    let save_result = if outcome.success {
        let title = outcome.title.clone().unwrap_or_else(|| args.url.clone());
        let markdown = outcome.markdown.clone().unwrap_or_default();
        Some(
            store
                .save(
                    &title,
                    &args.url,
                    &markdown,
                    args.query.as_deref(),
                    args.refetch,
                )
                .await,
        )
    } else {
        None
    };

    // Safe even if parallel callers still hold leases
    browser.request_shutdown().await;

    let saved = save_result.transpose()?;
    println!(
        "{}",
        serde_json::to_string(&FetchReport {
            outcome: &outcome,
            saved: saved.as_ref(),
        })?
    );

    match (outcome.success, &saved) {
        (true, Some(s)) if s.already_exists => {
            eprintln!("Already stored as {}", s.ref_id);
        }
        (true, Some(s)) => {
            eprintln!("Stored as {}", s.ref_id);
        }
        _ => {
            eprintln!(
                "Failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn run_list(store: &ReferenceStore, args: ListArgs) -> Result<()> {
    let status = if args.permanent {
        RefStatus::Permanent
    } else {
        RefStatus::Temporary
    };
    let refs = store.list(status).await?;
    println!("{}", render(&refs, &args.format)?);
    eprintln!(
        "{} reference{}",
        refs.len(),
        if refs.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

#[derive(Serialize)]
struct ShowOutput<'a> {
    #[serde(flatten)]
    reference: &'a Reference,
    body: &'a str,
}

async fn run_show(store: &ReferenceStore, args: ShowArgs) -> Result<()> {
    let reference = store.find(&args.ref_id).await?;
    let output = ShowOutput {
        reference: &reference,
        body: &reference.body,
    };
    println!("{}", render(&output, &args.format)?);
    Ok(())
}

async fn run_promote(store: &ReferenceStore, ref_id: &str) -> Result<()> {
    let promotion = store.promote(ref_id).await?;
    println!("{}", serde_json::to_string(&promotion)?);
    eprintln!("Promoted {}", ref_id);
    Ok(())
}

async fn run_delete(store: &ReferenceStore, ref_id: &str) -> Result<()> {
    let path = store.delete(ref_id).await?;
    println!("{}", serde_json::to_string(&serde_json::json!({ "deleted": path }))?);
    eprintln!("Deleted {}", ref_id);
    Ok(())
}

async fn run_links(store: &ReferenceStore, ref_id: &str) -> Result<()> {
    let links = store.extract_links(ref_id).await?;
    println!("{}", serde_json::to_string(&links)?);
    eprintln!(
        "{} link{}",
        links.len(),
        if links.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

async fn run_fetch_links(store: &ReferenceStore, args: FetchLinksArgs) -> Result<()> {
    let opts = fetch_options(
        args.min_score,
        args.fallback_threshold,
        false,
        "networkidle",
        args.timeout,
    )?;

    let browser = BrowserManager::new();
    let pipeline = FetchPipeline::new(browser)?;

    eprintln!("Fetching links of {}...", args.ref_id);
    let report = fetch_links(store, &pipeline, &args.ref_id, &opts, args.refetch).await?;

    println!("{}", serde_json::to_string(&report)?);
    eprintln!(
        "Done: {} new, {} cached, {} failed",
        report.summary.new, report.summary.cached, report.summary.failed
    );
    Ok(())
}

fn fetch_options(
    min_score: u8,
    fallback_threshold: u8,
    force_fallback: bool,
    wait: &str,
    timeout_ms: u64,
) -> Result<FetchOptions> {
    if min_score >= fallback_threshold {
        bail!("--min-score must be below --fallback-threshold");
    }
    Ok(FetchOptions {
        min_score,
        fallback_threshold,
        force_fallback,
        wait: parse_wait(wait)?,
        timeout: Duration::from_millis(timeout_ms),
    })
}

fn parse_wait(value: &str) -> Result<WaitStrategy> {
    match value {
        "domcontentloaded" | "dom" => Ok(WaitStrategy::DomContentLoaded),
        "load" => Ok(WaitStrategy::Load),
        "networkidle" | "idle" => Ok(WaitStrategy::NetworkIdle),
        other => bail!("unknown wait strategy '{}' (expected domcontentloaded, load, or networkidle)", other),
    }
}

fn render<T: Serialize>(value: &T, format: &str) -> Result<String> {
    Ok(match format {
        "yaml" | "yml" => serde_yaml::to_string(value)?,
        _ => serde_json::to_string_pretty(value)?,
    })
}
