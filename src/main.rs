//! CLI entry point for the retrieval core.
//!
//! Provides commands for building the seed cache and for running the
//! neighbor queries against a local shard directory, mirroring what the
//! serving layer calls in production.

use anyhow::{Context, bail};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use lookalike::service::resolve_client_key;
use lookalike::{BrowseService, ProductId, Settings};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(name = "lookalike")]
#[command(version, about = "Visual-similarity retrieval over feature shards")]
#[command(styles = clap_cargo_style())]
struct Cli {
    /// Path to a custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the shards and build (or refresh) the seed cache
    Index,
    /// Print the diversity-sampled first page of product IDs
    FirstPage,
    /// Query neighbors of an item, keyword, or raw feature vector
    Neighbors {
        /// Product ID already present in the index
        #[arg(long, conflicts_with_all = ["keyword", "features"])]
        id: Option<String>,
        /// Keyword with a prototype vector
        #[arg(long, conflicts_with = "features")]
        keyword: Option<String>,
        /// Base64-encoded little-endian f32 feature vector
        #[arg(long)]
        features: Option<String>,
        /// Client key for admission control
        #[arg(long, default_value = "local")]
        client: String,
        /// Simulated forwarded-for header, for exercising proxy resolution
        #[arg(long)]
        forwarded_for: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("failed to load settings")?;

    match cli.command {
        Commands::Index => {
            let service = BrowseService::new(&settings)?;
            eprintln!(
                "Indexed {} products, {} seeds cached at {}",
                service.store().len(),
                service.first_page().len(),
                settings.cluster_cache.display()
            );
        }
        Commands::FirstPage => {
            let service = BrowseService::new(&settings)?;
            println!("{}", serde_json::to_string_pretty(service.first_page())?);
        }
        Commands::Neighbors {
            id,
            keyword,
            features,
            client,
            forwarded_for,
        } => {
            let service = BrowseService::new(&settings)?;
            service.start();
            let key = resolve_client_key(&client, forwarded_for.as_deref(), settings.proxy_count);

            let result = if let Some(id) = id {
                service.neighbors_by_id(&key, &ProductId::new(id)).await
            } else if let Some(keyword) = keyword {
                service.neighbors_by_keyword(&key, &keyword).await
            } else if let Some(encoded) = features {
                service.neighbors_by_feature(&key, &encoded).await
            } else {
                bail!("one of --id, --keyword, or --features is required");
            };
            service.shutdown();

            match result {
                Ok(neighbors) => println!("{}", serde_json::to_string_pretty(&neighbors)?),
                Err(e) => bail!("{} ({})", e, e.status_code()),
            }
        }
    }
    Ok(())
}
