use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use marketsync_core::progress::LogProgress;
use marketsync_core::registry::CollectionEntry;
use marketsync_core::service::{CollectionService, DEFAULT_PAGE_SIZE};
use marketsync_core::source::{CsvDirClient, HttpSourceClient, SourceClient};
use marketsync_core::store::JsonFileStore;
use marketsync_core::{CollectionRegistry, RawParams, RunOutcome, SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "marketsync", about = "Incremental market-data collection sync")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the stored collections
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Source gateway base URL
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Read source functions from `{dir}/{function}.csv` instead of the gateway
    #[arg(long, global = true)]
    csv_dir: Option<PathBuf>,

    /// Root of the collection manifests
    #[arg(long, global = true)]
    manifests: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List visible collections in display order
    List {
        #[arg(long)]
        category: Option<String>,
    },

    /// Print one collection's descriptor
    Show { name: String },

    /// Fetch once with the given parameters and upsert the result
    Sync {
        name: String,

        /// Caller parameter as key=value (repeatable)
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// Run a full (batch or single-call) sync of a collection
    Batch {
        name: String,

        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Requested worker count; capped by the store's connection pool
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Document count and time span of a stored collection
    Overview { name: String },

    /// Page through stored documents, newest first
    Browse {
        name: String,

        #[arg(long, default_value_t = 0)]
        skip: usize,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: usize,
    },

    /// Delete every stored document of a collection
    Clear {
        name: String,

        /// Confirm deletion (required)
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let registry = CollectionRegistry::new(&config.registry);

    match cli.command {
        Commands::List { category } => run_list(&registry, category.as_deref()),
        Commands::Show { name } => run_show(&registry, &name),
        Commands::Sync { name, params } => {
            let engine = build_engine(&config, cli.csv_dir)?;
            let entry = registry.lookup(&name)?;
            let raw = parse_params(&params)?;
            let outcome = engine.sync_one(entry.provider.as_ref(), &raw)?;
            report(&outcome)
        }
        Commands::Batch {
            name,
            params,
            concurrency,
        } => {
            let engine = build_engine(&config, cli.csv_dir)?;
            let entry = registry.lookup(&name)?;
            let mut raw = parse_params(&params)?;
            if let Some(n) = concurrency {
                raw.insert("concurrency".into(), Value::from(n));
            }
            let outcome = engine.run(entry.provider.as_ref(), &raw)?;
            report(&outcome)
        }
        Commands::Overview { name } => {
            let entry = registry.lookup(&name)?;
            let overview = service(&config).overview(entry.descriptor())?;
            println!("{}", serde_json::to_string_pretty(&overview)?);
            Ok(())
        }
        Commands::Browse { name, skip, limit } => {
            let entry = registry.lookup(&name)?;
            let page = service(&config).browse(entry.descriptor(), skip, limit)?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
        Commands::Clear { name, confirm } => {
            if !confirm {
                bail!("refusing to clear '{name}' without --confirm");
            }
            let entry = registry.lookup(&name)?;
            let removed = service(&config).clear(entry.descriptor())?;
            println!("Removed {removed} documents from {name}");
            Ok(())
        }
    }
}

/// Config file (or defaults) with command-line overrides applied.
fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = SyncConfig::standard();
            if let Some(dir) = default_data_dir() {
                config.store.data_dir = dir;
            }
            config
        }
    };
    if let Some(dir) = &cli.data_dir {
        config.store.data_dir = dir.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.source.endpoint = endpoint.clone();
    }
    if let Some(dir) = &cli.manifests {
        config.registry.manifest_dir = dir.clone();
    }
    Ok(config)
}

fn default_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("marketsync"))
}

fn build_engine(config: &SyncConfig, csv_dir: Option<PathBuf>) -> Result<SyncEngine> {
    let client: Arc<dyn SourceClient> = match csv_dir {
        Some(dir) => Arc::new(CsvDirClient::new(dir)),
        None => Arc::new(HttpSourceClient::from_config(&config.source)?),
    };
    let store = Arc::new(JsonFileStore::new(&config.store.data_dir));
    Ok(SyncEngine::new(store, client)
        .with_config(config)
        .with_progress(Arc::new(LogProgress)))
}

fn service(config: &SyncConfig) -> CollectionService {
    CollectionService::new(Arc::new(JsonFileStore::new(&config.store.data_dir)))
}

/// `key=value` pairs as caller parameters. Values stay strings; the source
/// receives strings either way.
fn parse_params(pairs: &[String]) -> Result<RawParams> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("parameter '{pair}' is not KEY=VALUE"))?;
            let key = key.trim();
            if key.is_empty() {
                bail!("parameter '{pair}' has an empty key");
            }
            Ok((key.to_string(), Value::String(value.to_string())))
        })
        .collect()
}

fn run_list(registry: &CollectionRegistry, category: Option<&str>) -> Result<()> {
    let entries = match category {
        Some(c) => registry.list_category(c),
        None => registry.list_descriptors(),
    };
    if entries.is_empty() {
        println!("No collections found.");
        return Ok(());
    }
    println!("{:<5} {:<10} {:<36} Display name", "Order", "Category", "Name");
    println!("{}", "-".repeat(80));
    for entry in &entries {
        print_entry(entry);
    }
    println!("\n{} collections", entries.len());
    Ok(())
}

fn print_entry(entry: &CollectionEntry) {
    let batch = if entry.descriptor().batch.is_some() {
        " [batch]"
    } else {
        ""
    };
    println!(
        "{:<5} {:<10} {:<36} {}{batch}",
        entry.order,
        entry.category,
        entry.name(),
        entry.display_name
    );
}

fn run_show(registry: &CollectionRegistry, name: &str) -> Result<()> {
    let entry = registry.lookup(name)?;
    println!("Name:         {}", entry.name());
    println!("Display name: {}", entry.display_name);
    println!("Category:     {}", entry.category);
    println!("Route:        {}", entry.route);
    if !entry.description.is_empty() {
        println!("Description:  {}", entry.description);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(entry.descriptor()).context("serializing descriptor")?
    );
    Ok(())
}

fn report(outcome: &RunOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    if !outcome.is_success() {
        eprintln!("Sync failed: {}", outcome.message);
        std::process::exit(1);
    }
    Ok(())
}
