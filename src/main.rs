use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paperhoard::{
    archive::{BlobStore, id_for_blob_name},
    config::{Config, load_config},
    index::IngestionMode,
    logging,
    metadata::MetadataStore,
    pipeline,
};

#[derive(Parser)]
#[command(
    name = "paperhoard",
    about = "Acquire, archive and index scholarly articles"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search, fetch, archive, chunk, index and record new articles.
    Run {
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Overrides INGESTION_MODE.
        #[arg(long, value_parser = parse_mode)]
        mode: Option<IngestionMode>,
    },
    /// List recorded articles, optionally filtered.
    Articles {
        #[arg(long)]
        title: Option<String>,
        /// Inclusive lower bound, YYYY-MM-DD.
        #[arg(long)]
        from: Option<String>,
        /// Inclusive upper bound, YYYY-MM-DD.
        #[arg(long)]
        to: Option<String>,
    },
    /// List archived blobs and the identifiers they encode.
    Blobs {
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Nearest chunks to a free-text query.
    Query {
        text: String,
        #[arg(long, default_value_t = 5)]
        k: usize,
    },
}

fn parse_mode(value: &str) -> Result<IngestionMode, String> {
    value
        .parse()
        .map_err(|()| format!("unknown ingestion mode '{value}' (expected append or overwrite)"))
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(if cli.verbose { "debug" } else { "info" });
    let mut config = load_config().context("failed to load configuration")?;

    match cli.command {
        Command::Run { query, limit, mode } => {
            if let Some(mode) = mode {
                config.ingestion_mode = mode;
            }
            run_pipeline(&config, &query, limit).await
        }
        Command::Articles { title, from, to } => {
            list_articles(&config, title.as_deref(), from.as_deref(), to.as_deref()).await
        }
        Command::Blobs { prefix } => list_blobs(&config, &prefix).await,
        Command::Query { text, k } => query_index(&config, &text, k).await,
    }
}

async fn run_pipeline(config: &Config, query: &str, limit: usize) -> Result<()> {
    let orchestrator = pipeline::orchestrator_from_config(config)
        .await
        .context("failed to initialize pipeline")?;
    let report = orchestrator
        .run(query, limit)
        .await
        .with_context(|| format!("pipeline run for '{query}' failed"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn list_articles(
    config: &Config,
    title: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<()> {
    let store = pipeline::open_metadata_store(config)
        .await
        .context("failed to open metadata store")?;
    let articles = match title {
        Some(text) => {
            let mut matches = store.find_by_title_substring(text).await?;
            matches.retain(|article| {
                from.is_none_or(|start| article.publication_date.as_str() >= start)
                    && to.is_none_or(|end| article.publication_date.as_str() <= end)
            });
            matches
        }
        None if from.is_some() || to.is_some() => store.find_by_date_range(from, to).await?,
        None => store.list_all().await?,
    };
    for article in &articles {
        println!(
            "{}\t{}\t{}\t{}",
            article.id, article.publication_date, article.container_title, article.title
        );
    }
    tracing::info!(count = articles.len(), "Listed articles");
    Ok(())
}

async fn list_blobs(config: &Config, prefix: &str) -> Result<()> {
    let archive = pipeline::open_archive(config)
        .await
        .context("failed to open blob archive")?;
    for name in archive.list(prefix).await? {
        // Hashed names for very long identifiers do not decode.
        let id = id_for_blob_name(&name).unwrap_or_else(|| "-".to_string());
        println!("{name}\t{id}");
    }
    Ok(())
}

async fn query_index(config: &Config, text: &str, k: usize) -> Result<()> {
    let indexer = pipeline::build_indexer(config).context("failed to build indexer")?;
    let hits = indexer.query_text(text, k).await?;
    for hit in hits {
        let pages = hit
            .origin
            .page_numbers
            .map(|pages| {
                pages
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        println!(
            "{:.4}\t{}\tp.{}\t{}\t{}",
            hit.score,
            hit.origin.source_id,
            pages,
            hit.origin.heading.unwrap_or_default(),
            hit.text.replace('\n', " ")
        );
    }
    Ok(())
}
