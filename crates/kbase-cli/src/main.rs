mod config;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use kbase_core::EntryKey;
use kbase_search::entry_source::{entries_path, read_entries_jsonl};
use kbase_search::{
    expander_from_config, provider_from_config, EmbeddingQueue, EmbeddingWorker, EnqueueOutcome,
    FileVectorIndex, FullTextIndex, InMemoryEntryStore, InMemoryFullTextIndex, QueuePolicy,
    ResultPage, SearchFilters, SearchRequest, SearchService, SqliteEmbeddingQueue, VectorIndex,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::KbaseConfig;

#[derive(Parser)]
#[command(name = "kbase", about = "kbase — keyword, semantic and hybrid knowledge-base search")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "kbase.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long, global = true)]
    plain_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import entries from a JSONL file and queue them for embedding
    Import {
        /// One JSON entry per line
        file: PathBuf,
    },
    /// Search entries
    Search {
        query: String,
        /// keyword, semantic or hybrid
        #[arg(short, long, default_value = "hybrid")]
        mode: String,
        #[arg(long)]
        collection: Option<String>,
        #[arg(long = "type")]
        entry_type: Option<String>,
        /// Required tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Updated on or after (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        from: Option<String>,
        /// Updated on or before (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        to: Option<String>,
        #[arg(short, long, default_value_t = 20, allow_negative_numbers = true)]
        limit: i64,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        offset: i64,
        /// Add related terms from the configured expander
        #[arg(long)]
        expand: bool,
        /// Print the result page as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show embedding queue and index counts
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Queue one entry for embedding again
    Reembed { collection: String, entry_id: String },
    /// Remove one entry and everything derived from it
    Delete { collection: String, entry_id: String },
    /// Run the embedding worker until Ctrl-C
    Worker,
    /// Embed everything pending, then exit
    EmbedPending,
    /// Drop all derived indexes and re-queue every entry
    Rebuild,
}

/// Everything a command needs, opened from the data directory.
struct Runtime {
    config: KbaseConfig,
    store: Arc<InMemoryEntryStore>,
    vectors: Arc<FileVectorIndex>,
    fulltext: Arc<InMemoryFullTextIndex>,
    queue: Arc<dyn EmbeddingQueue>,
    service: SearchService,
}

impl Runtime {
    async fn open(config: KbaseConfig) -> anyhow::Result<Self> {
        let data_dir = &config.data_dir;
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("Failed to create data dir '{}'", data_dir.display()))?;

        let store = Arc::new(
            InMemoryEntryStore::load_jsonl(&entries_path(data_dir))
                .await?
                .with_body_prefix_chars(config.search.body_prefix_chars),
        );

        // The keyword index lives in memory; rebuild it from the entries.
        let fulltext = Arc::new(InMemoryFullTextIndex::new());
        for entry in store.all().await {
            fulltext
                .upsert(
                    entry.key(),
                    entry.text(config.search.body_prefix_chars),
                    entry.meta(),
                )
                .await?;
        }

        let vectors = Arc::new(
            FileVectorIndex::open(data_dir.join("vectors.jsonl"), config.embedding.dimension)
                .await?,
        );
        let queue: Arc<dyn EmbeddingQueue> = Arc::new(SqliteEmbeddingQueue::open(
            &data_dir.join("queue.sqlite3"),
            QueuePolicy::from_config(&config.queue),
        )?);

        let provider = provider_from_config(&config.embedding)?;
        let expander = expander_from_config(&config.expansion)?;
        if provider.is_none() {
            info!("No embedding model configured, semantic search disabled");
        }

        let service = SearchService::new(
            config.search.clone(),
            store.clone(),
            fulltext.clone(),
            vectors.clone(),
            queue.clone(),
        )
        .with_provider(provider)
        .with_expander(expander);

        info!(
            data_dir = %data_dir.display(),
            entries = store.count().await,
            vectors = vectors.count().await?,
            "kbase opened"
        );

        Ok(Self {
            config,
            store,
            vectors,
            fulltext,
            queue,
            service,
        })
    }

    /// Embedding needs a model; queued items stay pending until one is configured.
    fn worker(&self) -> anyhow::Result<EmbeddingWorker> {
        let embedder = self.service.embedder();
        if !embedder.has_model() {
            anyhow::bail!(
                "No embedding model configured; set [embedding] provider in kbase.toml. \
                 Queued entries stay pending."
            );
        }
        Ok(EmbeddingWorker::new(
            self.queue.clone(),
            embedder,
            self.config.queue.clone(),
        ))
    }

    async fn save_entries(&self) -> anyhow::Result<()> {
        self.store
            .save_jsonl(&entries_path(&self.config.data_dir))
            .await?;
        Ok(())
    }
}

fn init_logging(plain: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if plain {
        builder.init();
    } else {
        builder.json().init();
    }
}

/// Accept a bare date or a full RFC 3339 timestamp. A bare `--to` date
/// covers the whole day.
fn parse_date(value: &str, end_of_day: bool) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{value}' (expected YYYY-MM-DD or RFC 3339)"))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .with_context(|| format!("Invalid date '{value}'"))
}

fn print_page(page: &ResultPage) {
    if page.degraded {
        println!("(semantic search unavailable, showing keyword results only)");
    }
    if !page.expanded_terms.is_empty() {
        println!("Expanded with: {}", page.expanded_terms.join(", "));
    }
    if page.results.is_empty() {
        println!("No results.");
        return;
    }
    for result in &page.results {
        let legs: Vec<String> = result
            .source_legs
            .iter()
            .map(|leg| format!("{leg:?}").to_lowercase())
            .collect();
        println!(
            "{:.4}  {}  {}  [{}]",
            result.score,
            result.key,
            result.title,
            legs.join("+")
        );
        if !result.snippet.is_empty() {
            println!("        {}", result.snippet);
        }
    }
    if page.has_more {
        println!("(more results available, use --offset)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.plain_logs);

    let config = KbaseConfig::load(&cli.config).await?;
    let rt = Runtime::open(config).await?;

    match cli.command {
        Commands::Import { file } => {
            let entries = read_entries_jsonl(&file).await?;
            let (mut inserted, mut coalesced, mut reset) = (0, 0, 0);
            for entry in entries {
                rt.store.upsert(entry.clone()).await;
                match rt.service.entry_upserted(&entry).await? {
                    EnqueueOutcome::Inserted => inserted += 1,
                    EnqueueOutcome::Coalesced => coalesced += 1,
                    EnqueueOutcome::Reset => reset += 1,
                }
            }
            rt.save_entries().await?;
            println!(
                "Imported {} entries ({inserted} newly queued, {coalesced} already queued, {reset} re-queued)",
                inserted + coalesced + reset
            );
        }
        Commands::Search {
            query,
            mode,
            collection,
            entry_type,
            tags,
            from,
            to,
            limit,
            offset,
            expand,
            json,
        } => {
            let filters = SearchFilters {
                collection,
                entry_type,
                tags,
                date_from: from.as_deref().map(|v| parse_date(v, false)).transpose()?,
                date_to: to.as_deref().map(|v| parse_date(v, true)).transpose()?,
            };
            let request = SearchRequest::from_parts(query, &mode, filters, limit, offset, expand)?;
            let page = rt.service.search(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                print_page(&page);
            }
        }
        Commands::Status { json } => {
            let status = rt.service.queue_status().await?;
            let entries = rt.store.count().await;
            let keyword_docs = rt.fulltext.count().await?;
            let vectors = rt.vectors.count().await?;
            if json {
                let body = serde_json::json!({
                    "entries": entries,
                    "keyword_documents": keyword_docs,
                    "vectors": vectors,
                    "queue": status,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("Entries:   {entries}");
                println!("Keyword:   {keyword_docs} documents");
                println!("Vectors:   {vectors}");
                println!(
                    "Queue:     {} pending, {} processing, {} done, {} failed",
                    status.pending, status.processing, status.done, status.failed
                );
                if let Some(err) = status.last_error {
                    println!("Last error: {err}");
                }
            }
        }
        Commands::Reembed {
            collection,
            entry_id,
        } => {
            let key = EntryKey::new(entry_id, collection);
            let outcome = rt.service.reembed(&key).await?;
            println!("{key}: {outcome:?}");
        }
        Commands::Delete {
            collection,
            entry_id,
        } => {
            let key = EntryKey::new(entry_id, collection);
            if !rt.store.remove(&key).await {
                anyhow::bail!("Unknown entry {key}");
            }
            rt.service.entry_deleted(&key).await?;
            rt.save_entries().await?;
            println!("Deleted {key}");
        }
        Commands::Worker => {
            let handle = rt.worker()?.spawn();
            info!("Embedding worker running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutting down embedding worker");
            let stats = handle.shutdown().await?;
            println!("{}", serde_json::to_string(&stats)?);
        }
        Commands::EmbedPending => {
            let stats = rt.worker()?.drain_once().await?;
            println!(
                "Embedded {} entries ({} retried, {} failed)",
                stats.embedded, stats.retried, stats.failed
            );
        }
        Commands::Rebuild => {
            let count = rt.service.rebuild().await?;
            println!("Re-indexed {count} entries; run `kbase embed-pending` or `kbase worker` to embed them");
        }
    }

    Ok(())
}
