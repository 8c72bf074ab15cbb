//! CLI entry point for ragshard.
//!
//! Indexes JSONL documents into cached shards, searches saved indexes,
//! buckets texts semantically and maintains the on-disk caches.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use ragshard::cache::{LocalFileStore, StoreOptions, expire_dir, namespace_for};
use ragshard::display::{
    THEME, build_report_table, buckets_table, cache_stats_table, progress_enabled,
    search_hits_table, with_spinner,
};
use ragshard::index::AlwaysConfirm;
use ragshard::tokens::HeuristicTokenCounter;
use ragshard::{
    Document, ErrorContext, IndexPipeline, IndexShard, RagError, SearchGuard, SemanticBucketer,
    Settings, create_provider,
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Cached embeddings and sharded similarity indexes
#[derive(Parser)]
#[command(
    name = "ragshard",
    version = env!("CARGO_PKG_VERSION"),
    about = "Cached embeddings and sharded similarity indexes",
    long_about = "Embed documents once, keep one shard per document on disk and merge them into a searchable index.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show detailed logging
    #[arg(long, global = true)]
    info: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize project
    #[command(about = "Set up .ragshard directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings from .ragshard/settings.toml")]
    Config,

    /// Build an index from a JSONL file of documents
    #[command(
        about = "Embed documents and build a searchable index",
        after_help = "Each line is {\"page_content\": \"...\", \"metadata\": {...}}.\nMissing content hashes are computed from the page content.\n\nExamples:\n  ragshard index docs.jsonl --save index\n  ragshard index docs.jsonl --yes --threads 4"
    )]
    Index {
        /// JSONL file with one document per line
        input: PathBuf,

        /// Save the merged index to this directory
        #[arg(short, long)]
        save: Option<PathBuf>,

        /// Accept the embedding cost without asking
        #[arg(short, long)]
        yes: bool,

        /// Number of embedding threads (overrides config)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Hide progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Search a saved index
    #[command(after_help = "Examples:\n  ragshard search index \"how are shards merged\" -k 5")]
    Search {
        /// Directory of a saved index
        index: PathBuf,

        /// Natural language query
        query: String,

        /// Number of results
        #[arg(short, long, default_value = "4")]
        k: usize,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Group texts into semantically related buckets
    #[command(
        about = "Bucket texts by meaning within a token budget",
        after_help = "Reads one text per line.\n\nExamples:\n  ragshard bucket answers.txt\n  ragshard bucket answers.txt --json"
    )]
    Bucket {
        /// File with one text per line
        input: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Inspect or clean the caches
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show the size of the cache for the configured model
    Stats,

    /// Delete entries not accessed for a number of days
    Expire {
        /// Age threshold in days (0 removes everything)
        #[arg(short, long)]
        days: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", THEME.error_with_icon(&format!("Configuration error: {e:#}")));
            std::process::exit(1);
        }
    };

    let level = if cli.info || settings.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Warning: logging disabled: {e}");
    }

    if let Err(e) = run(cli.command, settings) {
        report_error(&e);
        std::process::exit(1);
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => Settings::load_from(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display())),
        None => Ok(Settings::load().unwrap_or_else(|e| {
            eprintln!("{}", THEME.warning_with_icon(&format!("{e}, using defaults")));
            Settings::default()
        })),
    }
}

fn report_error(error: &anyhow::Error) {
    eprintln!("{}", THEME.error_with_icon(&format!("{error:#}")));
    if let Some(rag) = error.downcast_ref::<RagError>() {
        eprintln!("  code: {}", rag.status_code());
        for suggestion in rag.recovery_suggestions() {
            eprintln!("  hint: {suggestion}");
        }
    }
}

fn run(command: Commands, mut settings: Settings) -> anyhow::Result<()> {
    match command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(force).map_err(|e| {
                anyhow::anyhow!("{e}\nUse --force to overwrite an existing configuration")
            })?;
            println!("{}", THEME.success_with_icon(&format!("Created {}", path.display())));
            println!("Edit this file to customize your settings.");
        }

        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
        }

        Commands::Index {
            input,
            save,
            yes,
            threads,
            no_progress,
        } => {
            if let Some(threads) = threads {
                settings.index.embed_threads = threads;
            }
            if save.is_some() {
                settings.index.save_embeds_as = save;
            }
            let docs = read_documents(&input)?;

            let mut pipeline = IndexPipeline::from_settings(&settings)
                .map_err(RagError::from)?
                .with_progress(progress_enabled(!no_progress));
            if yes {
                pipeline = pipeline.with_confirmation(Box::new(AlwaysConfirm));
            }

            let (guard, report) = pipeline.build(docs).map_err(RagError::from)?;
            println!("{}", build_report_table(&report));
            println!(
                "{}",
                THEME.success_with_icon(&format!("Indexed {} document(s)", guard.index().len()))
            );
            if let Some(path) = &settings.index.save_embeds_as {
                println!("Saved to {}", THEME.apply(&THEME.path, path.display()));
            }
        }

        Commands::Search {
            index,
            query,
            k,
            json,
        } => {
            let shard = IndexShard::load(&index).map_err(RagError::from)?;
            let provider =
                create_provider(&settings.embedding, &settings.models_dir(), !json)
                    .map_err(RagError::from)?;
            let guard = SearchGuard::new(shard).with_max_retries(settings.index.search_retries);
            let hits = guard
                .similarity_search(provider.as_ref(), &query, k)
                .map_err(RagError::from)?;

            if json {
                let rows: Vec<_> = hits
                    .iter()
                    .map(|hit| {
                        serde_json::json!({
                            "id": hit.id.as_str(),
                            "score": hit.score,
                            "distance": hit.distance,
                            "document": hit.document,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if hits.is_empty() {
                println!("{}", THEME.warning_with_icon("No results"));
            } else {
                println!("{}", search_hits_table(&hits));
                println!("{} hit(s), best score {}", hits.len(), THEME.score(hits[0].score));
            }
        }

        Commands::Bucket { input, json } => {
            let texts = read_lines(&input)?;
            let provider = create_provider(&settings.embedding, &settings.models_dir(), !json)
                .map_err(RagError::from)?;
            let bucketer = SemanticBucketer::new(provider, settings.bucketing.clone());
            let buckets = with_spinner("Bucketing texts...", !json, || bucketer.bucket(&texts))
                .map_err(RagError::from)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&buckets)?);
            } else {
                println!("{}", buckets_table(&buckets, &HeuristicTokenCounter));
            }
        }

        Commands::Cache { action } => {
            let embedding = &settings.embedding;
            let namespace = namespace_for(&embedding.model, embedding.instruct, embedding.private);
            let embeddings_dir = settings.embeddings_dir(&namespace);
            let shards_dir = settings.shards_dir(&namespace);

            match action {
                CacheAction::Stats => {
                    let store = LocalFileStore::open(
                        &embeddings_dir,
                        StoreOptions {
                            compress: settings.cache.compress,
                            update_atime: false,
                        },
                    )
                    .map_err(RagError::from)?;
                    let stats = store.stats().map_err(RagError::from)?;
                    println!(
                        "{}",
                        cache_stats_table(&embeddings_dir.display().to_string(), stats, None)
                    );
                    println!(
                        "Shards: {} in {}",
                        count_shards(&shards_dir),
                        THEME.apply(&THEME.path, shards_dir.display())
                    );
                }
                CacheAction::Expire { days } => {
                    let mut report = expire_dir(&shards_dir, days).map_err(RagError::from)?;
                    report.absorb(expire_dir(&embeddings_dir, days).map_err(RagError::from)?);
                    println!("{}", THEME.success_with_icon(&report.display()));
                }
            }
        }
    }

    Ok(())
}

/// Reads one JSON document per non-empty line.
fn read_documents(path: &Path) -> anyhow::Result<Vec<Document>> {
    let file = std::fs::File::open(path).map_err(|source| RagError::Input {
        path: path.to_path_buf(),
        source,
    })?;

    let mut docs = Vec::new();
    for (number, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| RagError::Input {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let mut doc: Document = serde_json::from_str(&line)
            .context(&format!("{}:{}: invalid document", path.display(), number + 1))?;
        doc.ensure_content_hash();
        docs.push(doc);
    }
    Ok(docs)
}

fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|source| RagError::Input {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn count_shards(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().is_dir())
                .count()
        })
        .unwrap_or(0)
}
