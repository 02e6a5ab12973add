use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use provider_mdm::{
    GraphStore, MdmConfig, Provider, ResolutionOrchestrator, Satellite, SqliteStore, VERSION,
};

const DEFAULT_DB_PATH: &str = "provider-mdm.db";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("init") => run_init(&args[2..]),
        Some("ingest") => run_ingest(&args[2..]),
        Some("search") => run_search(&args[2..]),
        Some("reviews") => run_reviews(&args[2..]),
        Some("history") => run_history(&args[2..]),
        Some("--version") => {
            println!("provider-mdm {}", VERSION);
            Ok(())
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("🏥 Provider MDM - entity resolution for provider records\n");
    println!("Usage:");
    println!("  provider-mdm init    [--db PATH]");
    println!("  provider-mdm ingest  RECORDS.json [--db PATH] [--config PATH] [--workers N]");
    println!("  provider-mdm search  QUERY [--db PATH]");
    println!("  provider-mdm reviews [--db PATH]");
    println!("  provider-mdm history [--db PATH]");
}

struct CliOptions {
    db_path: String,
    config_path: Option<String>,
    workers: usize,
    positional: Vec<String>,
}

fn parse_options(args: &[String]) -> Result<CliOptions> {
    let mut options = CliOptions {
        db_path: DEFAULT_DB_PATH.to_string(),
        config_path: None,
        workers: 4,
        positional: Vec::new(),
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--db" => {
                options.db_path = iter
                    .next()
                    .context("--db requires a path")?
                    .clone();
            }
            "--config" => {
                options.config_path = Some(
                    iter.next()
                        .context("--config requires a path")?
                        .clone(),
                );
            }
            "--workers" => {
                options.workers = iter
                    .next()
                    .context("--workers requires a number")?
                    .parse()
                    .context("--workers must be a number")?;
            }
            flag if flag.starts_with("--") => bail!("unknown option: {}", flag),
            positional => options.positional.push(positional.to_string()),
        }
    }
    Ok(options)
}

fn load_config(options: &CliOptions) -> Result<MdmConfig> {
    match &options.config_path {
        Some(path) => {
            MdmConfig::from_file(path).with_context(|| format!("loading config {}", path))
        }
        None => Ok(MdmConfig::default()),
    }
}

fn run_init(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    SqliteStore::open(&options.db_path)
        .with_context(|| format!("initializing database {}", options.db_path))?;
    println!("✓ Database initialized at {}", options.db_path);
    Ok(())
}

/// Ingest input: either a plain array of provider records, or an object
/// carrying satellites alongside the providers that reference them.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum IngestPayload {
    Records(Vec<Provider>),
    Full {
        #[serde(default)]
        satellites: Vec<Satellite>,
        providers: Vec<Provider>,
    },
}

fn run_ingest(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let input = options
        .positional
        .first()
        .context("ingest requires a JSON file of provider records")?;

    let content =
        fs::read_to_string(input).with_context(|| format!("reading records from {}", input))?;
    let payload: IngestPayload =
        serde_json::from_str(&content).with_context(|| format!("parsing records in {}", input))?;
    let (satellites, records) = match payload {
        IngestPayload::Records(records) => (Vec::new(), records),
        IngestPayload::Full {
            satellites,
            providers,
        } => (satellites, providers),
    };
    println!(
        "📂 Loaded {} records and {} satellites from {}",
        records.len(),
        satellites.len(),
        input
    );

    let config = load_config(&options)?;
    let store = Arc::new(SqliteStore::open(&options.db_path)?);
    for satellite in &satellites {
        store.upsert_satellite(satellite)?;
    }

    let orchestrator = ResolutionOrchestrator::new(config, store.clone())?;
    let report = orchestrator.resolve_batch(records, options.workers);
    println!("✓ {}", report.summary());
    for failure in &report.failures {
        eprintln!("  ✗ record {}: {}", failure.record_id, failure.error);
    }
    println!(
        "📜 Audit trail: {} merge(s) recorded",
        store.merge_history()?.len()
    );

    if report.failed > 0 {
        bail!("{} record(s) failed", report.failed);
    }
    Ok(())
}

fn run_search(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let query = options
        .positional
        .first()
        .context("search requires a query string")?;
    let store = SqliteStore::open(&options.db_path)?;

    let matches = store.search_providers(query, 50)?;
    if matches.is_empty() {
        println!("No providers match {:?}.", query);
        return Ok(());
    }
    println!("🔎 {} provider(s) match {:?}:", matches.len(), query);
    for p in matches {
        println!(
            "  {} {} (npi: {}, email: {})",
            p.record_id,
            p.display_name(),
            p.npi.as_deref().unwrap_or("-"),
            p.email.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn run_reviews(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let store = SqliteStore::open(&options.db_path)?;

    let reviews = store.pending_reviews()?;
    if reviews.is_empty() {
        println!("No matches pending review.");
        return Ok(());
    }
    println!("🔎 {} match(es) pending review:", reviews.len());
    for review in reviews {
        println!(
            "  {} ↔ {} (score {:.3}, flagged {})",
            review.record_id, review.candidate_id, review.score, review.created_at
        );
    }
    Ok(())
}

fn run_history(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let store = SqliteStore::open(&options.db_path)?;

    let history = store.merge_history()?;
    if history.is_empty() {
        println!("No merges recorded.");
        return Ok(());
    }
    println!("📜 {} merge(s) recorded:", history.len());
    for entry in history {
        println!(
            "  {} → {} (score {:.3}, {} conflict(s), at {})",
            entry.source_id,
            entry.target_id,
            entry.score,
            entry.conflicts.len(),
            entry.merged_at
        );
    }
    Ok(())
}
