use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use docbridge::{AdapterConfig, ClassHierarchy, DocumentAdapter, MemoryStore};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "docbridge-scan")]
#[command(about = "Print change records for the documents of a JSON dump", long_about = None)]
struct Args {
    /// Dump file: an object mapping each domain to an array of documents
    #[arg(short, long)]
    dump: String,

    /// Domain to scan (if not specified, scans every domain in the dump)
    #[arg(short = 'D', long)]
    domain: Option<String>,

    /// Discard stored digests and rehash everything
    #[arg(long)]
    force_recheck: bool,

    /// TOML configuration file (defaults to DOCBRIDGE_* environment variables)
    #[arg(short, long)]
    config: Option<String>,

    /// Output file (if not specified, writes to stdout)
    #[arg(short, long)]
    output: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docbridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => AdapterConfig::from_file(path)?,
        None => AdapterConfig::from_env()?,
    };

    let text = std::fs::read_to_string(&args.dump)
        .with_context(|| format!("reading dump {}", args.dump))?;
    let dump: BTreeMap<String, Vec<Value>> =
        serde_json::from_str(&text).context("dump must map domains to document arrays")?;

    let store = Arc::new(MemoryStore::new());
    for (domain, docs) in dump {
        tracing::info!("Loaded {} documents into '{}'", docs.len(), domain);
        store.insert_documents(&domain, docs);
    }

    let domains = match &args.domain {
        Some(domain) => vec![domain.clone()],
        None => store.domain_names(),
    };

    // change records need no class definitions
    let hierarchy = Arc::new(ClassHierarchy::builder().build()?);
    let adapter = DocumentAdapter::new(store.clone(), hierarchy, None, config);

    let mut output: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout()),
    };

    let mut total = 0usize;
    let mut bytes = 0u64;
    for domain in &domains {
        let mut records = adapter
            .stream_change_records(domain, args.force_recheck)
            .await?;
        let mut count = 0usize;
        while let Some(record) = records.next().await? {
            writeln!(output, "{}", serde_json::to_string(&record)?)?;
            bytes += record.size;
            count += 1;
        }
        records.close().await?;
        tracing::info!("Scanned {} documents in '{}'", count, domain);
        total += count;
    }
    output.flush()?;

    let hashed: usize = domains
        .iter()
        .map(|d| {
            store
                .documents(d)
                .iter()
                .filter(|doc| doc.get("%hash%").and_then(Value::as_str).is_some())
                .count()
        })
        .sum();
    eprintln!(
        "✓ {} change records across {} domains ({} bytes, {} digests stored)",
        total,
        domains.len(),
        bytes,
        hashed
    );

    Ok(())
}
