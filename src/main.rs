use bundle_processor::application::{BundleProcessor, RoutingTable};
use bundle_processor::config::ProcessorConfig;
use bundle_processor::domain::outcome::{Issue, OperationOutcome, ResponseBundle, Severity};
use bundle_processor::domain::ports::{AdapterRef, Identity};
use bundle_processor::error::BundleError;
use bundle_processor::infrastructure::in_memory::InMemoryBackend;
use bundle_processor::interfaces::json::bundle_reader::BundleReader;
use bundle_processor::interfaces::json::response_writer::ResponseWriter;
use bundle_processor::telemetry::setup_tracing;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Transaction Bundle JSON file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON file with processor settings
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    max_concurrency: Option<usize>,

    #[arg(long)]
    adapter_timeout_ms: Option<u64>,

    #[arg(long)]
    bundle_timeout_ms: Option<u64>,

    #[arg(long)]
    retry_backoff_ms: Option<u64>,

    /// Caller identity forwarded to every backend call
    #[arg(long)]
    identity: Option<String>,

    /// Require a Bundle identifier with this system
    #[arg(long)]
    require_identifier_system: Option<String>,
}

impl Cli {
    fn processor_config(&self) -> Result<ProcessorConfig> {
        let mut config = match &self.config {
            Some(path) => ProcessorConfig::from_file(path)?,
            None => ProcessorConfig::default(),
        };
        if let Some(n) = self.max_concurrency {
            config.max_concurrency = n;
        }
        if let Some(ms) = self.adapter_timeout_ms {
            config.adapter_timeout_ms = ms;
        }
        if let Some(ms) = self.bundle_timeout_ms {
            config.bundle_timeout_ms = Some(ms);
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff_ms = ms;
        }
        if let Some(system) = &self.require_identifier_system {
            config.required_identifier_system = Some(system.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    let config = cli.processor_config()?;
    let [graph, catalog, search] = open_backends(cli.db_path.as_deref())?;
    let processor = BundleProcessor::new(config, RoutingTable::standard(graph, catalog, search))?;

    let file = File::open(&cli.input).into_diagnostic()?;
    let outcome = match BundleReader::new(file)
        .with_limit(processor.config().max_bundle_bytes)
        .read()
    {
        Ok(raw) => processor.process(&raw, cli.identity.map(Identity::new)).await,
        Err(err) => Err(err),
    };

    let stdout = io::stdout();
    let mut writer = ResponseWriter::new(stdout.lock());
    match outcome {
        Ok(response) => {
            writer.write_response(&response)?;
            Ok(())
        }
        Err(err) => {
            writer.write_response(&rejection(&err))?;
            Err(err.into())
        }
    }
}

/// Response Bundle carrying a Bundle-level failure as a fatal issue.
fn rejection(err: &BundleError) -> ResponseBundle {
    let code = if err.is_client_error() {
        "invalid"
    } else {
        "exception"
    };
    ResponseBundle::rejected(
        uuid::Uuid::new_v4().to_string(),
        OperationOutcome::single(Issue::new(Severity::Fatal, code, err.to_string())),
    )
}

/// Graph store, metadata catalog and search index, in that order.
#[cfg(feature = "storage-rocksdb")]
fn open_backends(db_path: Option<&Path>) -> Result<[AdapterRef; 3]> {
    use bundle_processor::infrastructure::rocksdb::RocksDbBackend;

    let Some(root) = db_path else {
        return Ok(in_memory_backends());
    };
    std::fs::create_dir_all(root).into_diagnostic()?;
    let open = |name: &str| -> Result<AdapterRef> {
        Ok(Arc::new(RocksDbBackend::open(name, root.join(name))?))
    };
    Ok([open("graph")?, open("catalog")?, open("search")?])
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_backends(db_path: Option<&Path>) -> Result<[AdapterRef; 3]> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_backends())
}

fn in_memory_backends() -> [AdapterRef; 3] {
    [
        Arc::new(InMemoryBackend::new("graph")),
        Arc::new(InMemoryBackend::new("catalog")),
        Arc::new(InMemoryBackend::new("search")),
    ]
}
