use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use common::traits::{BlobStore, NamespacePolicyResolver};
use common::{BlobId, NamespaceId, ObjectKey, StaticPolicyResolver};
use futures::TryStreamExt;
use gc::{CleanupScheduler, GcConfig, LogOrphanCollector, RemoteLogSource, RootScanner};
use protocol_http::{LogServer, LogView, RemoteLogClient};
use reqwest::Url;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use storage::{FsBlobStore, LeaderFlag};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use txlog::{LogOptions, LogRegistry, ReadBatch, TransactionEvent};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let format =
            std::env::var("BLOBKEEP_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

        if format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter.clone())
                .with_target(true)
                .with_writer(std::io::stderr)
                .json()
                .flatten_event(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .compact()
                .init();
        }
    });
}

#[derive(Parser)]
#[command(name = "blobctl")]
#[command(about = "Blob reference log and garbage collection utility", long_about = None)]
struct Cli {
    /// Transaction log root (defaults to BLOBKEEP_LOG_ROOT)
    #[arg(long, global = true)]
    log_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, Args)]
struct ObjectArgs {
    namespace: String,
    #[arg(long)]
    bucket: String,
    #[arg(long)]
    key: String,
    /// Sites that already observed this event
    #[arg(long = "seen-at")]
    seen_at: Vec<String>,
}

#[derive(Subcommand)]
enum LogCommands {
    /// Record that an object now points at a set of blobs
    Append {
        #[command(flatten)]
        object: ObjectArgs,
        /// Blob id (hex), repeatable
        #[arg(long = "blob")]
        blobs: Vec<BlobId>,
        /// File whose content id is added to the blob list, repeatable
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },
    /// Record that an object was removed
    Remove {
        #[command(flatten)]
        object: ObjectArgs,
    },
    /// Print events from an offset
    Read {
        namespace: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 100)]
        count: usize,
        /// Only events this site has not seen
        #[arg(long)]
        not_seen_at: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show generation, known sites and size
    Describe { namespace: String },
    /// Delete a namespace log and start a new generation
    Drop { namespace: String },
    /// List namespaces with a log
    List,
}

#[derive(Subcommand)]
enum BlobCommands {
    /// Store a file as a blob
    Put {
        #[arg(long)]
        root: PathBuf,
        namespace: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// List the blobs of a namespace
    List {
        #[arg(long)]
        root: PathBuf,
        namespace: String,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// List namespaces served by the remote
    Namespaces,
    /// Read events from a remote log
    Read {
        namespace: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 100)]
        count: usize,
        #[arg(long)]
        not_seen_at: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Debug, Args)]
struct GcArgs {
    /// Root of the filesystem blob store
    #[arg(long)]
    blob_root: PathBuf,
    /// YAML namespace policy file
    #[arg(long)]
    policies: PathBuf,
    /// Log server of another site whose references must be honoured
    #[arg(long = "remote")]
    remotes: Vec<Url>,
    /// Print the pass report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Debug, Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:7070")]
    addr: SocketAddr,
    /// Also run periodic log-based collection over this blob store
    #[arg(long, requires = "policies")]
    blob_root: Option<PathBuf>,
    #[arg(long, requires = "blob_root")]
    policies: Option<PathBuf>,
    /// Log server of another site whose references must be honoured
    #[arg(long = "remote", requires = "blob_root")]
    remotes: Vec<Url>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and write namespace transaction logs
    Log {
        #[command(subcommand)]
        command: LogCommands,
    },
    /// Manage blobs in a filesystem blob store
    Blob {
        #[command(subcommand)]
        command: BlobCommands,
    },
    /// Compute the root set of a namespace from its log
    Roots { namespace: String },
    /// Run one log-based garbage collection pass
    Gc(GcArgs),
    /// Serve logs over HTTP and run periodic collection
    Serve(ServeArgs),
    /// Read logs from a remote log server
    Remote {
        /// Base URL of the remote server
        #[arg(long)]
        url: Url,
        #[command(subcommand)]
        command: RemoteCommands,
    },
}

fn log_options(log_root: Option<PathBuf>) -> LogOptions {
    let options = LogOptions::from_env();
    match log_root {
        Some(root) => LogOptions { root, ..options },
        None => options,
    }
}

fn open_registry(log_root: Option<PathBuf>) -> Result<Arc<LogRegistry>> {
    let options = log_options(log_root);
    let root = options.root.clone();
    let registry = LogRegistry::open(options)
        .with_context(|| format!("opening transaction logs under {}", root.display()))?;
    Ok(Arc::new(registry))
}

fn namespace(name: &str) -> Result<NamespaceId> {
    let namespace = NamespaceId::new(name);
    anyhow::ensure!(namespace.is_path_safe(), "invalid namespace name {name:?}");
    Ok(namespace)
}

fn load_policies(path: &Path) -> Result<StaticPolicyResolver> {
    StaticPolicyResolver::load(path)
        .with_context(|| format!("loading namespace policies from {}", path.display()))
}

/// Filesystem blob store with the storage pools named by `policies`.
fn fs_blob_store(root: &Path, policies: &StaticPolicyResolver) -> Result<FsBlobStore> {
    let mut store = FsBlobStore::new(root);
    for namespace in policies.namespaces() {
        if let Some(pool) = policies.policy(&namespace)?.storage_pool {
            store = store.with_pool(namespace, pool);
        }
    }
    Ok(store)
}

fn print_batch(batch: &ReadBatch, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(batch)?);
        return Ok(());
    }
    if batch.entries.is_empty() {
        println!("(no events)");
    } else {
        println!("Offset\tOp\tSites\tKey\tBlobs");
        for entry in &batch.entries {
            let (op, blobs) = match &entry.event {
                TransactionEvent::Add { blobs, .. } => (
                    "add",
                    blobs
                        .iter()
                        .map(BlobId::to_hex)
                        .collect::<Vec<_>>()
                        .join(","),
                ),
                TransactionEvent::Remove { .. } => ("remove", "-".to_string()),
            };
            println!(
                "{:>10}\t{}\t{:#x}\t{}\t{}",
                entry.offset,
                op,
                entry.event.sites().bits(),
                entry.event.key(),
                blobs
            );
        }
    }
    println!("Next offset: {}", batch.next_offset);
    if batch.skipped > 0 {
        println!("Skipped (already seen): {}", batch.skipped);
    }
    if let Some(at) = batch.mismatch_at {
        println!("Writer in progress at offset {at}; retry from next offset");
    }
    Ok(())
}

fn append_event(
    registry: &LogRegistry,
    object: ObjectArgs,
    build: impl FnOnce(ObjectKey) -> TransactionEvent,
) -> Result<()> {
    let namespace = namespace(&object.namespace)?;
    let log = registry.get_or_create(&namespace)?;
    let seen = log.site_mask(object.seen_at.iter().map(String::as_str))?;
    let key = ObjectKey::new(object.bucket, object.key);
    let event = build(key.clone()).seen_at(seen);
    let offset = log.append(&event)?;
    println!("Appended {} for {} at offset {}", op_name(&event), key, offset);
    Ok(())
}

fn op_name(event: &TransactionEvent) -> &'static str {
    if event.is_add() {
        "add"
    } else {
        "remove"
    }
}

fn run_log_command(log_root: Option<PathBuf>, command: LogCommands) -> Result<()> {
    let registry = open_registry(log_root)?;

    match command {
        LogCommands::Append {
            object,
            mut blobs,
            files,
        } => {
            for file in files {
                let data =
                    fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
                blobs.push(BlobId::of(&data));
            }
            append_event(&registry, object, |key| TransactionEvent::add(key, blobs))?;
        }
        LogCommands::Remove { object } => {
            append_event(&registry, object, TransactionEvent::remove)?;
        }
        LogCommands::Read {
            namespace: name,
            offset,
            count,
            not_seen_at,
            json,
        } => {
            let namespace = namespace(&name)?;
            let Some(log) = registry.get(&namespace)? else {
                anyhow::bail!("no transaction log for namespace {namespace}");
            };
            let batch = log.read(offset, count, not_seen_at.as_deref())?;
            print_batch(&batch, json)?;
        }
        LogCommands::Describe { namespace: name } => {
            let namespace = namespace(&name)?;
            let Some(log) = registry.get(&namespace)? else {
                anyhow::bail!("no transaction log for namespace {namespace}");
            };
            let description = log.describe()?;
            println!("Namespace: {}", description.namespace);
            println!("Generation: {}", description.generation_id);
            println!("Size: {} bytes", description.size_bytes);
            if description.known_sites.is_empty() {
                println!("Sites: (none)");
            } else {
                println!("Sites:");
                for (site, bit) in description.known_sites {
                    println!("  {site}\tbit {bit}");
                }
            }
        }
        LogCommands::Drop { namespace: name } => {
            let namespace = namespace(&name)?;
            let Some(log) = registry.get(&namespace)? else {
                anyhow::bail!("no transaction log for namespace {namespace}");
            };
            let generation = log.drop_log()?;
            println!("Dropped log for {namespace}; new generation {generation}");
        }
        LogCommands::List => {
            let namespaces = registry.list_namespaces()?;
            if namespaces.is_empty() {
                println!("(no namespaces)");
            }
            for namespace in namespaces {
                println!("{namespace}");
            }
        }
    }

    Ok(())
}

fn run_blob_command(command: BlobCommands) -> Result<()> {
    let rt = Runtime::new()?;
    match command {
        BlobCommands::Put {
            root,
            namespace: name,
            file,
        } => {
            let namespace = namespace(&name)?;
            let data = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let blob = rt.block_on(FsBlobStore::new(root).put(&namespace, &data))?;
            println!("{blob}");
        }
        BlobCommands::List {
            root,
            namespace: name,
        } => {
            let namespace = namespace(&name)?;
            let store = FsBlobStore::new(root);
            let listing: Vec<_> =
                rt.block_on(store.list_objects(&namespace).try_collect())?;
            if listing.is_empty() {
                println!("(no blobs)");
            }
            for blob in listing {
                println!("{}", blob.blob);
            }
        }
    }
    Ok(())
}

fn run_roots(log_root: Option<PathBuf>, name: &str) -> Result<()> {
    let namespace = namespace(name)?;
    let registry = open_registry(log_root)?;
    let scanner = RootScanner::new(registry, GcConfig::from_env().scan_page_size);

    let rt = Runtime::new()?;
    let state = rt.block_on(scanner.compute_roots(&namespace, &CancellationToken::new()))?;
    let mut roots: Vec<_> = state.roots.iter().collect();
    roots.sort();

    println!("Generation: {}", state.generation_id);
    println!("Scanned to offset: {}", state.resume_offset);
    println!("Roots: {}", roots.len());
    for blob in roots {
        println!("  {blob}");
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            token.cancel();
        }
    });
}

fn log_collector(
    registry: Arc<LogRegistry>,
    blob_root: &Path,
    policies: &Path,
    remotes: &[Url],
    config: GcConfig,
) -> Result<LogOrphanCollector> {
    let policies = load_policies(policies)?;
    let blobs = fs_blob_store(blob_root, &policies)?;
    let sources = remotes
        .iter()
        .map(|url| -> Result<Arc<dyn RemoteLogSource>> {
            let client = RemoteLogClient::new(url.clone())
                .with_context(|| format!("creating log client for {url}"))?;
            Ok(Arc::new(client))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LogOrphanCollector::new(
        registry,
        Arc::new(blobs),
        Arc::new(policies),
        config,
    )
    .with_remote_sources(sources))
}

fn run_gc(log_root: Option<PathBuf>, args: GcArgs) -> Result<()> {
    let registry = open_registry(log_root)?;
    let collector = log_collector(
        registry,
        &args.blob_root,
        &args.policies,
        &args.remotes,
        GcConfig::from_env(),
    )?;

    let rt = Runtime::new()?;
    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());
        collector.collect(&cancel).await
    })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Namespaces: {}", report.namespaces);
        println!("Candidates: {}", report.candidates);
        println!("Kept: {}", report.kept);
        println!("Reclaimed: {}", report.reclaimed);
        println!("Failed: {}", report.failed);
    }
    Ok(())
}

fn run_serve(log_root: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    let registry = open_registry(log_root)?;
    let config = GcConfig::from_env();

    let collector = match (&args.blob_root, &args.policies) {
        (Some(blob_root), Some(policies)) => Some(log_collector(
            registry.clone(),
            blob_root,
            policies,
            &args.remotes,
            config.clone(),
        )?),
        _ => None,
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());

        let scheduler = collector.map(|collector| {
            CleanupScheduler::new(Arc::new(LeaderFlag::new(true)), config.interval)
                .with_service(Arc::new(collector))
                .start(cancel.clone())
        });

        let server = LogServer::new(LogView::new(registry), args.addr);
        let served = server.run(cancel.clone()).await;
        cancel.cancel();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        served
    })
}

fn run_remote_command(url: Url, command: RemoteCommands) -> Result<()> {
    let client = RemoteLogClient::new(url)?;
    let rt = Runtime::new()?;

    match command {
        RemoteCommands::Namespaces => {
            let namespaces = rt.block_on(client.namespaces())?;
            if namespaces.is_empty() {
                println!("(no namespaces)");
            }
            for namespace in namespaces {
                println!("{namespace}");
            }
        }
        RemoteCommands::Read {
            namespace: name,
            offset,
            count,
            not_seen_at,
            json,
        } => {
            let namespace = NamespaceId::new(name);
            let batch = rt
                .block_on(client.read(&namespace, offset, count, not_seen_at.as_deref()))
                .with_context(|| format!("reading {namespace} from {}", client.base_url()))?;
            print_batch(&batch, json)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Log { command } => run_log_command(cli.log_root, command)?,
        Commands::Blob { command } => run_blob_command(command)?,
        Commands::Roots { namespace } => run_roots(cli.log_root, &namespace)?,
        Commands::Gc(args) => run_gc(cli.log_root, args)?,
        Commands::Serve(args) => run_serve(cli.log_root, args)?,
        Commands::Remote { url, command } => run_remote_command(url, command)?,
    }

    Ok(())
}
