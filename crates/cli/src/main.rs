use std::ops::ControlFlow;
use std::str::FromStr;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

use kreflect_api::{Informers, Snapshot};
use kreflect_core::{EventType, Resource, Selector, WatchEvent};
use kreflect_kubehub::{ApiClient, CollectionClient, EventDecoder, Registry, WatchOptions};
use kreflect_store::ReflectorConfig;

#[derive(Parser, Debug)]
#[command(name = "kreflectctl", version, about = "kreflect CLI: list, watch and mirror cluster collections")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "app=web,tier in (a,b)"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Field selector, e.g. "status.phase=Running"
    #[arg(long = "field-selector", global = true)]
    field_selector: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// List objects for a given group/version/kind key
    Ls {
        /// GVK key or alias, e.g. "v1/ConfigMap", "apps/v1/Deployment", "pods"
        gvk: String,
    },
    /// Fetch one object
    Get {
        gvk: String,
        name: String,
    },
    /// Stream raw watch events from the current resource version until Ctrl-C
    Watch {
        gvk: String,
    },
    /// Keep a live mirror of a collection and print it on every change
    Mirror {
        gvk: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KREFLECT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KREFLECT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KREFLECT_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    fn scope(&self) -> Selector {
        let mut s = Selector::all();
        if let Some(ns) = &self.namespace {
            s = s.namespace(ns.clone());
        }
        if let Some(l) = &self.selector {
            s = s.labels(l.clone());
        }
        if let Some(f) = &self.field_selector {
            s = s.fields(f.clone());
        }
        s
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let t0 = Instant::now();

    match &cli.command {
        Commands::Discover => {
            let inf = Informers::connect().await?;
            let kinds = inf.discover().await?;
            match cli.output {
                Output::Human => {
                    for k in kinds {
                        let scope = if k.namespaced { "namespaced" } else { "cluster" };
                        let gv = if k.group.is_empty() { k.version.clone() } else { format!("{}/{}", k.group, k.version) };
                        println!("{} • {} ({}) • {}", gv, k.kind, k.plural, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespace, "ls invoked");
            let inf = Informers::connect().await?;
            let list = inf.list(gvk, cli.scope()).await?;
            match cli.output {
                Output::Human => print_table(&list.items),
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
            info!(items = list.len(), rv = %list.resource_version, took_ms = %t0.elapsed().as_millis(), "ls done");
        }
        Commands::Get { gvk, name } => {
            let inf = Informers::connect().await?;
            let obj = inf.get(gvk, cli.namespace.as_deref(), name).await?;
            match cli.output {
                Output::Human => print_table(std::slice::from_ref(&obj)),
                Output::Json => println!("{}", serde_json::to_string_pretty(obj.as_json())?),
            }
        }
        Commands::Watch { gvk } => watch(&cli, gvk).await?,
        Commands::Mirror { gvk } => mirror(&cli, gvk).await?,
    }
    Ok(())
}

/// Raw watch: list once for a starting version, then print every event as it arrives.
async fn watch(cli: &Cli, gvk: &str) -> Result<()> {
    let t0 = Instant::now();
    let cfg = ReflectorConfig::from_env();
    let api = ApiClient::try_default().await?;
    let registry = Registry::new(api.kube_client());
    let desc = registry.resolve(gvk).await?;
    let mut scope = cli.scope();
    if !desc.namespaced {
        scope.namespace = None;
    }
    let coll = CollectionClient::new(api, desc, scope);
    let start = coll.list(cfg.page_size).await?;
    info!(gvk = %gvk, rv = %start.resource_version, items = start.len(), "watch: starting after listing");

    let opts = WatchOptions { allow_bookmarks: cfg.allow_bookmarks, timeout_secs: cfg.watch_timeout_secs };
    let stream = coll
        .watch_stream(&start.resource_version, opts, EventDecoder::with_limit(cfg.max_line_bytes))
        .await?
        .with_idle_timeout(cfg.watch_idle_timeout);
    if let Some(cancel) = stream.canceller() {
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }
    let output = cli.output;
    let mut seen = 0u64;
    stream
        .for_each_event(|ev| -> Result<ControlFlow<()>> {
            seen += 1;
            print_event(output, &ev)?;
            Ok(ControlFlow::Continue(()))
        })
        .await?;
    info!(events = seen, took_ms = %t0.elapsed().as_millis(), "watch: ended");
    Ok(())
}

/// Live mirror: run a reflector and reprint the snapshot whenever the store changes.
async fn mirror(cli: &Cli, gvk: &str) -> Result<()> {
    let inf = Informers::connect().await?;
    let handle = inf.start_reflector(gvk, cli.scope()).await?;
    let _errors = inf.on_error(&handle, |kind, message| eprintln!("! {:?}: {}", kind, message));
    let store = handle.store();
    let mut epoch = store.subscribe();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("mirror: interrupted");
                break;
            }
            changed = epoch.changed() => {
                if changed.is_err() {
                    break;
                }
                print_snapshot(cli.output, &inf.current_snapshot(&handle))?;
            }
        }
    }
    inf.stop_reflector(handle).await;
    Ok(())
}

fn print_event(output: Output, ev: &WatchEvent) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string(ev)?),
        Output::Human => match ev.event_type {
            EventType::Added => println!("+ {} @{}", display_key(&ev.object), ev.resource_version),
            EventType::Modified => println!("~ {} @{}", display_key(&ev.object), ev.resource_version),
            EventType::Deleted => println!("- {} @{}", display_key(&ev.object), ev.resource_version),
            EventType::Bookmark => println!("# bookmark @{}", ev.resource_version),
            EventType::Error => println!("! {}", ev.error_message()),
        },
    }
    Ok(())
}

fn print_snapshot(output: Output, snap: &Snapshot) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string(snap)?),
        Output::Human => {
            println!("@{} ({} objects)", snap.resource_version, snap.items.len());
            print_table(&snap.items);
        }
    }
    Ok(())
}

fn print_table(items: &[Resource]) {
    println!("NAMESPACE   NAME                 AGE");
    for item in items {
        let ns_col = item.namespace().unwrap_or("-");
        let name = item.name().unwrap_or("-");
        println!("{:<11} {:<20} {}", ns_col, name, render_age(item));
    }
}

fn render_age(item: &Resource) -> String {
    let Some(created) = item.creation_timestamp() else { return "-".to_string() };
    let mut secs = (chrono::Utc::now().timestamp() - created.timestamp()).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn display_key(r: &Resource) -> String {
    let name = r.name().unwrap_or("");
    match r.namespace() {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}
