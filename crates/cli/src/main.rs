use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use kube::Client;
use skein_core::{Config, ListOptions, Resource, Selector};
use skein_informer::{HandlerFuncs, InformerFactory};
use skein_kubehub::{KubeObject, KubeSource};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skeinctl", version, about = "Skein CLI: informer-backed views of Kubernetes resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Sync a cache for a GVK and list it
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Label selector, e.g. "app=web,tier!=db"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Watch a GVK through an informer and print +/~/- lines until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Label selector, e.g. "app=web"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
}

/// Default directives when `SKEIN_LOG` is unset or does not parse.
const DEFAULT_LOG: &str = "info";

fn log_filter(raw: Option<&str>) -> EnvFilter {
    raw.and_then(|r| EnvFilter::from_str(r).ok()).unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG))
}

fn init_tracing() {
    let raw = std::env::var("SKEIN_LOG").ok();
    let filter = log_filter(raw.as_deref());
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
    if let Some(raw) = raw.filter(|r| EnvFilter::from_str(r).is_err()) {
        warn!(skein_log = %raw, fallback = DEFAULT_LOG, "invalid SKEIN_LOG; using default filter");
    }
}

fn metrics_addr(raw: &str) -> Option<SocketAddr> {
    raw.trim().parse().ok()
}

fn init_metrics() {
    let Ok(raw) = std::env::var("SKEIN_METRICS_ADDR") else { return };
    let Some(addr) = metrics_addr(&raw) else {
        warn!(addr = %raw, "invalid SKEIN_METRICS_ADDR; expected host:port");
        return;
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "metrics: prometheus exporter listening"),
        Err(e) => warn!(error = %e, %addr, "metrics: failed to install exporter"),
    }
}

fn wait_secs() -> u64 {
    std::env::var("SKEIN_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8)
}

fn parse_selector(raw: Option<&str>) -> Result<(Selector, ListOptions)> {
    match raw {
        Some(s) => {
            let selector = Selector::from_str(s).with_context(|| format!("parsing label selector {:?}", s))?;
            Ok((selector, ListOptions::default().labels(s)))
        }
        None => Ok((Selector::everything(), ListOptions::default())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Discover => {
            let client = Client::try_default().await.context("building kube client")?;
            let resources = skein_kubehub::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { gvk, selector } => {
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let (selector, list) = parse_selector(selector.as_deref())?;
            let client = Client::try_default().await.context("building kube client")?;
            let source = KubeSource::connect(client, &gvk, ns).await?;
            let factory = InformerFactory::new(Config::from_env());
            let informer = factory.for_resource::<KubeObject>(&gvk, Arc::new(source)).with_list_options(list).informer()?;

            let stop = CancellationToken::new();
            factory.start(&stop)?;
            let wait = Duration::from_secs(wait_secs());
            let synced = tokio::time::timeout(wait, factory.wait_for_cache_sync(&stop)).await.unwrap_or(false);
            if !synced {
                warn!(gvk = %gvk, wait_secs = wait.as_secs(), "cache not synced in time; listing partial contents");
            }

            let lister = informer.lister();
            let items = match ns {
                Some(n) => lister.namespaced(n).list(&selector),
                None => lister.list(&selector),
            };
            match cli.output {
                Output::Human => {
                    let now = Utc::now();
                    println!("NAMESPACE   NAME                 AGE");
                    for item in &items {
                        let ns_col = item.namespace().unwrap_or("-");
                        println!("{:<11} {:<20} {}", ns_col, item.name(), render_age(created_at(item), now));
                    }
                }
                Output::Json => {
                    let objs: Vec<&KubeObject> = items.iter().map(|o| o.as_ref()).collect();
                    println!("{}", serde_json::to_string_pretty(&objs)?);
                }
            }
            stop.cancel();
            factory.shutdown().await;
        }
        Commands::Watch { gvk, selector } => {
            info!(gvk = %gvk, ns = ?ns, "watch invoked");
            let (_, list) = parse_selector(selector.as_deref())?;
            let client = Client::try_default().await.context("building kube client")?;
            let source = KubeSource::connect(client, &gvk, ns).await?;
            let factory = InformerFactory::new(Config::from_env());
            let informer = factory.for_resource::<KubeObject>(&gvk, Arc::new(source)).with_list_options(list).informer()?;

            let output = cli.output;
            informer.add_event_handler(Arc::new(
                HandlerFuncs::new()
                    .on_add(move |o: &KubeObject| print_event(output, '+', o))
                    .on_update(move |old: &KubeObject, new: &KubeObject| {
                        // resyncs and no-op updates carry the same version
                        if old.resource_version() != new.resource_version() {
                            print_event(output, '~', new);
                        }
                    })
                    .on_delete(move |o: &KubeObject| print_event(output, '-', o)),
            ));

            let stop = CancellationToken::new();
            factory.start(&stop)?;
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("interrupt received, stopping");
            stop.cancel();
            factory.shutdown().await;
        }
    }
    Ok(())
}

fn print_event(output: Output, mark: char, obj: &KubeObject) {
    let key = skein_core::ObjectKey::of(obj);
    let rv = obj.resource_version().unwrap_or("");
    match output {
        Output::Human => println!("{} {} {}", mark, key, rv),
        Output::Json => {
            let event = match mark {
                '+' => "added",
                '~' => "updated",
                _ => "deleted",
            };
            println!("{}", serde_json::json!({ "event": event, "key": key, "resourceVersion": rv }));
        }
    }
}

fn created_at(obj: &KubeObject) -> Option<DateTime<Utc>> {
    obj.0.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (now - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
