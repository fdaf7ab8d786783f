use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tkr_api::{
    ClusterTopology, ControlPlaneTopology, MachineDeploymentTopology, TopologyError, ANNOTATION_RESOLVE_OS_IMAGE,
    ANNOTATION_RESOLVE_TKR,
};
use tkr_core::{Labels, ObjectKind, OsImageResult, Resolution};
use tkr_resolver::{Cached, CachingResolver, Resolver};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tkrctl", version, about = "Resolve TanzuKubernetesReleases and OSImages")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// TKR/OSImage manifest files (YAML or JSON, multi-document)
    #[arg(short = 'f', long = "file", global = true)]
    files: Vec<PathBuf>,

    /// Also list+watch TKRs and OSImages from the current kube context
    #[arg(long = "live", global = true, action = ArgAction::SetTrue)]
    live: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum KindArg { Tkr, Osimage }

impl From<KindArg> for ObjectKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Tkr => ObjectKind::Tkr,
            KindArg::Osimage => ObjectKind::OsImage,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a TKR and OSImages for a version prefix
    Resolve {
        /// Version prefix, e.g. "v1.23" or a full TKR version
        prefix: String,
        /// TKR label selector
        #[arg(long = "tkr-selector", default_value = "")]
        tkr_selector: String,
        /// Control plane OSImage label selector
        #[arg(long = "os-image-selector", default_value = "")]
        os_image_selector: String,
        /// Machine deployment part: NAME or NAME=OSIMAGE_SELECTOR (repeatable)
        #[arg(long = "md")]
        machine_deployments: Vec<String>,
    },
    /// Resolve a cluster topology file and print it with TKR data recorded
    Cluster {
        /// Cluster topology (YAML or JSON)
        topology: PathBuf,
    },
    /// Print a cached record (with derived labels and conditions)
    Get {
        #[arg(value_enum)]
        kind: KindArg,
        name: String,
    },
    /// List cached record names
    Ls {
        #[arg(value_enum)]
        kind: KindArg,
    },
}

fn init_tracing() {
    let env = std::env::var("TKR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TKR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TKR_METRICS_ADDR; expected host:port");
        }
    }
}

/// `NAME` or `NAME=SELECTOR`; the selector itself may contain `=`.
fn parse_md(arg: &str) -> (String, String) {
    match arg.split_once('=') {
        Some((name, selector)) => (name.trim().to_string(), selector.trim().to_string()),
        None => (arg.trim().to_string(), String::new()),
    }
}

fn os_image_annotation(selector: &str) -> Labels {
    Labels::from([(ANNOTATION_RESOLVE_OS_IMAGE.to_string(), selector.to_string())])
}

/// A throwaway cluster topology asking for every part given on the command line.
fn topology_for(prefix: &str, tkr_selector: &str, os_image_selector: &str, mds: &[String]) -> ClusterTopology {
    ClusterTopology {
        name: "tkrctl".into(),
        namespace: "default".into(),
        annotations: Labels::from([(ANNOTATION_RESOLVE_TKR.to_string(), tkr_selector.to_string())]),
        version: prefix.to_string(),
        control_plane: ControlPlaneTopology { annotations: os_image_annotation(os_image_selector) },
        machine_deployments: mds
            .iter()
            .map(|arg| {
                let (name, selector) = parse_md(arg);
                MachineDeploymentTopology { name, annotations: os_image_annotation(&selector), ..Default::default() }
            })
            .collect(),
        ..Default::default()
    }
}

/// Load records from files and, with `live`, from the cluster. The returned handle runs the watchers.
async fn load_resolver(files: &[PathBuf], live: bool) -> Result<(Arc<Resolver>, Option<JoinHandle<()>>)> {
    let resolver = Arc::new(Resolver::new());
    if !files.is_empty() {
        let objects = tkr_kubehub::load_manifests(files)?;
        let total = objects.len();
        let accepted = objects.into_iter().map(|o| tkr_kubehub::upsert(resolver.as_ref(), o)).filter(|ok| *ok).count();
        info!(total, accepted, "manifests loaded");
    }
    if !live {
        return Ok((resolver, None));
    }

    let (synced_tx, mut synced_rx) = mpsc::channel::<ObjectKind>(8);
    let handle = tokio::spawn({
        let resolver: Arc<dyn CachingResolver> = resolver.clone();
        async move {
            if let Err(e) = tkr_kubehub::start_watchers(resolver, Some(synced_tx)).await {
                error!(error = ?e, "watchers failed");
            }
        }
    });

    // Wait for the initial listing of both kinds (configurable)
    let wait_secs = std::env::var("TKR_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    let mut synced = HashSet::new();
    while synced.len() < 2 {
        let now = Instant::now();
        if now >= deadline {
            warn!(wait_secs, "initial listing incomplete; resolving with what is cached");
            break;
        }
        match tokio::time::timeout(deadline - now, synced_rx.recv()).await {
            Ok(Some(kind)) => {
                synced.insert(kind);
            }
            Ok(None) | Err(_) => break,
        }
    }
    Ok((resolver, Some(handle)))
}

fn names<T>(map: &std::collections::BTreeMap<String, T>) -> String {
    map.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn print_part(title: &str, part: &Option<OsImageResult>) {
    let Some(r) = part else {
        println!("{}: -", title);
        return;
    };
    println!("{}:", title);
    if r.tkr_name.is_empty() {
        println!("  no matching TKR");
        return;
    }
    let state = match r.os_images().map(|m| m.len()).unwrap_or(0) {
        1 => "resolved",
        0 => "no OSImage",
        _ => "ambiguous",
    };
    println!("  TKR         {} ({})", r.tkr_name, state);
    println!("  Kubernetes  {}", r.k8s_version);
    println!("  OSImages    {}", r.os_images().map(names).unwrap_or_default());
    for (k8s, tkrs) in r.tkrs_by_k8s_version.iter() {
        println!("  {:<24}  {}", k8s, names(tkrs));
    }
}

fn print_resolution(output: Output, topology: &ClusterTopology, res: &Resolution) -> Result<()> {
    match output {
        Output::Human => {
            print_part("controlPlane", &res.control_plane);
            for (md, part) in topology.machine_deployments.iter().zip(res.machine_deployments.iter()) {
                print_part(&md.name, part);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(res)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let (resolver, watchers) = load_resolver(&cli.files, cli.live).await?;
    let mut unresolved = false;

    match cli.command {
        Commands::Resolve { prefix, tkr_selector, os_image_selector, machine_deployments } => {
            let topology = topology_for(&prefix, &tkr_selector, &os_image_selector, &machine_deployments);
            match tkr_api::resolve_cluster(resolver.as_ref(), &topology) {
                Ok(Some(r)) => print_resolution(cli.output, &topology, &r.result)?,
                Ok(None) => println!("nothing to resolve"),
                Err(TopologyError::Unresolved(u)) => {
                    print_resolution(cli.output, &topology, &u.result)?;
                    eprintln!("{}", u);
                    unresolved = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Cluster { topology } => {
            let text = std::fs::read_to_string(&topology).with_context(|| format!("reading {}", topology.display()))?;
            let mut t: ClusterTopology = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", topology.display()))?;
            match tkr_api::resolve_cluster(resolver.as_ref(), &t) {
                Ok(Some(r)) => {
                    r.apply_to(&mut t);
                    match cli.output {
                        Output::Human => print!("{}", serde_yaml::to_string(&t)?),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&t)?),
                    }
                }
                Ok(None) => println!("nothing to resolve for {}", t.full_name()),
                Err(TopologyError::Unresolved(u)) => {
                    eprintln!("{}", u);
                    unresolved = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Get { kind, name } => match resolver.get(&name, kind.into()) {
            Some(Cached::Tkr(t)) => match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(t.as_ref())?),
                Output::Json => println!("{}", serde_json::to_string_pretty(t.as_ref())?),
            },
            Some(Cached::OsImage(i)) => match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(i.as_ref())?),
                Output::Json => println!("{}", serde_json::to_string_pretty(i.as_ref())?),
            },
            None => {
                eprintln!("{:?} '{}' not found", ObjectKind::from(kind), name);
                unresolved = true;
            }
        },
        Commands::Ls { kind } => {
            let items = resolver.names(kind.into());
            match cli.output {
                Output::Human => items.iter().for_each(|n| println!("{}", n)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
    }

    if let Some(h) = watchers {
        h.abort();
    }
    if unresolved {
        std::process::exit(1);
    }
    Ok(())
}
