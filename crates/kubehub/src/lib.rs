//! TKR kubehub: feeds the resolver cache from list+watch streams or from manifest files.
//!
//! Records are validated before they reach the cache; an invalid record is logged and evicted
//! instead of being added.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::{Stream, TryStreamExt};
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tkr_core::{version, ObjectKind, OSImage, TanzuKubernetesRelease, Version};
use tkr_resolver::{CachingResolver, Object};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ---- validation ----

pub fn validate(obj: &Object) -> Result<()> {
    match obj {
        Object::Tkr(t) => validate_tkr(t),
        Object::OsImage(i) => validate_os_image(i),
    }
}

/// A TKR needs parseable release and Kubernetes versions, and must be named after its version label.
pub fn validate_tkr(tkr: &TanzuKubernetesRelease) -> Result<()> {
    if tkr.name().is_empty() {
        bail!("TanzuKubernetesRelease missing metadata.name");
    }
    Version::parse(&tkr.spec.version).with_context(|| format!("tkr {}: spec.version", tkr.name()))?;
    let expected = version::label(&tkr.spec.version);
    if tkr.name() != expected {
        bail!("tkr {}: name does not match spec.version (want {})", tkr.name(), expected);
    }
    Version::parse(&tkr.spec.kubernetes.version)
        .with_context(|| format!("tkr {}: spec.kubernetes.version", tkr.name()))?;
    Ok(())
}

/// An OSImage needs a name and a parseable Kubernetes version.
pub fn validate_os_image(img: &OSImage) -> Result<()> {
    if img.name().is_empty() {
        bail!("OSImage missing metadata.name");
    }
    Version::parse(&img.spec.kubernetes_version)
        .with_context(|| format!("osimage {}: spec.kubernetesVersion", img.name()))?;
    Ok(())
}

fn kind_label(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Tkr => "tkr",
        ObjectKind::OsImage => "osimage",
    }
}

// ---- event handling ----

/// Validate then add; an invalid record is evicted so a stale valid copy cannot linger.
pub fn upsert(resolver: &dyn CachingResolver, obj: Object) -> bool {
    match validate(&obj) {
        Ok(()) => {
            resolver.add(vec![obj]);
            true
        }
        Err(e) => {
            warn!(kind = kind_label(obj.kind()), name = %obj.name(), error = %e, "rejecting invalid object");
            resolver.remove(vec![obj]);
            false
        }
    }
}

/// Bring the cache in line with a full listing of one kind: drop names no longer listed,
/// then upsert every listed record.
pub fn reconcile(resolver: &dyn CachingResolver, kind: ObjectKind, objects: Vec<Object>) {
    let listed: BTreeSet<&str> = objects.iter().map(Object::name).collect();
    let stale: Vec<String> = resolver.names(kind).into_iter().filter(|n| !listed.contains(n.as_str())).collect();
    for name in stale.iter() {
        resolver.remove_by_name(name, kind);
    }
    let total = objects.len();
    let mut accepted = 0usize;
    for obj in objects {
        if upsert(resolver, obj) {
            accepted += 1;
        }
    }
    info!(kind = kind_label(kind), total, accepted, removed = stale.len(), "cache reconciled");
}

pub fn apply_event<K>(resolver: &dyn CachingResolver, kind: ObjectKind, event: Event<K>)
where
    K: Into<Object>,
{
    match event {
        Event::Applied(o) => {
            metrics::counter!("tkr_ingest_events_total", 1u64, "kind" => kind_label(kind), "event" => "applied");
            let obj: Object = o.into();
            debug!(kind = kind_label(kind), name = %obj.name(), "applied");
            upsert(resolver, obj);
        }
        Event::Deleted(o) => {
            metrics::counter!("tkr_ingest_events_total", 1u64, "kind" => kind_label(kind), "event" => "deleted");
            let obj: Object = o.into();
            debug!(kind = kind_label(kind), name = %obj.name(), "deleted");
            resolver.remove(vec![obj]);
        }
        Event::Restarted(list) => {
            metrics::counter!("tkr_ingest_events_total", 1u64, "kind" => kind_label(kind), "event" => "restarted");
            debug!(kind = kind_label(kind), count = list.len(), "watch restart");
            reconcile(resolver, kind, list.into_iter().map(Into::into).collect());
        }
    }
}

/// Drive a watch event stream into the cache. Each `Restarted` (full listing) is reported on `synced`.
pub async fn pump_events<S, K, E>(
    stream: S,
    resolver: &dyn CachingResolver,
    kind: ObjectKind,
    synced: Option<&mpsc::Sender<ObjectKind>>,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Event<K>, E>>,
    E: std::error::Error + Send + Sync + 'static,
    K: Into<Object>,
{
    futures::pin_mut!(stream);
    while let Some(ev) = stream.try_next().await? {
        let restarted = matches!(ev, Event::Restarted(_));
        apply_event(resolver, kind, ev);
        if restarted {
            if let Some(tx) = synced {
                if let Err(e) = tx.try_send(kind) {
                    debug!(kind = kind_label(kind), error = %e, "sync signal dropped");
                }
            }
        }
    }
    warn!(kind = kind_label(kind), "watcher stream ended");
    Ok(())
}

/// List+watch one resource kind cluster-wide.
pub async fn watch<K>(
    api: Api<K>,
    resolver: Arc<dyn CachingResolver>,
    kind: ObjectKind,
    synced: Option<mpsc::Sender<ObjectKind>>,
) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K: Into<Object>,
{
    let stream = watcher::watcher(api, watcher::Config::default());
    info!(kind = kind_label(kind), "watcher started");
    pump_events(stream, resolver.as_ref(), kind, synced.as_ref()).await
}

/// Watch TKRs and OSImages until either stream fails.
pub async fn start_watchers(resolver: Arc<dyn CachingResolver>, synced: Option<mpsc::Sender<ObjectKind>>) -> Result<()> {
    let client = Client::try_default().await?;
    let tkrs: Api<TanzuKubernetesRelease> = Api::all(client.clone());
    let os_images: Api<OSImage> = Api::all(client);
    tokio::try_join!(
        watch(tkrs, resolver.clone(), ObjectKind::Tkr, synced.clone()),
        watch(os_images, resolver, ObjectKind::OsImage, synced),
    )?;
    Ok(())
}

// ---- manifests ----

/// Read TKR and OSImage records from YAML/JSON files (multi-document streams and `List`s allowed).
pub fn load_manifests<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Object>> {
    let mut out = Vec::new();
    for p in paths {
        let p = p.as_ref();
        let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let objs = parse_manifests(&text).with_context(|| format!("parsing {}", p.display()))?;
        debug!(path = %p.display(), count = objs.len(), "manifests loaded");
        out.extend(objs);
    }
    Ok(out)
}

pub fn parse_manifests(text: &str) -> Result<Vec<Object>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc).context("parsing YAML")?;
        collect(value, &mut out)?;
    }
    Ok(out)
}

fn collect(value: serde_yaml::Value, out: &mut Vec<Object>) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
    match kind.as_str() {
        "TanzuKubernetesRelease" => {
            let tkr: TanzuKubernetesRelease = serde_yaml::from_value(value).context("decoding TanzuKubernetesRelease")?;
            out.push(tkr.into());
        }
        "OSImage" => {
            let img: OSImage = serde_yaml::from_value(value).context("decoding OSImage")?;
            out.push(img.into());
        }
        k if k.ends_with("List") => {
            if let Some(serde_yaml::Value::Sequence(items)) = value.get("items") {
                for item in items.iter() {
                    collect(item.clone(), out)?;
                }
            }
        }
        other => debug!(kind = other, "skipping manifest"),
    }
    Ok(())
}
