//! TKR resolver: Normalize -> Filter -> Intersect -> Rank over the [`Cache`].
//!
//! Filter is the only stage that touches the cache (one read lock per call). Intersect and Rank run
//! on the `Arc` snapshots it returns, so a concurrent `add`/`remove` never changes a result in flight.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tkr_core::{
    version, ObjectKind, OsImageQuery, OsImageResult, Query, Requirement, Resolution, Selector, TanzuKubernetesRelease,
    Tkrs, UNWANTED_LABELS,
};
use tracing::debug;

pub use tkr_store::{Cache, Cached, Details, Indices, Object, OsImageDetails};

/// The in-process contract shared by ingestion (writes) and admission (reads).
pub trait CachingResolver: Send + Sync {
    fn add(&self, objects: Vec<Object>);
    fn remove(&self, objects: Vec<Object>);
    fn remove_by_name(&self, name: &str, kind: ObjectKind);
    fn get(&self, name: &str, kind: ObjectKind) -> Option<Cached>;
    fn names(&self, kind: ObjectKind) -> Vec<String>;
    fn resolve(&self, query: &Query) -> Resolution;
}

/// Cache plus the resolution pipeline. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct Resolver {
    cache: Cache,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn resolve(&self, query: &Query) -> Resolution {
        let started = Instant::now();
        let normalized = normalize(query);
        let details = intersect(self.cache.filter(&normalized));
        let resolution = Resolution {
            control_plane: details.control_plane.map(rank),
            machine_deployments: details.machine_deployments.into_iter().map(|p| p.map(rank)).collect(),
        };
        histogram!("tkr_resolve_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(query = %query, result = %resolution, "resolve");
        resolution
    }
}

impl CachingResolver for Resolver {
    fn add(&self, objects: Vec<Object>) {
        self.cache.add(objects)
    }

    fn remove(&self, objects: Vec<Object>) {
        self.cache.remove(objects)
    }

    fn remove_by_name(&self, name: &str, kind: ObjectKind) {
        self.cache.remove_by_name(name, kind)
    }

    fn get(&self, name: &str, kind: ObjectKind) -> Option<Cached> {
        self.cache.get(name, kind)
    }

    fn names(&self, kind: ObjectKind) -> Vec<String> {
        self.cache.names(kind)
    }

    fn resolve(&self, query: &Query) -> Resolution {
        Resolver::resolve(self, query)
    }
}

// ---- Normalize ----

/// Add the implicit requirements to every present part. Absent parts stay absent.
pub fn normalize(query: &Query) -> Query {
    Query {
        control_plane: query.control_plane.as_ref().map(normalize_part),
        machine_deployments: query.machine_deployments.iter().map(|p| p.as_ref().map(normalize_part)).collect(),
    }
}

/// TKRs must carry the version prefix label; neither TKRs nor OSImages may carry an unwanted label.
/// An empty prefix still adds its requirement and so matches no TKR.
pub fn normalize_part(part: &OsImageQuery) -> OsImageQuery {
    let prefix = version::label(&part.k8s_version_prefix);
    let tkr_selector = with(&exclude_unwanted(&part.tkr_selector), Requirement::exists(&prefix));
    OsImageQuery {
        k8s_version_prefix: part.k8s_version_prefix.clone(),
        tkr_selector,
        os_image_selector: exclude_unwanted(&part.os_image_selector),
    }
}

fn exclude_unwanted(selector: &Selector) -> Selector {
    UNWANTED_LABELS.iter().fold(selector.clone(), |s, label| with(&s, Requirement::does_not_exist(label)))
}

// Normalizing twice must not grow the selector.
fn with(selector: &Selector, requirement: Requirement) -> Selector {
    if selector.requirements().contains(&requirement) {
        selector.clone()
    } else {
        selector.add(requirement)
    }
}

// ---- Intersect ----

/// Keep only the TKRs that survived Filter in every present part. Each part keeps its own OSImage sets.
pub fn intersect(mut details: Details) -> Details {
    let mut common: Option<BTreeSet<String>> = None;
    let present = details.control_plane.iter().chain(details.machine_deployments.iter().flatten());
    for part in present {
        let names: BTreeSet<String> = part.tkrs.keys().cloned().collect();
        common = Some(match common {
            None => names,
            Some(acc) => acc.intersection(&names).cloned().collect(),
        });
    }
    let Some(common) = common else {
        return details;
    };
    let parts = details.control_plane.iter_mut().chain(details.machine_deployments.iter_mut().flatten());
    for part in parts {
        part.tkrs.retain(|name, _| common.contains(name));
        part.os_images_by_tkr.retain(|name, _| common.contains(name));
    }
    details
}

// ---- Rank ----

/// Pick the highest version TKR as canonical and group all survivors by the Kubernetes version they ship.
///
/// Survivors are visited in name order and only a strictly greater version replaces the current pick,
/// so among equal versions the first name wins.
pub fn rank(part: OsImageDetails) -> OsImageResult {
    let canonical = highest(&part.tkrs).map(|t| (t.spec.kubernetes.version.clone(), t.name().to_string()));
    let (k8s_version, tkr_name) = canonical.unwrap_or_default();

    let mut tkrs_by_k8s_version: BTreeMap<String, Tkrs> = BTreeMap::new();
    for (name, tkr) in part.tkrs {
        tkrs_by_k8s_version.entry(tkr.spec.kubernetes.version.clone()).or_default().insert(name, tkr);
    }
    OsImageResult { k8s_version, tkr_name, tkrs_by_k8s_version, os_images_by_tkr: part.os_images_by_tkr }
}

fn highest(tkrs: &Tkrs) -> Option<&Arc<TanzuKubernetesRelease>> {
    let mut best: Option<&Arc<TanzuKubernetesRelease>> = None;
    for tkr in tkrs.values() {
        let replace = match best {
            None => true,
            Some(b) => version::compare(&b.spec.version, &tkr.spec.version) == Ordering::Less,
        };
        if replace {
            best = Some(tkr);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::LocalObjectReference;
    use tkr_core::{
        Condition, KubernetesSpec, MachineImageInfo, OSImage, OSImageSpec, OSInfo, TanzuKubernetesReleaseSpec,
        CONDITION_COMPATIBLE, LABEL_DEACTIVATED,
    };

    fn tkr(v: &str, k8s: &str, images: &[&str]) -> TanzuKubernetesRelease {
        TanzuKubernetesRelease::for_spec(TanzuKubernetesReleaseSpec {
            version: v.to_string(),
            kubernetes: KubernetesSpec { version: k8s.to_string(), ..Default::default() },
            os_images: images.iter().map(|n| LocalObjectReference { name: Some(n.to_string()) }).collect(),
            ..Default::default()
        })
    }

    fn os_image(name: &str, k8s: &str, os: &str, arch: &str) -> OSImage {
        OSImage::new(
            name,
            OSImageSpec {
                kubernetes_version: k8s.to_string(),
                os: OSInfo { type_: "linux".into(), name: os.into(), version: "20.04".into(), arch: arch.into() },
                image: MachineImageInfo { type_: "ova".into(), ref_: Default::default() },
            },
        )
    }

    fn part(prefix: &str, tkr_sel: &str, img_sel: &str) -> OsImageQuery {
        OsImageQuery {
            k8s_version_prefix: prefix.to_string(),
            tkr_selector: Selector::parse(tkr_sel).unwrap(),
            os_image_selector: Selector::parse(img_sel).unwrap(),
        }
    }

    fn cp_only(p: OsImageQuery) -> Query {
        Query { control_plane: Some(p), machine_deployments: vec![] }
    }

    fn objects<T: Into<Object>>(items: Vec<T>) -> Vec<Object> {
        items.into_iter().map(Into::into).collect()
    }

    fn k8s_versions(r: &OsImageResult) -> BTreeSet<String> {
        r.tkrs_by_k8s_version.keys().cloned().collect()
    }

    fn tkr_names(r: &OsImageResult) -> BTreeSet<String> {
        r.tkrs_by_k8s_version.values().flat_map(|t| t.keys().cloned()).collect()
    }

    fn populated() -> Resolver {
        let r = Resolver::new();
        r.add(objects(vec![
            tkr("v1.21.3+vmware.1-tkg.1", "v1.21.3+vmware.1", &["ubuntu-121-amd64", "photon-121-amd64"]),
            tkr("v1.21.3+vmware.1-tkg.2", "v1.21.3+vmware.1", &["ubuntu-121-amd64"]),
            tkr("v1.21.8+vmware.1-tkg.1", "v1.21.8+vmware.1", &["ubuntu-1218-amd64"]),
            tkr("v1.22.5+vmware.1-tkg.1", "v1.22.5+vmware.1", &["ubuntu-122-amd64", "ubuntu-122-arm64"]),
        ]));
        r.add(objects(vec![
            os_image("ubuntu-121-amd64", "v1.21.3+vmware.1", "ubuntu", "amd64"),
            os_image("photon-121-amd64", "v1.21.3+vmware.1", "photon", "amd64"),
            os_image("ubuntu-1218-amd64", "v1.21.8+vmware.1", "ubuntu", "amd64"),
            os_image("ubuntu-122-amd64", "v1.22.5+vmware.1", "ubuntu", "amd64"),
            os_image("ubuntu-122-arm64", "v1.22.5+vmware.1", "ubuntu", "arm64"),
        ]));
        r
    }

    #[test]
    fn higher_version_becomes_canonical() {
        let r = Resolver::new();
        r.add(objects(vec![tkr("v1.23.5-build1", "1.23.5", &["ubuntu-2004-amd64"])]));
        r.add(objects(vec![os_image("ubuntu-2004-amd64", "1.23.5", "ubuntu", "amd64")]));

        let q = cp_only(part("1.23", "", ""));
        let res = r.resolve(&q);
        let cp = res.control_plane.as_ref().unwrap();
        assert_eq!(cp.k8s_version, "1.23.5");
        assert_eq!(cp.tkr_name, "v1.23.5-build1");
        assert_eq!(cp.os_image().map(|i| i.name().to_string()), Some("ubuntu-2004-amd64".to_string()));
        assert!(!cp.is_unresolved());

        r.add(objects(vec![tkr("v1.23.9-build1", "1.23.5", &["ubuntu-2004-amd64-b"])]));
        r.add(objects(vec![os_image("ubuntu-2004-amd64-b", "1.23.5", "ubuntu", "amd64")]));
        let res = r.resolve(&q);
        let cp = res.control_plane.as_ref().unwrap();
        assert_eq!(cp.tkr_name, "v1.23.9-build1");
        assert_eq!(cp.k8s_version, "1.23.5");
        assert!(cp.tkrs_by_k8s_version["1.23.5"].contains_key("v1.23.5-build1"));
        assert_eq!(cp.os_image().map(|i| i.name().to_string()), Some("ubuntu-2004-amd64-b".to_string()));
    }

    #[test]
    fn resolve_is_idempotent() {
        let r = populated();
        let q = Query {
            control_plane: Some(part("v1.21", "", "os-name=ubuntu")),
            machine_deployments: vec![Some(part("v1.21", "", "")), None],
        };
        assert_eq!(r.resolve(&q), r.resolve(&q));
    }

    #[test]
    fn shorter_prefix_is_a_superset() {
        let r = populated();
        let short = r.resolve(&cp_only(part("1.21", "", "")));
        let long = r.resolve(&cp_only(part("1.21.3", "", "")));
        let (short, long) = (short.control_plane.unwrap(), long.control_plane.unwrap());
        assert!(!long.tkrs_by_k8s_version.is_empty());
        assert!(k8s_versions(&long).is_subset(&k8s_versions(&short)));
        assert!(tkr_names(&long).is_subset(&tkr_names(&short)));
        assert_eq!(k8s_versions(&short).len(), 2);
        assert_eq!(short.tkr_name, "v1.21.8---vmware.1-tkg.1");
    }

    #[test]
    fn parts_agree_on_tkrs() {
        let r = populated();
        let q = Query {
            control_plane: Some(part("v1.21", "", "")),
            machine_deployments: vec![Some(part("v1.21", "", "os-name=photon")), Some(part("v1", "", "os-arch=amd64"))],
        };
        let res = r.resolve(&q);
        let cp = tkr_names(res.control_plane.as_ref().unwrap());
        assert_eq!(cp, BTreeSet::from(["v1.21.3---vmware.1-tkg.1".to_string()]));
        for md in res.machine_deployments.iter().flatten() {
            assert_eq!(tkr_names(md), cp);
        }
        // the control plane keeps its own image set for the shared tkr
        let cp = res.control_plane.unwrap();
        assert_eq!(cp.os_images().map(|m| m.len()), Some(2));
        let md0 = res.machine_deployments[0].as_ref().unwrap();
        assert_eq!(md0.os_image().map(|i| i.name().to_string()), Some("photon-121-amd64".to_string()));
    }

    #[test]
    fn exposes_ambiguous_images() {
        let r = populated();
        let res = r.resolve(&cp_only(part("v1.22", "", "os-name=ubuntu")));
        let cp = res.control_plane.unwrap();
        assert_eq!(cp.tkr_name, "v1.22.5---vmware.1-tkg.1");
        assert_eq!(cp.os_images().map(|m| m.len()), Some(2));
        assert!(cp.is_unresolved());

        let res = r.resolve(&cp_only(part("v1.22", "", "os-arch=arm64")));
        assert!(!res.control_plane.unwrap().is_unresolved());
    }

    #[test]
    fn absent_parts_stay_absent() {
        let r = populated();
        let q = Query { control_plane: None, machine_deployments: vec![None, Some(part("v1.22", "", "os-arch=arm64")), None] };
        let res = r.resolve(&q);
        assert!(res.control_plane.is_none());
        assert_eq!(res.machine_deployments.len(), 3);
        assert!(res.machine_deployments[0].is_none() && res.machine_deployments[2].is_none());
        assert!(res.is_resolved());

        let empty = r.resolve(&Query::default());
        assert_eq!(empty, Resolution::default());
    }

    #[test]
    fn nothing_matching_is_present_but_empty() {
        let r = populated();
        let res = r.resolve(&cp_only(part("v1.30", "", "")));
        let cp = res.control_plane.unwrap();
        assert!(cp.tkrs_by_k8s_version.is_empty());
        assert!(cp.tkr_name.is_empty());
        assert!(cp.is_unresolved());
    }

    #[test]
    fn empty_version_prefix_resolves_nothing() {
        let r = Resolver::new();
        r.add(objects(vec![tkr("v1.23.5+vmware.1", "v1.23.5+vmware.1", &["img"])]));
        r.add(objects(vec![os_image("img", "v1.23.5+vmware.1", "ubuntu", "amd64")]));
        let res = r.resolve(&cp_only(part("", "", "")));
        let cp = res.control_plane.unwrap();
        assert_eq!(cp.tkr_name, "");
        assert_eq!(cp.k8s_version, "");
        assert!(cp.tkrs_by_k8s_version.is_empty());
        assert!(cp.is_unresolved());
        let q = normalize(&cp_only(part("", "", "")));
        assert!(q.control_plane.unwrap().tkr_selector.requirements().contains(&Requirement::exists("v")));
    }

    #[test]
    fn exact_version_prefix_excludes_suffixed_releases() {
        let r = Resolver::new();
        r.add(objects(vec![
            tkr("v1.20.1+vmware.1", "v1.20.1+vmware.1", &["img"]),
            tkr("v1.20.1+vmware.1-zshippable", "v1.20.1+vmware.1", &["img"]),
        ]));
        r.add(objects(vec![os_image("img", "v1.20.1+vmware.1", "ubuntu", "amd64")]));
        let res = r.resolve(&cp_only(part("v1.20.1+vmware.1", "", "")));
        let cp = res.control_plane.unwrap();
        assert_eq!(tkr_names(&cp), BTreeSet::from(["v1.20.1---vmware.1".to_string()]));
    }

    #[test]
    fn unwanted_tkrs_never_resolve() {
        let r = populated();
        let mut incompatible = tkr("v1.22.9+vmware.1-tkg.1", "v1.22.9+vmware.1", &["ubuntu-122-arm64"]);
        incompatible.conditions_mut().push(Condition {
            type_: CONDITION_COMPATIBLE.into(),
            status: "False".into(),
            ..Default::default()
        });
        let mut deactivated = tkr("v1.22.8+vmware.1-tkg.1", "v1.22.8+vmware.1", &["ubuntu-122-arm64"]);
        deactivated.labels_mut().insert(LABEL_DEACTIVATED.into(), String::new());
        r.add(objects(vec![incompatible, deactivated]));

        let res = r.resolve(&cp_only(part("v1.22", "", "os-arch=arm64")));
        assert_eq!(res.control_plane.unwrap().tkr_name, "v1.22.5---vmware.1-tkg.1");
    }

    #[test]
    fn normalize_adds_implicit_requirements_once() {
        let q = cp_only(part("1.23", "team=a", ""));
        let once = normalize(&q);
        let cp = once.control_plane.as_ref().unwrap();
        assert_eq!(
            cp.tkr_selector.to_string(),
            "team=a,!run.tanzu.vmware.com/incompatible,!run.tanzu.vmware.com/deactivated,!run.tanzu.vmware.com/invalid,v1.23"
        );
        assert_eq!(cp.os_image_selector.requirements().len(), 3);
        assert_eq!(normalize(&once), once);
        assert_eq!(normalize(&Query::default()), Query::default());
    }

    #[test]
    fn equal_versions_pick_first_name() {
        let a = Arc::new(tkr("v1.21.3+vmware.1", "v1.21.3", &[]));
        let b = Arc::new(tkr("v1.21.3+vmware.2", "v1.21.3", &[]));
        let tkrs: Tkrs = [(a.name().to_string(), a.clone()), (b.name().to_string(), b)].into_iter().collect();
        let ranked = rank(OsImageDetails { tkrs, os_images_by_tkr: BTreeMap::new() });
        assert_eq!(ranked.tkr_name, a.name());
        assert_eq!(ranked.tkr_count(), 2);
    }

    #[test]
    fn results_survive_cache_changes() {
        let r = populated();
        let res = r.resolve(&cp_only(part("v1.22", "", "os-arch=arm64")));
        r.remove(objects(vec![os_image("ubuntu-122-arm64", "", "", "")]));
        let cp = res.control_plane.unwrap();
        assert_eq!(cp.os_image().map(|i| i.spec.os.arch.clone()), Some("arm64".to_string()));
        assert!(r.get("ubuntu-122-arm64", ObjectKind::OsImage).is_none());
    }
}
