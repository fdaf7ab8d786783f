//! TKR cluster API: turns a cluster topology into a resolver query and the result into TKR data.
//!
//! The cluster opts into resolution with the `resolve-tkr` annotation (a TKR selector). The control
//! plane and each machine deployment opt in with `resolve-os-image` (an OSImage selector); a part
//! without it is not resolved.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tkr_core::{
    osimage, version, KubernetesSpec, Labels, ObjectKind, OSImage, OsImageQuery, OsImageResult, Query, Resolution,
    Selector, TanzuKubernetesRelease, LABEL_IMAGE_TYPE, LABEL_OS_ARCH, LABEL_OS_IMAGE, LABEL_OS_NAME, LABEL_OS_TYPE,
    LABEL_OS_VERSION, LABEL_TKR,
};
use tkr_resolver::{Cached, CachingResolver};
use tracing::{debug, info};

pub const ANNOTATION_RESOLVE_TKR: &str = "run.tanzu.vmware.com/resolve-tkr";
pub const ANNOTATION_RESOLVE_OS_IMAGE: &str = "run.tanzu.vmware.com/resolve-os-image";

/// Per Kubernetes version resolution data, as kept in the `TKR_DATA` topology variable.
pub type TkrData = BTreeMap<String, TkrDataValue>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TkrDataValue {
    pub kubernetes_spec: KubernetesSpec,
    #[serde(default)]
    pub os_image_ref: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub labels: Labels,
}

/// The parts of a Cluster API cluster that TKR resolution reads and writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub deleting: bool,
    /// Desired version: a version prefix before resolution, the Kubernetes version after.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub control_plane: ControlPlaneTopology,
    #[serde(default)]
    pub machine_deployments: Vec<MachineDeploymentTopology>,
    #[serde(default)]
    pub tkr_data: TkrData,
    /// Registry host overriding every image repository in the TKR data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image_repository: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneTopology {
    #[serde(default)]
    pub annotations: Labels,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentTopology {
    pub name: String,
    #[serde(default)]
    pub annotations: Labels,
    #[serde(default)]
    pub tkr_data: TkrData,
}

impl ClusterTopology {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("invalid {annotation} annotation: {source}")]
    Selector {
        annotation: String,
        #[source]
        source: tkr_core::Error,
    },
    #[error("{0}")]
    Unresolved(Box<Unresolved>),
    #[error("the TKR is no longer available: '{0}'")]
    TkrUnavailable(String),
}

/// Resolution failed for some parts. Carries everything needed to explain why.
#[derive(Debug, Clone)]
pub struct Unresolved {
    pub cluster: String,
    pub control_plane: bool,
    pub machine_deployments: Vec<String>,
    pub query: Query,
    pub result: Resolution,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster '{}': could not resolve TKR/OSImage for ", self.cluster)?;
        if self.control_plane {
            f.write_str("controlPlane, ")?;
        }
        write!(
            f,
            "machineDeployments: [{}], query: {}, result: {}",
            self.machine_deployments.join(", "),
            self.query,
            self.result
        )
    }
}

/// A successful resolution and the TKR data it produces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResolution {
    pub tkr_name: String,
    pub k8s_version: String,
    pub control_plane: Option<TkrDataValue>,
    pub machine_deployments: Vec<Option<TkrDataValue>>,
    #[serde(skip)]
    pub query: Query,
    pub result: Resolution,
}

impl ClusterResolution {
    /// Record the resolution on the topology: `tkr` label, version, and TKR data per resolved part.
    pub fn apply_to(&self, topology: &mut ClusterTopology) {
        topology.labels.insert(LABEL_TKR.to_string(), self.tkr_name.clone());
        topology.version = self.k8s_version.clone();
        if let Some(v) = self.control_plane.as_ref() {
            topology.tkr_data.insert(v.kubernetes_spec.version.clone(), v.clone());
        }
        for (md, value) in topology.machine_deployments.iter_mut().zip(self.machine_deployments.iter()) {
            if let Some(v) = value {
                md.tkr_data.insert(v.kubernetes_spec.version.clone(), v.clone());
            }
        }
    }
}

fn get_tkr(resolver: &dyn CachingResolver, name: &str) -> Option<Arc<TanzuKubernetesRelease>> {
    match resolver.get(name, ObjectKind::Tkr) {
        Some(Cached::Tkr(t)) => Some(t),
        _ => None,
    }
}

fn get_os_image(resolver: &dyn CachingResolver, name: &str) -> Option<Arc<OSImage>> {
    match resolver.get(name, ObjectKind::OsImage) {
        Some(Cached::OsImage(i)) => Some(i),
        _ => None,
    }
}

/// The TKR named by the cluster's `tkr` label, if cached.
pub fn current_tkr(resolver: &dyn CachingResolver, topology: &ClusterTopology) -> Option<Arc<TanzuKubernetesRelease>> {
    topology.labels.get(LABEL_TKR).and_then(|name| get_tkr(resolver, name))
}

fn parse_selector(annotations: &Labels, annotation: &str) -> Result<Option<Selector>, TopologyError> {
    match annotations.get(annotation) {
        None => Ok(None),
        Some(s) => Selector::parse(s)
            .map(Some)
            .map_err(|source| TopologyError::Selector { annotation: annotation.to_string(), source }),
    }
}

/// Build the query for a cluster. `None` when the cluster does not ask for TKR resolution.
///
/// Parts already satisfied by the cluster's current TKR and its recorded OSImage are left out.
/// When the control plane is left out, machine deployments are resolved against the current TKR version.
pub fn construct_query(resolver: &dyn CachingResolver, topology: &ClusterTopology) -> Result<Option<Query>, TopologyError> {
    let Some(tkr_selector) = parse_selector(&topology.annotations, ANNOTATION_RESOLVE_TKR)? else {
        return Ok(None);
    };
    let part = |annotations: &Labels| -> Result<Option<OsImageQuery>, TopologyError> {
        Ok(parse_selector(annotations, ANNOTATION_RESOLVE_OS_IMAGE)?.map(|os_image_selector| OsImageQuery {
            k8s_version_prefix: topology.version.clone(),
            tkr_selector: tkr_selector.clone(),
            os_image_selector,
        }))
    };

    let current = current_tkr(resolver, topology);
    let current = current.as_deref();

    let control_plane = part(&topology.control_plane.annotations)?
        .and_then(|q| skip_satisfied(resolver, current, &topology.tkr_data, q));
    let mut machine_deployments = Vec::with_capacity(topology.machine_deployments.len());
    for md in topology.machine_deployments.iter() {
        let q = part(&md.annotations)?.map(|mut q| {
            if let (None, Some(tkr)) = (control_plane.as_ref(), current) {
                q.k8s_version_prefix = tkr.spec.version.clone();
            }
            q
        });
        machine_deployments.push(q.and_then(|q| skip_satisfied(resolver, current, &topology.tkr_data, q)));
    }
    Ok(Some(Query { control_plane, machine_deployments }))
}

fn skip_satisfied(
    resolver: &dyn CachingResolver,
    tkr: Option<&TanzuKubernetesRelease>,
    tkr_data: &TkrData,
    query: OsImageQuery,
) -> Option<OsImageQuery> {
    let Some(tkr) = tkr else {
        return Some(query);
    };
    let recorded = tkr_data
        .get(&tkr.spec.kubernetes.version)
        .filter(|v| v.labels.get(LABEL_TKR).map(String::as_str) == Some(tkr.name()))
        .and_then(|v| v.labels.get(LABEL_OS_IMAGE))
        .and_then(|name| get_os_image(resolver, name));
    match recorded {
        Some(img)
            if version::has_prefix(&tkr.spec.version, &query.k8s_version_prefix)
                && query.tkr_selector.matches(tkr.labels())
                && query.os_image_selector.matches(img.labels()) =>
        {
            debug!(tkr = %tkr.name(), os_image = %img.name(), "part already resolved");
            None
        }
        _ => Some(query),
    }
}

/// Resolve a cluster. `Ok(None)` when there is nothing to do (paused, deleting, or not opted in).
pub fn resolve_cluster(
    resolver: &dyn CachingResolver,
    topology: &ClusterTopology,
) -> Result<Option<ClusterResolution>, TopologyError> {
    if topology.paused || topology.deleting {
        debug!(cluster = %topology.full_name(), paused = topology.paused, deleting = topology.deleting, "skipping");
        return Ok(None);
    }
    let Some(query) = construct_query(resolver, topology)? else {
        return Ok(None);
    };
    info!(cluster = %topology.full_name(), "resolving cluster");
    let result = resolver.resolve(&query);

    let control_plane_unresolved = result.is_control_plane_unresolved();
    let unresolved_mds = result.unresolved_machine_deployments();
    if control_plane_unresolved || !unresolved_mds.is_empty() {
        let machine_deployments = unresolved_mds
            .iter()
            .map(|&i| topology.machine_deployments.get(i).map(|md| md.name.clone()).unwrap_or_else(|| i.to_string()))
            .collect();
        return Err(TopologyError::Unresolved(Box::new(Unresolved {
            cluster: topology.full_name(),
            control_plane: control_plane_unresolved,
            machine_deployments,
            query,
            result,
        })));
    }

    let custom = topology.custom_image_repository.as_deref().unwrap_or_default();
    let tkr = match result.control_plane.as_ref().and_then(OsImageResult::tkr) {
        Some(t) => Arc::clone(t),
        None => {
            let name = topology.labels.get(LABEL_TKR).cloned().unwrap_or_default();
            get_tkr(resolver, &name).ok_or(TopologyError::TkrUnavailable(name))?
        }
    };
    let control_plane = result.control_plane.as_ref().and_then(|r| tkr_data_value(custom, r));
    let machine_deployments =
        result.machine_deployments.iter().map(|r| r.as_ref().and_then(|r| tkr_data_value(custom, r))).collect();
    Ok(Some(ClusterResolution {
        tkr_name: tkr.name().to_string(),
        k8s_version: tkr.spec.kubernetes.version.clone(),
        control_plane,
        machine_deployments,
        query,
        result,
    }))
}

/// TKR data for a resolved part: the canonical TKR and its single OSImage.
pub fn tkr_data_value(custom_image_repository: &str, result: &OsImageResult) -> Option<TkrDataValue> {
    let tkr = result.tkr()?;
    let img = result.os_image()?;
    let mut labels: Labels = [
        (LABEL_TKR, tkr.name()),
        (LABEL_OS_IMAGE, img.name()),
        (LABEL_OS_TYPE, img.spec.os.type_.as_str()),
        (LABEL_OS_NAME, img.spec.os.name.as_str()),
        (LABEL_OS_VERSION, img.spec.os.version.as_str()),
        (LABEL_OS_ARCH, img.spec.os.arch.as_str()),
        (LABEL_IMAGE_TYPE, img.spec.image.type_.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    osimage::set_ref_labels(&mut labels, &img.spec.image.type_, &img.spec.image.ref_);
    Some(TkrDataValue {
        kubernetes_spec: with_custom_image_repository(custom_image_repository, &tkr.spec.kubernetes),
        os_image_ref: img.spec.image.ref_.clone(),
        labels,
    })
}

fn with_custom_image_repository(custom: &str, spec: &KubernetesSpec) -> KubernetesSpec {
    let mut spec = spec.clone();
    if custom.is_empty() {
        return spec;
    }
    spec.image_repository = custom.to_string();
    for info in [&mut spec.core_dns, &mut spec.etcd, &mut spec.pause, &mut spec.kube_vip].into_iter().flatten() {
        info.image_repository = custom.to_string();
    }
    spec
}
