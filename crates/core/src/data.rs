//! Query and result shapes of a TKR/OSImage resolution.
//!
//! A [`Query`] has a control plane part and one part per machine deployment; `None` means the part
//! does not need resolving. The [`Resolution`] mirrors that shape part for part.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::{OSImage, Selector, TanzuKubernetesRelease};

/// TKRs by name. Shared records: never mutate through these, clone first.
pub type Tkrs = BTreeMap<String, Arc<TanzuKubernetesRelease>>;
/// OSImages by name. Shared records: never mutate through these, clone first.
pub type OsImages = BTreeMap<String, Arc<OSImage>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub control_plane: Option<OsImageQuery>,
    pub machine_deployments: Vec<Option<OsImageQuery>>,
}

/// Constraints for one part of a cluster topology.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OsImageQuery {
    /// Version prefix the TKR must have, e.g. `v1.23` or an exact TKR version.
    pub k8s_version_prefix: String,
    pub tkr_selector: Selector,
    pub os_image_selector: Selector,
}

impl Query {
    /// True if no part needs resolving.
    pub fn is_empty(&self) -> bool {
        self.control_plane.is_none() && self.machine_deployments.iter().all(Option::is_none)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub control_plane: Option<OsImageResult>,
    pub machine_deployments: Vec<Option<OsImageResult>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsImageResult {
    /// Kubernetes version shipped by the canonical TKR.
    pub k8s_version: String,
    /// The canonical (highest version) TKR; empty if nothing matched.
    pub tkr_name: String,
    /// Every surviving TKR, grouped by the Kubernetes version it ships.
    pub tkrs_by_k8s_version: BTreeMap<String, Tkrs>,
    /// OSImages satisfying this part, per surviving TKR.
    #[serde(rename = "osImagesByTKR")]
    pub os_images_by_tkr: BTreeMap<String, OsImages>,
}

impl OsImageResult {
    pub fn tkr(&self) -> Option<&Arc<TanzuKubernetesRelease>> {
        self.tkrs_by_k8s_version.get(&self.k8s_version).and_then(|tkrs| tkrs.get(&self.tkr_name))
    }

    /// OSImages qualifying for the canonical TKR.
    pub fn os_images(&self) -> Option<&OsImages> {
        self.os_images_by_tkr.get(&self.tkr_name)
    }

    /// The single OSImage of the canonical TKR, if the part is resolved.
    pub fn os_image(&self) -> Option<&Arc<OSImage>> {
        match self.os_images() {
            Some(images) if images.len() == 1 => images.values().next(),
            _ => None,
        }
    }

    /// Unresolved: no TKR matched, or the canonical TKR has zero or several qualifying OSImages.
    pub fn is_unresolved(&self) -> bool {
        self.os_images_by_tkr.is_empty() || self.os_images().map(|m| m.len()).unwrap_or(0) != 1
    }

    pub fn tkr_count(&self) -> usize {
        self.tkrs_by_k8s_version.values().map(|t| t.len()).sum()
    }
}

impl Resolution {
    pub fn is_control_plane_unresolved(&self) -> bool {
        self.control_plane.as_ref().map(OsImageResult::is_unresolved).unwrap_or(false)
    }

    /// Indices of machine deployment parts that were requested but did not resolve.
    pub fn unresolved_machine_deployments(&self) -> Vec<usize> {
        self.machine_deployments
            .iter()
            .enumerate()
            .filter(|(_, r)| r.as_ref().map(OsImageResult::is_unresolved).unwrap_or(false))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_resolved(&self) -> bool {
        !self.is_control_plane_unresolved() && self.unresolved_machine_deployments().is_empty()
    }
}

// ---- Display (used in denial messages and logs) ----

fn fmt_part<T: fmt::Display>(f: &mut fmt::Formatter<'_>, part: &Option<T>) -> fmt::Result {
    match part {
        Some(p) => write!(f, "{}", p),
        None => f.write_str("nil"),
    }
}

impl fmt::Display for OsImageQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{k8sVersionPrefix: '{}', tkrSelector: '{}', osImageSelector: '{}'}}",
            self.k8s_version_prefix, self.tkr_selector, self.os_image_selector
        )
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{controlPlane: ")?;
        fmt_part(f, &self.control_plane)?;
        f.write_str(", machineDeployments: [")?;
        for (i, md) in self.machine_deployments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            fmt_part(f, md)?;
        }
        f.write_str("]}")
    }
}

impl fmt::Display for OsImageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{k8sVersion: '{}', tkrName: '{}', tkrsByK8sVersion: {{", self.k8s_version, self.tkr_name)?;
        for (i, (k8s, tkrs)) in self.tkrs_by_k8s_version.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let names: Vec<&str> = tkrs.keys().map(String::as_str).collect();
            write!(f, "'{}': [{}]", k8s, names.join(", "))?;
        }
        f.write_str("}, osImagesByTKR: {")?;
        for (i, (tkr, images)) in self.os_images_by_tkr.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let names: Vec<&str> = images.keys().map(String::as_str).collect();
            write!(f, "'{}': [{}]", tkr, names.join(", "))?;
        }
        f.write_str("}}")
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{controlPlane: ")?;
        fmt_part(f, &self.control_plane)?;
        f.write_str(", machineDeployments: [")?;
        for (i, md) in self.machine_deployments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            fmt_part(f, md)?;
        }
        f.write_str("]}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KubernetesSpec, OSImageSpec, TanzuKubernetesReleaseSpec};

    fn result_with_images(n: usize) -> OsImageResult {
        let tkr = TanzuKubernetesRelease::for_spec(TanzuKubernetesReleaseSpec {
            version: "v1.23.5+vmware.1".into(),
            kubernetes: KubernetesSpec { version: "v1.23.5".into(), ..Default::default() },
            ..Default::default()
        });
        let name = tkr.name().to_string();
        let images: OsImages = (0..n)
            .map(|i| {
                let img = OSImage::new(&format!("img-{}", i), OSImageSpec::default());
                (img.name().to_string(), Arc::new(img))
            })
            .collect();
        let mut r = OsImageResult {
            k8s_version: "v1.23.5".into(),
            tkr_name: name.clone(),
            tkrs_by_k8s_version: BTreeMap::from([("v1.23.5".to_string(), Tkrs::from([(name.clone(), Arc::new(tkr))]))]),
            os_images_by_tkr: BTreeMap::new(),
        };
        if n > 0 {
            r.os_images_by_tkr.insert(name, images);
        }
        r
    }

    #[test]
    fn resolved_only_with_exactly_one_image() {
        assert!(result_with_images(0).is_unresolved());
        assert!(!result_with_images(1).is_unresolved());
        assert!(result_with_images(2).is_unresolved());
        assert_eq!(result_with_images(1).os_image().map(|i| i.name().to_string()), Some("img-0".to_string()));
        assert!(result_with_images(1).tkr().is_some());
    }

    #[test]
    fn absent_parts_are_never_unresolved() {
        let res = Resolution {
            control_plane: None,
            machine_deployments: vec![None, Some(result_with_images(2)), Some(result_with_images(1))],
        };
        assert!(!res.is_control_plane_unresolved());
        assert_eq!(res.unresolved_machine_deployments(), vec![1]);
        assert!(!res.is_resolved());
    }

    #[test]
    fn query_display_marks_absent_parts() {
        let q = Query {
            control_plane: None,
            machine_deployments: vec![Some(OsImageQuery { k8s_version_prefix: "v1.23".into(), ..Default::default() })],
        };
        assert_eq!(
            q.to_string(),
            "{controlPlane: nil, machineDeployments: [{k8sVersionPrefix: 'v1.23', tkrSelector: '', osImageSelector: ''}]}"
        );
        assert!(!q.is_empty());
        assert!(Query::default().is_empty());
    }
}
