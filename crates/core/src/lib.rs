//! TKR core types: the TanzuKubernetesRelease and OSImage resources, the labels and
//! conditions derived from them, and the query/result shapes shared by the resolver.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::LocalObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub mod data;
pub mod osimage;
pub mod selector;
pub mod version;

pub use data::{OsImageQuery, OsImageResult, OsImages, Query, Resolution, Tkrs};
pub use selector::{Operator, Requirement, Selector};
pub use version::Version;

/// Kubernetes labels as stored in `metadata.labels`.
pub type Labels = BTreeMap<String, String>;

pub const LABEL_TKR: &str = "run.tanzu.vmware.com/tkr";
pub const LABEL_OS_IMAGE: &str = "run.tanzu.vmware.com/os-image";
pub const LABEL_INCOMPATIBLE: &str = "run.tanzu.vmware.com/incompatible";
pub const LABEL_DEACTIVATED: &str = "run.tanzu.vmware.com/deactivated";
pub const LABEL_INVALID: &str = "run.tanzu.vmware.com/invalid";

pub const LABEL_OS_TYPE: &str = "os-type";
pub const LABEL_OS_NAME: &str = "os-name";
pub const LABEL_OS_VERSION: &str = "os-version";
pub const LABEL_OS_ARCH: &str = "os-arch";
pub const LABEL_IMAGE_TYPE: &str = "image-type";

/// Records carrying any of these labels never take part in resolution.
pub const UNWANTED_LABELS: [&str; 3] = [LABEL_INCOMPATIBLE, LABEL_DEACTIVATED, LABEL_INVALID];

pub const CONDITION_VALID: &str = "Valid";
pub const CONDITION_COMPATIBLE: &str = "Compatible";
pub const CONDITION_READY: &str = "Ready";

/// Label values are limited to 63 characters by the API server.
pub const MAX_LABEL_VALUE_LEN: usize = 63;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },
    #[error("invalid label selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("invalid label {0:?}")]
    InvalidLabel(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A status condition in the Cluster API shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub mod conditions {
    use super::Condition;

    pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
        conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
        get(conditions, type_).map(|c| c.status == "True").unwrap_or(false)
    }

    /// False only when the condition is present with status "False"; a missing condition is unknown.
    pub fn is_false(conditions: &[Condition], type_: &str) -> bool {
        get(conditions, type_).map(|c| c.status == "False").unwrap_or(false)
    }

    /// Replace (or append) the condition with the same type.
    pub fn set(conditions: &mut Vec<Condition>, condition: Condition) {
        match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => conditions.push(condition),
        }
    }

    pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
        set(conditions, Condition { type_: type_.to_string(), status: "True".to_string(), ..Default::default() });
    }

    pub fn mark_false(conditions: &mut Vec<Condition>, type_: &str, reason: &str, severity: &str, message: &str) {
        set(
            conditions,
            Condition {
                type_: type_.to_string(),
                status: "False".to_string(),
                severity: Some(severity.to_string()),
                last_transition_time: None,
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
            },
        );
    }
}

// ---- TanzuKubernetesRelease ----

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "run.tanzu.vmware.com",
    version = "v1alpha3",
    kind = "TanzuKubernetesRelease",
    plural = "tanzukubernetesreleases",
    shortname = "tkr",
    status = "TanzuKubernetesReleaseStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct TanzuKubernetesReleaseSpec {
    /// Fully qualified semantic version of the release, e.g. `v1.23.5+vmware.1-tkg.1`.
    pub version: String,
    pub kubernetes: KubernetesSpec,
    /// OSImages shipped with this release, by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os_images: Vec<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bootstrap_packages: Vec<LocalObjectReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    /// Kubernetes version shipped, e.g. `v1.23.5+vmware.1`.
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<ContainerImageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<ContainerImageInfo>,
    #[serde(default, rename = "coredns", skip_serializing_if = "Option::is_none")]
    pub core_dns: Option<ContainerImageInfo>,
    #[serde(default, rename = "kube-vip", skip_serializing_if = "Option::is_none")]
    pub kube_vip: Option<ContainerImageInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImageInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_tag: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TanzuKubernetesReleaseStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl TanzuKubernetesRelease {
    /// Build a release named after its version: the name is the version label, so the same
    /// version always lands in the same cache slot.
    pub fn for_spec(spec: TanzuKubernetesReleaseSpec) -> Self {
        let name = version::label(&spec.version);
        Self::new(&name, spec)
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn labels(&self) -> &Labels {
        static EMPTY: Labels = Labels::new();
        self.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }

    pub fn labels_mut(&mut self) -> &mut Labels {
        self.metadata.labels.get_or_insert_with(Labels::new)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    pub fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Names of the OSImages this release ships. References without a name are skipped.
    pub fn os_image_names(&self) -> impl Iterator<Item = &str> {
        self.spec.os_images.iter().filter_map(|r| r.name.as_deref())
    }
}

// ---- OSImage ----

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "run.tanzu.vmware.com",
    version = "v1alpha3",
    kind = "OSImage",
    plural = "osimages",
    status = "OSImageStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct OSImageSpec {
    /// Kubernetes version the image was built for.
    pub kubernetes_version: String,
    pub os: OSInfo,
    pub image: MachineImageInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OSInfo {
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    pub version: String,
    pub arch: String,
}

/// Provider specific image descriptor: a type tag (e.g. `ova`, `ami`) and an arbitrarily nested reference map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MachineImageInfo {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(rename = "ref", default)]
    pub ref_: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OSImageStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl OSImage {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn labels(&self) -> &Labels {
        static EMPTY: Labels = Labels::new();
        self.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }

    pub fn labels_mut(&mut self) -> &mut Labels {
        self.metadata.labels.get_or_insert_with(Labels::new)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Which of the two cached resource kinds a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Tkr,
    OsImage,
}

/// Make a value usable as a label value: `+` is not allowed, and values are length limited.
pub fn label_value(s: &str) -> String {
    s.replace('+', version::BUILD_SEPARATOR).chars().take(MAX_LABEL_VALUE_LEN).collect()
}

pub mod prelude {
    pub use super::{
        conditions, Labels, ObjectKind, OSImage, OSImageSpec, OsImageQuery, OsImageResult, Query, Resolution,
        Selector, TanzuKubernetesRelease, TanzuKubernetesReleaseSpec,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tkr_name_derives_from_version() {
        let tkr = TanzuKubernetesRelease::for_spec(TanzuKubernetesReleaseSpec {
            version: "v1.23.5+vmware.1-tkg.1".to_string(),
            kubernetes: KubernetesSpec { version: "v1.23.5+vmware.1".to_string(), ..Default::default() },
            ..Default::default()
        });
        assert_eq!(tkr.name(), "v1.23.5---vmware.1-tkg.1");
        let again = TanzuKubernetesRelease::for_spec(tkr.spec.clone());
        assert_eq!(again.name(), tkr.name());
    }

    #[test]
    fn label_value_replaces_plus_and_truncates() {
        assert_eq!(label_value("v1.2.3+vmware.1"), "v1.2.3---vmware.1");
        let long = "a".repeat(100);
        assert_eq!(label_value(&long).len(), MAX_LABEL_VALUE_LEN);
    }

    #[test]
    fn conditions_set_replaces_by_type() {
        let mut cs = Vec::new();
        conditions::mark_false(&mut cs, CONDITION_READY, "Invalid", "Warning", LABEL_INVALID);
        assert!(conditions::is_false(&cs, CONDITION_READY));
        conditions::mark_true(&mut cs, CONDITION_READY);
        assert_eq!(cs.len(), 1);
        assert!(conditions::is_true(&cs, CONDITION_READY));
        assert!(!conditions::is_false(&cs, CONDITION_VALID), "missing condition is not False");
    }

    #[test]
    fn os_image_deserializes_nested_ref() {
        let raw = serde_json::json!({
            "apiVersion": "run.tanzu.vmware.com/v1alpha3",
            "kind": "OSImage",
            "metadata": { "name": "ubuntu-2004-amd64" },
            "spec": {
                "kubernetesVersion": "v1.23.5+vmware.1",
                "os": { "type": "linux", "name": "ubuntu", "version": "20.04", "arch": "amd64" },
                "image": { "type": "ova", "ref": { "name": "ubuntu", "nested": { "id": 7 } } }
            }
        });
        let img: OSImage = serde_json::from_value(raw).unwrap();
        assert_eq!(img.name(), "ubuntu-2004-amd64");
        assert_eq!(img.spec.os.arch, "amd64");
        assert_eq!(img.spec.image.ref_["nested"]["id"], 7);
    }
}
