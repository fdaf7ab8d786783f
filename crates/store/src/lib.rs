//! TKR store: in-RAM cache of TKRs and OSImages with two derived indices.
//!
//! - `tkr_to_os_images`: TKR name -> names of the OSImages it ships that are currently cached.
//!   Every cached TKR has an entry, possibly empty.
//! - `os_image_to_tkrs`: OSImage name -> names of cached TKRs shipping it, whether or not the
//!   OSImage itself is cached. Removing an OSImage keeps this entry, so adding it back restores
//!   the same TKR memberships without rescanning TKRs.
//!
//! All writers take the lock exclusively; `filter` and `get` share it. Records are stored behind
//! `Arc` and replaced, never mutated, so anything handed out stays valid after the lock is released.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tkr_core::{
    conditions, osimage, version, Labels, ObjectKind, OSImage, OsImageQuery, OsImages, Query, TanzuKubernetesRelease,
    Tkrs, CONDITION_COMPATIBLE, CONDITION_READY, CONDITION_VALID, LABEL_IMAGE_TYPE, LABEL_INCOMPATIBLE,
    LABEL_INVALID, LABEL_OS_ARCH, LABEL_OS_NAME, LABEL_OS_TYPE, LABEL_OS_VERSION, UNWANTED_LABELS,
};
use tracing::debug;

/// A record handed to [`Cache::add`] / [`Cache::remove`].
#[derive(Debug, Clone)]
pub enum Object {
    Tkr(TanzuKubernetesRelease),
    OsImage(OSImage),
}

impl Object {
    pub fn name(&self) -> &str {
        match self {
            Object::Tkr(t) => t.name(),
            Object::OsImage(i) => i.name(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Tkr(_) => ObjectKind::Tkr,
            Object::OsImage(_) => ObjectKind::OsImage,
        }
    }
}

impl From<TanzuKubernetesRelease> for Object {
    fn from(v: TanzuKubernetesRelease) -> Self { Object::Tkr(v) }
}

impl From<OSImage> for Object {
    fn from(v: OSImage) -> Self { Object::OsImage(v) }
}

/// A record as stored in the cache (augmented labels and conditions included).
#[derive(Debug, Clone, PartialEq)]
pub enum Cached {
    Tkr(Arc<TanzuKubernetesRelease>),
    OsImage(Arc<OSImage>),
}

/// Name -> set of names. Entry presence is meaningful: `ensure` creates an empty entry,
/// `remove_member_prune` drops the entry once its set becomes empty, `remove_member` keeps it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameIndex {
    map: FxHashMap<String, FxHashSet<String>>,
}

impl NameIndex {
    pub fn ensure(&mut self, key: &str) -> &mut FxHashSet<String> {
        self.map.entry(key.to_string()).or_default()
    }

    pub fn insert(&mut self, key: &str, member: &str) {
        self.ensure(key).insert(member.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&FxHashSet<String>> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn contains(&self, key: &str, member: &str) -> bool {
        self.map.get(key).map(|s| s.contains(member)).unwrap_or(false)
    }

    pub fn remove_member(&mut self, key: &str, member: &str) {
        if let Some(set) = self.map.get_mut(key) {
            set.remove(member);
        }
    }

    pub fn remove_member_prune(&mut self, key: &str, member: &str) {
        if let Some(set) = self.map.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.map.remove(key);
            }
        }
    }

    pub fn remove_key(&mut self, key: &str) {
        self.map.remove(key);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

/// Copy of both indices, for inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Indices {
    pub tkr_to_os_images: NameIndex,
    pub os_image_to_tkrs: NameIndex,
}

/// Filter output for one query part: TKRs with at least one qualifying OSImage, and those OSImages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OsImageDetails {
    pub tkrs: Tkrs,
    pub os_images_by_tkr: BTreeMap<String, OsImages>,
}

/// Filter output mirroring the query shape. `None` parts were not requested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Details {
    pub control_plane: Option<OsImageDetails>,
    pub machine_deployments: Vec<Option<OsImageDetails>>,
}

#[derive(Default)]
struct State {
    tkrs: FxHashMap<String, Arc<TanzuKubernetesRelease>>,
    os_images: FxHashMap<String, Arc<OSImage>>,
    tkr_to_os_images: NameIndex,
    os_image_to_tkrs: NameIndex,
}

#[derive(Default)]
pub struct Cache {
    state: RwLock<State>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert records. A record with a deletion timestamp is removed instead.
    /// Pre-req: versions parse (malformed records are rejected by the caller).
    pub fn add<I, O>(&self, objects: I)
    where
        I: IntoIterator<Item = O>,
        O: Into<Object>,
    {
        let mut state = self.state.write();
        for object in objects {
            match object.into() {
                Object::Tkr(tkr) if tkr.is_deleted() => state.remove_tkr(tkr.name()),
                Object::Tkr(tkr) => state.add_tkr(tkr),
                Object::OsImage(img) if img.is_deleted() => state.remove_os_image(img.name()),
                Object::OsImage(img) => state.add_os_image(img),
            }
        }
        state.record_gauges();
    }

    pub fn remove<I, O>(&self, objects: I)
    where
        I: IntoIterator<Item = O>,
        O: Into<Object>,
    {
        let mut state = self.state.write();
        for object in objects {
            match object.into() {
                Object::Tkr(tkr) => state.remove_tkr(tkr.name()),
                Object::OsImage(img) => state.remove_os_image(img.name()),
            }
        }
        state.record_gauges();
    }

    /// Remove by name; used when only the name of a deleted record is known.
    pub fn remove_by_name(&self, name: &str, kind: ObjectKind) {
        let mut state = self.state.write();
        match kind {
            ObjectKind::Tkr => state.remove_tkr(name),
            ObjectKind::OsImage => state.remove_os_image(name),
        }
        state.record_gauges();
    }

    pub fn get(&self, name: &str, kind: ObjectKind) -> Option<Cached> {
        match kind {
            ObjectKind::Tkr => self.get_tkr(name).map(Cached::Tkr),
            ObjectKind::OsImage => self.get_os_image(name).map(Cached::OsImage),
        }
    }

    pub fn get_tkr(&self, name: &str) -> Option<Arc<TanzuKubernetesRelease>> {
        self.state.read().tkrs.get(name).cloned()
    }

    pub fn get_os_image(&self, name: &str) -> Option<Arc<OSImage>> {
        self.state.read().os_images.get(name).cloned()
    }

    /// Sorted names of cached records of one kind.
    pub fn names(&self, kind: ObjectKind) -> Vec<String> {
        let state = self.state.read();
        let mut out: Vec<String> = match kind {
            ObjectKind::Tkr => state.tkrs.keys().cloned().collect(),
            ObjectKind::OsImage => state.os_images.keys().cloned().collect(),
        };
        out.sort();
        out
    }

    pub fn len(&self, kind: ObjectKind) -> usize {
        let state = self.state.read();
        match kind {
            ObjectKind::Tkr => state.tkrs.len(),
            ObjectKind::OsImage => state.os_images.len(),
        }
    }

    pub fn indices(&self) -> Indices {
        let state = self.state.read();
        Indices { tkr_to_os_images: state.tkr_to_os_images.clone(), os_image_to_tkrs: state.os_image_to_tkrs.clone() }
    }

    /// Evaluate a normalized query against one consistent snapshot, under a single read lock.
    /// The output holds `Arc` clones only, nothing borrowed from the cache.
    pub fn filter(&self, query: &Query) -> Details {
        let state = self.state.read();
        Details {
            control_plane: query.control_plane.as_ref().map(|q| state.filter_part(q)),
            machine_deployments: query.machine_deployments.iter().map(|q| q.as_ref().map(|q| state.filter_part(q))).collect(),
        }
    }
}

impl State {
    fn add_tkr(&mut self, mut tkr: TanzuKubernetesRelease) {
        augment_tkr(&mut tkr);
        let name = tkr.name().to_string();
        // An update may ship a different OSImage list: drop the old pairs first.
        self.unlink_tkr(&name);
        self.tkr_to_os_images.ensure(&name);
        for img in tkr.os_image_names() {
            self.os_image_to_tkrs.insert(img, &name);
            if self.os_images.contains_key(img) {
                self.tkr_to_os_images.insert(&name, img);
            }
        }
        debug!(tkr = %name, os_images = tkr.spec.os_images.len(), "cache: tkr added");
        self.tkrs.insert(name, Arc::new(tkr));
    }

    fn unlink_tkr(&mut self, name: &str) {
        if let Some(old) = self.tkrs.get(name).cloned() {
            for img in old.os_image_names() {
                self.os_image_to_tkrs.remove_member_prune(img, name);
            }
        }
        self.tkr_to_os_images.remove_key(name);
    }

    fn remove_tkr(&mut self, name: &str) {
        self.unlink_tkr(name);
        if self.tkrs.remove(name).is_some() {
            debug!(tkr = %name, "cache: tkr removed");
        }
    }

    fn add_os_image(&mut self, mut img: OSImage) {
        augment_os_image(&mut img);
        let name = img.name().to_string();
        if let Some(tkrs) = self.os_image_to_tkrs.get(&name) {
            for tkr in tkrs.iter() {
                self.tkr_to_os_images.insert(tkr, &name);
            }
        }
        debug!(os_image = %name, "cache: os image added");
        self.os_images.insert(name, Arc::new(img));
    }

    fn remove_os_image(&mut self, name: &str) {
        if self.os_images.remove(name).is_none() {
            return;
        }
        if let Some(tkrs) = self.os_image_to_tkrs.get(name) {
            for tkr in tkrs.iter() {
                self.tkr_to_os_images.remove_member(tkr, name);
            }
        }
        debug!(os_image = %name, "cache: os image removed");
    }

    fn filter_part(&self, query: &OsImageQuery) -> OsImageDetails {
        let mut out = OsImageDetails::default();
        for (name, tkr) in self.tkrs.iter() {
            if !query.tkr_selector.matches(tkr.labels()) {
                continue;
            }
            let os_images: OsImages = self
                .tkr_to_os_images
                .get(name)
                .into_iter()
                .flatten()
                .filter_map(|img| self.os_images.get(img))
                .filter(|img| query.os_image_selector.matches(img.labels()))
                .map(|img| (img.name().to_string(), Arc::clone(img)))
                .collect();
            if os_images.is_empty() {
                continue;
            }
            out.tkrs.insert(name.clone(), Arc::clone(tkr));
            out.os_images_by_tkr.insert(name.clone(), os_images);
        }
        out
    }

    fn record_gauges(&self) {
        metrics::gauge!("tkr_cache_tkrs", self.tkrs.len() as f64);
        metrics::gauge!("tkr_cache_os_images", self.os_images.len() as f64);
    }
}

// ---- derived labels and conditions ----

fn merge_version_prefixes(labels: &mut Labels, v: &str) {
    if v.is_empty() {
        return;
    }
    for prefix in version::prefixes(&version::label(v)) {
        labels.insert(prefix, String::new());
    }
}

fn ensure_label(labels: &mut Labels, label: &str, should_set: bool) {
    if should_set {
        labels.insert(label.to_string(), String::new());
    } else {
        labels.remove(label);
    }
}

/// Sets version prefix labels, the incompatible/invalid labels from status conditions, and Ready.
fn augment_tkr(tkr: &mut TanzuKubernetesRelease) {
    let incompatible = conditions::is_false(tkr.conditions(), CONDITION_COMPATIBLE);
    let invalid = conditions::is_false(tkr.conditions(), CONDITION_VALID);
    let v = tkr.spec.version.clone();
    let labels = tkr.labels_mut();
    merge_version_prefixes(labels, &v);
    ensure_label(labels, LABEL_INCOMPATIBLE, incompatible);
    ensure_label(labels, LABEL_INVALID, invalid);
    set_ready_condition(tkr);
}

fn set_ready_condition(tkr: &mut TanzuKubernetesRelease) {
    let unwanted = UNWANTED_LABELS.iter().find(|l| tkr.labels().contains_key(**l)).copied();
    match unwanted {
        Some(label) => {
            let reason = ready_reason(label);
            conditions::mark_false(tkr.conditions_mut(), CONDITION_READY, &reason, "Warning", label);
        }
        None => conditions::mark_true(tkr.conditions_mut(), CONDITION_READY),
    }
}

// "run.tanzu.vmware.com/incompatible" -> "Incompatible"
fn ready_reason(label: &str) -> String {
    let name = label.rsplit('/').next().unwrap_or(label);
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Sets k8s version prefix labels, os-* labels, image-type and the flattened image ref labels.
fn augment_os_image(img: &mut OSImage) {
    let spec = img.spec.clone();
    let labels = img.labels_mut();
    merge_version_prefixes(labels, &spec.kubernetes_version);
    labels.insert(LABEL_OS_TYPE.to_string(), spec.os.type_);
    labels.insert(LABEL_OS_NAME.to_string(), spec.os.name);
    labels.insert(LABEL_OS_VERSION.to_string(), spec.os.version);
    labels.insert(LABEL_OS_ARCH.to_string(), spec.os.arch);
    labels.insert(LABEL_IMAGE_TYPE.to_string(), spec.image.type_.clone());
    osimage::set_ref_labels(labels, &spec.image.type_, &spec.image.ref_);
}
