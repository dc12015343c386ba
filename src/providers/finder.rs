//! Selector resolution: turns node class selector terms into platform objects.

use super::tags::TagManager;
use crate::crd::labels::{LABEL_TOPOLOGY_ZONE, ZONE_TAG_CATEGORY};
use crate::crd::{ImageSelectorTerm, SelectorTerm, VsphereNodeClassSpec};
use crate::error::{OperatorError, ResolutionFailure, Result};
use crate::vsphere::{InventoryItem, MoRef, ObjectKind, PlatformObject, VsphereApi};
use glob::Pattern;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Every object a clone needs
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub datacenter: InventoryItem,
    pub pool: MoRef,
    pub datastore: MoRef,
    pub network: InventoryItem,
    pub image: InventoryItem,
}

/// Maps a label key to the category that stores it on the platform
pub fn category_for_label(key: &str) -> &str {
    if key == LABEL_TOPOLOGY_ZONE {
        ZONE_TAG_CATEGORY
    } else {
        key
    }
}

/// Inverse of [`category_for_label`]
pub fn label_for_category(category: &str) -> &str {
    if category == ZONE_TAG_CATEGORY {
        LABEL_TOPOLOGY_ZONE
    } else {
        category
    }
}

#[derive(Clone)]
pub struct Finder {
    api: Arc<dyn VsphereApi>,
    tags: TagManager,
}

impl Finder {
    pub fn new(api: Arc<dyn VsphereApi>) -> Self {
        Self {
            tags: TagManager::new(api.clone()),
            api,
        }
    }

    pub async fn resolve_target(&self, spec: &VsphereNodeClassSpec) -> Result<ResolvedTarget> {
        let datacenter = self.resolve_datacenter(spec.datacenter.as_ref()).await?;
        let pool = self.resolve_pool(&spec.compute_cluster, &datacenter).await?;
        let datastore = self.resolve_datastore(&spec.datastore, &datacenter).await?;
        let network = self.resolve_network(&spec.network, &datacenter).await?;
        let image = self.resolve_image(&spec.image, &datacenter).await?;
        Ok(ResolvedTarget {
            datacenter,
            pool,
            datastore,
            network,
            image,
        })
    }

    /// Resolves the datacenter selector, or the only datacenter when absent
    pub async fn resolve_datacenter(&self, term: Option<&SelectorTerm>) -> Result<InventoryItem> {
        match term {
            Some(term) => {
                let reference = self
                    .resolve(ObjectKind::Datacenter, term, |name| format!("/{}", name))
                    .await?;
                self.item(reference).await
            }
            None => self.default_datacenter(None).await,
        }
    }

    /// The named datacenter, or the only one when no name is given
    pub async fn default_datacenter(&self, name: Option<&str>) -> Result<InventoryItem> {
        let mut datacenters = self.api.datacenters().await?;
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            datacenters.retain(|dc| dc.name == name);
        }
        match datacenters.len() {
            1 => Ok(datacenters.remove(0)),
            0 => Err(OperatorError::resolution(
                ObjectKind::Datacenter.to_string(),
                ResolutionFailure::NotFound(name.unwrap_or("default datacenter").to_string()),
            )),
            n => Err(OperatorError::resolution(
                ObjectKind::Datacenter.to_string(),
                ResolutionFailure::Ambiguous(n),
            )),
        }
    }

    pub async fn resolve_pool(&self, term: &SelectorTerm, dc: &InventoryItem) -> Result<MoRef> {
        self.resolve(ObjectKind::ResourcePool, term, |name| {
            format!("/{}/host/{}/Resources", dc.name, name)
        })
        .await
    }

    pub async fn resolve_datastore(&self, term: &SelectorTerm, dc: &InventoryItem) -> Result<MoRef> {
        self.resolve(ObjectKind::Datastore, term, |name| {
            format!("/{}/datastore/{}", dc.name, name)
        })
        .await
    }

    /// Networks come back named so the NIC backing can reference them
    pub async fn resolve_network(&self, term: &SelectorTerm, dc: &InventoryItem) -> Result<InventoryItem> {
        let reference = self
            .resolve(ObjectKind::Network, term, |name| {
                format!("/{}/network/{}", dc.name, name)
            })
            .await?;
        self.item(reference).await
    }

    /// Resolves a VM template by tags, or by an inventory glob.
    ///
    /// Glob matches are sorted by name and the first one wins.
    pub async fn resolve_image(&self, term: &ImageSelectorTerm, dc: &InventoryItem) -> Result<InventoryItem> {
        let kind = ObjectKind::VirtualMachine;
        match (term.pattern.is_empty(), term.tags.is_empty()) {
            (true, true) => Err(OperatorError::resolution(kind.to_string(), ResolutionFailure::NoSelector)),
            (false, false) => Err(OperatorError::resolution(
                kind.to_string(),
                ResolutionFailure::ConflictingSelector,
            )),
            (true, false) => {
                let reference = self.by_tags(kind, &term.tags).await?;
                let info = self.api.virtual_machine(&reference).await?;
                if !info.template {
                    return Err(OperatorError::resolution(
                        kind.to_string(),
                        ResolutionFailure::NotTemplate(info.name),
                    ));
                }
                Ok(InventoryItem {
                    reference,
                    name: info.name,
                })
            }
            (false, true) => self.image_by_pattern(&term.pattern, dc).await,
        }
    }

    /// The VM folder new instances are cloned into
    pub async fn folder(&self, dc: &InventoryItem, path: &str) -> Result<InventoryItem> {
        let full = folder_path(dc, path);
        let reference = self.api.find_by_inventory_path(&full).await?.ok_or_else(|| {
            OperatorError::resolution(ObjectKind::Folder.to_string(), ResolutionFailure::NotFound(full.clone()))
        })?;
        match PlatformObject::from(reference) {
            PlatformObject::Folder(reference) => Ok(InventoryItem {
                reference,
                name: full,
            }),
            other => Err(OperatorError::resolution(
                ObjectKind::Folder.to_string(),
                ResolutionFailure::UnexpectedKind(other.reference().kind.clone()),
            )),
        }
    }

    async fn image_by_pattern(&self, pattern: &str, dc: &InventoryItem) -> Result<InventoryItem> {
        let kind = ObjectKind::VirtualMachine;
        let absolute = if pattern.starts_with('/') {
            pattern.to_string()
        } else {
            format!("/{}/vm/{}", dc.name, pattern)
        };
        let (parent, leaf) = absolute.rsplit_once('/').unwrap_or(("", absolute.as_str()));
        let glob = Pattern::new(leaf).map_err(|e| {
            OperatorError::resolution(
                kind.to_string(),
                ResolutionFailure::NotFound(format!("invalid pattern {:?}: {}", pattern, e)),
            )
        })?;

        let mut matches: Vec<InventoryItem> = self
            .api
            .list_children(parent)
            .await?
            .into_iter()
            .filter(|item| item.object().is(kind) && glob.matches(&item.name))
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(pattern, matches = matches.len(), "Resolved image pattern");
        if matches.is_empty() {
            return Err(OperatorError::resolution(
                kind.to_string(),
                ResolutionFailure::NotFound(absolute.clone()),
            ));
        }
        Ok(matches.remove(0))
    }

    async fn resolve<F>(&self, kind: ObjectKind, term: &SelectorTerm, path_for: F) -> Result<MoRef>
    where
        F: FnOnce(&str) -> String,
    {
        match (term.name.is_empty(), term.tags.is_empty()) {
            (true, true) => Err(OperatorError::resolution(kind.to_string(), ResolutionFailure::NoSelector)),
            (false, false) => Err(OperatorError::resolution(
                kind.to_string(),
                ResolutionFailure::ConflictingSelector,
            )),
            (true, false) => self.by_tags(kind, &term.tags).await,
            (false, true) => {
                let path = if term.name.starts_with('/') {
                    term.name.clone()
                } else {
                    path_for(&term.name)
                };
                self.by_path(kind, &path).await
            }
        }
    }

    async fn by_path(&self, kind: ObjectKind, path: &str) -> Result<MoRef> {
        let reference = self.api.find_by_inventory_path(path).await?.ok_or_else(|| {
            OperatorError::resolution(kind.to_string(), ResolutionFailure::NotFound(path.to_string()))
        })?;
        let object = PlatformObject::from(reference);
        if !object.is(kind) {
            return Err(OperatorError::resolution(
                kind.to_string(),
                ResolutionFailure::UnexpectedKind(object.reference().kind.clone()),
            ));
        }
        Ok(object.reference().clone())
    }

    /// Objects of `kind` carrying every tag; exactly one must remain
    async fn by_tags(&self, kind: ObjectKind, tags: &BTreeMap<String, String>) -> Result<MoRef> {
        let mut candidates: Option<BTreeSet<MoRef>> = None;
        for (category, tag) in tags {
            let attached: BTreeSet<MoRef> = self
                .objects_with_tag(category_for_label(category), tag)
                .await?
                .into_iter()
                .filter(|r| PlatformObject::from(r.clone()).is(kind))
                .collect();
            candidates = Some(match candidates {
                Some(previous) => previous.intersection(&attached).cloned().collect(),
                None => attached,
            });
        }
        let mut candidates: Vec<MoRef> = candidates.unwrap_or_default().into_iter().collect();
        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            0 => Err(OperatorError::resolution(
                kind.to_string(),
                ResolutionFailure::NotFound(describe_tags(tags)),
            )),
            n => Err(OperatorError::resolution(kind.to_string(), ResolutionFailure::Ambiguous(n))),
        }
    }

    async fn objects_with_tag(&self, category: &str, tag: &str) -> Result<Vec<MoRef>> {
        let Some(category) = self.tags.find_category(category).await? else {
            return Ok(Vec::new());
        };
        match self.tags.find_tag(tag, &category.id).await? {
            Some(tag) => self.api.attached_objects(&tag.id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn item(&self, reference: MoRef) -> Result<InventoryItem> {
        let name = self.api.object_name(&reference).await?;
        Ok(InventoryItem { reference, name })
    }
}

pub fn folder_path(dc: &InventoryItem, path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        format!("/{}/vm", dc.name)
    } else {
        format!("/{}/vm/{}", dc.name, path)
    }
}

fn describe_tags(tags: &BTreeMap<String, String>) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
