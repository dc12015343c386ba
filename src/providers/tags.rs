//! Category and tag management for instances.
//!
//! Creation is get-or-create. Two writers racing on a new category or tag
//! may both try to create it; the loser's create fails on the platform's
//! uniqueness check and it re-reads the winner's object.

use super::finder::{category_for_label, label_for_category};
use crate::error::{OperatorError, Result};
use crate::vsphere::{Category, MoRef, Tag, VsphereApi};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const CATEGORY_DESCRIPTION: &str = "Karpenter managed category";
const TAG_DESCRIPTION: &str = "karpenter managed tag";
const CATEGORY_CARDINALITY: &str = "MULTIPLE";
const CATEGORY_ASSOCIABLE_TYPE: &str = "VirtualMachine";

#[derive(Clone)]
pub struct TagManager {
    api: Arc<dyn VsphereApi>,
}

impl TagManager {
    pub fn new(api: Arc<dyn VsphereApi>) -> Self {
        Self { api }
    }

    /// Ensures a tag exists for every entry and returns the tag ids
    pub async fn ensure_tags(&self, tags: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(tags.len());
        for (key, value) in tags {
            let category_id = self.ensure_category(category_for_label(key)).await?;
            let tag_id = self.ensure_tag(value, &category_id).await.map_err(|e| {
                OperatorError::Platform(format!("failed to create or get tag {}: {}", value, e))
            })?;
            ids.push(tag_id);
        }
        Ok(ids)
    }

    /// Ensures and attaches every tag to `object`
    pub async fn tag_object(&self, object: &MoRef, tags: &BTreeMap<String, String>) -> Result<()> {
        for tag_id in self.ensure_tags(tags).await? {
            self.api.attach_tag(&tag_id, object).await?;
        }
        Ok(())
    }

    /// Label key to tag name for every tag attached to `object`
    pub async fn tags_of(&self, object: &MoRef) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for tag_id in self.api.attached_tags(object).await? {
            let tag = self.api.tag(&tag_id).await?;
            let category = self.api.category(&tag.category_id).await?;
            out.insert(label_for_category(&category.name).to_string(), tag.name);
        }
        Ok(out)
    }

    pub async fn find_category(&self, name: &str) -> Result<Option<Category>> {
        for id in self.api.list_categories().await? {
            let category = self.api.category(&id).await?;
            if category.name == name {
                return Ok(Some(category));
            }
        }
        Ok(None)
    }

    pub async fn find_tag(&self, name: &str, category_id: &str) -> Result<Option<Tag>> {
        for id in self.api.list_tags_for_category(category_id).await? {
            let tag = self.api.tag(&id).await?;
            if tag.name == name {
                return Ok(Some(tag));
            }
        }
        Ok(None)
    }

    async fn ensure_category(&self, name: &str) -> Result<String> {
        if let Some(category) = self.find_category(name).await? {
            return Ok(category.id);
        }
        let spec = Category {
            id: String::new(),
            name: name.to_string(),
            description: CATEGORY_DESCRIPTION.to_string(),
            cardinality: CATEGORY_CARDINALITY.to_string(),
            associable_types: vec![CATEGORY_ASSOCIABLE_TYPE.to_string()],
        };
        match self.api.create_category(&spec).await {
            Ok(id) => {
                debug!(category = name, "Created tag category");
                Ok(id)
            }
            Err(create_err) => match self.find_category(name).await? {
                Some(category) => Ok(category.id),
                None => {
                    warn!(category = name, error = %create_err, "Failed to create tag category");
                    Err(OperatorError::Platform(format!(
                        "failed to create vsphere category {}: {}",
                        name, create_err
                    )))
                }
            },
        }
    }

    async fn ensure_tag(&self, name: &str, category_id: &str) -> Result<String> {
        if let Some(tag) = self.find_tag(name, category_id).await? {
            return Ok(tag.id);
        }
        let spec = Tag {
            id: String::new(),
            name: name.to_string(),
            description: TAG_DESCRIPTION.to_string(),
            category_id: category_id.to_string(),
        };
        match self.api.create_tag(&spec).await {
            Ok(id) => Ok(id),
            Err(create_err) => match self.find_tag(name, category_id).await? {
                Some(tag) => Ok(tag.id),
                None => Err(create_err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::labels::{CLUSTER_NAME_TAG_KEY, LABEL_TOPOLOGY_ZONE, ZONE_TAG_CATEGORY};
    use crate::vsphere::fake::FakeVsphere;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_ensure_tags_is_idempotent() {
        let fake = Arc::new(FakeVsphere::new());
        let manager = TagManager::new(fake.clone());
        let wanted = tags(&[(CLUSTER_NAME_TAG_KEY, "demo"), ("team", "a")]);

        let first = manager.ensure_tags(&wanted).await.unwrap();
        let second = manager.ensure_tags(&wanted).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);

        let category = fake.category_named(CLUSTER_NAME_TAG_KEY).unwrap();
        assert_eq!(category.cardinality, "MULTIPLE");
        assert_eq!(category.associable_types, vec!["VirtualMachine".to_string()]);
        assert_eq!(category.description, "Karpenter managed category");
    }

    #[tokio::test]
    async fn test_zone_is_normalised_both_ways() {
        let fake = Arc::new(FakeVsphere::new());
        let vm = fake.add_vm("/vm-1", Default::default());
        let manager = TagManager::new(fake.clone());

        manager
            .tag_object(&vm, &tags(&[(LABEL_TOPOLOGY_ZONE, "east"), ("team", "a")]))
            .await
            .unwrap();

        let stored = fake.tags_of(&vm);
        assert_eq!(stored.get(ZONE_TAG_CATEGORY).map(String::as_str), Some("east"));
        assert!(!stored.contains_key(LABEL_TOPOLOGY_ZONE));

        let read = manager.tags_of(&vm).await.unwrap();
        assert_eq!(read, tags(&[(LABEL_TOPOLOGY_ZONE, "east"), ("team", "a")]));
    }

    #[tokio::test]
    async fn test_existing_tags_are_reused() {
        let fake = Arc::new(FakeVsphere::new());
        let other = fake.add_vm("/other", Default::default());
        fake.tag_object("team", "a", &other);
        let vm = fake.add_vm("/vm-1", Default::default());

        let manager = TagManager::new(fake.clone());
        manager.tag_object(&vm, &tags(&[("team", "a")])).await.unwrap();
        assert_eq!(manager.tags_of(&vm).await.unwrap(), manager.tags_of(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrently_created_tag_is_reused() {
        let fake = Arc::new(FakeVsphere::new());
        let other = fake.add_vm("/other", Default::default());
        fake.tag_object("team", "a", &other);
        let existing = fake.tag_named("a").unwrap();
        // Created by another writer after our lookups listed
        fake.hide_category("team", 1);
        fake.hide_tag("a", 1);

        let manager = TagManager::new(fake.clone());
        let ids = manager.ensure_tags(&tags(&[("team", "a")])).await.unwrap();

        assert_eq!(ids, vec![existing.id]);
        assert_eq!(fake.category_count(), 1);
        assert_eq!(fake.tag_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_create_without_existing_object_is_an_error() {
        let fake = Arc::new(FakeVsphere::new());
        let other = fake.add_vm("/other", Default::default());
        fake.tag_object("team", "a", &other);
        let manager = TagManager::new(fake.clone());

        fake.hide_category("team", 2);
        let err = manager.ensure_tags(&tags(&[("team", "a")])).await.unwrap_err();
        assert!(matches!(err, OperatorError::Platform(ref msg) if msg.contains("category team")), "{err}");

        fake.hide_tag("a", 2);
        let err = manager.ensure_tags(&tags(&[("team", "a")])).await.unwrap_err();
        assert!(matches!(err, OperatorError::Platform(ref msg) if msg.contains("tag a")), "{err}");

        assert_eq!(fake.category_count(), 1);
        assert_eq!(fake.tag_count(), 1);
    }
}
