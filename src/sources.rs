//! Catalog of the content items embeddings are generated from.
//!
//! Items are registered by the caller (the extension pushes an extracted page
//! or video) and referenced by `sourceRefId`. The whole catalog lives in
//! memory and is rewritten to `sources.json` on every change.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::{OwnerId, RecordId};
use crate::storage::{BackendLocal, StorageManager};

const SOURCES_FILE: &str = "sources.json";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{0}")]
    Invalid(String),

    #[error("source {0} belongs to another owner")]
    Conflict(String),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// What kind of item a source is, with the fields logic actually reads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SourceMetadata {
    YoutubeVideo {
        video_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
    },
    WebPage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        site_name: Option<String>,
    },
    #[default]
    Note,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceItem {
    pub id: String,
    pub owner_id: OwnerId,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub summary: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: SourceMetadata,

    /// Provider specific attributes nothing branches on
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSource {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub metadata: SourceMetadata,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl NewSource {
    fn validate(&self) -> Result<(), SourceError> {
        if self.title.trim().is_empty() {
            return Err(SourceError::Invalid("title is required".to_string()));
        }
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(SourceError::Invalid("id must not be empty".to_string()));
            }
        }
        if let Some(raw) = &self.url {
            let parsed = url::Url::parse(raw)
                .map_err(|e| SourceError::Invalid(format!("invalid url {raw}: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SourceError::Invalid(format!(
                    "unsupported url scheme {}",
                    parsed.scheme()
                )));
            }
        }
        if let SourceMetadata::YoutubeVideo { video_id, .. } = &self.metadata {
            if video_id.trim().is_empty() {
                return Err(SourceError::Invalid("videoId is required".to_string()));
            }
        }
        Ok(())
    }
}

pub struct SourceCatalog {
    /// `None` keeps the catalog in memory only.
    storage: Option<BackendLocal>,
    items: RwLock<HashMap<String, SourceItem>>,
}

impl SourceCatalog {
    pub fn in_memory() -> Self {
        Self {
            storage: None,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn open(base_path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let storage = BackendLocal::new(base_path)?;

        let mut items = HashMap::new();
        if storage.exists(SOURCES_FILE) {
            let data = storage.read(SOURCES_FILE)?;
            let list: Vec<SourceItem> = serde_json::from_slice(&data)?;
            for item in list {
                items.insert(item.id.clone(), item);
            }
        }
        log::info!("Loaded {} sources", items.len());

        Ok(Self {
            storage: Some(storage),
            items: RwLock::new(items),
        })
    }

    fn save(&self, items: &HashMap<String, SourceItem>) -> Result<(), SourceError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let mut list: Vec<&SourceItem> = items.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        storage.write(SOURCES_FILE, &serde_json::to_vec(&list)?)?;
        Ok(())
    }

    /// Register a new item, or replace the caller's existing item with the same id.
    pub fn register(&self, owner: &OwnerId, new: NewSource) -> Result<SourceItem, SourceError> {
        new.validate()?;

        let mut items = self
            .items
            .write()
            .map_err(|e| SourceError::Internal(format!("Lock poisoned: {}", e)))?;

        // ids are looked up trimmed everywhere else
        let id = match &new.id {
            Some(id) => id.trim().to_string(),
            None => RecordId::new().to_string(),
        };
        let created_at = match items.get(&id) {
            Some(existing) if &existing.owner_id != owner => {
                return Err(SourceError::Conflict(id));
            }
            Some(existing) => existing.created_at,
            None => Utc::now(),
        };

        let item = SourceItem {
            id: id.clone(),
            owner_id: owner.clone(),
            title: new.title.trim().to_string(),
            url: new.url,
            summary: new.summary,
            created_at,
            metadata: new.metadata,
            extra: new.extra,
        };
        let previous = items.insert(id.clone(), item.clone());
        if let Err(e) = self.save(&items) {
            match previous {
                Some(previous) => items.insert(id, previous),
                None => items.remove(&id),
            };
            return Err(e);
        }

        Ok(item)
    }

    /// The item, if it exists and belongs to `owner`.
    pub fn get(&self, owner: &OwnerId, id: &str) -> Result<Option<SourceItem>, SourceError> {
        let items = self
            .items
            .read()
            .map_err(|e| SourceError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(items.get(id).filter(|item| &item.owner_id == owner).cloned())
    }

    /// Look up several items at once, skipping unknown or foreign ids.
    pub fn get_many<'a>(
        &self,
        owner: &OwnerId,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<HashMap<String, SourceItem>, SourceError> {
        let items = self
            .items
            .read()
            .map_err(|e| SourceError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(ids
            .into_iter()
            .filter_map(|id| items.get(id))
            .filter(|item| &item.owner_id == owner)
            .map(|item| (item.id.clone(), item.clone()))
            .collect())
    }

    pub fn list(&self, owner: &OwnerId) -> Result<Vec<SourceItem>, SourceError> {
        let items = self
            .items
            .read()
            .map_err(|e| SourceError::Internal(format!("Lock poisoned: {}", e)))?;
        let mut list: Vec<SourceItem> = items
            .values()
            .filter(|item| &item.owner_id == owner)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    /// Remove the caller's item. Foreign items are reported as absent.
    pub fn remove(&self, owner: &OwnerId, id: &str) -> Result<Option<SourceItem>, SourceError> {
        let mut items = self
            .items
            .write()
            .map_err(|e| SourceError::Internal(format!("Lock poisoned: {}", e)))?;

        match items.get(id) {
            Some(item) if &item.owner_id == owner => {}
            _ => return Ok(None),
        }
        let Some(removed) = items.remove(id) else {
            return Ok(None);
        };
        if let Err(e) = self.save(&items) {
            items.insert(removed.id.clone(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: &str) -> NewSource {
        NewSource {
            id: Some(id.to_string()),
            title: "Rust ownership".to_string(),
            url: Some("https://example.com/ownership".to_string()),
            summary: "borrowing explained".to_string(),
            metadata: SourceMetadata::WebPage {
                site_name: Some("example".to_string()),
            },
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_register_and_get_is_owner_scoped() {
        let catalog = SourceCatalog::in_memory();
        let alice = OwnerId::new("alice");
        let bob = OwnerId::new("bob");

        catalog.register(&alice, page("s1")).unwrap();

        assert!(catalog.get(&alice, "s1").unwrap().is_some());
        assert!(catalog.get(&bob, "s1").unwrap().is_none());
        assert!(catalog.list(&bob).unwrap().is_empty());
        assert!(catalog.remove(&bob, "s1").unwrap().is_none());
        assert!(catalog.get(&alice, "s1").unwrap().is_some());
    }

    #[test]
    fn test_foreign_id_conflicts() {
        let catalog = SourceCatalog::in_memory();
        catalog.register(&OwnerId::new("alice"), page("s1")).unwrap();
        let err = catalog.register(&OwnerId::new("bob"), page("s1")).unwrap_err();
        assert!(matches!(err, SourceError::Conflict(_)));
    }

    #[test]
    fn test_reregister_keeps_created_at() {
        let catalog = SourceCatalog::in_memory();
        let alice = OwnerId::new("alice");
        let first = catalog.register(&alice, page("s1")).unwrap();

        let mut update = page("s1");
        update.title = "Rust borrowing".to_string();
        let second = catalog.register(&alice, update).unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.title, "Rust borrowing");
        assert_eq!(catalog.list(&alice).unwrap().len(), 1);
    }

    #[test]
    fn test_validation() {
        let catalog = SourceCatalog::in_memory();
        let alice = OwnerId::new("alice");

        let mut bad = page("s1");
        bad.url = Some("not a url".to_string());
        assert!(matches!(catalog.register(&alice, bad), Err(SourceError::Invalid(_))));

        let mut bad = page("s1");
        bad.url = Some("ftp://example.com/file".to_string());
        assert!(matches!(catalog.register(&alice, bad), Err(SourceError::Invalid(_))));

        let mut bad = page("s1");
        bad.title = "  ".to_string();
        assert!(matches!(catalog.register(&alice, bad), Err(SourceError::Invalid(_))));

        let mut bad = page("s1");
        bad.metadata = SourceMetadata::YoutubeVideo {
            video_id: String::new(),
            channel: None,
            duration_secs: None,
        };
        assert!(matches!(catalog.register(&alice, bad), Err(SourceError::Invalid(_))));
    }

    #[test]
    fn test_generated_id() {
        let catalog = SourceCatalog::in_memory();
        let mut new = page("unused");
        new.id = None;
        let item = catalog.register(&OwnerId::new("alice"), new).unwrap();
        assert_eq!(item.id.len(), 26);
    }

    #[test]
    fn test_persisted_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let alice = OwnerId::new("alice");
        {
            let catalog = SourceCatalog::open(tmp.path()).unwrap();
            catalog.register(&alice, page("s1")).unwrap();
            catalog.register(&alice, page("s2")).unwrap();
            catalog.remove(&alice, "s2").unwrap();
        }

        let catalog = SourceCatalog::open(tmp.path()).unwrap();
        let items = catalog.list(&alice).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "s1");
        assert_eq!(
            items[0].metadata,
            SourceMetadata::WebPage {
                site_name: Some("example".to_string())
            }
        );
    }

    #[test]
    fn test_ids_are_trimmed() {
        let catalog = SourceCatalog::in_memory();
        let alice = OwnerId::new("alice");
        let item = catalog.register(&alice, page("  s1 ")).unwrap();
        assert_eq!(item.id, "s1");
        assert!(catalog.get(&alice, "s1").unwrap().is_some());
    }

    #[test]
    fn test_failed_save_leaves_catalog_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("data");
        let parked = tmp.path().join("parked");
        let alice = OwnerId::new("alice");

        let catalog = SourceCatalog::open(&base).unwrap();
        catalog.register(&alice, page("s1")).unwrap();

        // a plain file where the data dir was makes every write fail
        std::fs::rename(&base, &parked).unwrap();
        std::fs::write(&base, b"").unwrap();

        assert!(catalog.register(&alice, page("s2")).is_err());
        assert!(catalog.get(&alice, "s2").unwrap().is_none());
        assert!(catalog.remove(&alice, "s1").is_err());
        assert!(catalog.get(&alice, "s1").unwrap().is_some());

        std::fs::remove_file(&base).unwrap();
        std::fs::rename(&parked, &base).unwrap();

        assert!(catalog.remove(&alice, "s1").unwrap().is_some());
        let reopened = SourceCatalog::open(&base).unwrap();
        assert!(reopened.list(&alice).unwrap().is_empty());
    }

    #[test]
    fn test_metadata_wire_format() {
        let json = serde_json::json!({
            "title": "Talk",
            "metadata": { "kind": "youtubeVideo", "videoId": "abc123", "durationSecs": 61 }
        });
        let new: NewSource = serde_json::from_value(json).unwrap();
        assert_eq!(
            new.metadata,
            SourceMetadata::YoutubeVideo {
                video_id: "abc123".to_string(),
                channel: None,
                duration_secs: Some(61),
            }
        );
    }
}
