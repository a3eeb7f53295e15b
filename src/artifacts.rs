use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{Result, ScanError};

/// A rendered overlay, stored as the exact PNG bytes served to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayArtifact {
    pub id: Uuid,
    pub png: Bytes,
    pub created_at: DateTime<Utc>,
}

impl OverlayArtifact {
    pub fn new(png: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            png: png.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    by_id: HashMap<Uuid, Arc<OverlayArtifact>>,
    order: VecDeque<Uuid>,
    latest: Option<Arc<OverlayArtifact>>,
}

/// Bounded in-memory store of overlays keyed by request id.
///
/// Oldest entries are evicted first. When a mask path is configured every
/// insert also overwrites that file (last write wins).
#[derive(Debug)]
pub struct ArtifactStore {
    inner: RwLock<StoreInner>,
    capacity: usize,
    mask_path: Option<PathBuf>,
}

impl ArtifactStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            capacity: capacity.max(1),
            mask_path: None,
        }
    }

    pub fn with_mask_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mask_path = Some(path.into());
        self
    }

    pub fn insert(&self, artifact: OverlayArtifact) -> Result<Arc<OverlayArtifact>> {
        if let Some(path) = &self.mask_path {
            fs::write(path, &artifact.png).map_err(|e| ScanError::FileSystem {
                path: path.clone(),
                operation: "overlay write".to_string(),
                source: e,
            })?;
        }

        let artifact = Arc::new(artifact);
        let mut inner = self.inner.write();
        inner.by_id.insert(artifact.id, Arc::clone(&artifact));
        inner.order.push_back(artifact.id);
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.by_id.remove(&evicted);
                debug!(id = %evicted, "evicted overlay");
            }
        }
        inner.latest = Some(Arc::clone(&artifact));
        Ok(artifact)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<OverlayArtifact>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn latest(&self) -> Option<Arc<OverlayArtifact>> {
        self.inner.read().latest.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_latest_returns_exact_bytes() -> Result<()> {
        let store = ArtifactStore::new(4);
        assert!(store.latest().is_none());

        let stored = store.insert(OverlayArtifact::new(vec![1u8, 2, 3]))?;
        let latest = store.latest().unwrap();
        assert_eq!(latest.png.as_ref(), &[1, 2, 3]);
        assert_eq!(latest.id, stored.id);
        Ok(())
    }

    #[test]
    fn test_request_scoped_lookup() -> Result<()> {
        let store = ArtifactStore::new(4);
        let first = store.insert(OverlayArtifact::new(vec![1u8]))?;
        let second = store.insert(OverlayArtifact::new(vec![2u8]))?;

        assert_eq!(store.get(&first.id).unwrap().png.as_ref(), &[1]);
        assert_eq!(store.get(&second.id).unwrap().png.as_ref(), &[2]);
        assert_eq!(store.latest().unwrap().id, second.id);
        assert!(store.get(&Uuid::new_v4()).is_none());
        Ok(())
    }

    #[test]
    fn test_oldest_entries_are_evicted() -> Result<()> {
        let store = ArtifactStore::new(2);
        let ids = (0..3u8)
            .map(|i| store.insert(OverlayArtifact::new(vec![i])).map(|a| a.id))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(store.len(), 2);
        assert!(store.get(&ids[0]).is_none());
        assert!(store.get(&ids[1]).is_some());
        assert_eq!(store.latest().unwrap().id, ids[2]);
        Ok(())
    }

    #[test]
    fn test_mask_file_is_overwritten() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("output_mask.png");
        let store = ArtifactStore::new(4).with_mask_path(&path);

        store.insert(OverlayArtifact::new(vec![1u8, 1]))?;
        store.insert(OverlayArtifact::new(vec![2u8, 2, 2]))?;
        assert_eq!(fs::read(&path)?, vec![2, 2, 2]);
        Ok(())
    }

    #[test]
    fn test_mask_write_failure_is_reported() {
        let store = ArtifactStore::new(4).with_mask_path("/nonexistent/dir/output_mask.png");
        let result = store.insert(OverlayArtifact::new(vec![0u8]));
        assert!(matches!(result, Err(ScanError::FileSystem { .. })));
        assert!(store.latest().is_none());
    }
}
