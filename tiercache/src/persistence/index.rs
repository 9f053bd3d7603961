//! Partition catalog, startup discovery and the sidecar fast-path
//!
//! Discovery is defined exactly once: a single pass over the configured
//! directory with a strongly-typed filename parser. Files that fail the
//! metadata-only footer check are logged and excluded, never deleted.
//! Two files parsing to the same partition id halt initialization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::partition;
use super::types::{CorruptPartition, DiscoveryReport, PartitionMeta, RowOp};
use crate::core::error::{CacheError, Result};
use crate::core::types::{KeyTable, RowLocation};

/// Sidecar index file name inside the partition directory
pub(crate) const SIDECAR_FILE: &str = "index.json";

/// Canonical file name for a partition id
pub fn partition_filename(id: u64) -> String {
    format!("cache_{id:06}.part")
}

/// Parse a partition id out of a candidate file name.
/// Tolerates non-canonical zero padding, which is exactly why duplicate
/// ids must halt discovery instead of overwriting each other.
pub fn parse_partition_filename(name: &str) -> Option<u64> {
    let stem = name.strip_prefix("cache_")?.strip_suffix(".part")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Ordered catalog of finalized partitions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionIndex {
    partitions: HashMap<u64, PartitionMeta>,
    /// Ascending ids; the only supported traversal order
    ordered: Vec<u64>,
}

impl PartitionIndex {
    pub fn insert(&mut self, meta: PartitionMeta) {
        let id = meta.id;
        if self.partitions.insert(id, meta).is_none() {
            let pos = self.ordered.binary_search(&id).unwrap_or_else(|p| p);
            self.ordered.insert(pos, id);
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<PartitionMeta> {
        self.ordered.retain(|&i| i != id);
        self.partitions.remove(&id)
    }

    pub fn lookup(&self, id: u64) -> Option<&PartitionMeta> {
        self.partitions.get(&id)
    }

    /// Iterate partitions in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &PartitionMeta> {
        self.ordered.iter().map(|id| &self.partitions[id])
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn max_id(&self) -> Option<u64> {
        self.ordered.last().copied()
    }

    pub fn disk_bytes(&self) -> u64 {
        self.partitions.values().map(|m| m.size_bytes).sum()
    }
}

/// Copy-on-write handle to the partition catalog.
/// Readers take an `Arc` snapshot and never observe a half-updated
/// catalog; writers publish a fresh copy.
#[derive(Clone)]
pub struct SharedIndex {
    inner: Arc<RwLock<Arc<PartitionIndex>>>,
}

impl SharedIndex {
    pub fn new(index: PartitionIndex) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(index))),
        }
    }

    pub fn snapshot(&self) -> Arc<PartitionIndex> {
        self.inner.read().clone()
    }

    pub fn publish_insert(&self, meta: PartitionMeta) {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        next.insert(meta);
        *guard = Arc::new(next);
    }

    pub fn publish_remove(&self, id: u64) {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        next.remove(id);
        *guard = Arc::new(next);
    }
}

/// Everything `discover` hands back to the controller
#[derive(Debug)]
pub struct Discovery {
    pub index: PartitionIndex,
    pub keys: KeyTable,
    pub report: DiscoveryReport,
    /// First id the store may allocate; accounts for excluded files so a
    /// quarantined id is never reused
    pub next_id: u64,
}

/// Scan the directory once at startup and build the partition catalog
/// plus the key -> location table.
pub async fn discover(directory: &Path) -> Result<Discovery> {
    tokio::fs::create_dir_all(directory).await?;

    let mut candidates: HashMap<u64, PathBuf> = HashMap::new();
    let mut scanned = 0usize;
    let mut dir = tokio::fs::read_dir(directory).await?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(id) = parse_partition_filename(name) else {
            if name != SIDECAR_FILE && !name.ends_with(".tmp") {
                debug!("ignoring unrecognized file {:?}", path);
            }
            continue;
        };
        scanned += 1;
        if let Some(first) = candidates.get(&id) {
            return Err(CacheError::PartitionIdConflict {
                id,
                first: first.clone(),
                second: path,
            });
        }
        candidates.insert(id, path);
    }

    let max_candidate = candidates.keys().max().copied();
    let mut ids: Vec<u64> = candidates.keys().copied().collect();
    ids.sort_unstable();

    let mut index = PartitionIndex::default();
    let mut report = DiscoveryReport {
        scanned,
        ..Default::default()
    };

    for id in ids {
        let path = &candidates[&id];
        match partition::read_meta(path, id).await {
            Ok(meta) => index.insert(meta),
            Err(err) if Some(id) == max_candidate => {
                // The maximum id without a footer is the crashed active
                // partition; recover its checksummed row prefix
                match salvage(path, id).await {
                    Ok(Some(meta)) => {
                        report.salvaged = Some(id);
                        index.insert(meta);
                    }
                    Ok(None) => {
                        warn!("excluding partition file {:?}: {}", path, err);
                        report.corrupt.push(CorruptPartition {
                            id: Some(id),
                            path: path.clone(),
                            reason: err.to_string(),
                        });
                    }
                    Err(salvage_err) => {
                        warn!("excluding partition file {:?}: {}", path, salvage_err);
                        report.corrupt.push(CorruptPartition {
                            id: Some(id),
                            path: path.clone(),
                            reason: salvage_err.to_string(),
                        });
                    }
                }
            }
            Err(err) => {
                warn!("excluding partition file {:?}: {}", path, err);
                report.corrupt.push(CorruptPartition {
                    id: Some(id),
                    path: path.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    let next_id = max_candidate.map(|m| m + 1).unwrap_or(1);

    let keys = match load_sidecar(directory, &index).await {
        Ok(Some(keys)) => {
            report.sidecar_used = true;
            keys
        }
        Ok(None) => rebuild_keys(&mut index, &mut report).await?,
        Err(e) => {
            warn!("sidecar index unreadable, rebuilding: {}", e);
            rebuild_keys(&mut index, &mut report).await?
        }
    };

    info!(
        "discovered {} partition(s), {} excluded, {} key(s)",
        index.len(),
        report.corrupt.len(),
        keys.len()
    );

    Ok(Discovery {
        index,
        keys,
        report,
        next_id,
    })
}

async fn salvage(path: &Path, id: u64) -> Result<Option<PartitionMeta>> {
    let rows = partition::salvage_rows(path, id).await?;
    if rows.is_empty() {
        return Ok(None);
    }
    let meta = partition::finalize_salvaged(path, id, &rows).await?;
    warn!(
        "salvaged unfinalized partition {} ({} rows recovered)",
        id,
        meta.row_count
    );
    Ok(Some(meta))
}

/// Rebuild the key table by replaying every partition's rows in
/// ascending id order; later rows win and tombstones clear.
async fn rebuild_keys(
    index: &mut PartitionIndex,
    report: &mut DiscoveryReport,
) -> Result<KeyTable> {
    let mut keys = KeyTable::default();
    let metas: Vec<PartitionMeta> = index.iter().cloned().collect();

    for meta in metas {
        let scan = async {
            let (footer, _) = partition::read_footer(&meta.path, meta.id).await?;
            partition::scan_rows(&meta.path, meta.id, &footer).await
        }
        .await;

        match scan {
            Ok(rows) => {
                for (offset, row) in rows {
                    match row.op {
                        RowOp::Put { key, .. } => {
                            keys.insert(
                                key,
                                RowLocation {
                                    partition_id: meta.id,
                                    offset,
                                },
                            );
                        }
                        RowOp::Delete { key } => {
                            keys.remove(&key);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    "excluding partition {} during index rebuild: {}",
                    meta.id, e
                );
                index.remove(meta.id);
                keys.retain(|_, loc| loc.partition_id != meta.id);
                report.corrupt.push(CorruptPartition {
                    id: Some(meta.id),
                    path: meta.path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(keys)
}

#[derive(Debug, Serialize, Deserialize)]
struct SidecarFile {
    partitions: Vec<SidecarPartition>,
    keys: HashMap<String, RowLocation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SidecarPartition {
    id: u64,
    size_bytes: u64,
    row_count: u64,
}

/// Load the sidecar key table if it exactly matches the partitions the
/// directory scan just validated; anything else means stale.
async fn load_sidecar(directory: &Path, index: &PartitionIndex) -> Result<Option<KeyTable>> {
    let path = directory.join(SIDECAR_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let contents = tokio::fs::read_to_string(&path).await?;
    let sidecar: SidecarFile =
        serde_json::from_str(&contents).map_err(|e| CacheError::Serialization(e.to_string()))?;

    if sidecar.partitions.len() != index.len() {
        debug!("sidecar index stale (partition set changed), falling back to full scan");
        return Ok(None);
    }
    for p in &sidecar.partitions {
        match index.lookup(p.id) {
            Some(meta) if meta.size_bytes == p.size_bytes && meta.row_count == p.row_count => {}
            _ => {
                debug!("sidecar index stale (partition {} changed)", p.id);
                return Ok(None);
            }
        }
    }

    let mut keys = KeyTable::default();
    for (key, loc) in sidecar.keys {
        if index.lookup(loc.partition_id).is_some() {
            keys.insert(key, loc);
        }
    }
    debug!("loaded {} key(s) from sidecar index", keys.len());
    Ok(Some(keys))
}

/// Write the sidecar discovery fast-path, atomically.
/// Only keys that resolve to finalized partitions are recorded.
pub async fn write_sidecar(
    directory: &Path,
    index: &PartitionIndex,
    keys: &KeyTable,
) -> Result<()> {
    let sidecar = SidecarFile {
        partitions: index
            .iter()
            .map(|m| SidecarPartition {
                id: m.id,
                size_bytes: m.size_bytes,
                row_count: m.row_count,
            })
            .collect(),
        keys: keys
            .iter()
            .filter(|(_, loc)| index.lookup(loc.partition_id).is_some())
            .map(|(k, loc)| (k.clone(), *loc))
            .collect(),
    };
    let json = serde_json::to_string_pretty(&sidecar)
        .map_err(|e| CacheError::Serialization(e.to_string()))?;

    let path = directory.join(SIDECAR_FILE);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionConfig, Compressor};
    use crate::config::PartitionConfig;
    use crate::persistence::partition::PartitionStore;
    use tempfile::tempdir;

    #[test]
    fn test_filename_parse() {
        assert_eq!(parse_partition_filename("cache_000001.part"), Some(1));
        assert_eq!(parse_partition_filename("cache_42.part"), Some(42));
        assert_eq!(parse_partition_filename("cache_.part"), None);
        assert_eq!(parse_partition_filename("cache_12.part.tmp"), None);
        assert_eq!(parse_partition_filename("snapshot_12.part"), None);
        assert_eq!(parse_partition_filename("cache_12a.part"), None);
        assert_eq!(parse_partition_filename("index.json"), None);
        assert_eq!(partition_filename(7), "cache_000007.part");
    }

    async fn populate(directory: &Path, partitions: u32, rows_per: u32) {
        let mut store = PartitionStore::new(
            directory.to_path_buf(),
            PartitionConfig {
                max_rows: rows_per as u64,
                max_bytes: 1024 * 1024,
                flush_rows: 1,
                flush_bytes: 1024 * 1024,
            },
            Compressor::new(CompressionConfig::default()),
            SharedIndex::new(Default::default()),
            1,
        );
        for p in 0..partitions {
            for r in 0..rows_per {
                store
                    .append_put(&format!("cid-{}-{}", p, r), vec![r as u8; 24])
                    .await
                    .unwrap();
            }
        }
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_empty_directory() {
        let dir = tempdir().unwrap();
        let discovery = discover(dir.path()).await.unwrap();
        assert!(discovery.index.is_empty());
        assert!(discovery.keys.is_empty());
        assert_eq!(discovery.next_id, 1);
    }

    #[tokio::test]
    async fn test_discover_and_rebuild_keys() {
        let dir = tempdir().unwrap();
        populate(dir.path(), 2, 3).await;

        let discovery = discover(dir.path()).await.unwrap();
        assert_eq!(discovery.index.len(), 2);
        assert_eq!(discovery.keys.len(), 6);
        assert_eq!(discovery.next_id, 3);
        assert!(!discovery.report.sidecar_used);

        let loc = discovery.keys.get("cid-1-2").unwrap();
        let row = partition::read_row(
            &discovery.index.lookup(loc.partition_id).unwrap().path,
            loc.partition_id,
            loc.offset,
        )
        .await
        .unwrap();
        assert_eq!(row.key(), "cid-1-2");
    }

    #[tokio::test]
    async fn test_discover_is_idempotent() {
        let dir = tempdir().unwrap();
        populate(dir.path(), 2, 2).await;

        let first = discover(dir.path()).await.unwrap();
        let second = discover(dir.path()).await.unwrap();
        assert_eq!(first.index, second.index);
        assert_eq!(first.next_id, second.next_id);
        assert_eq!(first.keys.len(), second.keys.len());
    }

    #[tokio::test]
    async fn test_corrupt_partition_excluded_not_deleted() {
        let dir = tempdir().unwrap();
        populate(dir.path(), 3, 2).await;

        // Truncate the footer of a non-maximal partition
        let victim = dir.path().join(partition_filename(1));
        let bytes = std::fs::read(&victim).unwrap();
        std::fs::write(&victim, &bytes[..bytes.len() - 10]).unwrap();

        let discovery = discover(dir.path()).await.unwrap();
        assert_eq!(discovery.index.len(), 2);
        assert!(discovery.index.lookup(1).is_none());
        assert!(discovery.index.lookup(2).is_some());
        assert!(discovery.index.lookup(3).is_some());
        assert_eq!(discovery.report.corrupt.len(), 1);
        assert_eq!(discovery.report.corrupt[0].id, Some(1));
        // Quarantined ids are never reallocated
        assert_eq!(discovery.next_id, 4);
        // And the file stays on disk for manual recovery
        assert!(victim.exists());
    }

    #[tokio::test]
    async fn test_id_conflict_halts_discovery() {
        let dir = tempdir().unwrap();
        populate(dir.path(), 1, 2).await;

        // A second spelling of partition 1
        std::fs::copy(
            dir.path().join(partition_filename(1)),
            dir.path().join("cache_1.part"),
        )
        .unwrap();

        let err = discover(dir.path()).await.unwrap_err();
        assert!(matches!(err, CacheError::PartitionIdConflict { id: 1, .. }));
    }

    #[tokio::test]
    async fn test_salvage_of_crashed_active_partition() {
        let dir = tempdir().unwrap();
        populate(dir.path(), 1, 2).await;

        // Simulate a crash: durable rows in the max-id file, no footer
        let mut store = PartitionStore::new(
            dir.path().to_path_buf(),
            PartitionConfig {
                max_rows: 100,
                max_bytes: 1024 * 1024,
                flush_rows: 1,
                flush_bytes: 1024 * 1024,
            },
            Compressor::new(CompressionConfig::default()),
            SharedIndex::new(Default::default()),
            2,
        );
        store.append_put("crashed-1", b"x".to_vec()).await.unwrap();
        store.append_put("crashed-2", b"y".to_vec()).await.unwrap();
        drop(store);

        let discovery = discover(dir.path()).await.unwrap();
        assert_eq!(discovery.report.salvaged, Some(2));
        assert_eq!(discovery.index.len(), 2);
        assert_eq!(discovery.index.lookup(2).unwrap().row_count, 2);
        assert!(discovery.keys.contains_key("crashed-2"));
        assert_eq!(discovery.next_id, 3);
    }

    #[tokio::test]
    async fn test_sidecar_fast_path_and_staleness() {
        let dir = tempdir().unwrap();
        populate(dir.path(), 2, 2).await;

        let first = discover(dir.path()).await.unwrap();
        assert!(!first.report.sidecar_used);
        write_sidecar(dir.path(), &first.index, &first.keys)
            .await
            .unwrap();

        let second = discover(dir.path()).await.unwrap();
        assert!(second.report.sidecar_used);
        assert_eq!(second.keys.len(), first.keys.len());

        // Removing a partition file makes the sidecar stale
        std::fs::remove_file(dir.path().join(partition_filename(1))).unwrap();
        let third = discover(dir.path()).await.unwrap();
        assert!(!third.report.sidecar_used);
        assert_eq!(third.index.len(), 1);
        assert!(third.keys.keys().all(|k| k.starts_with("cid-1-")));
    }
}
