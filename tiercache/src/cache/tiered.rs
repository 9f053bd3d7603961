//! Tiered cache controller
//!
//! Routes `get`/`put` between the ARC memory tier and the partition
//! store, promotes on disk hits, schedules write-behind flushes for
//! demoted entries and owns the key -> location table.
//!
//! A `TieredCache` is constructed once by the application's composition
//! root and shared by handle; there is no process-wide instance. It is
//! strictly an accelerator: every error out of `get` is safe to treat
//! as a miss and fall back to the primary content store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::arc::{ArcTier, Demoted};
use super::writer::{self, PendingTable, PendingWrite, WriteCommand, WriterContext};
use crate::compression::Compressor;
use crate::config::CacheConfig;
use crate::core::error::{CacheError, Result};
use crate::core::types::{CacheEntry, CacheStats, KeyTable, Lookup, PutOptions, Tier};
use crate::persistence::index::{self, SharedIndex};
use crate::persistence::partition::{self, PartitionStore};
use crate::persistence::types::{DiscoveryReport, Row, RowOp};

#[derive(Default)]
struct Counters {
    memory_hits: u64,
    disk_hits: u64,
    misses: u64,
}

/// Orchestrates the memory tier, the partition store and the secondary
/// lookup table
pub struct TieredCache {
    config: CacheConfig,
    compressor: Compressor,
    arc: Mutex<ArcTier>,
    counters: RwLock<Counters>,
    lookup: Arc<RwLock<KeyTable>>,
    pending: Arc<RwLock<PendingTable>>,
    store: Arc<tokio::sync::Mutex<PartitionStore>>,
    index: SharedIndex,
    report: DiscoveryReport,
    writer_tx: mpsc::Sender<WriteCommand>,
    writer_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl TieredCache {
    /// Discover existing partitions and open the cache for traffic.
    /// Discovery runs once, before any operation is accepted.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        let discovery = index::discover(&config.directory).await?;
        if !discovery.report.corrupt.is_empty() {
            warn!(
                "{} corrupt partition file(s) excluded from the index",
                discovery.report.corrupt.len()
            );
        }
        info!(
            "cache opened at {:?}: {} partition(s), {} key(s)",
            config.directory,
            discovery.index.len(),
            discovery.keys.len()
        );

        let shared = SharedIndex::new(discovery.index);
        let store = Arc::new(tokio::sync::Mutex::new(PartitionStore::new(
            config.directory.clone(),
            config.partition.clone(),
            Compressor::new(config.compression.clone()),
            shared.clone(),
            discovery.next_id,
        )));
        let lookup = Arc::new(RwLock::new(discovery.keys));
        let pending: Arc<RwLock<PendingTable>> = Arc::new(RwLock::new(PendingTable::default()));

        let (writer_tx, writer_rx) = mpsc::channel(config.queue_capacity.max(1));
        let ctx = WriterContext {
            store: store.clone(),
            lookup: lookup.clone(),
            pending: pending.clone(),
            index: shared.clone(),
            directory: config.directory.clone(),
        };
        let writer_task = tokio::spawn(writer::run_writer(ctx, writer_rx));

        Ok(Self {
            arc: Mutex::new(ArcTier::new(config.capacity)),
            compressor: Compressor::new(config.compression.clone()),
            config,
            counters: RwLock::new(Counters::default()),
            lookup,
            pending,
            store,
            index: shared,
            report: discovery.report,
            writer_tx,
            writer_task: Mutex::new(Some(writer_task)),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// What discovery saw at startup, successes and exclusions both
    pub fn discovery_report(&self) -> &DiscoveryReport {
        &self.report
    }

    /// Look a key up across the tiers. A disk hit promotes the value
    /// into the memory tier. `Miss` means the caller must consult the
    /// primary content store; the cache is never authoritative.
    pub async fn get(&self, key: &str) -> Result<Lookup> {
        self.ensure_open()?;

        // Memory tier
        let memory_hit = self.arc.lock().get(key);
        if let Some((value, tier)) = memory_hit {
            self.counters.write().memory_hits += 1;
            debug!("memory hit for {}", key);
            return Ok(Lookup::Hit(entry(key, value, tier)));
        }

        // Write-behind buffer: queued but not yet appended
        let buffered = self.pending.read().get(key).map(|p| p.value.clone());
        if let Some(value) = buffered {
            let demoted = self.arc.lock().put(key.to_string(), value.clone());
            self.queue_demotions(demoted).await?;
            self.counters.write().disk_hits += 1;
            debug!("write-buffer hit for {}", key);
            return Ok(Lookup::Hit(entry(key, value, Tier::Disk)));
        }

        // Disk tier via the secondary index
        let location = self.lookup.read().get(key).copied();
        if let Some(location) = location {
            match self.read_location(location).await {
                Ok(Some(Row {
                    op: RowOp::Put {
                        value, compression, ..
                    },
                    ..
                })) => {
                    let value = self.compressor.decompress(&value, compression)?;
                    let demoted = self.arc.lock().put(key.to_string(), value.clone());
                    self.queue_demotions(demoted).await?;
                    self.counters.write().disk_hits += 1;
                    debug!("disk hit for {} in partition {}", key, location.partition_id);
                    return Ok(Lookup::Hit(entry(key, value, Tier::Disk)));
                }
                Ok(Some(Row {
                    op: RowOp::Delete { .. },
                    ..
                }))
                | Ok(None) => {
                    // Stale mapping; drop it and fall through to a miss
                    self.lookup.write().remove(key);
                }
                Err(e) => {
                    if let CacheError::PartitionCorrupt { id, .. } = &e {
                        self.quarantine(*id);
                    }
                    return Err(e);
                }
            }
        }

        self.counters.write().misses += 1;
        Ok(Lookup::Miss)
    }

    /// Insert a value: the memory tier is updated synchronously and the
    /// write is enqueued for the background flusher. A full queue blocks
    /// here (backpressure) rather than dropping the write.
    pub async fn put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> Result<()> {
        self.ensure_open()?;

        if value.len() > self.config.max_entry_size {
            return Err(CacheError::EntryTooLarge {
                size: value.len(),
                max: self.config.max_entry_size,
            });
        }

        let demoted = self.arc.lock().put(key.to_string(), value.clone());

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.pending.write().insert(
            key.to_string(),
            PendingWrite {
                value: value.clone(),
                seq,
            },
        );

        let (ack_tx, ack_rx) = if opts.sync_flush {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.send(WriteCommand::Put {
            key: key.to_string(),
            value,
            seq,
            ack: ack_tx,
        })
        .await?;

        self.queue_demotions(demoted).await?;

        if let Some(rx) = ack_rx {
            rx.await.map_err(|_| CacheError::Closed)??;
        }
        Ok(())
    }

    /// Drop a key from every tier and persist a tombstone so it stays
    /// dead across restarts
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.ensure_open()?;

        self.arc.lock().remove(key);
        self.pending.write().remove(key);
        self.lookup.write().remove(key);
        self.send(WriteCommand::Delete {
            key: key.to_string(),
        })
        .await?;
        debug!("invalidated {}", key);
        Ok(())
    }

    /// Drain the write-behind queue and durably flush the active
    /// partition
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.send(WriteCommand::Flush { ack: tx }).await?;
        rx.await.map_err(|_| CacheError::Closed)?
    }

    /// Current counters and tier sizes
    pub async fn stats(&self) -> CacheStats {
        let (t1_len, t2_len, b1_len, b2_len, p, entries) = {
            let arc = self.arc.lock();
            (
                arc.t1_len(),
                arc.t2_len(),
                arc.b1_len(),
                arc.b2_len(),
                arc.p(),
                arc.len(),
            )
        };
        let snapshot = self.index.snapshot();
        let (active_rows, active_bytes) = {
            let store = self.store.lock().await;
            (store.active_rows(), store.active_bytes())
        };
        let counters = self.counters.read();
        CacheStats {
            memory_hits: counters.memory_hits,
            disk_hits: counters.disk_hits,
            misses: counters.misses,
            t1_len,
            t2_len,
            b1_len,
            b2_len,
            p,
            entries,
            partition_count: snapshot.len() + usize::from(active_rows > 0),
            disk_bytes: snapshot.disk_bytes() + active_bytes,
            pending_writes: self.pending.read().len(),
        }
    }

    /// Flush pending writes, finalize the active partition, write the
    /// sidecar and release the flusher. Every later call errors with
    /// `Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        if self.writer_tx.send(WriteCommand::Shutdown { ack: tx }).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.writer_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        {
            let mut store = self.store.lock().await;
            store.close().await?;
        }

        let snapshot = self.index.snapshot();
        let keys = self.lookup.read().clone();
        index::write_sidecar(&self.config.directory, &snapshot, &keys).await?;
        info!("cache closed ({} partition(s) on disk)", snapshot.len());
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send(&self, cmd: WriteCommand) -> Result<()> {
        self.writer_tx.send(cmd).await.map_err(|_| CacheError::Closed)
    }

    /// Entries demoted out of memory are flushed to the write buffer
    /// unless a durable or queued copy already exists
    async fn queue_demotions(&self, demoted: Vec<Demoted>) -> Result<()> {
        for d in demoted {
            let durable = self.lookup.read().contains_key(&d.key);
            if durable || self.pending.read().contains_key(&d.key) {
                continue;
            }
            debug!("demoting {} to the write-behind queue", d.key);
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            self.pending.write().insert(
                d.key.clone(),
                PendingWrite {
                    value: d.value.clone(),
                    seq,
                },
            );
            self.send(WriteCommand::Put {
                key: d.key,
                value: d.value,
                seq,
                ack: None,
            })
            .await?;
        }
        Ok(())
    }

    /// Resolve a row location: finalized partitions are read directly
    /// (never blocked by rotation), the active partition is served from
    /// its buffer under the store lock
    async fn read_location(&self, location: crate::core::types::RowLocation) -> Result<Option<Row>> {
        let snapshot = self.index.snapshot();
        if let Some(meta) = snapshot.lookup(location.partition_id) {
            return partition::read_row(&meta.path, location.partition_id, location.offset)
                .await
                .map(Some);
        }
        let store = self.store.lock().await;
        if store.active_id() == location.partition_id {
            return store.read_active(location.offset).map(Some);
        }
        Ok(None)
    }

    /// Exclude a partition that failed a read-time checksum; the file is
    /// left on disk for manual recovery
    fn quarantine(&self, id: u64) {
        if self.index.snapshot().lookup(id).is_none() {
            return;
        }
        warn!("excluding corrupt partition {} from the index", id);
        self.index.publish_remove(id);
        self.lookup.write().retain(|_, loc| loc.partition_id != id);
    }
}

fn entry(key: &str, value: Vec<u8>, tier: Tier) -> CacheEntry {
    CacheEntry {
        key: key.to_string(),
        size_bytes: value.len(),
        value,
        tier,
    }
}
