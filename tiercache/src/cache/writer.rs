//! Write-behind queue and background flusher
//!
//! Puts are acknowledged once the memory tier is updated and the write
//! is queued; a single background task drains the queue and appends to
//! the active partition. The queue is bounded: a full queue blocks the
//! producer rather than dropping data.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::core::error::Result;
use crate::core::types::KeyTable;
use crate::persistence::index::{self, SharedIndex};
use crate::persistence::partition::PartitionStore;

/// Commands with a batch cap so one store lock covers a burst
const MAX_BATCH: usize = 64;

/// A queued value that has not yet reached the active partition.
/// Readable by `get` so demoted-but-unflushed entries are still served.
pub(crate) struct PendingWrite {
    pub value: Vec<u8>,
    /// Monotonic put sequence; a stale append must not clear a newer
    /// pending value or resurrect an invalidated key
    pub seq: u64,
}

pub(crate) type PendingTable = HashMap<String, PendingWrite, ahash::RandomState>;

pub(crate) enum WriteCommand {
    Put {
        key: String,
        value: Vec<u8>,
        seq: u64,
        /// Present on sync_flush puts; acked after a durable flush
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Delete {
        key: String,
    },
    Flush {
        ack: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Shared state the flusher task operates on
pub(crate) struct WriterContext {
    pub store: Arc<tokio::sync::Mutex<PartitionStore>>,
    pub lookup: Arc<RwLock<KeyTable>>,
    pub pending: Arc<RwLock<PendingTable>>,
    pub index: SharedIndex,
    pub directory: PathBuf,
}

/// Background flusher loop: drain, append, publish locations, refresh
/// the sidecar after rotations.
pub(crate) async fn run_writer(ctx: WriterContext, mut rx: mpsc::Receiver<WriteCommand>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(cmd) => batch.push(cmd),
                Err(_) => break,
            }
        }

        let mut rotated = false;
        let mut shutdown = None;
        {
            let mut store = ctx.store.lock().await;
            for cmd in batch {
                match cmd {
                    WriteCommand::Put {
                        key,
                        value,
                        seq,
                        ack,
                    } => match store.append_put(&key, value).await {
                        Ok(outcome) => {
                            rotated |= outcome.rotated;
                            // Superseded by a newer put or an invalidate:
                            // leave the table alone and do not publish
                            // the stale location
                            let current = {
                                let mut pending = ctx.pending.write();
                                if pending.get(&key).is_some_and(|p| p.seq == seq) {
                                    pending.remove(&key);
                                    true
                                } else {
                                    false
                                }
                            };
                            if current {
                                ctx.lookup.write().insert(key, outcome.location);
                            }
                            if let Some(ack) = ack {
                                let _ = ack.send(store.flush().await);
                            }
                        }
                        Err(e) => {
                            warn!("write-behind append failed for {}: {}", key, e);
                            if let Some(ack) = ack {
                                let _ = ack.send(Err(e));
                            }
                        }
                    },
                    WriteCommand::Delete { key } => match store.append_delete(&key).await {
                        Ok(outcome) => {
                            rotated |= outcome.rotated;
                            ctx.lookup.write().remove(&key);
                        }
                        Err(e) => {
                            warn!("write-behind tombstone failed for {}: {}", key, e);
                        }
                    },
                    WriteCommand::Flush { ack } => {
                        let _ = ack.send(store.flush().await);
                    }
                    WriteCommand::Shutdown { ack } => {
                        if let Err(e) = store.flush().await {
                            warn!("final flush failed during shutdown: {}", e);
                        }
                        shutdown = Some(ack);
                        break;
                    }
                }
            }
        }

        if rotated {
            let snapshot = ctx.index.snapshot();
            let keys = ctx.lookup.read().clone();
            if let Err(e) = index::write_sidecar(&ctx.directory, &snapshot, &keys).await {
                warn!("sidecar refresh failed: {}", e);
            }
        }

        if let Some(ack) = shutdown {
            let _ = ack.send(());
            info!("write-behind flusher stopped");
            return;
        }
    }
    info!("write-behind flusher channel closed");
}
