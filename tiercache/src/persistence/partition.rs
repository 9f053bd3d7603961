//! Append-only partition store
//!
//! The active partition buffers rows in memory and is made durable by
//! rewriting the whole file through a temp-file-then-rename, so a
//! partially-written partition is never visible under its final name.
//! Rotation appends a footer and the file becomes immutable.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::index::{SharedIndex, partition_filename};
use super::types::{
    FOOTER_MAGIC, FOOTER_TRAILER_LEN, PARTITION_HEADER_LEN, PARTITION_MAGIC, PartitionFooter,
    PartitionMeta, Row, RowOp,
};
use crate::compression::Compressor;
use crate::config::PartitionConfig;
use crate::core::error::{CacheError, Result};
use crate::core::types::{RowLocation, now_secs};

/// Result of a single append
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub location: RowLocation,
    /// Whether this append rotated into a fresh active partition first
    pub rotated: bool,
}

/// The one unfinalized partition accepting writes
struct ActivePartition {
    id: u64,
    path: PathBuf,
    /// Framed rows, exactly the bytes that follow the file header
    body: Vec<u8>,
    row_count: u64,
    body_crc: crc32fast::Hasher,
    min_timestamp: u64,
    max_timestamp: u64,
    flushed_bytes: usize,
    flushed_rows: u64,
    degraded: bool,
    created_at: u64,
}

impl ActivePartition {
    fn new(directory: &Path, id: u64) -> Self {
        Self {
            id,
            path: directory.join(partition_filename(id)),
            body: Vec::new(),
            row_count: 0,
            body_crc: crc32fast::Hasher::new(),
            min_timestamp: u64::MAX,
            max_timestamp: 0,
            flushed_bytes: 0,
            flushed_rows: 0,
            degraded: false,
            created_at: now_secs(),
        }
    }
}

/// Append-only on-disk segment store with buffered writes, durable
/// flushing and rotation
pub struct PartitionStore {
    directory: PathBuf,
    config: PartitionConfig,
    compressor: Compressor,
    index: SharedIndex,
    active: ActivePartition,
    next_id: u64,
}

impl PartitionStore {
    pub fn new(
        directory: PathBuf,
        config: PartitionConfig,
        compressor: Compressor,
        index: SharedIndex,
        first_id: u64,
    ) -> Self {
        let active = ActivePartition::new(&directory, first_id);
        Self {
            directory,
            config,
            compressor,
            index,
            active,
            next_id: first_id + 1,
        }
    }

    /// Append a value for a key, compressing per configuration
    pub async fn append_put(&mut self, key: &str, value: Vec<u8>) -> Result<AppendOutcome> {
        let (value, compression) = self.compressor.compress(&value)?;
        let row = Row {
            timestamp: now_secs(),
            op: RowOp::Put {
                key: key.to_string(),
                value,
                compression,
            },
        };
        self.append_row(row).await
    }

    /// Append a tombstone for an invalidated key
    pub async fn append_delete(&mut self, key: &str) -> Result<AppendOutcome> {
        let row = Row {
            timestamp: now_secs(),
            op: RowOp::Delete {
                key: key.to_string(),
            },
        };
        self.append_row(row).await
    }

    async fn append_row(&mut self, row: Row) -> Result<AppendOutcome> {
        let mut rotated = false;
        if self.rotation_due() {
            self.rotate().await?;
            rotated = true;
        }

        let frame = encode_frame(&row)?;
        let offset = PARTITION_HEADER_LEN + self.active.body.len() as u64;
        self.active.body_crc.update(&frame);
        self.active.body.extend_from_slice(&frame);
        self.active.row_count += 1;
        self.active.min_timestamp = self.active.min_timestamp.min(row.timestamp);
        self.active.max_timestamp = self.active.max_timestamp.max(row.timestamp);

        let location = RowLocation {
            partition_id: self.active.id,
            offset,
        };

        if self.flush_due() {
            self.flush().await?;
        }

        Ok(AppendOutcome { location, rotated })
    }

    fn rotation_due(&self) -> bool {
        if self.active.row_count == 0 {
            return false;
        }
        // A degraded partition is rotated early rather than retried forever
        if self.active.degraded {
            return true;
        }
        self.active.row_count >= self.config.max_rows
            || self.active.body.len() as u64 >= self.config.max_bytes
    }

    fn flush_due(&self) -> bool {
        let rows = self.active.row_count - self.active.flushed_rows;
        let bytes = (self.active.body.len() - self.active.flushed_bytes) as u64;
        rows >= self.config.flush_rows || bytes >= self.config.flush_bytes
    }

    /// Durably persist the active partition (no footer; it stays active)
    pub async fn flush(&mut self) -> Result<()> {
        if self.active.row_count == 0 || self.active.body.len() == self.active.flushed_bytes {
            return Ok(());
        }
        match self.write_active(None).await {
            Ok(()) => {
                self.active.flushed_bytes = self.active.body.len();
                self.active.flushed_rows = self.active.row_count;
                debug!(
                    "flushed partition {} ({} rows, {} bytes)",
                    self.active.id,
                    self.active.row_count,
                    self.active.body.len()
                );
                Ok(())
            }
            Err(e) => {
                self.active.degraded = true;
                warn!(
                    "flush of partition {} failed, marking degraded: {}",
                    self.active.id, e
                );
                Err(CacheError::PartitionWrite(e.to_string()))
            }
        }
    }

    /// Finalize the active partition and open a fresh one
    pub async fn rotate(&mut self) -> Result<()> {
        if let Err(e) = self.finalize_active().await {
            // Leave the file for discovery salvage and keep accepting writes
            warn!(
                "abandoning partition {} on rotation: {}",
                self.active.id, e
            );
        }
        let id = self.next_id;
        self.next_id += 1;
        self.active = ActivePartition::new(&self.directory, id);
        info!("opened active partition {}", id);
        Ok(())
    }

    async fn finalize_active(&mut self) -> Result<()> {
        if self.active.row_count == 0 {
            return Ok(());
        }
        let footer = PartitionFooter {
            row_count: self.active.row_count,
            body_bytes: self.active.body.len() as u64,
            body_crc: self.active.body_crc.clone().finalize(),
            min_timestamp: self.active.min_timestamp,
            max_timestamp: self.active.max_timestamp,
        };
        self.write_active(Some(&footer))
            .await
            .map_err(|e| CacheError::PartitionWrite(e.to_string()))?;

        let size_bytes = fs::metadata(&self.active.path).await?.len();
        let meta = PartitionMeta {
            id: self.active.id,
            path: self.active.path.clone(),
            size_bytes,
            row_count: self.active.row_count,
            created_at: self.active.created_at,
            modified_at: now_secs(),
            finalized: true,
        };
        info!(
            "finalized partition {} ({} rows, {} bytes)",
            meta.id, meta.row_count, meta.size_bytes
        );
        self.index.publish_insert(meta);
        Ok(())
    }

    async fn write_active(&self, footer: Option<&PartitionFooter>) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(PARTITION_MAGIC.len() + self.active.body.len() + 128);
        buf.extend_from_slice(PARTITION_MAGIC);
        buf.extend_from_slice(&self.active.body);
        if let Some(footer) = footer {
            let payload = bincode::serialize(footer)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            buf.extend_from_slice(&payload);
            buf.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
            buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            buf.extend_from_slice(FOOTER_MAGIC);
        }

        let tmp = self.active.path.with_extension("part.tmp");
        let mut file = File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);

        // Atomic rename: the final name only ever points at a complete file
        fs::rename(&tmp, &self.active.path).await?;
        Ok(())
    }

    /// Read a row still buffered in the active partition
    pub fn read_active(&self, offset: u64) -> Result<Row> {
        if offset < PARTITION_HEADER_LEN {
            return Err(self.active_corrupt("row offset inside header"));
        }
        let start = (offset - PARTITION_HEADER_LEN) as usize;
        let body = &self.active.body;
        if start + 8 > body.len() {
            return Err(self.active_corrupt("row offset out of range"));
        }
        let len = u32::from_be_bytes(body[start..start + 4].try_into().unwrap()) as usize;
        let crc = u32::from_be_bytes(body[start + 4..start + 8].try_into().unwrap());
        if start + 8 + len > body.len() {
            return Err(self.active_corrupt("row length out of range"));
        }
        let payload = &body[start + 8..start + 8 + len];
        if crc32fast::hash(payload) != crc {
            return Err(self.active_corrupt("row checksum mismatch"));
        }
        bincode::deserialize(payload).map_err(|_| self.active_corrupt("row decode failed"))
    }

    fn active_corrupt(&self, reason: &str) -> CacheError {
        CacheError::PartitionCorrupt {
            id: self.active.id,
            reason: reason.to_string(),
        }
    }

    pub fn active_id(&self) -> u64 {
        self.active.id
    }

    pub fn active_rows(&self) -> u64 {
        self.active.row_count
    }

    pub fn active_bytes(&self) -> u64 {
        if self.active.row_count == 0 {
            0
        } else {
            PARTITION_HEADER_LEN + self.active.body.len() as u64
        }
    }

    /// Flush and finalize the active partition; called once at shutdown
    pub async fn close(&mut self) -> Result<()> {
        self.finalize_active().await
    }
}

fn encode_frame(row: &Row) -> Result<Vec<u8>> {
    let payload = bincode::serialize(row)?;
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn corrupt(id: u64, reason: &str) -> CacheError {
    CacheError::PartitionCorrupt {
        id,
        reason: reason.to_string(),
    }
}

/// Metadata-only read of a finalized partition's footer.
/// Validates the header magic, the footer frame and the length
/// arithmetic without touching the body.
pub async fn read_footer(path: &Path, id: u64) -> Result<(PartitionFooter, u64)> {
    let mut file = File::open(path).await?;
    let file_len = file.metadata().await?.len();
    if file_len < PARTITION_HEADER_LEN + FOOTER_TRAILER_LEN {
        return Err(corrupt(id, "file too small for a footer"));
    }

    let mut magic = [0u8; 8];
    file.read_exact(&mut magic).await?;
    if &magic != PARTITION_MAGIC {
        return Err(corrupt(id, "bad partition magic"));
    }

    file.seek(SeekFrom::End(-(FOOTER_TRAILER_LEN as i64))).await?;
    let crc = file.read_u32().await?;
    let len = file.read_u32().await? as u64;
    let mut tail = [0u8; 8];
    file.read_exact(&mut tail).await?;
    if &tail != FOOTER_MAGIC {
        return Err(corrupt(id, "missing footer magic"));
    }
    if PARTITION_HEADER_LEN + len + FOOTER_TRAILER_LEN > file_len {
        return Err(corrupt(id, "footer length out of range"));
    }

    file.seek(SeekFrom::Start(file_len - FOOTER_TRAILER_LEN - len))
        .await?;
    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload).await?;
    if crc32fast::hash(&payload) != crc {
        return Err(corrupt(id, "footer checksum mismatch"));
    }

    let footer: PartitionFooter =
        bincode::deserialize(&payload).map_err(|_| corrupt(id, "footer decode failed"))?;
    if PARTITION_HEADER_LEN + footer.body_bytes + len + FOOTER_TRAILER_LEN != file_len {
        return Err(corrupt(id, "body length mismatch"));
    }
    Ok((footer, file_len))
}

/// Metadata-only read of a finalized partition
pub async fn read_meta(path: &Path, id: u64) -> Result<PartitionMeta> {
    let (footer, size_bytes) = read_footer(path, id).await?;
    Ok(PartitionMeta {
        id,
        path: path.to_path_buf(),
        size_bytes,
        row_count: footer.row_count,
        created_at: footer.min_timestamp,
        modified_at: footer.max_timestamp,
        finalized: true,
    })
}

/// Point read of one row from a finalized partition file
pub async fn read_row(path: &Path, id: u64, offset: u64) -> Result<Row> {
    let mut file = File::open(path).await?;
    let file_len = file.metadata().await?.len();
    if offset < PARTITION_HEADER_LEN || offset + 8 > file_len {
        return Err(corrupt(id, "row offset out of range"));
    }

    file.seek(SeekFrom::Start(offset)).await?;
    let len = file.read_u32().await? as u64;
    let crc = file.read_u32().await?;
    if offset + 8 + len > file_len {
        return Err(corrupt(id, "row length out of range"));
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload).await?;
    if crc32fast::hash(&payload) != crc {
        return Err(corrupt(id, "row checksum mismatch"));
    }
    bincode::deserialize(&payload).map_err(|_| corrupt(id, "row decode failed"))
}

/// Scan every row of a finalized partition, verifying the body checksum
/// and the footer row count
pub async fn scan_rows(
    path: &Path,
    id: u64,
    footer: &PartitionFooter,
) -> Result<Vec<(u64, Row)>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(PARTITION_HEADER_LEN)).await?;
    let mut body = vec![0u8; footer.body_bytes as usize];
    file.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != footer.body_crc {
        return Err(corrupt(id, "body checksum mismatch"));
    }
    let rows = parse_body(&body, id, true)?;
    if rows.len() as u64 != footer.row_count {
        return Err(corrupt(id, "row count mismatch"));
    }
    Ok(rows)
}

/// Lenient row scan of an unfinalized partition: returns the valid
/// prefix, stopping at the first incomplete or corrupt frame
pub async fn salvage_rows(path: &Path, id: u64) -> Result<Vec<(u64, Row)>> {
    let mut file = File::open(path).await?;
    let mut magic = [0u8; 8];
    if file.read_exact(&mut magic).await.is_err() || &magic != PARTITION_MAGIC {
        return Err(corrupt(id, "bad partition magic"));
    }
    let mut body = Vec::new();
    file.read_to_end(&mut body).await?;
    parse_body(&body, id, false)
}

/// Rewrite a salvaged row prefix as a properly finalized partition
pub async fn finalize_salvaged(path: &Path, id: u64, rows: &[(u64, Row)]) -> Result<PartitionMeta> {
    let mut body = Vec::new();
    let mut min_timestamp = u64::MAX;
    let mut max_timestamp = 0u64;
    for (_, row) in rows {
        body.extend_from_slice(&encode_frame(row)?);
        min_timestamp = min_timestamp.min(row.timestamp);
        max_timestamp = max_timestamp.max(row.timestamp);
    }
    let footer = PartitionFooter {
        row_count: rows.len() as u64,
        body_bytes: body.len() as u64,
        body_crc: crc32fast::hash(&body),
        min_timestamp,
        max_timestamp,
    };
    let payload = bincode::serialize(&footer)?;

    let mut buf = Vec::with_capacity(PARTITION_MAGIC.len() + body.len() + payload.len() + 16);
    buf.extend_from_slice(PARTITION_MAGIC);
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(FOOTER_MAGIC);

    let tmp = path.with_extension("part.tmp");
    let mut file = File::create(&tmp).await?;
    file.write_all(&buf).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;

    read_meta(path, id).await
}

fn parse_body(body: &[u8], id: u64, strict: bool) -> Result<Vec<(u64, Row)>> {
    let mut rows = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= body.len() {
        let len = u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
        let crc = u32::from_be_bytes(body[pos + 4..pos + 8].try_into().unwrap());
        if pos + 8 + len > body.len() {
            if strict {
                return Err(corrupt(id, "truncated row frame"));
            }
            break;
        }
        let payload = &body[pos + 8..pos + 8 + len];
        if crc32fast::hash(payload) != crc {
            if strict {
                return Err(corrupt(id, "row checksum mismatch"));
            }
            break;
        }
        let row: Row = match bincode::deserialize(payload) {
            Ok(row) => row,
            Err(_) => {
                if strict {
                    return Err(corrupt(id, "row decode failed"));
                }
                break;
            }
        };
        rows.push((PARTITION_HEADER_LEN + pos as u64, row));
        pos += 8 + len;
    }
    if strict && pos != body.len() {
        return Err(corrupt(id, "trailing bytes after last row"));
    }
    Ok(rows)
}
