//! L2: append-only segment store on local disk.
//!
//! Every put or delete appends one record to the active segment and updates
//! an in-memory key→location index. Reads go through the index, then a
//! positioned read against the segment file. Nothing else is persisted: on
//! open the index is rebuilt by replaying every segment in id order, later
//! records overriding earlier ones.
//!
//! Record layout (native endian, same-deployment compatibility only):
//!
//! ```text
//! +----------------------------+-----------+-------------+
//! | RecordHeader (32 bytes)    | key bytes | value bytes |
//! +----------------------------+-----------+-------------+
//! ```
//!
//! Appends and compaction serialize on the writer lock. Readers only take the
//! index read lock long enough to copy a location, then read concurrently.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::compressor::{CompressionError, Compressor};
use crate::cache::entry::{CacheEntry, Tier};
use crate::cache::tier::{CacheTier, TierError};
use crate::clock::{SharedClock, UnixMillis};
use crate::config::{CompressionConfig, DiskConfig};

const RECORD_MAGIC: u32 = 0x4143_5452;
const FLAG_TOMBSTONE: u32 = 1;
const FLAG_COMPRESSED: u32 = 1 << 1;
const HEADER_LEN: u64 = std::mem::size_of::<RecordHeader>() as u64;
const MAX_KEY_LEN: u32 = 64 * 1024;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("Record of {size} bytes exceeds disk tier capacity")]
    TooLarge { size: u64 },

    #[error("Key of {0} bytes is too long for a segment record")]
    KeyTooLong(usize),

    #[error("Segment {segment} is not open")]
    SegmentMissing { segment: u64 },
}

impl From<SegmentError> for TierError {
    fn from(err: SegmentError) -> Self {
        match err {
            SegmentError::TooLarge { size } => TierError::TooLarge {
                tier: Tier::Disk,
                size: size as usize,
            },
            other => TierError::unavailable(Tier::Disk, other),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RecordHeader {
    magic: u32,
    flags: u32,
    key_len: u32,
    value_len: u32,
    created_at: u64,
    expires_at: u64,
}

impl RecordHeader {
    fn record_len(&self) -> u64 {
        HEADER_LEN + self.key_len as u64 + self.value_len as u64
    }
}

/// Where a live record lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordLocation {
    segment: u64,
    offset: u64,
    key_len: u32,
    value_len: u32,
    flags: u32,
    created_at: UnixMillis,
    expires_at: UnixMillis,
}

impl RecordLocation {
    fn value_offset(&self) -> u64 {
        self.offset + HEADER_LEN + self.key_len as u64
    }

    fn record_len(&self) -> u64 {
        HEADER_LEN + self.key_len as u64 + self.value_len as u64
    }

    fn is_expired(&self, now: UnixMillis) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug)]
struct ActiveSegment {
    id: u64,
    file: File,
    len: u64,
}

/// Disk tier statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskStats {
    pub key_count: usize,
    pub segment_count: usize,
    pub live_bytes: u64,
    pub dead_bytes: u64,
    pub total_writes: u64,
    pub total_reads: u64,
    pub compactions: u64,
}

struct Inner {
    dir: PathBuf,
    config: DiskConfig,
    compressor: Compressor,
    clock: SharedClock,
    index: RwLock<HashMap<String, RecordLocation>>,
    readers: RwLock<HashMap<u64, Arc<File>>>,
    writer: Mutex<ActiveSegment>,
    live_bytes: AtomicU64,
    dead_bytes: AtomicU64,
    total_writes: AtomicU64,
    total_reads: AtomicU64,
    compactions: AtomicU64,
}

/// Persistent segment-file tier. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PersistentTier {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PersistentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTier")
            .field("dir", &self.inner.dir)
            .field("keys", &self.inner.index.read().len())
            .finish()
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("segment-{id:010}.log"))
}

fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("segment-")?.strip_suffix(".log")?.parse().ok()
}

fn list_segments(dir: &Path) -> Result<Vec<u64>, SegmentError> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn open_append(path: &Path) -> Result<(File, u64), SegmentError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

/// Replay state accumulated while scanning segments.
#[derive(Default)]
struct Replay {
    index: HashMap<String, RecordLocation>,
    live: u64,
    dead: u64,
}

impl Replay {
    fn apply(&mut self, key: String, loc: RecordLocation, now: UnixMillis) {
        if let Some(prev) = self.index.remove(&key) {
            self.live -= prev.record_len();
            self.dead += prev.record_len();
        }
        if loc.flags & FLAG_TOMBSTONE != 0 || loc.is_expired(now) {
            self.dead += loc.record_len();
        } else {
            self.live += loc.record_len();
            self.index.insert(key, loc);
        }
    }
}

/// Scan one segment into `replay`, returning the length of its valid prefix.
fn scan_segment(path: &Path, segment: u64, now: UnixMillis, replay: &mut Replay) -> Result<u64, SegmentError> {
    let file = File::open(path)?;
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;

    while offset + HEADER_LEN <= total {
        let mut raw = [0u8; HEADER_LEN as usize];
        reader.read_exact(&mut raw)?;
        let header: RecordHeader = bytemuck::pod_read_unaligned(&raw);

        if header.magic != RECORD_MAGIC || header.key_len > MAX_KEY_LEN {
            warn!(segment, offset, "Corrupt record header, truncating segment");
            break;
        }
        if offset + header.record_len() > total {
            warn!(segment, offset, "Torn record at segment tail, truncating");
            break;
        }

        let mut key = vec![0u8; header.key_len as usize];
        reader.read_exact(&mut key)?;
        let Ok(key) = String::from_utf8(key) else {
            warn!(segment, offset, "Record key is not UTF-8, truncating segment");
            break;
        };
        reader.seek_relative(header.value_len as i64)?;

        let loc = RecordLocation {
            segment,
            offset,
            key_len: header.key_len,
            value_len: header.value_len,
            flags: header.flags,
            created_at: header.created_at,
            expires_at: header.expires_at,
        };
        replay.apply(key, loc, now);
        offset += header.record_len();
    }

    Ok(offset)
}

impl PersistentTier {
    /// Open (or create) the segment directory and rebuild the index from it.
    pub fn open(config: DiskConfig, compression: CompressionConfig, clock: SharedClock) -> Result<Self, SegmentError> {
        let dir = config.path.clone();
        fs::create_dir_all(&dir)?;

        let now = clock.now_millis();
        let ids = list_segments(&dir)?;
        let mut replay = Replay::default();
        let mut readers = HashMap::new();

        for &id in &ids {
            let path = segment_path(&dir, id);
            let valid = scan_segment(&path, id, now, &mut replay)?;
            let file_len = fs::metadata(&path)?.len();
            if valid < file_len {
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid)?;
                warn!(segment = id, dropped = file_len - valid, "Discarded invalid segment tail");
            }
            readers.insert(id, Arc::new(File::open(&path)?));
        }

        let active_id = match ids.last() {
            Some(&last) if fs::metadata(segment_path(&dir, last))?.len() < config.max_segment_bytes => last,
            Some(&last) => last + 1,
            None => 1,
        };
        let active_path = segment_path(&dir, active_id);
        let (file, len) = open_append(&active_path)?;
        readers.entry(active_id).or_insert(Arc::new(File::open(&active_path)?));

        info!(
            dir = %dir.display(),
            segments = readers.len(),
            keys = replay.index.len(),
            live_bytes = replay.live,
            dead_bytes = replay.dead,
            "Disk tier recovered"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                config,
                compressor: Compressor::new(compression),
                clock,
                index: RwLock::new(replay.index),
                readers: RwLock::new(readers),
                writer: Mutex::new(ActiveSegment { id: active_id, file, len }),
                live_bytes: AtomicU64::new(replay.live),
                dead_bytes: AtomicU64::new(replay.dead),
                total_writes: AtomicU64::new(0),
                total_reads: AtomicU64::new(0),
                compactions: AtomicU64::new(0),
            }),
        })
    }

    /// Look up a live entry, purging it lazily if expired.
    pub fn read(&self, key: &str) -> Result<Option<CacheEntry>, SegmentError> {
        self.inner.read(key)
    }

    pub fn write(&self, entry: &CacheEntry) -> Result<(), SegmentError> {
        self.inner.write(entry)
    }

    pub fn remove(&self, key: &str) -> Result<(), SegmentError> {
        self.inner.remove(key)
    }

    /// Rewrite all live, unexpired records into a fresh segment.
    pub fn compact(&self) -> Result<(), SegmentError> {
        self.inner.compact()
    }

    /// Fraction of on-disk bytes that are superseded, deleted or expired.
    pub fn garbage_ratio(&self) -> f64 {
        let live = self.inner.live_bytes.load(Ordering::Relaxed);
        let dead = self.inner.dead_bytes.load(Ordering::Relaxed);
        if live + dead == 0 {
            return 0.0;
        }
        dead as f64 / (live + dead) as f64
    }

    /// Periodically compact when the garbage ratio crosses the configured threshold.
    pub fn spawn_compactor(&self, interval: Duration) -> JoinHandle<()> {
        let tier = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tier.garbage_ratio() < tier.inner.config.compaction_garbage_ratio {
                    continue;
                }
                let worker = tier.clone();
                match tokio::task::spawn_blocking(move || worker.compact()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Disk compaction failed"),
                    Err(e) => warn!(error = %e, "Disk compaction task aborted"),
                }
            }
        })
    }

    pub fn stats(&self) -> DiskStats {
        DiskStats {
            key_count: self.inner.index.read().len(),
            segment_count: self.inner.readers.read().len(),
            live_bytes: self.inner.live_bytes.load(Ordering::Relaxed),
            dead_bytes: self.inner.dead_bytes.load(Ordering::Relaxed),
            total_writes: self.inner.total_writes.load(Ordering::Relaxed),
            total_reads: self.inner.total_reads.load(Ordering::Relaxed),
            compactions: self.inner.compactions.load(Ordering::Relaxed),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, TierError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, SegmentError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(inner.as_ref()))
            .await
            .map_err(|e| TierError::unavailable(Tier::Disk, e))?
            .map_err(TierError::from)
    }
}

impl Inner {
    fn reader(&self, segment: u64) -> Option<Arc<File>> {
        self.readers.read().get(&segment).cloned()
    }

    fn read(&self, key: &str) -> Result<Option<CacheEntry>, SegmentError> {
        let Some(loc) = self.index.read().get(key).copied() else {
            return Ok(None);
        };

        if loc.is_expired(self.clock.now_millis()) {
            self.purge_if_current(key, loc);
            debug!(key, "Expired record purged from disk index");
            return Ok(None);
        }

        // The segment may have been compacted away since the index lookup.
        let Some(file) = self.reader(loc.segment) else {
            return Ok(None);
        };

        let mut data = vec![0u8; loc.value_len as usize];
        file.read_exact_at(&mut data, loc.value_offset())?;
        let value = self.compressor.decode(&data, loc.flags & FLAG_COMPRESSED != 0)?;
        self.total_reads.fetch_add(1, Ordering::Relaxed);

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value: Bytes::from(value),
            created_at: loc.created_at,
            expires_at: loc.expires_at,
            origin_tier: Tier::Disk,
        }))
    }

    fn purge_if_current(&self, key: &str, loc: RecordLocation) {
        let mut index = self.index.write();
        if index.get(key) == Some(&loc) {
            index.remove(key);
            self.live_bytes.fetch_sub(loc.record_len(), Ordering::Relaxed);
            self.dead_bytes.fetch_add(loc.record_len(), Ordering::Relaxed);
        }
    }

    fn write(&self, entry: &CacheEntry) -> Result<(), SegmentError> {
        let encoded = self.compressor.encode(&entry.value)?;
        let flags = if encoded.compressed { FLAG_COMPRESSED } else { 0 };
        let record_len = HEADER_LEN + entry.key.len() as u64 + encoded.data.len() as u64;
        if record_len > self.config.max_bytes {
            return Err(SegmentError::TooLarge { size: record_len });
        }

        let mut active = self.writer.lock();
        self.make_room(&active, record_len);
        if self.live_bytes.load(Ordering::Relaxed) + record_len > self.config.max_bytes {
            return Err(SegmentError::TooLarge { size: record_len });
        }

        let loc = self.append(&mut active, &entry.key, &encoded.data, flags, entry.created_at, entry.expires_at)?;
        let mut index = self.index.write();
        if let Some(prev) = index.insert(entry.key.clone(), loc) {
            self.live_bytes.fetch_sub(prev.record_len(), Ordering::Relaxed);
            self.dead_bytes.fetch_add(prev.record_len(), Ordering::Relaxed);
        }
        self.live_bytes.fetch_add(loc.record_len(), Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SegmentError> {
        let mut active = self.writer.lock();
        if !self.index.read().contains_key(key) {
            return Ok(());
        }
        let now = self.clock.now_millis();
        let tombstone = self.append(&mut active, key, &[], FLAG_TOMBSTONE, now, now)?;
        self.dead_bytes.fetch_add(tombstone.record_len(), Ordering::Relaxed);
        if let Some(prev) = self.index.write().remove(key) {
            self.live_bytes.fetch_sub(prev.record_len(), Ordering::Relaxed);
            self.dead_bytes.fetch_add(prev.record_len(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drop whole sealed segments, oldest first, until `needed` more bytes fit.
    ///
    /// Caller holds the writer lock.
    fn make_room(&self, active: &ActiveSegment, needed: u64) {
        while self.live_bytes.load(Ordering::Relaxed) + needed > self.config.max_bytes {
            let oldest = self.readers.read().keys().copied().filter(|id| *id != active.id).min();
            let Some(oldest) = oldest else {
                return;
            };

            let mut freed = 0u64;
            let mut dropped_keys = 0usize;
            self.index.write().retain(|_, loc| {
                if loc.segment == oldest {
                    freed += loc.record_len();
                    dropped_keys += 1;
                    false
                } else {
                    true
                }
            });
            // Whatever in the file was not live is dead and leaves with it.
            let segment_len = self
                .reader(oldest)
                .and_then(|file| file.metadata().ok())
                .map_or(freed, |meta| meta.len());
            let dead = segment_len.saturating_sub(freed);
            self.live_bytes.fetch_sub(freed, Ordering::Relaxed);
            let _ = self
                .dead_bytes
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(dead)));
            self.retire_segments(&[oldest]);
            info!(segment = oldest, dropped_keys, freed, dead, "Evicted oldest disk segment");
        }
    }

    /// Append one record. Caller holds the writer lock.
    fn append(
        &self,
        active: &mut ActiveSegment,
        key: &str,
        value: &[u8],
        flags: u32,
        created_at: UnixMillis,
        expires_at: UnixMillis,
    ) -> Result<RecordLocation, SegmentError> {
        let key_len = u32::try_from(key.len())
            .ok()
            .filter(|len| *len <= MAX_KEY_LEN)
            .ok_or(SegmentError::KeyTooLong(key.len()))?;
        let value_len = u32::try_from(value.len()).map_err(|_| SegmentError::TooLarge { size: value.len() as u64 })?;

        let header = RecordHeader {
            magic: RECORD_MAGIC,
            flags,
            key_len,
            value_len,
            created_at,
            expires_at,
        };
        let mut buf = Vec::with_capacity(header.record_len() as usize);
        buf.extend_from_slice(bytemuck::bytes_of(&header));
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(value);
        self.append_raw(active, &buf, header)
    }

    fn append_raw(&self, active: &mut ActiveSegment, buf: &[u8], header: RecordHeader) -> Result<RecordLocation, SegmentError> {
        if active.len > 0 && active.len + buf.len() as u64 > self.config.max_segment_bytes {
            self.roll(active)?;
        }

        active.file.write_all(buf)?;
        if self.config.sync_writes {
            active.file.sync_data()?;
        }

        let loc = RecordLocation {
            segment: active.id,
            offset: active.len,
            key_len: header.key_len,
            value_len: header.value_len,
            flags: header.flags,
            created_at: header.created_at,
            expires_at: header.expires_at,
        };
        active.len += buf.len() as u64;
        self.total_writes.fetch_add(1, Ordering::Relaxed);
        Ok(loc)
    }

    fn roll(&self, active: &mut ActiveSegment) -> Result<(), SegmentError> {
        let next = active.id + 1;
        let path = segment_path(&self.dir, next);
        let (file, len) = open_append(&path)?;
        self.readers.write().insert(next, Arc::new(File::open(&path)?));
        debug!(from = active.id, to = next, "Rolled disk segment");
        *active = ActiveSegment { id: next, file, len };
        Ok(())
    }

    fn retire_segments(&self, ids: &[u64]) {
        let mut readers = self.readers.write();
        for id in ids {
            readers.remove(id);
            if let Err(e) = fs::remove_file(segment_path(&self.dir, *id)) {
                warn!(segment = id, error = %e, "Failed to remove retired segment");
            }
        }
    }

    fn compact(&self) -> Result<(), SegmentError> {
        let mut active = self.writer.lock();
        let now = self.clock.now_millis();
        let old_ids: Vec<u64> = self.readers.read().keys().copied().collect();

        let mut snapshot: Vec<(String, RecordLocation)> =
            self.index.read().iter().map(|(k, v)| (k.clone(), *v)).collect();
        snapshot.sort_by_key(|(_, loc)| (loc.segment, loc.offset));

        self.roll(&mut active)?;
        let mut moved = Vec::with_capacity(snapshot.len());
        for (key, loc) in snapshot {
            if loc.is_expired(now) {
                continue;
            }
            let file = self.reader(loc.segment).ok_or(SegmentError::SegmentMissing { segment: loc.segment })?;
            let mut buf = vec![0u8; loc.record_len() as usize];
            file.read_exact_at(&mut buf, loc.offset)?;
            let header: RecordHeader = bytemuck::pod_read_unaligned(&buf[..HEADER_LEN as usize]);
            let new_loc = self.append_raw(&mut active, &buf, header)?;
            moved.push((key, loc, new_loc));
        }
        active.file.sync_data()?;

        let mut live = 0u64;
        {
            let mut index = self.index.write();
            let mut next = HashMap::with_capacity(moved.len());
            for (key, old, new) in moved {
                // Keys purged while we were copying stay purged.
                if index.get(&key) == Some(&old) {
                    live += new.record_len();
                    next.insert(key, new);
                }
            }
            index.clear();
            *index = next;
        }
        self.live_bytes.store(live, Ordering::Relaxed);
        self.dead_bytes.store(0, Ordering::Relaxed);

        self.retire_segments(&old_ids);
        self.compactions.fetch_add(1, Ordering::Relaxed);
        info!(
            retired = old_ids.len(),
            keys = self.index.read().len(),
            live_bytes = live,
            "Disk compaction complete"
        );
        Ok(())
    }
}

#[async_trait]
impl CacheTier for PersistentTier {
    fn kind(&self) -> Tier {
        Tier::Disk
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        let key = key.to_string();
        self.blocking(move |inner| inner.read(&key)).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), TierError> {
        self.blocking(move |inner| inner.write(&entry)).await
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        let key = key.to_string();
        self.blocking(move |inner| inner.remove(&key)).await
    }

    fn has_capacity_for(&self, bytes: usize) -> bool {
        self.inner.live_bytes.load(Ordering::Relaxed) + HEADER_LEN + bytes as u64 <= self.inner.config.max_bytes
    }
}
