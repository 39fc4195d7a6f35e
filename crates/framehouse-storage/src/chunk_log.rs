//! Chunk Log: one chunk's record log, index, and write loop
//!
//! ## Architecture
//!
//! Every chunk owns a pair of files and a dedicated writer task:
//!
//! ```text
//! append() ─→ [unbounded mpsc] ─→ ChunkWriter ─→ .nal  (records, then a 0 byte when finalized)
//!    │                                      └──→ .index (one JSON line per record, then "finished")
//!    └─→ in-memory index: [Fixed, Fixed, ..., Pending]
//! ```
//!
//! `append()` never blocks: the record's position and index entry are computed
//! synchronously, the in-memory index is updated, and the bytes are queued.
//! The writer applies commands strictly in submission order, so the files only
//! ever grow, and resolves each record's `written` signal once its bytes are
//! flushed. Reads wait on those signals instead of on the whole queue.
//!
//! A live chunk's index always ends in a `Pending` slot. Readers that reach
//! the end of a live chunk wait on it; it is resolved by the next append or by
//! `finalize()`.
//!
//! ## Recovery
//!
//! `recover()` trusts the `.index` file only if it parses and its last entry
//! ends exactly at the log size (plus the sentinel byte when finished).
//! Otherwise the log is rescanned, a partial trailing record is cut off, and
//! the index is rewritten. A log that cannot be scanned is reported as
//! `Corrupt` and the caller skips it.
//!
//! ## Reads and removal
//!
//! Reads register under a caller-chosen cancel id. The registration is held
//! by a `ReadGuard` and released when the guard drops. `wait_for_reads()`
//! blocks chunk removal until every registered read has finished or been
//! cancelled, so a caller that never drops its guard starves removal.

use crate::chunk::{
    ChunkId, ChunkMetadata, ExportedChunk, FixedEntry, IndexSlot, ReadOutcome, Selection,
    Selector,
};
use crate::error::{Error, Result};
use crate::signal::Signal;
use framehouse_core::codec::{
    decode_chunk_blob, decode_record, encode_chunk_blob, encode_record, index_line, parse_index,
    render_index, scan_records, ParsedIndex, FINISHED_LINE,
};
use framehouse_core::{IndexEntry, NalRecord, RangeSet, Span, Timestamp};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

// ============================================================================
// Internal: writer commands and state
// ============================================================================

enum ChunkCmd {
    /// Encoded record plus its index line
    Append {
        data: bytes::Bytes,
        line: String,
        written: Signal,
    },

    /// Write the finished sentinel byte and line. Always the last command.
    Finalize,

    /// Reply once every earlier command is on disk
    Barrier(oneshot::Sender<()>),
}

struct PendingRead {
    cancel: Signal,
    done: Signal,
}

struct ChunkState {
    slots: Vec<IndexSlot>,
    size: u64,
    ranges: RangeSet,
    is_live: bool,
    is_moved: bool,
    exporting: bool,
    first_add_seq_num: u64,
    last_add_seq_num: u64,
    reads: HashMap<String, PendingRead>,
}

impl ChunkState {
    fn from_entries(rate: u64, entries: &[IndexEntry], is_live: bool) -> Result<Self> {
        let ranges = build_ranges(rate, entries)?;
        let mut slots: Vec<IndexSlot> = entries
            .iter()
            .map(|entry| {
                IndexSlot::Fixed(FixedEntry {
                    entry: *entry,
                    written: Signal::resolved(),
                })
            })
            .collect();
        if is_live {
            slots.push(IndexSlot::Pending(Signal::new()));
        }

        Ok(Self {
            slots,
            size: entries.last().map(|e| e.end()).unwrap_or(0),
            ranges,
            is_live,
            is_moved: false,
            exporting: false,
            first_add_seq_num: entries.first().map(|e| e.add_seq_num).unwrap_or(0),
            last_add_seq_num: entries.last().map(|e| e.add_seq_num).unwrap_or(0),
            reads: HashMap::new(),
        })
    }

    fn last_entry(&self) -> Option<&IndexEntry> {
        self.slots.iter().rev().find_map(|slot| slot.entry())
    }
}

/// Span to merge into a chunk's ranges for a record at `time`, given the
/// previous record's time. Gaps of at least `min_gap` start a new span.
pub(crate) fn span_for_record(last_time: Option<Timestamp>, time: Timestamp, min_gap: i64) -> Span {
    match last_time {
        Some(last) if time > last && time - last < min_gap => Span::new(last, time, 1),
        _ => Span::point(time),
    }
}

fn build_ranges(rate: u64, entries: &[IndexEntry]) -> Result<RangeSet> {
    let mut ranges = RangeSet::for_rate(rate);
    let mut last_time = None;
    for entry in entries {
        ranges.add_or_extend(span_for_record(last_time, entry.time, ranges.min_gap()))?;
        last_time = Some(entry.time);
    }
    Ok(ranges)
}

/// An index is usable when its entries tile the log exactly.
fn index_matches_log(index: &ParsedIndex, log_len: u64) -> bool {
    let Some(last) = index.entries.last() else {
        return false;
    };
    let contiguous = index.entries.first().map(|e| e.pos) == Some(0)
        && index
            .entries
            .windows(2)
            .all(|pair| pair[1].pos == pair[0].end());
    contiguous && last.end() + u64::from(index.finished) == log_len
}

// ============================================================================
// ChunkLog (public API)
// ============================================================================

pub struct ChunkLog {
    id: ChunkId,
    nal_path: PathBuf,
    index_path: PathBuf,
    state: Mutex<ChunkState>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<ChunkCmd>>>,
    /// Resolved when the writer task has exited (immediately for chunks without one)
    writer_idle: Signal,
    write_error: Arc<Mutex<Option<String>>>,
}

impl ChunkLog {
    /// `.nal` and `.index` paths of a chunk under `dir`
    pub fn paths(dir: &Path, id: &ChunkId) -> (PathBuf, PathBuf) {
        let stem = id.to_string();
        (
            dir.join(format!("{}.nal", stem)),
            dir.join(format!("{}.index", stem)),
        )
    }

    /// Start a new live chunk. `first` names the chunk but is not appended.
    pub async fn create(dir: &Path, first: &NalRecord, sync_writes: bool) -> Result<Arc<Self>> {
        let id = ChunkId::new(first.rate, first.add_seq_num);
        let (nal_path, index_path) = Self::paths(dir, &id);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let log = options.open(&nal_path).await?;
        let index = options.open(&index_path).await?;

        let state = ChunkState::from_entries(id.rate, &[], true)?;
        let chunk = Self::spawn(id, nal_path, index_path, state, Some((log, index)), sync_writes);

        info!(rate = id.rate, chunk = %id, "Chunk created");
        Ok(chunk)
    }

    /// Load a chunk from disk, repairing its index if needed.
    ///
    /// Returns `Ok(None)` for a chunk with no complete records; its files are
    /// removed.
    ///
    /// # Errors
    /// - `Corrupt` if the log cannot be scanned or belongs to another chunk
    /// - `Io` if the files cannot be read or rewritten
    pub async fn recover(dir: &Path, id: ChunkId, sync_writes: bool) -> Result<Option<Arc<Self>>> {
        let (nal_path, index_path) = Self::paths(dir, &id);
        let log = tokio::fs::read(&nal_path).await?;
        let log_len = log.len() as u64;

        let from_index = match tokio::fs::read_to_string(&index_path).await {
            Ok(text) => match parse_index(&text) {
                Ok(parsed) if index_matches_log(&parsed, log_len) => Some(parsed),
                Ok(parsed) => {
                    warn!(
                        chunk = %id,
                        entries = parsed.entries.len(),
                        log_len,
                        "Chunk index disagrees with log size, rescanning"
                    );
                    None
                }
                Err(e) => {
                    warn!(chunk = %id, error = %e, "Chunk index is corrupt, rescanning");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(chunk = %id, path = ?index_path, "Chunk index missing, rescanning");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let (entries, finished, outcome) = match from_index {
            Some(parsed) => (parsed.entries, parsed.finished, "index_ok"),
            None => {
                let scan = scan_records(&log).map_err(|e| Error::Corrupt {
                    path: nal_path.clone(),
                    reason: e.to_string(),
                })?;
                if scan.truncated_tail {
                    warn!(
                        chunk = %id,
                        valid_len = scan.valid_len,
                        log_len,
                        "Partial record at end of chunk log, truncating"
                    );
                    let file = OpenOptions::new().write(true).open(&nal_path).await?;
                    file.set_len(scan.valid_len).await?;
                }
                tokio::fs::write(&index_path, render_index(&scan.entries, scan.finished)?).await?;
                (scan.entries, scan.finished, "rescanned")
            }
        };

        framehouse_observability::metrics::CHUNK_RECOVERIES_TOTAL
            .with_label_values(&[outcome])
            .inc();

        let Some(first) = entries.first() else {
            warn!(chunk = %id, "Chunk has no complete records, removing");
            remove_if_exists(&nal_path).await?;
            remove_if_exists(&index_path).await?;
            return Ok(None);
        };

        let found = ChunkId::new(first.rate, first.add_seq_num);
        if found != id {
            return Err(Error::Corrupt {
                path: nal_path,
                reason: format!("contents belong to {}", found),
            });
        }

        let state = ChunkState::from_entries(id.rate, &entries, !finished)?;
        let files = if finished {
            None
        } else {
            let mut options = OpenOptions::new();
            options.append(true);
            Some((
                options.open(&nal_path).await?,
                options.open(&index_path).await?,
            ))
        };

        info!(
            rate = id.rate,
            chunk = %id,
            records = entries.len(),
            live = !finished,
            outcome,
            "Chunk recovered"
        );

        Ok(Some(Self::spawn(id, nal_path, index_path, state, files, sync_writes)))
    }

    /// Write an exported chunk into `dir` as a finalized chunk.
    pub async fn import(dir: &Path, chunk: &ExportedChunk) -> Result<Arc<Self>> {
        let id = chunk.metadata.chunk_id;
        if chunk.metadata.is_live {
            return Err(Error::ChunkLive(id.to_string()));
        }

        let (entries, log) = decode_chunk_blob(&chunk.data)?;
        let (nal_path, index_path) = Self::paths(dir, &id);

        let mut nal = Vec::with_capacity(log.len() + 1);
        nal.extend_from_slice(&log);
        nal.push(0);
        tokio::fs::write(&nal_path, &nal).await?;
        tokio::fs::write(&index_path, render_index(&entries, true)?).await?;

        let state = ChunkState::from_entries(id.rate, &entries, false)?;
        Ok(Self::spawn(id, nal_path, index_path, state, None, false))
    }

    fn spawn(
        id: ChunkId,
        nal_path: PathBuf,
        index_path: PathBuf,
        state: ChunkState,
        files: Option<(File, File)>,
        sync_writes: bool,
    ) -> Arc<Self> {
        let write_error = Arc::new(Mutex::new(None));
        let writer_idle = Signal::new();

        let cmd_tx = match files {
            Some((log, index)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let writer = ChunkWriter {
                    chunk: id,
                    log,
                    index,
                    sync_writes,
                    failed: false,
                    write_error: write_error.clone(),
                };
                tokio::spawn(writer.run(rx, writer_idle.clone()));
                Some(tx)
            }
            None => {
                writer_idle.resolve();
                None
            }
        };

        Arc::new(Self {
            id,
            nal_path,
            index_path,
            state: Mutex::new(state),
            cmd_tx: Mutex::new(cmd_tx),
            writer_idle,
            write_error,
        })
    }

    fn state(&self) -> MutexGuard<'_, ChunkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_write_error(&self) -> Result<()> {
        let error = self.write_error.lock().unwrap_or_else(PoisonError::into_inner);
        match error.as_ref() {
            Some(message) => Err(Error::WriteFailed(format!("{}: {}", self.id, message))),
            None => Ok(()),
        }
    }

    fn send(&self, cmd: ChunkCmd) -> Result<()> {
        let tx = self.cmd_tx.lock().unwrap_or_else(PoisonError::into_inner);
        tx.as_ref()
            .ok_or_else(|| Error::WriterClosed(self.id.to_string()))?
            .send(cmd)
            .map_err(|_| Error::WriterClosed(self.id.to_string()))
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Append one record to this live chunk.
    ///
    /// Returns as soon as the record is queued; its index entry is visible to
    /// readers immediately and its bytes once the writer flushes.
    ///
    /// # Errors
    /// - `TimeOrder` if `record.time` does not advance past the last record
    /// - `WriterClosed` if the chunk is no longer live
    /// - `WriteFailed` if an earlier write failed
    pub fn append(&self, record: &NalRecord) -> Result<IndexEntry> {
        self.check_write_error()?;
        let data = encode_record(record);

        let mut state = self.state();
        if !state.is_live || state.exporting {
            return Err(Error::WriterClosed(self.id.to_string()));
        }

        let last_time = state.last_entry().map(|e| e.time);
        if let Some(last_time) = last_time {
            if record.time <= last_time {
                return Err(Error::TimeOrder {
                    rate: self.id.rate,
                    time: record.time,
                    last_time,
                });
            }
        }

        let entry = record.index_entry(state.size);
        let line = index_line(&entry)?;
        let span = span_for_record(last_time, record.time, state.ranges.min_gap());
        state.ranges.add_or_extend(span)?;

        let pending = match state.slots.pop() {
            Some(IndexSlot::Pending(signal)) => signal,
            Some(other) => {
                state.slots.push(other);
                error!(chunk = %self.id, "Live chunk index does not end in a pending slot");
                return Err(Error::Corrupt {
                    path: self.nal_path.clone(),
                    reason: "live index without a pending slot".to_string(),
                });
            }
            None => Signal::new(),
        };

        let written = Signal::new();
        state.slots.push(IndexSlot::Fixed(FixedEntry {
            entry,
            written: written.clone(),
        }));
        state.slots.push(IndexSlot::Pending(Signal::new()));
        state.size += entry.len;
        if state.slots.len() == 2 {
            state.first_add_seq_num = record.add_seq_num;
        }
        state.last_add_seq_num = record.add_seq_num;

        self.send(ChunkCmd::Append {
            data,
            line,
            written,
        })?;
        drop(state);

        pending.resolve();
        debug!(chunk = %self.id, pos = entry.pos, len = entry.len, "Record queued");
        Ok(entry)
    }

    /// Mark the chunk finished. Queues the sentinel write; no record can
    /// follow. A no-op on a chunk that is already finalized.
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.state();
        if !state.is_live {
            return Ok(());
        }
        state.is_live = false;
        let pending = if matches!(state.slots.last(), Some(IndexSlot::Pending(_))) {
            match state.slots.pop() {
                Some(IndexSlot::Pending(signal)) => Some(signal),
                _ => None,
            }
        } else {
            None
        };

        let result = self.send(ChunkCmd::Finalize);
        // Dropping the sender lets the writer exit once the sentinel is written.
        self.cmd_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (records, size) = (state.slots.len(), state.size);
        drop(state);

        if let Some(pending) = pending {
            pending.resolve();
        }

        info!(rate = self.id.rate, chunk = %self.id, records, size, "Chunk finalized");
        framehouse_observability::metrics::CHUNKS_FINALIZED_TOTAL
            .with_label_values(&[&self.id.rate.to_string()])
            .inc();
        result
    }

    /// Wait until every queued write is on disk.
    pub async fn drain(&self) -> Result<()> {
        let tx = self
            .cmd_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match tx {
            Some(tx) => {
                let (reply, done) = oneshot::channel();
                tx.send(ChunkCmd::Barrier(reply))
                    .map_err(|_| Error::WriterClosed(self.id.to_string()))?;
                done.await
                    .map_err(|_| Error::WriterClosed(self.id.to_string()))?;
            }
            None => self.writer_idle.wait().await,
        }
        self.check_write_error()
    }

    // ------------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------------

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.state().size
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live
    }

    pub fn is_moved(&self) -> bool {
        self.state().is_moved
    }

    pub fn is_exporting(&self) -> bool {
        self.state().exporting
    }

    /// Set the one-way moved latch. Returns false if it was already set.
    pub fn mark_moved(&self) -> bool {
        let mut state = self.state();
        let was_moved = state.is_moved;
        state.is_moved = true;
        !was_moved
    }

    pub fn first_time(&self) -> Option<Timestamp> {
        self.state().ranges.first().map(|s| s.first_time)
    }

    pub fn last_time(&self) -> Option<Timestamp> {
        self.state().ranges.last().map(|s| s.last_time)
    }

    pub fn last_add_seq_num(&self) -> Option<u64> {
        self.state().last_entry().map(|e| e.add_seq_num)
    }

    pub fn record_count(&self) -> usize {
        self.state()
            .slots
            .iter()
            .filter(|slot| slot.entry().is_some())
            .count()
    }

    /// Snapshot of the in-memory index, pending slot included
    pub fn slots(&self) -> Vec<IndexSlot> {
        self.state().slots.clone()
    }

    /// Fixed index entries in log order
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.state()
            .slots
            .iter()
            .filter_map(|slot| slot.entry().copied())
            .collect()
    }

    pub fn metadata(&self) -> ChunkMetadata {
        let state = self.state();
        ChunkMetadata {
            chunk_id: self.id,
            ranges: state.ranges.spans().to_vec(),
            size: state.size,
            is_live: state.is_live,
            is_moved: state.is_moved,
            first_add_seq_num: state.first_add_seq_num,
            last_add_seq_num: state.last_add_seq_num,
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Register a read under `cancel_id`. The registration lasts until the
    /// returned guard is dropped.
    ///
    /// # Errors
    /// `DuplicateRead` if `cancel_id` is already registered on this chunk.
    pub fn register_read(self: &Arc<Self>, cancel_id: &str) -> Result<ReadGuard> {
        let mut state = self.state();
        if state.reads.contains_key(cancel_id) {
            return Err(Error::DuplicateRead {
                cancel_id: cancel_id.to_string(),
                chunk: self.id.to_string(),
            });
        }
        let cancel = Signal::new();
        state.reads.insert(
            cancel_id.to_string(),
            PendingRead {
                cancel: cancel.clone(),
                done: Signal::new(),
            },
        );
        Ok(ReadGuard {
            chunk: self.clone(),
            cancel_id: cancel_id.to_string(),
            cancel,
        })
    }

    /// Cancel the read registered under `cancel_id`. Returns false if there
    /// is no such read.
    pub fn cancel_read(&self, cancel_id: &str) -> bool {
        match self.state().reads.get(cancel_id) {
            Some(read) => {
                read.cancel.resolve();
                true
            }
            None => false,
        }
    }

    pub fn pending_reads(&self) -> usize {
        self.state().reads.len()
    }

    /// Block until no reads are registered.
    ///
    /// # Errors
    /// `ReadBarrier` if reads are still registered after `max_waits` rounds.
    pub async fn wait_for_reads(&self, max_waits: u32) -> Result<()> {
        let mut waits = 0;
        loop {
            let pending: Vec<Signal> = self
                .state()
                .reads
                .values()
                .map(|read| read.done.clone())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if waits >= max_waits {
                return Err(Error::ReadBarrier {
                    chunk: self.id.to_string(),
                    waits,
                });
            }
            info!(
                chunk = %self.id,
                reads = pending.len(),
                "Waiting for reads to finish before removing chunk"
            );
            futures::future::join_all(pending.iter().map(|done| done.wait())).await;
            waits += 1;
        }
    }

    /// Read `entries` from the log, waiting for any that are not yet flushed.
    pub async fn read_records(
        &self,
        entries: &[IndexEntry],
        cancel: &Signal,
    ) -> Result<ReadOutcome<Vec<NalRecord>>> {
        if entries.is_empty() {
            return Ok(ReadOutcome::Ready(Vec::new()));
        }

        let unwritten: Vec<Signal> = {
            let state = self.state();
            let mut unwritten = Vec::new();
            for entry in entries {
                let idx = state
                    .slots
                    .partition_point(|slot| slot.entry().map_or(false, |e| e.pos < entry.pos));
                match state.slots.get(idx) {
                    Some(IndexSlot::Fixed(fixed)) if fixed.entry.pos == entry.pos => {
                        if !fixed.written.is_resolved() {
                            unwritten.push(fixed.written.clone());
                        }
                    }
                    _ => {
                        return Err(Error::Corrupt {
                            path: self.nal_path.clone(),
                            reason: format!("no record at position {}", entry.pos),
                        })
                    }
                }
            }
            unwritten
        };

        let work = async {
            for written in &unwritten {
                written.wait().await;
            }
            self.check_write_error()?;
            self.read_from_disk(entries).await
        };

        tokio::select! {
            biased;
            _ = cancel.wait() => {
                framehouse_observability::metrics::READS_CANCELLED_TOTAL.inc();
                Ok(ReadOutcome::Cancelled)
            }
            result = work => result.map(ReadOutcome::Ready),
        }
    }

    /// Contiguous entries are read with one seek and one read.
    async fn read_from_disk(&self, entries: &[IndexEntry]) -> Result<Vec<NalRecord>> {
        let mut file = File::open(&self.nal_path).await?;
        let mut records = Vec::with_capacity(entries.len());

        let mut start = 0;
        while start < entries.len() {
            let mut end = start + 1;
            while end < entries.len() && entries[end].pos == entries[end - 1].end() {
                end += 1;
            }
            let run = &entries[start..end];
            let base = run[0].pos;
            let mut buf = vec![0u8; (run[run.len() - 1].end() - base) as usize];
            file.seek(SeekFrom::Start(base)).await?;
            file.read_exact(&mut buf).await?;

            for entry in run {
                let offset = (entry.pos - base) as usize;
                records.push(decode_record(&buf[offset..offset + entry.len as usize], entry.pos)?);
            }
            start = end;
        }
        Ok(records)
    }

    /// Read whatever `selector` picks from this chunk, re-running it after
    /// every wait on the live tail.
    pub async fn read_selected(
        self: &Arc<Self>,
        cancel_id: &str,
        selector: &mut Selector<'_>,
    ) -> Result<ReadOutcome<Vec<NalRecord>>> {
        if self.is_moved() {
            return Err(Error::ChunkMoved(self.id.to_string()));
        }
        let guard = self.register_read(cancel_id)?;

        loop {
            if guard.cancel.is_resolved() {
                framehouse_observability::metrics::READS_CANCELLED_TOTAL.inc();
                return Ok(ReadOutcome::Cancelled);
            }
            let slots = self.slots();
            match selector(&slots)? {
                Selection::Read(entries) => {
                    return self.read_records(&entries, &guard.cancel).await;
                }
                Selection::Wait(signal) => {
                    tokio::select! {
                        biased;
                        _ = guard.cancel.wait() => {
                            framehouse_observability::metrics::READS_CANCELLED_TOTAL.inc();
                            return Ok(ReadOutcome::Cancelled);
                        }
                        _ = signal.wait() => {}
                    }
                }
                Selection::Skip => return Ok(ReadOutcome::Ready(Vec::new())),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Export and removal
    // ------------------------------------------------------------------------

    /// Serialize this finalized chunk for another tier.
    ///
    /// # Errors
    /// - `ChunkLive` if the chunk is still live
    /// - `ChunkExporting` if an export already started
    pub async fn export(&self) -> Result<ExportedChunk> {
        {
            let mut state = self.state();
            if state.is_live {
                return Err(Error::ChunkLive(self.id.to_string()));
            }
            if state.exporting {
                return Err(Error::ChunkExporting(self.id.to_string()));
            }
            state.exporting = true;
        }

        let result = self.export_blob().await;
        if result.is_err() {
            self.state().exporting = false;
        }
        result
    }

    async fn export_blob(&self) -> Result<ExportedChunk> {
        self.drain().await?;

        let entries = self.entries();
        let records_len = entries.last().map(|e| e.end()).unwrap_or(0) as usize;
        let mut log = tokio::fs::read(&self.nal_path).await?;
        if log.len() < records_len {
            return Err(Error::Corrupt {
                path: self.nal_path.clone(),
                reason: format!("log has {} bytes, index needs {}", log.len(), records_len),
            });
        }
        log.truncate(records_len);

        let data = encode_chunk_blob(&entries, &log)?;
        let mut metadata = self.metadata();
        metadata.is_moved = false;
        Ok(ExportedChunk { metadata, data })
    }

    /// Delete both files. Missing files are not an error.
    pub async fn delete_files(&self) -> Result<()> {
        remove_if_exists(&self.nal_path).await?;
        remove_if_exists(&self.index_path).await?;
        debug!(chunk = %self.id, "Chunk files deleted");
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Registration of one read against a chunk
pub struct ReadGuard {
    chunk: Arc<ChunkLog>,
    cancel_id: String,
    cancel: Signal,
}

impl ReadGuard {
    /// Resolved when the read is cancelled
    pub fn cancelled(&self) -> &Signal {
        &self.cancel
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if let Some(read) = self.chunk.state().reads.remove(&self.cancel_id) {
            read.done.resolve();
        }
    }
}

// ============================================================================
// Writer Task (internal)
// ============================================================================

/// Owns the chunk's files. Applies commands in order, flushing once per
/// batch of commands that were already queued, then resolves the batch's
/// `written` signals and barriers.
struct ChunkWriter {
    chunk: ChunkId,
    log: File,
    index: File,
    sync_writes: bool,
    /// After the first failure nothing more is written
    failed: bool,
    write_error: Arc<Mutex<Option<String>>>,
}

impl ChunkWriter {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ChunkCmd>, idle: Signal) {
        while let Some(first) = rx.recv().await {
            let mut written = Vec::new();
            let mut barriers = Vec::new();

            // A failed write may have been partial, so nothing after it in
            // the batch may land in the files
            let mut next = Some(first);
            while let Some(cmd) = next {
                if let Err(e) = self.apply(cmd, &mut written, &mut barriers).await {
                    self.fail(e);
                }
                next = rx.try_recv().ok();
            }
            if !self.failed {
                if let Err(e) = self.flush().await {
                    self.fail(e);
                }
            }

            for signal in written {
                signal.resolve();
            }
            for barrier in barriers {
                let _ = barrier.send(());
            }
        }

        if !self.failed {
            if let Err(e) = self.flush().await {
                self.fail(e);
            }
        }
        idle.resolve();
    }

    async fn apply(
        &mut self,
        cmd: ChunkCmd,
        written: &mut Vec<Signal>,
        barriers: &mut Vec<oneshot::Sender<()>>,
    ) -> std::io::Result<()> {
        match cmd {
            ChunkCmd::Append {
                data,
                line,
                written: signal,
            } => {
                written.push(signal);
                if !self.failed {
                    self.log.write_all(&data).await?;
                    self.index.write_all(line.as_bytes()).await?;
                }
            }
            ChunkCmd::Finalize => {
                if !self.failed {
                    self.log.write_all(&[0]).await?;
                    self.index
                        .write_all(format!("{}\n", FINISHED_LINE).as_bytes())
                        .await?;
                }
            }
            ChunkCmd::Barrier(reply) => barriers.push(reply),
        }
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.log.flush().await?;
        self.index.flush().await?;
        if self.sync_writes {
            self.log.sync_data().await?;
            self.index.sync_data().await?;
        }
        Ok(())
    }

    fn fail(&mut self, e: std::io::Error) {
        error!(chunk = %self.chunk, error = %e, "Chunk write failed");
        self.failed = true;
        let mut slot = self
            .write_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(e.to_string());
        }
    }
}
