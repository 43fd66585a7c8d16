//! Message log file shared between processes.
//!
//! Layout of `messages.log`:
//!
//! ```text
//! header:  magic "PCL\0" | version | flags | generation u64 | next_id u64
//! record:  magic "MSG\0" | version | flags | id u64 | timestamp i64
//!          | sender_len u16 | encoding u8 | payload_len u32
//!          | crc32(id .. payload_len)
//!          | sender | payload | crc32(sender ++ payload)
//! ```
//!
//! Every handle keeps its own id → offset index and extends it by reading
//! whatever other writers appended since its last look. Deletes set the
//! record's flag byte in place. All file access happens under an advisory
//! lock: shared for reads, exclusive for append, delete and compaction.
//!
//! Compaction first commits the surviving records to `messages.compact`
//! and marks the header as compacting. Only then is the log rewritten,
//! truncated and given a new generation, which tells other handles to
//! rebuild their index. A handle that finds the mark left behind by a
//! crashed process replays the journal before doing anything else.
//!
//! Record lengths sit under their own checksum, so a record cut short by
//! end of file can only be an interrupted append. Anything else that fails
//! to parse is reported as corruption.

use super::{CompactionStats, MessageIter, MessageStore, StoreBackend};
use crate::error::{Result, StoreError};
use crate::types::{Message, MessageId, MessageInput, PayloadEncoding, SessionId, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Magic bytes for the log header.
const LOG_MAGIC: &[u8; 4] = b"PCL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Log header size.
const HEADER_SIZE: u64 = 4 + 1 + 1 + 8 + 8; // magic + version + flags + generation + next_id

/// Magic bytes for each record.
const RECORD_MAGIC: &[u8; 4] = b"MSG\0";

/// Current record format version.
const RECORD_VERSION: u8 = 1;

/// Fixed record head: magic + version + flags + id + timestamp
/// + sender_len + encoding + payload_len + head checksum.
const RECORD_HEAD_SIZE: usize = 4 + 1 + 1 + 8 + 8 + 2 + 1 + 4 + 4;

/// Bytes of the head covered by its checksum (id through payload_len).
const RECORD_HEAD_CHECKED: std::ops::Range<usize> = 6..29;

/// Largest payload a record may carry.
pub const MAX_PAYLOAD_LEN: usize = 100 * 1024 * 1024;

/// Position of the flags byte inside a record.
const RECORD_FLAGS_OFFSET: u64 = 5;

/// Record flag: deleted.
const FLAG_DELETED: u8 = 0x01;

/// Header flag: a compaction journal is committed but not yet applied.
const HEADER_FLAG_COMPACTING: u8 = 0x01;

/// File name of the log inside a namespace directory.
const LOG_FILE: &str = "messages.log";

/// Records a compaction is about to write over the log.
const COMPACT_JOURNAL: &str = "messages.compact";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LogHeader {
    generation: u64,
    next_id: u64,
    compacting: bool,
}

/// A record as found on disk.
struct LogEntry {
    message: Message,
    deleted: bool,
    /// Encoded size in bytes.
    len: u64,
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Result of re-reading one offset during a scan.
enum ScanStep {
    Live(Message),
    Deleted,
    /// The log was compacted since the offsets were taken.
    Stale,
}

/// Backend keeping one log file per namespace under a root directory.
#[derive(Clone, Debug)]
pub struct FileBackend {
    root: PathBuf,
    sync_interval: u64,
}

impl FileBackend {
    /// Default sync interval - sync every 100 appends.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sync_interval: Self::DEFAULT_SYNC_INTERVAL,
        }
    }

    /// Sync to disk every `interval` appends (0 and 1 both mean every append).
    pub fn with_sync_interval(mut self, interval: u64) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StoreBackend for FileBackend {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn is_available(&self) -> bool {
        if fs::create_dir_all(&self.root).is_err() {
            return false;
        }
        fs::metadata(&self.root)
            .map(|m| m.is_dir() && !m.permissions().readonly())
            .unwrap_or(false)
    }

    fn open(&self, namespace: &str) -> Result<Arc<dyn MessageStore>> {
        let store = FileStore::open(self.root.join(namespace), self.sync_interval)?;
        Ok(Arc::new(store))
    }
}

/// Per-handle view of the log file.
struct LogView {
    file: File,

    /// Compaction journal next to the log.
    journal: PathBuf,

    /// Generation the index was built against.
    generation: u64,

    /// End of the last fully read record.
    scanned_to: u64,

    /// Highest id ever observed, deleted or not.
    max_id: MessageId,

    /// Live records: id -> offset.
    index: BTreeMap<MessageId, u64>,

    writes_since_sync: u64,
}

impl LogView {
    /// Run `f` while holding the file lock.
    fn with_lock<T>(&mut self, mode: LockMode, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        match mode {
            LockMode::Shared => FileExt::lock_shared(&self.file)?,
            LockMode::Exclusive => FileExt::lock_exclusive(&self.file)?,
        }
        let result = f(self);
        let unlocked = FileExt::unlock(&self.file);
        let value = result?;
        unlocked?;
        Ok(value)
    }

    /// Catch up with records appended by other handles.
    ///
    /// Fails with `CompactionInterrupted` while a crashed compaction is
    /// still pending; see `resume_compaction`.
    fn refresh(&mut self) -> Result<()> {
        let header = read_header(&self.file)?;
        if header.compacting {
            return Err(StoreError::CompactionInterrupted);
        }
        let end = self.file.metadata()?.len();

        if header.generation != self.generation || end < self.scanned_to {
            self.index.clear();
            self.scanned_to = HEADER_SIZE;
            self.generation = header.generation;
        }

        let mut offset = self.scanned_to;
        while offset < end {
            let entry = match read_entry(&self.file, offset) {
                Ok(entry) => entry,
                // Lengths are checksummed, so this is an interrupted append.
                // The next append overwrites it.
                Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            self.max_id = self.max_id.max(entry.message.id);
            if !entry.deleted {
                self.index.insert(entry.message.id, offset);
            }
            offset += entry.len;
        }
        self.scanned_to = offset;

        Ok(())
    }

    fn append(&mut self, input: MessageInput, sync_interval: u64) -> Result<MessageId> {
        let header = read_header(&self.file)?;
        let id = MessageId(header.next_id.max(self.max_id.0 + 1));
        let message = input.into_message(id);
        let bytes = encode_record(&message, 0)?;

        let offset = self.scanned_to;
        let end = offset + bytes.len() as u64;

        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&bytes)?;
        if file.metadata()?.len() > end {
            file.set_len(end)?;
        }

        write_header(
            &self.file,
            LogHeader {
                next_id: id.0 + 1,
                ..header
            },
        )?;

        self.index.insert(id, offset);
        self.scanned_to = end;
        self.max_id = id;

        self.writes_since_sync += 1;
        if self.writes_since_sync >= sync_interval.max(1) {
            self.file.sync_all()?;
            self.writes_since_sync = 0;
        }

        Ok(id)
    }

    fn read_from(&mut self, after: MessageId) -> Result<Vec<Message>> {
        let offsets: Vec<(MessageId, u64)> = self
            .index
            .range(after.next()..)
            .map(|(id, offset)| (*id, *offset))
            .collect();

        let mut messages = Vec::with_capacity(offsets.len());
        for (id, offset) in offsets {
            let entry = read_entry(&self.file, offset)?;
            if entry.deleted {
                self.index.remove(&id);
                continue;
            }
            messages.push(entry.message);
        }
        Ok(messages)
    }

    fn read_live(&self, generation: u64, offset: u64) -> Result<ScanStep> {
        let header = read_header(&self.file)?;
        if header.compacting || header.generation != generation {
            return Ok(ScanStep::Stale);
        }
        let entry = read_entry(&self.file, offset)?;
        if entry.deleted {
            Ok(ScanStep::Deleted)
        } else {
            Ok(ScanStep::Live(entry.message))
        }
    }

    fn delete(&mut self, id: MessageId) -> Result<()> {
        let Some(offset) = self.index.remove(&id) else {
            return Ok(());
        };
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset + RECORD_FLAGS_OFFSET))?;
        file.write_all(&[FLAG_DELETED])?;
        Ok(())
    }

    /// Rewrite the log without deleted records once they outnumber live ones.
    fn compact(&mut self) -> Result<CompactionStats> {
        let mut live = Vec::new();
        let mut dead = 0;
        let mut offset = HEADER_SIZE;
        while offset < self.scanned_to {
            let entry = read_entry(&self.file, offset)?;
            if entry.deleted {
                dead += 1;
            } else {
                live.push(entry.message);
            }
            offset += entry.len;
        }

        if dead == 0 || dead < live.len() {
            return Ok(CompactionStats {
                live: live.len(),
                dead,
                bytes_freed: 0,
                rewritten: false,
            });
        }

        let mut buf = Vec::new();
        let mut index = BTreeMap::new();
        for message in &live {
            index.insert(message.id, HEADER_SIZE + buf.len() as u64);
            buf.extend_from_slice(&encode_record(message, 0)?);
        }
        let new_end = HEADER_SIZE + buf.len() as u64;
        let old_end = self.file.metadata()?.len();

        // The journal must be durable before the header points at it.
        let mut journal = File::create(&self.journal)?;
        journal.write_all(&buf)?;
        journal.sync_all()?;
        drop(journal);

        let header = read_header(&self.file)?;
        let pending = LogHeader {
            generation: header.generation,
            next_id: header.next_id.max(self.max_id.0 + 1),
            compacting: true,
        };
        write_header(&self.file, pending)?;
        self.file.sync_all()?;

        self.apply_compaction(&buf, pending)?;
        self.index = index;
        self.scanned_to = new_end;

        Ok(CompactionStats {
            live: live.len(),
            dead,
            bytes_freed: old_end.saturating_sub(new_end),
            rewritten: true,
        })
    }

    /// Write `records` over the log body, truncate and move to the next
    /// generation. Safe to repeat if interrupted.
    fn apply_compaction(&mut self, records: &[u8], pending: LogHeader) -> Result<()> {
        let new_end = HEADER_SIZE + records.len() as u64;

        let mut file = &self.file;
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        file.write_all(records)?;
        file.set_len(new_end)?;

        let generation = pending.generation.wrapping_add(1);
        write_header(
            &self.file,
            LogHeader {
                generation,
                next_id: pending.next_id,
                compacting: false,
            },
        )?;
        self.file.sync_all()?;
        remove_journal(&self.journal)?;

        self.generation = generation;
        self.index.clear();
        self.scanned_to = HEADER_SIZE;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Finish a compaction left pending by a crashed process.
    ///
    /// Needs the exclusive lock. Without a pending mark, a leftover journal
    /// was never committed and is dropped.
    fn resume_compaction(&mut self) -> Result<()> {
        let header = read_header(&self.file)?;
        if !header.compacting {
            return remove_journal(&self.journal);
        }

        let records = match fs::read(&self.journal) {
            Ok(records) => records,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::InvalidFormat(
                    "Log is marked as compacting but the journal is missing".into(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        warn!(
            journal = %self.journal.display(),
            bytes = records.len(),
            "resuming interrupted log compaction"
        );
        self.apply_compaction(&records, header)
    }
}

/// Handle to a message log file.
pub struct FileStore {
    /// Path to the log file.
    path: PathBuf,

    /// None once closed.
    view: Mutex<Option<LogView>>,

    /// Sync every N appends.
    sync_interval: u64,
}

impl FileStore {
    /// Open or create the log inside `dir`.
    pub fn open(dir: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        let journal = dir.join(COMPACT_JOURNAL);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut view = LogView {
            file,
            journal,
            generation: 0,
            scanned_to: HEADER_SIZE,
            max_id: MessageId(0),
            index: BTreeMap::new(),
            writes_since_sync: 0,
        };

        view.with_lock(LockMode::Exclusive, |v| {
            if v.file.metadata()?.len() == 0 {
                write_header(
                    &v.file,
                    LogHeader {
                        generation: 0,
                        next_id: 1,
                        compacting: false,
                    },
                )?;
                v.file.sync_all()?;
            }
            v.resume_compaction()?;
            let header = read_header(&v.file)?;
            v.generation = header.generation;
            v.refresh()
        })?;

        Ok(Self {
            path,
            view: Mutex::new(Some(view)),
            sync_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live messages known to this handle.
    pub fn len(&self) -> Result<usize> {
        self.with_view(LockMode::Shared, |v| Ok(v.index.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Current log file size.
    pub fn size(&self) -> Result<u64> {
        self.with_view(LockMode::Shared, |v| Ok(v.file.metadata()?.len()))
    }

    /// Refresh under the lock, then run `f`.
    ///
    /// A pending compaction is finished under the exclusive lock first.
    fn with_view<T>(&self, mode: LockMode, f: impl FnOnce(&mut LogView) -> Result<T>) -> Result<T> {
        let mut guard = self.view.lock();
        let view = guard.as_mut().ok_or(StoreError::Closed)?;

        let mut task = Some(f);
        let done = view.with_lock(mode, |v| match v.refresh() {
            Ok(()) => match task.take() {
                Some(f) => f(v).map(Some),
                None => Ok(None),
            },
            Err(StoreError::CompactionInterrupted) => Ok(None),
            Err(e) => Err(e),
        })?;
        if let Some(value) = done {
            return Ok(value);
        }

        view.with_lock(LockMode::Exclusive, |v| v.resume_compaction())?;
        let f = task.ok_or(StoreError::CompactionInterrupted)?;
        view.with_lock(mode, |v| {
            v.refresh()?;
            f(v)
        })
    }

    /// Generation and offsets of live records with id >= `from`.
    fn snapshot_from(&self, from: MessageId) -> Result<(u64, Vec<(MessageId, u64)>)> {
        self.with_view(LockMode::Shared, |v| {
            let offsets = v
                .index
                .range(from..)
                .map(|(id, offset)| (*id, *offset))
                .collect();
            Ok((v.generation, offsets))
        })
    }

    fn read_live(&self, generation: u64, offset: u64) -> Result<ScanStep> {
        let mut guard = self.view.lock();
        let view = guard.as_mut().ok_or(StoreError::Closed)?;
        view.with_lock(LockMode::Shared, |v| v.read_live(generation, offset))
    }
}

impl MessageStore for FileStore {
    fn append(&self, input: MessageInput) -> Result<MessageId> {
        let sync_interval = self.sync_interval;
        self.with_view(LockMode::Exclusive, |v| v.append(input, sync_interval))
    }

    fn read_from(&self, after: MessageId) -> Result<Vec<Message>> {
        self.with_view(LockMode::Shared, |v| v.read_from(after))
    }

    fn scan(&self) -> Result<MessageIter<'_>> {
        let (generation, offsets) = self.snapshot_from(MessageId(0))?;
        Ok(Box::new(FileScan {
            store: self,
            generation,
            offsets: offsets.into_iter(),
            done: false,
        }))
    }

    fn delete(&self, id: MessageId) -> Result<()> {
        self.with_view(LockMode::Exclusive, |v| v.delete(id))
    }

    fn compact(&self) -> Result<CompactionStats> {
        self.with_view(LockMode::Exclusive, |v| v.compact())
    }

    fn close(&self) -> Result<()> {
        if let Some(view) = self.view.lock().take() {
            view.file.sync_all()?;
        }
        Ok(())
    }
}

/// Lazy ascending scan over a log file.
///
/// Each step re-reads one record under a shared lock. If the log was
/// compacted in between, the remaining offsets are re-taken from the
/// rebuilt index.
struct FileScan<'a> {
    store: &'a FileStore,
    generation: u64,
    offsets: std::vec::IntoIter<(MessageId, u64)>,
    done: bool,
}

impl Iterator for FileScan<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let (id, offset) = self.offsets.next()?;
            match self.store.read_live(self.generation, offset) {
                Ok(ScanStep::Live(message)) => return Some(Ok(message)),
                Ok(ScanStep::Deleted) => continue,
                Ok(ScanStep::Stale) => match self.store.snapshot_from(id) {
                    Ok((generation, offsets)) => {
                        self.generation = generation;
                        self.offsets = offsets.into_iter();
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                },
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(arr)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(arr)
}

fn remove_journal(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn read_header(mut file: &File) -> Result<LogHeader> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut buf)?;

    if &buf[0..4] != LOG_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid log magic".into()));
    }
    if buf[4] != LOG_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported log version: {}",
            buf[4]
        )));
    }

    Ok(LogHeader {
        generation: le_u64(&buf[6..14]),
        next_id: le_u64(&buf[14..22]),
        compacting: buf[5] & HEADER_FLAG_COMPACTING != 0,
    })
}

fn write_header(mut file: &File, header: LogHeader) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
    buf.extend_from_slice(LOG_MAGIC);
    buf.push(LOG_VERSION);
    buf.push(if header.compacting {
        HEADER_FLAG_COMPACTING
    } else {
        0
    });
    buf.extend_from_slice(&header.generation.to_le_bytes());
    buf.extend_from_slice(&header.next_id.to_le_bytes());

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn record_checksum(sender: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(sender);
    hasher.update(payload);
    hasher.finalize()
}

fn encode_record(message: &Message, flags: u8) -> Result<Vec<u8>> {
    let sender = message.sender.as_str().as_bytes();
    let sender_len = u16::try_from(sender.len())
        .map_err(|_| StoreError::Serialization("Sender id too long".into()))?;
    if message.payload.len() > MAX_PAYLOAD_LEN {
        return Err(StoreError::Serialization(format!(
            "Payload of {} bytes exceeds the {} byte limit",
            message.payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }
    let payload_len = message.payload.len() as u32;

    let mut buf = Vec::with_capacity(RECORD_HEAD_SIZE + sender.len() + message.payload.len() + 4);
    buf.extend_from_slice(RECORD_MAGIC);
    buf.push(RECORD_VERSION);
    buf.push(flags);
    buf.extend_from_slice(&message.id.0.to_le_bytes());
    buf.extend_from_slice(&message.timestamp.0.to_le_bytes());
    buf.extend_from_slice(&sender_len.to_le_bytes());
    buf.push(message.encoding.to_byte());
    buf.extend_from_slice(&payload_len.to_le_bytes());
    let head_checksum = crc32fast::hash(&buf[RECORD_HEAD_CHECKED]);
    buf.extend_from_slice(&head_checksum.to_le_bytes());

    buf.extend_from_slice(sender);
    buf.extend_from_slice(&message.payload);
    buf.extend_from_slice(&record_checksum(sender, &message.payload).to_le_bytes());

    Ok(buf)
}

fn read_entry(mut file: &File, offset: u64) -> Result<LogEntry> {
    file.seek(SeekFrom::Start(offset))?;

    let mut head = [0u8; RECORD_HEAD_SIZE];
    file.read_exact(&mut head)?;
    if &head[0..4] != RECORD_MAGIC {
        return Err(StoreError::InvalidFormat(format!(
            "Invalid record magic at offset {}",
            offset
        )));
    }
    if head[4] != RECORD_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported record version: {}",
            head[4]
        )));
    }

    let stored_head = le_u32(&head[29..33]);
    let computed_head = crc32fast::hash(&head[RECORD_HEAD_CHECKED]);
    if stored_head != computed_head {
        return Err(StoreError::ChecksumMismatch {
            expected: stored_head,
            got: computed_head,
        });
    }

    let flags = head[5];
    let id = MessageId(le_u64(&head[6..14]));
    let timestamp = Timestamp(le_u64(&head[14..22]) as i64);
    let sender_len = u16::from_le_bytes([head[22], head[23]]) as usize;
    let encoding = PayloadEncoding::from_byte(head[24])?;
    let payload_len = le_u32(&head[25..29]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(StoreError::InvalidFormat(format!(
            "Record at offset {} claims {} payload bytes",
            offset, payload_len
        )));
    }

    // Sender, payload and checksum
    let mut body = vec![0u8; sender_len + payload_len + 4];
    file.read_exact(&mut body)?;
    let sender = String::from_utf8_lossy(&body[..sender_len]).into_owned();
    let payload = body[sender_len..sender_len + payload_len].to_vec();
    let stored_checksum = le_u32(&body[sender_len + payload_len..]);
    let computed_checksum = record_checksum(&body[..sender_len], &payload);

    if stored_checksum != computed_checksum {
        return Err(StoreError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let len = (RECORD_HEAD_SIZE + body.len()) as u64;

    Ok(LogEntry {
        message: Message {
            id,
            sender: SessionId(sender),
            timestamp,
            payload,
            encoding,
        },
        deleted: flags & FLAG_DELETED != 0,
        len,
    })
}
