//! File Entry Cache with Reference-Counted Readers
//!
//! This module implements the cache behind the static file handler.
//! Open files are kept as shared [`FsFile`] entries keyed by absolute path,
//! so concurrent requests for the same file share one descriptor and one
//! set of metadata instead of re-opening and re-stating per request.
//!
//! ## Design Decisions
//!
//! 1. **Two maps**: identity entries and pre-compressed variants are cached
//!    separately; a path can legitimately appear in both.
//! 2. **Reader counts**: every live reader holds a count on its entry. The
//!    sweeper only evicts entries with a zero count. A count that goes
//!    negative is a release-discipline bug and panics immediately.
//! 3. **Big vs small readers**: large files get a dedicated descriptor per
//!    reader (sequential reads, descriptor pooled on clean release); small
//!    files share the entry's descriptor via positional reads, or copy from
//!    the in-memory buffer for generated directory indexes.

use bytes::Bytes;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tracing::{debug, trace};

use crate::protocol::response::BodyReader;

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

/// A reader over one file entry, with an adjustable serving window.
pub trait FileReader: BodyReader {
    /// Restricts subsequent reads to the inclusive byte range `start..=end`.
    /// Must be called before the first read.
    fn update_byte_range(&mut self, start: usize, end: usize) -> io::Result<()>;
}

/// A cached open file (or generated directory index).
pub struct FsFile {
    path: PathBuf,
    /// Backing descriptor. `None` for generated directory indexes.
    file: Option<File>,
    /// In-memory content for generated directory indexes.
    dir_index: Bytes,

    pub content_length: usize,
    pub content_type: String,
    pub last_modified: SystemTime,
    /// Pre-rendered IMF-fixdate form of `last_modified`.
    pub last_modified_str: String,
    /// Entry serves pre-compressed content.
    pub compressed: bool,

    big: bool,
    readers: AtomicI64,
    last_access: Mutex<Instant>,
    /// Spare descriptors released by big readers that rewound cleanly.
    spare_files: Mutex<Vec<File>>,
}

impl FsFile {
    /// Wraps an open descriptor.
    pub fn from_file(
        path: PathBuf,
        file: File,
        content_length: usize,
        content_type: String,
        last_modified: SystemTime,
        last_modified_str: String,
        compressed: bool,
        big: bool,
    ) -> Self {
        Self {
            path,
            file: Some(file),
            dir_index: Bytes::new(),
            content_length,
            content_type,
            last_modified,
            last_modified_str,
            compressed,
            big,
            readers: AtomicI64::new(0),
            last_access: Mutex::new(Instant::now()),
            spare_files: Mutex::new(Vec::new()),
        }
    }

    /// Wraps a generated directory index page.
    pub fn from_dir_index(
        path: PathBuf,
        index: Bytes,
        last_modified: SystemTime,
        last_modified_str: String,
    ) -> Self {
        let content_length = index.len();
        Self {
            path,
            file: None,
            dir_index: index,
            content_length,
            content_type: "text/html; charset=utf-8".to_string(),
            last_modified,
            last_modified_str,
            compressed: false,
            big: false,
            readers: AtomicI64::new(0),
            last_access: Mutex::new(Instant::now()),
            spare_files: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn is_big(&self) -> bool {
        self.big
    }

    /// Creates a reader over the whole entry and takes a reader count.
    /// The count is released by the reader's `close`.
    pub fn reader(self: &Arc<Self>) -> io::Result<Box<dyn FileReader>> {
        if self.big {
            let file = match self.pop_spare() {
                Some(f) => f,
                None => File::open(&self.path)?,
            };
            self.readers.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(BigFileReader {
                entry: Arc::clone(self),
                file: Some(file),
                offset: 0,
                limit: self.content_length as u64,
            }))
        } else {
            self.readers.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SmallFileReader {
                entry: Some(Arc::clone(self)),
                offset: 0,
                limit: self.content_length,
                pool: None,
            }))
        }
    }

    /// Binds a pooled small-reader shell to this entry, taking a reader
    /// count. Panics if the entry is big.
    pub fn bind_small_reader(self: &Arc<Self>, shell: &mut SmallFileReader) {
        assert!(!self.big, "small reader bound to a big entry");
        self.readers.fetch_add(1, Ordering::SeqCst);
        shell.entry = Some(Arc::clone(self));
        shell.offset = 0;
        shell.limit = self.content_length;
    }

    pub fn reader_count(&self) -> i64 {
        self.readers.load(Ordering::SeqCst)
    }

    pub(crate) fn dec_readers(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            panic!(
                "negative reader count for {}: release called on an already \
                 released reader",
                self.path.display()
            );
        }
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_access.lock() {
            *t = Instant::now();
        }
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_access
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn pop_spare(&self) -> Option<File> {
        self.spare_files.lock().ok().and_then(|mut v| v.pop())
    }

    fn push_spare(&self, file: File) {
        if let Ok(mut v) = self.spare_files.lock() {
            v.push(file);
        }
    }

    #[cfg(test)]
    pub(crate) fn spare_count(&self) -> usize {
        self.spare_files.lock().map(|v| v.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for FsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsFile")
            .field("path", &self.path)
            .field("content_length", &self.content_length)
            .field("big", &self.big)
            .field("readers", &self.reader_count())
            .finish()
    }
}

/// Reader for big entries: owns its descriptor and reads sequentially.
///
/// On a clean release (all bytes consumed, or after a successful rewind)
/// the descriptor goes back to the entry's spare pool for the next reader;
/// otherwise it is closed.
pub struct BigFileReader {
    entry: Arc<FsFile>,
    file: Option<File>,
    offset: u64,
    limit: u64,
}

impl FileReader for BigFileReader {
    fn update_byte_range(&mut self, start: usize, end: usize) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "reader closed"))?;
        file.seek(SeekFrom::Start(start as u64))?;
        self.offset = start as u64;
        self.limit = end as u64 + 1;
        Ok(())
    }
}

impl BodyReader for BigFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.limit.saturating_sub(self.offset) as usize;
        if remaining == 0 {
            return Ok(0);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "reader closed"))?;
        let want = remaining.min(buf.len());
        let n = file.read(&mut buf[..want])?;
        self.offset += n as u64;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        // Pool the descriptor only if it can be rewound for the next
        // reader; otherwise let it close.
        match file.seek(SeekFrom::Start(0)) {
            Ok(_) => self.entry.push_spare(file),
            Err(e) => {
                debug!(error = %e, "big reader rewind failed, dropping descriptor");
                drop(file);
            }
        }
        self.entry.dec_readers();
        Ok(())
    }
}

impl Drop for BigFileReader {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = self.close();
        }
    }
}

/// Reader for small entries: no descriptor of its own.
///
/// Descriptor-backed entries are read positionally through the shared
/// descriptor; generated directory indexes are copied straight out of the
/// in-memory buffer. Shells are reusable: a handler hands each reader its
/// pool, and `close` repopulates the pool with a fresh shell.
#[derive(Default)]
pub struct SmallFileReader {
    entry: Option<Arc<FsFile>>,
    offset: usize,
    limit: usize,
    pool: Option<Arc<crossbeam::queue::ArrayQueue<SmallFileReader>>>,
}

impl SmallFileReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_pool(&mut self, pool: Arc<crossbeam::queue::ArrayQueue<SmallFileReader>>) {
        self.pool = Some(pool);
    }
}

impl FileReader for SmallFileReader {
    fn update_byte_range(&mut self, start: usize, end: usize) -> io::Result<()> {
        self.offset = start;
        self.limit = end + 1;
        Ok(())
    }
}

impl BodyReader for SmallFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "reader closed"))?;
        let remaining = self.limit.saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(0);
        }
        let want = remaining.min(buf.len());

        let n = match &entry.file {
            Some(file) => read_at(file, &mut buf[..want], self.offset as u64)?,
            None => {
                buf[..want].copy_from_slice(&entry.dir_index[self.offset..self.offset + want]);
                want
            }
        };
        self.offset += n;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(entry) = self.entry.take() {
            entry.dec_readers();
        }
        self.offset = 0;
        self.limit = 0;
        if let Some(pool) = self.pool.take() {
            let _ = pool.push(SmallFileReader::new());
        }
        Ok(())
    }
}

impl Drop for SmallFileReader {
    fn drop(&mut self) {
        if self.entry.is_some() {
            let _ = self.close();
        }
    }
}

/// Which of the two cache maps an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Identity,
    Compressed,
}

/// Path-keyed cache of open file entries.
#[derive(Default)]
pub struct FileCache {
    identity: Mutex<HashMap<PathBuf, Arc<FsFile>>>,
    compressed: Mutex<HashMap<PathBuf, Arc<FsFile>>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: CacheKind) -> &Mutex<HashMap<PathBuf, Arc<FsFile>>> {
        match kind {
            CacheKind::Identity => &self.identity,
            CacheKind::Compressed => &self.compressed,
        }
    }

    /// Looks up an entry, refreshing its access time on a hit.
    pub fn get(&self, kind: CacheKind, path: &Path) -> Option<Arc<FsFile>> {
        let map = self.map(kind).lock().ok()?;
        let entry = map.get(path).cloned()?;
        entry.touch();
        Some(entry)
    }

    /// Inserts an entry, returning whichever entry ends up cached. If a
    /// concurrent open won the race, the existing entry wins and the new
    /// one is discarded.
    pub fn insert(&self, kind: CacheKind, path: PathBuf, file: FsFile) -> Arc<FsFile> {
        let entry = Arc::new(file);
        let Ok(mut map) = self.map(kind).lock() else {
            return entry;
        };
        match map.get(&path) {
            Some(existing) => {
                existing.touch();
                Arc::clone(existing)
            }
            None => {
                trace!(path = %path.display(), "caching file entry");
                map.insert(path, Arc::clone(&entry));
                entry
            }
        }
    }

    /// Evicts entries idle longer than `max_idle` with no live readers.
    /// Returns how many entries were removed.
    pub fn sweep(&self, max_idle: std::time::Duration) -> usize {
        let mut removed = 0;
        for kind in [CacheKind::Identity, CacheKind::Compressed] {
            if let Ok(mut map) = self.map(kind).lock() {
                map.retain(|path, entry| {
                    let keep =
                        entry.reader_count() > 0 || entry.idle_for() < max_idle;
                    if !keep {
                        debug!(path = %path.display(), "evicting idle file entry");
                        removed += 1;
                    }
                    keep
                });
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        let a = self.identity.lock().map(|m| m.len()).unwrap_or(0);
        let b = self.compressed.lock().map(|m| m.len()).unwrap_or(0);
        a + b
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicU64;

    fn temp_file(content: &[u8]) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "flashhttp-cache-test-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    fn open_entry(path: &Path, big: bool) -> Arc<FsFile> {
        let file = File::open(path).unwrap();
        let len = file.metadata().unwrap().len() as usize;
        Arc::new(FsFile::from_file(
            path.to_path_buf(),
            file,
            len,
            "text/plain".to_string(),
            SystemTime::UNIX_EPOCH,
            "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
            false,
            big,
        ))
    }

    fn read_all(reader: &mut Box<dyn FileReader>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_small_reader_whole_file() {
        let path = temp_file(b"hello small world");
        let entry = open_entry(&path, false);

        let mut r = entry.reader().unwrap();
        assert_eq!(entry.reader_count(), 1);
        assert_eq!(read_all(&mut r), b"hello small world");
        r.close().unwrap();
        assert_eq!(entry.reader_count(), 0);
    }

    #[test]
    fn test_small_reader_byte_range() {
        let path = temp_file(b"0123456789");
        let entry = open_entry(&path, false);

        let mut r = entry.reader().unwrap();
        r.update_byte_range(2, 5).unwrap();
        assert_eq!(read_all(&mut r), b"2345");
        r.close().unwrap();
    }

    #[test]
    fn test_dir_index_reader_byte_range() {
        let entry = Arc::new(FsFile::from_dir_index(
            PathBuf::from("/virtual"),
            Bytes::from_static(b"<html>index</html>"),
            SystemTime::UNIX_EPOCH,
            "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
        ));

        let mut r = entry.reader().unwrap();
        assert_eq!(read_all(&mut r), b"<html>index</html>");
        r.close().unwrap();

        let mut r = entry.reader().unwrap();
        r.update_byte_range(6, 10).unwrap();
        assert_eq!(read_all(&mut r), b"index");
        r.close().unwrap();
        assert_eq!(entry.reader_count(), 0);
    }

    #[test]
    fn test_big_reader_descriptor_pooled_on_clean_release() {
        let path = temp_file(b"a big file body, sequentially read");
        let entry = open_entry(&path, true);

        let mut r = entry.reader().unwrap();
        assert_eq!(read_all(&mut r), b"a big file body, sequentially read");
        r.close().unwrap();
        assert_eq!(entry.spare_count(), 1);

        // The next reader reuses the pooled descriptor.
        let mut r = entry.reader().unwrap();
        assert_eq!(entry.spare_count(), 0);
        r.update_byte_range(2, 4).unwrap();
        assert_eq!(read_all(&mut r), b"big");
        r.close().unwrap();
        assert_eq!(entry.spare_count(), 1);
        assert_eq!(entry.reader_count(), 0);
    }

    #[test]
    #[should_panic(expected = "negative reader count")]
    fn test_double_release_panics() {
        let path = temp_file(b"x");
        let entry = open_entry(&path, false);
        let mut r = entry.reader().unwrap();
        r.close().unwrap();
        entry.dec_readers();
    }

    #[test]
    fn test_sweep_respects_live_readers() {
        let path = temp_file(b"sweep me");
        let cache = FileCache::new();
        let file = File::open(&path).unwrap();
        let entry = cache.insert(
            CacheKind::Identity,
            path.clone(),
            FsFile::from_file(
                path.clone(),
                file,
                8,
                "text/plain".to_string(),
                SystemTime::UNIX_EPOCH,
                "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
                false,
                false,
            ),
        );

        let mut r = entry.reader().unwrap();

        // Idle threshold of zero would evict, but the live reader pins it.
        assert_eq!(cache.sweep(std::time::Duration::ZERO), 0);
        assert_eq!(cache.len(), 1);

        r.close().unwrap();
        assert_eq!(cache.sweep(std::time::Duration::ZERO), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_race_returns_existing() {
        let path = temp_file(b"abc");
        let cache = FileCache::new();

        let make = || {
            let file = File::open(&path).unwrap();
            FsFile::from_file(
                path.clone(),
                file,
                3,
                "text/plain".to_string(),
                SystemTime::UNIX_EPOCH,
                "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
                false,
                false,
            )
        };

        let first = cache.insert(CacheKind::Identity, path.clone(), make());
        let second = cache.insert(CacheKind::Identity, path.clone(), make());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }
}
