//! Result Index - persisted, content-addressed outcomes of past commands
//!
//! The on-disk form is a JSON-lines log, one `{id, entry}` per line, where a
//! later line for the same id wins. Writers only ever append the entries they
//! produced, and readers merge whatever other writers appended since their
//! last read, so several processes can share one index file.
//!
//! The first line of a file is a `{generation}` header. Compaction and
//! `clear` replace the file and with it the generation, which tells readers
//! to start over from the top. Appends, compaction and `clear` hold an
//! exclusive lock on `<index>.lock`.

use crate::command::InputLocation;
use crate::context::ResultEntry;
use crate::error::Result;
use crate::hasher::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bumped whenever the line format changes; older index files are erased
pub const INDEX_VERSION: u32 = 3;

#[derive(Serialize, Deserialize)]
struct IndexLine {
    id: ObjectId,
    entry: ResultEntry,
}

#[derive(Serialize, Deserialize)]
struct IndexHeader {
    generation: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredLine {
    Entry(IndexLine),
    Header(IndexHeader),
}

pub struct Index {
    path: PathBuf,
    entries: HashMap<ObjectId, ResultEntry>,
    pending: Vec<ObjectId>,
    read_offset: u64,
    /// Header of the file `read_offset` points into
    generation: Option<String>,
}

impl Index {
    /// `<build>/data/db`
    pub fn database_dir(build_dir: impl AsRef<Path>) -> PathBuf {
        build_dir.as_ref().join("data").join("db")
    }

    /// `<build>/data/db/index.<name>`
    pub fn index_path(build_dir: impl AsRef<Path>, name: &str) -> PathBuf {
        Self::database_dir(build_dir).join(format!("index.{}", name))
    }

    /// Load the index at `path`; a missing file is an empty index
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut index = Self {
            path: path.into(),
            entries: HashMap::new(),
            pending: Vec::new(),
            read_offset: 0,
            generation: None,
        };
        let loaded = index.refresh()?;
        debug!(path = %index.path.display(), entries = loaded, "loaded index");
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge complete lines appended since the last read. Returns the number
    /// of lines merged.
    pub fn refresh(&mut self) -> Result<usize> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.read_offset = 0;
                self.generation = None;
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        // Replaced underneath us: read it again from the start
        let generation = read_generation(&file)?;
        if generation != self.generation || file.metadata()?.len() < self.read_offset {
            debug!(path = %self.path.display(), "index file replaced, rereading");
            self.read_offset = 0;
            self.generation = generation;
        }
        file.seek(SeekFrom::Start(self.read_offset))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        // A trailing partial line belongs to a writer still appending
        let Some(end) = buffer.iter().rposition(|&b| b == b'\n') else {
            return Ok(0);
        };

        let pending: HashSet<ObjectId> = self.pending.iter().copied().collect();
        let mut merged = 0;
        for line in buffer[..end].split(|&b| b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<StoredLine>(line) {
                Ok(StoredLine::Entry(IndexLine { id, entry })) => {
                    if !pending.contains(&id) {
                        self.entries.insert(id, entry);
                    }
                    merged += 1;
                }
                Ok(StoredLine::Header(_)) => {}
                Err(e) => warn!(path = %self.path.display(), "skipping corrupt index line: {}", e),
            }
        }
        self.read_offset += (end + 1) as u64;
        Ok(merged)
    }

    pub fn get(&self, id: &ObjectId) -> Option<&ResultEntry> {
        self.entries.get(id)
    }

    /// Store an outcome; it reaches disk on the next `flush`
    pub fn record(&mut self, id: ObjectId, entry: ResultEntry) {
        self.entries.insert(id, entry);
        self.pending.push(id);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Append every recorded entry in a single write
    pub fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let mut seen = HashSet::new();
        let mut buffer = Vec::new();
        for id in self.pending.iter().rev() {
            if !seen.insert(*id) {
                continue;
            }
            if let Some(entry) = self.entries.get(id) {
                serde_json::to_writer(&mut buffer, &IndexLine { id: *id, entry: entry.clone() })?;
                buffer.push(b'\n');
            }
        }

        let _lock = IndexLock::acquire(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(&header_line()?)?;
        }
        file.write_all(&buffer)?;
        file.flush()?;

        let written = seen.len();
        self.pending.clear();
        debug!(path = %self.path.display(), entries = written, "appended index entries");
        Ok(written)
    }

    /// Rewrite the file with one line per id, after merging other writers
    pub fn compact(&mut self) -> Result<()> {
        let _lock = IndexLock::acquire(&self.path)?;
        self.refresh()?;
        self.pending.clear();

        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();

        let generation = Uuid::new_v4().to_string();
        let mut buffer = Vec::new();
        serde_json::to_writer(&mut buffer, &IndexHeader { generation: generation.clone() })?;
        buffer.push(b'\n');
        for id in ids {
            if let Some(entry) = self.entries.get(&id) {
                serde_json::to_writer(&mut buffer, &IndexLine { id, entry: entry.clone() })?;
                buffer.push(b'\n');
            }
        }

        let temp = self.path.with_extension("compact");
        fs::write(&temp, &buffer)?;
        fs::rename(&temp, &self.path)?;
        self.read_offset = buffer.len() as u64;
        self.generation = Some(generation);
        info!(path = %self.path.display(), entries = self.entries.len(), "compacted index");
        Ok(())
    }

    /// Forget everything and delete the file
    pub fn clear(&mut self) -> Result<()> {
        let _lock = IndexLock::acquire(&self.path)?;
        self.entries.clear();
        self.pending.clear();
        self.read_offset = 0;
        self.generation = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ObjectId, &ResultEntry)> {
        self.entries.iter()
    }

    /// The recorded entry for `id` if it can stand in for a fresh execution:
    /// it succeeded, every declared input was recorded, every recorded input
    /// still has the recorded fingerprint, and every output file still
    /// exists with the recorded fingerprint.
    pub fn is_up_to_date<F>(
        &self,
        id: &ObjectId,
        declared: &[InputLocation],
        resolve: F,
    ) -> Option<&ResultEntry>
    where
        F: Fn(&InputLocation) -> Option<ObjectId>,
    {
        let entry = self.entries.get(id)?;
        if !entry.status.succeeded() {
            return None;
        }

        for location in declared {
            if !entry
                .input_dependency_versions
                .contains_key(&location.to_string())
            {
                return None;
            }
        }

        for (key, recorded) in &entry.input_dependency_versions {
            let location: InputLocation = key.parse().ok()?;
            if resolve(&location) != Some(*recorded) {
                debug!(input = %key, "input changed");
                return None;
            }
        }

        for (path, recorded) in entry.output_files() {
            if resolve(&InputLocation::File(path.clone())) != Some(recorded) {
                debug!(output = %path.display(), "output missing or modified");
                return None;
            }
        }

        Some(entry)
    }
}

fn header_line() -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&IndexHeader {
        generation: Uuid::new_v4().to_string(),
    })?;
    line.push(b'\n');
    Ok(line)
}

/// Generation named by the first line of `file`, if it is a complete header
fn read_generation(file: &File) -> io::Result<Option<String>> {
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(0))?;
    let mut first = Vec::new();
    reader.read_until(b'\n', &mut first)?;
    if first.last() != Some(&b'\n') {
        return Ok(None);
    }
    Ok(serde_json::from_slice::<IndexHeader>(&first)
        .ok()
        .map(|header| header.generation))
}

// ============================================================================
// Cross-process lock
// ============================================================================

/// Exclusive lock on `<index>.lock`, released on drop
struct IndexLock {
    _file: File,
}

impl IndexLock {
    fn acquire(index_path: &Path) -> io::Result<Self> {
        if let Some(parent) = index_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock_path = index_path.as_os_str().to_owned();
        lock_path.push(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(PathBuf::from(lock_path))?;
        lock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use rustix::fs::{flock, FlockOperation};
    use std::os::unix::io::AsFd;

    flock(file.as_fd(), FlockOperation::LockExclusive)
        .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{LockFileEx, LOCKFILE_EXCLUSIVE_LOCK};

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: a zeroed OVERLAPPED is valid and the handle is open for the call
    let result = unsafe {
        let mut overlapped = std::mem::zeroed();
        LockFileEx(handle, LOCKFILE_EXCLUSIVE_LOCK, 0, 1, 0, &mut overlapped)
    };
    if result == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Ensure the database directory exists and holds a current-version index;
/// index files from another version are erased
pub fn prepare_database(db_dir: impl AsRef<Path>) -> Result<()> {
    let db_dir = db_dir.as_ref();
    fs::create_dir_all(db_dir)?;

    let version_path = db_dir.join("version");
    let current = fs::read_to_string(&version_path)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok());
    if current == Some(INDEX_VERSION) {
        return Ok(());
    }

    for entry in fs::read_dir(db_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("index.") {
            fs::remove_file(entry.path())?;
        }
    }
    if let Some(old) = current {
        info!(old, new = INDEX_VERSION, "index version changed, erased old index files");
    }
    fs::write(&version_path, INDEX_VERSION.to_string())?;
    Ok(())
}
