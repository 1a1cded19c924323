use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::domain::Watermark;

/// Four little-endian i64 fields: create, modify, lock, last seen (ms).
pub const RECORD_LEN: usize = 32;

#[derive(Debug)]
pub enum StateError {
    Io(io::Error),
    Lock { path: PathBuf, source: io::Error },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "state file io error: {e}"),
            Self::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Lock { source, .. } => Some(source),
        }
    }
}

impl From<io::Error> for StateError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// The persisted watermark. Holds an exclusive advisory lock on
/// `<path>.lock` for as long as it is alive.
pub struct WatermarkStore {
    path: PathBuf,
    current: Watermark,
    _lock: fs::File,
}

impl WatermarkStore {
    pub fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let lock_path = lock_path_for(path);
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock_exclusive(&lock).map_err(|source| StateError::Lock {
            path: lock_path.clone(),
            source,
        })?;

        let (current, needs_rewrite) = match fs::read(path) {
            Ok(bytes) => (decode_record(&bytes), bytes.len() != RECORD_LEN),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (Watermark::default(), true),
            Err(e) => return Err(e.into()),
        };

        if needs_rewrite {
            debug!(path = %path.display(), "normalizing watermark state file");
            write_atomic(path, &encode_record(&current))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            current,
            _lock: lock,
        })
    }

    /// Reads the persisted watermark without taking the lock.
    pub fn peek(path: &Path) -> Result<Option<Watermark>, StateError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(decode_record(&bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Watermark {
        self.current
    }

    /// Persists `candidate` if its modify index is beyond the current one.
    /// Returns whether it was admitted. Nothing changes on error.
    pub fn admit(&mut self, candidate: Watermark, now_ms: i64) -> Result<bool, StateError> {
        if !candidate.is_newer_than(&self.current) {
            return Ok(false);
        }

        let next = Watermark {
            last_seen_at_ms: now_ms,
            ..candidate
        };
        write_atomic(&self.path, &encode_record(&next))?;
        self.current = next;
        Ok(true)
    }
}

pub fn encode_record(watermark: &Watermark) -> [u8; RECORD_LEN] {
    let mut out = [0u8; RECORD_LEN];
    let fields = [
        watermark.create_index,
        watermark.modify_index,
        watermark.lock_index,
        watermark.last_seen_at_ms,
    ];
    for (chunk, value) in out.chunks_exact_mut(8).zip(fields) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    out
}

/// Missing trailing bytes read as zero; extra bytes are ignored.
pub fn decode_record(bytes: &[u8]) -> Watermark {
    let mut buf = [0u8; RECORD_LEN];
    let n = bytes.len().min(RECORD_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);

    let field = |i: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
        i64::from_le_bytes(raw)
    };
    Watermark {
        create_index: field(0),
        modify_index: field(1),
        lock_index: field(2),
        last_seen_at_ms: field(3),
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(unix)]
fn lock_exclusive(file: &fs::File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        // Blocks until any overlapping invocation releases the lock.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        file_name.to_string_lossy(),
        std::process::id()
    ));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn open_creates_zeroed_fixed_size_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/state");

        let store = WatermarkStore::open(&path).unwrap();
        assert_eq!(store.current(), Watermark::default());
        assert_eq!(fs::read(&path).unwrap(), vec![0u8; RECORD_LEN]);
        assert!(tmp.path().join("nested/state.lock").exists());
    }

    #[test]
    fn record_layout_is_little_endian_in_field_order() {
        let bytes = encode_record(&Watermark {
            create_index: 1,
            modify_index: 2,
            lock_index: 3,
            last_seen_at_ms: 0x0102,
        });
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[16], 3);
        assert_eq!(&bytes[24..26], &[0x02, 0x01]);
        assert_eq!(decode_record(&bytes).lock_index, 3);
    }

    #[test]
    fn admit_is_monotonic_on_modify_index() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state");
        let mut store = WatermarkStore::open(&path).unwrap();

        assert!(store.admit(Watermark::candidate(1, 10, 0), 1_000).unwrap());
        assert!(!store.admit(Watermark::candidate(99, 10, 5), 2_000).unwrap());
        assert!(!store.admit(Watermark::candidate(1, 9, 0), 3_000).unwrap());

        let expected = Watermark {
            create_index: 1,
            modify_index: 10,
            lock_index: 0,
            last_seen_at_ms: 1_000,
        };
        assert_eq!(store.current(), expected);
        assert_eq!(decode_record(&fs::read(&path).unwrap()), expected);

        assert!(store.admit(Watermark::candidate(1, 11, 0), 4_000).unwrap());
        assert_eq!(store.current().modify_index, 11);
    }

    #[test]
    fn reopen_reads_persisted_watermark() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state");
        {
            let mut store = WatermarkStore::open(&path).unwrap();
            store.admit(Watermark::candidate(3, 30, 1), 5).unwrap();
        }

        let store = WatermarkStore::open(&path).unwrap();
        assert_eq!(store.current().modify_index, 30);
        assert_eq!(store.current().lock_index, 1);
        assert_eq!(
            WatermarkStore::peek(&path).unwrap().unwrap().modify_index,
            30
        );
    }

    #[test]
    fn short_and_long_files_are_normalized_to_record_size() {
        let tmp = tempfile::tempdir().unwrap();

        let short = tmp.path().join("short");
        fs::write(&short, [7u8, 0, 0, 0, 0, 0, 0, 0, 9]).unwrap();
        let store = WatermarkStore::open(&short).unwrap();
        assert_eq!(store.current().create_index, 7);
        assert_eq!(store.current().modify_index, 9);
        assert_eq!(fs::read(&short).unwrap().len(), RECORD_LEN);
        drop(store);

        let long = tmp.path().join("long");
        let mut bytes = encode_record(&Watermark::candidate(1, 2, 3)).to_vec();
        bytes.extend_from_slice(b"trailing garbage");
        fs::write(&long, bytes).unwrap();
        let store = WatermarkStore::open(&long).unwrap();
        assert_eq!(store.current(), Watermark::candidate(1, 2, 3));
        assert_eq!(fs::read(&long).unwrap().len(), RECORD_LEN);
    }

    #[test]
    fn peek_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(WatermarkStore::peek(&tmp.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn open_fails_when_parent_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        assert!(WatermarkStore::open(&blocker.join("state")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn overlapping_open_waits_and_sees_the_advanced_watermark() {
        use std::{sync::mpsc, thread, time::Duration};

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state");
        let mut first = WatermarkStore::open(&path).unwrap();

        let (opened_tx, opened_rx) = mpsc::channel();
        let second_path = path.clone();
        let second = thread::spawn(move || {
            let store = WatermarkStore::open(&second_path).unwrap();
            opened_tx.send(()).unwrap();
            store.current()
        });

        assert!(opened_rx.recv_timeout(Duration::from_millis(300)).is_err());

        assert!(first.admit(Watermark::candidate(2, 9, 0), 1_000).unwrap());
        drop(first);

        opened_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let seen = second.join().unwrap();
        assert_eq!(seen.modify_index, 9);
        assert_eq!(seen.last_seen_at_ms, 1_000);
    }
}
