//! A content-addressed store for file payloads.
//!
//! Objects are keyed by the lowercase-hex SHA-256 of their content, so writes
//! are idempotent: the same bytes always land under the same key and a second
//! write is a no-op. The on-disk variant is also atomic: content is streamed
//! to a temporary file while hashing and only renamed into place once the
//! digest is known, so a crash mid-write never publishes a key.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use globset::GlobBuilder;
use sha2::{Digest, Sha256};

use crate::{StoreError, StoreResult};

/// Chunk size used when streaming content in and out of the store.
pub const COPY_BUFSIZE: usize = 64 * 1024;

pub trait ObjectStore: Send + Sync {
    /// Number of objects in the store.
    fn count(&self) -> usize;

    /// Keys of all objects in the store, in no particular order.
    fn keys(&self) -> Vec<String>;

    /// Add an object, returning its key.
    fn add_from_bytes(&self, data: &[u8]) -> StoreResult<String>;

    /// Stream an object into the store in `chunk_size` reads.
    fn add_from_reader(&self, reader: &mut dyn Read, chunk_size: usize) -> StoreResult<String>;

    /// Whether a blob with this key has been committed.
    fn contains(&self, key: &str) -> bool;

    /// Size of the object in bytes.
    fn size(&self, key: &str) -> StoreResult<u64>;

    /// Open the object for reading.
    fn open_read(&self, key: &str) -> StoreResult<Box<dyn Read + Send>>;

    /// Add the file at `path`, returning its key.
    fn add_from_path(&self, path: &Path) -> StoreResult<String> {
        let mut file = std::fs::File::open(path)?;
        self.add_from_reader(&mut file, COPY_BUFSIZE)
    }

    /// Add every file under `dir` matching `pattern`, returning a map of
    /// dir-relative POSIX paths to keys.
    fn add_from_glob(&self, dir: &Path, pattern: &str) -> StoreResult<BTreeMap<String, String>> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| StoreError::Validation(format!("bad glob pattern {pattern:?}: {err}")))?
            .compile_matcher();
        let mut added = BTreeMap::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel = path
                    .strip_prefix(dir)
                    .expect("walked path is under the root");
                if matcher.is_match(rel) {
                    let rel_posix = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    added.insert(rel_posix, self.add_from_path(&path)?);
                }
            }
        }
        Ok(added)
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Object store held entirely in memory, for tests and scratch projects.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    fn add_from_bytes(&self, data: &[u8]) -> StoreResult<String> {
        let key = sha256_hex(data);
        self.blobs
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert_with(|| data.to_vec());
        Ok(key)
    }

    fn add_from_reader(&self, reader: &mut dyn Read, _chunk_size: usize) -> StoreResult<String> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.add_from_bytes(&data)
    }

    fn contains(&self, key: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(key)
    }

    fn size(&self, key: &str) -> StoreResult<u64> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| StoreError::ObjectNotFound(key.to_string()))
    }

    fn open_read(&self, key: &str) -> StoreResult<Box<dyn Read + Send>> {
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::ObjectNotFound(key.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Object store with one file per key under a root directory.
///
/// Filenames are the lowercase hex digest, no extension.
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    /// Open the store rooted at `root`. The directory must already exist.
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::Validation(format!(
                "object store path not found: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Move a fully-written temp file into place under `key`.
    ///
    /// Losing a rename race to a concurrent writer of identical content is
    /// success: the blob is already published.
    fn publish(&self, temp: tempfile::NamedTempFile, key: &str) -> StoreResult<()> {
        let dest = self.blob_path(key);
        if dest.exists() {
            return Ok(());
        }
        match temp.persist(&dest) {
            Ok(_) => Ok(()),
            Err(err) if dest.exists() => {
                drop(err);
                Ok(())
            }
            Err(err) => Err(StoreError::Io(err.error)),
        }
    }
}

impl ObjectStore for FileObjectStore {
    fn count(&self) -> usize {
        std::fs::read_dir(&self.root)
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }

    fn keys(&self) -> Vec<String> {
        std::fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn add_from_bytes(&self, data: &[u8]) -> StoreResult<String> {
        let key = sha256_hex(data);
        if self.contains(&key) {
            return Ok(key);
        }
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        temp.write_all(data)?;
        temp.flush()?;
        self.publish(temp, &key)?;
        Ok(key)
    }

    fn add_from_reader(&self, reader: &mut dyn Read, chunk_size: usize) -> StoreResult<String> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n])?;
        }
        temp.flush()?;
        let key = hex::encode(hasher.finalize());
        self.publish(temp, &key)?;
        Ok(key)
    }

    fn contains(&self, key: &str) -> bool {
        self.blob_path(key).exists()
    }

    fn size(&self, key: &str) -> StoreResult<u64> {
        let path = self.blob_path(key);
        match path.metadata() {
            Ok(meta) => Ok(meta.len()),
            Err(_) => Err(StoreError::ObjectNotFound(key.to_string())),
        }
    }

    fn open_read(&self, key: &str) -> StoreResult<Box<dyn Read + Send>> {
        let path = self.blob_path(key);
        match std::fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(_) => Err(StoreError::ObjectNotFound(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // SHA-256 of b"hi\n"
    const HI_KEY: &str = "98ea6e4f216f2fb4b69fff9b3a44842c38686ca685f3f55dc48c5d3fb1107be4";

    #[test]
    fn memory_round_trip() {
        let store = InMemoryObjectStore::new();
        let key = store.add_from_bytes(b"hi\n").unwrap();
        assert_eq!(key, HI_KEY);
        assert!(store.contains(&key));
        assert_eq!(store.size(&key).unwrap(), 3);

        let mut read = Vec::new();
        store.open_read(&key).unwrap().read_to_end(&mut read).unwrap();
        assert_eq!(read, b"hi\n");
    }

    #[test]
    fn disk_write_is_idempotent_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();

        let key1 = store.add_from_bytes(b"payload").unwrap();
        let key2 = store.add_from_bytes(b"payload").unwrap();
        assert_eq!(key1, key2);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec![key1]);
    }

    #[test]
    fn disk_reader_chunks_match_bytes() {
        let dir = tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();

        let data = vec![7u8; 200_000];
        let from_reader = store.add_from_reader(&mut Cursor::new(data.clone()), 4096).unwrap();
        let from_bytes = store.add_from_bytes(&data).unwrap();
        assert_eq!(from_reader, from_bytes);
        assert_eq!(store.size(&from_reader).unwrap(), 200_000);
    }

    #[test]
    fn missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        assert!(FileObjectStore::new(dir.path().join("nope")).is_err());
    }

    #[test]
    fn absent_key_errors() {
        let store = InMemoryObjectStore::new();
        assert!(!store.contains("0000"));
        assert!(matches!(
            store.size("0000"),
            Err(StoreError::ObjectNotFound(_))
        ));
        assert!(store.open_read("0000").is_err());
    }

    #[test]
    fn glob_adds_matching_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.dat"), b"b").unwrap();
        std::fs::write(dir.path().join("sub").join("c.txt"), b"c").unwrap();

        let objects = tempdir().unwrap();
        let store = FileObjectStore::new(objects.path()).unwrap();
        let added = store.add_from_glob(dir.path(), "**/*.txt").unwrap();
        let mut paths: Vec<_> = added.keys().cloned().collect();
        paths.sort();
        assert_eq!(paths, vec!["a.txt", "sub/c.txt"]);
    }
}
