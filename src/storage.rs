//! Storage backends for sink output
//!
//! The sink router never touches filesystem paths directly. Every output
//! resource is addressed by a `/`-separated object key and reached through
//! [`StorageBackend`], so the same router can target a local directory or an
//! object store.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A writable output resource obtained from a [`StorageBackend`]
///
/// `flush` pushes buffered bytes to the backing store, `close` finalizes the
/// resource. Dropping a stream without closing it may lose buffered data.
pub trait OutputStream: Write + Send {
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Uniform open-for-write / append / flush / close contract over a store
pub trait StorageBackend: Send {
    /// Human readable location of the store, used in logs and reports
    fn location(&self) -> String;

    fn exists(&self, key: &str) -> io::Result<bool>;

    /// Create or truncate the resource at `key`
    fn open_for_write(&self, key: &str) -> io::Result<Box<dyn OutputStream>>;

    /// Open the resource at `key` for appending, creating it when missing
    fn open_for_append(&self, key: &str) -> io::Result<Box<dyn OutputStream>>;

    fn read(&self, key: &str) -> io::Result<Vec<u8>>;

    /// Keys under `prefix`, sorted
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;
}

fn validate_key(key: &str) -> io::Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid object key: {:?}", key),
        ));
    }
    Ok(())
}

/// Object keys mapped onto a directory tree
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }

    fn open_with(&self, key: &str, options: &OpenOptions) -> io::Result<Box<dyn OutputStream>> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = options.open(&path)?;
        Ok(Box::new(LocalStream {
            writer: BufWriter::new(file),
        }))
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, keys: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if entry.file_type()?.is_dir() {
                self.collect_keys(&entry.path(), &key, keys)?;
            } else {
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalStorage {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn exists(&self, key: &str) -> io::Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn open_for_write(&self, key: &str) -> io::Result<Box<dyn OutputStream>> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        self.open_with(key, &options)
    }

    fn open_for_append(&self, key: &str) -> io::Result<Box<dyn OutputStream>> {
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        self.open_with(key, &options)
    }

    fn read(&self, key: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path_for(key)?)
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        if self.root.is_dir() {
            self.collect_keys(&self.root, "", &mut keys)?;
        }
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

struct LocalStream {
    writer: BufWriter<File>,
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl OutputStream for LocalStream {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}

#[derive(Debug, Default)]
struct MemoryObjects {
    objects: BTreeMap<String, Vec<u8>>,
    closed: BTreeSet<String>,
}

/// In-process object store
///
/// Objects become visible on `flush` or `close` of their stream, like an
/// upload that is committed in parts. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryObjects>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, MemoryObjects>> {
        lock_objects(&self.inner)
    }

    /// Keys whose stream has been closed at least once
    pub fn closed_keys(&self) -> io::Result<Vec<String>> {
        Ok(self.lock()?.closed.iter().cloned().collect())
    }

    pub fn read_to_string(&self, key: &str) -> io::Result<String> {
        let bytes = self.read(key)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn open_stream(&self, key: &str, base: Vec<u8>) -> io::Result<Box<dyn OutputStream>> {
        validate_key(key)?;
        let mut objects = self.lock()?;
        objects.objects.insert(key.to_string(), base.clone());
        objects.closed.remove(key);
        Ok(Box::new(MemoryStream {
            key: key.to_string(),
            committed: base,
            pending: Vec::new(),
            store: Arc::clone(&self.inner),
        }))
    }
}

fn lock_objects(inner: &Mutex<MemoryObjects>) -> io::Result<MutexGuard<'_, MemoryObjects>> {
    inner
        .lock()
        .map_err(|_| io::Error::other("memory storage lock poisoned"))
}

impl StorageBackend for MemoryStorage {
    fn location(&self) -> String {
        "memory://".to_string()
    }

    fn exists(&self, key: &str) -> io::Result<bool> {
        Ok(self.lock()?.objects.contains_key(key))
    }

    fn open_for_write(&self, key: &str) -> io::Result<Box<dyn OutputStream>> {
        self.open_stream(key, Vec::new())
    }

    fn open_for_append(&self, key: &str) -> io::Result<Box<dyn OutputStream>> {
        let base = self.lock()?.objects.get(key).cloned().unwrap_or_default();
        self.open_stream(key, base)
    }

    fn read(&self, key: &str) -> io::Result<Vec<u8>> {
        self.lock()?.objects.get(key).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such object: {}", key))
        })
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        Ok(self
            .lock()?
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

struct MemoryStream {
    key: String,
    committed: Vec<u8>,
    pending: Vec<u8>,
    store: Arc<Mutex<MemoryObjects>>,
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.committed.append(&mut self.pending);
        let mut objects = lock_objects(&self.store)?;
        objects
            .objects
            .insert(self.key.clone(), self.committed.clone());
        Ok(())
    }
}

impl OutputStream for MemoryStream {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.flush()?;
        lock_objects(&self.store)?.closed.insert(self.key.clone());
        Ok(())
    }
}
