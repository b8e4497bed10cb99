//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{KeyStream, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Marker embedded in in-flight temp file names; such files are never listed.
const TEMP_MARKER: &str = ".tmp.";

/// Largest range a single `get_range` call will allocate (64 MiB).
const MAX_RANGE_SIZE: u64 = 64 * 1024 * 1024;

/// Local filesystem object store.
///
/// Every key maps to one file under `root`. Writes go to a sibling temp file
/// that is fsynced and then renamed into place, followed by an fsync of the
/// parent directory so the rename itself survives a crash.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` to a path under the root.
    ///
    /// Filesystem inspection runs on the blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolve_key(&root, &key))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(format!("blocking task: {e}"))))?
    }

    fn temp_path_for(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{name}{TEMP_MARKER}{}", Uuid::new_v4()))
    }

    /// Write `data` to a fresh temp file next to `path` and fsync it.
    async fn write_temp(&self, path: &Path, data: &[u8]) -> StorageResult<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = Self::temp_path_for(path);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(temp_path)
    }

    async fn sync_parent(path: &Path) -> StorageResult<()> {
        #[cfg(unix)]
        if let Some(parent) = path.parent() {
            fs::File::open(parent).await?.sync_all().await?;
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    fn not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |e| {
            if e.kind() == ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        }
    }

    fn walk(root: PathBuf, base: PathBuf) -> KeyStream {
        Box::pin(async_stream::try_stream! {
            let mut stack = vec![base];
            while let Some(dir) = stack.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => Err(e)?,
                };
                while let Some(entry) = entries.next_entry().await? {
                    // file_type() does not follow symlinks; links are skipped
                    let file_type = entry.file_type().await?;
                    let path = entry.path();
                    if file_type.is_dir() {
                        stack.push(path);
                    } else if file_type.is_file()
                        && !entry.file_name().to_string_lossy().contains(TEMP_MARKER)
                        && let Ok(rel) = path.strip_prefix(&root)
                    {
                        yield key_from_relative(rel);
                    }
                }
            }
        })
    }
}

/// Keys always use `/`, whatever the platform separator.
fn key_from_relative(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Map `key` under `root`, refusing anything that could land outside it.
///
/// Rejects non-normal components (`..`, `.`, absolute prefixes) and, for
/// paths that already exist, any symlink whose target leaves the root. For new
/// paths the nearest existing ancestor is checked the same way.
fn resolve_key(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.is_empty() {
        return Ok(root.to_path_buf());
    }
    let relative = Path::new(key);
    if key.starts_with('/')
        || key.starts_with('\\')
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "key must be a relative path without '..': {key}"
        )));
    }

    let path = root.join(relative);
    let mut ancestor = path.as_path();
    loop {
        match std::fs::symlink_metadata(ancestor) {
            Ok(_) => {
                let resolved = ancestor.canonicalize().map_err(|_| {
                    StorageError::InvalidKey(format!("dangling link on path of {key}"))
                })?;
                if !resolved.starts_with(root) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => match ancestor.parent() {
                Some(parent) if parent.starts_with(root) => ancestor = parent,
                _ => return Ok(path),
            },
            Err(e) => return Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        Ok(fs::try_exists(&path).await?)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path).await.map_err(Self::not_found(key))?;
        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(Into::into),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(Self::not_found(key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        if end - start > MAX_RANGE_SIZE {
            return Err(StorageError::InvalidRange(format!(
                "range of {} bytes exceeds maximum {MAX_RANGE_SIZE}",
                end - start
            )));
        }

        let path = self.key_path(key).await?;
        let mut file = fs::File::open(&path).await.map_err(Self::not_found(key))?;
        let size = file.metadata().await?.len();
        if end > size {
            return Err(StorageError::InvalidRange(format!(
                "range {start}-{end} exceeds object size {size}"
            )));
        }

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        let temp_path = self.write_temp(&path, &data).await?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Self::sync_parent(&path).await
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        if fs::try_exists(&path).await? {
            return Ok(false);
        }

        // hard_link refuses to replace an existing file, so concurrent writers
        // of the same key cannot clobber one another.
        let temp_path = self.write_temp(&path, &data).await?;
        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => {
                Self::sync_parent(&path).await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn append(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let created = !fs::try_exists(&path).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&data).await?;
        file.sync_data().await?;
        if created {
            Self::sync_parent(&path).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path).await.map_err(Self::not_found(key))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        use futures::TryStreamExt;
        self.list_stream(prefix).await?.try_collect().await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream> {
        let base = self.key_path(prefix).await?;
        Ok(Self::walk(self.root.clone(), base))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await?;
        if !metadata.is_dir() {
            return Err(StorageError::Config(format!(
                "storage root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let data = Bytes::from("hello world");
        backend.put("chunks/ab/object", data.clone()).await.unwrap();
        assert!(backend.exists("chunks/ab/object").await.unwrap());
        assert_eq!(backend.get("chunks/ab/object").await.unwrap(), data);
        assert_eq!(backend.head("chunks/ab/object").await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_append_creates_then_extends() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.append("logs/a", Bytes::from("one")).await.unwrap();
        backend.append("logs/a", Bytes::from(",two")).await.unwrap();
        assert_eq!(backend.get("logs/a").await.unwrap(), Bytes::from("one,two"));
        assert_eq!(backend.list("logs").await.unwrap(), vec!["logs/a".to_string()]);
    }

    #[tokio::test]
    async fn test_put_if_not_exists_keeps_first_writer() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        assert!(backend.put_if_not_exists("k", Bytes::from("first")).await.unwrap());
        assert!(!backend.put_if_not_exists("k", Bytes::from("second")).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Bytes::from("first"));
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        assert!(matches!(backend.get("nope").await, Err(StorageError::NotFound(_))));
        assert!(matches!(backend.delete("nope").await, Err(StorageError::NotFound(_))));
        assert!(matches!(backend.head("nope").await, Err(StorageError::NotFound(_))));
        assert!(!backend.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_range_slices_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        backend.put("blob", Bytes::from("0123456789")).await.unwrap();

        assert_eq!(backend.get_range("blob", 2, 5).await.unwrap(), Bytes::from("234"));
        assert_eq!(backend.get_range("blob", 4, 4).await.unwrap().len(), 0);
        assert!(matches!(
            backend.get_range("blob", 5, 2).await,
            Err(StorageError::InvalidRange(_))
        ));
        assert!(matches!(
            backend.get_range("blob", 8, 12).await,
            Err(StorageError::InvalidRange(_))
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        for key in ["../escape", "/absolute/path", "foo/../bar", "./here"] {
            assert!(
                matches!(backend.exists(key).await, Err(StorageError::InvalidKey(_))),
                "{key} should be rejected"
            );
        }
        assert!(backend.exists("valid/nested/key").await.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_escape_rejected() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        symlink(outside.path(), dir.path().join("escape")).unwrap();
        let read = backend.get("escape/secret.txt").await;
        assert!(matches!(read, Err(StorageError::InvalidKey(_))));

        let write = backend.put("escape/new/file", Bytes::from("x")).await;
        assert!(matches!(write, Err(StorageError::InvalidKey(_))));
        assert!(!outside.path().join("new").exists());
    }

    #[tokio::test]
    async fn test_list_uses_forward_slashes_and_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        backend.put("manifests/a.json", Bytes::from("{}")).await.unwrap();
        backend.put("manifests/b.json", Bytes::from("{}")).await.unwrap();
        backend.put("chunks/00/c", Bytes::from("c")).await.unwrap();
        std::fs::write(
            dir.path().join("manifests").join(format!("c.json{TEMP_MARKER}abc")),
            "partial",
        )
        .unwrap();

        let mut keys = backend.list("manifests").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["manifests/a.json", "manifests/b.json"]);

        let mut all = backend.list("").await.unwrap();
        all.sort();
        assert_eq!(all.len(), 3);
        assert!(backend.list("missing/prefix").await.unwrap().is_empty());
    }
}
