//! Filesystem content store.
//!
//! Layout under the root directory:
//!
//! ```text
//! blobs/sha256/<hex>          committed content
//! labels/sha256/<hex>.json    labels recorded at first commit
//! ingest/<staging ref>        in-flight writes
//! locks/<staging ref>.lock    exclusive file lock held by the live writer
//! ```
//!
//! Writers stream into their ingest file while hashing and are renamed into
//! place on commit. A ref's lock file is locked for the writer's lifetime, so
//! stores opened on the same root by different processes never share an
//! ingest file. Opening a writer on a ref restarts its ingest from zero, so a
//! retried write never sees stale bytes.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs4::FileExt as _;
use plfm_digest::{Digest, Digester};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{ContentError, ContentInfo, ContentStore, ContentWriter, Labels, ReaderAt};
use crate::image::Descriptor;

/// Content store rooted at a local directory.
#[derive(Clone)]
pub struct LocalContentStore {
    root: PathBuf,
    /// Staging refs held by live writers.
    active: Arc<Mutex<HashSet<String>>>,
}

impl LocalContentStore {
    /// Open or create a store at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ContentError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("blobs").join("sha256")).await?;
        tokio::fs::create_dir_all(root.join("labels").join("sha256")).await?;
        tokio::fs::create_dir_all(root.join("ingest")).await?;
        tokio::fs::create_dir_all(root.join("locks")).await?;

        debug!(root = %root.display(), "Content store opened");

        Ok(Self {
            root,
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Get the local path for a blob.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    fn labels_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("labels")
            .join(digest.algorithm().as_str())
            .join(format!("{}.json", digest.hex()))
    }

    fn ingest_path(&self, staging_ref: &str) -> Result<PathBuf, ContentError> {
        if staging_ref.is_empty() || staging_ref.contains("..") {
            return Err(ContentError::InvalidRef(staging_ref.to_string()));
        }
        Ok(self.root.join("ingest").join(sanitize_ref(staging_ref)))
    }

    fn lock_path(&self, staging_ref: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}.lock", sanitize_ref(staging_ref)))
    }

    /// Take the ref's file lock without blocking.
    fn try_lock_ref(&self, staging_ref: &str) -> Result<File, ContentError> {
        let path = self.lock_path(staging_ref);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(ContentError::Locked(staging_ref.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a blob exists locally.
    pub fn blob_exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Number of in-flight writers.
    pub fn active_writers(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>, ContentError> {
        let path = self.blob_path(&desc.digest);
        let file = File::open(&path).map_err(|e| not_found_or(e, &desc.digest))?;
        let size = file.metadata()?.len();
        Ok(Box::new(FileReaderAt { file, size }))
    }

    async fn writer(&self, staging_ref: &str) -> Result<Box<dyn ContentWriter>, ContentError> {
        let ingest_path = self.ingest_path(staging_ref)?;

        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| io::Error::other("content store writer registry poisoned"))?;
            if !active.insert(staging_ref.to_string()) {
                return Err(ContentError::Locked(staging_ref.to_string()));
            }
        }

        let lease = RefLease {
            staging_ref: staging_ref.to_string(),
            active: Arc::clone(&self.active),
        };
        let lock = self.try_lock_ref(staging_ref)?;

        let file = tokio::fs::File::create(&ingest_path).await?;

        Ok(Box::new(LocalWriter {
            store: self.clone(),
            file: Some(file),
            ingest_path,
            digester: Digester::new(),
            committed: false,
            _lock: lock,
            _lease: lease,
        }))
    }

    async fn info(&self, digest: &Digest) -> Result<ContentInfo, ContentError> {
        let metadata = tokio::fs::metadata(self.blob_path(digest))
            .await
            .map_err(|e| not_found_or(e, digest))?;

        let labels = match tokio::fs::read(self.labels_path(digest)).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Labels::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(ContentInfo {
            digest: digest.clone(),
            size: metadata.len(),
            labels,
        })
    }
}

fn not_found_or(err: io::Error, digest: &Digest) -> ContentError {
    if err.kind() == io::ErrorKind::NotFound {
        ContentError::NotFound(digest.to_string())
    } else {
        ContentError::Io(err)
    }
}

/// Sanitize a staging ref for use as a file name.
fn sanitize_ref(staging_ref: &str) -> String {
    staging_ref.replace([':', '/'], "_")
}

struct FileReaderAt {
    file: File,
    size: u64,
}

impl ReaderAt for FileReaderAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.file.read_at(buf, offset)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Releases a staging ref when the writer goes away.
struct RefLease {
    staging_ref: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RefLease {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.staging_ref);
        }
    }
}

struct LocalWriter {
    store: LocalContentStore,
    file: Option<tokio::fs::File>,
    ingest_path: PathBuf,
    digester: Digester,
    committed: bool,
    // Released after `Drop::drop` has removed the ingest file.
    _lock: File,
    _lease: RefLease,
}

impl LocalWriter {
    fn file(&mut self) -> Result<&mut tokio::fs::File, ContentError> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("writer already closed").into())
    }

    /// Stage labels next to the ingest file and rename them into place.
    async fn write_labels(&self, digest: &Digest, labels: &Labels) -> Result<(), ContentError> {
        let mut staged = self.ingest_path.clone().into_os_string();
        staged.push(".labels");
        let staged = PathBuf::from(staged);

        let raw = serde_json::to_vec(labels)?;
        let result = match tokio::fs::write(&staged, raw).await {
            Ok(()) => tokio::fs::rename(&staged, self.store.labels_path(digest)).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            tokio::fs::remove_file(&staged).await.ok();
        }
        Ok(result?)
    }
}

#[async_trait]
impl ContentWriter for LocalWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), ContentError> {
        self.file()?.write_all(data).await?;
        self.digester.update(data);
        Ok(())
    }

    fn digest(&self) -> Digest {
        self.digester.digest()
    }

    fn offset(&self) -> u64 {
        self.digester.written()
    }

    async fn commit(
        mut self: Box<Self>,
        expected: &Digest,
        labels: Labels,
    ) -> Result<(), ContentError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("writer already closed"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = self.digester.digest();
        if &actual != expected {
            return Err(ContentError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        let target = self.store.blob_path(expected);
        if tokio::fs::try_exists(&target).await? {
            return Err(ContentError::AlreadyExists(expected.clone()));
        }

        // Labels land before the blob, so committed content is never seen
        // without them.
        if !labels.is_empty() {
            self.write_labels(expected, &labels).await?;
        }

        tokio::fs::rename(&self.ingest_path, &target).await?;
        self.committed = true;

        info!(
            digest = %expected,
            size = self.digester.written(),
            "Content committed"
        );

        Ok(())
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if !self.committed {
            std::fs::remove_file(&self.ingest_path).ok();
        }
    }
}
