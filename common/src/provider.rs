//! The provider abstraction: a uniform view over any rooted file tree.
//!
//! Implementing [`FsProvider`] for a storage medium makes it synchronizable
//! with any other provider. Encryption always happens on the receiving side:
//! the receiver gets raw change records and applies its [`KeyPolicy`] to
//! path components and file bodies before writing. Specifying both a
//! decryption and an encryption key re-crypts data between locations.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::cryptfile::{self, HashedKey};
use crate::error::SyncError;
use crate::relpath::RelPath;
use crate::tmp::TempPath;

/// Fresh uid for a provider or listener.
pub fn new_provider_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Per-sync key assignment, passed through `send_changes` /
/// `receive_changes`. Keys are deliberately not provider state: continuous
/// sync clones and drills providers for overlapping subtree syncs, and a
/// policy carried in the call cannot race another sync's keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyPolicy {
    /// Applied by a receiver before data is stored.
    pub encryption: Option<HashedKey>,
    /// Strips inbound encryption before the encryption key is applied.
    pub decryption: Option<HashedKey>,
}

impl KeyPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    /// Translate raw path components from the sender's namespace into this
    /// receiver's namespace: decrypt, then encrypt.
    pub fn recrypt_items(&self, items: &[String]) -> Result<Vec<String>> {
        let plain = cryptfile::decrypt_path_items(self.decryption.as_ref(), items)?;
        Ok(cryptfile::encrypt_path_items(self.encryption.as_ref(), &plain))
    }

    pub fn recrypt_path(&self, path: &RelPath) -> Result<RelPath> {
        Ok(RelPath::from_components(
            self.recrypt_items(path.components())?,
        )?)
    }
}

/// Location and ownership of a file record's bytes.
///
/// Ownership is modeled by the variant: `Sender` bodies sit at their natural
/// place in the sender's store, are immutable for the duration of the sync
/// and must be copied, never moved or unlinked. `Receiver` bodies are temp
/// files produced for the receiver; the guard unlinks them once whoever
/// holds the record is done with them - including when a stream is
/// abandoned with records still in flight.
#[derive(Debug)]
pub enum FileBody {
    Sender(std::path::PathBuf),
    Receiver(TempPath),
    /// Raw bytes carried inline in the record.
    Inline(Vec<u8>),
}

/// One element of a change stream.
#[derive(Debug)]
pub enum Change {
    /// Remove the file or directory at `path`, recursively.
    Delete { path: RelPath },
    /// Create a directory; its children follow as subsequent records.
    Directory { path: RelPath, atime: f64, mtime: f64 },
    /// Write a file from `body` under `path`.
    File {
        path: RelPath,
        atime: f64,
        mtime: f64,
        size: u64,
        body: FileBody,
    },
}

impl Change {
    pub fn path(&self) -> &RelPath {
        match self {
            Change::Delete { path }
            | Change::Directory { path, .. }
            | Change::File { path, .. } => path,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Change::Delete { .. } => EventKind::Delete,
            Change::Directory { .. } => EventKind::Directory,
            Change::File { .. } => EventKind::File,
        }
    }
}

/// Stat tuple for a single item. For directories `size` is zero and
/// ignored; for encrypted files it is the plaintext size from the header.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64, u64)", into = "(f64, f64, u64)")]
pub struct FileInfo {
    pub atime: f64,
    pub mtime: f64,
    pub size: u64,
}

impl From<(f64, f64, u64)> for FileInfo {
    fn from((atime, mtime, size): (f64, f64, u64)) -> Self {
        Self { atime, mtime, size }
    }
}

impl From<FileInfo> for (f64, f64, u64) {
    fn from(info: FileInfo) -> Self {
        (info.atime, info.mtime, info.size)
    }
}

/// Kind of a filesystem change, shared between change records and listener
/// events. The numeric codes are the wire representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Directory,
    File,
    Delete,
}

impl EventKind {
    pub fn code(self) -> i64 {
        match self {
            EventKind::Directory => 1,
            EventKind::File => 2,
            EventKind::Delete => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, SyncError> {
        match code {
            1 => Ok(EventKind::Directory),
            2 => Ok(EventKind::File),
            3 => Ok(EventKind::Delete),
            other => Err(SyncError::Protocol(format!(
                "unknown change record tag {other}"
            ))),
        }
    }
}

/// A filesystem change reported by a listener. `path` is the full path in
/// the listened store's own terms (a local absolute path, or a
/// server-relative wire path); `origin_uid` identifies the client that
/// caused the change so feedback loops can be broken.
#[derive(Clone, Debug)]
pub struct FsEvent {
    pub path: String,
    pub kind: EventKind,
    pub origin_uid: String,
}

/// Callback invoked by a listener for each underlying change.
pub type OnChange = std::sync::Arc<dyn Fn(FsEvent) + Send + Sync>;

/// Handle to a background change listener.
#[async_trait::async_trait]
pub trait FsListener: Send {
    /// Unique identifier of this listener, usable as an event origin uid.
    fn uid(&self) -> String;
    /// Ask the worker to stop; observed at its next poll iteration.
    fn request_stop(&self);
    fn is_stopping(&self) -> bool;
    fn is_stopped(&self) -> bool;
    /// Wait until the worker has stopped.
    async fn join(&mut self) -> Result<()>;
}

const CHANGE_STREAM_DEPTH: usize = 16;

/// Sender half handed to a change-stream producer task.
pub struct ChangeSender {
    tx: tokio::sync::mpsc::Sender<Change>,
}

impl ChangeSender {
    pub async fn send(&self, change: Change) -> Result<()> {
        self.tx
            .send(change)
            .await
            .map_err(|_| anyhow!("change stream abandoned by receiver"))
    }
}

/// A finite, non-restartable stream of change records, consumed in order.
///
/// Backed by a bounded channel fed by a producer task. Dropping the stream
/// aborts the producer and drops any buffered records; receiver-owned temp
/// bodies clean themselves up through their guards.
pub struct ChangeStream {
    rx: tokio::sync::mpsc::Receiver<Change>,
    task: Option<tokio::task::JoinHandle<Result<()>>>,
}

impl ChangeStream {
    /// Spawn a producer task feeding the stream.
    pub fn produce<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(ChangeSender) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::mpsc::channel(CHANGE_STREAM_DEPTH);
        let task = tokio::spawn(producer(ChangeSender { tx }));
        Self {
            rx,
            task: Some(task),
        }
    }

    /// A stream over records that are already materialized.
    pub fn from_changes(changes: Vec<Change>) -> Self {
        Self::produce(|sender| async move {
            for change in changes {
                sender.send(change).await?;
            }
            Ok(())
        })
    }

    /// Next record in arrival order, `None` once the producer is done.
    pub async fn next(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    /// Surface the producer's result once the stream is drained (or is
    /// being abandoned deliberately).
    pub async fn finish(mut self) -> Result<()> {
        self.rx.close();
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// General file system provider: implementing these operations for a
/// storage medium allows synchronizing it with any other provider.
#[async_trait::async_trait]
pub trait FsProvider: Send + Sync {
    /// Name of the provider kind (for logs and location parsing).
    fn name(&self) -> &'static str;

    /// Stable unique identifier, shared by clones; identifies the origin of
    /// filesystem notification messages.
    fn uid(&self) -> &str;

    async fn is_case_sensitive(&self) -> Result<bool>;

    /// List raw directory and file names under `relpath`, exactly as they
    /// exist in the backing store - no key is applied, and `.`, `..` and
    /// symlinks are omitted.
    async fn list_dir(&self, relpath: &RelPath) -> Result<(Vec<String>, Vec<String>)>;

    /// Stat tuples for `items`, in input order. With `encrypted` set, the
    /// reported size is the plaintext size from the encryption header
    /// rather than the physical size.
    async fn get_info(&self, items: &[RelPath], encrypted: bool) -> Result<Vec<FileInfo>>;

    /// Produce the lazy change stream for the scheduled work: all deletes
    /// first, then each directory immediately followed by its entire
    /// recursive content, then the remaining files.
    fn send_changes(
        &self,
        keys: KeyPolicy,
        deletes: Vec<RelPath>,
        dir_copies: Vec<RelPath>,
        file_copies: Vec<RelPath>,
    ) -> ChangeStream;

    /// Consume a change stream in order, applying `keys` to path components
    /// and file bodies before data is stored.
    async fn receive_changes(&self, keys: KeyPolicy, stream: ChangeStream) -> Result<()>;

    /// Another instance with the same uid and an independent root.
    fn clone_provider(&self) -> Box<dyn FsProvider>;

    /// Extend the root by `relpath`. Only legal on a clone.
    fn drill(&mut self, relpath: &RelPath);

    /// Convert the full path of a listener event into a path relative to
    /// this provider's root.
    fn event_relpath(&self, full_path: &str) -> Result<RelPath>;

    /// Start a background worker invoking `on_change` for each change in
    /// the backing store.
    async fn listen_changes(&self, on_change: OnChange) -> Result<Box<dyn FsListener>>;
}
