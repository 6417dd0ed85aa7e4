//! Provider backed by a backup server speaking the action protocol.
//!
//! The server only ever sees ciphertext: path re-cryption happens before
//! records are batched, file bodies are re-crypted into staged temps before
//! upload, and staged names are random so nothing about the plaintext
//! leaks into requests.

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use serde_json::Value;

use common::provider::{
    Change, ChangeSender, ChangeStream, FileBody, FileInfo, FsEvent, FsListener, FsProvider,
    KeyPolicy, OnChange,
};
use common::relpath::RelPath;
use common::tmp::TempPath;
use common::{cryptfile, SyncError};

use crate::protocol::WireChange;
use crate::Client;

/// Flush a pending `receivechanges` batch beyond this many records.
const BATCH_MAX_RECORDS: usize = 1000;
/// ... or beyond this much cumulative file size.
const BATCH_MAX_BYTES: u64 = 1024 * 1024;

/// Provider for a directory tree stored on a backup server. `root` is the
/// server-relative path being synchronized.
pub struct BlindFsProvider {
    client: std::sync::Arc<Client>,
    root: RelPath,
    uid: String,
    tmp_dir: Option<std::path::PathBuf>,
    case_sensitive: tokio::sync::OnceCell<bool>,
}

impl BlindFsProvider {
    pub fn new(
        client: std::sync::Arc<Client>,
        root: RelPath,
        tmp_dir: Option<std::path::PathBuf>,
    ) -> Self {
        Self {
            client,
            root,
            uid: common::provider::new_provider_uid(),
            tmp_dir,
            case_sensitive: tokio::sync::OnceCell::new(),
        }
    }

    fn remote_path(&self, relpath: &RelPath) -> RelPath {
        self.root.join(relpath)
    }

    #[async_recursion]
    #[allow(clippy::too_many_arguments)]
    async fn send_tree(
        client: &Client,
        root: &RelPath,
        tmp_dir: Option<&std::path::Path>,
        encrypted: bool,
        sender: &ChangeSender,
        deletes: Vec<RelPath>,
        dir_copies: Vec<RelPath>,
        file_copies: Vec<RelPath>,
    ) -> Result<()> {
        for path in deletes {
            sender.send(Change::Delete { path }).await?;
        }
        if !dir_copies.is_empty() {
            let items = dir_copies
                .iter()
                .map(|path| path.components().to_vec())
                .collect();
            let infos = client
                .get_info(root.to_wire(), items, encrypted)
                .await
                .context("failed fetching directory info")?;
            for (path, info) in dir_copies.into_iter().zip(infos) {
                sender
                    .send(Change::Directory {
                        path: path.clone(),
                        atime: info.atime,
                        mtime: info.mtime,
                    })
                    .await?;
                let (sub_dirs, sub_files) = client
                    .list_dir(root.join(&path).components().to_vec())
                    .await?;
                let sub_dirs = sub_dirs.iter().map(|name| path.child(name)).collect();
                let sub_files = sub_files.iter().map(|name| path.child(name)).collect();
                Self::send_tree(
                    client,
                    root,
                    tmp_dir,
                    encrypted,
                    sender,
                    Vec::new(),
                    sub_dirs,
                    sub_files,
                )
                .await?;
            }
        }
        if !file_copies.is_empty() {
            let items = file_copies
                .iter()
                .map(|path| path.components().to_vec())
                .collect();
            let infos = client
                .get_info(root.to_wire(), items, encrypted)
                .await
                .context("failed fetching file info")?;
            for (path, info) in file_copies.into_iter().zip(infos) {
                // the body has to be materialized locally; the temp is
                // receiver-owned and its guard travels with the record
                let bytes = client.restore(&root.join(&path).to_wire()).await?;
                let staged = TempPath::in_dir(tmp_dir);
                tokio::fs::write(staged.path(), &bytes)
                    .await
                    .with_context(|| format!("failed staging {:?}", staged.path()))?;
                sender
                    .send(Change::File {
                        path,
                        atime: info.atime,
                        mtime: info.mtime,
                        size: info.size,
                        body: FileBody::Receiver(staged),
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Pending `receivechanges` batch. Dropping it (on any error path) drops
/// the guards for both the staged re-crypted temps and the receiver-owned
/// source temps.
#[derive(Default)]
struct Batch {
    delet: Vec<Value>,
    dcopy: Vec<Value>,
    fcopy: Vec<Value>,
    files: Vec<(String, std::path::PathBuf)>,
    staged: Vec<TempPath>,
    owned: Vec<TempPath>,
    records: usize,
    total_bytes: u64,
}

impl Batch {
    fn should_flush(&self) -> bool {
        self.records > BATCH_MAX_RECORDS || self.total_bytes > BATCH_MAX_BYTES
    }

    async fn flush(&mut self, client: &Client, root: &str, uid: &str) -> Result<()> {
        if self.records == 0 {
            return Ok(());
        }
        tracing::debug!(
            records = self.records,
            bytes = self.total_bytes,
            "flushing change batch"
        );
        client
            .receive_changes(
                root.to_string(),
                uid.to_string(),
                std::mem::take(&mut self.delet),
                std::mem::take(&mut self.dcopy),
                std::mem::take(&mut self.fcopy),
                std::mem::take(&mut self.files),
            )
            .await?;
        // uploaded: release the re-crypted temps and the sender's
        // receiver-owned bodies
        self.staged.clear();
        self.owned.clear();
        self.records = 0;
        self.total_bytes = 0;
        Ok(())
    }
}

#[async_trait::async_trait]
impl FsProvider for BlindFsProvider {
    fn name(&self) -> &'static str {
        "blindfs"
    }

    fn uid(&self) -> &str {
        &self.uid
    }

    async fn is_case_sensitive(&self) -> Result<bool> {
        self.case_sensitive
            .get_or_try_init(|| self.client.is_case_sensitive())
            .await
            .copied()
    }

    async fn list_dir(&self, relpath: &RelPath) -> Result<(Vec<String>, Vec<String>)> {
        self.client
            .list_dir(self.remote_path(relpath).components().to_vec())
            .await
    }

    async fn get_info(&self, items: &[RelPath], encrypted: bool) -> Result<Vec<FileInfo>> {
        self.client
            .get_info(
                self.root.to_wire(),
                items.iter().map(|item| item.components().to_vec()).collect(),
                encrypted,
            )
            .await
    }

    fn send_changes(
        &self,
        keys: KeyPolicy,
        deletes: Vec<RelPath>,
        dir_copies: Vec<RelPath>,
        file_copies: Vec<RelPath>,
    ) -> ChangeStream {
        let client = self.client.clone();
        let root = self.root.clone();
        let tmp_dir = self.tmp_dir.clone();
        // a sender with a decryption key set reports plaintext sizes
        let encrypted = keys.decryption.is_some();
        ChangeStream::produce(move |sender| async move {
            Self::send_tree(
                &client,
                &root,
                tmp_dir.as_deref(),
                encrypted,
                &sender,
                deletes,
                dir_copies,
                file_copies,
            )
            .await
        })
    }

    async fn receive_changes(&self, keys: KeyPolicy, mut stream: ChangeStream) -> Result<()> {
        let root = self.root.to_wire();
        let mut batch = Batch::default();
        while let Some(change) = stream.next().await {
            match change {
                Change::Delete { path } => {
                    let wire = keys.recrypt_path(&path)?.to_wire();
                    batch.delet.push(WireChange::Delete { path: wire }.encode());
                    batch.records += 1;
                }
                Change::Directory { path, atime, mtime } => {
                    let wire = keys.recrypt_path(&path)?.to_wire();
                    batch.dcopy.push(
                        WireChange::Directory {
                            path: wire,
                            atime,
                            mtime,
                        }
                        .encode(),
                    );
                    batch.records += 1;
                }
                Change::File {
                    path,
                    atime,
                    mtime,
                    size,
                    body,
                } => {
                    let wire = keys.recrypt_path(&path)?.to_wire();
                    let (source, owned) = match body {
                        FileBody::Sender(path) => (path, None),
                        FileBody::Receiver(temp) => (temp.path().to_path_buf(), Some(temp)),
                        FileBody::Inline(bytes) => {
                            let temp = TempPath::in_dir(self.tmp_dir.as_deref());
                            tokio::fs::write(temp.path(), &bytes)
                                .await
                                .with_context(|| format!("failed staging {:?}", temp.path()))?;
                            (temp.path().to_path_buf(), Some(temp))
                        }
                    };
                    // body re-cryption happens before upload, staged next to
                    // the source so the random name hides the target
                    let upload = match (keys.decryption.as_ref(), keys.encryption.as_ref()) {
                        (None, None) => source.clone(),
                        (decryption, encryption) => {
                            let staged = TempPath::for_target(&source);
                            match (decryption, encryption) {
                                (Some(decryption), Some(encryption)) => {
                                    cryptfile::recrypt_file(
                                        decryption,
                                        encryption,
                                        &source,
                                        staged.path(),
                                    )
                                    .await?;
                                }
                                (None, Some(encryption)) => {
                                    cryptfile::encrypt_file(encryption, &source, staged.path())
                                        .await?;
                                }
                                (Some(decryption), None) => {
                                    cryptfile::decrypt_file(decryption, &source, staged.path())
                                        .await?;
                                }
                                (None, None) => unreachable!(),
                            }
                            let path = staged.path().to_path_buf();
                            batch.staged.push(staged);
                            path
                        }
                    };
                    if let Some(temp) = owned {
                        batch.owned.push(temp);
                    }
                    batch.files.push((wire.clone(), upload));
                    batch.fcopy.push(
                        WireChange::File {
                            path: wire,
                            atime,
                            mtime,
                            size,
                        }
                        .encode(),
                    );
                    batch.records += 1;
                    batch.total_bytes += size;
                }
            }
            if batch.should_flush() {
                batch.flush(&self.client, &root, &self.uid).await?;
            }
        }
        stream.finish().await?;
        batch.flush(&self.client, &root, &self.uid).await
    }

    fn clone_provider(&self) -> Box<dyn FsProvider> {
        Box::new(Self {
            client: self.client.clone(),
            root: self.root.clone(),
            uid: self.uid.clone(),
            tmp_dir: self.tmp_dir.clone(),
            case_sensitive: tokio::sync::OnceCell::new(),
        })
    }

    fn drill(&mut self, relpath: &RelPath) {
        self.root = self.root.join(relpath);
    }

    fn event_relpath(&self, full_path: &str) -> Result<RelPath> {
        let root = self.root.to_wire();
        let rest = if root.is_empty() {
            full_path
        } else {
            full_path
                .strip_prefix(&root)
                .and_then(|rest| rest.strip_prefix('/'))
                .ok_or_else(|| {
                    SyncError::InvalidPath(format!(
                        "event path {full_path:?} is outside root {root:?}"
                    ))
                })?
        };
        Ok(RelPath::parse(rest)?)
    }

    async fn listen_changes(&self, on_change: OnChange) -> Result<Box<dyn FsListener>> {
        // observers are registered server-relative: the server scopes events
        // to the user prefix on its own, so the root here is always ""
        let listener = BlindFsListener::start(self.client.clone(), on_change).await?;
        Ok(Box::new(listener))
    }
}

/// Long-poll loop fanning server-side change events out to the callback.
pub struct BlindFsListener {
    uid: String,
    stop_requested: std::sync::Arc<std::sync::atomic::AtomicBool>,
    stopped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl BlindFsListener {
    async fn start(client: std::sync::Arc<Client>, on_change: OnChange) -> Result<Self> {
        let uid = client.listen_changes("").await?;
        let stop_requested = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stopped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let task = {
            let uid = uid.clone();
            let stop_requested = stop_requested.clone();
            let stopped = stopped.clone();
            tokio::spawn(async move {
                // each poll blocks on the server for at most its poll TTL,
                // which also renews the observer lease
                while !stop_requested.load(std::sync::atomic::Ordering::SeqCst) {
                    match client.poll_changes(&uid).await {
                        Ok(events) => {
                            for event in events {
                                on_change(FsEvent {
                                    path: event.path,
                                    kind: event.kind,
                                    origin_uid: event.origin_uid,
                                });
                            }
                        }
                        Err(err) => {
                            tracing::warn!("pollchanges failed: {err:#}");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
                stopped.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        };
        Ok(Self {
            uid,
            stop_requested,
            stopped,
            task: Some(task),
        })
    }
}

#[async_trait::async_trait]
impl FsListener for BlindFsListener {
    fn uid(&self) -> String {
        self.uid.clone()
    }

    fn request_stop(&self) {
        self.stop_requested
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_stopping(&self) -> bool {
        self.stop_requested.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn join(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for BlindFsListener {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> BlindFsProvider {
        let client = Client::connect(crate::ClientConfig {
            url: "https://localhost:1/".to_string(),
            login: "tester".to_string(),
            password: "pw".to_string(),
            ca_cert: None,
        })
        .unwrap();
        BlindFsProvider::new(client, RelPath::parse("pre/fix").unwrap(), None)
    }

    #[test]
    fn clone_keeps_uid_and_drill_extends_root() {
        let provider = provider();
        let mut clone = provider.clone_provider();
        assert_eq!(clone.uid(), provider.uid());
        clone.drill(&RelPath::parse("deeper").unwrap());
        assert_eq!(
            clone.event_relpath("pre/fix/deeper/a.txt").unwrap(),
            RelPath::parse("a.txt").unwrap()
        );
    }

    #[test]
    fn event_relpath_requires_root_prefix() {
        let provider = provider();
        assert_eq!(
            provider.event_relpath("pre/fix/a/b").unwrap(),
            RelPath::parse("a/b").unwrap()
        );
        assert!(provider.event_relpath("other/a/b").is_err());
    }
}
