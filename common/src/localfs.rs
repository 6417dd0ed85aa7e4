//! Provider over a directory on the local filesystem.

use anyhow::{Context, Result};
use async_recursion::async_recursion;

use crate::cryptfile;
use crate::error::SyncError;
use crate::provider::{
    Change, ChangeSender, ChangeStream, EventKind, FileBody, FileInfo, FsEvent, FsListener,
    FsProvider, KeyPolicy, OnChange,
};
use crate::relpath::RelPath;
use crate::tmp::TempPath;

const STAGING_SUFFIX: &str = ".~tmp";
const INLINE_SUFFIX: &str = ".~ftmp";

fn suffixed(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    std::path::PathBuf::from(name)
}

fn time_f64(time: std::time::SystemTime) -> f64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    }
}

async fn set_file_times(path: &std::path::Path, atime: f64, mtime: f64) -> Result<()> {
    fn to_filetime(seconds: f64) -> filetime::FileTime {
        let whole = seconds.floor();
        let nanos = ((seconds - whole) * 1e9) as u32;
        filetime::FileTime::from_unix_time(whole as i64, nanos)
    }
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        filetime::set_file_times(&path, to_filetime(atime), to_filetime(mtime))
            .with_context(|| format!("failed setting timestamps for {path:?}"))
    })
    .await?
}

/// Remove whatever sits at `path`: unlink for files, recursive removal for
/// directories, no-op when nothing is there.
async fn remove_any(path: &std::path::Path) -> Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("failed removing directory {path:?}")),
        Ok(_) => tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed removing {path:?}")),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed reading metadata from {path:?}")),
    }
}

/// Raw names under a local directory, split into (dirs, files). Symlinks
/// and anything that is neither a directory nor a regular file are omitted.
async fn list_local_dir(local: &std::path::Path) -> Result<(Vec<String>, Vec<String>)> {
    if !tokio::fs::metadata(local)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Err(SyncError::InvalidPath(format!("directory {local:?} does not exist")).into());
    }
    let mut dnames = Vec::new();
    let mut fnames = Vec::new();
    let mut entries = tokio::fs::read_dir(local)
        .await
        .with_context(|| format!("cannot open directory {local:?} for reading"))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {local:?}"))?
    {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                tracing::warn!("skipping non-UTF-8 entry {raw:?} in {local:?}");
                continue;
            }
        };
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed reading metadata from {local:?}"))?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            dnames.push(name);
        } else if file_type.is_file() {
            fnames.push(name);
        }
    }
    Ok((dnames, fnames))
}

/// Provider rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalFsProvider {
    root: std::path::PathBuf,
    uid: String,
}

impl LocalFsProvider {
    /// Root must be an existing directory, unless `can_create` allows
    /// making it.
    pub fn new(root: &std::path::Path, can_create: bool) -> Result<Self> {
        if !root.is_dir() {
            if can_create {
                std::fs::create_dir_all(root)
                    .with_context(|| format!("cannot create directory {root:?}"))?;
            } else {
                anyhow::bail!("not a directory: {root:?}");
            }
        }
        let root = std::path::absolute(root)
            .with_context(|| format!("cannot resolve root {root:?}"))?;
        Ok(Self {
            root,
            uid: crate::provider::new_provider_uid(),
        })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn local_path(&self, relpath: &RelPath) -> std::path::PathBuf {
        // RelPath construction already rejected `..`, wildcards and absolute
        // forms, so joining below the root is safe
        relpath.to_local(&self.root)
    }

    /// Remove the entry at `relpath` (recursively for directories).
    pub async fn remove(&self, relpath: &RelPath) -> Result<()> {
        remove_any(&self.local_path(relpath)).await
    }

    #[async_recursion]
    async fn send_tree(
        root: &std::path::Path,
        sender: &ChangeSender,
        deletes: Vec<RelPath>,
        dir_copies: Vec<RelPath>,
        file_copies: Vec<RelPath>,
    ) -> Result<()> {
        // deletes first
        for path in deletes {
            sender.send(Change::Delete { path }).await?;
        }
        // then each directory, immediately followed by its entire content
        for path in dir_copies {
            let local = path.to_local(root);
            let metadata = tokio::fs::metadata(&local)
                .await
                .with_context(|| format!("failed reading metadata from {local:?}"))?;
            let atime = time_f64(metadata.accessed()?);
            let mtime = time_f64(metadata.modified()?);
            sender
                .send(Change::Directory {
                    path: path.clone(),
                    atime,
                    mtime,
                })
                .await?;
            let (sub_dirs, sub_files) = list_local_dir(&local).await?;
            let sub_dirs = sub_dirs.iter().map(|name| path.child(name)).collect();
            let sub_files = sub_files.iter().map(|name| path.child(name)).collect();
            Self::send_tree(root, sender, Vec::new(), sub_dirs, sub_files).await?;
        }
        // finally loose file data; bodies stay in place, so the receiver
        // must copy them
        for path in file_copies {
            let local = path.to_local(root);
            let metadata = tokio::fs::metadata(&local)
                .await
                .with_context(|| format!("failed reading metadata from {local:?}"))?;
            sender
                .send(Change::File {
                    path,
                    atime: time_f64(metadata.accessed()?),
                    mtime: time_f64(metadata.modified()?),
                    size: metadata.len(),
                    body: FileBody::Sender(local),
                })
                .await?;
        }
        Ok(())
    }

    async fn apply_change(&self, keys: &KeyPolicy, change: Change) -> Result<()> {
        match change {
            Change::Delete { path } => {
                let local = self.local_path(&keys.recrypt_path(&path)?);
                tracing::debug!("delete {local:?}");
                remove_any(&local).await
            }
            Change::Directory { path, atime, mtime } => {
                let local = self.local_path(&keys.recrypt_path(&path)?);
                tracing::debug!("mkdir {local:?}");
                remove_any(&local).await?;
                tokio::fs::create_dir(&local)
                    .await
                    .with_context(|| format!("cannot create directory {local:?}"))?;
                set_file_times(&local, atime, mtime).await
            }
            Change::File {
                path,
                atime,
                mtime,
                body,
                ..
            } => {
                let dst = self.local_path(&keys.recrypt_path(&path)?);
                tracing::debug!("write {dst:?}");
                // inline bodies are materialized next to the target and
                // handled like any other receiver-owned temp from here on
                let (source, owned) = match body {
                    FileBody::Sender(path) => (path, None),
                    FileBody::Receiver(temp) => (temp.path().to_path_buf(), Some(temp)),
                    FileBody::Inline(bytes) => {
                        let temp = TempPath::at(suffixed(&dst, INLINE_SUFFIX));
                        tokio::fs::write(temp.path(), &bytes)
                            .await
                            .with_context(|| format!("failed writing {:?}", temp.path()))?;
                        (temp.path().to_path_buf(), Some(temp))
                    }
                };
                let staging = TempPath::at(suffixed(&dst, STAGING_SUFFIX));
                match (keys.decryption.as_ref(), keys.encryption.as_ref()) {
                    (Some(decryption), Some(encryption)) => {
                        cryptfile::recrypt_file(decryption, encryption, &source, staging.path())
                            .await?;
                    }
                    (None, Some(encryption)) => {
                        cryptfile::encrypt_file(encryption, &source, staging.path()).await?;
                    }
                    (Some(decryption), None) => {
                        cryptfile::decrypt_file(decryption, &source, staging.path()).await?;
                    }
                    (None, None) => {
                        if owned.is_some() {
                            // the temp is ours: skip the copy and rename it
                            // straight into the staging slot
                            tokio::fs::rename(&source, staging.path()).await.with_context(
                                || format!("failed renaming {source:?} to {:?}", staging.path()),
                            )?;
                        } else {
                            tokio::fs::copy(&source, staging.path()).await.with_context(
                                || format!("failed copying {source:?} to {:?}", staging.path()),
                            )?;
                        }
                    }
                }
                remove_any(&dst).await?;
                tokio::fs::rename(staging.path(), &dst)
                    .await
                    .with_context(|| format!("failed renaming {:?} to {dst:?}", staging.path()))?;
                let _ = staging.release();
                set_file_times(&dst, atime, mtime).await
                // `owned` drops here and unlinks the receiver-owned temp
                // unless the zero-copy rename already moved it away
            }
        }
    }
}

#[async_trait::async_trait]
impl FsProvider for LocalFsProvider {
    fn name(&self) -> &'static str {
        "localfs"
    }

    fn uid(&self) -> &str {
        &self.uid
    }

    async fn is_case_sensitive(&self) -> Result<bool> {
        Ok(!cfg!(windows))
    }

    async fn list_dir(&self, relpath: &RelPath) -> Result<(Vec<String>, Vec<String>)> {
        list_local_dir(&self.local_path(relpath)).await
    }

    async fn get_info(&self, items: &[RelPath], encrypted: bool) -> Result<Vec<FileInfo>> {
        let mut infos = Vec::with_capacity(items.len());
        for item in items {
            let local = self.local_path(item);
            let metadata = tokio::fs::metadata(&local)
                .await
                .with_context(|| format!("failed reading metadata from {local:?}"))?;
            let size = if encrypted && metadata.is_file() {
                cryptfile::file_plain_size(&local).await?
            } else {
                metadata.len()
            };
            infos.push(FileInfo {
                atime: time_f64(metadata.accessed()?),
                mtime: time_f64(metadata.modified()?),
                size,
            });
        }
        Ok(infos)
    }

    fn send_changes(
        &self,
        _keys: KeyPolicy,
        deletes: Vec<RelPath>,
        dir_copies: Vec<RelPath>,
        file_copies: Vec<RelPath>,
    ) -> ChangeStream {
        let root = self.root.clone();
        ChangeStream::produce(move |sender| async move {
            Self::send_tree(&root, &sender, deletes, dir_copies, file_copies).await
        })
    }

    async fn receive_changes(&self, keys: KeyPolicy, mut stream: ChangeStream) -> Result<()> {
        while let Some(change) = stream.next().await {
            self.apply_change(&keys, change).await?;
        }
        stream.finish().await
    }

    fn clone_provider(&self) -> Box<dyn FsProvider> {
        Box::new(self.clone())
    }

    fn drill(&mut self, relpath: &RelPath) {
        self.root = relpath.to_local(&self.root);
    }

    fn event_relpath(&self, full_path: &str) -> Result<RelPath> {
        let relative = std::path::Path::new(full_path)
            .strip_prefix(&self.root)
            .map_err(|_| {
                SyncError::InvalidPath(format!(
                    "event path {full_path:?} is outside root {:?}",
                    self.root
                ))
            })?;
        let components = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned());
        Ok(RelPath::from_components(components)?)
    }

    async fn listen_changes(&self, on_change: OnChange) -> Result<Box<dyn FsListener>> {
        LocalFsListener::start(self.root.clone(), self.uid.clone(), on_change)
            .map(|listener| Box::new(listener) as Box<dyn FsListener>)
    }
}

fn classify(path: &std::path::Path) -> EventKind {
    if path.is_dir() {
        EventKind::Directory
    } else {
        EventKind::File
    }
}

/// Background worker translating platform filesystem notifications into
/// provider events. A move shows up as `Delete` on the old path followed by
/// a create on the new one.
pub struct LocalFsListener {
    uid: String,
    stop_requested: std::sync::Arc<std::sync::atomic::AtomicBool>,
    stopped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl LocalFsListener {
    fn start(root: std::path::PathBuf, origin_uid: String, on_change: OnChange) -> Result<Self> {
        use notify::Watcher;
        let emit = {
            let origin_uid = origin_uid.clone();
            move |path: &std::path::Path, kind: EventKind| {
                on_change(FsEvent {
                    path: path.to_string_lossy().into_owned(),
                    kind,
                    origin_uid: origin_uid.clone(),
                });
            }
        };
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!("filesystem watcher error: {err}");
                        return;
                    }
                };
                match event.kind {
                    notify::EventKind::Create(_) => {
                        for path in &event.paths {
                            emit(path, classify(path));
                        }
                    }
                    notify::EventKind::Remove(_) => {
                        for path in &event.paths {
                            emit(path, EventKind::Delete);
                        }
                    }
                    notify::EventKind::Modify(notify::event::ModifyKind::Name(mode)) => {
                        match (mode, event.paths.as_slice()) {
                            (notify::event::RenameMode::Both, [from, to]) => {
                                emit(from, EventKind::Delete);
                                emit(to, classify(to));
                            }
                            (notify::event::RenameMode::From, [from]) => {
                                emit(from, EventKind::Delete);
                            }
                            (notify::event::RenameMode::To, [to]) => {
                                emit(to, classify(to));
                            }
                            (_, paths) => {
                                for path in paths {
                                    if path.exists() {
                                        emit(path, classify(path));
                                    } else {
                                        emit(path, EventKind::Delete);
                                    }
                                }
                            }
                        }
                    }
                    notify::EventKind::Modify(_) => {
                        for path in &event.paths {
                            emit(path, classify(path));
                        }
                    }
                    notify::EventKind::Access(_)
                    | notify::EventKind::Any
                    | notify::EventKind::Other => {}
                }
            })
            .context("failed creating filesystem watcher")?;
        watcher
            .watch(&root, notify::RecursiveMode::Recursive)
            .with_context(|| format!("failed watching {root:?}"))?;

        let stop_requested = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stopped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let thread = {
            let stop_requested = stop_requested.clone();
            let stopped = stopped.clone();
            std::thread::spawn(move || {
                // the watcher delivers events from its own backend thread;
                // this one only keeps it alive until a stop is requested
                while !stop_requested.load(std::sync::atomic::Ordering::SeqCst) {
                    std::thread::sleep(std::time::Duration::from_millis(200));
                }
                drop(watcher);
                stopped.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        };
        Ok(Self {
            uid: origin_uid,
            stop_requested,
            stopped,
            thread: Some(thread),
        })
    }
}

#[async_trait::async_trait]
impl FsListener for LocalFsListener {
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
        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || {
                thread
                    .join()
                    .map_err(|_| anyhow::anyhow!("listener thread panicked"))
            })
            .await??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptfile::hash_key;

    async fn provider(dir: &std::path::Path) -> LocalFsProvider {
        LocalFsProvider::new(dir, false).unwrap()
    }

    #[tokio::test]
    async fn list_dir_omits_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(tmp.path().join("sub")).await.unwrap();
        tokio::fs::write(tmp.path().join("plain.txt"), b"x")
            .await
            .unwrap();
        tokio::fs::symlink("plain.txt", tmp.path().join("link.txt"))
            .await
            .unwrap();
        let provider = provider(tmp.path()).await;
        let (dirs, files) = provider.list_dir(&RelPath::root()).await.unwrap();
        assert_eq!(dirs, ["sub"]);
        assert_eq!(files, ["plain.txt"]);
    }

    #[tokio::test]
    async fn list_dir_missing_directory_is_invalid_path() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = provider(tmp.path()).await;
        let err = provider
            .list_dir(&RelPath::parse("nope").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn get_info_reports_plaintext_size_for_encrypted_files() {
        let tmp = tempfile::tempdir().unwrap();
        let key = hash_key("k");
        let plain = tmp.path().join("plain");
        tokio::fs::write(&plain, vec![7u8; 1234]).await.unwrap();
        let name = cryptfile::encrypt_filename(&key, "doc");
        cryptfile::encrypt_file(&key, &plain, &tmp.path().join(&name))
            .await
            .unwrap();
        tokio::fs::remove_file(&plain).await.unwrap();
        let provider = provider(tmp.path()).await;
        let item = RelPath::parse(&name).unwrap();
        let infos = provider
            .get_info(std::slice::from_ref(&item), true)
            .await
            .unwrap();
        assert_eq!(infos[0].size, 1234);
        let infos = provider.get_info(&[item], false).await.unwrap();
        assert!(infos[0].size > 1234);
    }

    #[tokio::test]
    async fn send_changes_orders_deletes_dirs_then_files() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("d/inner"))
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("d/a.txt"), b"a")
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("d/inner/b.txt"), b"b")
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("loose.txt"), b"c")
            .await
            .unwrap();
        let provider = provider(tmp.path()).await;
        let mut stream = provider.send_changes(
            KeyPolicy::none(),
            vec![RelPath::parse("gone").unwrap()],
            vec![RelPath::parse("d").unwrap()],
            vec![RelPath::parse("loose.txt").unwrap()],
        );
        let mut seen = Vec::new();
        while let Some(change) = stream.next().await {
            seen.push((change.kind(), change.path().to_wire()));
        }
        stream.finish().await.unwrap();
        assert_eq!(
            seen,
            vec![
                (EventKind::Delete, "gone".to_string()),
                (EventKind::Directory, "d".to_string()),
                (EventKind::Directory, "d/inner".to_string()),
                (EventKind::File, "d/inner/b.txt".to_string()),
                (EventKind::File, "d/a.txt".to_string()),
                (EventKind::File, "loose.txt".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn receive_changes_applies_records() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("stale.txt"), b"stale")
            .await
            .unwrap();
        let staged = TempPath::in_dir(Some(tmp.path()));
        tokio::fs::write(staged.path(), b"fresh").await.unwrap();
        let provider = provider(tmp.path()).await;
        let changes = vec![
            Change::Delete {
                path: RelPath::parse("stale.txt").unwrap(),
            },
            Change::Directory {
                path: RelPath::parse("sub").unwrap(),
                atime: 1_000.0,
                mtime: 1_000.0,
            },
            Change::File {
                path: RelPath::parse("sub/new.txt").unwrap(),
                atime: 2_000.0,
                mtime: 2_000.0,
                size: 5,
                body: FileBody::Receiver(staged),
            },
            Change::File {
                path: RelPath::parse("inline.txt").unwrap(),
                atime: 2_000.0,
                mtime: 2_000.0,
                size: 3,
                body: FileBody::Inline(b"abc".to_vec()),
            },
        ];
        provider
            .receive_changes(KeyPolicy::none(), ChangeStream::from_changes(changes))
            .await
            .unwrap();
        assert!(!tmp.path().join("stale.txt").exists());
        assert_eq!(
            tokio::fs::read(tmp.path().join("sub/new.txt"))
                .await
                .unwrap(),
            b"fresh"
        );
        assert_eq!(
            tokio::fs::read(tmp.path().join("inline.txt")).await.unwrap(),
            b"abc"
        );
        let metadata = tokio::fs::metadata(tmp.path().join("sub/new.txt"))
            .await
            .unwrap();
        let mtime = time_f64(metadata.modified().unwrap());
        assert!((mtime - 2_000.0).abs() < 1.0, "mtime was {mtime}");
        // no staging or inline temps left behind
        let (_, files) = provider.list_dir(&RelPath::root()).await.unwrap();
        assert_eq!(
            files.iter().filter(|f| f.contains(".~")).count(),
            0,
            "{files:?}"
        );
    }

    #[tokio::test]
    async fn receive_changes_encrypts_names_and_bodies() {
        let tmp = tempfile::tempdir().unwrap();
        let key = hash_key("store");
        let staged = TempPath::in_dir(Some(tmp.path()));
        tokio::fs::write(staged.path(), b"secret body").await.unwrap();
        let provider = provider(tmp.path()).await;
        let keys = KeyPolicy {
            encryption: Some(key),
            decryption: None,
        };
        provider
            .receive_changes(
                keys,
                ChangeStream::from_changes(vec![Change::File {
                    path: RelPath::parse("doc").unwrap(),
                    atime: 0.0,
                    mtime: 0.0,
                    size: 11,
                    body: FileBody::Receiver(staged),
                }]),
            )
            .await
            .unwrap();
        let on_disk = tmp.path().join(cryptfile::encrypt_filename(&key, "doc"));
        assert!(on_disk.exists());
        let decrypted = tmp.path().join("out");
        cryptfile::decrypt_file(&key, &on_disk, &decrypted)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&decrypted).await.unwrap(), b"secret body");
    }

    #[tokio::test]
    async fn clone_keeps_uid_and_drill_extends_root() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(tmp.path().join("sub")).await.unwrap();
        let provider = provider(tmp.path()).await;
        let mut clone = provider.clone_provider();
        assert_eq!(clone.uid(), provider.uid());
        clone.drill(&RelPath::parse("sub").unwrap());
        let event = tmp.path().join("sub/thing.txt");
        let relpath = clone.event_relpath(event.to_str().unwrap()).unwrap();
        assert_eq!(relpath, RelPath::parse("thing.txt").unwrap());
        assert!(provider
            .event_relpath("/elsewhere/entirely")
            .is_err());
    }

    #[tokio::test]
    async fn listener_reports_create_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = provider(tmp.path()).await;
        let events: std::sync::Arc<std::sync::Mutex<Vec<FsEvent>>> = Default::default();
        let sink = events.clone();
        let mut listener = provider
            .listen_changes(std::sync::Arc::new(move |event| {
                sink.lock().unwrap().push(event);
            }))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tokio::fs::write(tmp.path().join("watched.txt"), b"x")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        tokio::fs::remove_file(tmp.path().join("watched.txt"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        listener.request_stop();
        assert!(listener.is_stopping());
        listener.join().await.unwrap();
        assert!(listener.is_stopped());
        let events = events.lock().unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.path.ends_with("watched.txt") && e.kind != EventKind::Delete),
            "no create event in {events:?}"
        );
        assert!(
            events
                .iter()
                .any(|e| e.path.ends_with("watched.txt") && e.kind == EventKind::Delete),
            "no delete event in {events:?}"
        );
        assert!(events.iter().all(|e| e.origin_uid == provider.uid()));
    }
}
