//! Comparing and synchronizing two providers.
//!
//! `compare` walks both trees and schedules deletions, directory copies and
//! file copies; `sync` turns the schedule into a change stream pumped from
//! the sender into the receiver. All set comparisons happen in
//! plaintext-name space: listings are decrypted with each side's key before
//! they meet.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use async_recursion::async_recursion;

use crate::cryptfile::{self, HashedKey};
use crate::provider::{Change, ChangeStream, EventKind, FsProvider, KeyPolicy};
use crate::relpath::RelPath;

/// How modification times drive the copy decision. Comparison resolution is
/// one second: some filesystems store whole seconds only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MtimeMode {
    /// Copy when the times differ by more than a second.
    Changed,
    /// Copy when the source is more than a second newer.
    Newer,
    /// Do not consult mtime.
    Ignore,
}

/// How file sizes drive the copy decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeMode {
    Changed,
    /// Copy when the source is bigger.
    Bigger,
    Ignore,
}

impl std::str::FromStr for MtimeMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "c" | "changed" => Ok(MtimeMode::Changed),
            "n" | "newer" => Ok(MtimeMode::Newer),
            "i" | "ignore" => Ok(MtimeMode::Ignore),
            other => bail!("invalid mtime compare mode: {other}"),
        }
    }
}

impl std::str::FromStr for SizeMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "c" | "changed" => Ok(SizeMode::Changed),
            "b" | "bigger" => Ok(SizeMode::Bigger),
            "i" | "ignore" => Ok(SizeMode::Ignore),
            other => bail!("invalid size compare mode: {other}"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SyncOptions {
    /// Delete destination entries that have no source counterpart.
    pub sync_deletes: bool,
    pub mtime_mode: MtimeMode,
    pub size_mode: SizeMode,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sync_deletes: false,
            mtime_mode: MtimeMode::Changed,
            size_mode: SizeMode::Changed,
        }
    }
}

impl SyncOptions {
    pub fn validate(&self) -> Result<()> {
        if self.mtime_mode == MtimeMode::Ignore && self.size_mode == SizeMode::Ignore {
            bail!("cannot ignore both mtime and size");
        }
        Ok(())
    }
}

/// Decide whether a file present on both sides should be copied.
///
/// With `Newer` + `Bigger`, mtime takes precedence: a strictly older source
/// is never copied, however big it is.
fn info_compare(
    src: crate::provider::FileInfo,
    dst: crate::provider::FileInfo,
    options: &SyncOptions,
) -> bool {
    match options.mtime_mode {
        MtimeMode::Newer => {
            if src.mtime - dst.mtime > 1.0 {
                return true;
            }
            if options.size_mode == SizeMode::Bigger && dst.mtime - src.mtime > 1.0 {
                return false;
            }
        }
        MtimeMode::Changed => {
            if (src.mtime - dst.mtime).abs() > 1.0 {
                return true;
            }
        }
        MtimeMode::Ignore => {}
    }
    match options.size_mode {
        SizeMode::Bigger => src.size > dst.size,
        SizeMode::Changed => src.size != dst.size,
        SizeMode::Ignore => false,
    }
}

fn encrypt_relpath(key: Option<&HashedKey>, path: &RelPath) -> Result<RelPath> {
    Ok(RelPath::from_components(cryptfile::encrypt_path_items(
        key,
        path.components(),
    ))?)
}

fn prefixed(relpath: &RelPath, names: impl IntoIterator<Item = String>) -> Vec<RelPath> {
    names
        .into_iter()
        .map(|name| relpath.child(&name))
        .collect()
}

/// The three scheduled work lists produced by [`compare`], in plaintext-name
/// space.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Schedule {
    pub deletes: Vec<RelPath>,
    pub dir_copies: Vec<RelPath>,
    pub file_copies: Vec<RelPath>,
}

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.dir_copies.is_empty() && self.file_copies.is_empty()
    }
}

#[async_recursion]
async fn do_compare(
    src: &dyn FsProvider,
    dst: &dyn FsProvider,
    schedule: &mut Schedule,
    relpath: &RelPath,
    options: &SyncOptions,
    src_key: Option<&HashedKey>,
    dst_key: Option<&HashedKey>,
) -> Result<()> {
    let (src_dnames, src_fnames) = src
        .list_dir(&encrypt_relpath(src_key, relpath)?)
        .await
        .with_context(|| format!("failed listing source at {relpath}"))?;
    let (dst_dnames, dst_fnames) = dst
        .list_dir(&encrypt_relpath(dst_key, relpath)?)
        .await
        .with_context(|| format!("failed listing destination at {relpath}"))?;

    let src_dnames: BTreeSet<String> = cryptfile::decrypt_path_items(src_key, &src_dnames)?
        .into_iter()
        .collect();
    let src_fnames: BTreeSet<String> = cryptfile::decrypt_path_items(src_key, &src_fnames)?
        .into_iter()
        .collect();
    let dst_dnames: BTreeSet<String> = cryptfile::decrypt_path_items(dst_key, &dst_dnames)?
        .into_iter()
        .collect();
    let dst_fnames: BTreeSet<String> = cryptfile::decrypt_path_items(dst_key, &dst_fnames)?
        .into_iter()
        .collect();

    // delete what only the destination has
    if options.sync_deletes {
        let src_items: BTreeSet<&String> = src_dnames.union(&src_fnames).collect();
        let dst_items: BTreeSet<&String> = dst_dnames.union(&dst_fnames).collect();
        schedule.deletes.extend(
            dst_items
                .difference(&src_items)
                .map(|name| relpath.child(name)),
        );
    }
    // copy whole trees for new directories, then new files
    schedule.dir_copies.extend(prefixed(
        relpath,
        src_dnames.difference(&dst_dnames).cloned(),
    ));
    schedule.file_copies.extend(prefixed(
        relpath,
        src_fnames.difference(&dst_fnames).cloned(),
    ));

    // files present on both sides: consult stat info
    let common: Vec<RelPath> = prefixed(relpath, src_fnames.intersection(&dst_fnames).cloned());
    if !common.is_empty() {
        let src_items: Vec<RelPath> = common
            .iter()
            .map(|item| encrypt_relpath(src_key, item))
            .collect::<Result<Vec<_>>>()?;
        let dst_items: Vec<RelPath> = common
            .iter()
            .map(|item| encrypt_relpath(dst_key, item))
            .collect::<Result<Vec<_>>>()?;
        let src_infos = src.get_info(&src_items, src_key.is_some()).await?;
        let dst_infos = dst.get_info(&dst_items, dst_key.is_some()).await?;
        for ((item, src_info), dst_info) in common.iter().zip(src_infos).zip(dst_infos) {
            if info_compare(src_info, dst_info, options) {
                schedule.file_copies.push(item.clone());
            }
        }
    }

    // recurse into directories both sides have
    for dname in src_dnames.intersection(&dst_dnames) {
        do_compare(
            src,
            dst,
            schedule,
            &relpath.child(dname),
            options,
            src_key,
            dst_key,
        )
        .await?;
    }
    Ok(())
}

/// Compare two providers asymmetrically and return the scheduled work.
pub async fn compare(
    src: &dyn FsProvider,
    dst: &dyn FsProvider,
    options: &SyncOptions,
    src_key: Option<&HashedKey>,
    dst_key: Option<&HashedKey>,
) -> Result<Schedule> {
    options.validate()?;
    let mut schedule = Schedule::default();
    do_compare(
        src,
        dst,
        &mut schedule,
        &RelPath::root(),
        options,
        src_key,
        dst_key,
    )
    .await?;
    Ok(schedule)
}

/// Record filter applied between sender and receiver; returning `false`
/// drops the record (its body guard cleans up any receiver-owned temp).
pub type ChangeFilter = std::sync::Arc<dyn Fn(&Change) -> bool + Send + Sync>;

fn log_change(change: &Change, decryption: Option<&HashedKey>) {
    let name = cryptfile::decrypt_path_items(decryption, change.path().components())
        .map(|items| items.join("/"))
        .unwrap_or_else(|_| change.path().to_wire());
    match change.kind() {
        EventKind::File => tracing::debug!("+ {name}"),
        EventKind::Directory => tracing::debug!("+ {name}/"),
        EventKind::Delete => tracing::debug!("- {name}"),
    }
}

fn pump(stream: ChangeStream, decryption: Option<HashedKey>, filter: Option<ChangeFilter>) -> ChangeStream {
    ChangeStream::produce(move |sender| async move {
        let mut stream = stream;
        while let Some(change) = stream.next().await {
            log_change(&change, decryption.as_ref());
            if let Some(filter) = &filter {
                if !filter(&change) {
                    // dropping the record here releases any owned body
                    continue;
                }
            }
            sender.send(change).await?;
        }
        stream.finish().await
    })
}

/// Compare and then push the differences from `src` to `dst`.
///
/// The schedule is re-encrypted into the source's ciphertext namespace
/// (that is what the sender's `send_changes` expects); the sender runs
/// without keys while the receiver decrypts from the source key and
/// re-encrypts with the destination key.
pub async fn sync(
    src: &dyn FsProvider,
    dst: &dyn FsProvider,
    options: &SyncOptions,
    src_key: Option<&HashedKey>,
    dst_key: Option<&HashedKey>,
    filter: Option<ChangeFilter>,
) -> Result<()> {
    let schedule = compare(src, dst, options, src_key, dst_key).await?;
    tracing::info!(
        deletes = schedule.deletes.len(),
        dir_copies = schedule.dir_copies.len(),
        file_copies = schedule.file_copies.len(),
        "starting sync"
    );
    let deletes = schedule
        .deletes
        .iter()
        .map(|path| encrypt_relpath(src_key, path))
        .collect::<Result<Vec<_>>>()?;
    let dir_copies = schedule
        .dir_copies
        .iter()
        .map(|path| encrypt_relpath(src_key, path))
        .collect::<Result<Vec<_>>>()?;
    let file_copies = schedule
        .file_copies
        .iter()
        .map(|path| encrypt_relpath(src_key, path))
        .collect::<Result<Vec<_>>>()?;
    let stream = src.send_changes(KeyPolicy::none(), deletes, dir_copies, file_copies);
    let receiver_keys = KeyPolicy {
        decryption: src_key.copied(),
        encryption: dst_key.copied(),
    };
    dst.receive_changes(receiver_keys, pump(stream, receiver_keys.decryption, filter))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptfile::hash_key;
    use crate::localfs::LocalFsProvider;
    use crate::provider::FileInfo;
    use crate::testutils;

    fn info(mtime: f64, size: u64) -> FileInfo {
        FileInfo {
            atime: mtime,
            mtime,
            size,
        }
    }

    #[test]
    fn rejects_double_ignore() {
        let options = SyncOptions {
            sync_deletes: false,
            mtime_mode: MtimeMode::Ignore,
            size_mode: SizeMode::Ignore,
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn info_compare_changed_modes() {
        let options = SyncOptions::default();
        assert!(!info_compare(info(1000.0, 5), info(1000.5, 5), &options));
        assert!(info_compare(info(1000.0, 5), info(1002.0, 5), &options));
        assert!(info_compare(info(1000.0, 6), info(1000.0, 5), &options));
    }

    #[test]
    fn newer_wins_over_bigger() {
        let options = SyncOptions {
            sync_deletes: false,
            mtime_mode: MtimeMode::Newer,
            size_mode: SizeMode::Bigger,
        };
        // newer but smaller source: copied
        assert!(info_compare(info(2000.0, 5), info(1000.0, 100), &options));
        // older but bigger source: not copied
        assert!(!info_compare(info(1000.0, 100), info(2000.0, 5), &options));
        // same age, bigger: size decides
        assert!(info_compare(info(1000.0, 100), info(1000.0, 5), &options));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("n".parse::<MtimeMode>().unwrap(), MtimeMode::Newer);
        assert_eq!("C".parse::<SizeMode>().unwrap(), SizeMode::Changed);
        assert!("x".parse::<MtimeMode>().is_err());
    }

    async fn providers(
        tmp: &std::path::Path,
    ) -> (LocalFsProvider, LocalFsProvider) {
        let src = LocalFsProvider::new(&tmp.join("src"), true).unwrap();
        let dst = LocalFsProvider::new(&tmp.join("dst"), true).unwrap();
        (src, dst)
    }

    #[tokio::test]
    async fn asymmetric_copy_without_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, dst) = providers(tmp.path()).await;
        tokio::fs::write(src.root().join("a.txt"), b"hello")
            .await
            .unwrap();
        filetime::set_file_times(
            src.root().join("a.txt"),
            filetime::FileTime::from_unix_time(1000, 0),
            filetime::FileTime::from_unix_time(1000, 0),
        )
        .unwrap();
        let options = SyncOptions {
            sync_deletes: true,
            ..Default::default()
        };
        sync(&src, &dst, &options, None, None, None).await.unwrap();
        assert_eq!(
            tokio::fs::read(dst.root().join("a.txt")).await.unwrap(),
            b"hello"
        );
        let metadata = tokio::fs::metadata(dst.root().join("a.txt")).await.unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&metadata);
        assert!((mtime.unix_seconds() - 1000).abs() <= 1);
        // source untouched
        assert_eq!(
            tokio::fs::read(src.root().join("a.txt")).await.unwrap(),
            b"hello"
        );
    }

    #[tokio::test]
    async fn delete_propagation() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, dst) = providers(tmp.path()).await;
        tokio::fs::write(dst.root().join("old.txt"), b"old")
            .await
            .unwrap();
        tokio::fs::create_dir(dst.root().join("olddir")).await.unwrap();
        let options = SyncOptions {
            sync_deletes: true,
            ..Default::default()
        };
        sync(&src, &dst, &options, None, None, None).await.unwrap();
        let (dirs, files) = dst
            .list_dir(&RelPath::root())
            .await
            .unwrap();
        assert!(dirs.is_empty() && files.is_empty(), "{dirs:?} {files:?}");
    }

    #[tokio::test]
    async fn newer_source_replaces_bigger_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, dst) = providers(tmp.path()).await;
        tokio::fs::write(src.root().join("x"), b"12345").await.unwrap();
        filetime::set_file_times(
            src.root().join("x"),
            filetime::FileTime::from_unix_time(2000, 0),
            filetime::FileTime::from_unix_time(2000, 0),
        )
        .unwrap();
        tokio::fs::write(dst.root().join("x"), vec![0u8; 100])
            .await
            .unwrap();
        filetime::set_file_times(
            dst.root().join("x"),
            filetime::FileTime::from_unix_time(1000, 0),
            filetime::FileTime::from_unix_time(1000, 0),
        )
        .unwrap();
        let options = SyncOptions {
            sync_deletes: false,
            mtime_mode: MtimeMode::Newer,
            size_mode: SizeMode::Bigger,
        };
        sync(&src, &dst, &options, None, None, None).await.unwrap();
        assert_eq!(
            tokio::fs::metadata(dst.root().join("x")).await.unwrap().len(),
            5
        );
    }

    #[tokio::test]
    async fn full_tree_sync_reaches_fixpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, dst) = providers(tmp.path()).await;
        testutils::populate_tree(src.root()).await.unwrap();
        tokio::fs::write(dst.root().join("extra.txt"), b"extra")
            .await
            .unwrap();
        let options = SyncOptions {
            sync_deletes: true,
            ..Default::default()
        };
        sync(&src, &dst, &options, None, None, None).await.unwrap();
        testutils::check_trees_identical(src.root(), dst.root())
            .await
            .unwrap();
        // invariant: re-running the comparator right after a sync finds
        // nothing left to do
        let schedule = compare(&src, &dst, &options, None, None).await.unwrap();
        assert!(schedule.is_empty(), "{schedule:?}");
    }

    #[tokio::test]
    async fn recryption_in_transit() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, dst) = providers(tmp.path()).await;
        let key1 = hash_key("source passphrase");
        let key2 = hash_key("destination passphrase");
        // seed the source store in key1's namespace
        let plain = tmp.path().join("plain");
        tokio::fs::write(&plain, b"P").await.unwrap();
        let src_name = cryptfile::encrypt_filename(&key1, "doc");
        cryptfile::encrypt_file(&key1, &plain, &src.root().join(&src_name))
            .await
            .unwrap();

        let options = SyncOptions {
            sync_deletes: true,
            ..Default::default()
        };
        sync(&src, &dst, &options, Some(&key1), Some(&key2), None)
            .await
            .unwrap();

        let dst_name = cryptfile::encrypt_filename(&key2, "doc");
        let on_disk = dst.root().join(&dst_name);
        assert!(on_disk.exists(), "expected {dst_name} on the destination");
        let decrypted = tmp.path().join("decrypted");
        cryptfile::decrypt_file(&key2, &on_disk, &decrypted)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&decrypted).await.unwrap(), b"P");

        // and the comparator agrees both sides now match
        let schedule = compare(&src, &dst, &options, Some(&key1), Some(&key2))
            .await
            .unwrap();
        assert!(schedule.is_empty(), "{schedule:?}");
    }

    #[tokio::test]
    async fn filter_drops_records() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, dst) = providers(tmp.path()).await;
        tokio::fs::write(src.root().join("keep.txt"), b"keep")
            .await
            .unwrap();
        tokio::fs::write(src.root().join("skip.txt"), b"skip")
            .await
            .unwrap();
        let filter: ChangeFilter =
            std::sync::Arc::new(|change: &Change| change.path().to_wire() != "skip.txt");
        sync(
            &src,
            &dst,
            &SyncOptions::default(),
            None,
            None,
            Some(filter),
        )
        .await
        .unwrap();
        assert!(dst.root().join("keep.txt").exists());
        assert!(!dst.root().join("skip.txt").exists());
    }
}
