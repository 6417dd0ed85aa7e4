#![allow(dead_code)]

use anyhow::{Context, Result};
use async_recursion::async_recursion;

/// Fill `root` with a small mixed tree:
///
/// ```text
/// root
/// |- 0.txt
/// |- bar
///    |- 1.txt
///    |- 2.txt
/// |- baz
///    |- 3.txt
///    |- deep
///       |- 4.txt
/// ```
pub async fn populate_tree(root: &std::path::Path) -> Result<()> {
    tokio::fs::write(root.join("0.txt"), "0").await?;
    let bar = root.join("bar");
    tokio::fs::create_dir(&bar).await?;
    tokio::fs::write(bar.join("1.txt"), "1").await?;
    tokio::fs::write(bar.join("2.txt"), "2").await?;
    let baz = root.join("baz");
    tokio::fs::create_dir(&baz).await?;
    tokio::fs::write(baz.join("3.txt"), "3").await?;
    let deep = baz.join("deep");
    tokio::fs::create_dir(&deep).await?;
    tokio::fs::write(deep.join("4.txt"), "4").await?;
    Ok(())
}

/// Assert that two trees carry the same entries with the same file
/// contents. Timestamps are checked separately where a test cares.
#[async_recursion]
pub async fn check_trees_identical(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    let mut src_names = Vec::new();
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        src_names.push(entry.file_name());
    }
    src_names.sort();
    let mut dst_names = Vec::new();
    let mut entries = tokio::fs::read_dir(dst).await?;
    while let Some(entry) = entries.next_entry().await? {
        dst_names.push(entry.file_name());
    }
    dst_names.sort();
    assert_eq!(src_names, dst_names, "trees differ at {src:?} vs {dst:?}");

    for name in src_names {
        let src_path = src.join(&name);
        let dst_path = dst.join(&name);
        let src_md = tokio::fs::symlink_metadata(&src_path)
            .await
            .context(format!("source entry {src_path:?} is missing"))?;
        let dst_md = tokio::fs::symlink_metadata(&dst_path)
            .await
            .context(format!("destination entry {dst_path:?} is missing"))?;
        assert_eq!(
            src_md.is_dir(),
            dst_md.is_dir(),
            "type mismatch for {src_path:?}"
        );
        if src_md.is_dir() {
            check_trees_identical(&src_path, &dst_path).await?;
        } else {
            assert_eq!(
                tokio::fs::read(&src_path).await?,
                tokio::fs::read(&dst_path).await?,
                "contents differ for {src_path:?}"
            );
        }
    }
    Ok(())
}
