//! Internal library for the bsync tools - provider abstraction, crypto and sync core.
//!
//! The pieces fit together like this: a [`provider::FsProvider`] gives a
//! uniform view over a rooted file tree (local directory or remote server),
//! [`syncdir`] compares two providers and pumps a change stream from the
//! sender into the receiver, [`cryptfile`] supplies the encryption applied to
//! file names and bodies on the way, and [`reducer`] + [`continuous`] drive
//! incremental re-syncs from filesystem events.

pub mod continuous;
pub mod cryptfile;
pub mod error;
pub mod localfs;
pub mod provider;
pub mod reducer;
pub mod relpath;
pub mod syncdir;
pub mod testutils;
pub mod tmp;

pub use cryptfile::HashedKey;
pub use error::SyncError;
pub use relpath::RelPath;
