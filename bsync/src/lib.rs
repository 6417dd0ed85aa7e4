//! Client-encrypted directory synchronization tools - `bsync` (sync client)
//! and `bsyncd` (backup server daemon).
//!
//! The server side lives in this crate as a library so the daemon stays a
//! thin shell: [`actions`] dispatches the wire protocol's actions with
//! per-user confinement and permissions, [`users`] is the line-oriented
//! user store, [`observers`] hosts the long-poll change notifier and
//! [`httpd`] parses multipart requests into dispatch calls. [`location`]
//! turns command-line locations into providers for the client binary.

pub mod actions;
pub mod httpd;
pub mod location;
pub mod observers;
pub mod users;
