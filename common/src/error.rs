/// Errors shared across the sync core.
///
/// Anything I/O-shaped travels as `anyhow::Error` with context attached at
/// the failure site; these variants exist for the cases callers need to
/// distinguish.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A relative path escaped its root or contained forbidden components.
    /// Always fatal for the request that carried it.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// An encrypted file was shorter than its header declared.
    #[error("corrupt encrypted file: {0}")]
    CorruptFile(String),

    /// A change stream or wire message carried an unknown tag.
    #[error("protocol error: {0}")]
    Protocol(String),
}
