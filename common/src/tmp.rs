use rand::Rng;

/// A temp path that unlinks itself unless ownership is explicitly released.
///
/// Names are always random, never derived from the target name: staged file
/// names travel in upload requests and on encrypted destinations the real
/// name must not leak through its temp-file prefix.
#[derive(Debug)]
pub struct TempPath {
    path: std::path::PathBuf,
    armed: bool,
}

fn random_name() -> String {
    format!(".bsync-{:016x}.tmp", rand::thread_rng().gen::<u64>())
}

impl TempPath {
    /// A temp path next to `target`, so the final rename stays on one
    /// filesystem.
    pub fn for_target(target: &std::path::Path) -> Self {
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        Self {
            path: dir.join(random_name()),
            armed: true,
        }
    }

    /// Guard an exact path chosen by the caller (staging files with fixed
    /// suffixes).
    pub fn at(path: std::path::PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// A temp path in `dir`, falling back to the system temp directory.
    pub fn in_dir(dir: Option<&std::path::Path>) -> Self {
        let dir = dir
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            path: dir.join(random_name()),
            armed: true,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Hand the file over to a new owner; the guard no longer unlinks it.
    pub fn release(mut self) -> std::path::PathBuf {
        self.armed = false;
        self.path.clone()
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if self.armed {
            // best effort; the path may legitimately be gone already
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
