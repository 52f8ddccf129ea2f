use std::path::{Path, PathBuf};

pub struct RuntimePaths {
    pub runtime_dir: PathBuf,
    pub socket_path: PathBuf,
    pub lock_path: PathBuf,
}

const APP_ID: &str = "warden";

impl RuntimePaths {
    /// Resolve the per-user runtime directory: `$XDG_RUNTIME_DIR`, then `$TMPDIR`,
    /// then the platform temp dir.
    pub fn resolve() -> Self {
        let base = std::env::var_os("XDG_RUNTIME_DIR")
            .or_else(|| std::env::var_os("TMPDIR"))
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self::under(&base)
    }

    pub fn under(base: &Path) -> Self {
        let runtime_dir = base.join(APP_ID);
        Self {
            socket_path: runtime_dir.join("wardend.sock"),
            lock_path: runtime_dir.join("wardend.lock"),
            runtime_dir,
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.runtime_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_and_lock_share_the_runtime_dir() {
        let paths = RuntimePaths::under(Path::new("/run/user/1000"));
        assert_eq!(paths.runtime_dir, PathBuf::from("/run/user/1000/warden"));
        assert_eq!(paths.socket_path.parent(), Some(paths.runtime_dir.as_path()));
        assert_eq!(paths.lock_path.parent(), Some(paths.runtime_dir.as_path()));
    }
}
