use std::fs;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;
use warden_proto::proto::ManifestEntry;

/// Copies a directory tree. Injected into the vault so copies can be slowed or failed in tests.
pub trait TreeCopier: Send + Sync {
    fn copy_tree(&self, src: &Path, dst: &Path) -> io::Result<()>;
}

#[derive(Debug, Default)]
pub struct FsCopier;

impl TreeCopier for FsCopier {
    fn copy_tree(&self, src: &Path, dst: &Path) -> io::Result<()> {
        fs::create_dir_all(dst)?;
        for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(io::Error::other)?;
            let dest = dst.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&dest)?;
            } else if file_type.is_file() {
                fs::copy(entry.path(), &dest)?;
            } else if file_type.is_symlink() {
                copy_link(entry.path(), &dest)?;
            } else {
                return Err(unsupported(entry.path()));
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn copy_link(src: &Path, dest: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn copy_link(src: &Path, _dest: &Path) -> io::Result<()> {
    Err(unsupported(src))
}

fn unsupported(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} is not a directory, regular file or symlink", path.display()),
    )
}

/// Every directory, regular file and symlink under `root`, sorted by path.
/// Any other kind of entry fails the walk.
pub fn build_manifest(root: &Path) -> io::Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let path = relative_path(root, entry.path())?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            entries.push(ManifestEntry::Dir { path });
        } else if file_type.is_file() {
            let (size, sha256) = hash_file(entry.path())?;
            entries.push(ManifestEntry::File { path, size, sha256 });
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?.to_string_lossy().into_owned();
            entries.push(ManifestEntry::Symlink { path, target });
        } else {
            return Err(unsupported(entry.path()));
        }
    }
    entries.sort_by(|a, b| a.path().cmp(b.path()));
    Ok(entries)
}

/// Re-read `root` and fail with `InvalidData` naming the first difference.
pub fn verify(root: &Path, expected: &[ManifestEntry]) -> io::Result<()> {
    let actual = build_manifest(root)?;
    if actual.len() != expected.len() {
        return Err(mismatch(format!(
            "{} holds {} entries, manifest lists {}",
            root.display(),
            actual.len(),
            expected.len()
        )));
    }
    for (found, want) in actual.iter().zip(expected) {
        if found != want {
            return Err(mismatch(format!("{} does not match the manifest", want.path())));
        }
    }
    Ok(())
}

pub fn total_size(manifest: &[ManifestEntry]) -> u64 {
    manifest.iter().map(ManifestEntry::size).sum()
}

fn relative_path(root: &Path, path: &Path) -> io::Result<String> {
    let rel = path.strip_prefix(root).map_err(io::Error::other)?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn hash_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((size, hex::encode(hasher.finalize())))
}

fn mismatch(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
