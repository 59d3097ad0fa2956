//! Filesystem operations the transition step depends on.
//!
//! [`FileOps`] is the seam tests use to simulate failing renames and moves.
//! The lock helpers use advisory `flock` on unix.

use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::debug;

#[async_trait]
pub trait FileOps: Send + Sync {
    /// Rename within one directory tree.
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Move to `to`, creating parent directories and crossing devices if needed.
    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// [`FileOps`] on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileOps;

#[async_trait]
impl FileOps for LocalFileOps {
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Rename first, copy across filesystems
        if let Err(e) = tokio::fs::rename(from, to).await {
            if !tokio::fs::try_exists(from).await.unwrap_or(false) {
                return Err(e);
            }
            debug!(from = %from.display(), to = %to.display(), "rename failed ({}), copying", e);
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await?;
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

/// A missing file will not appear by waiting.
fn transient(e: &io::Error) -> bool {
    e.kind() != io::ErrorKind::NotFound
}

pub async fn rename_with_retry(
    ops: &dyn FileOps,
    policy: &RetryPolicy,
    from: &Path,
    to: &Path,
) -> io::Result<()> {
    let what = format!("rename {} -> {}", from.display(), to.display());
    policy.run(&what, || ops.rename(from, to), transient).await
}

pub async fn move_with_retry(
    ops: &dyn FileOps,
    policy: &RetryPolicy,
    from: &Path,
    to: &Path,
) -> io::Result<()> {
    let what = format!("move {} -> {}", from.display(), to.display());
    policy.run(&what, || ops.move_file(from, to), transient).await
}

pub async fn remove_with_retry(ops: &dyn FileOps, policy: &RetryPolicy, path: &Path) -> io::Result<()> {
    let what = format!("remove {}", path.display());
    policy.run(&what, || ops.remove(path), transient).await
}

/// A file held under an exclusive advisory lock until dropped.
pub struct LockedFile {
    #[cfg(unix)]
    inner: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    inner: File,
}

impl LockedFile {
    pub fn file(&mut self) -> &mut File {
        &mut self.inner
    }
}

/// Takes an exclusive lock, waiting for other holders.
#[cfg(unix)]
pub fn lock_exclusive(file: File) -> io::Result<LockedFile> {
    use nix::fcntl::{Flock, FlockArg};

    Flock::lock(file, FlockArg::LockExclusive)
        .map(|inner| LockedFile { inner })
        .map_err(|(_, errno)| io::Error::from(errno))
}

/// Takes an exclusive lock or returns `None` if another holder has it.
#[cfg(unix)]
pub fn try_lock_exclusive(file: File) -> io::Result<Option<LockedFile>> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(inner) => Ok(Some(LockedFile { inner })),
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
        Err((_, errno)) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
pub fn lock_exclusive(file: File) -> io::Result<LockedFile> {
    Ok(LockedFile { inner: file })
}

#[cfg(not(unix))]
pub fn try_lock_exclusive(file: File) -> io::Result<Option<LockedFile>> {
    Ok(Some(LockedFile { inner: file }))
}

/// True when another process holds an exclusive lock on `path`.
pub fn is_locked(path: &Path) -> io::Result<bool> {
    let file = File::open(path)?;
    Ok(try_lock_exclusive(file)?.is_none())
}
