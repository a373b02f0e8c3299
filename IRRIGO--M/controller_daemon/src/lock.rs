//! Single-instance lock marker (pid file).
//!
//! The marker holds the ASCII decimal pid of the owning daemon and nothing
//! else. A marker whose pid no longer maps to a live process is stale and is
//! replaced on the next start. Checking and replacing happen under an
//! exclusive `flock` on a sibling `<marker>.lock` file, and a new marker is
//! hard-linked into place fully written, so concurrent starters never both win.

use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use thiserror::Error;

/// Markers held by `DaemonLock`s of this process, by canonical path.
static HELD_HERE: Mutex<BTreeSet<PathBuf>> = parking_lot::const_mutex(BTreeSet::new());

/// Failures while acquiring or releasing the lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// A live process already owns the marker.
    #[error("another instance is already running (pid {pid})")]
    AlreadyRunning {
        /// Pid recorded in the marker.
        pid: u32,
    },
    /// Filesystem failure on the marker.
    #[error("lock file {path}: {source}")]
    Io {
        /// Marker path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Reads the pid recorded in the marker. Missing or unparsable markers yield `None`.
pub fn read_owner(path: &Path) -> Result<Option<u32>, LockError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse::<u32>().ok()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LockError::io(path, err)),
    }
}

/// Returns true when `pid` names a live process.
#[cfg(unix)]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    // pid 0 and negative values address process groups
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Returns true when `pid` names a live process.
#[cfg(not(unix))]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Pid of the live instance holding the marker, if any.
///
/// A marker carrying this process's own pid only counts when a [`DaemonLock`]
/// in this process holds it; otherwise it was left by an earlier process that
/// happened to have the same pid.
pub fn running_instance(path: &Path) -> Result<Option<u32>, LockError> {
    Ok(read_owner(path)?.filter(|pid| {
        if *pid == std::process::id() {
            held_here(path)
        } else {
            is_process_alive(*pid)
        }
    }))
}

fn marker_key(path: &Path) -> PathBuf {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return path.to_path_buf();
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    fs::canonicalize(parent).map_or_else(|_| path.to_path_buf(), |dir| dir.join(name))
}

fn held_here(path: &Path) -> bool {
    HELD_HERE.lock().contains(&marker_key(path))
}

fn sibling(marker: &Path, suffix: &str) -> PathBuf {
    let mut name = marker.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
type SwapGuard = nix::fcntl::Flock<File>;
#[cfg(not(unix))]
type SwapGuard = File;

/// Blocks until this caller is the only one inspecting or replacing `marker`.
fn swap_guard(marker: &Path) -> Result<SwapGuard, LockError> {
    let path = sibling(marker, ".lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|err| LockError::io(&path, err))?;
    #[cfg(unix)]
    {
        use nix::{
            errno::Errno,
            fcntl::{Flock, FlockArg},
        };

        let mut file = file;
        loop {
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(guard) => return Ok(guard),
                Err((retry, Errno::EINTR)) => file = retry,
                Err((_, errno)) => return Err(LockError::io(&path, io::Error::from(errno))),
            }
        }
    }
    #[cfg(not(unix))]
    Ok(file)
}

/// Writes `pid` beside the marker and links it into place, so the marker is
/// never observed empty or half written.
fn publish_marker(path: &Path, pid: u32) -> Result<(), LockError> {
    let staging = sibling(path, ".tmp");
    match fs::remove_file(&staging) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(LockError::io(&staging, err)),
    }
    let written = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staging)
        .and_then(|mut file| {
            write!(file, "{pid}")?;
            file.sync_all()
        })
        .map_err(|err| LockError::io(&staging, err));
    let linked = written.and_then(|()| match fs::hard_link(&staging, path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let owner = read_owner(path)?.unwrap_or_default();
            Err(LockError::AlreadyRunning { pid: owner })
        }
        Err(err) => Err(LockError::io(path, err)),
    });
    if let Err(err) = fs::remove_file(&staging) {
        tracing::debug!("leaving staging file {}: {err}", staging.display());
    }
    linked
}

/// Held lock marker. Released explicitly through [`DaemonLock::release`] or on drop.
#[derive(Debug)]
pub struct DaemonLock {
    path: PathBuf,
    key: PathBuf,
    pid: u32,
    released: AtomicBool,
}

impl DaemonLock {
    /// Acquires the marker at `path` for the current process.
    ///
    /// A marker owned by a live process is left untouched and reported as
    /// [`LockError::AlreadyRunning`]. Stale or unreadable markers are replaced.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        Self::acquire_for(path, std::process::id())
    }

    fn acquire_for(path: impl Into<PathBuf>, pid: u32) -> Result<Self, LockError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| LockError::io(parent, err))?;
        }
        let key = marker_key(&path);
        let _guard = swap_guard(&path)?;

        if HELD_HERE.lock().contains(&key) {
            return Err(LockError::AlreadyRunning {
                pid: std::process::id(),
            });
        }
        if let Some(owner) = running_instance(&path)? {
            return Err(LockError::AlreadyRunning { pid: owner });
        }
        match fs::remove_file(&path) {
            Ok(()) => tracing::warn!("removed stale lock file {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(LockError::io(&path, err)),
        }
        publish_marker(&path, pid)?;
        HELD_HERE.lock().insert(key.clone());
        Ok(Self {
            path,
            key,
            pid,
            released: AtomicBool::new(false),
        })
    }

    /// Marker path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid written into the marker.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// True once the marker has been removed by this guard.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Removes the marker if it still carries this lock's pid. Only the first
    /// call touches the filesystem; an absent marker is not an error. Returns
    /// true if this call removed it.
    pub fn release(&self) -> Result<bool, LockError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let removed = self.remove_own_marker();
        HELD_HERE.lock().remove(&self.key);
        removed
    }

    fn remove_own_marker(&self) -> Result<bool, LockError> {
        let _guard = swap_guard(&self.path)?;
        if read_owner(&self.path)? != Some(self.pid) {
            return Ok(false);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(LockError::io(&self.path, err)),
        }
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!("failed to remove lock file on drop: {err}");
        }
    }
}
