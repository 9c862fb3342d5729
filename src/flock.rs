use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Exclusive hold on a database file, kept in `<db>.lock` for as long as
/// the database is open. The lock file records the holder's process id.
pub struct DbLock {
    file: File,
    path: PathBuf,
}

impl DbLock {
    pub fn lock_path(db: &Path) -> PathBuf {
        let mut name = db.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Locks `db`, failing at once if another handle already holds it.
    pub fn acquire(db: &Path) -> Result<Self> {
        let path = Self::lock_path(db);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = try_lock(&file) {
            let holder = fs::read_to_string(&path).unwrap_or_default();
            let holder = holder.trim();
            let msg = if holder.is_empty() {
                format!("{} is in use", db.display())
            } else {
                format!("{} is in use by process {}", db.display(), holder)
            };
            return Err(Error::LockError(io::Error::new(e.kind(), msg)));
        }

        // only rewrite the pid once the lock is ours
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        tracing::debug!(path = %path.display(), "acquired database lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        // closing the handle releases the lock; the file stays so that a
        // racing opener never locks a different inode
        let _ = self.file.set_len(0);
        tracing::debug!(path = %self.path().display(), "released database lock");
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_EX, LOCK_NB};

    let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::OVERLAPPED;
    use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    let result = unsafe {
        LockFileEx(
            file.as_raw_handle() as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            &mut overlapped,
        )
    };
    if result == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> io::Result<()> {
    Ok(())
}
