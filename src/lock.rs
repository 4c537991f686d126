// =============================================================================
// Startup hygiene — PID lock file and duplicate-process scan
// =============================================================================
//
// Two independent guards: a process-table scan for other instances of this
// binary, and a bot.lock file holding the live PID. A stale lock (dead PID) is
// removed silently; a live one refuses startup.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sysinfo::{Pid, System};
use tracing::{info, warn};

/// Processes younger than this are ignored by the scan; they are usually the
/// current process seen through a racey snapshot.
const MIN_PROCESS_AGE_SECS: u64 = 5;

/// Holds the lock file for the lifetime of the process.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Run the duplicate scan and take the lock, or refuse to start.
    pub fn acquire(path: impl AsRef<Path>, auto_terminate_duplicates: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        scan_for_duplicates(auto_terminate_duplicates)?;
        check_lock_file(&path)?;

        let pid = std::process::id();
        std::fs::write(&path, pid.to_string())
            .with_context(|| format!("failed to write lock file {}", path.display()))?;
        info!(pid, path = %path.display(), "lock file acquired");

        Ok(Self { path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        } else {
            info!(path = %self.path.display(), "lock file removed");
        }
    }
}

/// Look for other live instances of this executable.
fn scan_for_duplicates(auto_terminate: bool) -> Result<()> {
    let Ok(current_exe) = std::env::current_exe() else {
        return Ok(());
    };
    let Some(exe_name) = current_exe.file_name().map(|n| n.to_owned()) else {
        return Ok(());
    };

    let current_pid = Pid::from_u32(std::process::id());
    let system = System::new_all();

    let duplicates: Vec<Pid> = system
        .processes()
        .iter()
        .filter(|(pid, process)| {
            **pid != current_pid
                && process.name() == exe_name.as_os_str()
                && process.run_time() >= MIN_PROCESS_AGE_SECS
        })
        .map(|(pid, _)| *pid)
        .collect();

    if duplicates.is_empty() {
        return Ok(());
    }

    if !auto_terminate {
        bail!(
            "another bot instance is already running (pids {:?}); close it first",
            duplicates
        );
    }

    warn!(pids = ?duplicates, "terminating duplicate bot instances");
    for pid in duplicates {
        if let Some(process) = system.process(pid) {
            if process.kill() {
                info!(pid = pid.as_u32(), "duplicate instance terminated");
            } else {
                warn!(pid = pid.as_u32(), "could not terminate duplicate instance");
            }
        }
    }
    std::thread::sleep(std::time::Duration::from_secs(1));
    Ok(())
}

/// Refuse startup when the lock file points at a live process.
fn check_lock_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let content = std::fs::read_to_string(path).unwrap_or_default();
    match content.trim().parse::<u32>() {
        Ok(old_pid) => {
            let system = System::new_all();
            if system.process(Pid::from_u32(old_pid)).is_some() {
                bail!(
                    "lock file {} exists and pid {} is alive; \
                     close the running instance or delete the file",
                    path.display(),
                    old_pid
                );
            }
            info!(old_pid, "removing stale lock file");
        }
        Err(_) => {
            info!("removing invalid lock file");
        }
    }

    std::fs::remove_file(path)
        .with_context(|| format!("failed to remove stale lock file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_lock_is_replaced() {
        let dir = std::env::temp_dir().join(format!("pulse-lock-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bot.lock");

        // A PID that cannot exist: u32::MAX.
        std::fs::write(&path, u32::MAX.to_string()).unwrap();

        let lock = LockFile::acquire(&path, false).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());

        drop(lock);
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_lock_content_is_replaced() {
        let dir = std::env::temp_dir().join(format!("pulse-lock-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bot.lock");

        std::fs::write(&path, "not-a-pid").unwrap();
        let lock = LockFile::acquire(&path, false).unwrap();
        drop(lock);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
