//! Removal of region files leaked by crashed runs.

use std::path::Path;

use crate::SHMEM_FILE_PREFIX;

/// The pid encoded in a region file name, if the name matches our format
/// (`<prefix>-<pid>-<nonce>`).
fn file_pid(name: &str) -> Option<libc::pid_t> {
    let rest = name.strip_prefix(SHMEM_FILE_PREFIX)?.strip_prefix('-')?;
    let (pid, _nonce) = rest.split_once('-')?;
    pid.parse().ok()
}

fn pid_is_alive(pid: libc::pid_t) -> bool {
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM means the process exists but isn't ours
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Unlink region files in `dir` whose creating process no longer exists.
/// Returns the number of files removed. Run once at engine startup, before
/// any regions are created.
pub fn remove_stale_files(dir: &Path) -> std::io::Result<usize> {
    let mut num_removed = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(pid) = file_pid(name) else {
            continue;
        };
        if pid == std::process::id() as libc::pid_t || pid_is_alive(pid) {
            continue;
        }

        log::debug!("Removing stale shmem file {:?}", entry.path());
        match std::fs::remove_file(entry.path()) {
            Ok(()) => num_removed += 1,
            // lost a race with another engine's cleanup pass
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(e),
        }
    }

    Ok(num_removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_pid() {
        assert_eq!(file_pid("umbra-shmem-123-0"), Some(123));
        assert_eq!(file_pid("umbra-shmem-123-45"), Some(123));
        assert_eq!(file_pid("some-other-file"), None);
        assert_eq!(file_pid("umbra-shmem-"), None);
    }

    #[test]
    fn test_remove_stale_files() {
        let dir = std::env::temp_dir().join(format!("umbra-cleanup-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        // pid 1 is always alive; pid near pid_max is almost certainly not
        let stale = dir.join(format!("{}-{}-0", SHMEM_FILE_PREFIX, 0x3ffffff));
        let live = dir.join(format!("{}-1-0", SHMEM_FILE_PREFIX));
        let ours = dir.join(format!("{}-{}-0", SHMEM_FILE_PREFIX, std::process::id()));
        let unrelated = dir.join("unrelated");
        for f in [&stale, &live, &ours, &unrelated] {
            std::fs::write(f, b"x").unwrap();
        }

        let num_removed = remove_stale_files(&dir).unwrap();
        assert_eq!(num_removed, 1);
        assert!(!stale.exists());
        assert!(live.exists());
        assert!(ours.exists());
        assert!(unrelated.exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
