use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pkiup_core::UpgradeError;
use tracing::{debug, warn};

use crate::UpgradeLayout;

const ACQUIRE_ATTEMPTS: usize = 3;

/// A lock file without a readable owner pid is only reclaimed once it has
/// not been touched for this long.
pub(crate) const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(30);

static LOCK_TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Advisory per-instance lock held while an upgrade is running.
///
/// The lock file holds the owner pid on its first line and a token unique to
/// this acquisition on the second. It is published with a hard link, so other
/// processes never observe it without its content, and it is only removed on
/// drop while it still carries this guard's token.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    instance_id: String,
    content: String,
}

impl InstanceLock {
    pub fn acquire(layout: &UpgradeLayout, instance_id: &str) -> Result<Self, UpgradeError> {
        let path = layout.lock_path(instance_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| UpgradeError::state_io(parent, err))?;
        }

        let content = format!("{}\n{}\n", std::process::id(), unique_suffix());
        for _ in 0..ACQUIRE_ATTEMPTS {
            match publish_lock(&path, &content) {
                Ok(()) => {
                    debug!(instance = instance_id, "acquired upgrade lock");
                    return Ok(Self {
                        path,
                        instance_id: instance_id.to_string(),
                        content,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(UpgradeError::state_io(&path, err)),
            }

            let observed = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(UpgradeError::state_io(&path, err)),
            };
            match lock_owner(&observed) {
                Some(pid) if process_is_alive(pid) => {
                    return Err(UpgradeError::Locked {
                        instance_id: instance_id.to_string(),
                        pid,
                    });
                }
                Some(_) => {}
                None if !untouched_for(&path, UNREADABLE_LOCK_GRACE)? => {
                    return Err(UpgradeError::Locked {
                        instance_id: instance_id.to_string(),
                        pid: 0,
                    });
                }
                None => {}
            }

            warn!(
                instance = instance_id,
                pid = ?lock_owner(&observed),
                "reclaiming stale upgrade lock"
            );
            reclaim_stale(&path, &observed, instance_id)?;
        }

        let pid = read_lock_owner(&path)?.unwrap_or_default();
        Err(UpgradeError::Locked {
            instance_id: instance_id.to_string(),
            pid,
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw == self.content => {
                if let Err(err) = fs::remove_file(&self.path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        warn!(
                            instance = %self.instance_id,
                            error = %err,
                            "failed to release upgrade lock"
                        );
                    }
                }
            }
            Ok(_) => warn!(
                instance = %self.instance_id,
                "upgrade lock was replaced by another owner, leaving it in place"
            ),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                instance = %self.instance_id,
                error = %err,
                "failed to read upgrade lock on release"
            ),
        }
    }
}

/// Writes `content` to a private staging file and links it into place.
fn publish_lock(path: &Path, content: &str) -> io::Result<()> {
    let staging = sibling_path(path, "new");
    let result = (|| {
        let mut file = fs::File::create(&staging)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::hard_link(&staging, path)
    })();
    let _ = fs::remove_file(&staging);
    result
}

/// Moves a stale lock aside. If the file changed after it was judged stale
/// it belongs to a new owner and is linked back.
fn reclaim_stale(path: &Path, observed: &str, instance_id: &str) -> Result<(), UpgradeError> {
    let tombstone = sibling_path(path, "stale");
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(UpgradeError::state_io(path, err)),
    }

    let moved = fs::read_to_string(&tombstone).map_err(|err| UpgradeError::state_io(&tombstone, err))?;
    if moved != observed {
        let restored = fs::hard_link(&tombstone, path);
        let _ = fs::remove_file(&tombstone);
        match restored {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(UpgradeError::state_io(path, err)),
        }
        return Err(UpgradeError::Locked {
            instance_id: instance_id.to_string(),
            pid: lock_owner(&moved).unwrap_or_default(),
        });
    }

    fs::remove_file(&tombstone).map_err(|err| UpgradeError::state_io(&tombstone, err))
}

fn sibling_path(path: &Path, kind: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|value| value.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{kind}-{}", unique_suffix()));
    path.with_file_name(name)
}

fn unique_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!(
        "{}-{}-{}",
        std::process::id(),
        nanos,
        LOCK_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// A missing file counts as untouched; a modification time in the future
/// does not.
fn untouched_for(path: &Path, grace: Duration) -> Result<bool, UpgradeError> {
    let modified = match fs::metadata(path).and_then(|metadata| metadata.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(UpgradeError::state_io(path, err)),
    };
    Ok(modified.elapsed().is_ok_and(|age| age >= grace))
}

fn lock_owner(content: &str) -> Option<u32> {
    content.lines().next()?.trim().parse::<u32>().ok()
}

/// Pid recorded in an existing lock file; `None` for a missing file or
/// unreadable content.
pub(crate) fn read_lock_owner(path: &Path) -> Result<Option<u32>, UpgradeError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(lock_owner(&raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(UpgradeError::state_io(path, err)),
    }
}

pub(crate) fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(target_os = "linux")]
    {
        Path::new("/proc").join(pid.to_string()).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(true)
    }

    #[cfg(not(unix))]
    {
        true
    }
}
