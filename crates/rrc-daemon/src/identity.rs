//! Identity file preparation: ensure the parent directory exists before a
//! transport loads or creates the keypair there, then harden the resulting
//! file to owner-only permissions.
//!
//! Grounded on `original_source/rrc_web/utils.py`'s `load_or_create_identity`
//! (expand path, `mkdir(parents=True)`, chmod 0600 after load-or-create,
//! warn rather than fail if the chmod itself fails).

use std::path::Path;

/// Create `path`'s parent directory if it does not already exist.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Restrict `path` to owner read/write. Best-effort: a failure here is
/// logged, not propagated, since it never prevents the daemon from using the
/// identity it just loaded or created.
#[cfg(unix)]
pub fn harden_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(metadata) => {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            if let Err(err) = std::fs::set_permissions(path, perms) {
                tracing::warn!(error = %err, path = %path.display(), "failed to harden identity file permissions");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "failed to stat identity file for permission hardening");
        }
    }
}

#[cfg(not(unix))]
pub fn harden_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn scratch_path() -> std::path::PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir()
            .join(format!("rrc-daemon-identity-test-{}-{n}", std::process::id()))
            .join("identity")
    }

    #[test]
    fn ensure_parent_dir_creates_missing_directories() {
        let path = scratch_path();
        ensure_parent_dir(&path).expect("create parent dir");
        assert!(path.parent().unwrap().is_dir());
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[cfg(unix)]
    #[test]
    fn harden_permissions_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let path = scratch_path();
        ensure_parent_dir(&path).expect("create parent dir");
        std::fs::write(&path, b"fake keypair").expect("write fixture");

        harden_permissions(&path);

        let mode = std::fs::metadata(&path).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
