//! Per-user cleanup of leftover endpoint state.
//!
//! Endpoints that exit uncleanly leave their SHM object and socket
//! directory behind. This sweep removes everything belonging to the
//! current user, best-effort: unlinking an object that a live process
//! still has mapped only removes the name, the mapping survives.

use std::ffi::CString;
use std::path::Path;

use crate::sock::user_dir;
use crate::SHM_PREFIX;

/// Directory where POSIX SHM objects surface on this platform.
const SHM_DIR: &str = "/dev/shm";

/// Whether `file_name` is one of this user's region objects.
fn shm_object_matches(file_name: &str, username: &str) -> bool {
    file_name.starts_with(&format!("{}_{}-", SHM_PREFIX, username))
}

/// Remove stale control-socket trees and SHM objects for the current
/// user. Best-effort; errors are logged and swallowed.
pub fn cleanup() {
    let username = match nix::unistd::User::from_uid(nix::unistd::Uid::effective()) {
        Ok(Some(user)) => user.name,
        _ => {
            tracing::warn!("cleanup skipped: could not resolve login name");
            return;
        }
    };

    // Socket tree: files first, then the directories.
    let dir = user_dir(&username);
    if dir.exists() {
        tracing::debug!(dir = %dir.display(), "removing socket tree");
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "socket tree removal failed");
        }
    }

    // SHM namespace sweep.
    let entries = match std::fs::read_dir(Path::new(SHM_DIR)) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "could not scan shm namespace");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !shm_object_matches(name, &username) {
            continue;
        }
        tracing::debug!(name, "unlinking stale shm object");
        if let Ok(cname) = CString::new(format!("/{}", name)) {
            let _ = nix::sys::mman::shm_unlink(cname.as_c_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_name_matching() {
        assert!(shm_object_matches("smipc_alice-1234-0", "alice"));
        assert!(!shm_object_matches("smipc_alice2-1234-0", "alice"));
        assert!(!shm_object_matches("smipc_bob-1234-0", "alice"));
        assert!(!shm_object_matches("other_alice-1234-0", "alice"));
    }
}
