/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Advisory repository locks.
//!
//! `wlock` guards the working copy, `lock` (in the store) guards every
//! revlog mutation; they are always taken in that order. A lock is a file
//! created exclusively; holders in the same process may re-acquire it,
//! separate processes are refused. The guard releases on drop, on every
//! exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use vfs::Vfs;

use crate::errors::Result;
use crate::errors::UpgradeError;

static HELD: Lazy<Mutex<HashMap<String, usize>>> = Lazy::new(Default::default);

pub struct LockGuard {
    vfs: Arc<dyn Vfs>,
    path: String,
    key: String,
}

/// Acquire the lock file at `path`, failing with `Locked` when another
/// process holds it. `which` names the lock in errors ("wlock", "lock").
pub fn try_lock(vfs: &Arc<dyn Vfs>, path: &str, which: &'static str) -> Result<LockGuard> {
    let key = vfs.join(path);
    let mut held = HELD.lock().unwrap();
    if let Some(count) = held.get_mut(&key) {
        *count += 1;
        return Ok(LockGuard {
            vfs: vfs.clone(),
            path: path.to_string(),
            key,
        });
    }
    let content = format!("{}", std::process::id());
    if vfs.create_exclusive(path, content.as_bytes())? {
        held.insert(key.clone(), 1);
        Ok(LockGuard {
            vfs: vfs.clone(),
            path: path.to_string(),
            key,
        })
    } else {
        Err(UpgradeError::Locked(which))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = HELD.lock().unwrap();
        match held.get_mut(&self.key) {
            Some(count) if *count > 1 => {
                *count -= 1;
            }
            _ => {
                held.remove(&self.key);
                // The file may already be gone (the store was swapped away).
                let _ = self.vfs.unlink(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use vfs::MemVfs;

    use super::*;

    fn vfs() -> Arc<dyn Vfs> {
        Arc::new(MemVfs::new())
    }

    #[test]
    fn test_lock_creates_and_removes_file() {
        let vfs = vfs();
        {
            let _guard = try_lock(&vfs, "store/lock", "lock").unwrap();
            assert!(vfs.exists("store/lock"));
        }
        assert!(!vfs.exists("store/lock"));
    }

    #[test]
    fn test_reentrant_within_process() {
        let vfs = vfs();
        let _outer = try_lock(&vfs, "wlock", "wlock").unwrap();
        {
            let _inner = try_lock(&vfs, "wlock", "wlock").unwrap();
        }
        // Still held by the outer guard.
        assert!(vfs.exists("wlock"));
    }

    #[test]
    fn test_foreign_lock_refused() {
        let vfs = vfs();
        // Simulate another process: the file exists but no in-process
        // holder is registered.
        vfs.write_atomic("store/lock", b"12345").unwrap();
        assert!(matches!(
            try_lock(&vfs, "store/lock", "lock"),
            Err(UpgradeError::Locked("lock"))
        ));
    }
}
