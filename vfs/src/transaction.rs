/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Scoped undo for mutating file operations.
//!
//! Writers register every file they are about to grow with [`Transaction::add`]
//! (recording its pre-write length) and take full-content backups with
//! [`Transaction::add_backup`] before destructive rewrites. On abort the
//! transaction restores backups and truncates registered files back, in
//! reverse registration order, so the on-disk state matches the one before
//! the transaction byte for byte. A transaction dropped without an explicit
//! commit rolls back.

use std::collections::HashSet;
use std::sync::Arc;

use crate::Result;
use crate::Vfs;

enum Undo {
    /// Shrink the file back to its pre-transaction length.
    Truncate { path: String, offset: u64 },
    /// The file did not exist before the transaction.
    Unlink { path: String },
    /// Rewrite the file with its pre-mutation content.
    Restore { path: String, data: Vec<u8> },
    /// The backed-up file did not exist at backup time.
    RestoreAbsent { path: String },
}

#[derive(PartialEq, Clone, Copy, Debug)]
enum State {
    Active,
    Committed,
    Aborted,
}

pub struct Transaction {
    vfs: Arc<dyn Vfs>,
    name: String,
    undo: Vec<Undo>,
    registered: HashSet<String>,
    backed_up: HashSet<String>,
    state: State,
}

impl Transaction {
    pub fn new(vfs: Arc<dyn Vfs>, name: impl Into<String>) -> Self {
        Self {
            vfs,
            name: name.into(),
            undo: Vec::new(),
            registered: HashSet::new(),
            backed_up: HashSet::new(),
            state: State::Active,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    pub fn active(&self) -> bool {
        self.state == State::Active
    }

    /// Register `path` before extending it past `offset`. The first
    /// registration wins; later calls for the same file are no-ops.
    pub fn add(&mut self, path: &str, offset: u64) {
        assert!(self.active(), "transaction {} is closed", self.name);
        if !self.registered.insert(path.to_string()) {
            return;
        }
        if self.vfs.exists(path) {
            self.undo.push(Undo::Truncate {
                path: path.to_string(),
                offset,
            });
        } else {
            self.undo.push(Undo::Unlink {
                path: path.to_string(),
            });
        }
    }

    /// Snapshot the current content of `path` so an abort can restore it.
    /// The first backup wins.
    pub fn add_backup(&mut self, path: &str) -> Result<()> {
        assert!(self.active(), "transaction {} is closed", self.name);
        if !self.backed_up.insert(path.to_string()) {
            return Ok(());
        }
        match self.vfs.try_read(path)? {
            Some(data) => self.undo.push(Undo::Restore {
                path: path.to_string(),
                data,
            }),
            None => self.undo.push(Undo::RestoreAbsent {
                path: path.to_string(),
            }),
        }
        Ok(())
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.registered.contains(path)
    }

    pub fn commit(mut self) -> Result<()> {
        assert!(self.active(), "transaction {} is closed", self.name);
        self.state = State::Committed;
        self.undo.clear();
        Ok(())
    }

    pub fn abort(mut self) -> Result<()> {
        assert!(self.active(), "transaction {} is closed", self.name);
        self.rollback()
    }

    fn rollback(&mut self) -> Result<()> {
        self.state = State::Aborted;
        tracing::debug!(name = %self.name, "rolling back transaction");
        // Backups first: a backup captures mid-transaction content, so the
        // truncate/unlink entries below bring it back to the pre-transaction
        // range afterwards.
        for entry in self.undo.iter().rev() {
            match entry {
                Undo::Restore { path, data } => self.vfs.write_atomic(path, data)?,
                Undo::RestoreAbsent { path } => {
                    if self.vfs.exists(path) {
                        self.vfs.unlink(path)?;
                    }
                }
                _ => {}
            }
        }
        for entry in self.undo.iter().rev() {
            match entry {
                Undo::Truncate { path, offset } => {
                    if self.vfs.exists(path) {
                        self.vfs.truncate(path, *offset)?;
                    }
                }
                Undo::Unlink { path } => {
                    if self.vfs.exists(path) {
                        self.vfs.unlink(path)?;
                    }
                }
                _ => {}
            }
        }
        self.undo.clear();
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.active() {
            if let Err(err) = self.rollback() {
                tracing::warn!(
                    name = %self.name,
                    error = %err,
                    "implicit transaction rollback failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::MemVfs;

    use super::*;

    fn vfs() -> Arc<dyn Vfs> {
        Arc::new(MemVfs::new())
    }

    #[test]
    fn test_abort_truncates_appends() {
        let vfs = vfs();
        vfs.append("rl.i", b"before").unwrap();
        let mut tr = Transaction::new(vfs.clone(), "test");
        tr.add("rl.i", 6);
        vfs.append("rl.i", b"-after").unwrap();
        tr.abort().unwrap();
        assert_eq!(vfs.read("rl.i").unwrap(), b"before");
    }

    #[test]
    fn test_abort_unlinks_created_files() {
        let vfs = vfs();
        let mut tr = Transaction::new(vfs.clone(), "test");
        tr.add("rl.d", 0);
        vfs.append("rl.d", b"payload").unwrap();
        tr.abort().unwrap();
        assert!(!vfs.exists("rl.d"));
    }

    #[test]
    fn test_abort_restores_backups() {
        let vfs = vfs();
        vfs.write_atomic("docket", b"old").unwrap();
        let mut tr = Transaction::new(vfs.clone(), "test");
        tr.add_backup("docket").unwrap();
        vfs.write_atomic("docket", b"new").unwrap();
        tr.abort().unwrap();
        assert_eq!(vfs.read("docket").unwrap(), b"old");
    }

    #[test]
    fn test_backup_then_truncate_restores_pre_transaction_state() {
        let vfs = vfs();
        vfs.append("rl.i", b"base").unwrap();
        let mut tr = Transaction::new(vfs.clone(), "test");
        // Grow the file, then back it up and shrink it below its
        // pre-transaction size, as a strip does.
        tr.add("rl.i", 4);
        vfs.append("rl.i", b"-grown").unwrap();
        tr.add_backup("rl.i").unwrap();
        vfs.truncate("rl.i", 2).unwrap();
        tr.abort().unwrap();
        assert_eq!(vfs.read("rl.i").unwrap(), b"base");
    }

    #[test]
    fn test_commit_keeps_changes() {
        let vfs = vfs();
        let mut tr = Transaction::new(vfs.clone(), "test");
        tr.add("rl.i", 0);
        vfs.append("rl.i", b"data").unwrap();
        tr.commit().unwrap();
        assert_eq!(vfs.read("rl.i").unwrap(), b"data");
    }

    #[test]
    fn test_drop_rolls_back() {
        let vfs = vfs();
        {
            let mut tr = Transaction::new(vfs.clone(), "test");
            tr.add("rl.i", 0);
            vfs.append("rl.i", b"data").unwrap();
        }
        assert!(!vfs.exists("rl.i"));
    }
}
