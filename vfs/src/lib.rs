/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Filesystem capability used by the storage crates.
//!
//! Every file operation goes through the [`Vfs`] trait so the storage code
//! can run against a real directory ([`OsVfs`]) or an in-memory tree
//! ([`MemVfs`]) in tests. Paths are `/`-separated and relative to the vfs
//! root; parent directories are created on demand by the write operations.

use std::io;

use thiserror::Error;

mod mem;
mod os;
mod transaction;

pub use crate::mem::MemVfs;
pub use crate::os::OsVfs;
pub use crate::transaction::Transaction;

pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl VfsError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        VfsError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::io(path, io::Error::from(io::ErrorKind::NotFound))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            VfsError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileKind {
    File,
    Dir,
    Other,
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    /// Name relative to the directory that was listed.
    pub name: String,
    pub kind: FileKind,
    /// Size in bytes; zero for directories.
    pub size: u64,
}

pub trait Vfs {
    /// Read a whole file.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Read `len` bytes starting at `offset`. A short read is an error.
    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Replace the file content atomically (temp file + rename).
    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Append to the file, creating it (and parent directories) on demand.
    fn append(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Overwrite `data.len()` bytes at `offset` in an existing file.
    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Shrink the file to `len` bytes.
    fn truncate(&self, path: &str, len: u64) -> Result<()>;

    /// Create the file with `data` if it does not exist. Returns `false`
    /// without touching anything when it does.
    fn create_exclusive(&self, path: &str, data: &[u8]) -> Result<bool>;

    /// Rename a file or directory. The rename is atomic.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn unlink(&self, path: &str) -> Result<()>;

    /// Remove a directory and everything below it.
    fn rmtree(&self, path: &str) -> Result<()>;

    fn mkdir_all(&self, path: &str) -> Result<()>;

    fn exists(&self, path: &str) -> bool;

    fn file_size(&self, path: &str) -> Result<u64>;

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>>;

    fn fsync(&self, path: &str) -> Result<()>;

    /// The full (display) path for `path`.
    fn join(&self, path: &str) -> String;

    /// Read a whole file, mapping "not found" to `None`.
    fn try_read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.read(path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Copy a regular file within this vfs.
    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let data = self.read(from)?;
        self.write_atomic(to, &data)
    }
}

/// A view of another vfs under a path prefix. Used to address a staging
/// directory as if it were a repository root.
pub struct SubVfs<V> {
    inner: V,
    prefix: String,
}

impl<V: Vfs> SubVfs<V> {
    pub fn new(inner: V, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        assert!(!prefix.is_empty(), "SubVfs prefix must be non-empty");
        Self { inner, prefix }
    }

    fn full(&self, path: &str) -> String {
        if path.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }
}

impl<V: Vfs> Vfs for SubVfs<V> {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read(&self.full(path))
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.inner.read_range(&self.full(path), offset, len)
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<()> {
        self.inner.write_atomic(&self.full(path), data)
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        self.inner.append(&self.full(path), data)
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_at(&self.full(path), offset, data)
    }

    fn truncate(&self, path: &str, len: u64) -> Result<()> {
        self.inner.truncate(&self.full(path), len)
    }

    fn create_exclusive(&self, path: &str, data: &[u8]) -> Result<bool> {
        self.inner.create_exclusive(&self.full(path), data)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(&self.full(from), &self.full(to))
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.inner.unlink(&self.full(path))
    }

    fn rmtree(&self, path: &str) -> Result<()> {
        self.inner.rmtree(&self.full(path))
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        self.inner.mkdir_all(&self.full(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(&self.full(path))
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        self.inner.file_size(&self.full(path))
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.inner.readdir(&self.full(path))
    }

    fn fsync(&self, path: &str) -> Result<()> {
        self.inner.fsync(&self.full(path))
    }

    fn join(&self, path: &str) -> String {
        self.inner.join(&self.full(path))
    }
}

impl<V: Vfs + ?Sized> Vfs for std::sync::Arc<V> {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path)
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        (**self).read_range(path, offset, len)
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<()> {
        (**self).write_atomic(path, data)
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        (**self).append(path, data)
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(path, offset, data)
    }

    fn truncate(&self, path: &str, len: u64) -> Result<()> {
        (**self).truncate(path, len)
    }

    fn create_exclusive(&self, path: &str, data: &[u8]) -> Result<bool> {
        (**self).create_exclusive(path, data)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to)
    }

    fn unlink(&self, path: &str) -> Result<()> {
        (**self).unlink(path)
    }

    fn rmtree(&self, path: &str) -> Result<()> {
        (**self).rmtree(path)
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        (**self).mkdir_all(path)
    }

    fn exists(&self, path: &str) -> bool {
        (**self).exists(path)
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        (**self).file_size(path)
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        (**self).readdir(path)
    }

    fn fsync(&self, path: &str) -> Result<()> {
        (**self).fsync(path)
    }

    fn join(&self, path: &str) -> String {
        (**self).join(path)
    }
}
