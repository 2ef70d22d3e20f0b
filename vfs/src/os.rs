/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::DirEntry;
use crate::FileKind;
use crate::Result;
use crate::Vfs;
use crate::VfsError;

/// A [`Vfs`] rooted at a real directory.
pub struct OsVfs {
    root: PathBuf,
    temp_seq: AtomicU64,
}

impl OsVfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            temp_seq: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn ctx<T>(&self, path: &str, res: io::Result<T>) -> Result<T> {
        res.map_err(|err| VfsError::io(self.join(path), err))
    }

    fn ensure_parent(&self, path: &str) -> Result<()> {
        if let Some(parent) = self.full(path).parent() {
            self.ctx(path, fs::create_dir_all(parent))?;
        }
        Ok(())
    }
}

impl Vfs for OsVfs {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.ctx(path, fs::read(self.full(path)))
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = self.ctx(path, File::open(self.full(path)))?;
        self.ctx(path, file.seek(SeekFrom::Start(offset)))?;
        let mut buf = vec![0u8; len];
        self.ctx(path, file.read_exact(&mut buf))?;
        Ok(buf)
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<()> {
        self.ensure_parent(path)?;
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let temp_name = format!("{}.tmp-{}-{}", path, std::process::id(), seq);
        let temp = self.full(&temp_name);
        let result = (|| {
            let mut file = File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&temp, self.full(path))
        })();
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        self.ctx(path, result)
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        self.ensure_parent(path)?;
        let mut file = self.ctx(
            path,
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(self.full(path)),
        )?;
        self.ctx(path, file.write_all(data))
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.ctx(
            path,
            OpenOptions::new().write(true).open(self.full(path)),
        )?;
        self.ctx(path, file.seek(SeekFrom::Start(offset)))?;
        self.ctx(path, file.write_all(data))
    }

    fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let file = self.ctx(
            path,
            OpenOptions::new().write(true).open(self.full(path)),
        )?;
        self.ctx(path, file.set_len(len))
    }

    fn create_exclusive(&self, path: &str, data: &[u8]) -> Result<bool> {
        self.ensure_parent(path)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.full(path))
        {
            Ok(mut file) => {
                self.ctx(path, file.write_all(data))?;
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(VfsError::io(self.join(path), err)),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.ensure_parent(to)?;
        self.ctx(from, fs::rename(self.full(from), self.full(to)))
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.ctx(path, fs::remove_file(self.full(path)))
    }

    fn rmtree(&self, path: &str) -> Result<()> {
        self.ctx(path, fs::remove_dir_all(self.full(path)))
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        self.ctx(path, fs::create_dir_all(self.full(path)))
    }

    fn exists(&self, path: &str) -> bool {
        self.full(path).exists()
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        Ok(self.ctx(path, fs::metadata(self.full(path)))?.len())
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in self.ctx(path, fs::read_dir(self.full(path)))? {
            let entry = self.ctx(path, entry)?;
            let meta = self.ctx(path, entry.metadata())?;
            let kind = if meta.is_file() {
                FileKind::File
            } else if meta.is_dir() {
                FileKind::Dir
            } else {
                FileKind::Other
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size: if meta.is_file() { meta.len() } else { 0 },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn fsync(&self, path: &str) -> Result<()> {
        let file = self.ctx(path, File::open(self.full(path)))?;
        self.ctx(path, file.sync_all())
    }

    fn join(&self, path: &str) -> String {
        self.full(path).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = OsVfs::new(dir.path());
        vfs.write_atomic("a/b/file", b"content").unwrap();
        assert_eq!(vfs.read("a/b/file").unwrap(), b"content");
        assert_eq!(vfs.read_range("a/b/file", 2, 3).unwrap(), b"nte");
        assert_eq!(vfs.file_size("a/b/file").unwrap(), 7);
    }

    #[test]
    fn test_append_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = OsVfs::new(dir.path());
        vfs.append("log", b"one").unwrap();
        vfs.append("log", b"two").unwrap();
        assert_eq!(vfs.read("log").unwrap(), b"onetwo");
        vfs.truncate("log", 3).unwrap();
        assert_eq!(vfs.read("log").unwrap(), b"one");
    }

    #[test]
    fn test_create_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = OsVfs::new(dir.path());
        assert!(vfs.create_exclusive("lock", b"1").unwrap());
        assert!(!vfs.create_exclusive("lock", b"2").unwrap());
        assert_eq!(vfs.read("lock").unwrap(), b"1");
    }

    #[test]
    fn test_try_read_missing() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = OsVfs::new(dir.path());
        assert!(vfs.try_read("missing").unwrap().is_none());
        assert!(vfs.read("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_rename_dir() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = OsVfs::new(dir.path());
        vfs.write_atomic("store/data/f.i", b"x").unwrap();
        vfs.rename("store", "backup/store").unwrap();
        assert!(!vfs.exists("store"));
        assert_eq!(vfs.read("backup/store/data/f.i").unwrap(), b"x");
    }
}
