/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::DirEntry;
use crate::FileKind;
use crate::Result;
use crate::Vfs;
use crate::VfsError;

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

/// An in-memory [`Vfs`] for tests. Single tree, interior mutability,
/// deterministic `readdir` order. Each instance gets its own id so that
/// [`Vfs::join`] output distinguishes unrelated trees.
pub struct MemVfs {
    id: u64,
    state: Mutex<State>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

impl Default for MemVfs {
    fn default() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State::default()),
        }
    }
}

fn parents(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter(|(_, c)| *c == '/')
        .map(|(i, _)| &path[..i])
}

impl MemVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// All files with their contents, for state comparisons in tests.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().unwrap().files.clone()
    }

    fn err(path: &str, kind: io::ErrorKind) -> VfsError {
        VfsError::io(path, io::Error::from(kind))
    }
}

impl State {
    fn add_parents(&mut self, path: &str) {
        for dir in parents(path) {
            self.dirs.insert(dir.to_string());
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        path.is_empty() || self.dirs.contains(path)
    }
}

impl Vfs for MemVfs {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Self::err(path, io::ErrorKind::NotFound))
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let data = state
            .files
            .get(path)
            .ok_or_else(|| Self::err(path, io::ErrorKind::NotFound))?;
        let start = offset as usize;
        if start + len > data.len() {
            return Err(Self::err(path, io::ErrorKind::UnexpectedEof));
        }
        Ok(data[start..start + len].to_vec())
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.add_parents(path);
        state.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.add_parents(path);
        state
            .files
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| Self::err(path, io::ErrorKind::NotFound))?;
        let end = offset as usize + data.len();
        if end > file.len() {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let data = state
            .files
            .get_mut(path)
            .ok_or_else(|| Self::err(path, io::ErrorKind::NotFound))?;
        data.truncate(len as usize);
        Ok(())
    }

    fn create_exclusive(&self, path: &str, data: &[u8]) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(path) {
            return Ok(false);
        }
        state.add_parents(path);
        state.files.insert(path.to_string(), data.to_vec());
        Ok(true)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(data) = state.files.remove(from) {
            state.add_parents(to);
            state.files.insert(to.to_string(), data);
            return Ok(());
        }
        if !state.is_dir(from) {
            return Err(Self::err(from, io::ErrorKind::NotFound));
        }
        // Directory rename: rewrite every path below `from`.
        let prefix = format!("{}/", from);
        let moved: Vec<(String, Vec<u8>)> = state
            .files
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (format!("{}/{}", to, &k[prefix.len()..]), v.clone()))
            .collect();
        state.files.retain(|k, _| !k.starts_with(&prefix));
        let moved_dirs: Vec<String> = state
            .dirs
            .iter()
            .filter(|d| d.starts_with(&prefix) || *d == from)
            .cloned()
            .collect();
        for dir in &moved_dirs {
            state.dirs.remove(dir);
        }
        state.add_parents(to);
        state.dirs.insert(to.to_string());
        for dir in moved_dirs {
            if dir != from {
                state
                    .dirs
                    .insert(format!("{}/{}", to, &dir[prefix.len()..]));
            }
        }
        for (k, v) in moved {
            for d in parents(&k) {
                state.dirs.insert(d.to_string());
            }
            state.files.insert(k, v);
        }
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::err(path, io::ErrorKind::NotFound))
    }

    fn rmtree(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.is_dir(path) {
            return Err(Self::err(path, io::ErrorKind::NotFound));
        }
        let prefix = format!("{}/", path);
        state.files.retain(|k, _| !k.starts_with(&prefix));
        state.dirs.retain(|d| !d.starts_with(&prefix) && d != path);
        Ok(())
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !path.is_empty() {
            state.add_parents(path);
            state.dirs.insert(path.to_string());
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.files.contains_key(path) || state.is_dir(path)
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(path)
            .map(|d| d.len() as u64)
            .ok_or_else(|| Self::err(path, io::ErrorKind::NotFound))
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let state = self.state.lock().unwrap();
        if !state.is_dir(path) {
            return Err(Self::err(path, io::ErrorKind::NotFound));
        }
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut names: BTreeMap<String, (FileKind, u64)> = BTreeMap::new();
        for (file, data) in state.files.range(prefix.clone()..) {
            if !file.starts_with(&prefix) {
                break;
            }
            let rest = &file[prefix.len()..];
            match rest.find('/') {
                None => {
                    names.insert(rest.to_string(), (FileKind::File, data.len() as u64));
                }
                Some(i) => {
                    names.entry(rest[..i].to_string()).or_insert((FileKind::Dir, 0));
                }
            }
        }
        for dir in state.dirs.range(prefix.clone()..) {
            if !dir.starts_with(&prefix) {
                break;
            }
            let rest = &dir[prefix.len()..];
            if !rest.contains('/') {
                names.entry(rest.to_string()).or_insert((FileKind::Dir, 0));
            }
        }
        Ok(names
            .into_iter()
            .map(|(name, (kind, size))| DirEntry { name, kind, size })
            .collect())
    }

    fn fsync(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn join(&self, path: &str) -> String {
        format!("memory-{}://{}", self.id, path)
    }
}
