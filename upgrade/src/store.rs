/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The repository handle the upgrade engine operates on: the `requires`
//! file, the store directory, and helpers to enumerate and classify the
//! revlogs inside it.

use std::collections::BTreeSet;
use std::sync::Arc;

use revlog::index::REVLOG_V1;
use revlog::index::REVLOG_V2;
use revlog::Revlog;
use revlog::RevlogOptions;
use vfs::FileKind;
use vfs::SubVfs;
use vfs::Vfs;

use crate::errors::Result;
use crate::requirements;

pub struct Repo {
    vfs: Arc<dyn Vfs>,
    requirements: BTreeSet<String>,
}

impl Repo {
    /// Create a repository at the vfs root: requirements file plus an
    /// empty store.
    pub fn init(vfs: Arc<dyn Vfs>, requirements: BTreeSet<String>) -> Result<Repo> {
        requirements::write(&*vfs, &requirements)?;
        vfs.mkdir_all("store")?;
        Ok(Repo { vfs, requirements })
    }

    /// Open an existing repository, refusing unknown requirement tokens.
    pub fn load(vfs: Arc<dyn Vfs>) -> Result<Repo> {
        let requirements = requirements::load(&*vfs)?;
        Ok(Repo { vfs, requirements })
    }

    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    pub fn requirements(&self) -> &BTreeSet<String> {
        &self.requirements
    }

    /// A vfs rooted at the store directory.
    pub fn store_vfs(&self) -> Arc<dyn Vfs> {
        Arc::new(SubVfs::new(self.vfs.clone(), "store"))
    }

    /// Revlog options implied by the requirement set.
    pub fn revlog_options(&self) -> RevlogOptions {
        let v2 = self.requirements.contains(requirements::REVLOGV2);
        RevlogOptions {
            version: if v2 { REVLOG_V2 } else { REVLOG_V1 },
            general_delta: v2 || self.requirements.contains(requirements::GENERALDELTA),
            persistent_nodemap: self
                .requirements
                .contains(requirements::PERSISTENT_NODEMAP),
            ..RevlogOptions::default()
        }
    }

    /// Open the revlog stored under `radix` (a store-relative path without
    /// the `.i` suffix).
    pub fn open_revlog(&self, radix: &str) -> Result<Revlog> {
        Ok(Revlog::open(self.store_vfs(), radix, self.revlog_options())?)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RevlogKind {
    Changelog,
    Manifest,
    Filelog,
}

/// Classify a store-relative `.i` path. Anything that is neither the
/// changelog, a manifest, nor under `data/` is not a revlog this engine
/// recognises.
pub fn classify_revlog(path: &str) -> Option<RevlogKind> {
    if !path.ends_with(".i") {
        return None;
    }
    if path == "00changelog.i" {
        Some(RevlogKind::Changelog)
    } else if path.ends_with("00manifest.i") {
        Some(RevlogKind::Manifest)
    } else if path.starts_with("data/") {
        Some(RevlogKind::Filelog)
    } else {
        None
    }
}

/// Every file below the store root, with kind and size, in sorted order.
pub fn walk_store(vfs: &dyn Vfs) -> Result<Vec<(String, FileKind, u64)>> {
    let mut out = Vec::new();
    let mut stack = vec![String::new()];
    while let Some(dir) = stack.pop() {
        for entry in vfs.readdir(&dir)? {
            let path = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir, entry.name)
            };
            match entry.kind {
                FileKind::Dir => stack.push(path),
                kind => out.push((path, kind, entry.size)),
            }
        }
    }
    out.sort();
    Ok(out)
}

/// The `fncache` store file: a redundant list of tracked revlog paths,
/// kept for walk performance. Readers recreate missing entries on demand,
/// so the cache only has to be complete enough, never exact.
#[derive(Default)]
pub struct FnCache {
    entries: BTreeSet<String>,
}

impl FnCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<String>) {
        self.entries.insert(path.into());
    }

    pub fn write(&self, store_vfs: &dyn Vfs) -> Result<()> {
        let mut data = String::new();
        for entry in &self.entries {
            data.push_str(entry);
            data.push('\n');
        }
        store_vfs.write_atomic("fncache", data.as_bytes())?;
        Ok(())
    }
}
