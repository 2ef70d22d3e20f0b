/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The low-level upgrade work: stream every revlog into a staging store,
//! copy the remaining store files, then swap the store directories.
//!
//! The source repository stays unmodified for as long as possible: any
//! failure before the swap discards the staging directory and leaves the
//! source bit-identical. The swap itself is two directory renames; a crash
//! between them leaves a complete backup sibling for manual recovery.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::RngCore;

use revlog::flags::REVIDX_SIDEDATA;
use revlog::DeltaReuse;
use revlog::Revlog;
use revlog::SidedataAction;
use types::Revision;
use vfs::FileKind;
use vfs::SubVfs;
use vfs::Transaction;
use vfs::Vfs;

use crate::errors::Result;
use crate::errors::UpgradeError;
use crate::lock;
use crate::requirements;
use crate::store::classify_revlog;
use crate::store::walk_store;
use crate::store::FnCache;
use crate::store::Repo;
use crate::store::RevlogKind;

/// Re-encoding actions, mapped onto the delta-reuse mode of the clone.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Optimization {
    ReDeltaAll,
    ReDeltaParent,
    ReDeltaMultibase,
    ReDeltaFulladd,
}

/// Which revlogs to re-encode; the rest are copied byte-for-byte.
#[derive(Clone, Copy, Debug)]
pub struct RevlogFilter {
    pub changelog: bool,
    pub manifest: bool,
    pub filelogs: bool,
}

impl Default for RevlogFilter {
    fn default() -> Self {
        RevlogFilter {
            changelog: true,
            manifest: true,
            filelogs: true,
        }
    }
}

impl RevlogFilter {
    fn selects(&self, kind: RevlogKind) -> bool {
        match kind {
            RevlogKind::Changelog => self.changelog,
            RevlogKind::Manifest => self.manifest,
            RevlogKind::Filelog => self.filelogs,
        }
    }
}

pub struct UpgradeOptions {
    pub target_requirements: BTreeSet<String>,
    pub optimizations: BTreeSet<Optimization>,
    pub revlogs: RevlogFilter,
    /// Keep the backup sibling after a successful upgrade.
    pub backup: bool,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        UpgradeOptions {
            target_requirements: BTreeSet::new(),
            optimizations: BTreeSet::new(),
            revlogs: RevlogFilter::default(),
            backup: true,
            cancel: None,
        }
    }
}

/// Before/after statistics of a finished upgrade.
#[derive(Debug, Default)]
pub struct UpgradeReport {
    pub revisions: usize,
    pub changelog_revisions: usize,
    pub manifest_revisions: usize,
    pub filelog_revisions: usize,
    pub filelog_count: usize,
    pub src_store_size: u64,
    pub dst_store_size: u64,
    pub backup_path: Option<String>,
}

fn temp_suffix() -> String {
    let mut raw = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

fn check_cancel(cancel: &Option<Arc<AtomicBool>>) -> Result<()> {
    if let Some(flag) = cancel {
        if flag.load(Ordering::Relaxed) {
            return Err(UpgradeError::Interrupted);
        }
    }
    Ok(())
}

/// Whether a non-revlog store file is carried over to the new store.
fn should_copy_store_file(path: &str, kind: FileKind) -> bool {
    if kind != FileKind::File {
        return false;
    }
    // Revlog files were either cloned or copied explicitly.
    for suffix in [".i", ".d", ".n", ".nd", ".idx", ".dat"] {
        if path.ends_with(suffix) {
            return false;
        }
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.starts_with("undo") {
        return false;
    }
    name != "lock" && name != "fncache"
}

fn delta_reuse_for(optimizations: &BTreeSet<Optimization>) -> DeltaReuse {
    if optimizations.contains(&Optimization::ReDeltaAll) {
        DeltaReuse::Never
    } else if optimizations.contains(&Optimization::ReDeltaParent)
        || optimizations.contains(&Optimization::ReDeltaMultibase)
    {
        DeltaReuse::SameRevs
    } else if optimizations.contains(&Optimization::ReDeltaFulladd) {
        DeltaReuse::FullAdd
    } else {
        DeltaReuse::Always
    }
}

type SidedataCompanion = Box<dyn FnMut(&Revlog, Revision) -> revlog::Result<SidedataAction>>;

/// When the upgrade drops a sidedata-carrying requirement, strip the blobs
/// while cloning.
fn sidedata_companion(
    current: &BTreeSet<String>,
    target: &BTreeSet<String>,
) -> Option<SidedataCompanion> {
    let dropping = |req: &str| current.contains(req) && !target.contains(req);
    if dropping(requirements::SIDE_DATA) || dropping(requirements::COPIES_SDC) {
        Some(Box::new(|rl, rev| {
            if rl.flags(rev)? & REVIDX_SIDEDATA != 0 {
                Ok(SidedataAction::Drop)
            } else {
                Ok(SidedataAction::Keep)
            }
        }))
    } else {
        None
    }
}

/// Upgrade `repo` to `opts.target_requirements` in place.
///
/// The caller's repository handle is stale afterwards and must be
/// reloaded.
pub fn upgrade_repo(repo: &Repo, opts: &UpgradeOptions) -> Result<UpgradeReport> {
    requirements::validate_target(repo.requirements(), &opts.target_requirements)?;

    let _wlock = lock::try_lock(repo.vfs(), "wlock", "wlock")?;
    let _lock = lock::try_lock(repo.vfs(), "store/lock", "lock")?;
    tracing::info!("repository locked and read-only");

    let suffix = temp_suffix();
    let tmp_root = format!("upgrade.{}", suffix);
    tracing::info!(
        path = %repo.vfs().join(&tmp_root),
        "creating temporary repository to stage migrated data"
    );
    let dst_vfs: Arc<dyn Vfs> = Arc::new(SubVfs::new(repo.vfs().clone(), tmp_root.clone()));
    let dst_repo = Repo::init(dst_vfs, opts.target_requirements.clone())?;

    let mut report = match migrate(repo, &dst_repo, opts) {
        Ok(report) => report,
        Err(err) => {
            tracing::info!(path = %tmp_root, "removing temporary repository");
            let _ = repo.vfs().rmtree(&tmp_root);
            return Err(err);
        }
    };
    tracing::info!("data fully migrated to temporary repository");

    // Lock out concurrent clients while the store is inconsistent: an
    // unknown requirement makes every reader refuse to open the repo.
    let mut marked = repo.requirements().clone();
    marked.insert(requirements::UPGRADE_IN_PROGRESS.to_string());
    let backup_root = format!("upgradebackup.{}", suffix);
    repo.vfs().mkdir_all(&backup_root)?;
    repo.vfs()
        .copy("requires", &format!("{}/requires", backup_root))?;
    tracing::info!(
        "marking source repository as being upgraded; clients will be unable to read from repository"
    );
    requirements::write(&**repo.vfs(), &marked)?;

    tracing::info!("starting in-place swap of repository data");
    tracing::info!(path = %repo.vfs().join(&backup_root), "replaced files will be backed up");
    tracing::info!("replacing store...");
    repo.vfs()
        .rename("store", &format!("{}/store", backup_root))?;
    repo.vfs().rename(&format!("{}/store", tmp_root), "store")?;
    tracing::info!("store replacement complete");

    tracing::info!("finalizing requirements file and making repository readable again");
    requirements::write(&**repo.vfs(), &opts.target_requirements)?;

    let _ = repo.vfs().rmtree(&tmp_root);
    // The swapped-out store still contains our lock file; nothing
    // references that location anymore.
    let old_lock = format!("{}/store/lock", backup_root);
    if repo.vfs().exists(&old_lock) {
        let _ = repo.vfs().unlink(&old_lock);
    }
    if opts.backup {
        report.backup_path = Some(backup_root);
    } else {
        tracing::info!(path = %backup_root, "removing old repository content");
        let _ = repo.vfs().rmtree(&backup_root);
    }
    Ok(report)
}

fn migrate(repo: &Repo, dst_repo: &Repo, opts: &UpgradeOptions) -> Result<UpgradeReport> {
    let src_store = repo.store_vfs();
    let dst_store = dst_repo.store_vfs();
    let files = walk_store(&*src_store)?;
    let delta_reuse = delta_reuse_for(&opts.optimizations);
    let force_both = opts.optimizations.contains(&Optimization::ReDeltaMultibase);
    let mut companion = sidedata_companion(repo.requirements(), &opts.target_requirements);

    let mut tr = Transaction::new(dst_store.clone(), "upgrade");
    let mut fncache = FnCache::new();
    let mut report = UpgradeReport::default();
    let mut tracked_size: u64 = 0;

    for (path, kind, _size) in &files {
        if *kind != FileKind::File {
            continue;
        }
        let revlog_kind = match classify_revlog(path) {
            Some(kind) => kind,
            None => continue,
        };
        check_cancel(&opts.cancel)?;

        let radix = &path[..path.len() - 2];
        let src_rl = Revlog::open(src_store.clone(), radix, repo.revlog_options())?;
        let info = src_rl.storage_info(false, true, true, true)?;
        let revisions = info.revisions_count.unwrap_or(0);
        report.revisions += revisions;
        report.src_store_size += info.stored_size.unwrap_or(0);
        tracked_size += info.tracked_size.unwrap_or(0);
        match revlog_kind {
            RevlogKind::Changelog => report.changelog_revisions += revisions,
            RevlogKind::Manifest => report.manifest_revisions += revisions,
            RevlogKind::Filelog => {
                report.filelog_revisions += revisions;
                report.filelog_count += 1;
            }
        }

        if opts.revlogs.selects(revlog_kind) {
            tracing::debug!(path = %path, revisions, "cloning revisions");
            let mut dst_rl = Revlog::open(dst_store.clone(), radix, dst_repo.revlog_options())?;
            let companion_ref: Option<
                &mut dyn FnMut(&Revlog, Revision) -> revlog::Result<SidedataAction>,
            > = match companion.as_mut() {
                Some(c) => Some(c.as_mut()),
                None => None,
            };
            src_rl.clone_into(
                &mut tr,
                &mut dst_rl,
                delta_reuse,
                force_both,
                companion_ref,
                opts.cancel.as_deref(),
                None,
            )?;
            dst_rl.finalize(&mut tr)?;
            let dst_info = dst_rl.storage_info(false, false, false, true)?;
            report.dst_store_size += dst_info.stored_size.unwrap_or(0);
        } else {
            tracing::debug!(path = %path, revisions, "blindly copying revlog");
            for file in src_rl.files() {
                let data = src_store.read(&file)?;
                report.dst_store_size += data.len() as u64;
                dst_store.write_atomic(&file, &data)?;
            }
        }

        if revlog_kind == RevlogKind::Filelog {
            fncache.add(path.clone());
            let data_file = format!("{}.d", radix);
            if src_store.exists(&data_file) {
                fncache.add(data_file);
            }
        }
    }

    tracing::info!(
        total = report.revisions,
        filelogs = report.filelog_revisions,
        manifests = report.manifest_revisions,
        changelog = report.changelog_revisions,
        "migrating revisions"
    );
    tracing::info!(
        store_bytes = report.src_store_size,
        tracked_bytes = tracked_size,
        "migrating store data"
    );

    // Carry over the store files that are not revlogs; caches and
    // transaction leftovers are skipped, sorted order keeps this
    // deterministic.
    for (path, kind, _size) in &files {
        if !should_copy_store_file(path, *kind) {
            continue;
        }
        check_cancel(&opts.cancel)?;
        tracing::debug!(path = %path, "copying store file");
        let data = src_store.read(path)?;
        dst_store.write_atomic(path, &data)?;
    }

    if opts
        .target_requirements
        .contains(requirements::FNCACHE)
    {
        fncache.write(&*dst_store)?;
    }
    tr.commit().map_err(UpgradeError::Io)?;

    tracing::info!(
        revisions = report.revisions,
        src_bytes = report.src_store_size,
        dst_bytes = report.dst_store_size,
        "finished migrating revisions"
    );
    Ok(report)
}
