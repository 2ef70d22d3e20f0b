/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The `requires` file: newline-delimited feature tokens a repository
//! relies on. A reader refuses to open a repository carrying tokens it
//! does not recognise; the upgrade engine leans on that to lock out
//! concurrent legacy clients with a marker token during the store swap.

use std::collections::BTreeSet;

use vfs::Vfs;

use crate::errors::blocked;
use crate::errors::Result;
use crate::errors::UpgradeError;

pub const REVLOGV1: &str = "revlogv1";
pub const REVLOGV2: &str = "revlogv2";
pub const GENERALDELTA: &str = "generaldelta";
pub const SPARSEREVLOG: &str = "sparserevlog";
pub const STORE: &str = "store";
pub const FNCACHE: &str = "fncache";
pub const DOTENCODE: &str = "dotencode";
pub const PERSISTENT_NODEMAP: &str = "persistent-nodemap";
pub const COPIES_SDC: &str = "copies-sdc";
pub const SIDE_DATA: &str = "side-data";
pub const SHARE_SAFE: &str = "share-safe";
pub const UPGRADE_IN_PROGRESS: &str = "upgradeinprogress";

pub const KNOWN_REQUIREMENTS: &[&str] = &[
    REVLOGV1,
    REVLOGV2,
    GENERALDELTA,
    SPARSEREVLOG,
    STORE,
    FNCACHE,
    DOTENCODE,
    PERSISTENT_NODEMAP,
    COPIES_SDC,
    SIDE_DATA,
    SHARE_SAFE,
];

/// Requirements the source repository must carry to be upgradable.
const REQUIRED_SOURCE: &[&str] = &[STORE];

/// Requirements that prevent upgrading a source repository.
const BLOCKS_SOURCE: &[&str] = &["shared"];

const SUPPORTED_REMOVALS: &[&str] = &[
    REVLOGV1,
    GENERALDELTA,
    SPARSEREVLOG,
    PERSISTENT_NODEMAP,
    COPIES_SDC,
    SIDE_DATA,
];

const ALLOWED_ADDITIONS: &[&str] = &[
    REVLOGV1,
    REVLOGV2,
    GENERALDELTA,
    SPARSEREVLOG,
    PERSISTENT_NODEMAP,
    COPIES_SDC,
    SIDE_DATA,
    FNCACHE,
    DOTENCODE,
    SHARE_SAFE,
];

/// Read and check the `requires` file. A missing file reads as the empty
/// set (pre-requirements repository).
pub fn load(vfs: &dyn Vfs) -> Result<BTreeSet<String>> {
    let data = match vfs.try_read("requires")? {
        Some(data) => data,
        None => return Ok(BTreeSet::new()),
    };
    let text = String::from_utf8(data)
        .map_err(|_| UpgradeError::Requirement("non-ascii requires file".to_string()))?;
    let mut requirements = BTreeSet::new();
    for line in text.lines() {
        let token = line.trim();
        if token.is_empty() {
            continue;
        }
        if !KNOWN_REQUIREMENTS.contains(&token) {
            return Err(UpgradeError::Requirement(token.to_string()));
        }
        requirements.insert(token.to_string());
    }
    Ok(requirements)
}

/// Write the `requires` file atomically. Unlike [`load`] this accepts any
/// token: the upgrade marker is intentionally unknown to readers.
pub fn write(vfs: &dyn Vfs, requirements: &BTreeSet<String>) -> Result<()> {
    let mut data = String::new();
    for requirement in requirements {
        data.push_str(requirement);
        data.push('\n');
    }
    vfs.write_atomic("requires", data.as_bytes())?;
    Ok(())
}

/// Validate an upgrade from `current` to `target` per the precondition
/// rules: the source must be upgradable at all, and the requirement
/// difference must only touch features this engine knows how to add or
/// remove.
pub fn validate_target(
    current: &BTreeSet<String>,
    target: &BTreeSet<String>,
) -> Result<()> {
    for required in REQUIRED_SOURCE {
        if !current.contains(*required) {
            return Err(blocked(format!("requirement missing: {}", required)));
        }
    }
    for blocking in BLOCKS_SOURCE {
        if current.contains(*blocking) {
            return Err(blocked(format!(
                "unsupported source requirement: {}",
                blocking
            )));
        }
    }
    for token in target {
        if !KNOWN_REQUIREMENTS.contains(&token.as_str()) {
            return Err(blocked(format!(
                "do not support destination requirement: {}",
                token
            )));
        }
    }
    if !target.contains(REVLOGV1) && !target.contains(REVLOGV2) {
        return Err(blocked("destination must carry a revlog format"));
    }
    for removed in current.difference(target) {
        if !SUPPORTED_REMOVALS.contains(&removed.as_str()) {
            return Err(blocked(format!(
                "requirement would be removed: {}",
                removed
            )));
        }
    }
    for added in target.difference(current) {
        if !ALLOWED_ADDITIONS.contains(&added.as_str()) {
            return Err(blocked(format!(
                "do not support adding requirement: {}",
                added
            )));
        }
    }
    Ok(())
}
