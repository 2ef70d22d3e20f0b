/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use thiserror::Error;

use revlog::RevlogError;
use vfs::VfsError;

pub type Result<T> = std::result::Result<T, UpgradeError>;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("cannot upgrade repository: {0}")]
    Blocked(String),
    #[error("could not acquire the {0}")]
    Locked(&'static str),
    #[error("repository requires features unknown to this version: {0}")]
    Requirement(String),
    #[error("operation interrupted")]
    Interrupted,
    #[error(transparent)]
    Revlog(RevlogError),
    #[error(transparent)]
    Io(#[from] VfsError),
}

impl From<RevlogError> for UpgradeError {
    fn from(err: RevlogError) -> Self {
        match err {
            RevlogError::Interrupted => UpgradeError::Interrupted,
            other => UpgradeError::Revlog(other),
        }
    }
}

pub(crate) fn blocked(detail: impl Into<String>) -> UpgradeError {
    UpgradeError::Blocked(detail.into())
}
