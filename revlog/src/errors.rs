/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use thiserror::Error;

use nodemap::NodeMapError;
use types::Node;
use types::Revision;
use vfs::VfsError;

pub type Result<T> = std::result::Result<T, RevlogError>;

#[derive(Debug, Error)]
pub enum RevlogError {
    #[error("unknown revision: {0}")]
    UnknownRevision(Revision),
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("ambiguous node prefix: {0}")]
    AmbiguousPrefix(String),
    #[error("node {0} already exists with different parents")]
    DuplicateNode(Node),
    #[error("corrupt revlog: {0}")]
    Corrupt(String),
    #[error("censored revision {0}")]
    Censored(Revision),
    #[error("operation interrupted")]
    Interrupted,
    #[error(transparent)]
    Io(#[from] VfsError),
    #[error("programming error: {0}")]
    Programming(String),
}

impl From<NodeMapError> for RevlogError {
    fn from(err: NodeMapError) -> Self {
        match err {
            NodeMapError::UnknownNode(node) => RevlogError::UnknownNode(node),
            NodeMapError::AmbiguousPrefix(prefix) => RevlogError::AmbiguousPrefix(prefix),
            NodeMapError::Corrupt(detail) => RevlogError::Corrupt(detail),
        }
    }
}

pub(crate) fn corrupt(detail: impl Into<String>) -> RevlogError {
    RevlogError::Corrupt(detail.into())
}

pub(crate) fn programming(detail: impl Into<String>) -> RevlogError {
    RevlogError::Programming(detail.into())
}
