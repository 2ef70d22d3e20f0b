/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Map from 20-byte node ids to revision numbers.
//!
//! The map is a radix trie over the hex nibbles of the node. It answers
//! exact lookups and unique-prefix lookups (for user-facing short ids), and
//! serializes to a sequence of fixed-width blocks whose append-only
//! incremental form matches the write profile of the underlying log: a
//! persisted base can be extended by appending only the blocks that changed
//! plus a replacement root.
//!
//! The trie stores a leaf at the first nibble where a node diverges from
//! every other node, not the whole key, so read operations take a
//! [`RevisionNodeSource`] to fetch the candidate's full node for
//! verification.

use thiserror::Error;

use types::Node;
use types::Revision;

mod tree;

pub use crate::tree::NodeTree;
pub use crate::tree::BLOCK_BYTES;

pub type Result<T> = std::result::Result<T, NodeMapError>;

#[derive(Debug, Error, PartialEq)]
pub enum NodeMapError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("ambiguous node prefix: {0}")]
    AmbiguousPrefix(String),
    #[error("corrupt node map: {0}")]
    Corrupt(String),
}

/// Read access to the revision → node assignment backing a [`NodeTree`].
pub trait RevisionNodeSource {
    /// The node of `rev`, or `None` when `rev` is out of range.
    fn node(&self, rev: Revision) -> Option<Node>;
}

impl RevisionNodeSource for [Node] {
    fn node(&self, rev: Revision) -> Option<Node> {
        if rev < 0 {
            return None;
        }
        self.get(rev as usize).copied()
    }
}

impl RevisionNodeSource for Vec<Node> {
    fn node(&self, rev: Revision) -> Option<Node> {
        self.as_slice().node(rev)
    }
}
