/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use crate::index::REVLOG_V1;

/// How a freshly appended revision picks its delta base.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeltaPolicy {
    /// Always store the full text.
    FullAdd,
    /// Candidates are the parents and the tip; pick the smallest result.
    SameRevs,
    /// Never delta.
    NoDelta,
    /// Consider every ancestor within the span budget.
    Always,
}

/// How [`crate::Revlog::clone_into`] treats the deltas of the source.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeltaReuse {
    /// Reuse every stored delta whose base is valid in the destination.
    Always,
    /// Reuse a stored delta only when its base is a parent or the previous
    /// revision; recompute otherwise.
    SameRevs,
    /// Recompute every delta.
    Never,
    /// Re-add each revision from its full text through the normal append
    /// path.
    FullAdd,
}

#[derive(Clone, Debug)]
pub struct RevlogOptions {
    /// Format version for newly created revlogs.
    pub version: u16,
    pub general_delta: bool,
    /// Start new v1 revlogs in inline layout.
    pub inline: bool,
    pub delta_policy: DeltaPolicy,
    /// Upper bound on the length of any delta chain.
    pub max_chain_len: usize,
    /// A delta is dropped for a full text once it exceeds this multiple of
    /// the compressed full text.
    pub delta_span_ratio: u32,
    /// Inline revlogs split into index + data files past this size.
    pub max_inline_size: u64,
    /// Compression engine name for new payloads.
    pub compression: String,
    /// Maintain the on-disk node map.
    pub persistent_nodemap: bool,
    /// Rewrite the node map in full once dead bytes exceed this percentage
    /// of the persisted base.
    pub nodemap_full_rewrite_pct: u8,
}

impl Default for RevlogOptions {
    fn default() -> Self {
        RevlogOptions {
            version: REVLOG_V1,
            general_delta: true,
            inline: true,
            delta_policy: DeltaPolicy::SameRevs,
            max_chain_len: 1000,
            delta_span_ratio: 4,
            max_inline_size: 131072,
            compression: "zlib".to_string(),
            persistent_nodemap: false,
            nodemap_full_rewrite_pct: 25,
        }
    }
}
