/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The revlog: an append-only log of revisions stored as delta chains.
//!
//! A revlog is addressed by its radix (`00changelog`, `data/foo.txt`, ...).
//! For v1 the index lives in `<radix>.i`, either inline (payloads
//! interleaved with the entries) or split with payloads in `<radix>.d`.
//! For v2 `<radix>.i` holds a docket pointing at uuid-suffixed index and
//! data files, and revisions may carry an out-of-band sidedata blob.
//!
//! All mutation happens inside a [`Transaction`]; [`Revlog::finalize`] runs
//! the durability sequence (data fsync, index fsync, docket promotion)
//! before the transaction commits. After an abort the in-memory handle is
//! stale and must be reopened.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nodemap::NodeTree;
use types::hash;
use types::Node;
use types::Revision;
use types::NULL_REVISION;

use vfs::Transaction;
use vfs::Vfs;

use crate::compress::engine_by_header;
use crate::compress::engine_by_name;
use crate::compress::pack_chunk;
use crate::compress::unpack_chunk;
use crate::compress::CompressionEngine;
use crate::config::DeltaPolicy;
use crate::config::DeltaReuse;
use crate::config::RevlogOptions;
use crate::delta;
use crate::docket::Docket;
use crate::errors::corrupt;
use crate::errors::programming;
use crate::errors::Result;
use crate::errors::RevlogError;
use crate::flags::FlagProcessor;
use crate::flags::FlagRegistry;
use crate::flags::REVIDX_KNOWN_FLAGS;
use crate::flags::REVIDX_SIDEDATA;
use crate::index;
use crate::index::pack_header;
use crate::index::parse_header;
use crate::index::CompressionMode;
use crate::index::Index;
use crate::index::IndexEntry;
use crate::index::IndexFeatures;
use crate::index::CHANGELOG_V2;
use crate::index::INDEX_ENTRY_SIZE_V1;
use crate::index::INDEX_ENTRY_SIZE_V2;
use crate::index::REVLOG_V1;
use crate::index::REVLOG_V2;
use crate::nodemap_docket::NodemapDocket;

/// What a sidedata companion decided for one revision during a clone.
pub enum SidedataAction {
    Keep,
    Drop,
    Replace(Vec<u8>),
}

/// Aggregate storage details, as requested via [`Revlog::storage_info`].
#[derive(Debug, Default)]
pub struct StorageInfo {
    pub exclusive_files: Vec<String>,
    pub revisions_count: Option<usize>,
    pub tracked_size: Option<u64>,
    pub stored_size: Option<u64>,
}

pub struct Revlog {
    vfs: Arc<dyn Vfs>,
    radix: String,
    opts: RevlogOptions,
    version: u16,
    features: IndexFeatures,
    index: Index,
    docket: Option<Docket>,
    /// Physical start offsets of the interleaved entries (inline only).
    inline_offsets: Vec<u64>,
    /// Logical length of the data stream.
    data_end: u64,
    /// Length of the index portion on disk; for inline revlogs the whole
    /// file.
    index_end: u64,
    flag_registry: FlagRegistry,
    nodemap_docket: Option<NodemapDocket>,
    journal_registered: bool,
}

impl Revlog {
    /// Open (or lazily create) the revlog stored under `radix`.
    pub fn open(vfs: Arc<dyn Vfs>, radix: &str, opts: RevlogOptions) -> Result<Revlog> {
        let entry_file = format!("{}.i", radix);
        let data = vfs.try_read(&entry_file)?.unwrap_or_default();
        if data.is_empty() {
            return Self::new_empty(vfs, radix, opts);
        }
        let (features, version) = parse_header(&data)?;
        match version {
            REVLOG_V1 => Self::open_v1(vfs, radix, opts, features, data),
            REVLOG_V2 | CHANGELOG_V2 => Self::open_v2(vfs, radix, opts, version, data),
            other => Err(corrupt(format!("unknown revlog version: {}", other))),
        }
    }

    fn new_empty(vfs: Arc<dyn Vfs>, radix: &str, opts: RevlogOptions) -> Result<Revlog> {
        let version = opts.version;
        let (features, docket) = match version {
            REVLOG_V1 => {
                let mut features = IndexFeatures::empty();
                if opts.inline {
                    features |= IndexFeatures::INLINE;
                }
                if opts.general_delta {
                    features |= IndexFeatures::GENERAL_DELTA;
                }
                (features, None)
            }
            REVLOG_V2 | CHANGELOG_V2 => {
                let features = IndexFeatures::GENERAL_DELTA;
                let word = u32::from_be_bytes(pack_header(features, version));
                let engine = engine_by_name(&opts.compression)?;
                (
                    features,
                    Some(Docket::new(radix, word, engine.header_byte())),
                )
            }
            other => return Err(programming(format!("unknown revlog version: {}", other))),
        };
        Ok(Revlog {
            vfs,
            radix: radix.to_string(),
            opts,
            version,
            features,
            index: Index::new(version),
            docket,
            inline_offsets: Vec::new(),
            data_end: 0,
            index_end: 0,
            flag_registry: FlagRegistry::standard(),
            nodemap_docket: None,
            journal_registered: false,
        })
    }

    fn open_v1(
        vfs: Arc<dyn Vfs>,
        radix: &str,
        opts: RevlogOptions,
        features: IndexFeatures,
        data: Vec<u8>,
    ) -> Result<Revlog> {
        let mut entries = Vec::new();
        let mut inline_offsets = Vec::new();
        if features.contains(IndexFeatures::INLINE) {
            inline_offsets = index::scan_inline(&data, REVLOG_V1)?;
            for (rev, off) in inline_offsets.iter().enumerate() {
                let off = *off as usize;
                entries.push(index::decode_v1(
                    rev as Revision,
                    &data[off..off + INDEX_ENTRY_SIZE_V1],
                )?);
            }
        } else {
            if data.len() % INDEX_ENTRY_SIZE_V1 != 0 {
                return Err(corrupt("index size is not a multiple of the entry size"));
            }
            for (rev, chunk) in data.chunks_exact(INDEX_ENTRY_SIZE_V1).enumerate() {
                entries.push(index::decode_v1(rev as Revision, chunk)?);
            }
        }
        let data_end = entries
            .last()
            .map(|e| e.offset + e.comp_len as u64)
            .unwrap_or(0);
        let index_end = data.len() as u64;
        let (index, nodemap_docket) =
            Self::build_index(&vfs, radix, &opts, REVLOG_V1, entries)?;
        Ok(Revlog {
            vfs,
            radix: radix.to_string(),
            opts,
            version: REVLOG_V1,
            features,
            index,
            docket: None,
            inline_offsets,
            data_end,
            index_end,
            flag_registry: FlagRegistry::standard(),
            nodemap_docket,
            journal_registered: false,
        })
    }

    fn open_v2(
        vfs: Arc<dyn Vfs>,
        radix: &str,
        opts: RevlogOptions,
        version: u16,
        data: Vec<u8>,
    ) -> Result<Revlog> {
        let docket = Docket::parse(radix, &data, false)?;
        let index_end = docket.index_end();
        if index_end % INDEX_ENTRY_SIZE_V2 as u64 != 0 {
            return Err(corrupt("index size is not a multiple of the entry size"));
        }
        let mut entries = Vec::new();
        if index_end > 0 {
            let idx_path = docket
                .existing_index_filepath()
                .ok_or_else(|| corrupt("docket names no index file"))?;
            // Only the official range is visible; a pending tail past it
            // belongs to an open transaction.
            let bytes = vfs.read_range(&idx_path, 0, index_end as usize)?;
            for (rev, chunk) in bytes.chunks_exact(INDEX_ENTRY_SIZE_V2).enumerate() {
                entries.push(index::decode_v2(rev as Revision, chunk)?);
            }
        }
        let data_end = docket.data_end();
        let (index, nodemap_docket) = Self::build_index(&vfs, radix, &opts, version, entries)?;
        Ok(Revlog {
            vfs,
            radix: radix.to_string(),
            opts,
            version,
            features: IndexFeatures::GENERAL_DELTA,
            index,
            docket: Some(docket),
            inline_offsets: Vec::new(),
            data_end,
            index_end,
            flag_registry: FlagRegistry::standard(),
            nodemap_docket,
            journal_registered: false,
        })
    }

    /// Build the in-memory index, seeding the node map from its persisted
    /// form when present and still valid.
    fn build_index(
        vfs: &Arc<dyn Vfs>,
        radix: &str,
        opts: &RevlogOptions,
        version: u16,
        entries: Vec<IndexEntry>,
    ) -> Result<(Index, Option<NodemapDocket>)> {
        if opts.persistent_nodemap {
            if let Some((tree, docket)) = Self::load_node_tree(vfs, radix, &entries)? {
                let tip = docket.tip_rev;
                let index = Index::from_entries_with_tree(version, entries, Some((tree, tip)))?;
                return Ok((index, Some(docket)));
            }
        }
        Ok((Index::from_entries(version, entries)?, None))
    }

    fn load_node_tree(
        vfs: &Arc<dyn Vfs>,
        radix: &str,
        entries: &[IndexEntry],
    ) -> Result<Option<(NodeTree, NodemapDocket)>> {
        let docket_bytes = match vfs.try_read(&NodemapDocket::docket_path(radix))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let docket = match NodemapDocket::parse(&docket_bytes) {
            Ok(Some(docket)) => docket,
            // A cache: unreadable means rebuild, not failure.
            Ok(None) | Err(_) => return Ok(None),
        };
        let tip = docket.tip_rev as usize;
        if tip >= entries.len() || entries[tip].node != docket.tip_node {
            tracing::debug!(radix, "stale persistent nodemap; rebuilding");
            return Ok(None);
        }
        let data_path = NodemapDocket::data_path(radix, &docket.uid);
        let data = match vfs.try_read(&data_path)? {
            Some(data) if data.len() as u64 >= docket.data_length => data,
            _ => return Ok(None),
        };
        match NodeTree::load_bytes(&data[..docket.data_length as usize]) {
            Ok(tree) => Ok(Some((tree, docket))),
            Err(err) => {
                tracing::debug!(radix, error = %err, "unreadable persistent nodemap");
                Ok(None)
            }
        }
    }

    pub fn radix(&self) -> &str {
        &self.radix
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn is_inline(&self) -> bool {
        self.features.contains(IndexFeatures::INLINE)
    }

    pub fn is_general_delta(&self) -> bool {
        self.features.contains(IndexFeatures::GENERAL_DELTA)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn tip(&self) -> Revision {
        self.index.len() as Revision - 1
    }

    pub fn parents(&self, rev: Revision) -> Result<(Revision, Revision)> {
        let entry = self.index.get(rev)?;
        Ok((entry.p1, entry.p2))
    }

    pub fn parent_nodes(&self, rev: Revision) -> Result<(Node, Node)> {
        let (p1, p2) = self.parents(rev)?;
        Ok((self.index.node(p1)?, self.index.node(p2)?))
    }

    pub fn node(&self, rev: Revision) -> Result<Node> {
        self.index.node(rev)
    }

    pub fn rev(&self, node: Node) -> Result<Revision> {
        self.index.rev(node)
    }

    pub fn get_rev(&self, node: Node) -> Result<Option<Revision>> {
        self.index.get_rev(node)
    }

    pub fn has_node(&self, node: Node) -> Result<bool> {
        self.index.has_node(node)
    }

    /// Resolve a short hex prefix to a revision.
    pub fn prefix_lookup(&self, prefix: &str) -> Result<Option<Revision>> {
        self.index.prefix_lookup(prefix)
    }

    pub fn flags(&self, rev: Revision) -> Result<u16> {
        Ok(self.index.get(rev)?.flags)
    }

    pub fn link_rev(&self, rev: Revision) -> Result<Revision> {
        Ok(self.index.get(rev)?.link_rev)
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn set_flag_processor(
        &mut self,
        flag: u16,
        processor: Arc<dyn FlagProcessor>,
    ) -> Result<()> {
        self.flag_registry.register(flag, processor)
    }

    pub fn iter(&self) -> RevlogRevs<'_> {
        RevlogRevs {
            revlog: self,
            rev: 0,
        }
    }

    fn index_file(&self) -> Result<String> {
        match &self.docket {
            None => Ok(format!("{}.i", self.radix)),
            Some(docket) => docket
                .existing_index_filepath()
                .ok_or_else(|| programming("revlog has no index file yet")),
        }
    }

    fn data_file(&self) -> Result<String> {
        match &self.docket {
            None => Ok(format!("{}.d", self.radix)),
            Some(docket) => docket
                .existing_data_filepath()
                .ok_or_else(|| programming("revlog has no data file yet")),
        }
    }

    fn index_file_for_write(&mut self) -> String {
        match &mut self.docket {
            None => format!("{}.i", self.radix),
            Some(docket) => docket.index_filepath(),
        }
    }

    fn data_file_for_write(&mut self) -> String {
        match &mut self.docket {
            None => format!("{}.d", self.radix),
            Some(docket) => docket.data_filepath(),
        }
    }

    /// Existing on-disk files belonging exclusively to this revlog.
    pub fn files(&self) -> Vec<String> {
        let mut files = vec![format!("{}.i", self.radix)];
        if let Some(docket) = &self.docket {
            files.extend(docket.existing_index_filepath());
            files.extend(docket.existing_data_filepath());
        } else {
            files.push(format!("{}.d", self.radix));
        }
        files.push(NodemapDocket::docket_path(&self.radix));
        if let Some(nm) = &self.nodemap_docket {
            files.push(NodemapDocket::data_path(&self.radix, &nm.uid));
        }
        files.retain(|f| self.vfs.exists(f));
        files
    }

    fn default_engine(&self) -> Result<&'static dyn CompressionEngine> {
        engine_by_name(&self.opts.compression)
    }

    fn map_read_err(err: RevlogError) -> RevlogError {
        // A payload extending past the end of its file is structural
        // damage, not an environment failure.
        match err {
            RevlogError::Io(io_err) => {
                let eof = matches!(
                    &io_err,
                    vfs::VfsError::Io { source, .. }
                        if source.kind() == std::io::ErrorKind::UnexpectedEof
                );
                if eof {
                    corrupt(format!("unexpected end of data: {}", io_err))
                } else {
                    RevlogError::Io(io_err)
                }
            }
            other => other,
        }
    }

    /// The stored (compressed) payload of a revision.
    fn raw_chunk(&self, rev: Revision) -> Result<Vec<u8>> {
        let entry = self.index.get(rev)?;
        let comp_len = entry.comp_len as usize;
        if comp_len == 0 {
            return Ok(Vec::new());
        }
        let bytes = if self.is_inline() {
            let off = self.inline_offsets[rev as usize] + INDEX_ENTRY_SIZE_V1 as u64;
            self.vfs.read_range(&self.index_file()?, off, comp_len)
        } else {
            self.vfs
                .read_range(&self.data_file()?, entry.offset, comp_len)
        };
        bytes.map_err(|err| Self::map_read_err(RevlogError::Io(err)))
    }

    /// The decompressed payload (a full text or a delta against the base).
    fn payload(&self, rev: Revision) -> Result<Vec<u8>> {
        let entry = self.index.get(rev)?;
        let raw = self.raw_chunk(rev)?;
        if self.version == REVLOG_V1 {
            return unpack_chunk(&raw);
        }
        match entry.data_comp {
            CompressionMode::Plain => Ok(raw),
            CompressionMode::Inline => unpack_chunk(&raw),
            CompressionMode::Default => {
                let docket = self
                    .docket
                    .as_ref()
                    .ok_or_else(|| programming("v2 revlog without a docket"))?;
                let header = docket.default_compression_header();
                let engine = engine_by_header(header).ok_or_else(|| {
                    corrupt(format!("unknown default compression header {:#x}", header))
                })?;
                engine.decompress(&raw)
            }
        }
    }

    /// The delta chain of `rev`, full-text anchor first.
    pub fn delta_chain(&self, rev: Revision) -> Result<Vec<Revision>> {
        let mut chain = Vec::new();
        let mut cur = rev;
        loop {
            chain.push(cur);
            let entry = self.index.get(cur)?;
            if entry.base_rev == cur {
                break;
            }
            // Bases point backwards (validated on open), so this walk
            // terminates.
            cur = entry.base_rev;
        }
        chain.reverse();
        Ok(chain)
    }

    /// The stored rawtext of a revision: the full chain rebuilt, without
    /// flag processing or hash verification.
    pub fn raw_data(&self, rev: Revision) -> Result<Vec<u8>> {
        if rev == NULL_REVISION {
            return Ok(Vec::new());
        }
        let entry = self.index.get(rev)?;
        let chain = self.delta_chain(rev)?;
        let mut text = self.payload(chain[0])?;
        for &mid in &chain[1..] {
            let hunks = delta::parse(&self.payload(mid)?)?;
            text = delta::apply(&text, &hunks)?;
        }
        if entry.uncomp_len >= 0 && entry.uncomp_len as usize != text.len() {
            return Err(corrupt(format!(
                "revision {} has length {} instead of {}",
                rev,
                text.len(),
                entry.uncomp_len
            )));
        }
        Ok(text)
    }

    /// The content of a revision: the rebuilt text after read-side flag
    /// processing, verified against the stored node.
    pub fn revision(&self, rev: Revision) -> Result<Vec<u8>> {
        if rev == NULL_REVISION {
            return Ok(Vec::new());
        }
        let rawtext = self.raw_data(rev)?;
        let flags = self.flags(rev)?;
        let (text, validate) = self.flag_registry.process_read(rev, rawtext, flags)?;
        if validate {
            self.check_hash(rev, &text)?;
        }
        Ok(text)
    }

    fn check_hash(&self, rev: Revision, text: &[u8]) -> Result<()> {
        let entry = self.index.get(rev)?;
        let (p1, p2) = self.parent_nodes(rev)?;
        if hash::node_id(text, p1, p2) != entry.node {
            return Err(corrupt(format!("integrity check failed on revision {}", rev)));
        }
        Ok(())
    }

    /// The sidedata blob of a v2 revision, if any.
    pub fn sidedata(&self, rev: Revision) -> Result<Option<Vec<u8>>> {
        if self.version == REVLOG_V1 {
            return Ok(None);
        }
        let entry = self.index.get(rev)?;
        if entry.sidedata_len <= 0 {
            return Ok(None);
        }
        let raw = self
            .vfs
            .read_range(
                &self.data_file()?,
                entry.sidedata_offset,
                entry.sidedata_len as usize,
            )
            .map_err(|err| Self::map_read_err(RevlogError::Io(err)))?;
        match entry.sidedata_comp {
            CompressionMode::Plain => Ok(Some(raw)),
            CompressionMode::Inline => Ok(Some(unpack_chunk(&raw)?)),
            CompressionMode::Default => {
                let engine = self.default_engine()?;
                Ok(Some(engine.decompress(&raw)?))
            }
        }
    }

    /// Append a new revision for `text`. Returns the existing revision when
    /// the same content with the same parents is already present.
    pub fn add_revision(
        &mut self,
        tr: &mut Transaction,
        text: &[u8],
        link_rev: Revision,
        p1: Node,
        p2: Node,
        flags: u16,
        sidedata: Option<&[u8]>,
    ) -> Result<Revision> {
        if flags & !REVIDX_KNOWN_FLAGS != 0 {
            return Err(programming(format!(
                "unknown revision flags {:#06x}",
                flags & !REVIDX_KNOWN_FLAGS
            )));
        }
        let candidate = self.len() as Revision;
        let transform = FlagRegistry::transforming_flags(flags);
        let (rawtext, rawtext_hash) =
            self.flag_registry
                .process_write(candidate, text.to_vec(), transform)?;
        let node = if rawtext_hash {
            hash::node_id(&rawtext, p1, p2)
        } else {
            hash::node_id(text, p1, p2)
        };
        let p1r = self.rev_of(p1)?;
        let p2r = self.rev_of(p2)?;
        self.add_raw_revision(tr, rawtext, node, p1r, p2r, link_rev, flags, sidedata, None)
    }

    fn rev_of(&self, node: Node) -> Result<Revision> {
        if node.is_null() {
            return Ok(NULL_REVISION);
        }
        self.index.rev(node)
    }

    /// Append a revision whose rawtext and node are already known, reusing
    /// a stored delta when the caller supplies one. This is the clone path;
    /// the node is trusted.
    #[allow(clippy::too_many_arguments)]
    pub fn add_raw_revision(
        &mut self,
        tr: &mut Transaction,
        rawtext: Vec<u8>,
        node: Node,
        p1: Revision,
        p2: Revision,
        link_rev: Revision,
        flags: u16,
        sidedata: Option<&[u8]>,
        cached_delta: Option<(Revision, Vec<u8>)>,
    ) -> Result<Revision> {
        if let Some(existing) = self.index.get_rev(node)? {
            let entry = self.index.get(existing)?;
            if (entry.p1, entry.p2) == (p1, p2) {
                // Duplicate of an existing revision: no-op success.
                return Ok(existing);
            }
            return Err(RevlogError::DuplicateNode(node));
        }
        if sidedata.is_some() && self.version == REVLOG_V1 {
            return Err(programming("sidedata requires a v2 revlog"));
        }
        let rev = self.len() as Revision;
        for parent in [p1, p2] {
            if parent < NULL_REVISION || parent >= rev {
                return Err(programming(format!(
                    "invalid parent revision {} for new revision {}",
                    parent, rev
                )));
            }
        }
        if p1 == NULL_REVISION && p2 != NULL_REVISION {
            return Err(programming("second parent without a first"));
        }

        self.register_journal(tr)?;
        let (base_rev, chunk) = self.select_delta(rev, &rawtext, p1, p2, cached_delta)?;

        let offset = self.data_end;
        let sidedata_offset = offset + chunk.len() as u64;
        let sidedata_len = sidedata.map_or(0, |s| s.len() as i32);
        let entry = IndexEntry {
            offset,
            flags,
            comp_len: chunk.len() as i32,
            uncomp_len: rawtext.len() as i32,
            base_rev,
            link_rev,
            p1,
            p2,
            node,
            sidedata_offset: if sidedata_len > 0 { sidedata_offset } else { 0 },
            sidedata_len,
            data_comp: CompressionMode::Inline,
            sidedata_comp: CompressionMode::Plain,
        };
        self.write_revision(rev, &entry, &chunk, sidedata.unwrap_or(&[]))?;
        self.index.append(entry)?;
        self.maybe_split_inline(tr)?;
        Ok(rev)
    }

    /// Record pre-transaction file lengths so an abort can roll back. Must
    /// run before the first mutation of each transaction.
    fn register_journal(&mut self, tr: &mut Transaction) -> Result<()> {
        if self.journal_registered {
            return Ok(());
        }
        match self.version {
            REVLOG_V1 => {
                tr.add(&self.index_file_for_write(), self.index_end);
                if !self.is_inline() {
                    tr.add(&self.data_file_for_write(), self.data_end);
                }
            }
            _ => {
                let idx = self.index_file_for_write();
                let dat = self.data_file_for_write();
                tr.add(&idx, self.index_end);
                tr.add(&dat, self.data_end);
                // A crashed transaction may have left an orphan tail past
                // the official ends; reclaim it before appending so file
                // offsets line up with the index again.
                self.reclaim_orphan_tail(&idx, self.index_end)?;
                self.reclaim_orphan_tail(&dat, self.data_end)?;
            }
        }
        self.journal_registered = true;
        Ok(())
    }

    fn reclaim_orphan_tail(&self, path: &str, end: u64) -> Result<()> {
        if self.vfs.exists(path) && self.vfs.file_size(path)? > end {
            tracing::debug!(path, end, "truncating orphan revlog tail");
            self.vfs.truncate(path, end)?;
        }
        Ok(())
    }

    fn write_revision(
        &mut self,
        rev: Revision,
        entry: &IndexEntry,
        chunk: &[u8],
        sidedata: &[u8],
    ) -> Result<()> {
        match self.version {
            REVLOG_V1 => {
                let entry_bytes = self.v1_entry_bytes(rev, entry)?;
                if self.is_inline() {
                    let ifile = self.index_file_for_write();
                    let mut buf = entry_bytes;
                    buf.extend_from_slice(chunk);
                    self.inline_offsets.push(self.index_end);
                    self.vfs.append(&ifile, &buf)?;
                    self.index_end += buf.len() as u64;
                } else {
                    // Data lands before the index entry that references it.
                    let dfile = self.data_file_for_write();
                    let ifile = self.index_file_for_write();
                    self.vfs.append(&dfile, chunk)?;
                    self.vfs.append(&ifile, &entry_bytes)?;
                    self.index_end += entry_bytes.len() as u64;
                }
                self.data_end += chunk.len() as u64;
            }
            _ => {
                let dfile = self.data_file_for_write();
                let ifile = self.index_file_for_write();
                self.vfs.append(&dfile, chunk)?;
                if !sidedata.is_empty() {
                    self.vfs.append(&dfile, sidedata)?;
                }
                self.vfs
                    .append(&ifile, &index::encode_v2(entry))?;
                self.index_end += INDEX_ENTRY_SIZE_V2 as u64;
                self.data_end += chunk.len() as u64 + sidedata.len() as u64;
                let docket = self
                    .docket
                    .as_mut()
                    .ok_or_else(|| programming("v2 revlog without a docket"))?;
                docket.set_index_end(self.index_end);
                docket.set_data_end(self.data_end);
            }
        }
        Ok(())
    }

    /// The on-disk bytes of a v1 entry; entry 0 carries the version header
    /// in its leading bytes.
    fn v1_entry_bytes(&self, rev: Revision, entry: &IndexEntry) -> Result<Vec<u8>> {
        let mut bytes = index::encode_v1(entry)?.to_vec();
        if rev == 0 {
            bytes[..4].copy_from_slice(&pack_header(self.features, self.version));
        }
        Ok(bytes)
    }

    fn chain_len(&self, rev: Revision) -> Result<usize> {
        Ok(self.delta_chain(rev)?.len())
    }

    /// Pick the delta base for a new revision and produce its stored chunk.
    fn select_delta(
        &self,
        rev: Revision,
        rawtext: &[u8],
        p1: Revision,
        p2: Revision,
        cached_delta: Option<(Revision, Vec<u8>)>,
    ) -> Result<(Revision, Vec<u8>)> {
        let engine = self.default_engine()?;

        if let Some((base, delta_bytes)) = cached_delta {
            if base >= 0
                && base < rev
                && self.chain_len(base)? < self.opts.max_chain_len
                && (self.is_general_delta() || base == rev - 1)
            {
                let chunk = pack_chunk(engine, &delta_bytes)?;
                return Ok((base, chunk));
            }
        }

        let full = pack_chunk(engine, rawtext)?;
        let candidates = self.delta_candidates(rev, p1, p2, rawtext.len());
        let mut best: Option<(Revision, Vec<u8>)> = None;
        for candidate in candidates {
            if candidate < 0 || candidate >= rev {
                continue;
            }
            if self.chain_len(candidate)? >= self.opts.max_chain_len {
                continue;
            }
            let base_text = self.raw_data(candidate)?;
            let hunks = delta::diff(&base_text, rawtext);
            let chunk = pack_chunk(engine, &delta::encode(&hunks))?;
            if best.as_ref().map_or(true, |(_, b)| chunk.len() < b.len()) {
                best = Some((candidate, chunk));
            }
        }
        match best {
            Some((base, chunk))
                if chunk.len() as u64
                    <= full.len() as u64 * self.opts.delta_span_ratio as u64 =>
            {
                Ok((base, chunk))
            }
            _ => Ok((rev, full)),
        }
    }

    fn delta_candidates(
        &self,
        rev: Revision,
        p1: Revision,
        p2: Revision,
        text_len: usize,
    ) -> Vec<Revision> {
        let mut candidates = Vec::new();
        match self.opts.delta_policy {
            DeltaPolicy::FullAdd | DeltaPolicy::NoDelta => {}
            DeltaPolicy::SameRevs => {
                if self.is_general_delta() {
                    candidates.extend([p1, p2, rev - 1]);
                } else {
                    candidates.push(rev - 1);
                }
            }
            DeltaPolicy::Always => {
                if self.is_general_delta() {
                    candidates.extend([p1, p2]);
                    let budget = text_len as u64 * self.opts.delta_span_ratio as u64;
                    let mut prev = rev - 1;
                    while prev >= 0 {
                        let span = match self.index.get(prev) {
                            Ok(entry) => self.data_end - entry.offset,
                            Err(_) => break,
                        };
                        if span > budget {
                            break;
                        }
                        candidates.push(prev);
                        prev -= 1;
                    }
                } else {
                    candidates.push(rev - 1);
                }
            }
        }
        candidates.retain(|r| *r >= 0);
        candidates.sort_unstable();
        candidates.dedup();
        candidates
    }

    /// Rewrite the sidedata of a revision created by the running
    /// transaction.
    pub fn replace_sidedata_info(
        &mut self,
        tr: &mut Transaction,
        rev: Revision,
        sidedata: &[u8],
    ) -> Result<()> {
        if self.version == REVLOG_V1 {
            return Err(programming("sidedata requires a v2 revlog"));
        }
        self.register_journal(tr)?;
        let dfile = self.data_file_for_write();
        let ifile = self.index_file_for_write();
        let offset = self.data_end;
        self.vfs.append(&dfile, sidedata)?;
        self.data_end += sidedata.len() as u64;
        let flags = self.index.get(rev)?.flags | REVIDX_SIDEDATA;
        self.index
            .replace_sidedata_info(rev, offset, sidedata.len() as i32, flags)?;
        let entry = self.index.get(rev)?;
        self.vfs.write_at(
            &ifile,
            rev as u64 * INDEX_ENTRY_SIZE_V2 as u64,
            &index::encode_v2(&entry),
        )?;
        let docket = self
            .docket
            .as_mut()
            .ok_or_else(|| programming("v2 revlog without a docket"))?;
        docket.set_data_end(self.data_end);
        Ok(())
    }

    /// Convert an inline revlog to split storage once it outgrows the
    /// inline budget.
    fn maybe_split_inline(&mut self, tr: &mut Transaction) -> Result<()> {
        if !self.is_inline() || self.index_end <= self.opts.max_inline_size {
            return Ok(());
        }
        tracing::debug!(radix = %self.radix, size = self.index_end, "splitting inline revlog");
        let ifile = self.index_file_for_write();
        let dfile = self.data_file_for_write();
        tr.add_backup(&ifile)?;
        tr.add(&dfile, 0);

        let mut data_buf = Vec::new();
        let mut index_buf = Vec::new();
        self.features.remove(IndexFeatures::INLINE);
        for rev in 0..self.len() as Revision {
            let entry = self.index.get(rev)?;
            let chunk = self.vfs.read_range(
                &ifile,
                self.inline_offsets[rev as usize] + INDEX_ENTRY_SIZE_V1 as u64,
                entry.comp_len as usize,
            )?;
            data_buf.extend_from_slice(&chunk);
            index_buf.extend_from_slice(&self.v1_entry_bytes(rev, &entry)?);
        }
        self.vfs.write_atomic(&dfile, &data_buf)?;
        self.vfs.write_atomic(&ifile, &index_buf)?;
        self.inline_offsets.clear();
        self.index_end = index_buf.len() as u64;
        Ok(())
    }

    /// Truncate the revlog to the state just before `rev`.
    pub fn strip(&mut self, tr: &mut Transaction, rev: Revision) -> Result<()> {
        let rev = rev.max(0);
        if rev as usize >= self.len() {
            return Ok(());
        }
        self.register_journal(tr)?;
        let boundary = self.index.get(rev)?;
        let ifile = self.index_file()?;
        tr.add_backup(&ifile)?;
        let dfile = if self.is_inline() {
            None
        } else {
            let dfile = self.data_file()?;
            if self.vfs.exists(&dfile) {
                tr.add_backup(&dfile)?;
                Some(dfile)
            } else {
                None
            }
        };

        let new_index_end = if self.is_inline() {
            self.inline_offsets[rev as usize]
        } else if self.version == REVLOG_V1 {
            rev as u64 * INDEX_ENTRY_SIZE_V1 as u64
        } else {
            rev as u64 * INDEX_ENTRY_SIZE_V2 as u64
        };
        let new_data_end = boundary.offset;

        self.vfs.truncate(&ifile, new_index_end)?;
        if let Some(dfile) = &dfile {
            self.vfs.truncate(dfile, new_data_end)?;
        }
        if let Some(docket) = &mut self.docket {
            tr.add_backup(docket.path())?;
            docket.set_index_end(new_index_end);
            docket.set_data_end(new_data_end);
            docket.write(&self.vfs, tr, false, true)?;
        }

        self.index.truncate(rev)?;
        self.inline_offsets.truncate(rev as usize);
        self.index_end = new_index_end;
        self.data_end = new_data_end;
        tracing::debug!(radix = %self.radix, rev, "stripped revlog");
        Ok(())
    }

    /// Run the durable-commit sequence: flush the persistent node map,
    /// fsync data then index, and promote the v2 docket. Callers run this
    /// before committing the transaction.
    pub fn finalize(&mut self, tr: &mut Transaction) -> Result<()> {
        if self.opts.persistent_nodemap {
            self.flush_nodemap(tr)?;
        }
        if !self.is_inline() {
            if let Ok(dfile) = self.data_file() {
                if self.vfs.exists(&dfile) {
                    self.vfs.fsync(&dfile)?;
                }
            }
        }
        if let Ok(ifile) = self.index_file() {
            if self.vfs.exists(&ifile) {
                self.vfs.fsync(&ifile)?;
            }
        }
        if let Some(docket) = &mut self.docket {
            if docket.is_dirty() && docket.existing_index_filepath().is_some() {
                let path = docket.path().to_string();
                docket.write(&self.vfs, tr, false, false)?;
                self.vfs.fsync(&path)?;
            }
        }
        self.index.mark_persisted();
        self.journal_registered = false;
        Ok(())
    }

    /// Make in-transaction appends visible to pending-aware readers without
    /// promoting them (v2 only).
    pub fn write_pending(&mut self, tr: &mut Transaction) -> Result<bool> {
        match &mut self.docket {
            Some(docket) if docket.existing_index_filepath().is_some() => {
                docket.write(&self.vfs, tr, true, false)
            }
            _ => Ok(false),
        }
    }

    fn flush_nodemap(&mut self, tr: &mut Transaction) -> Result<()> {
        if self.index.is_empty() {
            return Ok(());
        }
        let tip = self.tip();
        let tip_node = self.index.node(tip)?;
        let docket_path = NodemapDocket::docket_path(&self.radix);
        let tree = self.index.node_tree_mut();
        if !tree.is_dirty() && self.nodemap_docket.is_some() {
            return Ok(());
        }
        let full = tree.full_write_required()
            || self.nodemap_docket.is_none()
            || (tree.on_disk_bytes() > 0
                && tree.masked_bytes() * 100
                    > tree.on_disk_bytes() * self.opts.nodemap_full_rewrite_pct as usize);
        tr.add_backup(&docket_path)?;
        if full {
            let bytes = tree.full_bytes();
            tree.mark_persisted_full();
            let docket = NodemapDocket::new(tip, tip_node, bytes.len() as u64, 0);
            let data_path = NodemapDocket::data_path(&self.radix, &docket.uid);
            tr.add(&data_path, 0);
            self.vfs.write_atomic(&data_path, &bytes)?;
            self.vfs.write_atomic(&docket_path, &docket.serialize())?;
            if let Some(old) = self.nodemap_docket.replace(docket) {
                let old_path = NodemapDocket::data_path(&self.radix, &old.uid);
                if self.vfs.exists(&old_path) {
                    // Best effort: a leftover data file is unreferenced
                    // weight, not corruption.
                    let _ = self.vfs.unlink(&old_path);
                }
            }
        } else {
            let tail = match tree.incremental_bytes() {
                Some(tail) => tail,
                None => return Err(programming("incremental nodemap write without a base")),
            };
            let masked = tree.masked_bytes() as u64;
            let mut docket = self
                .nodemap_docket
                .clone()
                .ok_or_else(|| programming("incremental nodemap write without a docket"))?;
            let data_path = NodemapDocket::data_path(&self.radix, &docket.uid);
            tr.add(&data_path, docket.data_length);
            self.vfs.append(&data_path, &tail)?;
            docket.data_length += tail.len() as u64;
            docket.data_unused = masked;
            docket.tip_rev = tip;
            docket.tip_node = tip_node;
            self.vfs.write_atomic(&docket_path, &docket.serialize())?;
            self.nodemap_docket = Some(docket);
        }
        Ok(())
    }

    /// The delta stored for `rev`, if it is not a full text.
    fn stored_delta(&self, rev: Revision) -> Result<Option<(Revision, Vec<u8>)>> {
        let entry = self.index.get(rev)?;
        if entry.base_rev == rev {
            return Ok(None);
        }
        Ok(Some((entry.base_rev, self.payload(rev)?)))
    }

    /// Copy every revision into `dest`, honoring the delta-reuse mode.
    ///
    /// `cancel` is polled between revisions; `on_revision` observes
    /// progress. With `force_delta_both_parents`, merge revisions always
    /// get their delta recomputed against both parents instead of reusing
    /// the stored one.
    #[allow(clippy::too_many_arguments)]
    pub fn clone_into(
        &self,
        tr: &mut Transaction,
        dest: &mut Revlog,
        delta_reuse: DeltaReuse,
        force_delta_both_parents: bool,
        mut sidedata_companion: Option<&mut dyn FnMut(&Revlog, Revision) -> Result<SidedataAction>>,
        cancel: Option<&AtomicBool>,
        mut on_revision: Option<&mut dyn FnMut(Revision, Node)>,
    ) -> Result<()> {
        for rev in 0..self.len() as Revision {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(RevlogError::Interrupted);
                }
            }
            let entry = self.index.get(rev)?;
            let mut flags = entry.flags;
            let mut sidedata = self.sidedata(rev)?;
            if let Some(companion) = sidedata_companion.as_mut() {
                match companion(self, rev)? {
                    SidedataAction::Keep => {}
                    SidedataAction::Drop => {
                        sidedata = None;
                        flags &= !REVIDX_SIDEDATA;
                    }
                    SidedataAction::Replace(new) => {
                        sidedata = Some(new);
                        flags |= REVIDX_SIDEDATA;
                    }
                }
            }
            if dest.version == REVLOG_V1 {
                sidedata = None;
                flags &= !REVIDX_SIDEDATA;
            }

            match delta_reuse {
                DeltaReuse::FullAdd => {
                    let text = self.revision(rev)?;
                    let (p1, p2) = self.parent_nodes(rev)?;
                    dest.add_revision(
                        tr,
                        &text,
                        entry.link_rev,
                        p1,
                        p2,
                        flags,
                        sidedata.as_deref(),
                    )?;
                }
                _ => {
                    let rawtext = self.raw_data(rev)?;
                    let mut cached = match delta_reuse {
                        DeltaReuse::Never => None,
                        _ => self.stored_delta(rev)?,
                    };
                    if delta_reuse == DeltaReuse::SameRevs {
                        cached = cached.filter(|(base, _)| {
                            *base == entry.p1 || *base == entry.p2 || *base == rev - 1
                        });
                    }
                    if force_delta_both_parents && entry.p2 != NULL_REVISION {
                        cached = None;
                    }
                    dest.add_raw_revision(
                        tr,
                        rawtext,
                        entry.node,
                        entry.p1,
                        entry.p2,
                        entry.link_rev,
                        flags,
                        sidedata.as_deref(),
                        cached,
                    )?;
                }
            }
            if let Some(callback) = on_revision.as_mut() {
                callback(rev, entry.node);
            }
        }
        Ok(())
    }

    /// Aggregate storage details for reporting.
    pub fn storage_info(
        &self,
        exclusive_files: bool,
        revisions_count: bool,
        tracked_size: bool,
        stored_size: bool,
    ) -> Result<StorageInfo> {
        let mut info = StorageInfo::default();
        if exclusive_files {
            info.exclusive_files = self.files();
        }
        if revisions_count {
            info.revisions_count = Some(self.len());
        }
        if tracked_size {
            info.tracked_size = Some(
                self.index
                    .entries()
                    .iter()
                    .map(|e| e.uncomp_len.max(0) as u64)
                    .sum(),
            );
        }
        if stored_size {
            info.stored_size = Some(
                self.index
                    .entries()
                    .iter()
                    .map(|e| e.comp_len as u64 + e.sidedata_len.max(0) as u64)
                    .sum(),
            );
        }
        Ok(info)
    }
}

/// Iterator over all revisions of a revlog, in revision order.
pub struct RevlogRevs<'a> {
    revlog: &'a Revlog,
    rev: Revision,
}

impl Iterator for RevlogRevs<'_> {
    type Item = (Revision, IndexEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let rev = self.rev;
        let entry = self.revlog.index.get(rev).ok()?;
        self.rev += 1;
        Some((rev, entry))
    }
}
