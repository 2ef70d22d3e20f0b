/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The fixed-width index: entry codec for the v1 (64-byte) and v2 (96-byte)
//! layouts, the inline scan, and the in-memory entry table.

use bitflags::bitflags;
use byteorder::BigEndian;
use byteorder::ByteOrder;

use nodemap::NodeTree;
use nodemap::RevisionNodeSource;
use types::Node;
use types::Revision;
use types::NULL_REVISION;

use crate::errors::corrupt;
use crate::errors::programming;
use crate::errors::Result;
use crate::errors::RevlogError;

pub const REVLOG_V1: u16 = 1;
pub const REVLOG_V2: u16 = 2;
pub const CHANGELOG_V2: u16 = 3;

pub const INDEX_ENTRY_SIZE_V1: usize = 64;
pub const INDEX_ENTRY_SIZE_V2: usize = 96;
pub const INDEX_HEADER_SIZE: usize = 4;

bitflags! {
    /// Feature bits carried in the high half of the header word.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct IndexFeatures: u16 {
        /// Index entries and payloads interleave in a single file.
        const INLINE = 1 << 0;
        /// `base_rev` may be any ancestor, not necessarily `rev - 1`.
        const GENERAL_DELTA = 1 << 1;
    }
}

/// Pack the header word: feature flags in the high 16 bits, format version
/// in the low 16.
pub fn pack_header(features: IndexFeatures, version: u16) -> [u8; INDEX_HEADER_SIZE] {
    let word = ((features.bits() as u32) << 16) | version as u32;
    word.to_be_bytes()
}

pub fn parse_header(bytes: &[u8]) -> Result<(IndexFeatures, u16)> {
    if bytes.len() < INDEX_HEADER_SIZE {
        return Err(corrupt("truncated index header"));
    }
    let word = BigEndian::read_u32(bytes);
    let version = (word & 0xffff) as u16;
    let bits = (word >> 16) as u16;
    let features = IndexFeatures::from_bits(bits)
        .ok_or_else(|| corrupt(format!("unknown index feature flags: {:#06x}", bits)))?;
    Ok((features, version))
}

/// How a v2 payload (or sidedata blob) is compressed, from the packed byte
/// of the entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompressionMode {
    /// Stored raw.
    Plain,
    /// Compressed with the docket's default engine.
    Default,
    /// The payload carries its own compression header byte.
    Inline,
}

impl CompressionMode {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(CompressionMode::Plain),
            1 => Ok(CompressionMode::Default),
            2 => Ok(CompressionMode::Inline),
            _ => Err(corrupt(format!("unsupported compression mode: {}", bits))),
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            CompressionMode::Plain => 0,
            CompressionMode::Default => 1,
            CompressionMode::Inline => 2,
        }
    }
}

/// A decoded index record.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct IndexEntry {
    /// Byte offset of the compressed payload in the data stream. For
    /// inline revlogs this is the logical offset, as if payloads were
    /// concatenated without the interleaved index records.
    pub offset: u64,
    pub flags: u16,
    pub comp_len: i32,
    /// Length of the full text; `-1` means unknown.
    pub uncomp_len: i32,
    /// The delta parent; equal to the entry's own revision for a full text.
    pub base_rev: Revision,
    pub link_rev: Revision,
    pub p1: Revision,
    pub p2: Revision,
    pub node: Node,
    pub sidedata_offset: u64,
    pub sidedata_len: i32,
    pub data_comp: CompressionMode,
    pub sidedata_comp: CompressionMode,
}

impl IndexEntry {
    /// The synthetic entry for the null revision.
    pub fn null() -> Self {
        IndexEntry {
            offset: 0,
            flags: 0,
            comp_len: 0,
            uncomp_len: 0,
            base_rev: NULL_REVISION,
            link_rev: NULL_REVISION,
            p1: NULL_REVISION,
            p2: NULL_REVISION,
            node: Node::NULL,
            sidedata_offset: 0,
            sidedata_len: 0,
            data_comp: CompressionMode::Inline,
            sidedata_comp: CompressionMode::Inline,
        }
    }

    pub fn offset_flags(&self) -> u64 {
        (self.offset << 16) | self.flags as u64
    }
}

fn decode_common(rev: Revision, bytes: &[u8]) -> Result<IndexEntry> {
    let mut offset_flags = BigEndian::read_u64(&bytes[0..8]);
    if rev == 0 {
        // The first entry shares its leading bytes with the version
        // header; only the flag bits are meaningful.
        offset_flags &= 0xffff;
    }
    let node = Node::from_slice(&bytes[32..52])
        .map_err(|err| corrupt(format!("bad node in index entry {}: {}", rev, err)))?;
    Ok(IndexEntry {
        offset: offset_flags >> 16,
        flags: (offset_flags & 0xffff) as u16,
        comp_len: BigEndian::read_i32(&bytes[8..12]),
        uncomp_len: BigEndian::read_i32(&bytes[12..16]),
        base_rev: BigEndian::read_i32(&bytes[16..20]),
        link_rev: BigEndian::read_i32(&bytes[20..24]),
        p1: BigEndian::read_i32(&bytes[24..28]),
        p2: BigEndian::read_i32(&bytes[28..32]),
        node,
        sidedata_offset: 0,
        sidedata_len: 0,
        data_comp: CompressionMode::Inline,
        sidedata_comp: CompressionMode::Inline,
    })
}

pub fn decode_v1(rev: Revision, bytes: &[u8]) -> Result<IndexEntry> {
    if bytes.len() < INDEX_ENTRY_SIZE_V1 {
        return Err(corrupt(format!("truncated index entry {}", rev)));
    }
    decode_common(rev, bytes)
}

pub fn decode_v2(rev: Revision, bytes: &[u8]) -> Result<IndexEntry> {
    if bytes.len() < INDEX_ENTRY_SIZE_V2 {
        return Err(corrupt(format!("truncated index entry {}", rev)));
    }
    let mut entry = decode_common(rev, bytes)?;
    entry.sidedata_offset = BigEndian::read_u64(&bytes[64..72]);
    entry.sidedata_len = BigEndian::read_i32(&bytes[72..76]);
    let packed = bytes[76];
    entry.data_comp = CompressionMode::from_bits(packed & 3)?;
    entry.sidedata_comp = CompressionMode::from_bits((packed >> 2) & 3)?;
    Ok(entry)
}

fn encode_common(entry: &IndexEntry, bytes: &mut [u8]) {
    BigEndian::write_u64(&mut bytes[0..8], entry.offset_flags());
    BigEndian::write_i32(&mut bytes[8..12], entry.comp_len);
    BigEndian::write_i32(&mut bytes[12..16], entry.uncomp_len);
    BigEndian::write_i32(&mut bytes[16..20], entry.base_rev);
    BigEndian::write_i32(&mut bytes[20..24], entry.link_rev);
    BigEndian::write_i32(&mut bytes[24..28], entry.p1);
    BigEndian::write_i32(&mut bytes[28..32], entry.p2);
    bytes[32..52].copy_from_slice(entry.node.as_ref());
}

pub fn encode_v1(entry: &IndexEntry) -> Result<[u8; INDEX_ENTRY_SIZE_V1]> {
    if entry.sidedata_offset != 0 || entry.sidedata_len != 0 {
        return Err(programming("sidedata requires the v2 entry layout"));
    }
    let mut bytes = [0u8; INDEX_ENTRY_SIZE_V1];
    encode_common(entry, &mut bytes);
    Ok(bytes)
}

pub fn encode_v2(entry: &IndexEntry) -> [u8; INDEX_ENTRY_SIZE_V2] {
    let mut bytes = [0u8; INDEX_ENTRY_SIZE_V2];
    encode_common(entry, &mut bytes);
    BigEndian::write_u64(&mut bytes[64..72], entry.sidedata_offset);
    BigEndian::write_i32(&mut bytes[72..76], entry.sidedata_len);
    bytes[76] = entry.data_comp.to_bits() | (entry.sidedata_comp.to_bits() << 2);
    bytes
}

/// Walk an inline index+data stream and return the start offset of every
/// entry. The walk must land exactly on the end of the stream.
pub fn scan_inline(data: &[u8], version: u16) -> Result<Vec<u64>> {
    let entry_size = if version == REVLOG_V1 {
        INDEX_ENTRY_SIZE_V1
    } else {
        INDEX_ENTRY_SIZE_V2
    };
    let mut offsets = Vec::new();
    let mut off = 0usize;
    while off + entry_size <= data.len() {
        let comp_len = BigEndian::read_i32(&data[off + 8..off + 12]);
        let sidedata_len = if entry_size == INDEX_ENTRY_SIZE_V2 {
            BigEndian::read_i32(&data[off + 72..off + 76])
        } else {
            0
        };
        if comp_len < 0 || sidedata_len < 0 {
            return Err(corrupt(format!(
                "negative payload length at inline offset {}",
                off
            )));
        }
        offsets.push(off as u64);
        off += entry_size + comp_len as usize + sidedata_len as usize;
    }
    if off != data.len() {
        return Err(corrupt("inline index scan did not end on the stream end"));
    }
    Ok(offsets)
}

/// The entry table of the revlog index takes the role of the node source
/// backing trie lookups.
struct EntryNodes<'a>(&'a [IndexEntry]);

impl RevisionNodeSource for EntryNodes<'_> {
    fn node(&self, rev: Revision) -> Option<Node> {
        if rev < 0 {
            return None;
        }
        self.0.get(rev as usize).map(|e| e.node)
    }
}

/// The in-memory index: the decoded entry table plus the node → revision
/// map built over it.
pub struct Index {
    version: u16,
    entries: Vec<IndexEntry>,
    nodemap: NodeTree,
    /// Number of revisions persisted before the running transaction.
    floor: usize,
}

impl Index {
    pub fn new(version: u16) -> Self {
        Index {
            version,
            entries: Vec::new(),
            nodemap: NodeTree::new(),
            floor: 0,
        }
    }

    /// Build an index from decoded entries, validating structural
    /// invariants: delta bases must not point forward, parents must precede
    /// their revision, and nodes must be unique.
    pub fn from_entries(version: u16, entries: Vec<IndexEntry>) -> Result<Self> {
        Self::from_entries_with_tree(version, entries, None)
    }

    /// Like [`Index::from_entries`], seeding the node map from a persisted
    /// trie that is valid up to `tip_rev` (inclusive).
    pub fn from_entries_with_tree(
        version: u16,
        entries: Vec<IndexEntry>,
        tree: Option<(NodeTree, Revision)>,
    ) -> Result<Self> {
        let (mut nodemap, covered) = match tree {
            Some((tree, tip_rev)) => (tree, tip_rev + 1),
            None => (NodeTree::new(), 0),
        };
        for (i, entry) in entries.iter().enumerate() {
            let rev = i as Revision;
            validate_entry(rev, entry)?;
            if rev >= covered {
                let source = EntryNodes(&entries);
                if nodemap.get_rev(&source, entry.node)?.is_some() {
                    return Err(corrupt(format!(
                        "duplicate node {} at revision {}",
                        entry.node, rev
                    )));
                }
                nodemap.insert(&source, entry.node, rev)?;
            }
        }
        let floor = entries.len();
        Ok(Index {
            version,
            entries,
            nodemap,
            floor,
        })
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, rev: Revision) -> Result<IndexEntry> {
        if rev == NULL_REVISION {
            return Ok(IndexEntry::null());
        }
        if rev < 0 || rev as usize >= self.entries.len() {
            return Err(RevlogError::UnknownRevision(rev));
        }
        Ok(self.entries[rev as usize])
    }

    pub fn node(&self, rev: Revision) -> Result<Node> {
        Ok(self.get(rev)?.node)
    }

    pub fn has_node(&self, node: Node) -> Result<bool> {
        Ok(self.get_rev(node)?.is_some())
    }

    pub fn get_rev(&self, node: Node) -> Result<Option<Revision>> {
        if node.is_null() {
            return Ok(Some(NULL_REVISION));
        }
        let source = EntryNodes(&self.entries);
        Ok(self.nodemap.get_rev(&source, node)?)
    }

    pub fn rev(&self, node: Node) -> Result<Revision> {
        self.get_rev(node)?
            .ok_or_else(|| RevlogError::UnknownNode(node.to_hex()))
    }

    pub fn prefix_lookup(&self, prefix: &str) -> Result<Option<Revision>> {
        let source = EntryNodes(&self.entries);
        Ok(self.nodemap.prefix_lookup(&source, prefix)?)
    }

    pub fn append(&mut self, entry: IndexEntry) -> Result<()> {
        let rev = self.entries.len() as Revision;
        validate_entry(rev, &entry)?;
        if self.get_rev(entry.node)?.is_some() {
            return Err(programming(format!(
                "appending already-known node {}",
                entry.node
            )));
        }
        self.entries.push(entry);
        let source = EntryNodes(&self.entries);
        self.nodemap.insert(&source, entry.node, rev)?;
        Ok(())
    }

    /// Drop every revision `>= rev`.
    pub fn truncate(&mut self, rev: Revision) -> Result<()> {
        let rev = rev.max(0);
        if rev as usize >= self.entries.len() {
            return Ok(());
        }
        self.entries.truncate(rev as usize);
        let source = EntryNodes(&self.entries);
        self.nodemap.strip_from(&source, rev)?;
        self.floor = self.floor.min(rev as usize);
        Ok(())
    }

    /// Rewrite the sidedata location of an entry created by the running
    /// transaction. Rewriting persisted entries would race concurrent
    /// readers and is a bug.
    pub fn replace_sidedata_info(
        &mut self,
        rev: Revision,
        sidedata_offset: u64,
        sidedata_len: i32,
        flags: u16,
    ) -> Result<()> {
        if self.version == REVLOG_V1 {
            return Err(programming("sidedata requires the v2 entry layout"));
        }
        if rev < 0 || rev as usize >= self.entries.len() {
            return Err(RevlogError::UnknownRevision(rev));
        }
        if (rev as usize) < self.floor {
            return Err(programming(
                "cannot rewrite entries outside of this transaction",
            ));
        }
        let entry = &mut self.entries[rev as usize];
        entry.sidedata_offset = sidedata_offset;
        entry.sidedata_len = sidedata_len;
        entry.flags = flags;
        Ok(())
    }

    /// Pack the version header for this index. v2 indexes refuse: their
    /// version lives in the docket, not inline.
    pub fn pack_header(&self, features: IndexFeatures) -> Result<[u8; INDEX_HEADER_SIZE]> {
        if self.version != REVLOG_V1 {
            return Err(programming(format!(
                "version header should go in the docket, not the index: {}",
                self.version
            )));
        }
        Ok(pack_header(features, self.version))
    }

    /// Record that everything currently in the index is persisted; called
    /// when a transaction closes.
    pub fn mark_persisted(&mut self) {
        self.floor = self.entries.len();
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    pub fn node_tree(&self) -> &NodeTree {
        &self.nodemap
    }

    pub fn node_tree_mut(&mut self) -> &mut NodeTree {
        &mut self.nodemap
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }
}

fn validate_entry(rev: Revision, entry: &IndexEntry) -> Result<()> {
    if entry.base_rev < 0 || entry.base_rev > rev {
        return Err(corrupt(format!(
            "revision {} has invalid delta base {}",
            rev, entry.base_rev
        )));
    }
    for parent in [entry.p1, entry.p2] {
        if parent < NULL_REVISION || parent >= rev {
            return Err(corrupt(format!(
                "revision {} has invalid parent {}",
                rev, parent
            )));
        }
    }
    if entry.p1 == NULL_REVISION && entry.p2 != NULL_REVISION {
        return Err(corrupt(format!(
            "revision {} has a second parent without a first",
            rev
        )));
    }
    if entry.node.is_null() {
        return Err(corrupt(format!("revision {} has the null node", rev)));
    }
    if entry.comp_len < 0 || entry.sidedata_len < 0 {
        return Err(corrupt(format!(
            "revision {} has a negative stored length",
            rev
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    fn entry(rev: Revision, node: Node) -> IndexEntry {
        IndexEntry {
            offset: (rev as u64) * 10,
            flags: 0,
            comp_len: 10,
            uncomp_len: 12,
            base_rev: rev,
            link_rev: rev,
            p1: rev - 1,
            p2: NULL_REVISION,
            node,
            sidedata_offset: 0,
            sidedata_len: 0,
            data_comp: CompressionMode::Inline,
            sidedata_comp: CompressionMode::Inline,
        }
    }

    fn node(fill: u8) -> Node {
        Node::from_byte_array([fill; 20])
    }

    #[test]
    fn test_header_roundtrip() {
        let features = IndexFeatures::INLINE | IndexFeatures::GENERAL_DELTA;
        let packed = pack_header(features, REVLOG_V1);
        assert_eq!(packed, [0x00, 0x03, 0x00, 0x01]);
        assert_eq!(parse_header(&packed).unwrap(), (features, REVLOG_V1));
    }

    #[test]
    fn test_header_unknown_feature_bits() {
        assert!(parse_header(&[0x00, 0x10, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_v1_rev0_masks_header() {
        let mut e = entry(0, node(1));
        e.p1 = NULL_REVISION;
        e.offset = 0;
        e.flags = 1 << 15;
        let mut bytes = encode_v1(&e).unwrap();
        // Overlay a header word as the on-disk form of entry 0 does.
        bytes[0..4].copy_from_slice(&pack_header(IndexFeatures::INLINE, REVLOG_V1));
        let decoded = decode_v1(0, &bytes).unwrap();
        assert_eq!(decoded.offset, 0);
        assert_eq!(decoded.flags, 1 << 15);
        assert_eq!(decoded.node, e.node);
    }

    #[test]
    fn test_v2_packed_compression_modes() {
        let mut e = entry(3, node(2));
        e.sidedata_offset = 1024;
        e.sidedata_len = 64;
        e.data_comp = CompressionMode::Default;
        e.sidedata_comp = CompressionMode::Plain;
        let bytes = encode_v2(&e);
        assert_eq!(bytes.len(), INDEX_ENTRY_SIZE_V2);
        assert_eq!(bytes[76], 0b0000_0001);
        let decoded = decode_v2(3, &bytes).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn test_v1_refuses_sidedata() {
        let mut e = entry(1, node(3));
        e.sidedata_len = 4;
        assert!(matches!(
            encode_v1(&e),
            Err(RevlogError::Programming(_))
        ));
    }

    #[test]
    fn test_scan_inline() {
        let mut stream = Vec::new();
        for rev in 0..3 {
            let mut e = entry(rev, node(rev as u8 + 1));
            e.p1 = rev - 1;
            e.comp_len = 5;
            stream.extend_from_slice(&encode_v1(&e).unwrap());
            stream.extend_from_slice(b"01234");
        }
        let offsets = scan_inline(&stream, REVLOG_V1).unwrap();
        assert_eq!(offsets, vec![0, 69, 138]);

        // A truncated tail must fail the scan.
        stream.pop();
        assert!(scan_inline(&stream, REVLOG_V1).is_err());
    }

    #[test]
    fn test_index_lookups() {
        let entries = vec![
            {
                let mut e = entry(0, node(1));
                e.p1 = NULL_REVISION;
                e
            },
            entry(1, node(2)),
            entry(2, node(3)),
        ];
        let index = Index::from_entries(REVLOG_V1, entries).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.rev(node(2)).unwrap(), 1);
        assert_eq!(index.get_rev(Node::NULL).unwrap(), Some(NULL_REVISION));
        assert_eq!(index.node(NULL_REVISION).unwrap(), Node::NULL);
        assert!(matches!(
            index.rev(node(9)),
            Err(RevlogError::UnknownNode(_))
        ));
        assert!(matches!(
            index.get(7),
            Err(RevlogError::UnknownRevision(7))
        ));
    }

    #[test]
    fn test_index_rejects_forward_base() {
        let mut bad = entry(0, node(1));
        bad.p1 = NULL_REVISION;
        bad.base_rev = 5;
        assert!(Index::from_entries(REVLOG_V1, vec![bad]).is_err());
    }

    #[test]
    fn test_index_rejects_parent2_only() {
        let mut e0 = entry(0, node(1));
        e0.p1 = NULL_REVISION;
        let mut bad = entry(1, node(2));
        bad.p1 = NULL_REVISION;
        bad.p2 = 0;
        assert!(Index::from_entries(REVLOG_V1, vec![e0, bad]).is_err());
    }

    #[test]
    fn test_index_rejects_duplicate_nodes() {
        let mut e0 = entry(0, node(1));
        e0.p1 = NULL_REVISION;
        let dup = entry(1, node(1));
        assert!(Index::from_entries(REVLOG_V1, vec![e0, dup]).is_err());
    }

    #[test]
    fn test_truncate_drops_nodes() {
        let mut e0 = entry(0, node(1));
        e0.p1 = NULL_REVISION;
        let entries = vec![e0, entry(1, node(2)), entry(2, node(3))];
        let mut index = Index::from_entries(REVLOG_V1, entries).unwrap();
        index.truncate(1).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get_rev(node(2)).unwrap(), None);
        assert_eq!(index.rev(node(1)).unwrap(), 0);
    }

    #[test]
    fn test_replace_sidedata_floor() {
        let mut e0 = entry(0, node(1));
        e0.p1 = NULL_REVISION;
        let mut index = Index::from_entries(REVLOG_V2, vec![e0]).unwrap();
        // Revision 0 predates the transaction.
        assert!(matches!(
            index.replace_sidedata_info(0, 100, 4, 0),
            Err(RevlogError::Programming(_))
        ));
        index.append(entry(1, node(2))).unwrap();
        index.replace_sidedata_info(1, 100, 4, 0).unwrap();
        assert_eq!(index.get(1).unwrap().sidedata_offset, 100);
    }

    #[test]
    fn test_pack_header_refused_for_v2() {
        let index = Index::new(REVLOG_V2);
        assert!(matches!(
            index.pack_header(IndexFeatures::GENERAL_DELTA),
            Err(RevlogError::Programming(_))
        ));
    }

    quickcheck! {
        fn test_v1_roundtrip(
            offset: u64,
            flags: u16,
            comp_len: u32,
            uncomp_len: i32,
            node: Node
        ) -> bool {
            let e = IndexEntry {
                // 48-bit offset field.
                offset: offset & 0xffff_ffff_ffff,
                flags,
                comp_len: (comp_len >> 1) as i32,
                uncomp_len,
                base_rev: 3,
                link_rev: 7,
                p1: 2,
                p2: NULL_REVISION,
                node,
                sidedata_offset: 0,
                sidedata_len: 0,
                data_comp: CompressionMode::Inline,
                sidedata_comp: CompressionMode::Inline,
            };
            let bytes = encode_v1(&e).unwrap();
            decode_v1(5, &bytes).unwrap() == e
        }

        fn test_v2_roundtrip(offset: u64, sidedata_offset: u64, sidedata_len: u32, node: Node) -> bool {
            let e = IndexEntry {
                offset: offset & 0xffff_ffff_ffff,
                flags: 0,
                comp_len: 11,
                uncomp_len: 22,
                base_rev: 1,
                link_rev: 1,
                p1: 0,
                p2: NULL_REVISION,
                node,
                sidedata_offset,
                sidedata_len: (sidedata_len >> 1) as i32,
                data_comp: CompressionMode::Default,
                sidedata_comp: CompressionMode::Plain,
            };
            let bytes = encode_v2(&e);
            decode_v2(5, &bytes).unwrap() == e
        }
    }
}
