/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use byteorder::BigEndian;
use byteorder::ByteOrder;

use types::Node;
use types::Revision;

use crate::NodeMapError;
use crate::Result;
use crate::RevisionNodeSource;

pub const BLOCK_SLOTS: usize = 16;
pub const BLOCK_BYTES: usize = BLOCK_SLOTS * 4;

/// One trie level: a slot per hex nibble.
///
/// Raw slot encoding: `0` is empty, a positive value is `revision + 1`
/// (terminal), a negative value is `-(block_index + 1)` (child pointer).
#[derive(Clone, Copy, PartialEq, Debug, Default)]
struct Block([i32; BLOCK_SLOTS]);

#[derive(Clone, Copy, PartialEq, Debug)]
enum Element {
    Empty,
    Rev(Revision),
    Child(usize),
}

impl Block {
    fn get(&self, nibble: u8) -> Element {
        let raw = self.0[nibble as usize];
        if raw == 0 {
            Element::Empty
        } else if raw > 0 {
            Element::Rev(raw - 1)
        } else {
            Element::Child((-raw - 1) as usize)
        }
    }

    fn set(&mut self, nibble: u8, element: Element) {
        self.0[nibble as usize] = match element {
            Element::Empty => 0,
            Element::Rev(rev) => {
                debug_assert!(rev >= 0);
                rev + 1
            }
            Element::Child(idx) => -(idx as i32) - 1,
        };
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; BLOCK_BYTES];
        for (i, raw) in self.0.iter().enumerate() {
            BigEndian::write_i32(&mut buf[i * 4..i * 4 + 4], *raw);
        }
        out.extend_from_slice(&buf);
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut slots = [0i32; BLOCK_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = BigEndian::read_i32(&bytes[i * 4..i * 4 + 4]);
        }
        Block(slots)
    }
}

/// Where a mutable block lives during an insertion walk. Blocks from the
/// persisted base are copied into the growable region before mutation.
#[derive(Clone, Copy)]
enum BlockRef {
    Root,
    Growable(usize),
}

pub struct NodeTree {
    /// Blocks from the persisted base, never mutated in place.
    readonly: Vec<Block>,
    /// Blocks created (or copied for mutation) since the base.
    growable: Vec<Block>,
    root: Block,
    /// Base blocks shadowed by a growable copy; dead weight on disk.
    masked_blocks: usize,
    /// Whether the last persisted block stream ends with a root image.
    root_on_disk: bool,
    /// Unsynced insertions exist.
    dirty: bool,
    /// Incremental continuity with the base was lost (strip, fresh build).
    full_required: bool,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    pub fn new() -> Self {
        Self {
            readonly: Vec::new(),
            growable: Vec::new(),
            root: Block::default(),
            masked_blocks: 0,
            root_on_disk: false,
            dirty: false,
            full_required: true,
        }
    }

    /// Load a persisted trie. The root is the last block of the stream.
    pub fn load_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % BLOCK_BYTES != 0 {
            return Err(NodeMapError::Corrupt(format!(
                "block stream length {} not a multiple of {}",
                bytes.len(),
                BLOCK_BYTES
            )));
        }
        let count = bytes.len() / BLOCK_BYTES;
        if count == 0 {
            return Ok(Self::new());
        }
        let mut readonly = Vec::with_capacity(count);
        for i in 0..count {
            readonly.push(Block::from_bytes(&bytes[i * BLOCK_BYTES..(i + 1) * BLOCK_BYTES]));
        }
        let root = readonly[count - 1];
        Ok(Self {
            readonly,
            growable: Vec::new(),
            root,
            masked_blocks: 0,
            root_on_disk: true,
            dirty: false,
            full_required: false,
        })
    }

    /// Load a persisted base extended by an append-only incremental tail.
    pub fn load_with_tail(base: &[u8], tail: &[u8]) -> Result<Self> {
        let mut combined = Vec::with_capacity(base.len() + tail.len());
        combined.extend_from_slice(base);
        combined.extend_from_slice(tail);
        Self::load_bytes(&combined)
    }

    /// Build a fresh trie for revisions `0..len` of `source`.
    pub fn build(source: &impl RevisionNodeSource, len: Revision) -> Result<Self> {
        let mut tree = Self::new();
        for rev in 0..len {
            let node = source.node(rev).ok_or_else(|| {
                NodeMapError::Corrupt(format!("no node for revision {}", rev))
            })?;
            tree.insert(source, node, rev)?;
        }
        Ok(tree)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True when the next persist must be a full write: there is no base to
    /// extend, or continuity with it was lost.
    pub fn full_write_required(&self) -> bool {
        self.full_required
    }

    /// Bytes of the persisted base made unreachable by later updates.
    pub fn masked_bytes(&self) -> usize {
        self.masked_blocks * BLOCK_BYTES
    }

    /// Size of the persisted block stream.
    pub fn on_disk_bytes(&self) -> usize {
        self.readonly.len() * BLOCK_BYTES
    }

    fn block(&self, idx: usize) -> Result<&Block> {
        if idx < self.readonly.len() {
            Ok(&self.readonly[idx])
        } else {
            self.growable.get(idx - self.readonly.len()).ok_or_else(|| {
                NodeMapError::Corrupt(format!("block pointer {} out of range", idx))
            })
        }
    }

    fn block_for(&self, r: BlockRef) -> &Block {
        match r {
            BlockRef::Root => &self.root,
            BlockRef::Growable(g) => &self.growable[g],
        }
    }

    fn set_slot(&mut self, r: BlockRef, nibble: u8, element: Element) {
        match r {
            BlockRef::Root => self.root.set(nibble, element),
            BlockRef::Growable(g) => self.growable[g].set(nibble, element),
        }
    }

    /// Walk the trie along `node`. Returns the leaf revision and the depth
    /// at which it was found.
    fn lookup(&self, node: Node) -> Result<Option<Revision>> {
        let mut cur = &self.root;
        for i in 0..Node::HEX_LEN {
            match cur.get(node.nibble(i)) {
                Element::Empty => return Ok(None),
                Element::Rev(rev) => return Ok(Some(rev)),
                Element::Child(idx) => cur = self.block(idx)?,
            }
        }
        Err(NodeMapError::Corrupt(
            "trie deeper than the node length".to_string(),
        ))
    }

    pub fn get_rev(
        &self,
        source: &impl RevisionNodeSource,
        node: Node,
    ) -> Result<Option<Revision>> {
        match self.lookup(node)? {
            None => Ok(None),
            Some(rev) => {
                let found = source.node(rev).ok_or_else(|| {
                    NodeMapError::Corrupt(format!(
                        "node map points to unknown revision {}",
                        rev
                    ))
                })?;
                Ok(if found == node { Some(rev) } else { None })
            }
        }
    }

    pub fn rev(&self, source: &impl RevisionNodeSource, node: Node) -> Result<Revision> {
        self.get_rev(source, node)?
            .ok_or_else(|| NodeMapError::UnknownNode(node.to_hex()))
    }

    pub fn has_node(&self, source: &impl RevisionNodeSource, node: Node) -> Result<bool> {
        Ok(self.get_rev(source, node)?.is_some())
    }

    /// Resolve a hex prefix. `Ok(None)` when nothing matches; an error when
    /// two or more nodes share the prefix.
    pub fn prefix_lookup(
        &self,
        source: &impl RevisionNodeSource,
        prefix: &str,
    ) -> Result<Option<Revision>> {
        if prefix.is_empty() || prefix.len() > Node::HEX_LEN {
            return Err(NodeMapError::Corrupt(format!(
                "invalid node prefix length {}",
                prefix.len()
            )));
        }
        let prefix = prefix.to_ascii_lowercase();
        let mut nibbles = Vec::with_capacity(prefix.len());
        for c in prefix.chars() {
            match c.to_digit(16) {
                Some(d) => nibbles.push(d as u8),
                None => return Err(NodeMapError::Corrupt(format!(
                    "invalid node prefix: {:?}",
                    prefix
                ))),
            }
        }

        let mut cur = &self.root;
        for &nib in &nibbles {
            match cur.get(nib) {
                Element::Empty => return Ok(None),
                Element::Rev(rev) => return self.verify_prefix(source, rev, &prefix),
                Element::Child(idx) => cur = self.block(idx)?,
            }
        }
        // The prefix ends inside the trie; every leaf below matches it.
        let mut leaves = Vec::new();
        self.collect_leaves(cur, 2, &mut leaves)?;
        match leaves.as_slice() {
            [] => Ok(None),
            [rev] => self.verify_prefix(source, *rev, &prefix),
            _ => Err(NodeMapError::AmbiguousPrefix(prefix)),
        }
    }

    fn verify_prefix(
        &self,
        source: &impl RevisionNodeSource,
        rev: Revision,
        prefix: &str,
    ) -> Result<Option<Revision>> {
        let node = source.node(rev).ok_or_else(|| {
            NodeMapError::Corrupt(format!("node map points to unknown revision {}", rev))
        })?;
        Ok(if node.starts_with_hex(prefix) {
            Some(rev)
        } else {
            None
        })
    }

    fn collect_leaves(&self, block: &Block, limit: usize, out: &mut Vec<Revision>) -> Result<()> {
        for nibble in 0..BLOCK_SLOTS as u8 {
            if out.len() >= limit {
                return Ok(());
            }
            match block.get(nibble) {
                Element::Empty => {}
                Element::Rev(rev) => out.push(rev),
                Element::Child(idx) => {
                    let child = *self.block(idx)?;
                    self.collect_leaves(&child, limit, out)?;
                }
            }
        }
        Ok(())
    }

    /// Insert `node → rev`.
    ///
    /// Re-inserting the same pair is a no-op. Panics if `node` is already
    /// mapped to a different revision: nodes are unique per log and such an
    /// insertion is a bug in the caller, not a data error.
    pub fn insert(
        &mut self,
        source: &impl RevisionNodeSource,
        node: Node,
        rev: Revision,
    ) -> Result<()> {
        assert!(rev >= 0, "cannot insert the null revision");
        let mut cur = BlockRef::Root;
        for i in 0..Node::HEX_LEN {
            let nib = node.nibble(i);
            match self.block_for(cur).get(nib) {
                Element::Child(idx) => {
                    if idx < self.readonly.len() {
                        // Copy-on-write: base blocks stay untouched so the
                        // incremental tail only carries new blocks.
                        let copy = self.readonly[idx];
                        self.growable.push(copy);
                        self.masked_blocks += 1;
                        let new_idx = self.readonly.len() + self.growable.len() - 1;
                        self.set_slot(cur, nib, Element::Child(new_idx));
                        cur = BlockRef::Growable(self.growable.len() - 1);
                    } else {
                        cur = BlockRef::Growable(idx - self.readonly.len());
                    }
                }
                Element::Empty => {
                    self.set_slot(cur, nib, Element::Rev(rev));
                    self.dirty = true;
                    return Ok(());
                }
                Element::Rev(existing) => {
                    let existing_node = source.node(existing).ok_or_else(|| {
                        NodeMapError::Corrupt(format!(
                            "node map points to unknown revision {}",
                            existing
                        ))
                    })?;
                    if existing_node == node {
                        assert!(
                            existing == rev,
                            "node {} already mapped to revision {}",
                            node,
                            existing
                        );
                        return Ok(());
                    }
                    // Grow a chain of blocks until the two nodes diverge.
                    let mut parent = cur;
                    let mut parent_nib = nib;
                    let mut depth = i + 1;
                    loop {
                        assert!(depth < Node::HEX_LEN, "distinct nodes must diverge");
                        let new_idx = self.readonly.len() + self.growable.len();
                        self.growable.push(Block::default());
                        self.set_slot(parent, parent_nib, Element::Child(new_idx));
                        let g = self.growable.len() - 1;
                        let old_nib = existing_node.nibble(depth);
                        let new_nib = node.nibble(depth);
                        if old_nib != new_nib {
                            self.growable[g].set(old_nib, Element::Rev(existing));
                            self.growable[g].set(new_nib, Element::Rev(rev));
                            self.dirty = true;
                            return Ok(());
                        }
                        parent = BlockRef::Growable(g);
                        parent_nib = old_nib;
                        depth += 1;
                    }
                }
            }
        }
        Err(NodeMapError::Corrupt(
            "trie deeper than the node length".to_string(),
        ))
    }

    /// Remove all entries for revisions `>= rev` by rebuilding from the
    /// surviving prefix of `source`. Incremental continuity with the
    /// persisted base is lost: the next persist is a full write.
    pub fn strip_from(&mut self, source: &impl RevisionNodeSource, rev: Revision) -> Result<()> {
        let rev = rev.max(0);
        *self = Self::build(source, rev)?;
        Ok(())
    }

    /// Drop the in-memory state. The owner rebuilds from its index on the
    /// next use.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Serialize the whole trie, root last.
    pub fn full_bytes(&self) -> Vec<u8> {
        let count = self.readonly.len() + self.growable.len() + 1;
        let mut out = Vec::with_capacity(count * BLOCK_BYTES);
        for block in &self.readonly {
            block.write_to(&mut out);
        }
        for block in &self.growable {
            block.write_to(&mut out);
        }
        self.root.write_to(&mut out);
        out
    }

    /// Serialize only the blocks added since the persisted base, root last,
    /// and re-baseline so a later call continues from here. Returns `None`
    /// when no base can be extended ([`Self::full_write_required`]).
    pub fn incremental_bytes(&mut self) -> Option<Vec<u8>> {
        if self.full_required {
            return None;
        }
        let mut out = Vec::with_capacity((self.growable.len() + 1) * BLOCK_BYTES);
        for block in &self.growable {
            block.write_to(&mut out);
        }
        self.root.write_to(&mut out);
        if self.root_on_disk {
            // The previously persisted root image is superseded.
            self.masked_blocks += 1;
        }
        let growable = std::mem::take(&mut self.growable);
        self.readonly.extend(growable);
        self.readonly.push(self.root);
        self.root_on_disk = true;
        self.dirty = false;
        Some(out)
    }

    /// Re-baseline after the owner wrote [`Self::full_bytes`] to disk.
    pub fn mark_persisted_full(&mut self) {
        let growable = std::mem::take(&mut self.growable);
        self.readonly.extend(growable);
        self.readonly.push(self.root);
        self.masked_blocks = 0;
        self.root_on_disk = true;
        self.dirty = false;
        self.full_required = false;
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;
    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    use super::*;

    fn nodes(count: usize) -> Vec<Node> {
        let mut rng = ChaChaRng::from_seed([7u8; 32]);
        (0..count).map(|_| Node::random(&mut rng)).collect()
    }

    fn build(source: &Vec<Node>) -> NodeTree {
        NodeTree::build(source, source.len() as Revision).expect("build")
    }

    #[test]
    fn test_exact_lookup() {
        let source = nodes(100);
        let tree = build(&source);
        for (rev, node) in source.iter().enumerate() {
            assert_eq!(tree.rev(&source, *node).unwrap(), rev as Revision);
        }
        let mut rng = ChaChaRng::from_seed([9u8; 32]);
        let missing = Node::random(&mut rng);
        assert_eq!(tree.get_rev(&source, missing).unwrap(), None);
        assert_eq!(
            tree.rev(&source, missing),
            Err(NodeMapError::UnknownNode(missing.to_hex()))
        );
    }

    #[test]
    fn test_insert_same_pair_is_noop() {
        let source = nodes(3);
        let mut tree = build(&source);
        tree.insert(&source, source[1], 1).unwrap();
        assert_eq!(tree.rev(&source, source[1]).unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn test_insert_conflicting_rev_panics() {
        let source = nodes(3);
        let mut tree = build(&source);
        tree.insert(&source, source[1], 2).unwrap();
    }

    #[test]
    fn test_prefix_lookup_collision() {
        let a = Node::from_hex("deadbe11223344556677889900aabbccddeeff00").unwrap();
        let b = Node::from_hex("deadbeef223344556677889900aabbccddeeff00").unwrap();
        let source = vec![a, b];
        let tree = build(&source);
        assert_eq!(
            tree.prefix_lookup(&source, "deadbe"),
            Err(NodeMapError::AmbiguousPrefix("deadbe".to_string()))
        );
        assert_eq!(tree.prefix_lookup(&source, "deadbe1").unwrap(), Some(0));
        assert_eq!(tree.prefix_lookup(&source, "deadbee").unwrap(), Some(1));
        assert_eq!(tree.prefix_lookup(&source, &a.to_hex()).unwrap(), Some(0));
        assert_eq!(tree.prefix_lookup(&source, "ff").unwrap(), None);
    }

    #[test]
    fn test_prefix_lookup_single_entry() {
        let source = nodes(1);
        let tree = build(&source);
        let hex = source[0].to_hex();
        assert_eq!(tree.prefix_lookup(&source, &hex[..1]).unwrap(), Some(0));
        assert_eq!(tree.prefix_lookup(&source, &hex).unwrap(), Some(0));
    }

    #[test]
    fn test_prefix_lookup_rejects_bad_input() {
        let source = nodes(1);
        let tree = build(&source);
        assert!(tree.prefix_lookup(&source, "").is_err());
        assert!(tree.prefix_lookup(&source, "xyz").is_err());
    }

    #[test]
    fn test_full_roundtrip() {
        let source = nodes(50);
        let tree = build(&source);
        let bytes = tree.full_bytes();
        assert_eq!(bytes.len() % BLOCK_BYTES, 0);
        let reloaded = NodeTree::load_bytes(&bytes).unwrap();
        for (rev, node) in source.iter().enumerate() {
            assert_eq!(reloaded.rev(&source, *node).unwrap(), rev as Revision);
        }
    }

    #[test]
    fn test_incremental_tail() {
        let mut source = nodes(80);
        let mut tree = build(&source);
        assert!(tree.full_write_required());
        assert!(tree.incremental_bytes().is_none());
        let base = tree.full_bytes();
        tree.mark_persisted_full();

        let mut rng = ChaChaRng::from_seed([3u8; 32]);
        for _ in 0..20 {
            source.push(Node::random(&mut rng));
        }
        let mut reopened = NodeTree::load_bytes(&base).unwrap();
        for rev in 80..100 {
            reopened
                .insert(&source, source[rev as usize], rev)
                .unwrap();
        }
        assert!(reopened.is_dirty());
        let tail = reopened.incremental_bytes().expect("incremental");
        assert!(!reopened.is_dirty());

        let combined = NodeTree::load_with_tail(&base, &tail).unwrap();
        for (rev, node) in source.iter().enumerate() {
            assert_eq!(combined.rev(&source, *node).unwrap(), rev as Revision);
        }
    }

    #[test]
    fn test_masked_accounting_grows() {
        let source = nodes(40);
        let mut tree = build(&source);
        tree.full_bytes();
        tree.mark_persisted_full();
        assert_eq!(tree.masked_bytes(), 0);

        let mut source = source;
        let mut rng = ChaChaRng::from_seed([5u8; 32]);
        source.push(Node::random(&mut rng));
        tree.insert(&source, source[40], 40).unwrap();
        let _ = tree.incremental_bytes().unwrap();
        assert!(tree.masked_bytes() > 0);
    }

    #[test]
    fn test_strip_from() {
        let mut source = nodes(30);
        let mut tree = build(&source);
        source.truncate(20);
        tree.strip_from(&source, 20).unwrap();
        assert!(tree.full_write_required());
        for (rev, node) in source.iter().enumerate() {
            assert_eq!(tree.rev(&source, *node).unwrap(), rev as Revision);
        }
        let mut rng = ChaChaRng::from_seed([11u8; 32]);
        let gone = Node::random(&mut rng);
        assert_eq!(tree.get_rev(&source, gone).unwrap(), None);
    }

    #[test]
    fn test_empty_tree() {
        let source: Vec<Node> = Vec::new();
        let tree = NodeTree::new();
        let mut rng = ChaChaRng::from_seed([1u8; 32]);
        assert_eq!(tree.get_rev(&source, Node::random(&mut rng)).unwrap(), None);
        let bytes = tree.full_bytes();
        assert_eq!(bytes.len(), BLOCK_BYTES);
        NodeTree::load_bytes(&bytes).unwrap();
    }

    quickcheck! {
        fn test_all_inserted_resolve(source: Vec<Node>) -> bool {
            let mut source = source;
            source.sort();
            source.dedup();
            let tree = match NodeTree::build(&source, source.len() as Revision) {
                Ok(tree) => tree,
                Err(_) => return false,
            };
            source
                .iter()
                .enumerate()
                .all(|(rev, node)| tree.rev(&source, *node) == Ok(rev as Revision))
        }

        fn test_serialized_roundtrip(source: Vec<Node>) -> bool {
            let mut source = source;
            source.sort();
            source.dedup();
            let tree = match NodeTree::build(&source, source.len() as Revision) {
                Ok(tree) => tree,
                Err(_) => return false,
            };
            let reloaded = match NodeTree::load_bytes(&tree.full_bytes()) {
                Ok(tree) => tree,
                Err(_) => return false,
            };
            source
                .iter()
                .enumerate()
                .all(|(rev, node)| reloaded.rev(&source, *node) == Ok(rev as Revision))
        }
    }
}
