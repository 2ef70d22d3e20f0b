/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The persistent node map companion files.
//!
//! `<radix>.n` is a small docket naming the current data file
//! (`<radix>-<uid>.nd`), how many of its bytes are valid, how many are dead
//! weight from copy-on-write updates, and which revision/node pair it is
//! current for. The tip node lets a reader detect a stale map after a strip
//! and fall back to an in-memory rebuild; the map is a cache, never
//! authoritative.

use byteorder::BigEndian;
use byteorder::ByteOrder;

use types::Node;
use types::Revision;

use crate::docket::make_uid;
use crate::errors::corrupt;
use crate::errors::Result;

const ONDISK_VERSION: u8 = 1;
const FIXED_HEADER_SIZE: usize = 1 + 1 + 8 * 3 + Node::LEN;

#[derive(Clone, Debug)]
pub struct NodemapDocket {
    pub uid: String,
    pub tip_rev: Revision,
    pub data_length: u64,
    pub data_unused: u64,
    pub tip_node: Node,
}

impl NodemapDocket {
    pub fn new(tip_rev: Revision, tip_node: Node, data_length: u64, data_unused: u64) -> Self {
        NodemapDocket {
            uid: make_uid(),
            tip_rev,
            data_length,
            data_unused,
            tip_node,
        }
    }

    pub fn docket_path(radix: &str) -> String {
        format!("{}.n", radix)
    }

    pub fn data_path(radix: &str, uid: &str) -> String {
        format!("{}-{}.nd", radix, uid)
    }

    /// Parse a nodemap docket. An unknown version reads as `None`: the
    /// persisted map is ignored and rebuilt.
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(corrupt("truncated nodemap docket"));
        }
        if data[0] != ONDISK_VERSION {
            return Ok(None);
        }
        let uid_len = data[1] as usize;
        let tip_rev = BigEndian::read_u64(&data[2..10]);
        let data_length = BigEndian::read_u64(&data[10..18]);
        let data_unused = BigEndian::read_u64(&data[18..26]);
        let tip_node = Node::from_slice(&data[26..26 + Node::LEN])
            .map_err(|err| corrupt(format!("bad nodemap tip node: {}", err)))?;
        if data.len() < FIXED_HEADER_SIZE + uid_len {
            return Err(corrupt("truncated nodemap docket uid"));
        }
        if tip_rev > i32::MAX as u64 {
            return Err(corrupt(format!("nodemap tip revision out of range: {}", tip_rev)));
        }
        let uid = String::from_utf8(
            data[FIXED_HEADER_SIZE..FIXED_HEADER_SIZE + uid_len].to_vec(),
        )
        .map_err(|_| corrupt("non-ascii nodemap uid"))?;
        Ok(Some(NodemapDocket {
            uid,
            tip_rev: tip_rev as Revision,
            data_length,
            data_unused,
            tip_node,
        }))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; FIXED_HEADER_SIZE];
        out[0] = ONDISK_VERSION;
        out[1] = self.uid.len() as u8;
        BigEndian::write_u64(&mut out[2..10], self.tip_rev.max(0) as u64);
        BigEndian::write_u64(&mut out[10..18], self.data_length);
        BigEndian::write_u64(&mut out[18..26], self.data_unused);
        out[26..26 + Node::LEN].copy_from_slice(self.tip_node.as_ref());
        out.extend_from_slice(self.uid.as_bytes());
        out
    }
}
