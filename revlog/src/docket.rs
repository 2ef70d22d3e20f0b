/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The v2 revlog docket: a small pointer file naming the current index and
//! data segments and their valid lengths.
//!
//! The docket lives where a v1 index would (`<radix>.i`) so that its first
//! four bytes stay compatible with the version header. The index and data
//! files carry random uuid suffixes: a rewrite allocates fresh files and
//! concurrent readers keep seeing the old ones until they reopen.
//!
//! On-disk layout, big-endian:
//!
//! * 4 bytes: version header
//! * 1 byte: length of the index uuid
//! * 1 byte: length of the data uuid
//! * 8 bytes: official index end
//! * 8 bytes: pending index end
//! * 8 bytes: official data end
//! * 8 bytes: pending data end
//! * 1 byte: default compression header
//! * the two ascii-hex uuids

use byteorder::BigEndian;
use byteorder::ByteOrder;
use rand::RngCore;

use vfs::Transaction;
use vfs::Vfs;

use crate::errors::corrupt;
use crate::errors::programming;
use crate::errors::Result;

const FIXED_HEADER_SIZE: usize = 4 + 1 + 1 + 8 * 4 + 1;

/// A fresh random ascii-hex identifier.
pub(crate) fn make_uid() -> String {
    let mut raw = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

pub struct Docket {
    version_header: u32,
    read_only: bool,
    dirty: bool,
    radix: String,
    path: String,
    index_uuid: Option<String>,
    data_uuid: Option<String>,
    initial_index_end: u64,
    pending_index_end: u64,
    index_end: u64,
    initial_data_end: u64,
    pending_data_end: u64,
    data_end: u64,
    default_compression_header: u8,
}

impl Docket {
    /// A docket for a fresh revlog; uuids are allocated on the first
    /// file-path request.
    pub fn new(radix: &str, version_header: u32, default_compression_header: u8) -> Self {
        Docket {
            version_header,
            read_only: false,
            dirty: true,
            radix: radix.to_string(),
            path: format!("{}.i", radix),
            index_uuid: None,
            data_uuid: None,
            initial_index_end: 0,
            pending_index_end: 0,
            index_end: 0,
            initial_data_end: 0,
            pending_data_end: 0,
            data_end: 0,
            default_compression_header,
        }
    }

    /// Parse a docket file. With `use_pending` the reader sees the pending
    /// tail (transaction-internal readers only); such a docket is read-only.
    pub fn parse(radix: &str, data: &[u8], use_pending: bool) -> Result<Self> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(corrupt("truncated revlog docket"));
        }
        let version_header = BigEndian::read_u32(&data[0..4]);
        let index_uuid_len = data[4] as usize;
        let data_uuid_len = data[5] as usize;
        let index_end = BigEndian::read_u64(&data[6..14]);
        let pending_index_end = BigEndian::read_u64(&data[14..22]);
        let data_end = BigEndian::read_u64(&data[22..30]);
        let pending_data_end = BigEndian::read_u64(&data[30..38]);
        let default_compression_header = data[38];
        let uuids_end = FIXED_HEADER_SIZE + index_uuid_len + data_uuid_len;
        if data.len() < uuids_end {
            return Err(corrupt("truncated revlog docket uuids"));
        }
        if index_end > pending_index_end || data_end > pending_data_end {
            return Err(corrupt("docket official end exceeds its pending end"));
        }
        let index_uuid = String::from_utf8(
            data[FIXED_HEADER_SIZE..FIXED_HEADER_SIZE + index_uuid_len].to_vec(),
        )
        .map_err(|_| corrupt("non-ascii docket uuid"))?;
        let data_uuid = String::from_utf8(
            data[FIXED_HEADER_SIZE + index_uuid_len..uuids_end].to_vec(),
        )
        .map_err(|_| corrupt("non-ascii docket uuid"))?;
        let (visible_index_end, visible_data_end) = if use_pending {
            (pending_index_end, pending_data_end)
        } else {
            (index_end, data_end)
        };
        Ok(Docket {
            version_header,
            read_only: use_pending,
            dirty: false,
            radix: radix.to_string(),
            path: format!("{}.i", radix),
            index_uuid: if index_uuid.is_empty() {
                None
            } else {
                Some(index_uuid)
            },
            data_uuid: if data_uuid.is_empty() {
                None
            } else {
                Some(data_uuid)
            },
            initial_index_end: index_end,
            pending_index_end,
            index_end: visible_index_end,
            initial_data_end: data_end,
            pending_data_end,
            data_end: visible_data_end,
            default_compression_header,
        })
    }

    pub fn version_header(&self) -> u32 {
        self.version_header
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn default_compression_header(&self) -> u8 {
        self.default_compression_header
    }

    /// Path of the current index file, allocating a uuid on first use.
    pub fn index_filepath(&mut self) -> String {
        let uuid = self.index_uuid.get_or_insert_with(make_uid);
        format!("{}-{}.idx", self.radix, uuid)
    }

    /// Path of the current data file, allocating a uuid on first use.
    pub fn data_filepath(&mut self) -> String {
        let uuid = self.data_uuid.get_or_insert_with(make_uid);
        format!("{}-{}.dat", self.radix, uuid)
    }

    /// The index path if a uuid was already allocated.
    pub fn existing_index_filepath(&self) -> Option<String> {
        self.index_uuid
            .as_ref()
            .map(|uuid| format!("{}-{}.idx", self.radix, uuid))
    }

    pub fn existing_data_filepath(&self) -> Option<String> {
        self.data_uuid
            .as_ref()
            .map(|uuid| format!("{}-{}.dat", self.radix, uuid))
    }

    pub fn index_end(&self) -> u64 {
        self.index_end
    }

    pub fn set_index_end(&mut self, end: u64) {
        if end != self.index_end {
            self.index_end = end;
            self.dirty = true;
        }
    }

    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    pub fn set_data_end(&mut self, end: u64) {
        if end != self.data_end {
            self.data_end = end;
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn serialize(&self, pending: bool) -> Result<Vec<u8>> {
        let (official_index_end, official_data_end) = if pending {
            (self.initial_index_end, self.initial_data_end)
        } else {
            (self.index_end, self.data_end)
        };
        if official_index_end > self.index_end || official_data_end > self.data_end {
            return Err(programming("docket official end exceeds its in-memory end"));
        }
        let index_uuid = self.index_uuid.as_deref().unwrap_or("");
        let data_uuid = self.data_uuid.as_deref().unwrap_or("");
        let mut out = vec![0u8; FIXED_HEADER_SIZE];
        BigEndian::write_u32(&mut out[0..4], self.version_header);
        out[4] = index_uuid.len() as u8;
        out[5] = data_uuid.len() as u8;
        BigEndian::write_u64(&mut out[6..14], official_index_end);
        BigEndian::write_u64(&mut out[14..22], self.index_end);
        BigEndian::write_u64(&mut out[22..30], official_data_end);
        BigEndian::write_u64(&mut out[30..38], self.data_end);
        out[38] = self.default_compression_header;
        out.extend_from_slice(index_uuid.as_bytes());
        out.extend_from_slice(data_uuid.as_bytes());
        Ok(out)
    }

    /// Write the docket if it changed.
    ///
    /// Registers an undo backup with the transaction (unless stripping,
    /// where the caller already backed the file up) and writes atomically.
    /// In pending mode the officially visible ends stay at their last
    /// committed values so readers outside this transaction keep the old
    /// valid range.
    pub fn write(
        &mut self,
        vfs: &dyn Vfs,
        tr: &mut Transaction,
        pending: bool,
        stripping: bool,
    ) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        if self.read_only {
            return Err(programming(format!(
                "writing read-only docket: {}",
                self.path
            )));
        }
        if !stripping {
            tr.add_backup(&self.path)?;
        }
        let data = self.serialize(pending)?;
        vfs.write_atomic(&self.path, &data)?;
        self.dirty = pending;
        if !pending {
            self.initial_index_end = self.index_end;
            self.initial_data_end = self.data_end;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vfs::MemVfs;

    use super::*;

    #[test]
    fn test_uid_shape() {
        let uid = make_uid();
        assert_eq!(uid.len(), 8);
        assert!(uid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_filepaths_are_stable() {
        let mut docket = Docket::new("00changelog", 2, b'x');
        let index = docket.index_filepath();
        assert_eq!(index, docket.index_filepath());
        assert!(index.starts_with("00changelog-"));
        assert!(index.ends_with(".idx"));
        assert!(docket.data_filepath().ends_with(".dat"));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut docket = Docket::new("00manifest", 2, b'x');
        docket.index_filepath();
        docket.data_filepath();
        docket.set_index_end(96 * 3);
        docket.set_data_end(1000);
        let bytes = docket.serialize(false).unwrap();
        let parsed = Docket::parse("00manifest", &bytes, false).unwrap();
        assert_eq!(parsed.version_header(), 2);
        assert_eq!(parsed.index_end(), 96 * 3);
        assert_eq!(parsed.data_end(), 1000);
        assert_eq!(parsed.default_compression_header(), b'x');
        assert_eq!(
            parsed.existing_index_filepath(),
            docket.existing_index_filepath()
        );
    }

    #[test]
    fn test_pending_serialization_hides_tail() {
        let mut docket = Docket::new("00changelog", 2, b'x');
        docket.index_filepath();
        docket.data_filepath();
        docket.set_index_end(96);
        docket.set_data_end(10);
        let bytes = docket.serialize(true).unwrap();
        // Outside readers see the old official range.
        let official = Docket::parse("00changelog", &bytes, false).unwrap();
        assert_eq!(official.index_end(), 0);
        assert_eq!(official.data_end(), 0);
        // A pending-aware reader sees the tail.
        let pending = Docket::parse("00changelog", &bytes, true).unwrap();
        assert_eq!(pending.index_end(), 96);
        assert_eq!(pending.data_end(), 10);
    }

    #[test]
    fn test_pending_docket_is_read_only() {
        let mut docket = Docket::new("00changelog", 2, b'x');
        docket.index_filepath();
        docket.set_index_end(96);
        let bytes = docket.serialize(true).unwrap();
        let mut pending = Docket::parse("00changelog", &bytes, true).unwrap();
        pending.set_index_end(192);
        let vfs: Arc<dyn Vfs> = Arc::new(MemVfs::new());
        let mut tr = Transaction::new(vfs.clone(), "test");
        assert!(pending.write(&vfs, &mut tr, false, false).is_err());
        tr.commit().unwrap();
    }

    #[test]
    fn test_write_clean_is_noop() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemVfs::new());
        let mut docket = Docket::new("00changelog", 2, b'x');
        docket.index_filepath();
        let mut tr = Transaction::new(vfs.clone(), "test");
        assert!(docket.write(&vfs, &mut tr, false, false).unwrap());
        assert!(!docket.write(&vfs, &mut tr, false, false).unwrap());
        tr.commit().unwrap();
        assert!(vfs.exists("00changelog.i"));
    }

    #[test]
    fn test_write_backs_up_for_abort() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemVfs::new());
        let mut docket = Docket::new("00changelog", 2, b'x');
        docket.index_filepath();
        {
            let mut tr = Transaction::new(vfs.clone(), "setup");
            docket.write(&vfs, &mut tr, false, false).unwrap();
            tr.commit().unwrap();
        }
        let committed = vfs.read("00changelog.i").unwrap();
        {
            let mut tr = Transaction::new(vfs.clone(), "aborted");
            docket.set_index_end(96);
            docket.write(&vfs, &mut tr, false, false).unwrap();
            tr.abort().unwrap();
        }
        assert_eq!(vfs.read("00changelog.i").unwrap(), committed);
    }
}
