/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Per-revision flag bits and their processors.
//!
//! A flag processor is a `(read, write, raw)` triple invoked when a
//! revision carries the matching bit: `read` turns stored rawtext into user
//! text, `write` the other way around, `raw` only reports whether the
//! stored rawtext can be used for hash checks. The set of known flags is
//! fixed; unknown bits are rejected at read time.

use std::collections::HashMap;
use std::sync::Arc;

use types::Revision;

use crate::errors::corrupt;
use crate::errors::programming;
use crate::errors::Result;
use crate::errors::RevlogError;

/// The revision is censored: its content must not be disclosed.
pub const REVIDX_ISCENSORED: u16 = 1 << 15;
/// The revision ellides part of the graph (shallow-clone support).
pub const REVIDX_ELLIPSIS: u16 = 1 << 14;
/// The raw content lives in an external store.
pub const REVIDX_EXTSTORED: u16 = 1 << 13;
/// The revision has an out-of-band sidedata blob.
pub const REVIDX_SIDEDATA: u16 = 1 << 12;
/// Copy metadata is present in the sidedata.
pub const REVIDX_HASCOPIESINFO: u16 = 1 << 11;

pub const REVIDX_KNOWN_FLAGS: u16 = REVIDX_ISCENSORED
    | REVIDX_ELLIPSIS
    | REVIDX_EXTSTORED
    | REVIDX_SIDEDATA
    | REVIDX_HASCOPIESINFO;

/// Flags whose processors may rewrite the stored rawtext.
pub const REVIDX_RAWTEXT_CHANGING_FLAGS: u16 = REVIDX_ISCENSORED | REVIDX_EXTSTORED;

/// Layout flags handled by the revlog itself rather than a text transform.
const STRUCTURAL_FLAGS: u16 = REVIDX_SIDEDATA | REVIDX_HASCOPIESINFO;

/// Processing order for writes; reads run it in reverse.
const FLAGS_ORDER: [u16; 3] = [REVIDX_ISCENSORED, REVIDX_ELLIPSIS, REVIDX_EXTSTORED];

pub trait FlagProcessor: Send + Sync {
    /// Stored rawtext → user text, and whether the result may be used for
    /// hash verification.
    fn read(&self, rev: Revision, rawtext: &[u8]) -> Result<(Vec<u8>, bool)>;

    /// User text → stored rawtext, and whether the rawtext is authoritative
    /// for hashing.
    fn write(&self, rev: Revision, text: &[u8]) -> Result<(Vec<u8>, bool)>;

    /// Whether the stored rawtext can be used for hash verification.
    fn raw(&self, rev: Revision, rawtext: &[u8]) -> Result<bool>;
}

/// Refuses disclosure of censored content.
pub struct CensorProcessor;

impl FlagProcessor for CensorProcessor {
    fn read(&self, rev: Revision, _rawtext: &[u8]) -> Result<(Vec<u8>, bool)> {
        Err(RevlogError::Censored(rev))
    }

    fn write(&self, _rev: Revision, text: &[u8]) -> Result<(Vec<u8>, bool)> {
        Ok((text.to_vec(), false))
    }

    fn raw(&self, _rev: Revision, _rawtext: &[u8]) -> Result<bool> {
        Ok(false)
    }
}

/// Ellipsis revisions store their text verbatim but their hash covers the
/// unellided graph, so hash checks are skipped.
pub struct EllipsisProcessor;

impl FlagProcessor for EllipsisProcessor {
    fn read(&self, _rev: Revision, rawtext: &[u8]) -> Result<(Vec<u8>, bool)> {
        Ok((rawtext.to_vec(), false))
    }

    fn write(&self, _rev: Revision, text: &[u8]) -> Result<(Vec<u8>, bool)> {
        Ok((text.to_vec(), false))
    }

    fn raw(&self, _rev: Revision, _rawtext: &[u8]) -> Result<bool> {
        Ok(false)
    }
}

/// The per-revlog processor table.
pub struct FlagRegistry {
    processors: HashMap<u16, Arc<dyn FlagProcessor>>,
}

impl FlagRegistry {
    /// The default set: censorship enforcement and ellipsis pass-through.
    /// External-store handling is registered by the embedder that provides
    /// the store.
    pub fn standard() -> Self {
        let mut processors: HashMap<u16, Arc<dyn FlagProcessor>> = HashMap::new();
        processors.insert(REVIDX_ISCENSORED, Arc::new(CensorProcessor));
        processors.insert(REVIDX_ELLIPSIS, Arc::new(EllipsisProcessor));
        FlagRegistry { processors }
    }

    /// Register a processor for a single known flag. Registering twice, or
    /// for an unknown flag, is a bug.
    pub fn register(&mut self, flag: u16, processor: Arc<dyn FlagProcessor>) -> Result<()> {
        if flag & REVIDX_KNOWN_FLAGS == 0 || !FLAGS_ORDER.contains(&flag) {
            return Err(programming(format!(
                "cannot register processor on unknown flag {:#06x}",
                flag
            )));
        }
        if self.processors.contains_key(&flag) {
            return Err(programming(format!(
                "cannot register multiple processors on flag {:#06x}",
                flag
            )));
        }
        self.processors.insert(flag, processor);
        Ok(())
    }

    fn processor(&self, flag: u16) -> Result<&Arc<dyn FlagProcessor>> {
        self.processors.get(&flag).ok_or_else(|| {
            corrupt(format!("processor for flag {:#06x} not registered", flag))
        })
    }

    fn check_known(rev: Revision, flags: u16) -> Result<()> {
        if flags & !REVIDX_KNOWN_FLAGS != 0 {
            return Err(corrupt(format!(
                "revision {} has incompatible flags {:#06x}",
                rev,
                flags & !REVIDX_KNOWN_FLAGS
            )));
        }
        Ok(())
    }

    /// Run read-side processors. Returns the user text and whether it may
    /// be used to verify the stored hash.
    pub fn process_read(
        &self,
        rev: Revision,
        rawtext: Vec<u8>,
        flags: u16,
    ) -> Result<(Vec<u8>, bool)> {
        Self::check_known(rev, flags)?;
        let mut text = rawtext;
        let mut validate = true;
        for flag in FLAGS_ORDER.iter().rev() {
            if flags & flag != 0 {
                let (processed, ok) = self.processor(*flag)?.read(rev, &text)?;
                text = processed;
                validate &= ok;
            }
        }
        Ok((text, validate))
    }

    /// Run write-side processors. Returns the rawtext to store and whether
    /// that rawtext is the authoritative hash input.
    pub fn process_write(
        &self,
        rev: Revision,
        text: Vec<u8>,
        flags: u16,
    ) -> Result<(Vec<u8>, bool)> {
        Self::check_known(rev, flags)?;
        let mut rawtext = text;
        let mut rawtext_hash = true;
        let mut any = false;
        for flag in FLAGS_ORDER.iter() {
            if flags & flag != 0 {
                let (processed, ok) = self.processor(*flag)?.write(rev, &rawtext)?;
                rawtext = processed;
                rawtext_hash &= ok;
                any = true;
            }
        }
        Ok((rawtext, any && rawtext_hash))
    }

    /// Whether the stored rawtext of a flagged revision can be used for
    /// hash verification without transformation.
    pub fn process_raw(&self, rev: Revision, rawtext: &[u8], flags: u16) -> Result<bool> {
        Self::check_known(rev, flags)?;
        let mut valid = true;
        for flag in FLAGS_ORDER.iter() {
            if flags & flag != 0 {
                valid &= self.processor(*flag)?.raw(rev, rawtext)?;
            }
        }
        Ok(valid)
    }

    /// Flags that require a transform on this registry (as opposed to the
    /// structural bits the revlog handles itself).
    pub fn transforming_flags(flags: u16) -> u16 {
        flags & !STRUCTURAL_FLAGS & REVIDX_KNOWN_FLAGS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_flags_rejected() {
        let registry = FlagRegistry::standard();
        let err = registry.process_read(0, b"text".to_vec(), 1 << 3).unwrap_err();
        assert!(matches!(err, RevlogError::Corrupt(_)));
    }

    #[test]
    fn test_censored_read_refused() {
        let registry = FlagRegistry::standard();
        let err = registry
            .process_read(4, b"tombstone".to_vec(), REVIDX_ISCENSORED)
            .unwrap_err();
        assert!(matches!(err, RevlogError::Censored(4)));
    }

    #[test]
    fn test_ellipsis_read_skips_hash() {
        let registry = FlagRegistry::standard();
        let (text, validate) = registry
            .process_read(1, b"text".to_vec(), REVIDX_ELLIPSIS)
            .unwrap();
        assert_eq!(text, b"text");
        assert!(!validate);
    }

    #[test]
    fn test_plain_read_validates_hash() {
        let registry = FlagRegistry::standard();
        let (text, validate) = registry.process_read(1, b"text".to_vec(), 0).unwrap();
        assert_eq!(text, b"text");
        assert!(validate);
    }

    #[test]
    fn test_structural_flags_need_no_processor() {
        let registry = FlagRegistry::standard();
        let (text, validate) = registry
            .process_read(1, b"text".to_vec(), REVIDX_SIDEDATA | REVIDX_HASCOPIESINFO)
            .unwrap();
        assert_eq!(text, b"text");
        assert!(validate);
    }

    #[test]
    fn test_missing_processor_is_an_error() {
        let registry = FlagRegistry::standard();
        assert!(registry
            .process_read(1, b"text".to_vec(), REVIDX_EXTSTORED)
            .is_err());
    }

    #[test]
    fn test_double_registration_rejected() {
        let mut registry = FlagRegistry::standard();
        assert!(registry
            .register(REVIDX_ISCENSORED, Arc::new(CensorProcessor))
            .is_err());
        assert!(registry
            .register(REVIDX_EXTSTORED, Arc::new(EllipsisProcessor))
            .is_ok());
    }

    #[test]
    fn test_register_unknown_flag_rejected() {
        let mut registry = FlagRegistry::standard();
        assert!(registry.register(1 << 2, Arc::new(CensorProcessor)).is_err());
    }
}
