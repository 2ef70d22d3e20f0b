/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Compression engines and the self-describing chunk format.
//!
//! A stored chunk selects its engine by its first byte: `\0` means the raw
//! text itself starts with a NUL and is stored as is, `u` prefixes an
//! uncompressed literal, `x` is the first byte of a zlib stream and `0x28`
//! the first byte of a zstd frame. Unknown leading bytes fall back to zlib,
//! a legacy of the v1 format. The engine table is process-wide and
//! immutable after startup.

use std::io::Read;
use std::io::Write;

use once_cell::sync::Lazy;

use crate::errors::corrupt;
use crate::errors::programming;
use crate::errors::Result;

pub trait CompressionEngine: Send + Sync {
    /// Short name used by configuration and the upgrade engine.
    fn name(&self) -> &'static str;

    /// First byte of the streams this engine produces; stored in the v2
    /// docket as the default compression header.
    fn header_byte(&self) -> u8;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

struct ZlibEngine;

impl CompressionEngine for ZlibEngine {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn header_byte(&self) -> u8 {
        b'x'
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .and_then(|()| encoder.finish())
            .map_err(|err| corrupt(format!("zlib compression failed: {}", err)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|err| corrupt(format!("zlib decompression failed: {}", err)))?;
        Ok(out)
    }
}

struct ZstdEngine;

impl CompressionEngine for ZstdEngine {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn header_byte(&self) -> u8 {
        0x28
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(data, 3)
            .map_err(|err| corrupt(format!("zstd compression failed: {}", err)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(data)
            .map_err(|err| corrupt(format!("zstd decompression failed: {}", err)))
    }
}

struct NoneEngine;

impl CompressionEngine for NoneEngine {
    fn name(&self) -> &'static str {
        "none"
    }

    fn header_byte(&self) -> u8 {
        0
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

static ENGINES: Lazy<Vec<&'static dyn CompressionEngine>> =
    Lazy::new(|| vec![&ZlibEngine, &ZstdEngine, &NoneEngine]);

pub fn engine_by_name(name: &str) -> Result<&'static dyn CompressionEngine> {
    ENGINES
        .iter()
        .copied()
        .find(|engine| engine.name() == name)
        .ok_or_else(|| programming(format!("unknown compression engine: {}", name)))
}

pub fn engine_by_header(byte: u8) -> Option<&'static dyn CompressionEngine> {
    ENGINES
        .iter()
        .copied()
        .find(|engine| engine.header_byte() == byte)
}

/// Store `data` in the self-describing chunk form: the engine's output when
/// it actually saves space, a literal otherwise.
pub fn pack_chunk(engine: &dyn CompressionEngine, data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let compressed = engine.compress(data)?;
    if compressed.len() < data.len() {
        return Ok(compressed);
    }
    if data[0] == 0 {
        // Raw data starting with NUL is stored unmarked; no engine stream
        // starts with a NUL byte.
        return Ok(data.to_vec());
    }
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(b'u');
    out.extend_from_slice(data);
    Ok(out)
}

/// Decode a self-describing chunk.
pub fn unpack_chunk(data: &[u8]) -> Result<Vec<u8>> {
    match data.first() {
        None => Ok(Vec::new()),
        Some(0) => Ok(data.to_vec()),
        Some(b'u') => Ok(data[1..].to_vec()),
        Some(&byte) => {
            if let Some(engine) = engine_by_header(byte) {
                return engine.decompress(data);
            }
            // Legacy fallback: v1 readers treated every unknown marker as
            // zlib.
            ZlibEngine
                .decompress(data)
                .map_err(|_| corrupt(format!("unknown compression header: {:#x}", byte)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zlib_roundtrip_is_marked() {
        let engine = engine_by_name("zlib").unwrap();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let chunk = pack_chunk(engine, &data).unwrap();
        assert!(chunk.len() < data.len());
        assert_eq!(chunk[0], b'x');
        assert_eq!(unpack_chunk(&chunk).unwrap(), data);
    }

    #[test]
    fn test_zstd_roundtrip_is_marked() {
        let engine = engine_by_name("zstd").unwrap();
        let data = b"incompressible? not when repeated. ".repeat(20);
        let chunk = pack_chunk(engine, &data).unwrap();
        assert_eq!(chunk[0], 0x28);
        assert_eq!(unpack_chunk(&chunk).unwrap(), data);
    }

    #[test]
    fn test_incompressible_stored_literal() {
        let engine = engine_by_name("zlib").unwrap();
        let data = b"abc";
        let chunk = pack_chunk(engine, data).unwrap();
        assert_eq!(chunk, b"uabc");
        assert_eq!(unpack_chunk(&chunk).unwrap(), data);
    }

    #[test]
    fn test_nul_leading_data_stored_raw() {
        let engine = engine_by_name("zlib").unwrap();
        let data = b"\0binary";
        let chunk = pack_chunk(engine, data).unwrap();
        assert_eq!(chunk, data);
        assert_eq!(unpack_chunk(&chunk).unwrap(), data);
    }

    #[test]
    fn test_empty_chunk() {
        let engine = engine_by_name("zlib").unwrap();
        assert!(pack_chunk(engine, b"").unwrap().is_empty());
        assert!(unpack_chunk(b"").unwrap().is_empty());
    }

    #[test]
    fn test_none_engine_always_literal() {
        let engine = engine_by_name("none").unwrap();
        let chunk = pack_chunk(engine, b"plain").unwrap();
        assert_eq!(chunk, b"uplain");
    }

    #[test]
    fn test_unknown_header_falls_back_to_zlib() {
        assert!(unpack_chunk(b"Zgarbage").is_err());
    }

    #[test]
    fn test_unknown_engine_name() {
        assert!(engine_by_name("lz77").is_err());
    }
}
