//! Checksum and hash fingerprinting.
//!
//! Given bytes and an expected checksum value, the fingerprinter tries a fixed list of algorithms
//! and reports the first one that reproduces the value. Results are accumulated per structural
//! element type in a [`ChecksumRegistry`].

use crate::config::ChecksumSettings;
use crate::span::Span;
use flate2::read::DeflateDecoder;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChecksumAlgorithm {
    Crc32,
    Adler32,
    Crc16,
    Crc16CcittFalse,
    Sum8,
    Sum16Be,
    Sum16Le,
    Sum32Be,
    Sum32Le,
    Sum64Be,
    Sum64Le,
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Order in which algorithms are tried; the first match wins.
    pub const PRIORITY: [ChecksumAlgorithm; 16] = [
        ChecksumAlgorithm::Crc32,
        ChecksumAlgorithm::Adler32,
        ChecksumAlgorithm::Crc16,
        ChecksumAlgorithm::Crc16CcittFalse,
        ChecksumAlgorithm::Sum8,
        ChecksumAlgorithm::Sum16Be,
        ChecksumAlgorithm::Sum16Le,
        ChecksumAlgorithm::Sum32Be,
        ChecksumAlgorithm::Sum32Le,
        ChecksumAlgorithm::Sum64Be,
        ChecksumAlgorithm::Sum64Le,
        ChecksumAlgorithm::Md5,
        ChecksumAlgorithm::Sha1,
        ChecksumAlgorithm::Sha256,
        ChecksumAlgorithm::Sha384,
        ChecksumAlgorithm::Sha512,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "CRC-32",
            ChecksumAlgorithm::Adler32 => "Adler-32",
            ChecksumAlgorithm::Crc16 => "CRC-16",
            ChecksumAlgorithm::Crc16CcittFalse => "CRC-16/CCITT-FALSE",
            ChecksumAlgorithm::Sum8 => "SUM-8",
            ChecksumAlgorithm::Sum16Be => "SUM-16/BE",
            ChecksumAlgorithm::Sum16Le => "SUM-16/LE",
            ChecksumAlgorithm::Sum32Be => "SUM-32/BE",
            ChecksumAlgorithm::Sum32Le => "SUM-32/LE",
            ChecksumAlgorithm::Sum64Be => "SUM-64/BE",
            ChecksumAlgorithm::Sum64Le => "SUM-64/LE",
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Sha1 => "SHA-1",
            ChecksumAlgorithm::Sha256 => "SHA-256",
            ChecksumAlgorithm::Sha384 => "SHA-384",
            ChecksumAlgorithm::Sha512 => "SHA-512",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::PRIORITY.into_iter().find(|a| a.name() == name)
    }

    /// Width in bytes of the value this algorithm produces.
    pub fn output_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sum8 => 1,
            ChecksumAlgorithm::Crc16
            | ChecksumAlgorithm::Crc16CcittFalse
            | ChecksumAlgorithm::Sum16Be
            | ChecksumAlgorithm::Sum16Le => 2,
            ChecksumAlgorithm::Crc32
            | ChecksumAlgorithm::Adler32
            | ChecksumAlgorithm::Sum32Be
            | ChecksumAlgorithm::Sum32Le => 4,
            ChecksumAlgorithm::Sum64Be | ChecksumAlgorithm::Sum64Le => 8,
            ChecksumAlgorithm::Md5 => 16,
            ChecksumAlgorithm::Sha1 => 20,
            ChecksumAlgorithm::Sha256 => 32,
            ChecksumAlgorithm::Sha384 => 48,
            ChecksumAlgorithm::Sha512 => 64,
        }
    }

    /// Checksum of `data` as it would appear in a file (CRCs and Adler big-endian).
    pub fn compute(&self, data: &[u8]) -> Vec<u8> {
        let sum = || {
            data.iter()
                .fold(0u64, |acc, &b| acc.wrapping_add(u64::from(b)))
        };
        match self {
            ChecksumAlgorithm::Crc32 => crc32(data).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Adler32 => adler32(data).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Crc16 => crc16_arc(data).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Crc16CcittFalse => crc16_ccitt_false(data).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Sum8 => vec![sum() as u8],
            ChecksumAlgorithm::Sum16Be => (sum() as u16).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Sum16Le => (sum() as u16).to_le_bytes().to_vec(),
            ChecksumAlgorithm::Sum32Be => (sum() as u32).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Sum32Le => (sum() as u32).to_le_bytes().to_vec(),
            ChecksumAlgorithm::Sum64Be => sum().to_be_bytes().to_vec(),
            ChecksumAlgorithm::Sum64Le => sum().to_le_bytes().to_vec(),
            ChecksumAlgorithm::Md5 => md5::compute(data).0.to_vec(),
            ChecksumAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            ChecksumAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            ChecksumAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            ChecksumAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_crc16_arc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_crc32_table();
static CRC16_ARC_TABLE: [u16; 256] = build_crc16_arc_table();

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    !crc
}

pub fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65_521;
    let (mut a, mut b) = (1u32, 0u32);
    // 5552 is the largest run that cannot overflow `b` before reduction.
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}

/// Reflected CRC-16 with polynomial 0xA001 (CRC-16/ARC).
pub fn crc16_arc(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        let idx = ((crc ^ u16::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC16_ARC_TABLE[idx];
    }
    crc
}

/// CRC-16/CCITT-FALSE: polynomial 0x1021, init 0xFFFF, no reflection.
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// First algorithm in [`ChecksumAlgorithm::PRIORITY`] whose output over `data` equals `expected`.
///
/// Algorithms whose output width differs from `expected.len()` are not attempted.
pub fn fingerprint(data: &[u8], expected: &[u8]) -> Option<ChecksumAlgorithm> {
    ChecksumAlgorithm::PRIORITY
        .into_iter()
        .filter(|algorithm| algorithm.output_len() == expected.len())
        .find(|algorithm| algorithm.compute(data) == expected)
}

/// Canonical name of a ZIP-style compression method id.
pub fn compression_method_name(id: u32) -> String {
    match id {
        0 => "stored".to_string(),
        1 => "shrunk".to_string(),
        6 => "imploded".to_string(),
        8 => "deflate".to_string(),
        9 => "deflate64".to_string(),
        12 => "bzip2".to_string(),
        14 => "lzma".to_string(),
        93 => "zstd".to_string(),
        95 => "xz".to_string(),
        98 => "ppmd".to_string(),
        other => format!("unknown-{other}"),
    }
}

/// Reconstructs an uncompressed payload of at most `limit` bytes. `Ok(None)` means the method is
/// unsupported.
///
/// # Errors
/// Corrupt compressed data, or output that would exceed `limit`.
pub fn decompress(method_id: u32, payload: &[u8], limit: u64) -> std::io::Result<Option<Vec<u8>>> {
    let out = match method_id {
        0 => payload.to_vec(),
        8 => {
            let mut out = Vec::new();
            DeflateDecoder::new(payload)
                .take(limit.saturating_add(1))
                .read_to_end(&mut out)?;
            out
        }
        _ => return Ok(None),
    };
    if out.len() as u64 > limit {
        return Err(std::io::Error::other(format!(
            "decompressed payload exceeds {limit} bytes"
        )));
    }
    Ok(Some(out))
}

/// Detected algorithms, merged across every file seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRegistry {
    #[serde(default)]
    pub by_type: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub compression_methods: BTreeMap<u32, String>,
}

impl ChecksumRegistry {
    pub fn record(&mut self, element_type: &str, algorithm: &str) {
        self.by_type
            .entry(element_type.to_string())
            .or_default()
            .insert(algorithm.to_string());
    }

    pub fn record_compression(&mut self, id: u32) -> &str {
        self.compression_methods
            .entry(id)
            .or_insert_with(|| compression_method_name(id))
    }

    pub fn union(&mut self, other: ChecksumRegistry) {
        for (element_type, algorithms) in other.by_type {
            self.by_type
                .entry(element_type)
                .or_default()
                .extend(algorithms);
        }
        for (id, name) in other.compression_methods {
            self.compression_methods.entry(id).or_insert(name);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.compression_methods.is_empty()
    }
}

/// Routes checksum-carrying fields of one file through the fingerprinter.
pub struct ChecksumFingerprinter<'a> {
    settings: &'a ChecksumSettings,
    delimiter: char,
}

impl<'a> ChecksumFingerprinter<'a> {
    pub fn new(settings: &'a ChecksumSettings, delimiter: char) -> Self {
        Self {
            settings,
            delimiter,
        }
    }

    /// Fingerprints every checksum field of `data` once per element type and records the
    /// results. Returns the number of element types resolved.
    pub fn learn_file(
        &self,
        data: &[u8],
        raw: &[Span],
        structural: &[Span],
        registry: &mut ChecksumRegistry,
    ) -> usize {
        let mut seen_types: HashSet<String> = HashSet::new();
        for checksum_span in raw
            .iter()
            .filter(|s| self.settings.is_checksum_field(s.canonical_name(self.delimiter)))
        {
            let Some(expected) = checksum_span.slice(data) else {
                continue;
            };
            let Some(element) = structural.iter().find(|e| e.contains(checksum_span)) else {
                continue;
            };
            let members: Vec<&Span> = raw
                .iter()
                .filter(|s| element.contains(s) && *s != checksum_span)
                .collect();
            let element_type = self.element_type(data, element, &members);
            if seen_types.contains(&element_type) {
                continue;
            }

            let compression = members.iter().find(|s| {
                self.settings
                    .is_compression_field(s.canonical_name(self.delimiter))
            });
            let algorithm = match compression {
                Some(method_span) => {
                    self.resolve_compressed(data, method_span, &members, expected, registry)
                }
                None => self.resolve_plain(data, element, checksum_span, &members, expected),
            };

            seen_types.insert(element_type.clone());
            match algorithm {
                Some(name) => {
                    tracing::debug!("Element type '{element_type}' checksum matches {name}");
                    registry.record(&element_type, &name);
                }
                None => {
                    tracing::debug!("No algorithm reproduces the '{element_type}' checksum");
                }
            }
        }
        seen_types.len()
    }

    fn element_type(&self, data: &[u8], element: &Span, members: &[&Span]) -> String {
        let type_bytes = members
            .iter()
            .find(|s| self.settings.is_type_field(s.canonical_name(self.delimiter)))
            .and_then(|s| s.slice(data));
        match type_bytes {
            Some(bytes) if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') => {
                String::from_utf8_lossy(bytes).trim().to_string()
            }
            Some(bytes) => hex::encode(bytes),
            None => element.canonical_name(self.delimiter).to_string(),
        }
    }

    fn resolve_plain(
        &self,
        data: &[u8],
        element: &Span,
        checksum: &Span,
        members: &[&Span],
        expected: &[u8],
    ) -> Option<String> {
        let mut starts: BTreeSet<usize> = members
            .iter()
            .filter(|s| s.end < checksum.start)
            .map(|s| s.start)
            .collect();
        if element.start < checksum.start {
            starts.insert(element.start);
        }
        let ends: BTreeSet<usize> = members
            .iter()
            .filter(|s| s.start > checksum.end)
            .map(|s| s.end)
            .collect();

        let before = starts
            .into_iter()
            .filter_map(|s| data.get(s..checksum.start));
        let after = ends
            .into_iter()
            .rev()
            .filter_map(|e| data.get(checksum.end + 1..=e));
        before
            .chain(after)
            .filter(|range| !range.is_empty())
            .find_map(|range| fingerprint(range, expected))
            .map(|a| a.name().to_string())
    }

    fn resolve_compressed(
        &self,
        data: &[u8],
        method_span: &Span,
        members: &[&Span],
        expected: &[u8],
        registry: &mut ChecksumRegistry,
    ) -> Option<String> {
        let method_id = method_span
            .slice(data)
            .map(|bytes| {
                bytes
                    .iter()
                    .take(4)
                    .rev()
                    .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
            })
            .unwrap_or(0);
        let method_name = registry.record_compression(method_id).to_string();
        let mandated = &self.settings.mandated_algorithm;

        if !self.settings.decompress {
            tracing::info!(
                "Decompression disabled, asserting {mandated} for '{method_name}' payload"
            );
            return Some(mandated.clone());
        }
        let payload = members
            .iter()
            .find(|s| self.settings.is_payload_field(s.canonical_name(self.delimiter)))
            .and_then(|s| s.slice(data));
        let Some(payload) = payload else {
            tracing::info!("No payload span for '{method_name}' record, asserting {mandated}");
            return Some(mandated.clone());
        };

        let plain = match decompress(method_id, payload, self.settings.max_decompressed_bytes) {
            Ok(Some(plain)) => plain,
            Ok(None) => {
                tracing::info!("Compression '{method_name}' unsupported, asserting {mandated}");
                return Some(mandated.clone());
            }
            Err(e) => {
                tracing::info!("Decompressing '{method_name}' payload failed ({e}), asserting {mandated}");
                return Some(mandated.clone());
            }
        };
        let reversed: Vec<u8> = expected.iter().rev().copied().collect();
        match fingerprint(&plain, expected).or_else(|| fingerprint(&plain, &reversed)) {
            Some(algorithm) => Some(algorithm.name().to_string()),
            None => {
                tracing::info!(
                    "Decompressed '{method_name}' payload inconclusive, asserting {mandated}"
                );
                Some(mandated.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use proptest::prelude::*;
    use std::io::Write;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn reference_check_values() {
        assert_eq!(crc32(CHECK), 0xCBF4_3926);
        assert_eq!(adler32(CHECK), 0x091E_01DE);
        assert_eq!(crc16_arc(CHECK), 0xBB3D);
        assert_eq!(crc16_ccitt_false(CHECK), 0x29B1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn crc32_field_is_recognised_first() {
        let data = b"IEND";
        let expected = crc32(data).to_be_bytes();
        assert_eq!(fingerprint(data, &expected), Some(ChecksumAlgorithm::Crc32));
    }

    #[test]
    fn width_filters_candidate_algorithms() {
        let data = b"hello";
        let sum = data.iter().map(|&b| u32::from(b)).sum::<u32>();
        assert_eq!(
            fingerprint(data, &[sum as u8]),
            Some(ChecksumAlgorithm::Sum8)
        );
        assert_eq!(
            fingerprint(data, &(sum as u16).to_le_bytes()),
            Some(ChecksumAlgorithm::Sum16Le)
        );
        assert_eq!(fingerprint(data, &[0u8; 3]), None);
    }

    #[test]
    fn digests_match_by_length() {
        let data = b"abc";
        assert_eq!(
            fingerprint(data, &md5::compute(data).0),
            Some(ChecksumAlgorithm::Md5)
        );
        assert_eq!(
            fingerprint(data, &Sha256::digest(data)),
            Some(ChecksumAlgorithm::Sha256)
        );
        assert_eq!(
            fingerprint(data, &Sha1::digest(data)),
            Some(ChecksumAlgorithm::Sha1)
        );
    }

    #[test]
    fn algorithm_names_round_trip() {
        for algorithm in ChecksumAlgorithm::PRIORITY {
            assert_eq!(ChecksumAlgorithm::from_name(algorithm.name()), Some(algorithm));
            assert_eq!(algorithm.compute(b"x").len(), algorithm.output_len());
        }
    }

    #[test]
    fn registry_union_merges_sets() {
        let mut a = ChecksumRegistry::default();
        a.record("IHDR", "CRC-32");
        a.record_compression(8);
        let mut b = ChecksumRegistry::default();
        b.record("IHDR", "Adler-32");
        b.record("IDAT", "CRC-32");
        b.record_compression(0);
        a.union(b);
        assert_eq!(a.by_type["IHDR"].len(), 2);
        assert!(a.by_type.contains_key("IDAT"));
        assert_eq!(a.compression_methods[&0], "stored");
        assert_eq!(a.compression_methods[&8], "deflate");
        assert_eq!(compression_method_name(77), "unknown-77");
    }

    fn png_like_file() -> (Vec<u8>, Vec<Span>, Vec<Span>) {
        let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        let body = [b'I', b'H', b'D', b'R', 0, 0, 0, 1, 0, 0, 0, 1, 8];
        data.extend_from_slice(&9u32.to_be_bytes());
        data.extend_from_slice(&body);
        data.extend_from_slice(&crc32(&body).to_be_bytes());
        let raw = vec![
            Span::new(0, 7, "file~sig~btPngSignature"),
            Span::new(8, 28, "file~chunk"),
            Span::new(8, 11, "file~chunk~length"),
            Span::new(12, 15, "file~chunk~type~cname"),
            Span::new(16, 19, "file~chunk~ihdr~width"),
            Span::new(20, 23, "file~chunk~ihdr~height"),
            Span::new(24, 24, "file~chunk~ihdr~bits"),
            Span::new(25, 28, "file~chunk~crc"),
        ];
        let structural = vec![raw[0].clone(), raw[1].clone()];
        (data, raw, structural)
    }

    #[test]
    fn chunk_crc_is_learned_under_its_type_tag() {
        let (data, raw, structural) = png_like_file();
        let settings = ChecksumSettings::default();
        let mut registry = ChecksumRegistry::default();
        let resolved = ChecksumFingerprinter::new(&settings, '~').learn_file(
            &data,
            &raw,
            &structural,
            &mut registry,
        );
        assert_eq!(resolved, 1);
        assert_eq!(
            registry.by_type["IHDR"],
            BTreeSet::from(["CRC-32".to_string()])
        );
    }

    fn zip_like_file(method: u16, decompressed: &[u8]) -> (Vec<u8>, Vec<Span>, Vec<Span>) {
        let payload = match method {
            8 => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(decompressed).unwrap();
                encoder.finish().unwrap()
            }
            _ => decompressed.to_vec(),
        };
        let mut data = b"PK\x03\x04".to_vec();
        data.extend_from_slice(&method.to_le_bytes());
        data.extend_from_slice(&crc32(decompressed).to_le_bytes());
        let payload_start = data.len();
        data.extend_from_slice(&payload);
        let end = data.len() - 1;
        let raw = vec![
            Span::new(0, end, "file~record"),
            Span::new(0, 3, "file~record~frSignature"),
            Span::new(4, 5, "file~record~frCompression"),
            Span::new(6, 9, "file~record~frCrc"),
            Span::new(payload_start, end, "file~record~frData"),
        ];
        let structural = vec![raw[0].clone()];
        (data, raw, structural)
    }

    #[test]
    fn deflated_payload_is_fingerprinted_after_decompression() {
        let (data, raw, structural) = zip_like_file(8, b"the quick brown fox jumps");
        let settings = ChecksumSettings::default();
        let mut registry = ChecksumRegistry::default();
        ChecksumFingerprinter::new(&settings, '~').learn_file(&data, &raw, &structural, &mut registry);
        assert_eq!(registry.by_type["record"], BTreeSet::from(["CRC-32".to_string()]));
        assert_eq!(registry.compression_methods[&8], "deflate");
    }

    #[test]
    fn decompression_output_is_bounded() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&vec![0u8; 1 << 20]).unwrap();
        let bomb = encoder.finish().unwrap();
        assert!(bomb.len() < 4096, "Zeros compress well");

        let err = decompress(8, &bomb, 1024).unwrap_err();
        assert!(err.to_string().contains("exceeds 1024 bytes"), "Unexpected error: {err}");
        assert_eq!(decompress(8, &bomb, 1 << 20).unwrap().map(|p| p.len()), Some(1 << 20));
        assert!(decompress(0, b"stored", 3).is_err());
    }

    #[test]
    fn oversized_payload_falls_back_to_mandated_algorithm() {
        let (data, raw, structural) = zip_like_file(8, &[0u8; 4096]);
        let settings = ChecksumSettings {
            mandated_algorithm: "Adler-32".into(),
            max_decompressed_bytes: 100,
            ..ChecksumSettings::default()
        };
        let mut registry = ChecksumRegistry::default();
        ChecksumFingerprinter::new(&settings, '~').learn_file(&data, &raw, &structural, &mut registry);
        assert_eq!(registry.by_type["record"], BTreeSet::from(["Adler-32".to_string()]));
    }

    #[test]
    fn unsupported_method_falls_back_to_mandated_algorithm() {
        let (data, raw, structural) = zip_like_file(14, b"lzma bytes that are not lzma");
        let settings = ChecksumSettings {
            mandated_algorithm: "CRC-32".into(),
            ..ChecksumSettings::default()
        };
        let mut registry = ChecksumRegistry::default();
        ChecksumFingerprinter::new(&settings, '~').learn_file(&data, &raw, &structural, &mut registry);
        assert!(registry.by_type["record"].contains("CRC-32"));
        assert_eq!(registry.compression_methods[&14], "lzma");
    }

    #[test]
    fn disabled_decompression_asserts_mandated_algorithm() {
        let (data, raw, structural) = zip_like_file(0, b"stored");
        let settings = ChecksumSettings {
            decompress: false,
            mandated_algorithm: "Adler-32".into(),
            ..ChecksumSettings::default()
        };
        let mut registry = ChecksumRegistry::default();
        ChecksumFingerprinter::new(&settings, '~').learn_file(&data, &raw, &structural, &mut registry);
        assert_eq!(registry.by_type["record"], BTreeSet::from(["Adler-32".to_string()]));
    }

    proptest! {
        #[test]
        fn fingerprinting_is_deterministic(
            data in prop::collection::vec(any::<u8>(), 0..64),
            expected in prop::collection::vec(any::<u8>(), 1..9),
        ) {
            let first = fingerprint(&data, &expected);
            let second = fingerprint(&data, &expected);
            prop_assert_eq!(first, second);
            if let Some(algorithm) = first {
                prop_assert_eq!(algorithm.compute(&data), expected);
            }
        }
    }
}
