//! # Message compression
//!
//! Compression codecs carried in the attribute byte of magic-1 frames.
//!
//! - **None** (0): payload travels as-is
//! - **GZIP** (1): payload is an RFC 1952 member wrapping a deflate stream
//! - **Snappy** (2): reserved by the protocol, not implemented by this client
//!
//! The gzip reader is strict: every optional header field announced by the
//! flag byte is consumed, the header CRC is checked when present, and the
//! footer's CRC32 and ISIZE must match the inflated bytes.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::{Compression as Level, GzBuilder};

use crate::error::KafkaClientError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_HEADER_LEN: usize = 10;
const GZIP_FOOTER_LEN: usize = 8;
const GZIP_METHOD_DEFLATE: u8 = 8;
const GZIP_OS_UNIX: u8 = 3;

const FTEXT: u8 = 0x01;
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = !(FTEXT | FHCRC | FEXTRA | FNAME | FCOMMENT);

/// Compression codecs as defined in the message attribute byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    Snappy = 2,
}

impl Compression {
    pub fn is_compressed(self) -> bool {
        self != Compression::None
    }
}

impl TryFrom<u8> for Compression {
    type Error = KafkaClientError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Snappy),
            _ => Err(KafkaClientError::UnsupportedCompression { codec: value }),
        }
    }
}

impl From<Compression> for u8 {
    fn from(compression: Compression) -> Self {
        compression as u8
    }
}

/// Compress `data` into a single gzip member with a zeroed mtime.
pub fn gzip(data: &[u8]) -> Result<Bytes, KafkaClientError> {
    let mut encoder = GzBuilder::new()
        .operating_system(GZIP_OS_UNIX)
        .write(Vec::with_capacity(data.len() + 32), Level::default());
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Inflate a gzip member, validating header fields and footer.
pub fn gunzip(data: &[u8]) -> Result<Bytes, KafkaClientError> {
    if data.len() < GZIP_HEADER_LEN + GZIP_FOOTER_LEN {
        return Err(KafkaClientError::invalid_gzip(format!(
            "{} bytes is too short for a gzip member",
            data.len()
        )));
    }
    if data[0..2] != GZIP_MAGIC {
        return Err(KafkaClientError::invalid_gzip("Not GZIP format"));
    }
    let method = data[2];
    let flags = data[3];
    if flags & FRESERVED != 0 {
        return Err(KafkaClientError::invalid_gzip("Invalid GZIP header"));
    }
    if method != GZIP_METHOD_DEFLATE {
        return Err(KafkaClientError::invalid_gzip(format!(
            "GZip method unsupported: {}",
            method
        )));
    }

    let body_end = data.len() - GZIP_FOOTER_LEN;
    let mut pos = GZIP_HEADER_LEN;

    if flags & FEXTRA != 0 {
        let len_bytes = header_field(data, pos, 2, body_end)?;
        let extra_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
        header_field(data, pos + 2, extra_len, body_end)?;
        pos += 2 + extra_len;
    }
    if flags & FNAME != 0 {
        pos = skip_zero_terminated(data, pos, body_end)?;
    }
    if flags & FCOMMENT != 0 {
        pos = skip_zero_terminated(data, pos, body_end)?;
    }
    if flags & FHCRC != 0 {
        let crc_bytes = header_field(data, pos, 2, body_end)?;
        let stored = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let actual = (crc32fast::hash(&data[..pos]) & 0xffff) as u16;
        if stored != actual {
            return Err(KafkaClientError::invalid_gzip("Invalid GZIP header crc"));
        }
        pos += 2;
    }

    let mut inflated = Vec::new();
    DeflateDecoder::new(&data[pos..body_end])
        .read_to_end(&mut inflated)
        .map_err(|e| KafkaClientError::invalid_gzip(format!("Deflate stream: {}", e)))?;

    let footer = &data[body_end..];
    let data_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let data_size = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]);
    if data_size != inflated.len() as u32 || data_crc != crc32fast::hash(&inflated) {
        return Err(KafkaClientError::invalid_gzip(
            "Invalid size or crc of the gzip uncompressed data",
        ));
    }

    Ok(Bytes::from(inflated))
}

fn header_field(data: &[u8], pos: usize, len: usize, limit: usize) -> Result<&[u8], KafkaClientError> {
    match pos.checked_add(len) {
        Some(end) if end <= limit => Ok(&data[pos..end]),
        _ => Err(KafkaClientError::invalid_gzip("Truncated GZIP header")),
    }
}

fn skip_zero_terminated(data: &[u8], pos: usize, limit: usize) -> Result<usize, KafkaClientError> {
    data[pos.min(limit)..limit]
        .iter()
        .position(|&b| b == 0)
        .map(|idx| pos + idx + 1)
        .ok_or_else(|| KafkaClientError::invalid_gzip("Unterminated GZIP header string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_byte_mapping() {
        assert_eq!(Compression::try_from(0).unwrap(), Compression::None);
        assert_eq!(Compression::try_from(1).unwrap(), Compression::Gzip);
        assert_eq!(Compression::try_from(2).unwrap(), Compression::Snappy);
        assert!(matches!(
            Compression::try_from(7),
            Err(KafkaClientError::UnsupportedCompression { codec: 7 })
        ));
        assert_eq!(u8::from(Compression::Gzip), 1);
    }

    #[test]
    fn test_gzip_header_layout() {
        let member = gzip(b"Hello!").unwrap();
        assert_eq!(&member[..4], &[0x1f, 0x8b, 0x08, 0x00]);
        assert_eq!(&member[4..8], &[0, 0, 0, 0]);
        assert_eq!(member[9], GZIP_OS_UNIX);
        assert_eq!(&member[member.len() - 4..], &6u32.to_le_bytes());
    }

    #[test]
    fn test_gunzip_round_trip() {
        let payload = b"Hello World! A".repeat(20);
        let member = gzip(&payload).unwrap();
        assert_eq!(&gunzip(&member).unwrap()[..], &payload[..]);
    }

    #[test]
    fn test_gunzip_optional_header_fields() {
        let member = gzip(b"payload").unwrap();
        let deflate = &member[GZIP_HEADER_LEN..member.len() - GZIP_FOOTER_LEN];
        let footer = &member[member.len() - GZIP_FOOTER_LEN..];

        let mut header = vec![0x1f, 0x8b, 0x08, FTEXT | FEXTRA | FNAME | FCOMMENT | FHCRC];
        header.extend_from_slice(&[0, 0, 0, 0, 0, 3]);
        header.extend_from_slice(&3u16.to_le_bytes());
        header.extend_from_slice(b"abc");
        header.extend_from_slice(b"name.txt\0");
        header.extend_from_slice(b"a comment\0");
        let hcrc = (crc32fast::hash(&header) & 0xffff) as u16;
        header.extend_from_slice(&hcrc.to_le_bytes());

        let mut full = header.clone();
        full.extend_from_slice(deflate);
        full.extend_from_slice(footer);
        assert_eq!(&gunzip(&full).unwrap()[..], b"payload");

        let hcrc_pos = header.len() - 2;
        full[hcrc_pos] ^= 0xff;
        assert!(matches!(
            gunzip(&full),
            Err(KafkaClientError::InvalidGzipFormat { .. })
        ));
    }

    #[test]
    fn test_gunzip_rejects_bad_input() {
        assert!(gunzip(b"short").is_err());

        let mut member = gzip(b"payload").unwrap().to_vec();
        member[0] = 0x00;
        assert!(gunzip(&member).is_err());

        let mut member = gzip(b"payload").unwrap().to_vec();
        let len = member.len();
        member[len - 1] ^= 0x01;
        let err = gunzip(&member).unwrap_err();
        assert!(err.to_string().contains("Invalid size or crc"));

        let mut member = gzip(b"payload").unwrap().to_vec();
        member[3] = 0x80;
        assert!(gunzip(&member).is_err());
    }
}
