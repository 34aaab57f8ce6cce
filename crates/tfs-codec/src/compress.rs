//! zstd compression with a plain fallback.
//!
//! Envelope: one algorithm byte followed by the (possibly compressed) data.

use crate::{Codec, CodecError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    Plain = 0,
    Zstd = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Plain),
            1 => Ok(Self::Zstd),
            other => Err(CodecError::UnknownCompression(other)),
        }
    }
}

/// Compresses payloads unless that does not make them smaller.
#[derive(Debug, Clone)]
pub struct CompressingCodec {
    pub level: i32,
}

impl Default for CompressingCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for CompressingCodec {
    fn encode(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        let compressed = zstd::stream::encode_all(data, self.level)?;
        let (kind, body) = if compressed.len() < data.len() {
            (CompressionType::Zstd, compressed.as_slice())
        } else {
            (CompressionType::Plain, data)
        };
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(kind as u8);
        out.extend_from_slice(body);
        Ok(out)
    }

    fn decode(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        let (&kind, body) = data
            .split_first()
            .ok_or_else(|| CodecError::Malformed("empty compressed envelope".into()))?;
        match CompressionType::try_from(kind)? {
            CompressionType::Plain => Ok(body.to_vec()),
            CompressionType::Zstd => Ok(zstd::stream::decode_all(body)?),
        }
    }
}
