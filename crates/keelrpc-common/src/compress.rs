//! Body compression applied after serialization.

use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::decompress_to_vec_with_limit;
use std::sync::Arc;

use crate::extension::ExtensionLoader;
use crate::protocol::{CompressionKind, Result, RpcError};

/// Default DEFLATE level (0-10, 6 is the zlib default).
const COMPRESSION_LEVEL: u8 = 6;

/// Upper bound on an inflated body. Stops a small frame from expanding
/// without limit.
pub const MAX_DECOMPRESSED_LEN: usize = 64 * 1024 * 1024;

pub trait Compressor: Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

pub struct DeflateCompressor {
    level: u8,
}

impl DeflateCompressor {
    pub fn new(level: u8) -> Self {
        DeflateCompressor { level: level.min(10) }
    }
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self::new(COMPRESSION_LEVEL)
    }
}

impl Compressor for DeflateCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(compress_to_vec(bytes, self.level))
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        decompress_to_vec_with_limit(bytes, MAX_DECOMPRESSED_LEN)
            .map_err(|e| RpcError::Serialization(format!("DEFLATE error: {:?}", e.status)))
    }
}

/// Loader holding the built-in compressors, keyed by [`CompressionKind::name`].
pub fn builtin_compressors() -> ExtensionLoader<dyn Compressor> {
    ExtensionLoader::<dyn Compressor>::new("compressor")
        .register(CompressionKind::None.name(), || {
            Ok(Arc::new(NoopCompressor) as Arc<dyn Compressor>)
        })
        .register(CompressionKind::Deflate.name(), || {
            Ok(Arc::new(DeflateCompressor::default()) as Arc<dyn Compressor>)
        })
}
