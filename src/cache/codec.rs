//! Envelope codec: pluggable serialization plus optional zlib compression.
//!
//! The format is fixed per cache instance. Compressed payloads always start
//! with [`COMPRESSED_MAGIC`], so a reader decodes them correctly even when
//! its own compression settings differ from the writer's.

use crate::cache::entry::Envelope;
use crate::config::{Config, SerializerKind};
use crate::error::{CacheError, Result};

/// Prefix marking a zlib-compressed payload.
///
/// Cannot open an uncompressed payload: JSON starts with `{`, MessagePack
/// with a map/array marker, and bincode with the key length whose upper
/// bytes are zero for keys of at most 255 bytes.
pub const COMPRESSED_MAGIC: &[u8; 4] = b"FCZ\x01";

// == Envelope Format Trait ==
/// One serialization format for envelopes.
pub trait EnvelopeFormat: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// bincode, the compact in-process binary format.
#[derive(Debug, Default)]
pub struct NativeFormat;

impl EnvelopeFormat for NativeFormat {
    fn name(&self) -> &'static str {
        "native"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        bincode::serialize(envelope).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct JsonFormat;

impl EnvelopeFormat for JsonFormat {
    fn name(&self) -> &'static str {
        "json"
    }

    /// JSON has no NaN or infinity; serde_json would write them as `null`.
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if !envelope.value.is_finite() {
            return Err(CacheError::Serialization(format!(
                "value under '{}' holds a non-finite float, which JSON cannot represent",
                envelope.key
            )));
        }
        serde_json::to_vec(envelope).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

#[cfg(feature = "msgpack")]
#[derive(Debug, Default)]
pub struct MsgpackFormat;

#[cfg(feature = "msgpack")]
impl EnvelopeFormat for MsgpackFormat {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(envelope).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// Builds the format for `kind`, failing when its support is compiled out.
pub fn format_for(kind: SerializerKind) -> Result<Box<dyn EnvelopeFormat>> {
    match kind {
        SerializerKind::Native => Ok(Box::new(NativeFormat)),
        SerializerKind::Json => Ok(Box::new(JsonFormat)),
        #[cfg(feature = "msgpack")]
        SerializerKind::Msgpack => Ok(Box::new(MsgpackFormat)),
        #[cfg(not(feature = "msgpack"))]
        SerializerKind::Msgpack => Err(CacheError::Configuration(
            "msgpack serializer requested but the `msgpack` feature is disabled".to_string(),
        )),
    }
}

/// Whether the `compression` feature is compiled in.
pub fn compression_available() -> bool {
    cfg!(feature = "compression")
}

// == Codec ==
/// Envelope <-> bytes, with size-thresholded compression on write.
pub struct Codec {
    format: Box<dyn EnvelopeFormat>,
    /// `(level, threshold)` when compression is enabled
    compression: Option<(u32, usize)>,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("format", &self.format.name())
            .field("compression", &self.compression)
            .finish()
    }
}

impl Codec {
    /// Selects and validates the configured format and compressor.
    pub fn from_config(config: &Config) -> Result<Self> {
        let format = format_for(config.serializer)?;
        if config.compression && !compression_available() {
            return Err(CacheError::Configuration(
                "compression requested but the `compression` feature is disabled".to_string(),
            ));
        }
        Ok(Self {
            format,
            compression: config
                .compression
                .then_some((config.compression_level, config.compression_threshold)),
        })
    }

    pub fn format_name(&self) -> &'static str {
        self.format.name()
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression.is_some()
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let bytes = self.format.encode(envelope)?;
        match self.compression {
            Some((level, threshold)) if bytes.len() >= threshold => compress(&bytes, level),
            _ => Ok(bytes),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        if bytes.is_empty() {
            return Err(CacheError::Serialization("empty payload".to_string()));
        }
        match bytes.strip_prefix(COMPRESSED_MAGIC.as_slice()) {
            Some(body) => self.format.decode(&decompress(body)?),
            None => self.format.decode(bytes),
        }
    }
}

#[cfg(feature = "compression")]
fn compress(bytes: &[u8], level: u32) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(COMPRESSED_MAGIC.to_vec(), Compression::new(level));
    encoder
        .write_all(bytes)
        .map_err(|e| CacheError::Serialization(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| CacheError::Serialization(format!("compression failed: {}", e)))
}

#[cfg(not(feature = "compression"))]
fn compress(_bytes: &[u8], _level: u32) -> Result<Vec<u8>> {
    Err(CacheError::Configuration(
        "compression support is not compiled in".to_string(),
    ))
}

#[cfg(feature = "compression")]
fn decompress(body: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let mut out = Vec::new();
    ZlibDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|e| CacheError::Serialization(format!("decompression failed: {}", e)))?;
    Ok(out)
}

#[cfg(not(feature = "compression"))]
fn decompress(_body: &[u8]) -> Result<Vec<u8>> {
    Err(CacheError::Serialization(
        "payload is compressed but compression support is not compiled in".to_string(),
    ))
}
